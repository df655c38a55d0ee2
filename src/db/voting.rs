//! Voting sessions, options and per-user vote markers
//!
//! Session lifecycle: `voting` -> `frozen` <-> `voting` -> `completed`.
//! At most one session is open (`voting` or `frozen`) at a time; the
//! repository checks it and a unique index on the open marker backs it up.

use std::collections::HashMap;

use diesel::dsl::max;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use tracing::{debug, info};

use super::diesel_schema::{
    progression_nodes, progression_user_votes, progression_voting_options,
    progression_voting_sessions as sessions,
};
use super::models::{
    current_timestamp, session_status, NewUserVote, NewVotingOption, NewVotingSession,
    ProgressionNode, SessionOption, VotingOption, VotingSession, VotingSessionRow,
};
use super::nodes;
use crate::error::ProgressionError;

// ============================================================================
// Session Reads
// ============================================================================

fn load_options(
    conn: &mut SqliteConnection,
    session_id: i32,
) -> Result<Vec<SessionOption>, ProgressionError> {
    let options: Vec<VotingOption> = progression_voting_options::table
        .filter(progression_voting_options::session_id.eq(session_id))
        .order(progression_voting_options::id.asc())
        .load(conn)
        .map_err(|e| ProgressionError::Internal(format!("Options query failed: {}", e)))?;

    let node_ids: Vec<i32> = options.iter().map(|o| o.node_id).collect();
    let node_map: HashMap<i32, ProgressionNode> = progression_nodes::table
        .filter(progression_nodes::id.eq_any(node_ids))
        .load::<ProgressionNode>(conn)
        .map_err(|e| ProgressionError::Internal(format!("Node query failed: {}", e)))?
        .into_iter()
        .map(|n| (n.id, n))
        .collect();

    options
        .into_iter()
        .map(|option| {
            let node = node_map.get(&option.node_id).cloned().ok_or_else(|| {
                ProgressionError::NodeNotFound(format!("id {} (option {})", option.node_id, option.id))
            })?;
            Ok(SessionOption { option, node })
        })
        .collect()
}

fn with_options(
    conn: &mut SqliteConnection,
    row: Option<VotingSessionRow>,
) -> Result<Option<VotingSession>, ProgressionError> {
    match row {
        Some(session) => {
            let options = load_options(conn, session.id)?;
            Ok(Some(VotingSession { session, options }))
        }
        None => Ok(None),
    }
}

fn get_session_row(
    conn: &mut SqliteConnection,
    session_id: i32,
) -> Result<Option<VotingSessionRow>, ProgressionError> {
    sessions::table
        .find(session_id)
        .first(conn)
        .optional()
        .map_err(|e| ProgressionError::Internal(format!("Session query failed: {}", e)))
}

fn require_session_row(
    conn: &mut SqliteConnection,
    session_id: i32,
) -> Result<VotingSessionRow, ProgressionError> {
    get_session_row(conn, session_id)?
        .ok_or_else(|| ProgressionError::NotFound(format!("voting session {}", session_id)))
}

pub fn get_session_by_id(
    conn: &mut SqliteConnection,
    session_id: i32,
) -> Result<Option<VotingSession>, ProgressionError> {
    let row = get_session_row(conn, session_id)?;
    with_options(conn, row)
}

/// Session currently accepting votes
pub fn get_active_session(
    conn: &mut SqliteConnection,
) -> Result<Option<VotingSession>, ProgressionError> {
    let row = sessions::table
        .filter(sessions::status.eq(session_status::VOTING))
        .order(sessions::id.desc())
        .first(conn)
        .optional()
        .map_err(|e| ProgressionError::Internal(format!("Session query failed: {}", e)))?;
    with_options(conn, row)
}

/// Session that is open, whether accepting votes or frozen
pub fn get_active_or_frozen_session(
    conn: &mut SqliteConnection,
) -> Result<Option<VotingSession>, ProgressionError> {
    let row = sessions::table
        .filter(sessions::status.eq_any(session_status::OPEN))
        .order(sessions::id.desc())
        .first(conn)
        .optional()
        .map_err(|e| ProgressionError::Internal(format!("Session query failed: {}", e)))?;
    with_options(conn, row)
}

pub fn get_most_recent_session(
    conn: &mut SqliteConnection,
) -> Result<Option<VotingSession>, ProgressionError> {
    let row = sessions::table
        .order(sessions::id.desc())
        .first(conn)
        .optional()
        .map_err(|e| ProgressionError::Internal(format!("Session query failed: {}", e)))?;
    with_options(conn, row)
}

// ============================================================================
// Session Writes
// ============================================================================

/// Open a new session in `voting`.
///
/// Fails with `SessionAlreadyActive` while another session is open.
pub fn create_voting_session(
    conn: &mut SqliteConnection,
    voting_deadline: &str,
) -> Result<VotingSessionRow, ProgressionError> {
    if let Some(open) = get_active_or_frozen_session(conn)? {
        return Err(ProgressionError::SessionAlreadyActive(open.id()));
    }

    let now = current_timestamp();
    let inserted = diesel::insert_into(sessions::table)
        .values(&NewVotingSession {
            status: session_status::VOTING,
            started_at: &now,
            voting_deadline,
            ended_at: None,
        })
        .execute(conn);

    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            let open_id = get_active_or_frozen_session(conn)?.map(|s| s.id()).unwrap_or_default();
            return Err(ProgressionError::SessionAlreadyActive(open_id));
        }
        Err(e) => {
            return Err(ProgressionError::Internal(format!("Session insert failed: {}", e)));
        }
    }

    let row = get_active_or_frozen_session(conn)?
        .map(|s| s.session)
        .ok_or_else(|| ProgressionError::Internal("Session missing after insert".into()))?;

    info!(session_id = row.id, deadline = voting_deadline, "Voting session started");
    Ok(row)
}

/// Record a decision that needed no ballot (single candidate or chosen target).
///
/// The session is born `completed` with one option that is also its winner,
/// so it never occupies the open-session slot.
pub fn create_placeholder_session(
    conn: &mut SqliteConnection,
    node_id: i32,
    target_level: i32,
) -> Result<(VotingSessionRow, VotingOption), ProgressionError> {
    let now = current_timestamp();

    conn.transaction(|conn| {
        diesel::insert_into(sessions::table)
            .values(&NewVotingSession {
                status: session_status::COMPLETED,
                started_at: &now,
                voting_deadline: &now,
                ended_at: Some(&now),
            })
            .execute(conn)
            .map_err(|e| ProgressionError::Internal(format!("Session insert failed: {}", e)))?;

        let session_id: i32 = sessions::table
            .select(max(sessions::id))
            .get_result::<Option<i32>>(conn)
            .map_err(|e| ProgressionError::Internal(format!("Session query failed: {}", e)))?
            .ok_or_else(|| ProgressionError::Internal("Session missing after insert".into()))?;

        let option = add_voting_option(conn, session_id, node_id, target_level)?;

        diesel::update(sessions::table.find(session_id))
            .set(sessions::winning_option_id.eq(Some(option.id)))
            .execute(conn)
            .map_err(|e| ProgressionError::Internal(format!("Session update failed: {}", e)))?;

        let row = require_session_row(conn, session_id)?;
        debug!(session_id, node_id, target_level, "Placeholder session recorded");
        Ok((row, option))
    })
}

/// Offer `(node, level)` in a session
pub fn add_voting_option(
    conn: &mut SqliteConnection,
    session_id: i32,
    node_id: i32,
    target_level: i32,
) -> Result<VotingOption, ProgressionError> {
    require_session_row(conn, session_id)?;
    let node = nodes::require_node(conn, node_id)?;
    if target_level < 1 || target_level > node.max_level {
        return Err(ProgressionError::MaxLevelExceeded {
            node_key: node.node_key,
            level: target_level,
            max_level: node.max_level,
        });
    }

    diesel::insert_into(progression_voting_options::table)
        .values(&NewVotingOption {
            session_id,
            node_id,
            target_level,
        })
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("Option insert failed: {}", e)))?;

    progression_voting_options::table
        .filter(progression_voting_options::session_id.eq(session_id))
        .filter(progression_voting_options::node_id.eq(node_id))
        .first(conn)
        .map_err(|e| ProgressionError::Internal(format!("Option fetch failed: {}", e)))
}

fn transition(
    conn: &mut SqliteConnection,
    session_id: i32,
    to: &str,
) -> Result<VotingSessionRow, ProgressionError> {
    let row = require_session_row(conn, session_id)?;
    if to == session_status::FROZEN && row.status == session_status::FROZEN {
        return Err(ProgressionError::SessionAlreadyFrozen(session_id));
    }
    if !session_status::can_transition(&row.status, to) {
        return Err(ProgressionError::InvalidTransition {
            session_id,
            from: row.status,
            to: to.to_string(),
        });
    }

    diesel::update(sessions::table.find(session_id).filter(sessions::status.eq(&row.status)))
        .set(sessions::status.eq(to))
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("Session update failed: {}", e)))?;

    info!(session_id, from = %row.status, to, "Voting session transition");
    Ok(row)
}

/// `voting` -> `frozen`
pub fn freeze_voting_session(
    conn: &mut SqliteConnection,
    session_id: i32,
) -> Result<(), ProgressionError> {
    transition(conn, session_id, session_status::FROZEN).map(|_| ())
}

/// `frozen` -> `voting`
pub fn resume_voting_session(
    conn: &mut SqliteConnection,
    session_id: i32,
) -> Result<(), ProgressionError> {
    transition(conn, session_id, session_status::VOTING).map(|_| ())
}

/// `voting`/`frozen` -> `completed`, recording the winner (if any)
pub fn end_voting_session(
    conn: &mut SqliteConnection,
    session_id: i32,
    winning_option_id: Option<i32>,
) -> Result<(), ProgressionError> {
    if let Some(option_id) = winning_option_id {
        let belongs: i64 = progression_voting_options::table
            .filter(progression_voting_options::id.eq(option_id))
            .filter(progression_voting_options::session_id.eq(session_id))
            .count()
            .get_result(conn)
            .map_err(|e| ProgressionError::Internal(format!("Option query failed: {}", e)))?;
        if belongs == 0 {
            return Err(ProgressionError::InvalidInput(format!(
                "option {} is not part of session {}",
                option_id, session_id
            )));
        }
    }

    transition(conn, session_id, session_status::COMPLETED)?;

    diesel::update(sessions::table.find(session_id))
        .set((
            sessions::ended_at.eq(Some(current_timestamp())),
            sessions::winning_option_id.eq(winning_option_id),
        ))
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("Session update failed: {}", e)))?;

    Ok(())
}

// ============================================================================
// Votes
// ============================================================================

/// Add one vote to an option; returns the new count.
///
/// `last_highest_vote_at` moves to now whenever the option ties or leads
/// every other option in its session.
pub fn increment_option_vote(
    conn: &mut SqliteConnection,
    option_id: i32,
) -> Result<i32, ProgressionError> {
    let option: VotingOption = progression_voting_options::table
        .find(option_id)
        .first(conn)
        .optional()
        .map_err(|e| ProgressionError::Internal(format!("Option query failed: {}", e)))?
        .ok_or_else(|| ProgressionError::NotFound(format!("voting option {}", option_id)))?;

    diesel::update(progression_voting_options::table.find(option_id))
        .set(progression_voting_options::vote_count.eq(progression_voting_options::vote_count + 1))
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("Vote increment failed: {}", e)))?;

    let new_count = option.vote_count + 1;

    let others_max: Option<i32> = progression_voting_options::table
        .filter(progression_voting_options::session_id.eq(option.session_id))
        .filter(progression_voting_options::id.ne(option_id))
        .select(max(progression_voting_options::vote_count))
        .get_result(conn)
        .map_err(|e| ProgressionError::Internal(format!("Option query failed: {}", e)))?;

    if new_count >= others_max.unwrap_or(0) {
        diesel::update(progression_voting_options::table.find(option_id))
            .set(progression_voting_options::last_highest_vote_at.eq(Some(current_timestamp())))
            .execute(conn)
            .map_err(|e| ProgressionError::Internal(format!("Option update failed: {}", e)))?;
    }

    Ok(new_count)
}

/// Users who voted in a session, in vote order
pub fn get_session_voters(
    conn: &mut SqliteConnection,
    session_id: i32,
) -> Result<Vec<String>, ProgressionError> {
    progression_user_votes::table
        .filter(progression_user_votes::session_id.eq(session_id))
        .order((
            progression_user_votes::voted_at.asc(),
            progression_user_votes::user_id.asc(),
        ))
        .select(progression_user_votes::user_id)
        .load(conn)
        .map_err(|e| ProgressionError::Internal(format!("Voter query failed: {}", e)))
}

/// Advisory check only; `check_and_record_vote_atomic` is authoritative
pub fn has_user_voted_in_session(
    conn: &mut SqliteConnection,
    user_id: &str,
    session_id: i32,
) -> Result<bool, ProgressionError> {
    let count: i64 = progression_user_votes::table
        .filter(progression_user_votes::user_id.eq(user_id))
        .filter(progression_user_votes::session_id.eq(session_id))
        .count()
        .get_result(conn)
        .map_err(|e| ProgressionError::Internal(format!("Vote query failed: {}", e)))?;
    Ok(count > 0)
}

/// Check-then-record a user's vote.
///
/// The check and the insert run under the write lock (see
/// `with_write_lock`), whether or not the caller opened a transaction. The
/// `(user_id, session_id)` primary key turns a racing duplicate into
/// `AlreadyVoted` as well.
pub fn check_and_record_vote_atomic(
    conn: &mut SqliteConnection,
    user_id: &str,
    session_id: i32,
    option_id: i32,
    node_id: i32,
) -> Result<i32, ProgressionError> {
    if user_id.trim().is_empty() {
        return Err(ProgressionError::InvalidInput("user_id is required".into()));
    }

    super::with_write_lock(conn, |conn| {
        let session = require_session_row(conn, session_id)?;
        if session.status != session_status::VOTING {
            return Err(ProgressionError::NoActiveSession);
        }

        let option: Option<VotingOption> = progression_voting_options::table
            .find(option_id)
            .first(conn)
            .optional()
            .map_err(|e| ProgressionError::Internal(format!("Option query failed: {}", e)))?;
        match option {
            Some(o) if o.session_id == session_id && o.node_id == node_id => {}
            _ => {
                return Err(ProgressionError::InvalidInput(format!(
                    "option {} (node {}) is not part of session {}",
                    option_id, node_id, session_id
                )));
            }
        }

        if has_user_voted_in_session(conn, user_id, session_id)? {
            return Err(ProgressionError::AlreadyVoted {
                user_id: user_id.to_string(),
                session_id,
            });
        }

        let now = current_timestamp();
        let marker = diesel::insert_into(progression_user_votes::table)
            .values(&NewUserVote {
                user_id,
                session_id,
                option_id,
                node_id,
                voted_at: &now,
            })
            .execute(conn);

        match marker {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(ProgressionError::AlreadyVoted {
                    user_id: user_id.to_string(),
                    session_id,
                });
            }
            Err(e) => {
                return Err(ProgressionError::Internal(format!("Vote insert failed: {}", e)));
            }
        }

        let count = increment_option_vote(conn, option_id)?;
        debug!(user_id, session_id, option_id, count, "Vote recorded");
        Ok(count)
    })
}

fn is_unique_violation(err: &DieselError) -> bool {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => true,
        DieselError::DatabaseError(_, info) => info.message().contains("UNIQUE constraint failed"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::nodes::tests::node_input;
    use crate::db::{test_db, OpContext};

    fn seed(conn: &mut SqliteConnection) -> (ProgressionNode, ProgressionNode) {
        let a = nodes::insert_node(conn, &node_input("feature_buy", 1)).unwrap();
        let b = nodes::insert_node(conn, &node_input("feature_sell", 1)).unwrap();
        (a, b)
    }

    #[test]
    fn test_session_lifecycle() {
        let (_dir, db) = test_db();
        let mut conn = db.conn().unwrap();
        let (a, b) = seed(&mut conn);

        let session = create_voting_session(&mut conn, "2099-01-01T00:00:00.000000Z").unwrap();
        assert_eq!(session.status, "voting");
        add_voting_option(&mut conn, session.id, a.id, 1).unwrap();
        add_voting_option(&mut conn, session.id, b.id, 1).unwrap();

        assert!(matches!(
            create_voting_session(&mut conn, "2099-01-01T00:00:00.000000Z"),
            Err(ProgressionError::SessionAlreadyActive(id)) if id == session.id
        ));

        freeze_voting_session(&mut conn, session.id).unwrap();
        assert!(get_active_session(&mut conn).unwrap().is_none());
        assert_eq!(get_active_or_frozen_session(&mut conn).unwrap().unwrap().id(), session.id);
        assert!(matches!(
            freeze_voting_session(&mut conn, session.id),
            Err(ProgressionError::SessionAlreadyFrozen(_))
        ));

        resume_voting_session(&mut conn, session.id).unwrap();
        assert!(matches!(
            resume_voting_session(&mut conn, session.id),
            Err(ProgressionError::InvalidTransition { .. })
        ));

        let loaded = get_session_by_id(&mut conn, session.id).unwrap().unwrap();
        let winner = loaded.options[1].option.id;
        end_voting_session(&mut conn, session.id, Some(winner)).unwrap();

        let ended = get_most_recent_session(&mut conn).unwrap().unwrap();
        assert_eq!(ended.status(), "completed");
        assert_eq!(ended.session.winning_option_id, Some(winner));
        assert!(ended.session.ended_at.is_some());
        assert!(get_active_or_frozen_session(&mut conn).unwrap().is_none());

        assert!(matches!(
            end_voting_session(&mut conn, session.id, None),
            Err(ProgressionError::InvalidTransition { .. })
        ));

        // A new session can open once the previous one completed
        create_voting_session(&mut conn, "2099-01-01T00:00:00.000000Z").unwrap();
    }

    #[test]
    fn test_vote_once_per_session() {
        let (_dir, db) = test_db();
        let ctx = OpContext::new();
        let mut conn = db.conn().unwrap();
        let (a, b) = seed(&mut conn);
        let session = create_voting_session(&mut conn, "2099-01-01T00:00:00.000000Z").unwrap();
        let opt_a = add_voting_option(&mut conn, session.id, a.id, 1).unwrap();
        let opt_b = add_voting_option(&mut conn, session.id, b.id, 1).unwrap();
        drop(conn);

        db.write(&ctx, "vote", |conn| {
            check_and_record_vote_atomic(conn, "alice", session.id, opt_a.id, a.id)
        })
        .unwrap();

        let again = db.write(&ctx, "vote", |conn| {
            check_and_record_vote_atomic(conn, "alice", session.id, opt_b.id, b.id)
        });
        assert!(matches!(again, Err(ProgressionError::AlreadyVoted { .. })));

        let mut conn = db.conn().unwrap();
        assert!(has_user_voted_in_session(&mut conn, "alice", session.id).unwrap());
        assert_eq!(get_session_voters(&mut conn, session.id).unwrap(), vec!["alice"]);

        let loaded = get_session_by_id(&mut conn, session.id).unwrap().unwrap();
        assert_eq!(loaded.total_votes(), 1);
        assert_eq!(loaded.option(opt_b.id).unwrap().option.vote_count, 0);

        // Mismatched node is rejected before any write
        assert!(matches!(
            check_and_record_vote_atomic(&mut conn, "bob", session.id, opt_a.id, b.id),
            Err(ProgressionError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_frozen_session_rejects_votes() {
        let (_dir, db) = test_db();
        let mut conn = db.conn().unwrap();
        let (a, _) = seed(&mut conn);
        let session = create_voting_session(&mut conn, "2099-01-01T00:00:00.000000Z").unwrap();
        let opt = add_voting_option(&mut conn, session.id, a.id, 1).unwrap();
        freeze_voting_session(&mut conn, session.id).unwrap();

        assert!(matches!(
            check_and_record_vote_atomic(&mut conn, "alice", session.id, opt.id, a.id),
            Err(ProgressionError::NoActiveSession)
        ));
    }

    #[test]
    fn test_last_highest_vote_tracks_leader() {
        let (_dir, db) = test_db();
        let mut conn = db.conn().unwrap();
        let (a, b) = seed(&mut conn);
        let session = create_voting_session(&mut conn, "2099-01-01T00:00:00.000000Z").unwrap();
        let opt_a = add_voting_option(&mut conn, session.id, a.id, 1).unwrap();
        let opt_b = add_voting_option(&mut conn, session.id, b.id, 1).unwrap();

        increment_option_vote(&mut conn, opt_a.id).unwrap();
        increment_option_vote(&mut conn, opt_a.id).unwrap();
        increment_option_vote(&mut conn, opt_b.id).unwrap();

        let loaded = get_session_by_id(&mut conn, session.id).unwrap().unwrap();
        let a_row = &loaded.option(opt_a.id).unwrap().option;
        let b_row = &loaded.option(opt_b.id).unwrap().option;
        assert_eq!(a_row.vote_count, 2);
        assert!(a_row.last_highest_vote_at.is_some());
        // b trailed when it received its vote
        assert!(b_row.last_highest_vote_at.is_none());

        increment_option_vote(&mut conn, opt_b.id).unwrap();
        let loaded = get_session_by_id(&mut conn, session.id).unwrap().unwrap();
        assert!(loaded.option(opt_b.id).unwrap().option.last_highest_vote_at.is_some());
    }

    #[test]
    fn test_placeholder_session_is_completed() {
        let (_dir, db) = test_db();
        let mut conn = db.conn().unwrap();
        let (a, _) = seed(&mut conn);

        let (row, option) = create_placeholder_session(&mut conn, a.id, 1).unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.winning_option_id, Some(option.id));

        // Does not block a real session
        create_voting_session(&mut conn, "2099-01-01T00:00:00.000000Z").unwrap();
    }
}
