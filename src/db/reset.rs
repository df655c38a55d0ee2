//! Tree reset
//!
//! Wipes mutable progression state back to the baseline in one transaction.
//! The root node's unlock survives because the DELETE predicate excludes it.

use std::collections::BTreeMap;

use diesel::prelude::*;
use tracing::info;

use super::diesel_schema::{
    progression_nodes, progression_resets, progression_unlock_progress, progression_unlocks,
    progression_user_votes, progression_voting, progression_voting_options,
    progression_voting_sessions, user_progression,
};
use super::engagement;
use super::models::{current_timestamp, NewProgressionReset, ProgressionReset};
use crate::error::ProgressionError;

/// Rows removed by a reset
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ResetSummary {
    pub unlocks_cleared: usize,
    pub sessions_cleared: usize,
    pub progress_cleared: usize,
    pub user_progressions_cleared: usize,
}

/// Reset the tree, keeping the unlock of `root_node_key`.
///
/// Order follows the foreign keys: vote markers, progress, sessions,
/// options, unlocks, legacy ballots, then (optionally) per-user progression.
pub fn reset_tree(
    conn: &mut SqliteConnection,
    reset_by: &str,
    reason: &str,
    preserve_user_data: bool,
    root_node_key: &str,
    weights: &BTreeMap<String, f64>,
) -> Result<ResetSummary, ProgressionError> {
    conn.transaction(|conn| {
        let unlock_count: i64 = progression_unlocks::table
            .count()
            .get_result(conn)
            .map_err(|e| ProgressionError::Internal(format!("Failed to count unlocks: {}", e)))?;

        let score = engagement::get_engagement_score(conn, None, weights)?;
        let now = current_timestamp();

        diesel::insert_into(progression_resets::table)
            .values(&NewProgressionReset {
                reset_by,
                reason,
                nodes_reset_count: unlock_count as i32,
                engagement_score_at_reset: score.round() as i32,
                reset_at: &now,
            })
            .execute(conn)
            .map_err(|e| ProgressionError::Internal(format!("Failed to record reset: {}", e)))?;

        diesel::delete(progression_user_votes::table)
            .execute(conn)
            .map_err(|e| ProgressionError::Internal(format!("Failed to clear user votes: {}", e)))?;

        let progress_cleared = diesel::delete(progression_unlock_progress::table)
            .execute(conn)
            .map_err(|e| ProgressionError::Internal(format!("Failed to clear unlock progress: {}", e)))?;

        let sessions_cleared = diesel::delete(progression_voting_sessions::table)
            .execute(conn)
            .map_err(|e| ProgressionError::Internal(format!("Failed to clear voting sessions: {}", e)))?;

        diesel::delete(progression_voting_options::table)
            .execute(conn)
            .map_err(|e| ProgressionError::Internal(format!("Failed to clear voting options: {}", e)))?;

        let root_ids = progression_nodes::table
            .filter(progression_nodes::node_key.eq(root_node_key))
            .select(progression_nodes::id);
        let unlocks_cleared = diesel::delete(
            progression_unlocks::table.filter(progression_unlocks::node_id.ne_all(root_ids)),
        )
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("Failed to clear unlocks: {}", e)))?;

        diesel::delete(progression_voting::table)
            .execute(conn)
            .map_err(|e| ProgressionError::Internal(format!("Failed to clear voting: {}", e)))?;

        let user_progressions_cleared = if preserve_user_data {
            0
        } else {
            diesel::delete(user_progression::table)
                .execute(conn)
                .map_err(|e| ProgressionError::Internal(format!("Failed to clear user progression: {}", e)))?
        };

        info!(
            reset_by,
            reason,
            unlocks_cleared,
            sessions_cleared,
            preserve_user_data,
            "Progression tree reset"
        );

        Ok(ResetSummary {
            unlocks_cleared,
            sessions_cleared,
            progress_cleared,
            user_progressions_cleared,
        })
    })
}

/// Reset audit rows, newest first
pub fn get_resets(conn: &mut SqliteConnection) -> Result<Vec<ProgressionReset>, ProgressionError> {
    progression_resets::table
        .order(progression_resets::id.desc())
        .load(conn)
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_engagement_weights;
    use crate::db::nodes::{self, tests::node_input};
    use crate::db::{progress, test_db, user_progression as user_prog, voting};

    #[test]
    fn test_reset_clears_everything_but_root() {
        let (_dir, db) = test_db();
        let mut conn = db.conn().unwrap();
        let weights = default_engagement_weights();

        let root = nodes::insert_node(&mut conn, &node_input("progression_system", 0)).unwrap();
        let other = nodes::insert_node(&mut conn, &node_input("feature_buy", 1)).unwrap();
        nodes::unlock_node(&mut conn, root.id, 1, "auto", 0).unwrap();
        nodes::unlock_node(&mut conn, other.id, 1, "vote", 0).unwrap();

        let session = voting::create_voting_session(&mut conn, "2099-01-01T00:00:00.000000Z").unwrap();
        let option = voting::add_voting_option(&mut conn, session.id, other.id, 1).unwrap();
        voting::check_and_record_vote_atomic(&mut conn, "alice", session.id, option.id, other.id).unwrap();
        let active = progress::create_unlock_progress(&mut conn).unwrap();
        progress::set_unlock_target(&mut conn, active.id, other.id, 1, Some(session.id)).unwrap();
        engagement::record_engagement(&mut conn, "alice", "command", 5, None).unwrap();
        user_prog::unlock_user_progression(&mut conn, "alice", "recipe", "sword", None).unwrap();

        let summary =
            reset_tree(&mut conn, "admin", "season end", false, "progression_system", &weights).unwrap();
        assert_eq!(summary.unlocks_cleared, 1);
        assert_eq!(summary.sessions_cleared, 1);
        assert_eq!(summary.user_progressions_cleared, 1);

        assert!(nodes::is_node_unlocked(&mut conn, "progression_system", 1).unwrap());
        assert!(!nodes::is_node_unlocked(&mut conn, "feature_buy", 1).unwrap());
        assert!(voting::get_most_recent_session(&mut conn).unwrap().is_none());
        assert!(progress::get_active_unlock_progress(&mut conn).unwrap().is_none());
        assert!(!user_prog::is_user_progression_unlocked(&mut conn, "alice", "recipe", "sword").unwrap());

        let audit = get_resets(&mut conn).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].nodes_reset_count, 2);
        assert_eq!(audit[0].engagement_score_at_reset, 10);

        // Engagement history is not part of the reset
        assert!(engagement::get_engagement_score(&mut conn, None, &weights).unwrap() > 0.0);
    }

    #[test]
    fn test_reset_can_preserve_user_data() {
        let (_dir, db) = test_db();
        let mut conn = db.conn().unwrap();
        user_prog::unlock_user_progression(&mut conn, "bob", "recipe", "shield", None).unwrap();

        let summary = reset_tree(
            &mut conn,
            "admin",
            "soft reset",
            true,
            "progression_system",
            &default_engagement_weights(),
        )
        .unwrap();
        assert_eq!(summary.user_progressions_cleared, 0);
        assert!(user_prog::is_user_progression_unlocked(&mut conn, "bob", "recipe", "shield").unwrap());
    }
}
