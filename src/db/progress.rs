//! Unlock progress tracker
//!
//! One row per contribution cycle. The active cycle is the row without
//! `unlocked_at`; completing it links a successor through
//! `previous_progress_id`. No cost arithmetic happens here.

use diesel::prelude::*;
use tracing::{debug, info};

use super::diesel_schema::progression_unlock_progress as unlock_progress;
use super::models::{current_timestamp, NewUnlockProgress, UnlockProgress};
use crate::error::ProgressionError;

/// Start a fresh cycle with no target
pub fn create_unlock_progress(
    conn: &mut SqliteConnection,
) -> Result<UnlockProgress, ProgressionError> {
    insert_cycle(conn, 0, None)
}

fn insert_cycle(
    conn: &mut SqliteConnection,
    contributions: i32,
    previous_progress_id: Option<i32>,
) -> Result<UnlockProgress, ProgressionError> {
    let now = current_timestamp();
    diesel::insert_into(unlock_progress::table)
        .values(&NewUnlockProgress {
            contributions_accumulated: contributions,
            started_at: &now,
            previous_progress_id,
        })
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("Progress insert failed: {}", e)))?;

    get_active_unlock_progress(conn)?
        .ok_or_else(|| ProgressionError::Internal("Progress row missing after insert".into()))
}

/// The current cycle, if one is open
pub fn get_active_unlock_progress(
    conn: &mut SqliteConnection,
) -> Result<Option<UnlockProgress>, ProgressionError> {
    unlock_progress::table
        .filter(unlock_progress::unlocked_at.is_null())
        .order(unlock_progress::id.desc())
        .first(conn)
        .optional()
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))
}

/// Active cycle, created on demand
pub fn ensure_active_unlock_progress(
    conn: &mut SqliteConnection,
) -> Result<UnlockProgress, ProgressionError> {
    match get_active_unlock_progress(conn)? {
        Some(active) => Ok(active),
        None => create_unlock_progress(conn),
    }
}

pub fn get_unlock_progress(
    conn: &mut SqliteConnection,
    progress_id: i32,
) -> Result<Option<UnlockProgress>, ProgressionError> {
    unlock_progress::table
        .find(progress_id)
        .first(conn)
        .optional()
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))
}

fn require_active(
    conn: &mut SqliteConnection,
    progress_id: i32,
) -> Result<UnlockProgress, ProgressionError> {
    match get_unlock_progress(conn, progress_id)? {
        Some(row) if row.is_active() => Ok(row),
        Some(_) => Err(ProgressionError::InvalidInput(format!(
            "unlock progress {} is already completed",
            progress_id
        ))),
        None => Err(ProgressionError::NotFound(format!("unlock progress {}", progress_id))),
    }
}

/// Add `amount` points to an active cycle; returns the new total
pub fn add_contribution(
    conn: &mut SqliteConnection,
    progress_id: i32,
    amount: i32,
) -> Result<i32, ProgressionError> {
    if amount < 0 {
        return Err(ProgressionError::InvalidInput(format!(
            "contribution amount must be >= 0, got {}",
            amount
        )));
    }
    require_active(conn, progress_id)?;

    diesel::update(
        unlock_progress::table
            .filter(unlock_progress::id.eq(progress_id))
            .filter(unlock_progress::unlocked_at.is_null()),
    )
    .set(unlock_progress::contributions_accumulated.eq(unlock_progress::contributions_accumulated + amount))
    .execute(conn)
    .map_err(|e| ProgressionError::Internal(format!("Contribution update failed: {}", e)))?;

    let total = require_active(conn, progress_id)?.contributions_accumulated;
    debug!(progress_id, amount, total, "Contribution added");
    Ok(total)
}

/// Point the active cycle at `(node, level)`
pub fn set_unlock_target(
    conn: &mut SqliteConnection,
    progress_id: i32,
    node_id: i32,
    target_level: i32,
    voting_session_id: Option<i32>,
) -> Result<(), ProgressionError> {
    require_active(conn, progress_id)?;

    diesel::update(unlock_progress::table.find(progress_id))
        .set((
            unlock_progress::node_id.eq(Some(node_id)),
            unlock_progress::target_level.eq(Some(target_level)),
            unlock_progress::voting_session_id.eq(voting_session_id),
        ))
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("Target update failed: {}", e)))?;

    debug!(progress_id, node_id, target_level, "Unlock target set");
    Ok(())
}

/// Close the cycle and open its successor seeded with `rollover` points.
///
/// Both writes share one transaction; returns the successor.
pub fn complete_unlock(
    conn: &mut SqliteConnection,
    progress_id: i32,
    rollover: i32,
) -> Result<UnlockProgress, ProgressionError> {
    if rollover < 0 {
        return Err(ProgressionError::InvalidInput(format!(
            "rollover must be >= 0, got {}",
            rollover
        )));
    }

    conn.transaction(|conn| {
        require_active(conn, progress_id)?;

        diesel::update(unlock_progress::table.find(progress_id))
            .set(unlock_progress::unlocked_at.eq(Some(current_timestamp())))
            .execute(conn)
            .map_err(|e| ProgressionError::Internal(format!("Progress completion failed: {}", e)))?;

        let next = insert_cycle(conn, rollover, Some(progress_id))?;
        info!(progress_id, next_id = next.id, rollover, "Unlock cycle completed");
        Ok(next)
    })
}

/// Drop active cycles targeting `node_id`; returns rows removed
pub fn clear_unlock_progress_for_node(
    conn: &mut SqliteConnection,
    node_id: i32,
) -> Result<usize, ProgressionError> {
    diesel::delete(
        unlock_progress::table
            .filter(unlock_progress::node_id.eq(node_id))
            .filter(unlock_progress::unlocked_at.is_null()),
    )
    .execute(conn)
    .map_err(|e| ProgressionError::Internal(format!("Progress clear failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::nodes::{self, tests::node_input};
    use crate::db::test_db;

    #[test]
    fn test_rollover_chain() {
        let (_dir, db) = test_db();
        let mut conn = db.conn().unwrap();
        let node = nodes::insert_node(&mut conn, &node_input("feature_buy", 1)).unwrap();

        let first = ensure_active_unlock_progress(&mut conn).unwrap();
        assert_eq!(ensure_active_unlock_progress(&mut conn).unwrap().id, first.id);
        assert!(!first.has_target());

        set_unlock_target(&mut conn, first.id, node.id, 1, None).unwrap();
        assert_eq!(add_contribution(&mut conn, first.id, 120).unwrap(), 120);
        assert_eq!(add_contribution(&mut conn, first.id, 30).unwrap(), 150);

        let next = complete_unlock(&mut conn, first.id, 50).unwrap();
        assert_eq!(next.contributions_accumulated, 50);
        assert_eq!(next.previous_progress_id, Some(first.id));
        assert!(!next.has_target());

        let closed = get_unlock_progress(&mut conn, first.id).unwrap().unwrap();
        assert!(closed.unlocked_at.is_some());
        assert_eq!(get_active_unlock_progress(&mut conn).unwrap().unwrap().id, next.id);

        // Completed cycles are frozen
        assert!(matches!(
            add_contribution(&mut conn, first.id, 1),
            Err(ProgressionError::InvalidInput(_))
        ));
        assert!(complete_unlock(&mut conn, first.id, 0).is_err());
    }

    #[test]
    fn test_negative_amounts_rejected() {
        let (_dir, db) = test_db();
        let mut conn = db.conn().unwrap();
        let active = create_unlock_progress(&mut conn).unwrap();

        assert!(matches!(
            add_contribution(&mut conn, active.id, -5),
            Err(ProgressionError::InvalidInput(_))
        ));
        assert!(matches!(
            complete_unlock(&mut conn, active.id, -1),
            Err(ProgressionError::InvalidInput(_))
        ));
        assert!(matches!(
            add_contribution(&mut conn, 999, 5),
            Err(ProgressionError::NotFound(_))
        ));
    }

    #[test]
    fn test_clear_for_node_only_touches_active_rows() {
        let (_dir, db) = test_db();
        let mut conn = db.conn().unwrap();
        let node = nodes::insert_node(&mut conn, &node_input("feature_sell", 1)).unwrap();

        let first = create_unlock_progress(&mut conn).unwrap();
        set_unlock_target(&mut conn, first.id, node.id, 1, None).unwrap();
        let next = complete_unlock(&mut conn, first.id, 0).unwrap();
        set_unlock_target(&mut conn, next.id, node.id, 1, None).unwrap();

        assert_eq!(clear_unlock_progress_for_node(&mut conn, node.id).unwrap(), 1);
        assert!(get_active_unlock_progress(&mut conn).unwrap().is_none());
        assert!(get_unlock_progress(&mut conn, first.id).unwrap().is_some());
    }
}
