//! Per-user unlocks (recipes, personal features) outside the shared tree

use diesel::prelude::*;

use super::diesel_schema::user_progression;
use super::models::{current_timestamp, NewUserProgression, UserProgression};
use crate::error::ProgressionError;

/// Idempotent: unlocking twice keeps the first timestamp and metadata
pub fn unlock_user_progression(
    conn: &mut SqliteConnection,
    user_id: &str,
    progression_type: &str,
    progression_key: &str,
    metadata: Option<&serde_json::Value>,
) -> Result<bool, ProgressionError> {
    if user_id.trim().is_empty() || progression_type.trim().is_empty() || progression_key.trim().is_empty() {
        return Err(ProgressionError::InvalidInput(
            "user_id, progression_type and progression_key are required".into(),
        ));
    }

    let metadata = metadata.map(serde_json::to_string).transpose()?;
    let now = current_timestamp();

    let inserted = diesel::insert_or_ignore_into(user_progression::table)
        .values(&NewUserProgression {
            user_id,
            progression_type,
            progression_key,
            unlocked_at: &now,
            metadata,
        })
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("User progression insert failed: {}", e)))?;

    Ok(inserted > 0)
}

pub fn is_user_progression_unlocked(
    conn: &mut SqliteConnection,
    user_id: &str,
    progression_type: &str,
    progression_key: &str,
) -> Result<bool, ProgressionError> {
    let count: i64 = user_progression::table
        .filter(user_progression::user_id.eq(user_id))
        .filter(user_progression::progression_type.eq(progression_type))
        .filter(user_progression::progression_key.eq(progression_key))
        .count()
        .get_result(conn)
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))?;
    Ok(count > 0)
}

pub fn get_user_progressions(
    conn: &mut SqliteConnection,
    user_id: &str,
    progression_type: &str,
) -> Result<Vec<UserProgression>, ProgressionError> {
    user_progression::table
        .filter(user_progression::user_id.eq(user_id))
        .filter(user_progression::progression_type.eq(progression_type))
        .order((user_progression::unlocked_at.asc(), user_progression::progression_key.asc()))
        .load(conn)
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))
}
