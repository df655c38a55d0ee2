//! Error types for progression-engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProgressionError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Progression node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Level {level} exceeds max level {max_level} for node {node_key}")]
    MaxLevelExceeded {
        node_key: String,
        level: i32,
        max_level: i32,
    },

    #[error("User {user_id} has already voted in session {session_id}")]
    AlreadyVoted { user_id: String, session_id: i32 },

    #[error("No active voting session")]
    NoActiveSession,

    #[error("A voting session is already active (session {0})")]
    SessionAlreadyActive(i32),

    #[error("Voting session {0} is already frozen")]
    SessionAlreadyFrozen(i32),

    #[error("Invalid session transition for session {session_id}: {from} -> {to}")]
    InvalidTransition {
        session_id: i32,
        from: String,
        to: String,
    },

    #[error("No nodes available for voting")]
    NoNodesAvailable,

    #[error("Cycle detected in prerequisites at node '{0}'")]
    CycleDetected(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProgressionError {
    /// Whether the caller may retry the same request unchanged.
    ///
    /// Busy/locked stores, exhausted pools and cancelled transactions all rolled
    /// back cleanly, so a retry cannot double-apply anything.
    pub fn is_retriable(&self) -> bool {
        match self {
            ProgressionError::Pool(_)
            | ProgressionError::Cancelled(_)
            | ProgressionError::DeadlineExceeded(_) => true,
            ProgressionError::Database(e) => is_busy_message(&e.to_string()),
            ProgressionError::Sqlite(e) => is_busy_message(&e.to_string()),
            ProgressionError::Internal(msg) => is_busy_message(msg),
            _ => false,
        }
    }

    /// Conflicts are expected outcomes that callers render as friendly messages.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ProgressionError::AlreadyVoted { .. }
                | ProgressionError::SessionAlreadyActive(_)
                | ProgressionError::SessionAlreadyFrozen(_)
                | ProgressionError::InvalidTransition { .. }
        )
    }
}

fn is_busy_message(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        let err = ProgressionError::AlreadyVoted {
            user_id: "alice".into(),
            session_id: 3,
        };
        assert!(err.is_conflict());
        assert!(!err.is_retriable());
        assert_eq!(
            err.to_string(),
            "User alice has already voted in session 3"
        );
    }

    #[test]
    fn test_retriable_classification() {
        assert!(ProgressionError::Pool("timed out".into()).is_retriable());
        assert!(ProgressionError::Internal("Query failed: database is locked".into()).is_retriable());
        assert!(!ProgressionError::NoActiveSession.is_retriable());
        assert!(!ProgressionError::InvalidInput("level".into()).is_conflict());
    }
}
