//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::ProgressionError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), ProgressionError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new progression schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, ProgressionError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| ProgressionError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

/// Set schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), ProgressionError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| ProgressionError::Internal(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| ProgressionError::Internal(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &Connection) -> Result<(), ProgressionError> {
    conn.execute_batch(GRAPH_SCHEMA)
        .map_err(|e| ProgressionError::Internal(format!("Failed to create graph tables: {}", e)))?;

    conn.execute_batch(VOTING_SCHEMA)
        .map_err(|e| ProgressionError::Internal(format!("Failed to create voting tables: {}", e)))?;

    conn.execute_batch(ENGAGEMENT_SCHEMA)
        .map_err(|e| ProgressionError::Internal(format!("Failed to create engagement tables: {}", e)))?;

    conn.execute_batch(ADMIN_SCHEMA)
        .map_err(|e| ProgressionError::Internal(format!("Failed to create admin tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| ProgressionError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

/// Migrate schema from older version
fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), ProgressionError> {
    info!("No migration steps registered for v{}", from_version);
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Nodes, prerequisite junction and unlock facts
const GRAPH_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS progression_nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_key TEXT NOT NULL UNIQUE,
    node_type TEXT NOT NULL,
    display_name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    max_level INTEGER NOT NULL DEFAULT 1 CHECK (max_level > 0),
    unlock_cost INTEGER NOT NULL DEFAULT 0 CHECK (unlock_cost >= 0),
    tier INTEGER NOT NULL DEFAULT 0 CHECK (tier >= 0),
    size TEXT NOT NULL DEFAULT 'medium',
    category TEXT NOT NULL DEFAULT '',
    sort_order INTEGER NOT NULL DEFAULT 0,

    -- ModifierConfig as JSON; feature_key copied out for lookups
    modifier_config TEXT,
    feature_key TEXT,

    -- JSON array of dynamic prerequisite rules
    dynamic_prerequisites TEXT NOT NULL DEFAULT '[]',

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Edge (node -> prerequisite); a node with no rows has no static prerequisite
CREATE TABLE IF NOT EXISTS progression_prerequisites (
    node_id INTEGER NOT NULL REFERENCES progression_nodes(id),
    prerequisite_node_id INTEGER NOT NULL REFERENCES progression_nodes(id),
    PRIMARY KEY (node_id, prerequisite_node_id),
    CHECK (node_id != prerequisite_node_id)
);

CREATE TABLE IF NOT EXISTS progression_unlocks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id INTEGER NOT NULL REFERENCES progression_nodes(id),
    current_level INTEGER NOT NULL CHECK (current_level > 0),
    unlocked_at TEXT NOT NULL,
    unlocked_by TEXT NOT NULL,
    engagement_score INTEGER NOT NULL DEFAULT 0,
    UNIQUE (node_id, current_level)
);
"#;

/// Sessions, options, per-user vote markers and the progress chain
const VOTING_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS progression_voting_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    status TEXT NOT NULL DEFAULT 'voting' CHECK (status IN ('voting', 'frozen', 'completed')),
    started_at TEXT NOT NULL,
    voting_deadline TEXT NOT NULL,
    ended_at TEXT,
    -- No FK: options reference sessions, the repository validates the winner
    winning_option_id INTEGER,
    -- 1 while open, NULL once completed; unique so only one session is open
    open_marker INTEGER GENERATED ALWAYS AS (
        CASE WHEN status IN ('voting', 'frozen') THEN 1 ELSE NULL END
    ) VIRTUAL
);

CREATE TABLE IF NOT EXISTS progression_voting_options (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES progression_voting_sessions(id) ON DELETE CASCADE,
    node_id INTEGER NOT NULL REFERENCES progression_nodes(id),
    target_level INTEGER NOT NULL CHECK (target_level > 0),
    vote_count INTEGER NOT NULL DEFAULT 0 CHECK (vote_count >= 0),
    last_highest_vote_at TEXT,
    UNIQUE (session_id, node_id)
);

CREATE TABLE IF NOT EXISTS progression_user_votes (
    user_id TEXT NOT NULL,
    session_id INTEGER NOT NULL REFERENCES progression_voting_sessions(id),
    option_id INTEGER NOT NULL REFERENCES progression_voting_options(id),
    node_id INTEGER NOT NULL,
    voted_at TEXT NOT NULL,
    PRIMARY KEY (user_id, session_id)
);

CREATE TABLE IF NOT EXISTS progression_unlock_progress (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id INTEGER REFERENCES progression_nodes(id),
    target_level INTEGER,
    contributions_accumulated INTEGER NOT NULL DEFAULT 0 CHECK (contributions_accumulated >= 0),
    started_at TEXT NOT NULL,
    unlocked_at TEXT,
    voting_session_id INTEGER REFERENCES progression_voting_sessions(id),
    previous_progress_id INTEGER,
    -- 1 while active, NULL once completed; unique so only one cycle is active
    active_marker INTEGER GENERATED ALWAYS AS (
        CASE WHEN unlocked_at IS NULL THEN 1 ELSE NULL END
    ) VIRTUAL
);

-- Single-option ballots from before multi-option sessions; only cleared now
CREATE TABLE IF NOT EXISTS progression_voting (
    node_id INTEGER NOT NULL,
    target_level INTEGER NOT NULL,
    vote_count INTEGER NOT NULL DEFAULT 0,
    voting_started_at TEXT NOT NULL,
    voting_ends_at TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (node_id, target_level)
);
"#;

/// Append-only engagement ledger and weights
const ENGAGEMENT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS engagement_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    metric_type TEXT NOT NULL,
    metric_value INTEGER NOT NULL,
    metadata TEXT,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS engagement_weights (
    metric_type TEXT PRIMARY KEY NOT NULL,
    weight REAL NOT NULL,
    description TEXT,
    updated_at TEXT NOT NULL
);
"#;

/// Reset audit, per-user progression and tree sync bookkeeping
const ADMIN_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS progression_resets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reset_by TEXT NOT NULL,
    reason TEXT NOT NULL,
    nodes_reset_count INTEGER NOT NULL,
    engagement_score_at_reset INTEGER NOT NULL,
    reset_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_progression (
    user_id TEXT NOT NULL,
    progression_type TEXT NOT NULL,
    progression_key TEXT NOT NULL,
    unlocked_at TEXT NOT NULL,
    metadata TEXT,
    PRIMARY KEY (user_id, progression_type, progression_key)
);

CREATE TABLE IF NOT EXISTS progression_sync_metadata (
    config_name TEXT PRIMARY KEY NOT NULL,
    last_sync_time TEXT NOT NULL,
    file_hash TEXT NOT NULL,
    file_mod_time TEXT NOT NULL
);
"#;

/// Index definitions
const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_nodes_feature_key ON progression_nodes(feature_key);
CREATE INDEX IF NOT EXISTS idx_nodes_tier ON progression_nodes(tier);
CREATE INDEX IF NOT EXISTS idx_prereq_prerequisite ON progression_prerequisites(prerequisite_node_id);
CREATE INDEX IF NOT EXISTS idx_unlocks_node ON progression_unlocks(node_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_single_open ON progression_voting_sessions(open_marker);
CREATE INDEX IF NOT EXISTS idx_options_session ON progression_voting_options(session_id);
CREATE INDEX IF NOT EXISTS idx_user_votes_session ON progression_user_votes(session_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_progress_single_active ON progression_unlock_progress(active_marker);
CREATE INDEX IF NOT EXISTS idx_progress_node ON progression_unlock_progress(node_id);
CREATE INDEX IF NOT EXISTS idx_engagement_user ON engagement_metrics(user_id);
CREATE INDEX IF NOT EXISTS idx_engagement_recorded ON engagement_metrics(recorded_at);
CREATE INDEX IF NOT EXISTS idx_user_progression_type ON user_progression(user_id, progression_type);
"#;
