//! Configuration for progression-engine

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("progression-engine")
}

/// Engagement weights used when the weight table has never been populated
pub fn default_engagement_weights() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("message".to_string(), 1.0),
        ("command".to_string(), 2.0),
        ("item_crafted".to_string(), 3.0),
        ("item_used".to_string(), 1.5),
    ])
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Database file name inside storage_dir
    #[serde(default = "default_db_file")]
    pub db_file: String,

    /// Max pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// SQLite busy_timeout applied to every pooled connection
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Node that is never relocked by a tree reset
    #[serde(default = "default_root_node_key")]
    pub root_node_key: String,

    /// Options offered per voting session
    #[serde(default = "default_max_voting_options")]
    pub max_voting_options: usize,

    /// Cap on contribution carried into the next cycle after an unlock
    #[serde(default = "default_max_rollover_points")]
    pub max_rollover_points: i32,

    /// Voting deadline for new sessions
    #[serde(default = "default_voting_duration_hours")]
    pub voting_duration_hours: i64,

    /// Engagement weight cache lifetime
    #[serde(default = "default_weight_cache_ttl_secs")]
    pub weight_cache_ttl_secs: u64,

    /// Fallback weights when the weight table is empty
    #[serde(default = "default_engagement_weights")]
    pub default_weights: BTreeMap<String, f64>,

    /// Progression tree JSON synced at startup
    #[serde(default)]
    pub tree_config_path: Option<PathBuf>,

    /// Broadcast buffer for progression events
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_db_file() -> String {
    "progression.db".to_string()
}

fn default_pool_size() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_root_node_key() -> String {
    "progression_system".to_string()
}

fn default_max_voting_options() -> usize {
    4
}

fn default_max_rollover_points() -> i32 {
    200
}

fn default_voting_duration_hours() -> i64 {
    24
}

fn default_weight_cache_ttl_secs() -> u64 {
    300
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            db_file: default_db_file(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
            root_node_key: default_root_node_key(),
            max_voting_options: default_max_voting_options(),
            max_rollover_points: default_max_rollover_points(),
            voting_duration_hours: default_voting_duration_hours(),
            weight_cache_ttl_secs: default_weight_cache_ttl_secs(),
            default_weights: default_engagement_weights(),
            tree_config_path: None,
            event_capacity: default_event_capacity(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get database path
    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join(&self.db_file)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}
