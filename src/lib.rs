//! Progression Engine - community feature unlocks
//!
//! A shared progression tree that a whole community unlocks together.
//! Engagement (messages, commands, crafting, votes) is weighted into
//! contribution points, the community votes on what to unlock next, and the
//! winning node unlocks once enough points have accumulated.
//!
//! ## Cycle
//!
//! ```text
//! engagement ──weight──> contribution ──> unlock progress (target, points)
//!                                              │ cost met
//!                                              ▼
//! voting session ──winner──> next target <── unlock + rollover
//! ```
//!
//! While one target is being paid for, the vote for the following target
//! runs in parallel, so there is no idle gap between cycles.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/progression-engine/
//! ├── progression.db   # SQLite: catalog, unlocks, sessions, ledger, resets
//! └── config.toml      # Configuration
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod tree;

// Re-exports
pub use config::Config;
pub use db::{OpContext, ProgressionDb};
pub use error::ProgressionError;
pub use services::{EngagementService, EventBus, ProgressionEvent, ProgressionService, Services};
pub use tree::{SyncResult, TreeConfig};
