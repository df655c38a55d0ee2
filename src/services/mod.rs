//! Service layer for progression-engine
//!
//! Services wrap repository calls with:
//! - Input validation
//! - Transaction boundaries (one `ProgressionDb::write` per decision)
//! - Hot caches and their invalidation
//! - Event emission after commit
//!
//! ## Architecture
//!
//! ```text
//! Callers (CLI, bots, game server)
//!     ↓
//! Service Layer (progression, engagement)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod engagement_service;
pub mod events;
pub mod modifiers;
pub mod progression_service;

// Re-exports
pub use engagement_service::{EngagementService, UnlockEstimate, VelocityMetrics};
pub use events::{spawn_logging_listener, EventBus, EventListener, ProgressionEvent};
pub use modifiers::{apply_modifier, stack_modifiers, ModifierCache};
pub use progression_service::{
    select_winner, AdminStart, ProgressionService, ProgressionSettings, ProgressionStatus,
    UnlockResult, VoteReceipt, VotingStart,
};

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db::ProgressionDb;
use crate::error::ProgressionError;

/// Service container for dependency injection
pub struct Services {
    pub progression: Arc<ProgressionService>,
    pub engagement: Arc<EngagementService>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Create all services over one shared database
    pub fn new(db: Arc<ProgressionDb>, config: &Config) -> Result<Self, ProgressionError> {
        let settings = ProgressionSettings::from_config(config)?;
        let events = Arc::new(EventBus::with_capacity(config.event_capacity));
        let engagement = Arc::new(EngagementService::new(
            db.clone(),
            config.default_weights.clone(),
            Duration::from_secs(config.weight_cache_ttl_secs),
        ));
        let progression = Arc::new(ProgressionService::new(
            db,
            events.clone(),
            engagement.clone(),
            settings,
        ));

        Ok(Self {
            progression,
            engagement,
            events,
        })
    }
}
