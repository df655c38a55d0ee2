//! Event system for progression changes
//!
//! Services publish events only after their transaction commits. Publishing
//! never fails the operation: with no subscribers the event is dropped.
//! Useful for:
//! - Cache invalidation in other subsystems
//! - Chat announcements
//! - Audit logging

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Progression events emitted by services
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressionEvent {
    NodeUnlocked {
        node_id: i32,
        node_key: String,
        level: i32,
        source: String,
    },
    NodeRelocked {
        node_id: i32,
        node_key: String,
        level: i32,
        source: String,
    },
    VotingStarted {
        session_id: i32,
        node_keys: Vec<String>,
        voting_deadline: String,
    },
    TargetSet {
        progress_id: i32,
        node_key: String,
        level: i32,
        session_id: Option<i32>,
        auto_selected: bool,
    },
    CycleCompleted {
        progress_id: i32,
        next_progress_id: i32,
        node_key: String,
        rollover: i32,
    },
    AllUnlocked {
        total_nodes: i64,
    },
    TreeReset {
        reset_by: String,
        reason: String,
        preserve_user_data: bool,
    },
}

impl ProgressionEvent {
    /// Wire name of the event
    pub fn event_type(&self) -> &'static str {
        match self {
            ProgressionEvent::NodeUnlocked { .. } => "progression.node_unlocked",
            ProgressionEvent::NodeRelocked { .. } => "progression.node_relocked",
            ProgressionEvent::VotingStarted { .. } => "progression.voting_started",
            ProgressionEvent::TargetSet { .. } => "progression.target_set",
            ProgressionEvent::CycleCompleted { .. } => "progression.cycle_completed",
            ProgressionEvent::AllUnlocked { .. } => "progression.all_unlocked",
            ProgressionEvent::TreeReset { .. } => "progression.reset",
        }
    }

    /// JSON payload for external sinks
    pub fn payload(&self) -> serde_json::Value {
        match self {
            ProgressionEvent::NodeUnlocked {
                node_id,
                node_key,
                level,
                source,
            }
            | ProgressionEvent::NodeRelocked {
                node_id,
                node_key,
                level,
                source,
            } => json!({
                "node_id": node_id,
                "node_key": node_key,
                "level": level,
                "source": source,
            }),
            ProgressionEvent::VotingStarted {
                session_id,
                node_keys,
                voting_deadline,
            } => json!({
                "session_id": session_id,
                "node_keys": node_keys,
                "voting_deadline": voting_deadline,
            }),
            ProgressionEvent::TargetSet {
                progress_id,
                node_key,
                level,
                session_id,
                auto_selected,
            } => json!({
                "progress_id": progress_id,
                "node_key": node_key,
                "level": level,
                "session_id": session_id,
                "auto_selected": auto_selected,
            }),
            ProgressionEvent::CycleCompleted {
                progress_id,
                next_progress_id,
                node_key,
                rollover,
            } => json!({
                "progress_id": progress_id,
                "next_progress_id": next_progress_id,
                "node_key": node_key,
                "rollover": rollover,
            }),
            ProgressionEvent::AllUnlocked { total_nodes } => json!({ "total_nodes": total_nodes }),
            ProgressionEvent::TreeReset {
                reset_by,
                reason,
                preserve_user_data,
            } => json!({
                "reset_by": reset_by,
                "reason": reason,
                "preserve_user_data": preserve_user_data,
            }),
        }
    }
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ProgressionEvent);
}

/// Event bus for broadcasting progression events
pub struct EventBus {
    sender: broadcast::Sender<ProgressionEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: ProgressionEvent) {
        trace!(event_type = event.event_type(), event = ?event, "Emitting progression event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressionEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs announcements at info, everything else at debug
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &ProgressionEvent) {
        match event {
            ProgressionEvent::NodeUnlocked {
                node_key,
                level,
                source,
                ..
            } => {
                info!(node_key = %node_key, level, source = %source, "Node unlocked");
            }
            ProgressionEvent::NodeRelocked { node_key, level, .. } => {
                info!(node_key = %node_key, level, "Node relocked");
            }
            ProgressionEvent::AllUnlocked { total_nodes } => {
                info!(total_nodes, "Every progression node is unlocked");
            }
            _ => {
                debug!(event_type = event.event_type(), payload = %event.payload(), "Progression event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
