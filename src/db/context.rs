//! Operation context for progression database operations
//!
//! Every repository call receives an `OpContext`. It names the request for
//! log correlation and carries the caller's deadline and cancellation flag.
//! Write transactions check the context right before committing, so an
//! expired or cancelled request rolls back instead of committing late.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ProgressionError;

/// Per-request context passed to all database operations
#[derive(Debug, Clone)]
pub struct OpContext {
    /// Request identifier for log correlation
    pub request_id: String,
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl OpContext {
    /// Create a context with a fresh request id and no deadline
    pub fn new() -> Self {
        Self::with_request_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            deadline: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Same request, bounded by `timeout` from now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Flag shared by every clone of this context
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail if the request was cancelled or ran past its deadline
    pub fn check(&self, operation: &str) -> Result<(), ProgressionError> {
        if self.is_cancelled() {
            return Err(ProgressionError::Cancelled(format!(
                "{} ({})",
                operation, self.request_id
            )));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ProgressionError::DeadlineExceeded(format!(
                    "{} ({})",
                    operation, self.request_id
                )));
            }
        }
        Ok(())
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OpContext({})", self.request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context_passes() {
        let ctx = OpContext::new();
        assert!(ctx.check("read").is_ok());
        assert!(ctx.deadline().is_none());
    }

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let ctx = OpContext::with_request_id("req-1");
        let clone = ctx.clone();
        clone.cancel();

        assert!(ctx.is_cancelled());
        assert!(matches!(
            ctx.check("vote"),
            Err(ProgressionError::Cancelled(msg)) if msg.contains("req-1")
        ));
    }

    #[test]
    fn test_expired_deadline() {
        let ctx = OpContext::new().with_timeout(Duration::ZERO);
        assert!(matches!(
            ctx.check("reset"),
            Err(ProgressionError::DeadlineExceeded(_))
        ));
    }
}
