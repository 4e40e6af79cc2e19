//! Query cancellation

use crate::storage::error::{HeadError, HeadResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cancellation handle passed to every query
///
/// Clones share the same cancel flag, so a caller can keep one clone and
/// cancel a scan running on another thread.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::default(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancelled: Arc::default(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail if the query was cancelled or ran past its deadline
    pub fn check(&self) -> HeadResult<()> {
        if self.is_cancelled() {
            return Err(HeadError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(HeadError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared() {
        let ctx = QueryContext::new();
        let other = ctx.clone();
        assert!(ctx.check().is_ok());

        other.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.check(), Err(HeadError::Cancelled)));
    }

    #[test]
    fn test_deadline() {
        let ctx = QueryContext::with_deadline(Instant::now());
        assert!(matches!(ctx.check(), Err(HeadError::DeadlineExceeded)));

        let ctx = QueryContext::with_timeout(Duration::from_secs(3600));
        assert!(ctx.check().is_ok());
    }
}
