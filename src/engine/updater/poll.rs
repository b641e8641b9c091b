//! Poll Budgets and Cancellation
//!
//! Shared by the maintenance-settle and ruleset-load loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::error::UpdateError;

/// Timing for one poll loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    /// Sleep between polls
    pub interval: Duration,
    /// Overall budget for the loop
    pub max_wait: Duration,
    /// Timeout for each individual poll request
    pub request_timeout: Duration,
}

impl PollSettings {
    pub fn new(interval: Duration, max_wait: Duration, request_timeout: Duration) -> Self {
        Self {
            interval,
            max_wait,
            request_timeout,
        }
    }
}

/// Cancellation signal for a run: an explicit flag plus an optional deadline.
///
/// Clones share the flag, so a handle can be given to another thread and
/// cancelled from there.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// A timeout too large to express as an instant means no deadline
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::new(),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Iteration-boundary check used by the poll loops and the pipeline
    pub fn check(&self, during: impl ToString) -> Result<(), UpdateError> {
        if self.is_cancelled() {
            return Err(UpdateError::Cancelled {
                during: during.to_string(),
            });
        }
        Ok(())
    }

    /// Sleep for `duration`, cut short at the deadline
    pub fn sleep(&self, duration: Duration) {
        let duration = match self.deadline {
            Some(deadline) => duration.min(deadline.saturating_duration_since(Instant::now())),
            None => duration,
        };
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}
