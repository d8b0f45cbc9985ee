//! Busy-resource retry policies.
//!
//! When a database file is locked the engine calls the connection's busy
//! handler with the number of times it has already retried the current
//! request. Returning `true` makes it retry, `false` makes the request fail
//! with the `Busy` kind.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

/// Host busy handler: `(resource, attempt) -> retry`.
///
/// `resource` is the path the connection was opened with; `attempt` starts at
/// zero for every new lock wait.
pub type BusyCallback = dyn FnMut(&str, u32) -> bool;

/// Shortest wait between retries under a busy timeout.
pub const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Longest wait between retries under a busy timeout.
pub const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Policy consulted by the engine when it finds a resource locked.
pub enum BusyPolicy {
    /// Delegate to a host closure.
    Handler {
        /// Name reported to the closure.
        resource: String,
        /// The closure.
        callback: Box<BusyCallback>,
    },
    /// Retry with exponential backoff until the budget is spent.
    Timeout(TimeoutBackoff),
}

impl BusyPolicy {
    /// Decides whether the engine should retry. A panicking handler stops the
    /// retries.
    pub fn on_busy(&mut self, attempt: u32) -> bool {
        match self {
            Self::Handler { resource, callback } => {
                match panic::catch_unwind(AssertUnwindSafe(|| callback(resource, attempt))) {
                    Ok(retry) => retry,
                    Err(_) => {
                        tracing::warn!(resource = %resource, attempt, "busy handler panicked");
                        false
                    }
                }
            }
            Self::Timeout(backoff) => backoff.wait(attempt),
        }
    }
}

/// Sleeps between retries with exponentially growing delays, giving up once
/// the total wait for one request reaches the budget.
pub struct TimeoutBackoff {
    budget: Duration,
    waited: Duration,
    delays: ExponentialBackoff,
}

impl TimeoutBackoff {
    /// Creates a backoff that waits at most `budget` per request.
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            waited: Duration::ZERO,
            delays: Self::schedule(),
        }
    }

    fn schedule() -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(MIN_BACKOFF)
            .with_max_delay(MAX_BACKOFF)
            .with_max_times(usize::MAX)
            .build()
    }

    /// Returns the next delay, or `None` once the budget is spent. Attempt
    /// zero starts a new request.
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            self.waited = Duration::ZERO;
            self.delays = Self::schedule();
        }
        let remaining = self.budget.saturating_sub(self.waited);
        if remaining.is_zero() {
            return None;
        }
        let delay = self.delays.next().unwrap_or(MAX_BACKOFF).min(remaining);
        self.waited += delay;
        Some(delay)
    }

    fn wait(&mut self, attempt: u32) -> bool {
        match self.next_delay(attempt) {
            Some(delay) => {
                thread::sleep(delay);
                true
            }
            None => false,
        }
    }
}
