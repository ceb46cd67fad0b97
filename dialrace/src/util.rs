//! Small shared helpers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out process-unique instance ids for tracing spans.
pub(crate) fn next_instance_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Budget for repetitive warnings.
///
/// The first `limit` occurrences of a noisy condition warrant a `warn!`;
/// after that the caller should drop to `debug!` so one flapping destination
/// cannot flood the log. Owned by whoever does the warning, so tests reset it
/// between cases instead of fighting process-global state.
#[derive(Debug, Clone)]
pub struct WarnLimiter {
    limit: u32,
    used: u32,
}

impl WarnLimiter {
    /// A limiter allowing `limit` warnings before muting.
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Whether the caller may still warn loudly. Consumes one slot.
    pub fn allow(&mut self) -> bool {
        if self.used < self.limit {
            self.used += 1;
            true
        } else {
            false
        }
    }

    /// Whether the budget is spent.
    pub fn muted(&self) -> bool {
        self.used >= self.limit
    }

    /// Restores the full budget.
    pub fn reset(&mut self) {
        self.used = 0;
    }
}
