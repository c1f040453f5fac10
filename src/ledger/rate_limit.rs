// =============================================================================
// Request Budget — keeps ledger traffic under the store's rate limit
// =============================================================================
//
// The remote ledger enforces a per-minute request quota and answers 429s
// with long penalty windows. The budget tracker keeps a local count per
// rolling minute so the client can refuse a request before it is sent
// rather than burn the quota discovering the limit.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Hard ceiling of requests per minute the client will send.
const REQUESTS_HARD_LIMIT: u32 = 50;
/// Soft warning threshold.
const REQUESTS_WARN_THRESHOLD: u32 = 40;

/// Thread-safe per-minute request counter backed by atomics.
pub struct RequestBudget {
    window_minute: AtomicU64,
    used: AtomicU32,
}

/// Immutable snapshot of the current budget state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub used_this_minute: u32,
    pub hard_limit: u32,
}

impl RequestBudget {
    /// Create a new budget with the counter at zero.
    pub fn new() -> Self {
        Self {
            window_minute: AtomicU64::new(0),
            used: AtomicU32::new(0),
        }
    }

    fn current_minute() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            / 60
    }

    /// Reserve one request slot in the current minute window.
    ///
    /// Returns `false` when the hard limit is already spent; the caller
    /// must not send the request.
    pub fn try_acquire(&self) -> bool {
        let minute = Self::current_minute();
        let window = self.window_minute.load(Ordering::Relaxed);

        if window != minute {
            // New minute window: reset the counter. A racing reset is
            // harmless — both writers land in the same window.
            self.window_minute.store(minute, Ordering::Relaxed);
            self.used.store(0, Ordering::Relaxed);
        }

        let used = self.used.fetch_add(1, Ordering::Relaxed) + 1;

        if used > REQUESTS_HARD_LIMIT {
            warn!(
                used,
                hard_limit = REQUESTS_HARD_LIMIT,
                "ledger request blocked — per-minute budget exhausted"
            );
            return false;
        }
        if used == REQUESTS_WARN_THRESHOLD {
            warn!(
                used,
                hard_limit = REQUESTS_HARD_LIMIT,
                "ledger request budget crossed warning threshold"
            );
        }

        debug!(used, "ledger request slot acquired");
        true
    }

    /// Produce a serialisable snapshot of the current counter.
    pub fn snapshot(&self) -> BudgetSnapshot {
        let minute = Self::current_minute();
        let window = self.window_minute.load(Ordering::Relaxed);
        let used = if window == minute {
            self.used.load(Ordering::Relaxed)
        } else {
            0
        };
        BudgetSnapshot {
            used_this_minute: used.min(REQUESTS_HARD_LIMIT),
            hard_limit: REQUESTS_HARD_LIMIT,
        }
    }
}

impl Default for RequestBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBudget")
            .field("used", &self.used.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exhausts_at_hard_limit() {
        let budget = RequestBudget::new();
        for _ in 0..REQUESTS_HARD_LIMIT {
            assert!(budget.try_acquire());
        }
        assert!(!budget.try_acquire());
    }

    #[test]
    fn snapshot_reports_usage() {
        let budget = RequestBudget::new();
        budget.try_acquire();
        budget.try_acquire();
        let snap = budget.snapshot();
        assert_eq!(snap.used_this_minute, 2);
        assert_eq!(snap.hard_limit, REQUESTS_HARD_LIMIT);
    }
}
