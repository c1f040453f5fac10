// =============================================================================
// Clock — single injectable time source
// =============================================================================
//
// Every cooldown and expiry comparison in the engine goes through a `Clock`
// so that time-dependent logic is deterministic under test.
// =============================================================================

use chrono::{DateTime, Utc};

/// Injectable "now" source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for tests: starts at a fixed instant and only moves
/// when explicitly advanced.
#[cfg(test)]
pub struct FixedClock {
    now: parking_lot::RwLock<DateTime<Utc>>,
}

#[cfg(test)]
impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::RwLock::new(at),
        }
    }

    /// Start at an arbitrary but stable instant.
    pub fn default_start() -> Self {
        use chrono::TimeZone;
        Self::new(Utc.with_ymd_and_hms(2024, 6, 3, 14, 30, 0).unwrap())
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.write();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}
