//! Time source abstraction
//!
//! Every timestamp the engine stores (enqueue time, schedule time, claim
//! deadlines, result expiry) comes from a [`Clock`], so tests can drive
//! promotion and reaping without sleeping.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;

/// Upper bound for offsets added to timestamps (100 years).
const MAX_OFFSET_MS: u128 = 100 * 365 * 24 * 60 * 60 * 1000;

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at the current system time
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = offset(*now, by);
    }

    /// Jump to an absolute time
    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `t + d`, saturating at a century so absurd durations cannot overflow.
pub fn offset(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    t + clamped(d)
}

/// `t - d`, with the same saturation as [`offset`].
pub fn rewind(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    t - clamped(d)
}

fn clamped(d: Duration) -> chrono::Duration {
    let ms = d.as_millis().min(MAX_OFFSET_MS) as i64;
    chrono::Duration::milliseconds(ms)
}

/// Millisecond score used by the sorted sets.
pub fn score_of(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Inverse of [`score_of`]
pub fn from_score(score: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(score)
}
