//! Time sources for the background jobs.
//!
//! Sealing and retention both depend on "now"; the store reads it through
//! a [`Clock`] so operators and tests can drive time explicitly.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Source of the current instant.
pub trait Clock: Send + Sync {
    /// Returns the current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for simulations and tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.write();
        *now += by;
    }

    /// Jump to an absolute instant
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}
