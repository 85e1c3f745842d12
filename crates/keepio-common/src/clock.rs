//! Wall-clock sources
//!
//! Lifecycle decisions compare stored timestamps against "now". Taking the
//! clock as a value lets tests replay timestamp scenarios exactly.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that reads the system time until pinned to a fixed instant
#[derive(Debug, Default)]
pub struct ManualClock {
    pinned: Mutex<Option<DateTime<Utc>>>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the clock to `t`
    pub fn set(&self, t: DateTime<Utc>) {
        *self.pinned.lock() = Some(t);
    }

    /// Go back to following the system time
    pub fn reset(&self) {
        *self.pinned.lock() = None;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.pinned.lock().unwrap_or_else(Utc::now)
    }
}
