//! Time sources for the pump loop
//!
//! The retry machine only ever compares instants it was handed, so tests drive it with a
//! [`ManualClock`] instead of sleeping.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Source of monotonic and wall-clock time
pub trait Clock {
    /// Monotonic time used for retry scheduling
    fn now(&self) -> Instant;

    /// Wall-clock time used for timestamps reported to the caller
    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The process clocks
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to
///
/// Clones share the same time, so a test can keep one handle and give another to the client.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<(Instant, DateTime<Utc>)>>,
}

impl ManualClock {
    ///
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new((Instant::now(), Utc::now()))),
        }
    }

    /// Move both clocks forward by `by`
    pub fn advance(&self, by: Duration) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.0 += by;
        if let Ok(by) = chrono::Duration::from_std(by) {
            guard.1 = guard.1 + by;
        }
    }

    fn read(&self) -> (Instant, DateTime<Utc>) {
        match self.inner.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.read().0
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        self.read().1
    }
}
