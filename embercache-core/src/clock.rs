//! UTC clock seam for the placement engine.
//!
//! The engine only reads the clock to stamp newly created tombstones and to
//! evaluate prune horizons, so the dependency is a single `utc_now` call
//! behind a trait object.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// A source of UTC instants.
///
/// Implementations must not assume the returned instants are monotonic
/// across long pauses; the engine never relies on that.
pub trait Clock: Send + Sync {
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation backed by `chrono::Utc::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Intended for tests that need to
/// steer tombstones across prune horizons.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("clock lock poisoned") = now;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn utc_now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}
