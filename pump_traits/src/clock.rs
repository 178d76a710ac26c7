use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Wall-clock abstraction for pump timing across the stack.
///
/// - now(): current wall-clock time in UTC
/// - sleep(): sleeps for the provided duration (implementations may simulate)
/// - since(): helper to compute elapsed time from an earlier instant
///
/// Pump timestamps, reservoir samples and glucose data are all wall-clock
/// values, so a monotonic `Instant` is not enough here.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, d: Duration);

    /// Time elapsed since `earlier`, saturating at zero when `earlier` is in the future.
    fn since(&self, earlier: DateTime<Utc>) -> chrono::Duration {
        let d = self.now() - earlier;
        if d < chrono::Duration::zero() {
            chrono::Duration::zero()
        } else {
            d
        }
    }
}

/// Default, real-time clock backed by the system calendar.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    #[inline]
    fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        thread::sleep(d);
    }
}

/// Deterministic clock whose time can be advanced manually.
///
/// now() = origin + offset
/// sleep(d) advances internal time by d without actually sleeping.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: DateTime<Utc>,
    offset: Arc<Mutex<chrono::Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Start the clock at a fixed instant (useful for reproducible tests).
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            offset: Arc::new(Mutex::new(chrono::Duration::zero())),
        }
    }

    /// Advance the clock by the given duration.
    pub fn advance(&self, d: chrono::Duration) {
        if let Ok(mut off) = self.offset.lock() {
            *off += d;
        }
    }

    /// Set the absolute offset relative to origin.
    pub fn set_offset(&self, d: chrono::Duration) {
        if let Ok(mut off) = self.offset.lock() {
            *off = d;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let off = self
            .offset
            .lock()
            .map(|g| *g)
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin + off
    }

    fn sleep(&self, d: Duration) {
        self.advance(chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero()));
    }
}
