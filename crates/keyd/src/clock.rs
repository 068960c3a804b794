//! Wall-clock abstraction so key validity can be tested at exact instants.
//!
//! - `SystemClock`: delegates to `chrono::Utc::now`
//! - `MockClock`: returns a controllable instant that only moves when told to
//!
//! Timers (cache refresh, rotation ticks) run on tokio's clock instead; tests
//! drive those with paused time.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync + 'static {
    /// Return the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Live implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mock clock for tests.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a mock clock fixed at the real current time.
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Create a mock clock fixed at `now`.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(now)),
        }
    }

    /// Move the clock forward (or backward, for a negative delta).
    pub fn advance(&self, delta: TimeDelta) {
        *self.current.lock() += delta;
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.current.lock() = now;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_only_moves_when_told() {
        let clock = MockClock::new();
        let start = clock.now();
        assert_eq!(clock.now(), start);

        clock.advance(TimeDelta::minutes(5));
        assert_eq!(clock.now(), start + TimeDelta::minutes(5));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn clones_share_time() {
        let clock = MockClock::new();
        let other = clock.clone();
        clock.advance(TimeDelta::seconds(1));
        assert_eq!(clock.now(), other.now());
    }

    #[test]
    fn system_clock_tracks_real_time() {
        let before = Utc::now();
        let now = SystemClock.now();
        assert!(now >= before);
    }
}
