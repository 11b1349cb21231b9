//! Time source abstraction.
//!
//! Every component reads time through [`Clock`]. Readings are truncated to
//! whole seconds because all durations in the core are whole seconds.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock that never goes backwards within one process.
#[derive(Debug, Default)]
pub struct SystemClock {
    last_secs: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let observed = Utc::now().timestamp();
        let previous = self.last_secs.fetch_max(observed, Ordering::SeqCst);
        from_secs(observed.max(previous))
    }
}

/// Manually driven clock for tests and deterministic drivers.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(truncate(start))),
        }
    }

    pub fn at_epoch_secs(secs: i64) -> Self {
        Self::new(from_secs(secs))
    }

    /// Move the clock by `secs` (negative values move it backwards).
    pub fn advance(&self, secs: i64) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += Duration::seconds(secs);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = truncate(at);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Whole seconds from `from` to `to`; negative when `to` is earlier.
pub fn secs_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_seconds()
}

fn truncate(at: DateTime<Utc>) -> DateTime<Utc> {
    from_secs(at.timestamp())
}

fn from_secs(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_in_whole_seconds() {
        let clock = ManualClock::at_epoch_secs(1_700_000_000);
        let start = clock.now();
        clock.advance(90);
        assert_eq!(secs_between(start, clock.now()), 90);
        clock.advance(-30);
        assert_eq!(secs_between(start, clock.now()), 60);
    }

    #[test]
    fn system_clock_is_non_decreasing() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert_eq!(a.timestamp_subsec_nanos(), 0);
    }
}
