use std::cmp;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Exponential retry delay: `base * 2^(attempt - 1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cmp::max(cap, base),
        }
    }

    pub fn from_secs(base_secs: u64, cap_secs: u64) -> Self {
        Self::new(Duration::from_secs(base_secs), Duration::from_secs(cap_secs))
    }

    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        cmp::min(self.base.saturating_mul(1u32 << exponent), self.cap)
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempt))
            .unwrap_or_else(|_| chrono::Duration::days(365));
        now.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_secs(1, 60)
    }
}
