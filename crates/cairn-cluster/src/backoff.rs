//! Bounded exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Delay schedule for retries: `base * 2^(attempt-1)`, capped at `max`,
/// plus up to a quarter of jitter (still capped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay to wait after the given 1-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let exp = self.base.saturating_mul(1u32 << shift).min(self.max);
        let jitter_ms = (exp.as_millis() as u64) / 4;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        (exp + Duration::from_millis(jitter)).min(self.max)
    }
}
