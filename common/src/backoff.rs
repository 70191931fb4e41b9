use chrono::{DateTime, Duration, Utc};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::BackoffConfig;

/// Delay before the next attempt after `failures` consecutive failures.
///
/// `base * 2^(failures - 1)` capped at `max`, then reduced by up to
/// `jitter` of itself. The reduction is derived from `seed` and `failures`
/// so the same inputs always give the same delay.
pub fn backoff_delay(failures: u32, config: &BackoffConfig, seed: u64) -> Duration {
    if failures == 0 {
        return Duration::zero();
    }

    let base_ms = config.base_secs.saturating_mul(1_000);
    let max_ms = config.max_secs.saturating_mul(1_000);
    let exponent = (failures - 1).min(63);
    let raw_ms = base_ms.saturating_mul(1u64 << exponent);
    let capped_ms = raw_ms.min(max_ms);

    let jitter = config.jitter.clamp(0.0, 1.0);
    let shaved = (capped_ms as f64 * jitter * jitter_fraction(seed, failures)) as u64;
    let delay_ms = capped_ms.saturating_sub(shaved);

    Duration::milliseconds(delay_ms.min(i64::MAX as u64) as i64)
}

pub fn next_attempt_at(
    failures: u32,
    config: &BackoffConfig,
    seed: u64,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    now + backoff_delay(failures, config, seed)
}

/// Value in `[0, 1)` drawn from a generator seeded by `seed` and `failures`.
fn jitter_fraction(seed: u64, failures: u32) -> f64 {
    let mut rng = SmallRng::seed_from_u64(seed ^ u64::from(failures));
    rng.gen::<f64>()
}

/// Consecutive-failure counter and retry gate for one dependency.
#[derive(Debug, Clone, Default)]
pub struct BackoffState {
    failures: u32,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl BackoffState {
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.next_attempt_at
    }

    pub fn ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map(|next| now >= next).unwrap_or(true)
    }

    /// Returns the delay until the next attempt is allowed.
    pub fn record_failure(
        &mut self,
        now: DateTime<Utc>,
        config: &BackoffConfig,
        seed: u64,
    ) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = backoff_delay(self.failures, config, seed);
        self.next_attempt_at = Some(now + delay);
        delay
    }

    /// Returns the failure count that was cleared.
    pub fn record_success(&mut self) -> u32 {
        let cleared = self.failures;
        self.failures = 0;
        self.next_attempt_at = None;
        cleared
    }
}
