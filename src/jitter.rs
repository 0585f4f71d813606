//! Jitter strategies to keep retrying clients from synchronizing.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone)]
pub enum Jitter {
    /// No jitter, use the exact backoff delay.
    None,
    /// Random between 0 and the full delay.
    Full,
    /// Base delay plus a random amount up to half of it again.
    ///
    /// This is the default for retry actions: `delay + random(0..=delay/2)`.
    Half,
    /// AWS-style decorrelated jitter bounded by `max`.
    Decorrelated { base: Duration, max: Duration },
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn half() -> Self {
        Jitter::Half
    }

    pub fn decorrelated(base: Duration, max: Duration) -> Self {
        Jitter::Decorrelated { base, max }
    }

    /// Apply jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-supplied RNG (for deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = delay.as_millis().min(u64::MAX as u128) as u64;
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Half => {
                let half = millis / 2;
                if half == 0 {
                    return delay;
                }
                Duration::from_millis(millis.saturating_add(rng.random_range(0..=half)))
            }
            Jitter::Decorrelated { base, max } => {
                let base_millis = base.as_millis().min(u64::MAX as u128) as u64;
                let max_millis = max.as_millis().min(u64::MAX as u128) as u64;
                let upper = millis.saturating_mul(3).min(max_millis);
                if base_millis >= upper {
                    return Duration::from_millis(base_millis);
                }
                Duration::from_millis(rng.random_range(base_millis..=upper))
            }
        }
    }
}
