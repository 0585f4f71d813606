//! Backoff schedules for retry delays.

use std::time::Duration;

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Fixed delay between attempts.
    Constant { delay: Duration },
    /// Delay grows linearly with the attempt number.
    Linear { base: Duration },
    /// Delay grows geometrically: `base * multiplier^(attempt-1)`, capped at `max`.
    Exponential { base: Duration, multiplier: u32, max: Option<Duration> },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base }
    }

    /// Exponential schedule with the conventional doubling multiplier.
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, multiplier: 2, max: None }
    }

    /// Override the growth multiplier; values below 1 are clamped to 1.
    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        if let Backoff::Exponential { multiplier: ref mut m, .. } = self {
            *m = multiplier.max(1);
        }
        self
    }

    /// Cap the exponential delay.
    pub fn with_max(mut self, max: Duration) -> Self {
        if let Backoff::Exponential { max: ref mut m, .. } = self {
            *m = Some(max);
        }
        self
    }

    /// Delay before the given attempt (1-indexed). Saturates instead of
    /// overflowing for large attempt numbers.
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Linear { base } => base
                .checked_mul(attempt as u32)
                .unwrap_or(Duration::from_secs(u64::MAX)),
            Backoff::Exponential { base, multiplier, max } => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let factor = multiplier.saturating_pow(exponent);
                let delay = base
                    .checked_mul(factor)
                    .unwrap_or(Duration::from_secs(u64::MAX));
                match max {
                    Some(cap) => delay.min(*cap),
                    None => delay,
                }
            }
        }
    }
}
