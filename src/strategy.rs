//! Recovery strategies: the data that maps error codes to actions.
//!
//! Strategies are pure configuration. The error handler looks the code up and
//! returns an [`ErrorAction`]; applying it (sleeping, blacklisting, destroying)
//! is the scheduler's job.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the scheduler should do about a classified failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry the same instance after the given delay.
    Retry { after: Duration },
    /// Drop the instance from this request's candidate set and reselect.
    Failover,
    /// Blacklist the pipeline for the duration, then failover.
    Blacklist { duration: Duration },
    /// Put the instance in maintenance (e.g. pending credential refresh), then failover.
    Maintenance,
    /// Destroy the instance permanently, then failover.
    Destroy,
    /// Re-raise to the caller immediately.
    Surface,
}

/// Strategy tag, as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyAction {
    Retry,
    Failover,
    BlacklistTemporary,
    Maintenance,
    DestroyPipeline,
    Ignore,
}

/// Per-code recovery policy. User configuration may override any code's entry;
/// the defaults ship with [`default_strategies`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHandlingStrategy {
    pub error_code: ErrorCode,
    pub action: StrategyAction,
    /// Retries granted before a `Retry` strategy degrades to failover.
    #[serde(default)]
    pub retry_count: u32,
    /// Base delay for retry backoff, milliseconds.
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    /// Exclusion window for `BlacklistTemporary`, milliseconds.
    #[serde(default)]
    pub blacklist_duration_ms: Option<u64>,
    #[serde(default)]
    pub should_destroy_pipeline: bool,
}

impl ErrorHandlingStrategy {
    pub fn new(error_code: ErrorCode, action: StrategyAction) -> Self {
        Self {
            error_code,
            action,
            retry_count: 0,
            retry_delay_ms: None,
            blacklist_duration_ms: None,
            should_destroy_pipeline: matches!(action, StrategyAction::DestroyPipeline),
        }
    }

    pub fn with_retries(mut self, count: u32, base_delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay_ms = Some(base_delay.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    pub fn with_blacklist_duration(mut self, duration: Duration) -> Self {
        self.blacklist_duration_ms = Some(duration.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay_ms.map(Duration::from_millis)
    }

    pub fn blacklist_duration(&self) -> Option<Duration> {
        self.blacklist_duration_ms.map(Duration::from_millis)
    }
}

/// Default exclusion window for rate-limited pipelines.
pub const DEFAULT_RATE_LIMIT_BLACKLIST: Duration = Duration::from_secs(60);

/// The strategy table the process ships with. Covers every [`ErrorCode`].
pub fn default_strategies() -> Vec<ErrorHandlingStrategy> {
    use ErrorCode::*;
    use StrategyAction::*;

    vec![
        ErrorHandlingStrategy::new(PipelineInitializationFailed, DestroyPipeline),
        ErrorHandlingStrategy::new(PipelineDestroyed, Failover),
        ErrorHandlingStrategy::new(SchedulerNotReady, Ignore),
        ErrorHandlingStrategy::new(ExecutionFailed, Failover),
        ErrorHandlingStrategy::new(ExecutionTimeout, Retry)
            .with_retries(2, Duration::from_millis(500)),
        ErrorHandlingStrategy::new(ConnectionFailed, Retry)
            .with_retries(3, Duration::from_millis(250)),
        ErrorHandlingStrategy::new(AuthenticationFailed, Maintenance),
        ErrorHandlingStrategy::new(RateLimitExceeded, BlacklistTemporary)
            .with_blacklist_duration(DEFAULT_RATE_LIMIT_BLACKLIST),
        ErrorHandlingStrategy::new(InvalidRequest, Ignore),
        ErrorHandlingStrategy::new(SchedulerOverloaded, Ignore),
        ErrorHandlingStrategy::new(NoAvailableInstance, Ignore),
        ErrorHandlingStrategy::new(ResourceExhausted, DestroyPipeline),
        ErrorHandlingStrategy::new(InternalFailure, DestroyPipeline),
    ]
}
