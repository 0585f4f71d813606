//! Configuration records.
//!
//! The crate consumes an already-validated [`RouterConfig`]; loading and
//! migration happen upstream. `validate` re-checks the invariants so embedders
//! can assert before handing the record over: it repairs nothing.

use crate::strategy::ErrorHandlingStrategy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Per-attempt timeout bounds, milliseconds.
pub const MIN_TIMEOUT_MS: u64 = 1;
pub const MAX_TIMEOUT_MS: u64 = 300_000;

/// Violated configuration invariant.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("pipeline id must not be empty")]
    EmptyPipelineId,
    #[error("duplicate pipeline id: {0}")]
    DuplicatePipelineId(String),
    #[error("pipeline {id}: weight must be > 0")]
    ZeroWeight { id: String },
    #[error("pipeline {id}: timeout {ms}ms outside {MIN_TIMEOUT_MS}..={MAX_TIMEOUT_MS}ms")]
    TimeoutOutOfRange { id: String, ms: u64 },
    #[error("pipeline {id}: max_concurrent_requests must be > 0 when set")]
    ZeroPipelineConcurrency { id: String },
    #[error("scheduler max_concurrent_requests must be > 0")]
    ZeroSchedulerConcurrency,
    #[error("blacklist max_entries must be > 0")]
    ZeroBlacklistCapacity,
    #[error("blacklist max_duration must be >= default_duration")]
    BlacklistDurationInverted,
}

/// Retry/backoff knobs for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u32,
    pub jitter: bool,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2,
            jitter: true,
        }
    }
}

impl RetryPolicyConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Health probe cadence for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub endpoint: Option<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self { enabled: true, interval_ms: 30_000, timeout_ms: 5_000, endpoint: None }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Declarative description of one upstream target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Unique, stable identifier; the dispatch key for request classes.
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Provider adapter kind (e.g. "openai-chat"). Opaque to the scheduler.
    #[serde(rename = "type")]
    pub pipeline_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lower is preferred.
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Per-instance concurrency cap, enforced through balancer accounting.
    #[serde(default)]
    pub max_concurrent_requests: Option<usize>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicyConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Adapter-specific settings, passed through untouched.
    #[serde(default)]
    pub custom_config: serde_json::Value,
}

impl PipelineConfig {
    pub fn new(id: impl Into<String>, pipeline_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            pipeline_type: pipeline_type.into(),
            enabled: true,
            priority: 0,
            weight: 1,
            max_concurrent_requests: None,
            timeout_ms: default_timeout_ms(),
            retry_policy: RetryPolicyConfig::default(),
            health_check: HealthCheckConfig::default(),
            custom_config: serde_json::Value::Null,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::EmptyPipelineId);
        }
        if self.weight == 0 {
            return Err(ConfigError::ZeroWeight { id: self.id.clone() });
        }
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&self.timeout_ms) {
            return Err(ConfigError::TimeoutOutOfRange { id: self.id.clone(), ms: self.timeout_ms });
        }
        if self.max_concurrent_requests == Some(0) {
            return Err(ConfigError::ZeroPipelineConcurrency { id: self.id.clone() });
        }
        Ok(())
    }
}

/// Blacklist sizing and expiry bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub cleanup_interval_ms: u64,
    pub default_duration_ms: u64,
    /// Hard cap: no entry outlives this, whatever the caller asked for.
    pub max_duration_ms: u64,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 128,
            cleanup_interval_ms: 30_000,
            default_duration_ms: 60_000,
            max_duration_ms: 600_000,
        }
    }
}

impl BlacklistConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn default_duration(&self) -> Duration {
        Duration::from_millis(self.default_duration_ms)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }
}

/// Circuit-breaker thresholds layered on the blacklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_time_ms: u64,
    pub request_volume_threshold: u32,
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_time_ms: 30_000,
            request_volume_threshold: 10,
            timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_time(&self) -> Duration {
        Duration::from_millis(self.recovery_time_ms)
    }
}

/// Selection strategy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerStrategyKind {
    #[default]
    #[serde(rename = "roundrobin")]
    RoundRobin,
    Weighted,
    LeastConnections,
    Random,
}

/// Load balancer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub strategy: BalancerStrategyKind,
    pub health_check_interval_ms: u64,
    /// Consecutive failures at or past this mark the instance Unhealthy.
    pub unhealthy_threshold: u32,
    /// Consecutive successes that restore Healthy.
    pub healthy_threshold: u32,
    pub enable_circuit_breaker: bool,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: BalancerStrategyKind::RoundRobin,
            health_check_interval_ms: 30_000,
            unhealthy_threshold: 4,
            healthy_threshold: 1,
            enable_circuit_breaker: true,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl BalancerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Default retry budget per request; `ExecuteOptions.max_retries` overrides.
    pub max_retries: u32,
    pub default_timeout_ms: u64,
    pub max_concurrent_requests: usize,
    pub shutdown_timeout_ms: u64,
    pub enable_metrics: bool,
    pub enable_health_checks: bool,
    /// Activates blacklist-based tripping.
    pub enable_circuit_breaker: bool,
    /// Per-code overrides merged over the default strategy table.
    pub error_handling_strategies: Vec<ErrorHandlingStrategy>,
    pub blacklist: BlacklistConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_timeout_ms: 30_000,
            max_concurrent_requests: 256,
            shutdown_timeout_ms: 10_000,
            enable_metrics: true,
            enable_health_checks: true,
            enable_circuit_breaker: true,
            error_handling_strategies: Vec::new(),
            blacklist: BlacklistConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// The validated record the whole subsystem is built from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub scheduler: SchedulerConfig,
    pub balancer: BalancerConfig,
    pub pipelines: Vec<PipelineConfig>,
    pub debug: bool,
    pub log_level: Option<String>,
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_concurrent_requests == 0 {
            return Err(ConfigError::ZeroSchedulerConcurrency);
        }
        if self.scheduler.blacklist.max_entries == 0 {
            return Err(ConfigError::ZeroBlacklistCapacity);
        }
        if self.scheduler.blacklist.max_duration_ms < self.scheduler.blacklist.default_duration_ms {
            return Err(ConfigError::BlacklistDurationInverted);
        }
        let mut seen = HashSet::new();
        for pipeline in &self.pipelines {
            pipeline.validate()?;
            if !seen.insert(pipeline.id.as_str()) {
                return Err(ConfigError::DuplicatePipelineId(pipeline.id.clone()));
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

fn default_timeout_ms() -> u64 {
    30_000
}
