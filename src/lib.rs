#![forbid(unsafe_code)]

//! # Switchyard
//!
//! Provider-multiplexing request scheduler: accept a logical request, pick a
//! concrete upstream from a pool of equivalent pipelines, execute it
//! end-to-end, and keep the pool honest: health probing, temporary
//! blacklisting, credential-refresh maintenance, and retry/failover across
//! instances.
//!
//! ## Features
//!
//! - **Scheduler** with admission control, a bounded retry/failover loop, and
//!   live fleet reconfiguration
//! - **Pipeline instances** with an atomics-based lifecycle and health state
//!   machine (EWMA latency, consecutive-error streaks)
//! - **Load balancing** strategies: round-robin, smooth weighted round-robin,
//!   least-connections, random
//! - **Data-driven error recovery**: a per-code strategy table mapping
//!   failures to retry / failover / blacklist / maintenance / destroy
//! - **Auto-expiring blacklist** bounded in size and duration
//! - **Structured tracing** to pluggable, never-blocking debug sinks
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use switchyard::{
//!     AdapterFactory, ExecuteOptions, PipelineConfig, RouterConfig, Scheduler,
//! };
//!
//! # fn factory() -> Arc<dyn AdapterFactory> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RouterConfig {
//!         pipelines: vec![
//!             PipelineConfig::new("openai-main", "openai-chat"),
//!             PipelineConfig::new("anthropic-main", "anthropic-chat"),
//!         ],
//!         ..RouterConfig::default()
//!     };
//!     config.validate()?;
//!
//!     let scheduler = Scheduler::builder(config, factory()).build();
//!     scheduler.initialize().await?;
//!
//!     let response = scheduler
//!         .execute(
//!             serde_json::json!({"model": "v-large", "messages": []}),
//!             ExecuteOptions::default().with_request_class("openai-main"),
//!         )
//!         .await?;
//!     let body = response.into_value().await?;
//!     println!("{body}");
//!
//!     scheduler.shutdown().await;
//!     Ok(())
//! }
//! ```

mod adapter;
mod backoff;
mod balancer;
mod blacklist;
mod clock;
mod config;
mod context;
mod error;
mod handler;
mod instance;
mod jitter;
mod scheduler;
mod sleeper;
mod strategy;

pub mod telemetry;

// Re-exports
pub use adapter::{
    AdapterFactory, ChunkStream, CredentialProvider, NoCredentials, ProviderAdapter,
    ProviderResponse,
};
pub use backoff::Backoff;
pub use balancer::{BalancerStats, LoadBalancer};
pub use blacklist::{Blacklist, BlacklistEntry};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    BalancerConfig, BalancerStrategyKind, BlacklistConfig, CircuitBreakerConfig, ConfigError,
    HealthCheckConfig, PipelineConfig, RetryPolicyConfig, RouterConfig, SchedulerConfig,
    MAX_TIMEOUT_MS, MIN_TIMEOUT_MS,
};
pub use context::{sanitize, ExecutionContext, Stage, StageTiming, REDACTION_MARKER};
pub use error::{
    ErrorCategory, ErrorCode, Impact, PipelineError, Recoverability, Severity,
};
pub use handler::{CustomHandler, ErrorHandlerCenter};
pub use instance::{
    Health, HealthThresholds, InstanceState, InstanceStatus, PipelineInstance,
};
pub use jitter::Jitter;
pub use scheduler::{
    ExecuteOptions, Scheduler, SchedulerBuilder, SchedulerState, SchedulerStats,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use strategy::{
    default_strategies, ErrorAction, ErrorHandlingStrategy, StrategyAction,
    DEFAULT_RATE_LIMIT_BLACKLIST,
};

pub mod prelude;
