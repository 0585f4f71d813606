//! Convenient re-exports for common Switchyard types.
pub use crate::{
    adapter::{AdapterFactory, CredentialProvider, ProviderAdapter, ProviderResponse},
    config::{
        BalancerConfig, BalancerStrategyKind, BlacklistConfig, PipelineConfig, RetryPolicyConfig,
        RouterConfig, SchedulerConfig,
    },
    context::{ExecutionContext, Stage},
    error::{ErrorCategory, ErrorCode, PipelineError, Recoverability, Severity},
    scheduler::{ExecuteOptions, Scheduler, SchedulerState, SchedulerStats},
    strategy::{ErrorAction, ErrorHandlingStrategy, StrategyAction},
    telemetry::{DebugSink, LogSink, MemorySink, NullSink, TraceEvent},
};
