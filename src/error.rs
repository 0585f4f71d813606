//! Error record and closed failure-mode taxonomy.
//!
//! Every failure that crosses a component boundary is a [`PipelineError`]: a
//! numeric code from a closed enumeration plus the classification the error
//! handler and the caller act on. Instances raise these; the strategy table
//! maps them to recovery actions; the scheduler surfaces exactly one to the
//! caller when the budget is spent.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Closed, numerically-coded enumeration of failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// Instance initialize hook failed; the instance is never reused.
    PipelineInitializationFailed = 1001,
    /// Operation addressed a destroyed instance.
    PipelineDestroyed = 1002,
    /// Scheduler is not accepting requests (not Ready).
    SchedulerNotReady = 1003,
    /// Provider hook failed without a more specific classification.
    ExecutionFailed = 2001,
    /// Wall-clock exceeded the per-attempt timeout.
    ExecutionTimeout = 2002,
    /// Transport-level failure reaching the upstream.
    ConnectionFailed = 3001,
    /// Upstream rejected the credentials.
    AuthenticationFailed = 4001,
    /// Upstream applied rate limiting (429-class).
    RateLimitExceeded = 5001,
    /// Upstream rejected the request as malformed; retrying cannot help.
    InvalidRequest = 6001,
    /// Admission control rejected the request: too many in flight.
    SchedulerOverloaded = 7001,
    /// No healthy, non-blacklisted instance matched the request.
    NoAvailableInstance = 7002,
    /// Callee ran out of a process-wide resource.
    ResourceExhausted = 7003,
    /// Unrecoverable internal failure affecting the whole fleet.
    InternalFailure = 7004,
}

impl ErrorCode {
    /// All codes, in numeric order. The default strategy table covers each.
    pub const ALL: [ErrorCode; 13] = [
        ErrorCode::PipelineInitializationFailed,
        ErrorCode::PipelineDestroyed,
        ErrorCode::SchedulerNotReady,
        ErrorCode::ExecutionFailed,
        ErrorCode::ExecutionTimeout,
        ErrorCode::ConnectionFailed,
        ErrorCode::AuthenticationFailed,
        ErrorCode::RateLimitExceeded,
        ErrorCode::InvalidRequest,
        ErrorCode::SchedulerOverloaded,
        ErrorCode::NoAvailableInstance,
        ErrorCode::ResourceExhausted,
        ErrorCode::InternalFailure,
    ];

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::PipelineInitializationFailed
            | ErrorCode::PipelineDestroyed
            | ErrorCode::SchedulerNotReady => ErrorCategory::Lifecycle,
            ErrorCode::ExecutionFailed => ErrorCategory::Execution,
            ErrorCode::ExecutionTimeout => ErrorCategory::Timeout,
            ErrorCode::ConnectionFailed => ErrorCategory::Network,
            ErrorCode::AuthenticationFailed => ErrorCategory::Authentication,
            ErrorCode::RateLimitExceeded => ErrorCategory::RateLimit,
            ErrorCode::InvalidRequest => ErrorCategory::Validation,
            ErrorCode::SchedulerOverloaded
            | ErrorCode::NoAvailableInstance
            | ErrorCode::ResourceExhausted
            | ErrorCode::InternalFailure => ErrorCategory::System,
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            ErrorCode::ExecutionTimeout | ErrorCode::ConnectionFailed => Severity::Low,
            ErrorCode::ExecutionFailed
            | ErrorCode::RateLimitExceeded
            | ErrorCode::SchedulerOverloaded
            | ErrorCode::InvalidRequest => Severity::Medium,
            ErrorCode::PipelineInitializationFailed
            | ErrorCode::PipelineDestroyed
            | ErrorCode::SchedulerNotReady
            | ErrorCode::AuthenticationFailed
            | ErrorCode::NoAvailableInstance => Severity::High,
            ErrorCode::ResourceExhausted | ErrorCode::InternalFailure => Severity::Fatal,
        }
    }

    pub fn recoverability(self) -> Recoverability {
        match self {
            ErrorCode::ExecutionTimeout
            | ErrorCode::ExecutionFailed
            | ErrorCode::ConnectionFailed
            | ErrorCode::AuthenticationFailed
            | ErrorCode::RateLimitExceeded
            | ErrorCode::SchedulerOverloaded
            | ErrorCode::NoAvailableInstance => Recoverability::Recoverable,
            ErrorCode::PipelineInitializationFailed
            | ErrorCode::PipelineDestroyed
            | ErrorCode::SchedulerNotReady
            | ErrorCode::InvalidRequest
            | ErrorCode::ResourceExhausted
            | ErrorCode::InternalFailure => Recoverability::NonRecoverable,
        }
    }

    pub fn impact(self) -> Impact {
        match self {
            ErrorCode::ExecutionFailed
            | ErrorCode::ExecutionTimeout
            | ErrorCode::InvalidRequest => Impact::SingleModule,
            ErrorCode::PipelineInitializationFailed
            | ErrorCode::PipelineDestroyed
            | ErrorCode::ConnectionFailed
            | ErrorCode::AuthenticationFailed
            | ErrorCode::RateLimitExceeded => Impact::SinglePipeline,
            ErrorCode::SchedulerNotReady
            | ErrorCode::SchedulerOverloaded
            | ErrorCode::NoAvailableInstance
            | ErrorCode::ResourceExhausted
            | ErrorCode::InternalFailure => Impact::AllPipelines,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u16())
    }
}

/// Broad failure domain, used for filtering and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Lifecycle,
    Execution,
    Network,
    Authentication,
    RateLimit,
    Validation,
    System,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Fatal,
}

/// Whether a retry by the caller might succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recoverability {
    Recoverable,
    NonRecoverable,
}

/// Blast radius of the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    SingleModule,
    SinglePipeline,
    AllPipelines,
}

/// The error record raised by instances and surfaced to callers.
#[derive(Debug)]
pub struct PipelineError {
    code: ErrorCode,
    message: String,
    category: ErrorCategory,
    severity: Severity,
    recoverability: Recoverability,
    impact: Impact,
    component: Option<&'static str>,
    pipeline_id: Option<String>,
    instance_id: Option<Uuid>,
    timestamp_millis: u64,
    retry_after: Option<Duration>,
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PipelineError {
    /// Build an error with the classification the code implies.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            category: code.category(),
            severity: code.severity(),
            recoverability: code.recoverability(),
            impact: code.impact(),
            component: None,
            pipeline_id: None,
            instance_id: None,
            timestamp_millis: unix_millis(),
            retry_after: None,
            cause: None,
        }
    }

    pub fn with_component(mut self, component: &'static str) -> Self {
        self.component = Some(component);
        self
    }

    pub fn with_pipeline(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_id = Some(pipeline_id.into());
        self
    }

    pub fn with_instance(mut self, instance_id: Uuid) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    /// Provider-supplied minimum wait, honored for rate-limit blacklisting.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Escalate severity beyond the code's default. Downgrades are ignored.
    pub fn escalate(mut self, severity: Severity) -> Self {
        if severity > self.severity {
            self.severity = severity;
        }
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn recoverability(&self) -> Recoverability {
        self.recoverability
    }

    pub fn impact(&self) -> Impact {
        self.impact
    }

    pub fn component(&self) -> Option<&str> {
        self.component
    }

    pub fn pipeline_id(&self) -> Option<&str> {
        self.pipeline_id.as_deref()
    }

    pub fn instance_id(&self) -> Option<Uuid> {
        self.instance_id
    }

    /// Milliseconds since the Unix epoch at construction.
    pub fn timestamp_millis(&self) -> u64 {
        self.timestamp_millis
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn is_timeout(&self) -> bool {
        self.category == ErrorCategory::Timeout
    }

    pub fn is_rate_limited(&self) -> bool {
        self.category == ErrorCategory::RateLimit
    }

    pub fn is_authentication(&self) -> bool {
        self.category == ErrorCategory::Authentication
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverability == Recoverability::Recoverable
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(pipeline) = &self.pipeline_id {
            write!(f, " [pipeline={}", pipeline)?;
            if let Some(instance) = self.instance_id {
                write!(f, " instance={}", instance)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[test]
    fn classification_follows_code() {
        let err = PipelineError::new(ErrorCode::RateLimitExceeded, "429 from upstream");
        assert_eq!(err.category(), ErrorCategory::RateLimit);
        assert_eq!(err.severity(), Severity::Medium);
        assert!(err.is_recoverable());
        assert_eq!(err.impact(), Impact::SinglePipeline);
    }

    #[test]
    fn every_code_has_a_consistent_classification() {
        for code in ErrorCode::ALL {
            let err = PipelineError::new(code, "probe");
            assert_eq!(err.category(), code.category());
            assert_eq!(err.severity(), code.severity());
            assert_eq!(err.recoverability(), code.recoverability());
        }
    }

    #[test]
    fn display_names_code_and_attempted_instance() {
        let instance = Uuid::new_v4();
        let err = PipelineError::new(ErrorCode::ConnectionFailed, "connect refused")
            .with_pipeline("openai-main")
            .with_instance(instance);
        let msg = err.to_string();
        assert!(msg.contains("ConnectionFailed(3001)"));
        assert!(msg.contains("openai-main"));
        assert!(msg.contains(&instance.to_string()));
    }

    #[test]
    fn source_chains_to_cause() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err =
            PipelineError::new(ErrorCode::ConnectionFailed, "transport failed").with_cause(io_err);
        let src = err.source().unwrap();
        assert_eq!(src.to_string(), "refused");
    }

    #[test]
    fn escalate_never_downgrades() {
        let err = PipelineError::new(ErrorCode::ResourceExhausted, "oom").escalate(Severity::Low);
        assert_eq!(err.severity(), Severity::Fatal);

        let err = PipelineError::new(ErrorCode::ConnectionFailed, "flaky").escalate(Severity::High);
        assert_eq!(err.severity(), Severity::High);
    }

    #[test]
    fn fatal_codes_report_fleet_impact() {
        let err = PipelineError::new(ErrorCode::InternalFailure, "corrupted state");
        assert!(err.is_fatal());
        assert_eq!(err.impact(), Impact::AllPipelines);
    }

    #[test]
    fn retry_after_rides_on_rate_limit_errors() {
        let err = PipelineError::new(ErrorCode::RateLimitExceeded, "slow down")
            .with_retry_after(Duration::from_millis(500));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(500)));
    }
}
