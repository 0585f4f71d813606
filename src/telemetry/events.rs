use crate::context::Stage;
use crate::error::ErrorCode;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Structured events the scheduler emits while moving a request along.
///
/// Events are append-only observations for an external debug sink; nothing in
/// the request path depends on their delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    /// A request passed admission control.
    Admitted {
        execution_id: Uuid,
        trace_id: Uuid,
        request_class: Option<String>,
    },
    /// One stage of a request finished.
    StageCompleted {
        execution_id: Uuid,
        stage: Stage,
        duration: Duration,
    },
    /// An attempt was dispatched to an instance.
    AttemptStarted {
        execution_id: Uuid,
        pipeline_id: String,
        instance_id: Uuid,
        attempt: u32,
    },
    /// An attempt failed and was classified.
    AttemptFailed {
        execution_id: Uuid,
        pipeline_id: String,
        code: ErrorCode,
        attempt: u32,
    },
    /// The scheduler applied a recovery action.
    ActionApplied {
        execution_id: Uuid,
        pipeline_id: String,
        action: RecoveryKind,
    },
    /// The request reached a terminal outcome.
    Completed {
        execution_id: Uuid,
        duration: Duration,
        success: bool,
    },
}

/// Collapsed tag of the applied action, for event consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    Retry,
    Failover,
    Blacklist,
    Maintenance,
    Destroy,
    Surface,
}

impl fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            RecoveryKind::Retry => "retry",
            RecoveryKind::Failover => "failover",
            RecoveryKind::Blacklist => "blacklist",
            RecoveryKind::Maintenance => "maintenance",
            RecoveryKind::Destroy => "destroy",
            RecoveryKind::Surface => "surface",
        };
        f.write_str(tag)
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEvent::Admitted { execution_id, request_class, .. } => {
                write!(
                    f,
                    "Admitted({}, class={})",
                    execution_id,
                    request_class.as_deref().unwrap_or("*")
                )
            }
            TraceEvent::StageCompleted { execution_id, stage, duration } => {
                write!(f, "Stage({}, {:?}, {:?})", execution_id, stage, duration)
            }
            TraceEvent::AttemptStarted { execution_id, pipeline_id, attempt, .. } => {
                write!(f, "Attempt(#{} on {}, {})", attempt, pipeline_id, execution_id)
            }
            TraceEvent::AttemptFailed { execution_id, pipeline_id, code, attempt } => {
                write!(f, "Failed(#{} on {}, {}, {})", attempt, pipeline_id, code, execution_id)
            }
            TraceEvent::ActionApplied { execution_id, pipeline_id, action } => {
                write!(f, "Action({} on {}, {})", action, pipeline_id, execution_id)
            }
            TraceEvent::Completed { execution_id, duration, success } => {
                write!(
                    f,
                    "Completed({}, {:?}, {})",
                    execution_id,
                    duration,
                    if *success { "ok" } else { "err" }
                )
            }
        }
    }
}
