//! Per-request execution context and payload sanitization.
//!
//! One context tree per request, owned by the dispatching task. Children hold
//! a non-owning back-reference (the parent's id) and are adopted into the
//! parent's list when their work completes; nothing keeps a destroyed parent
//! alive.

use serde_json::Value;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Replacement written over sensitive payload fields.
pub const REDACTION_MARKER: &str = "[REDACTED]";

const SENSITIVE_KEYS: [&str; 6] = ["password", "token", "apikey", "secret", "auth", "privatekey"];

/// Where a request currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    RequestInit,
    Scheduling,
    PipelineSelection,
    ProviderExecution,
    ResponseProcessing,
    Completion,
    ErrorHandling,
}

/// Duration spent in one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTiming {
    pub stage: Stage,
    pub duration: Duration,
}

/// Structured identifiers and timings for one request.
#[derive(Debug)]
pub struct ExecutionContext {
    execution_id: Uuid,
    request_id: Uuid,
    trace_id: Uuid,
    session_id: Option<String>,
    stage: Stage,
    started: Instant,
    stage_entered: Instant,
    stage_timings: Vec<StageTiming>,
    request: Option<Value>,
    response: Option<Value>,
    error_summary: Option<String>,
    metadata: serde_json::Map<String, Value>,
    parent: Option<Uuid>,
    children: Vec<ExecutionContext>,
    completed: bool,
}

impl ExecutionContext {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            execution_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            session_id: None,
            stage: Stage::RequestInit,
            started: now,
            stage_entered: now,
            stage_timings: Vec::new(),
            request: None,
            response: None,
            error_summary: None,
            metadata: serde_json::Map::new(),
            parent: None,
            children: Vec::new(),
            completed: false,
        }
    }

    /// Context for a nested stage; carries the trace and a back-reference to
    /// this context's id.
    pub fn spawn_child(&self) -> ExecutionContext {
        let now = Instant::now();
        ExecutionContext {
            execution_id: Uuid::new_v4(),
            request_id: self.request_id,
            trace_id: self.trace_id,
            session_id: self.session_id.clone(),
            stage: self.stage,
            started: now,
            stage_entered: now,
            stage_timings: Vec::new(),
            request: None,
            response: None,
            error_summary: None,
            metadata: serde_json::Map::new(),
            parent: Some(self.execution_id),
            children: Vec::new(),
            completed: false,
        }
    }

    /// Take ownership of a finished child.
    pub fn adopt(&mut self, child: ExecutionContext) {
        self.children.push(child);
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Move to the next stage, closing the timing of the current one.
    pub fn advance(&mut self, stage: Stage) {
        if self.completed {
            return;
        }
        let now = Instant::now();
        self.stage_timings.push(StageTiming {
            stage: self.stage,
            duration: now.duration_since(self.stage_entered),
        });
        self.stage = stage;
        self.stage_entered = now;
    }

    /// Terminal. Closes the final stage; later mutations are ignored.
    pub fn complete(&mut self) {
        if self.completed {
            return;
        }
        let now = Instant::now();
        self.stage_timings.push(StageTiming {
            stage: self.stage,
            duration: now.duration_since(self.stage_entered),
        });
        self.completed = true;
    }

    /// Attach the (sanitized) request payload.
    pub fn set_request(&mut self, mut payload: Value) {
        sanitize(&mut payload);
        self.request = Some(payload);
    }

    /// Attach the (sanitized) response payload.
    pub fn set_response(&mut self, mut payload: Value) {
        sanitize(&mut payload);
        self.response = Some(payload);
    }

    pub fn record_error(&mut self, error: &crate::error::PipelineError) {
        self.error_summary = Some(error.to_string());
    }

    pub fn insert_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    pub fn children(&self) -> &[ExecutionContext] {
        &self.children
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn stage_timings(&self) -> &[StageTiming] {
        &self.stage_timings
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn request(&self) -> Option<&Value> {
        self.request.as_ref()
    }

    pub fn response(&self) -> Option<&Value> {
        self.response.as_ref()
    }

    pub fn error_summary(&self) -> Option<&str> {
        self.error_summary.as_deref()
    }

    pub fn metadata(&self) -> &serde_json::Map<String, Value> {
        &self.metadata
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace the value of any sensitive key, recursively.
///
/// Key comparison is case-insensitive and ignores underscores, so `apiKey`,
/// `api_key`, and `APIKEY` all match.
pub fn sanitize(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *entry = Value::String(REDACTION_MARKER.to_string());
                } else {
                    sanitize(entry);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                sanitize(item);
            }
        }
        _ => {}
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let normalized: String =
        key.chars().filter(|c| *c != '_').flat_map(|c| c.to_lowercase()).collect();
    SENSITIVE_KEYS.contains(&normalized.as_str())
}
