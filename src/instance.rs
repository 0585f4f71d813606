//! Pipeline instance: one live worker bound to one upstream target.
//!
//! State and health live in atomics so many requests can run against one
//! instance concurrently; `Running` is a coarse activity flag, not an
//! exclusive lock. All transitions happen here; the scheduler owns the
//! instance and nothing else mutates it.

use crate::adapter::{ProviderAdapter, ProviderResponse};
use crate::clock::{Clock, MonotonicClock};
use crate::config::PipelineConfig;
use crate::context::ExecutionContext;
use crate::error::{ErrorCode, PipelineError};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

const STATE_CREATING: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_RUNNING: u8 = 3;
const STATE_ERROR: u8 = 4;
const STATE_MAINTENANCE: u8 = 5;
const STATE_DESTROYING: u8 = 6;
const STATE_DESTROYED: u8 = 7;

const HEALTH_UNKNOWN: u8 = 0;
const HEALTH_HEALTHY: u8 = 1;
const HEALTH_DEGRADED: u8 = 2;
const HEALTH_UNHEALTHY: u8 = 3;

/// Smoothing factor for the response-time EWMA.
const EWMA_ALPHA: f64 = 0.1;

/// Success-rate floor below which an instance counts as degraded.
const DEGRADED_SUCCESS_RATE: f64 = 0.8;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Creating,
    Initializing,
    Ready,
    Running,
    Error,
    Maintenance,
    Destroying,
    Destroyed,
}

impl InstanceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_CREATING => InstanceState::Creating,
            STATE_INITIALIZING => InstanceState::Initializing,
            STATE_READY => InstanceState::Ready,
            STATE_RUNNING => InstanceState::Running,
            STATE_ERROR => InstanceState::Error,
            STATE_MAINTENANCE => InstanceState::Maintenance,
            STATE_DESTROYING => InstanceState::Destroying,
            _ => InstanceState::Destroyed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            InstanceState::Creating => STATE_CREATING,
            InstanceState::Initializing => STATE_INITIALIZING,
            InstanceState::Ready => STATE_READY,
            InstanceState::Running => STATE_RUNNING,
            InstanceState::Error => STATE_ERROR,
            InstanceState::Maintenance => STATE_MAINTENANCE,
            InstanceState::Destroying => STATE_DESTROYING,
            InstanceState::Destroyed => STATE_DESTROYED,
        }
    }
}

/// Probed health of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl Health {
    /// Usable for selection: healthy or degraded-but-working.
    pub fn is_usable(self) -> bool {
        matches!(self, Health::Healthy | Health::Degraded)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            HEALTH_HEALTHY => Health::Healthy,
            HEALTH_DEGRADED => Health::Degraded,
            HEALTH_UNHEALTHY => Health::Unhealthy,
            _ => Health::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Health::Unknown => HEALTH_UNKNOWN,
            Health::Healthy => HEALTH_HEALTHY,
            Health::Degraded => HEALTH_DEGRADED,
            Health::Unhealthy => HEALTH_UNHEALTHY,
        }
    }
}

/// Consecutive-error thresholds governing the health mapping.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    /// At or past this many consecutive failures the instance is Unhealthy.
    pub unhealthy: u32,
    /// Consecutive successes that restore Healthy (a single probe success
    /// resets the failure streak; higher values require a longer streak).
    pub healthy: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self { unhealthy: 4, healthy: 1 }
    }
}

/// Read-only copy of an instance's state and metrics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceStatus {
    pub instance_id: Uuid,
    pub pipeline_id: String,
    pub state: InstanceState,
    pub health: Health,
    pub enabled: bool,
    pub in_maintenance: bool,
    pub request_count: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub last_error: Option<String>,
}

/// One live worker bound to one [`PipelineConfig`].
pub struct PipelineInstance {
    instance_id: Uuid,
    config: PipelineConfig,
    adapter: Arc<dyn ProviderAdapter>,
    clock: Arc<dyn Clock>,
    thresholds: HealthThresholds,

    state: AtomicU8,
    health: AtomicU8,
    enabled: AtomicBool,
    maintenance: AtomicBool,

    request_count: AtomicU64,
    error_count: AtomicU64,
    consecutive_errors: AtomicU32,
    consecutive_successes: AtomicU32,
    avg_response_bits: AtomicU64,
    inflight: AtomicUsize,
    last_error: Mutex<Option<String>>,
    last_error_at_millis: AtomicU64,
    last_success_at_millis: AtomicU64,
    last_probe_at_millis: AtomicU64,
}

impl PipelineInstance {
    pub fn new(
        config: PipelineConfig,
        adapter: Arc<dyn ProviderAdapter>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self::with_clock(config, adapter, thresholds, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(
        config: PipelineConfig,
        adapter: Arc<dyn ProviderAdapter>,
        thresholds: HealthThresholds,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let enabled = config.enabled;
        Self {
            instance_id: Uuid::new_v4(),
            config,
            adapter,
            clock,
            thresholds,
            state: AtomicU8::new(STATE_CREATING),
            health: AtomicU8::new(HEALTH_UNKNOWN),
            enabled: AtomicBool::new(enabled),
            maintenance: AtomicBool::new(false),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            avg_response_bits: AtomicU64::new(0f64.to_bits()),
            inflight: AtomicUsize::new(0),
            last_error: Mutex::new(None),
            last_error_at_millis: AtomicU64::new(0),
            last_success_at_millis: AtomicU64::new(0),
            last_probe_at_millis: AtomicU64::new(0),
        }
    }

    /// Creating → Initializing → Ready. On failure the instance lands in
    /// Error and the returned error is non-recoverable for it.
    pub async fn initialize(&self) -> Result<(), PipelineError> {
        if self
            .state
            .compare_exchange(
                STATE_CREATING,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(PipelineError::new(
                ErrorCode::PipelineInitializationFailed,
                format!("instance {} initialized twice", self.instance_id),
            )
            .with_pipeline(self.config.id.clone())
            .with_instance(self.instance_id));
        }

        match self.adapter.initialize().await {
            Ok(()) => {
                self.set_state(InstanceState::Ready);
                self.recompute_health();
                tracing::info!(
                    pipeline = %self.config.id,
                    instance = %self.instance_id,
                    "pipeline instance ready"
                );
                Ok(())
            }
            Err(cause) => {
                self.set_state(InstanceState::Error);
                self.health.store(HEALTH_UNHEALTHY, Ordering::Release);
                tracing::error!(
                    pipeline = %self.config.id,
                    instance = %self.instance_id,
                    error = %cause,
                    "pipeline instance failed to initialize"
                );
                Err(PipelineError::new(
                    ErrorCode::PipelineInitializationFailed,
                    format!("initialize failed: {}", cause),
                )
                .with_pipeline(self.config.id.clone())
                .with_instance(self.instance_id)
                .with_cause(cause))
            }
        }
    }

    /// Run one request under the given per-attempt timeout.
    ///
    /// Accepts requests while alive (Ready, Running, or recovering from
    /// Error); the duration of every attempt (success, failure, or timeout)
    /// feeds the response-time EWMA.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        payload: &Value,
        timeout: Duration,
    ) -> Result<ProviderResponse, PipelineError> {
        match self.state() {
            InstanceState::Ready | InstanceState::Running | InstanceState::Error => {}
            InstanceState::Destroyed | InstanceState::Destroying => {
                return Err(self.classify(ErrorCode::PipelineDestroyed, "instance destroyed"));
            }
            other => {
                return Err(self.classify(
                    ErrorCode::ExecutionFailed,
                    format!("instance not accepting requests (state: {:?})", other),
                ));
            }
        }

        self.inflight.fetch_add(1, Ordering::AcqRel);
        let _ = self.state.compare_exchange(
            STATE_READY,
            STATE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        // Restores state on every exit path, cancellation included.
        let _serving = ServingToken { instance: self };

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.adapter.execute(ctx, payload)).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(response)) => {
                self.record_success(elapsed);
                Ok(response)
            }
            Ok(Err(error)) => {
                self.record_failure(elapsed, &error);
                Err(error
                    .with_pipeline(self.config.id.clone())
                    .with_instance(self.instance_id))
            }
            Err(_) => {
                let error = self.classify(
                    ErrorCode::ExecutionTimeout,
                    format!("attempt exceeded {:?}", timeout),
                );
                self.record_failure(elapsed, &error);
                Err(error)
            }
        }
    }

    /// Ready/Error → Destroying → Destroyed. Idempotent; a destroyed instance
    /// is never selectable again.
    pub async fn destroy(&self) -> Result<(), PipelineError> {
        let current = self.state.load(Ordering::Acquire);
        if current == STATE_DESTROYED || current == STATE_DESTROYING {
            return Ok(());
        }
        self.set_state(InstanceState::Destroying);

        let result = self.adapter.destroy().await;
        self.set_state(InstanceState::Destroyed);
        self.health.store(HEALTH_UNHEALTHY, Ordering::Release);
        tracing::info!(
            pipeline = %self.config.id,
            instance = %self.instance_id,
            "pipeline instance destroyed"
        );

        result.map_err(|cause| {
            PipelineError::new(ErrorCode::ExecutionFailed, format!("destroy hook failed: {}", cause))
                .with_pipeline(self.config.id.clone())
                .with_instance(self.instance_id)
        })
    }

    /// Probe the adapter and recompute health. Rate-limited to the configured
    /// probe interval; early calls return the cached health.
    pub async fn perform_health_check(&self) -> Health {
        let now = self.clock.now_millis();
        let last = self.last_probe_at_millis.load(Ordering::Acquire);
        let interval = self.config.health_check.interval_ms;
        if last != 0 && now.saturating_sub(last) < interval {
            return self.health();
        }
        self.last_probe_at_millis.store(now, Ordering::Release);

        if self.config.health_check.enabled && !self.is_terminal() {
            let probe =
                tokio::time::timeout(self.config.health_check.timeout(), self.adapter.health_check())
                    .await;
            match probe {
                Ok(true) => {
                    self.consecutive_errors.store(0, Ordering::Release);
                    let streak = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
                    // A recovered upstream lifts the instance out of Error.
                    if streak >= self.thresholds.healthy {
                        let _ = self.state.compare_exchange(
                            STATE_ERROR,
                            STATE_READY,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                    }
                }
                Ok(false) | Err(_) => {
                    self.consecutive_successes.store(0, Ordering::Release);
                    self.consecutive_errors.fetch_add(1, Ordering::AcqRel);
                }
            }
        }

        self.recompute_health()
    }

    /// Re-derive [`Health`] from flags, state, and metrics.
    pub fn recompute_health(&self) -> Health {
        let consecutive = self.consecutive_errors.load(Ordering::Acquire);
        let state = self.state();

        let health = if !self.enabled.load(Ordering::Acquire)
            || self.maintenance.load(Ordering::Acquire)
            || state == InstanceState::Error
            || self.is_terminal()
            || consecutive >= self.thresholds.unhealthy
        {
            Health::Unhealthy
        } else if consecutive > 0 || self.success_rate() < DEGRADED_SUCCESS_RATE {
            Health::Degraded
        } else {
            Health::Healthy
        };

        self.health.store(health.as_u8(), Ordering::Release);
        health
    }

    /// Strictly healthy: probed Healthy, enabled, not in maintenance, Ready.
    /// This is the fleet-level health predicate, not the selection filter.
    pub fn is_healthy(&self) -> bool {
        self.health() == Health::Healthy
            && self.enabled.load(Ordering::Acquire)
            && !self.maintenance.load(Ordering::Acquire)
            && self.state() == InstanceState::Ready
    }

    /// Eligible for selection: alive (Ready or serving), enabled, not in
    /// maintenance, and not probed Unhealthy. A degraded instance stays in
    /// rotation; the weighted strategy discounts it instead.
    pub fn is_selectable(&self) -> bool {
        self.health().is_usable()
            && self.enabled.load(Ordering::Acquire)
            && !self.maintenance.load(Ordering::Acquire)
            && matches!(self.state(), InstanceState::Ready | InstanceState::Running)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        self.recompute_health();
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        self.recompute_health();
    }

    /// Entering maintenance forces the Maintenance state; leaving it restores
    /// Ready (when the instance was not destroyed meanwhile).
    pub fn set_maintenance(&self, maintenance: bool) {
        self.maintenance.store(maintenance, Ordering::Release);
        if maintenance {
            if !self.is_terminal() {
                self.set_state(InstanceState::Maintenance);
            }
            tracing::warn!(
                pipeline = %self.config.id,
                instance = %self.instance_id,
                "pipeline instance entering maintenance"
            );
        } else {
            let _ = self.state.compare_exchange(
                STATE_MAINTENANCE,
                STATE_READY,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        self.recompute_health();
    }

    pub fn state(&self) -> InstanceState {
        InstanceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn health(&self) -> Health {
        Health::from_u8(self.health.load(Ordering::Acquire))
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn pipeline_id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn in_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::Acquire)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Acquire)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Acquire)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Acquire)
    }

    /// Fraction of requests that succeeded; 1.0 before any traffic so a fresh
    /// instance is not born degraded.
    pub fn success_rate(&self) -> f64 {
        let requests = self.request_count.load(Ordering::Acquire);
        if requests == 0 {
            return 1.0;
        }
        let errors = self.error_count.load(Ordering::Acquire);
        (requests.saturating_sub(errors)) as f64 / requests as f64
    }

    /// EWMA of attempt durations (α = 0.1), success and failure alike.
    pub fn average_response_time(&self) -> Duration {
        Duration::from_secs_f64(
            f64::from_bits(self.avg_response_bits.load(Ordering::Acquire)).max(0.0) / 1_000.0,
        )
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            instance_id: self.instance_id,
            pipeline_id: self.config.id.clone(),
            state: self.state(),
            health: self.health(),
            enabled: self.is_enabled(),
            in_maintenance: self.in_maintenance(),
            request_count: self.request_count(),
            error_count: self.error_count(),
            consecutive_errors: self.consecutive_errors(),
            success_rate: self.success_rate(),
            average_response_time_ms: f64::from_bits(
                self.avg_response_bits.load(Ordering::Acquire),
            ),
            last_error: self.last_error(),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state(), InstanceState::Destroying | InstanceState::Destroyed)
    }

    fn record_success(&self, elapsed: Duration) {
        self.observe_duration(elapsed);
        self.request_count.fetch_add(1, Ordering::AcqRel);
        self.consecutive_errors.store(0, Ordering::Release);
        self.consecutive_successes.fetch_add(1, Ordering::AcqRel);
        self.last_success_at_millis.store(self.clock.now_millis(), Ordering::Release);
        // A success also clears a lingering Error state.
        let _ = self.state.compare_exchange(
            STATE_ERROR,
            STATE_READY,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.recompute_health();
    }

    fn record_failure(&self, elapsed: Duration, error: &PipelineError) {
        self.observe_duration(elapsed);
        self.request_count.fetch_add(1, Ordering::AcqRel);
        self.error_count.fetch_add(1, Ordering::AcqRel);
        self.consecutive_successes.store(0, Ordering::Release);
        let streak = self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_error_at_millis.store(self.clock.now_millis(), Ordering::Release);
        *self.last_error.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(error.to_string());

        // Error is a coarse health flag: a lone transient failure keeps the
        // instance serving, a streak past the threshold takes it out.
        if streak >= self.thresholds.unhealthy {
            let _ = self.state.compare_exchange(
                STATE_RUNNING,
                STATE_ERROR,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        tracing::debug!(
            pipeline = %self.config.id,
            instance = %self.instance_id,
            streak,
            error = %error,
            "pipeline attempt failed"
        );
        self.recompute_health();
    }

    fn observe_duration(&self, elapsed: Duration) {
        let sample_ms = elapsed.as_secs_f64() * 1_000.0;
        // CAS loop: concurrent observers fold in one sample each.
        loop {
            let current_bits = self.avg_response_bits.load(Ordering::Acquire);
            let current = f64::from_bits(current_bits);
            let next = if self.request_count.load(Ordering::Acquire) == 0 {
                sample_ms
            } else {
                current + EWMA_ALPHA * (sample_ms - current)
            };
            if self
                .avg_response_bits
                .compare_exchange(
                    current_bits,
                    next.to_bits(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }
    }

    fn set_state(&self, state: InstanceState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn classify(&self, code: ErrorCode, message: impl Into<String>) -> PipelineError {
        PipelineError::new(code, message)
            .with_pipeline(self.config.id.clone())
            .with_instance(self.instance_id)
    }
}

impl std::fmt::Debug for PipelineInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineInstance")
            .field("instance_id", &self.instance_id)
            .field("pipeline_id", &self.config.id)
            .field("state", &self.state())
            .field("health", &self.health())
            .finish()
    }
}

/// In-flight marker; the last one out restores Ready (unless a failure streak
/// moved the instance to Error meanwhile).
struct ServingToken<'a> {
    instance: &'a PipelineInstance,
}

impl Drop for ServingToken<'_> {
    fn drop(&mut self) {
        if self.instance.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = self.instance.state.compare_exchange(
                STATE_RUNNING,
                STATE_READY,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Adapter that replays a script of outcomes.
    struct ScriptedAdapter {
        script: Mutex<VecDeque<Result<Value, PipelineError>>>,
        delay: Option<Duration>,
        init_result: Mutex<Option<PipelineError>>,
        healthy: AtomicBool,
    }

    impl ScriptedAdapter {
        fn always_ok() -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                delay: None,
                init_result: Mutex::new(None),
                healthy: AtomicBool::new(true),
            }
        }

        fn with_script(outcomes: Vec<Result<Value, PipelineError>>) -> Self {
            Self {
                script: Mutex::new(outcomes.into()),
                delay: None,
                init_result: Mutex::new(None),
                healthy: AtomicBool::new(true),
            }
        }

        fn slow(delay: Duration) -> Self {
            Self { delay: Some(delay), ..Self::always_ok() }
        }

        fn failing_init(error: PipelineError) -> Self {
            Self { init_result: Mutex::new(Some(error)), ..Self::always_ok() }
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        async fn initialize(&self) -> Result<(), PipelineError> {
            match self.init_result.lock().unwrap().take() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }

        async fn execute(
            &self,
            _ctx: &ExecutionContext,
            _payload: &Value,
        ) -> Result<ProviderResponse, PipelineError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(value)) => Ok(ProviderResponse::complete(value)),
                Some(Err(error)) => Err(error),
                None => Ok(ProviderResponse::complete(json!({"ok": true}))),
            }
        }

        async fn destroy(&self) -> Result<(), PipelineError> {
            Ok(())
        }

        async fn health_check(&self) -> bool {
            self.healthy.load(Ordering::Acquire)
        }
    }

    fn ready_instance(adapter: ScriptedAdapter) -> PipelineInstance {
        PipelineInstance::new(
            PipelineConfig::new("p1", "mock"),
            Arc::new(adapter),
            HealthThresholds::default(),
        )
    }

    #[tokio::test]
    async fn initialize_reaches_ready_and_healthy() {
        let instance = ready_instance(ScriptedAdapter::always_ok());
        assert_eq!(instance.state(), InstanceState::Creating);

        instance.initialize().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Ready);
        assert_eq!(instance.health(), Health::Healthy);
        assert!(instance.is_healthy());
    }

    #[tokio::test]
    async fn failed_initialize_is_non_recoverable() {
        let instance = ready_instance(ScriptedAdapter::failing_init(PipelineError::new(
            ErrorCode::ConnectionFailed,
            "no route",
        )));

        let err = instance.initialize().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PipelineInitializationFailed);
        assert!(!err.is_recoverable());
        assert_eq!(instance.state(), InstanceState::Error);
        assert!(!instance.is_healthy());
    }

    #[tokio::test]
    async fn double_initialize_is_rejected() {
        let instance = ready_instance(ScriptedAdapter::always_ok());
        instance.initialize().await.unwrap();
        assert!(instance.initialize().await.is_err());
    }

    #[tokio::test]
    async fn execute_records_success_metrics() {
        let instance = ready_instance(ScriptedAdapter::always_ok());
        instance.initialize().await.unwrap();

        let ctx = ExecutionContext::new();
        let response =
            instance.execute(&ctx, &json!({"q": 1}), Duration::from_secs(1)).await.unwrap();
        assert_eq!(response.into_value().await.unwrap(), json!({"ok": true}));

        assert_eq!(instance.request_count(), 1);
        assert_eq!(instance.error_count(), 0);
        assert_eq!(instance.success_rate(), 1.0);
        assert!(instance.average_response_time() > Duration::ZERO);
        assert_eq!(instance.state(), InstanceState::Ready);
    }

    #[tokio::test]
    async fn single_failure_degrades_but_keeps_serving() {
        let instance = ready_instance(ScriptedAdapter::with_script(vec![Err(
            PipelineError::new(ErrorCode::ConnectionFailed, "refused"),
        )]));
        instance.initialize().await.unwrap();

        let ctx = ExecutionContext::new();
        let err = instance.execute(&ctx, &json!({}), Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionFailed);
        assert_eq!(err.pipeline_id(), Some("p1"));
        assert_eq!(err.instance_id(), Some(instance.instance_id()));

        // One transient failure is not an outage.
        assert_eq!(instance.state(), InstanceState::Ready);
        assert_eq!(instance.health(), Health::Degraded);
        assert!(instance.is_selectable());
        assert!(!instance.is_healthy());
        assert_eq!(instance.error_count(), 1);
        assert_eq!(instance.consecutive_errors(), 1);
        assert!(instance.last_error().unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn failure_streak_past_threshold_enters_error_state() {
        let failures: Vec<Result<Value, PipelineError>> = (0..4)
            .map(|n| Err(PipelineError::new(ErrorCode::ConnectionFailed, format!("flake {}", n))))
            .collect();
        let instance = ready_instance(ScriptedAdapter::with_script(failures));
        instance.initialize().await.unwrap();
        let ctx = ExecutionContext::new();

        for _ in 0..3 {
            let _ = instance.execute(&ctx, &json!({}), Duration::from_secs(1)).await;
            assert_eq!(instance.state(), InstanceState::Ready);
        }
        let _ = instance.execute(&ctx, &json!({}), Duration::from_secs(1)).await;

        // Fourth consecutive failure crosses the default threshold.
        assert_eq!(instance.state(), InstanceState::Error);
        assert_eq!(instance.health(), Health::Unhealthy);
        assert!(!instance.is_selectable());
    }

    #[tokio::test]
    async fn retry_after_failure_recovers_state() {
        let instance = PipelineInstance::new(
            PipelineConfig::new("p1", "mock"),
            Arc::new(ScriptedAdapter::with_script(vec![
                Err(PipelineError::new(ErrorCode::ConnectionFailed, "flake 1")),
                Err(PipelineError::new(ErrorCode::ConnectionFailed, "flake 2")),
                Ok(json!("fine")),
            ])),
            HealthThresholds { unhealthy: 2, healthy: 1 },
        );
        instance.initialize().await.unwrap();
        let ctx = ExecutionContext::new();

        for _ in 0..2 {
            let _ = instance.execute(&ctx, &json!({}), Duration::from_secs(1)).await;
        }
        assert_eq!(instance.state(), InstanceState::Error);

        // Third attempt still runs (retry-same-instance path) and recovers.
        instance.execute(&ctx, &json!({}), Duration::from_secs(1)).await.unwrap();
        assert_eq!(instance.state(), InstanceState::Ready);
        assert_eq!(instance.request_count(), 3);
        assert_eq!(instance.error_count(), 2);
        assert!((instance.success_rate() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(instance.consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn slow_hook_times_out_and_is_recorded() {
        let instance = ready_instance(ScriptedAdapter::slow(Duration::from_millis(500)));
        instance.initialize().await.unwrap();
        let ctx = ExecutionContext::new();

        let started = Instant::now();
        let err = instance.execute(&ctx, &json!({}), Duration::from_millis(50)).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(err.code(), ErrorCode::ExecutionTimeout);
        assert!(err.is_timeout());
        assert_eq!(instance.error_count(), 1);
        assert!(instance.average_response_time() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn destroyed_instance_rejects_requests() {
        let instance = ready_instance(ScriptedAdapter::always_ok());
        instance.initialize().await.unwrap();
        instance.destroy().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Destroyed);

        let ctx = ExecutionContext::new();
        let err = instance.execute(&ctx, &json!({}), Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PipelineDestroyed);

        // Destroy is idempotent.
        instance.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn maintenance_round_trip_restores_ready() {
        let instance = ready_instance(ScriptedAdapter::always_ok());
        instance.initialize().await.unwrap();

        instance.set_maintenance(true);
        assert_eq!(instance.state(), InstanceState::Maintenance);
        assert!(instance.in_maintenance());
        assert!(!instance.is_healthy());

        instance.set_maintenance(false);
        assert_eq!(instance.state(), InstanceState::Ready);
        assert!(instance.is_healthy());
    }

    #[tokio::test]
    async fn enable_disable_round_trip_is_identity() {
        let instance = ready_instance(ScriptedAdapter::always_ok());
        instance.initialize().await.unwrap();
        let before_state = instance.state();
        let before_health = instance.health();

        instance.enable();
        instance.disable();
        assert!(!instance.is_healthy());
        instance.enable();

        assert_eq!(instance.state(), before_state);
        assert_eq!(instance.health(), before_health);
    }

    #[tokio::test]
    async fn probe_failures_degrade_then_mark_unhealthy() {
        let clock = crate::clock::ManualClock::new();
        let adapter = ScriptedAdapter::always_ok();
        adapter.healthy.store(false, Ordering::Release);
        let mut config = PipelineConfig::new("p1", "mock");
        config.health_check.interval_ms = 10;
        let instance = PipelineInstance::with_clock(
            config,
            Arc::new(adapter),
            HealthThresholds::default(),
            Arc::new(clock.clone()),
        );
        instance.initialize().await.unwrap();

        for expected in 1..=4u32 {
            clock.advance(11);
            instance.perform_health_check().await;
            assert_eq!(instance.consecutive_errors(), expected);
        }
        assert_eq!(instance.health(), Health::Unhealthy);
    }

    #[tokio::test]
    async fn probe_success_resets_streak_and_recovers() {
        let clock = crate::clock::ManualClock::new();
        let adapter = ScriptedAdapter::with_script(vec![Err(PipelineError::new(
            ErrorCode::ConnectionFailed,
            "flake",
        ))]);
        let mut config = PipelineConfig::new("p1", "mock");
        config.health_check.interval_ms = 10;
        let instance = PipelineInstance::with_clock(
            config,
            Arc::new(adapter),
            HealthThresholds { unhealthy: 1, healthy: 1 },
            Arc::new(clock.clone()),
        );
        instance.initialize().await.unwrap();
        let ctx = ExecutionContext::new();

        let _ = instance.execute(&ctx, &json!({}), Duration::from_secs(1)).await;
        assert_eq!(instance.state(), InstanceState::Error);
        assert_eq!(instance.health(), Health::Unhealthy);

        clock.advance(11);
        let health = instance.perform_health_check().await;
        assert_eq!(instance.consecutive_errors(), 0);
        assert_eq!(instance.state(), InstanceState::Ready);
        // One recorded failure out of one request keeps the rate below 0.8.
        assert_eq!(health, Health::Degraded);
    }

    #[tokio::test]
    async fn probe_is_rate_limited() {
        let clock = crate::clock::ManualClock::new();
        let adapter = ScriptedAdapter::always_ok();
        adapter.healthy.store(false, Ordering::Release);
        let mut config = PipelineConfig::new("p1", "mock");
        config.health_check.interval_ms = 1_000;
        let instance = PipelineInstance::with_clock(
            config,
            Arc::new(adapter),
            HealthThresholds::default(),
            Arc::new(clock.clone()),
        );
        instance.initialize().await.unwrap();

        clock.advance(1_001);
        instance.perform_health_check().await;
        assert_eq!(instance.consecutive_errors(), 1);

        // Within the interval: cached result, no new probe.
        clock.advance(10);
        instance.perform_health_check().await;
        assert_eq!(instance.consecutive_errors(), 1);
    }

    #[tokio::test]
    async fn ewma_tracks_first_sample_then_smooths() {
        let instance = ready_instance(ScriptedAdapter::always_ok());
        instance.initialize().await.unwrap();
        let ctx = ExecutionContext::new();

        instance.execute(&ctx, &json!({}), Duration::from_secs(1)).await.unwrap();
        let first = instance.average_response_time();
        assert!(first > Duration::ZERO);

        instance.execute(&ctx, &json!({}), Duration::from_secs(1)).await.unwrap();
        let second = instance.average_response_time();
        // α = 0.1 keeps the average near the first sample.
        assert!(second <= first * 2 + Duration::from_millis(5));
    }

    #[tokio::test]
    async fn concurrent_requests_share_the_instance() {
        let instance =
            Arc::new(ready_instance(ScriptedAdapter::slow(Duration::from_millis(50))));
        instance.initialize().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let instance = instance.clone();
            handles.push(tokio::spawn(async move {
                let ctx = ExecutionContext::new();
                instance.execute(&ctx, &json!({}), Duration::from_secs(1)).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(instance.request_count(), 4);
        assert_eq!(instance.state(), InstanceState::Ready);
    }
}
