//! The scheduler: admission, selection, dispatch, recovery, fleet lifecycle.
//!
//! One scheduler owns one fleet of pipeline instances. Requests enter through
//! [`Scheduler::execute`]; everything else (health probing, blacklist
//! sweeping, dynamic reconfiguration) happens around that loop without ever
//! blocking it. Readers of observability snapshots never take a lock the
//! request path contends on: the instance set lives behind an `ArcSwap`.

use crate::adapter::{AdapterFactory, CredentialProvider, NoCredentials, ProviderResponse};
use crate::balancer::LoadBalancer;
use crate::blacklist::Blacklist;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{PipelineConfig, RouterConfig};
use crate::context::{ExecutionContext, Stage};
use crate::error::{ErrorCode, Impact, PipelineError};
use crate::handler::ErrorHandlerCenter;
use crate::instance::{HealthThresholds, InstanceStatus, PipelineInstance};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::strategy::ErrorAction;
use crate::telemetry::sinks::{emit_best_effort, DebugSink};
use crate::telemetry::{RecoveryKind, TraceEvent};
use arc_swap::ArcSwap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

const STATE_CREATED: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_SHUTTING_DOWN: u8 = 3;
const STATE_SHUTDOWN: u8 = 4;

const TRACE_CHANNEL_CAPACITY: usize = 1_024;
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Lifecycle state of the scheduler itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Created,
    Initializing,
    Ready,
    ShuttingDown,
    Shutdown,
}

impl SchedulerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_CREATED => SchedulerState::Created,
            STATE_INITIALIZING => SchedulerState::Initializing,
            STATE_READY => SchedulerState::Ready,
            STATE_SHUTTING_DOWN => SchedulerState::ShuttingDown,
            _ => SchedulerState::Shutdown,
        }
    }
}

/// Per-request knobs.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Overrides the scheduler's retry budget for this request.
    pub max_retries: Option<u32>,
    /// Overrides the pipeline's per-attempt timeout.
    pub timeout: Option<Duration>,
    /// Restricts candidates to instances of this pipeline id.
    pub request_class: Option<String>,
    /// Opaque caller metadata, carried on the execution context.
    pub metadata: serde_json::Map<String, Value>,
}

impl ExecuteOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_request_class(mut self, class: impl Into<String>) -> Self {
        self.request_class = Some(class.into());
        self
    }
}

/// Aggregate counters plus per-instance snapshots.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStats {
    pub state: SchedulerState,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub active_executions: usize,
    pub retries: u64,
    pub failovers: u64,
    pub blacklists: u64,
    pub maintenance_entries: u64,
    pub destroys: u64,
    pub dropped_trace_events: u64,
    pub instances: Vec<InstanceStatus>,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    failovers: AtomicU64,
    blacklists: AtomicU64,
    maintenance: AtomicU64,
    destroys: AtomicU64,
    dropped_traces: AtomicU64,
}

type SinkSpawner = Box<dyn FnOnce(mpsc::Receiver<TraceEvent>) -> tokio::task::JoinHandle<()> + Send>;

/// Builder for [`Scheduler`]. Collaborators are injected here; there are no
/// process-wide singletons behind the scenes.
pub struct SchedulerBuilder {
    config: RouterConfig,
    factory: Arc<dyn AdapterFactory>,
    credentials: Arc<dyn CredentialProvider>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    sink_spawner: Option<SinkSpawner>,
}

impl SchedulerBuilder {
    pub fn new(config: RouterConfig, factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            config,
            factory,
            credentials: Arc::new(NoCredentials),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
            sink_spawner: None,
        }
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach a debug sink. Events reach it through a bounded channel; when
    /// the channel is full events are counted and dropped, never awaited.
    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: DebugSink,
        S::Future: Send + 'static,
    {
        self.sink_spawner = Some(Box::new(move |mut rx: mpsc::Receiver<TraceEvent>| {
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    emit_best_effort(sink.clone(), event).await;
                }
            })
        }));
        self
    }

    pub fn build(self) -> Scheduler {
        let thresholds = HealthThresholds {
            unhealthy: self.config.balancer.unhealthy_threshold,
            healthy: self.config.balancer.healthy_threshold.max(1),
        };
        let (trace_tx, trace_rx) = mpsc::channel(TRACE_CHANNEL_CAPACITY);
        let admission = Semaphore::new(self.config.scheduler.max_concurrent_requests);
        Scheduler {
            balancer: LoadBalancer::new(self.config.balancer.strategy),
            blacklist: Blacklist::with_clock(
                self.config.scheduler.blacklist.clone(),
                self.clock.clone(),
            ),
            handler: ErrorHandlerCenter::with_overrides(
                self.config.scheduler.error_handling_strategies.clone(),
            ),
            thresholds,
            factory: self.factory,
            credentials: self.credentials,
            sleeper: self.sleeper,
            clock: self.clock,
            config: self.config,
            state: AtomicU8::new(STATE_CREATED),
            instances: Arc::new(ArcSwap::from_pointee(Vec::new())),
            reconfig: Mutex::new(()),
            admission,
            counters: Counters::default(),
            trace_tx,
            trace_rx: Mutex::new(Some(trace_rx)),
            sink_spawner: Mutex::new(self.sink_spawner),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// Entry point and orchestrator for the pipeline fleet.
pub struct Scheduler {
    config: RouterConfig,
    factory: Arc<dyn AdapterFactory>,
    credentials: Arc<dyn CredentialProvider>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    thresholds: HealthThresholds,

    state: AtomicU8,
    instances: Arc<ArcSwap<Vec<Arc<PipelineInstance>>>>,
    reconfig: Mutex<()>,
    balancer: LoadBalancer,
    blacklist: Blacklist,
    handler: ErrorHandlerCenter,

    /// Admission tickets; a request holds one permit for its whole lifetime,
    /// so the permit drop releases the slot on every exit path.
    admission: Semaphore,
    counters: Counters,
    trace_tx: mpsc::Sender<TraceEvent>,
    trace_rx: Mutex<Option<mpsc::Receiver<TraceEvent>>>,
    sink_spawner: Mutex<Option<SinkSpawner>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn builder(config: RouterConfig, factory: Arc<dyn AdapterFactory>) -> SchedulerBuilder {
        SchedulerBuilder::new(config, factory)
    }

    /// Build the initial fleet and start the periodic duties.
    ///
    /// Instances are initialized concurrently; any whose initialize hook fails
    /// is destroyed and left out of the active set. The scheduler comes up
    /// Ready even if some (or all) pipelines failed; an empty fleet just
    /// fails requests fast.
    pub async fn initialize(&self) -> Result<(), PipelineError> {
        if self
            .state
            .compare_exchange(
                STATE_CREATED,
                STATE_INITIALIZING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(PipelineError::new(
                ErrorCode::SchedulerNotReady,
                "scheduler initialized twice",
            ));
        }

        let mut created = Vec::new();
        for pipeline in &self.config.pipelines {
            match self.factory.build(pipeline) {
                Ok(adapter) => created.push(Arc::new(PipelineInstance::with_clock(
                    pipeline.clone(),
                    adapter,
                    self.thresholds,
                    self.clock.clone(),
                ))),
                Err(error) => {
                    tracing::error!(pipeline = %pipeline.id, %error, "adapter construction failed");
                }
            }
        }

        let results =
            futures::future::join_all(created.iter().map(|instance| instance.initialize())).await;

        let mut active = Vec::new();
        for (instance, result) in created.into_iter().zip(results) {
            match result {
                Ok(()) => active.push(instance),
                Err(error) => {
                    tracing::error!(
                        pipeline = %instance.pipeline_id(),
                        %error,
                        "pipeline excluded from the fleet"
                    );
                    let _ = instance.destroy().await;
                }
            }
        }

        tracing::info!(fleet = active.len(), "scheduler ready");
        self.instances.store(Arc::new(active));
        self.spawn_duties();
        self.state.store(STATE_READY, Ordering::Release);
        Ok(())
    }

    /// Dispatch one request: admission, selection, execution, recovery.
    pub async fn execute(
        &self,
        payload: Value,
        options: ExecuteOptions,
    ) -> Result<ProviderResponse, PipelineError> {
        match self.state() {
            SchedulerState::Ready => {}
            SchedulerState::ShuttingDown | SchedulerState::Shutdown => {
                return Err(PipelineError::new(
                    ErrorCode::SchedulerNotReady,
                    "scheduler is shutting down",
                ));
            }
            other => {
                return Err(PipelineError::new(
                    ErrorCode::SchedulerNotReady,
                    format!("scheduler not ready (state: {:?})", other),
                ));
            }
        }

        let _permit = match self.admission.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                return Err(PipelineError::new(
                    ErrorCode::SchedulerOverloaded,
                    format!(
                        "{} requests already in flight (max {})",
                        self.inflight(),
                        self.config.scheduler.max_concurrent_requests
                    ),
                ));
            }
        };
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let mut ctx = ExecutionContext::new();
        for (key, value) in &options.metadata {
            ctx.insert_metadata(key.clone(), value.clone());
        }
        ctx.set_request(payload.clone());
        self.emit(TraceEvent::Admitted {
            execution_id: ctx.execution_id(),
            trace_id: ctx.trace_id(),
            request_class: options.request_class.clone(),
        });

        let result = self.attempt_loop(&mut ctx, &payload, &options).await;

        let success = result.is_ok();
        if success {
            self.advance_stage(&mut ctx, Stage::Completion);
            self.counters.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.finish_context(&mut ctx, success);
        result
    }

    async fn attempt_loop(
        &self,
        ctx: &mut ExecutionContext,
        payload: &Value,
        options: &ExecuteOptions,
    ) -> Result<ProviderResponse, PipelineError> {
        self.advance_stage(ctx, Stage::Scheduling);

        let snapshot = self.instances.load_full();
        let mut candidates: Vec<Arc<PipelineInstance>> = snapshot
            .iter()
            .filter(|instance| match &options.request_class {
                Some(class) => instance.pipeline_id() == class,
                None => true,
            })
            .cloned()
            .collect();

        let budget = options.max_retries.unwrap_or(self.config.scheduler.max_retries);
        let max_attempts = budget.saturating_add(1);
        let mut attempts_total: u32 = 0;
        let mut attempts_on_instance: u32 = 0;
        let mut retry_same: Option<Arc<PipelineInstance>> = None;
        let mut last_error: Option<PipelineError> = None;

        while attempts_total < max_attempts {
            self.advance_stage(ctx, Stage::PipelineSelection);
            let instance = match retry_same.take() {
                Some(instance) => {
                    self.balancer.reserve(instance.instance_id());
                    instance
                }
                None => {
                    attempts_on_instance = 0;
                    match self.balancer.select(&candidates, &self.blacklist) {
                        Some(instance) => instance,
                        None => {
                            return Err(last_error.unwrap_or_else(|| {
                                PipelineError::new(
                                    ErrorCode::NoAvailableInstance,
                                    match &options.request_class {
                                        Some(class) => format!(
                                            "no healthy instance for request class {:?}",
                                            class
                                        ),
                                        None => "no healthy instance available".to_string(),
                                    },
                                )
                            }));
                        }
                    }
                }
            };

            attempts_total += 1;
            attempts_on_instance += 1;
            self.emit(TraceEvent::AttemptStarted {
                execution_id: ctx.execution_id(),
                pipeline_id: instance.pipeline_id().to_string(),
                instance_id: instance.instance_id(),
                attempt: attempts_total,
            });

            self.advance_stage(ctx, Stage::ProviderExecution);
            let timeout = options.timeout.unwrap_or_else(|| instance.config().timeout());
            let connection = ConnectionGuard::new(&self.balancer, instance.instance_id());
            let started = Instant::now();
            let outcome = instance.execute(ctx, payload, timeout).await;
            let elapsed = started.elapsed();

            match outcome {
                Ok(response) => {
                    connection.success(elapsed);
                    self.balancer
                        .update_metrics(instance.instance_id(), instance.average_response_time());
                    self.advance_stage(ctx, Stage::ResponseProcessing);
                    return Ok(response);
                }
                Err(error) => {
                    connection.failure(elapsed);
                    self.emit(TraceEvent::AttemptFailed {
                        execution_id: ctx.execution_id(),
                        pipeline_id: instance.pipeline_id().to_string(),
                        code: error.code(),
                        attempt: attempts_total,
                    });
                    self.advance_stage(ctx, Stage::ErrorHandling);
                    ctx.record_error(&error);

                    if error.is_fatal() && error.impact() == Impact::AllPipelines {
                        tracing::error!(%error, "fatal failure, scheduler shutting down");
                        self.state.store(STATE_SHUTTING_DOWN, Ordering::Release);
                        return Err(error);
                    }

                    let action = self.handler.handle(
                        &error,
                        attempts_on_instance,
                        Some(&instance.config().retry_policy),
                    );
                    self.emit(TraceEvent::ActionApplied {
                        execution_id: ctx.execution_id(),
                        pipeline_id: instance.pipeline_id().to_string(),
                        action: recovery_kind(&action),
                    });

                    if !matches!(action, ErrorAction::Blacklist { .. }) {
                        self.maybe_trip_breaker(&instance);
                    }

                    match action {
                        ErrorAction::Retry { after } => {
                            if attempts_total < max_attempts {
                                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                                self.sleeper.sleep(after).await;
                                retry_same = Some(instance);
                            } else {
                                self.drop_candidate(&mut candidates, &instance);
                            }
                        }
                        ErrorAction::Failover => {
                            self.counters.failovers.fetch_add(1, Ordering::Relaxed);
                            self.drop_candidate(&mut candidates, &instance);
                        }
                        ErrorAction::Blacklist { duration } => {
                            if self.config.scheduler.enable_circuit_breaker {
                                self.counters.blacklists.fetch_add(1, Ordering::Relaxed);
                                self.blacklist.add(
                                    instance.pipeline_id(),
                                    duration,
                                    error.to_string(),
                                );
                            }
                            self.drop_candidate(&mut candidates, &instance);
                        }
                        ErrorAction::Maintenance => {
                            self.counters.maintenance.fetch_add(1, Ordering::Relaxed);
                            instance.set_maintenance(true);
                            if error.is_authentication() {
                                self.request_credential_refresh(instance.clone());
                            }
                            self.drop_candidate(&mut candidates, &instance);
                        }
                        ErrorAction::Destroy => {
                            self.counters.destroys.fetch_add(1, Ordering::Relaxed);
                            self.remove_and_destroy(&instance).await;
                            self.drop_candidate(&mut candidates, &instance);
                        }
                        ErrorAction::Surface => {
                            return Err(error);
                        }
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            PipelineError::new(ErrorCode::NoAvailableInstance, "retry budget exhausted")
        }))
    }

    /// Add one pipeline to the live fleet. Safe during traffic.
    pub async fn create_pipeline(&self, config: PipelineConfig) -> Result<Uuid, PipelineError> {
        config.validate().map_err(|error| {
            PipelineError::new(ErrorCode::InvalidRequest, error.to_string())
                .with_pipeline(config.id.clone())
        })?;

        let adapter = self.factory.build(&config)?;
        let instance = Arc::new(PipelineInstance::with_clock(
            config,
            adapter,
            self.thresholds,
            self.clock.clone(),
        ));
        if let Err(error) = instance.initialize().await {
            let _ = instance.destroy().await;
            return Err(error);
        }

        // Membership is decided under the reconfiguration lock.
        let mut duplicate = false;
        self.mutate_fleet(|fleet| {
            if fleet.iter().any(|i| i.pipeline_id() == instance.pipeline_id()) {
                duplicate = true;
            } else {
                fleet.push(instance.clone());
            }
        });
        if duplicate {
            let _ = instance.destroy().await;
            return Err(PipelineError::new(
                ErrorCode::InvalidRequest,
                format!("pipeline {:?} already exists", instance.pipeline_id()),
            ));
        }
        Ok(instance.instance_id())
    }

    /// Remove a pipeline's instances from rotation and destroy them.
    pub async fn destroy_pipeline(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        let removed: Vec<Arc<PipelineInstance>> = self.find_instances(pipeline_id).collect();
        if removed.is_empty() {
            return Err(unknown_pipeline(pipeline_id));
        }
        self.mutate_fleet(|fleet| fleet.retain(|i| i.pipeline_id() != pipeline_id));
        for instance in removed {
            self.balancer.forget(instance.instance_id());
            let _ = instance.destroy().await;
        }
        self.blacklist.remove(pipeline_id);
        Ok(())
    }

    pub fn enable_pipeline(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        self.for_pipeline(pipeline_id, |instance| instance.enable())
    }

    pub fn disable_pipeline(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        self.for_pipeline(pipeline_id, |instance| instance.disable())
    }

    pub fn set_pipeline_maintenance(
        &self,
        pipeline_id: &str,
        maintenance: bool,
    ) -> Result<(), PipelineError> {
        self.for_pipeline(pipeline_id, |instance| instance.set_maintenance(maintenance))
    }

    /// Fleet-level health: true iff any instance is selectable.
    pub fn health_check(&self) -> bool {
        self.instances.load().iter().any(|instance| instance.is_healthy())
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Wait-free observability snapshot.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            state: self.state(),
            total_requests: self.counters.total.load(Ordering::Relaxed),
            successful_requests: self.counters.successes.load(Ordering::Relaxed),
            failed_requests: self.counters.failures.load(Ordering::Relaxed),
            active_executions: self.inflight(),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failovers: self.counters.failovers.load(Ordering::Relaxed),
            blacklists: self.counters.blacklists.load(Ordering::Relaxed),
            maintenance_entries: self.counters.maintenance.load(Ordering::Relaxed),
            destroys: self.counters.destroys.load(Ordering::Relaxed),
            dropped_trace_events: self.counters.dropped_traces.load(Ordering::Relaxed),
            instances: self.all_pipeline_statuses(),
        }
    }

    pub fn all_pipeline_statuses(&self) -> Vec<InstanceStatus> {
        self.instances.load().iter().map(|instance| instance.status()).collect()
    }

    /// Per-code error counts from the handler.
    pub fn error_counts(&self) -> HashMap<ErrorCode, u64> {
        self.handler.counts()
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    pub fn handler(&self) -> &ErrorHandlerCenter {
        &self.handler
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Refuse new requests, drain inflight (bounded), destroy the fleet,
    /// stop the periodic duties.
    pub async fn shutdown(&self) {
        let previous = self.state.swap(STATE_SHUTTING_DOWN, Ordering::AcqRel);
        if previous == STATE_SHUTDOWN {
            self.state.store(STATE_SHUTDOWN, Ordering::Release);
            return;
        }
        tracing::info!("scheduler shutting down");

        let deadline = Instant::now() + self.config.scheduler.shutdown_timeout();
        while self.inflight() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let stranded = self.inflight();
        if stranded > 0 {
            tracing::warn!(stranded, "shutdown proceeding with requests still in flight");
        }

        let fleet = {
            let _guard = self.reconfig.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let fleet = self.instances.load_full();
            self.instances.store(Arc::new(Vec::new()));
            fleet
        };
        for instance in fleet.iter() {
            self.balancer.forget(instance.instance_id());
            let _ = instance.destroy().await;
        }

        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            task.abort();
        }
        self.state.store(STATE_SHUTDOWN, Ordering::Release);
        tracing::info!("scheduler shut down");
    }

    fn spawn_duties(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(spawner) = self
            .sink_spawner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            if let Some(rx) = self
                .trace_rx
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
            {
                tasks.push(spawner(rx));
            }
        }

        if self.config.scheduler.enable_health_checks {
            let instances = self.instances.clone();
            let balancer = self.balancer.clone();
            let probe_interval = self.config.balancer.health_check_interval();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(probe_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let fleet = instances.load_full();
                    for instance in fleet.iter() {
                        instance.perform_health_check().await;
                        balancer
                            .update_metrics(instance.instance_id(), instance.average_response_time());
                    }
                }
            }));
        }

        if self.config.scheduler.blacklist.enabled {
            let blacklist = self.blacklist.clone();
            let interval = blacklist.cleanup_interval();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let swept = blacklist.sweep();
                    if swept > 0 {
                        tracing::debug!(swept, "blacklist entries expired");
                    }
                }
            }));
        }
    }

    /// Streak-based circuit breaker: a pipeline whose failure streak crosses
    /// the configured threshold sits out the recovery window, independent of
    /// which error codes made up the streak.
    fn maybe_trip_breaker(&self, instance: &Arc<PipelineInstance>) {
        let breaker = &self.config.balancer.circuit_breaker;
        if !self.config.balancer.enable_circuit_breaker
            || instance.request_count() < breaker.request_volume_threshold as u64
            || instance.consecutive_errors() < breaker.failure_threshold
            || self.blacklist.is_blacklisted(instance.pipeline_id())
        {
            return;
        }
        self.counters.blacklists.fetch_add(1, Ordering::Relaxed);
        self.blacklist.add(
            instance.pipeline_id(),
            breaker.recovery_time(),
            format!("circuit breaker tripped after {} consecutive failures", instance.consecutive_errors()),
        );
    }

    fn request_credential_refresh(&self, instance: Arc<PipelineInstance>) {
        let credentials = self.credentials.clone();
        tokio::spawn(async move {
            let pipeline_id = instance.pipeline_id().to_string();
            if credentials.refresh(&pipeline_id).await {
                tracing::info!(pipeline = %pipeline_id, "credentials refreshed");
                instance.set_maintenance(false);
            } else {
                tracing::warn!(pipeline = %pipeline_id, "credential refresh failed");
            }
        });
    }

    async fn remove_and_destroy(&self, instance: &Arc<PipelineInstance>) {
        let instance_id = instance.instance_id();
        self.mutate_fleet(|fleet| fleet.retain(|i| i.instance_id() != instance_id));
        self.balancer.forget(instance_id);
        let _ = instance.destroy().await;
    }

    fn mutate_fleet<F: FnOnce(&mut Vec<Arc<PipelineInstance>>)>(&self, mutate: F) {
        let _guard = self.reconfig.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next: Vec<Arc<PipelineInstance>> = (**self.instances.load()).clone();
        mutate(&mut next);
        self.instances.store(Arc::new(next));
    }

    fn find_instances<'a>(
        &'a self,
        pipeline_id: &'a str,
    ) -> impl Iterator<Item = Arc<PipelineInstance>> + 'a {
        let snapshot = self.instances.load_full();
        snapshot
            .iter()
            .filter(move |instance| instance.pipeline_id() == pipeline_id)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn for_pipeline<F: Fn(&PipelineInstance)>(
        &self,
        pipeline_id: &str,
        apply: F,
    ) -> Result<(), PipelineError> {
        let mut found = false;
        for instance in self.find_instances(pipeline_id) {
            apply(&instance);
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(unknown_pipeline(pipeline_id))
        }
    }

    fn drop_candidate(
        &self,
        candidates: &mut Vec<Arc<PipelineInstance>>,
        instance: &Arc<PipelineInstance>,
    ) {
        candidates.retain(|candidate| candidate.instance_id() != instance.instance_id());
    }

    fn advance_stage(&self, ctx: &mut ExecutionContext, stage: Stage) {
        ctx.advance(stage);
        if let Some(timing) = ctx.stage_timings().last() {
            self.emit(TraceEvent::StageCompleted {
                execution_id: ctx.execution_id(),
                stage: timing.stage,
                duration: timing.duration,
            });
        }
    }

    fn finish_context(&self, ctx: &mut ExecutionContext, success: bool) {
        ctx.complete();
        self.emit(TraceEvent::Completed {
            execution_id: ctx.execution_id(),
            duration: ctx.elapsed(),
            success,
        });
    }

    fn emit(&self, event: TraceEvent) {
        if self.trace_tx.try_send(event).is_err() {
            // Sink has fallen behind (or nobody is listening); drop.
            self.counters.dropped_traces.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn inflight(&self) -> usize {
        self.config
            .scheduler
            .max_concurrent_requests
            .saturating_sub(self.admission.available_permits())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state())
            .field("fleet", &self.instances.load().len())
            .field("inflight", &self.inflight())
            .finish()
    }
}

/// One attempt's balancer connection. The selection already took it; this
/// guard guarantees it comes back exactly once: through `success`/`failure`
/// normally, or plain release if the attempt is cancelled mid-flight.
struct ConnectionGuard<'a> {
    balancer: &'a LoadBalancer,
    instance_id: Uuid,
    open: bool,
}

impl<'a> ConnectionGuard<'a> {
    fn new(balancer: &'a LoadBalancer, instance_id: Uuid) -> Self {
        Self { balancer, instance_id, open: true }
    }

    fn success(mut self, elapsed: Duration) {
        self.open = false;
        self.balancer.record_success(self.instance_id, elapsed);
    }

    fn failure(mut self, elapsed: Duration) {
        self.open = false;
        self.balancer.record_failure(self.instance_id, elapsed);
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        if self.open {
            self.balancer.release(self.instance_id);
        }
    }
}

fn recovery_kind(action: &ErrorAction) -> RecoveryKind {
    match action {
        ErrorAction::Retry { .. } => RecoveryKind::Retry,
        ErrorAction::Failover => RecoveryKind::Failover,
        ErrorAction::Blacklist { .. } => RecoveryKind::Blacklist,
        ErrorAction::Maintenance => RecoveryKind::Maintenance,
        ErrorAction::Destroy => RecoveryKind::Destroy,
        ErrorAction::Surface => RecoveryKind::Surface,
    }
}

fn unknown_pipeline(pipeline_id: &str) -> PipelineError {
    PipelineError::new(
        ErrorCode::InvalidRequest,
        format!("unknown pipeline {:?}", pipeline_id),
    )
    .with_pipeline(pipeline_id.to_string())
}
