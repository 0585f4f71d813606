//! Shared test doubles: scripted provider adapters and a recording
//! credential provider.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchyard::{
    AdapterFactory, CredentialProvider, ExecutionContext, PipelineConfig, PipelineError,
    ProviderAdapter, ProviderResponse,
};

/// Adapter that replays a script of outcomes and counts every call.
/// An empty script answers `{"served_by": <pipeline id>}`.
pub struct MockAdapter {
    pipeline_id: String,
    script: Mutex<VecDeque<Result<Value, PipelineError>>>,
    delay: Mutex<Option<Duration>>,
    execute_calls: AtomicUsize,
    healthy: AtomicBool,
    fail_init: AtomicBool,
    destroyed: AtomicBool,
}

impl MockAdapter {
    fn new(pipeline_id: &str) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            script: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            execute_calls: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            fail_init: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn push_failure(&self, error: PipelineError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn push_success(&self, value: Value) {
        self.script.lock().unwrap().push_back(Ok(value));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn fail_initialization(&self) {
        self.fail_init.store(true, Ordering::Release);
    }

    pub fn execute_calls(&self) -> usize {
        self.execute_calls.load(Ordering::Acquire)
    }

    pub fn was_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    async fn initialize(&self) -> Result<(), PipelineError> {
        if self.fail_init.load(Ordering::Acquire) {
            Err(PipelineError::new(
                switchyard::ErrorCode::ConnectionFailed,
                "scripted init failure",
            ))
        } else {
            Ok(())
        }
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        _payload: &Value,
    ) -> Result<ProviderResponse, PipelineError> {
        self.execute_calls.fetch_add(1, Ordering::AcqRel);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(value)) => Ok(ProviderResponse::complete(value)),
            Some(Err(error)) => Err(error),
            None => Ok(ProviderResponse::complete(json!({"served_by": self.pipeline_id}))),
        }
    }

    async fn destroy(&self) -> Result<(), PipelineError> {
        self.destroyed.store(true, Ordering::Release);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

/// Factory handing out one shared [`MockAdapter`] per pipeline id, so tests
/// can script behavior before or after the scheduler builds the fleet.
#[derive(Default)]
pub struct MockFactory {
    adapters: Mutex<HashMap<String, Arc<MockAdapter>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn adapter(&self, pipeline_id: &str) -> Arc<MockAdapter> {
        self.adapters
            .lock()
            .unwrap()
            .entry(pipeline_id.to_string())
            .or_insert_with(|| Arc::new(MockAdapter::new(pipeline_id)))
            .clone()
    }
}

impl AdapterFactory for MockFactory {
    fn build(&self, config: &PipelineConfig) -> Result<Arc<dyn ProviderAdapter>, PipelineError> {
        Ok(self.adapter(&config.id) as Arc<dyn ProviderAdapter>)
    }
}

/// Credential provider that records refresh calls.
pub struct MockCredentials {
    allow: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MockCredentials {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self { allow: AtomicBool::new(true), calls: Mutex::new(Vec::new()) })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self { allow: AtomicBool::new(false), calls: Mutex::new(Vec::new()) })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialProvider for MockCredentials {
    async fn refresh(&self, pipeline_id: &str) -> bool {
        self.calls.lock().unwrap().push(pipeline_id.to_string());
        self.allow.load(Ordering::Acquire)
    }
}
