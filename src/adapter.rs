//! Collaborator seams: provider hooks and credential refresh.
//!
//! A [`ProviderAdapter`] is the protocol-specific half of a pipeline instance:
//! it owns the upstream wire format, the scheduler owns everything else. The
//! scheduler only ever calls it through the instance lifecycle.

use crate::context::ExecutionContext;
use crate::error::PipelineError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

/// Lazy, finite, non-restartable sequence of response chunks.
///
/// Dropping the stream terminates it; cancellation of the outer request drops
/// the stream with it.
pub type ChunkStream = BoxStream<'static, Result<Value, PipelineError>>;

/// What a provider hook yields: either a complete body or a chunk stream the
/// scheduler hands through without buffering.
pub enum ProviderResponse {
    Complete(Value),
    Stream(ChunkStream),
}

impl ProviderResponse {
    pub fn complete(value: Value) -> Self {
        ProviderResponse::Complete(value)
    }

    pub fn stream(stream: ChunkStream) -> Self {
        ProviderResponse::Stream(stream)
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, ProviderResponse::Stream(_))
    }

    /// Drain into a single value: streams are collected into an array.
    /// Intended for tests and non-streaming callers.
    pub async fn into_value(self) -> Result<Value, PipelineError> {
        match self {
            ProviderResponse::Complete(value) => Ok(value),
            ProviderResponse::Stream(mut stream) => {
                let mut chunks = Vec::new();
                while let Some(chunk) = stream.next().await {
                    chunks.push(chunk?);
                }
                Ok(Value::Array(chunks))
            }
        }
    }
}

impl std::fmt::Debug for ProviderResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderResponse::Complete(value) => f.debug_tuple("Complete").field(value).finish(),
            ProviderResponse::Stream(_) => f.debug_tuple("Stream").field(&"<chunks>").finish(),
        }
    }
}

/// The hook behind a pipeline instance. One implementation per upstream
/// protocol; instantiated per [`crate::config::PipelineConfig`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Prepare the upstream connection. Called once, before any `execute`.
    async fn initialize(&self) -> Result<(), PipelineError>;

    /// Run one request/response cycle. Must honor the deadline the scheduler
    /// imposes; on cancellation the future is dropped.
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        payload: &Value,
    ) -> Result<ProviderResponse, PipelineError>;

    /// Release upstream resources. Called once, after which the adapter is
    /// never used again.
    async fn destroy(&self) -> Result<(), PipelineError>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> bool;
}

/// Builds the protocol adapter for a pipeline from its declared `type`.
///
/// The scheduler calls this for every pipeline in the initial fleet and for
/// every `create_pipeline` thereafter.
pub trait AdapterFactory: Send + Sync {
    fn build(
        &self,
        config: &crate::config::PipelineConfig,
    ) -> Result<std::sync::Arc<dyn ProviderAdapter>, PipelineError>;
}

// Blanket implementation for closures.
impl<F> AdapterFactory for F
where
    F: Fn(&crate::config::PipelineConfig) -> Result<std::sync::Arc<dyn ProviderAdapter>, PipelineError>
        + Send
        + Sync,
{
    fn build(
        &self,
        config: &crate::config::PipelineConfig,
    ) -> Result<std::sync::Arc<dyn ProviderAdapter>, PipelineError> {
        self(config)
    }
}

/// Credential refresh collaborator, driven from the authentication error path.
/// While a refresh is pending the affected instance stays in maintenance.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Attempt to refresh credentials for the pipeline. `true` on success.
    async fn refresh(&self, pipeline_id: &str) -> bool;
}

/// Provider that rejects every refresh; the default when no credential
/// collaborator is injected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn refresh(&self, _pipeline_id: &str) -> bool {
        false
    }
}
