pub mod anthropic;
pub mod common;
pub mod google;
pub mod mock;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;

use crate::{
    capabilities::{Capabilities, ModelInfo},
    errors::ProviderError,
    models::{CompletionRequest, CompletionResponse, StreamEvent},
};

pub type BackendStream = BoxStream<'static, Result<StreamEvent, ProviderError>>;

/// Uniform contract every backend adapter implements.
///
/// Capability queries are answered from static data; `status` never touches
/// the network; `health_check` never fails and reports errors as data.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &Capabilities;

    async fn initialize(&self) -> Result<(), ProviderError>;

    async fn complete(&self, request: CompletionRequest)
        -> Result<CompletionResponse, ProviderError>;

    /// Emits content and tool-call deltas followed by exactly one
    /// [`StreamEvent::Done`]. Errors raised before the first byte is read are
    /// returned directly; later errors end the stream as an `Err` item.
    async fn stream_complete(&self, request: CompletionRequest)
        -> Result<BackendStream, ProviderError>;

    fn list_models(&self) -> Vec<ModelInfo> {
        self.capabilities().models.clone()
    }

    fn get_model_info(&self, model: &str) -> Option<ModelInfo> {
        self.capabilities().model(model).cloned()
    }

    /// Whether responses served by this backend may be stored in the
    /// router's response cache.
    fn caching_enabled(&self) -> bool {
        true
    }

    async fn health_check(&self) -> HealthStatus;

    async fn status(&self) -> BackendStatus;

    async fn destroy(&self);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub provider: String,
    pub healthy: bool,
    pub error: Option<String>,
    pub latency_ms: u64,
    /// Unix seconds.
    pub checked_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub provider: String,
    pub available: bool,
    /// In-flight calls, open streams included.
    pub load: usize,
    pub consecutive_failures: u32,
}
