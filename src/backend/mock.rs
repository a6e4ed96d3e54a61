use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::mpsc, time::sleep};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::{
    backend::{
        common::{estimate_prompt_tokens, estimate_tokens, response_id, unix_timestamp},
        BackendStatus, BackendStream, HealthStatus, InferenceBackend,
    },
    capabilities::{Capabilities, FeatureFlags, ModelInfo, ModelPricing},
    errors::ProviderError,
    models::{CompletionRequest, CompletionResponse, FinishReason, StreamEvent, Usage},
};

/// In-process backend with scriptable failures, availability and load.
/// Streams the reply word by word.
#[derive(Debug)]
pub struct MockBackend {
    name: String,
    reply: Option<String>,
    capabilities: Capabilities,
    token_delay: Duration,
    caching: bool,
    scripted_errors: Mutex<VecDeque<ProviderError>>,
    persistent_error: Mutex<Option<ProviderError>>,
    init_error: Option<ProviderError>,
    requested_models: Mutex<Vec<Option<String>>>,
    available: AtomicBool,
    destroyed: AtomicBool,
    load: AtomicUsize,
    calls: AtomicUsize,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::named("mock")
    }
}

impl MockBackend {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reply: None,
            capabilities: Capabilities {
                default_model: "mock-model".to_owned(),
                models: vec![ModelInfo::new(
                    "mock-model",
                    8_192,
                    2_048,
                    ModelPricing::FREE,
                )],
                features: FeatureFlags {
                    streaming: true,
                    ..FeatureFlags::default()
                },
            },
            token_delay: Duration::ZERO,
            caching: true,
            scripted_errors: Mutex::new(VecDeque::new()),
            persistent_error: Mutex::new(None),
            init_error: None,
            requested_models: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            load: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Replaces the model table; the first entry becomes the default model.
    pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
        if let Some(first) = models.first() {
            self.capabilities.default_model = first.id.clone();
        }
        self.capabilities.models = models;
        self
    }

    /// Single-model shorthand priced per 1k tokens.
    pub fn with_pricing(self, prompt_per_1k: f64, completion_per_1k: f64) -> Self {
        let model = format!("{}-model", self.name);
        self.with_models(vec![ModelInfo::new(
            model,
            8_192,
            2_048,
            ModelPricing::new(prompt_per_1k, completion_per_1k),
        )])
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn with_caching(mut self, caching: bool) -> Self {
        self.caching = caching;
        self
    }

    pub fn with_init_error(mut self, error: ProviderError) -> Self {
        self.init_error = Some(error);
        self
    }

    /// Every call fails with `error` until [`MockBackend::recover`].
    pub fn failing_with(self, error: ProviderError) -> Self {
        *lock(&self.persistent_error) = Some(error);
        self
    }

    /// Queues `error` for the next call only.
    pub fn fail_next(&self, error: ProviderError) {
        lock(&self.scripted_errors).push_back(error);
    }

    pub fn recover(&self) {
        *lock(&self.persistent_error) = None;
        lock(&self.scripted_errors).clear();
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn set_load(&self, load: usize) {
        self.load.store(load, Ordering::Relaxed);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Model override of every request received, in order.
    pub fn requested_models(&self) -> Vec<Option<String>> {
        lock(&self.requested_models).clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn accept(&self, request: &CompletionRequest) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        lock(&self.requested_models).push(request.model.clone());

        if self.is_destroyed() {
            return Err(ProviderError::Unavailable {
                provider: self.name.clone(),
                message: "provider has been destroyed".to_owned(),
            });
        }
        if let Some(error) = lock(&self.scripted_errors).pop_front() {
            return Err(error);
        }
        match lock(&self.persistent_error).as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn render(&self, request: &CompletionRequest) -> CompletionResponse {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.capabilities.default_model.clone());
        let content = self
            .reply
            .clone()
            .unwrap_or_else(|| format!("Mock response from {}", self.name));
        let usage = Usage::new(
            estimate_prompt_tokens(&request.messages),
            estimate_tokens(&content),
        );

        CompletionResponse {
            id: response_id(&self.name, None),
            provider: self.name.clone(),
            cost: self.capabilities.cost_for(&model, &usage),
            model,
            content,
            tool_calls: None,
            usage,
            finish_reason: FinishReason::Stop,
            created: unix_timestamp(),
        }
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn caching_enabled(&self) -> bool {
        self.caching
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        match &self.init_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.accept(&request)?;
        Ok(self.render(&request))
    }

    async fn stream_complete(
        &self,
        request: CompletionRequest,
    ) -> Result<BackendStream, ProviderError> {
        self.accept(&request)?;
        let response = self.render(&request);
        let delay = self.token_delay;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            for token in split_for_stream(&response.content) {
                if tx.send(Ok(StreamEvent::Content { delta: token })).await.is_err() {
                    return;
                }
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }

            let _ = tx
                .send(Ok(StreamEvent::Done {
                    id: response.id,
                    provider: response.provider,
                    model: response.model,
                    usage: response.usage,
                    cost: response.cost,
                    finish_reason: response.finish_reason,
                }))
                .await;
        });

        debug!(provider = %self.name, "stream prepared");
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn health_check(&self) -> HealthStatus {
        let healthy = self.available.load(Ordering::Acquire) && !self.is_destroyed();
        HealthStatus {
            provider: self.name.clone(),
            healthy,
            error: (!healthy).then(|| "mock marked unavailable".to_owned()),
            latency_ms: 0,
            checked_at: unix_timestamp(),
        }
    }

    async fn status(&self) -> BackendStatus {
        BackendStatus {
            provider: self.name.clone(),
            available: self.available.load(Ordering::Acquire) && !self.is_destroyed(),
            load: self.load.load(Ordering::Relaxed),
            consecutive_failures: 0,
        }
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn split_for_stream(text: &str) -> Vec<String> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let len = tokens.len();

    tokens
        .into_iter()
        .enumerate()
        .map(|(index, token)| {
            if index + 1 == len {
                token.to_owned()
            } else {
                format!("{token} ")
            }
        })
        .collect()
}
