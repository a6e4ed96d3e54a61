//! Building blocks shared by every adapter.
//!
//! Adapters own an [`AdapterCore`] for the stateful parts (HTTP client,
//! timeouts and retries, in-flight load, circuit state, shutdown signal) and
//! call the free functions here for request shaping, error normalization,
//! token estimation and stream relaying.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures_util::{stream, StreamExt};
use reqwest::{header::RETRY_AFTER, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch, Mutex},
    time::{sleep, sleep_until, timeout_at, Instant},
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    backend::{BackendStatus, BackendStream, HealthStatus},
    capabilities::{Capabilities, ModelPricing},
    config::ProviderConfig,
    errors::ProviderError,
    models::{
        CompletionRequest, CompletionResponse, FinishReason, Message, MessageRole, StreamEvent,
        ToolCallDelta, Usage,
    },
};

/// Streams get this many times the non-streaming timeout as an overall deadline.
pub const STREAM_TIMEOUT_FACTOR: u32 = 3;
const STREAM_CHANNEL_CAPACITY: usize = 32;
const FAILURE_THRESHOLD: u32 = 3;
const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(20);
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BODY_LIMIT: usize = 400;

pub struct AdapterCore {
    provider: &'static str,
    config: ProviderConfig,
    client: reqwest::Client,
    circuit: Mutex<CircuitState>,
    initialized: AtomicBool,
    destroyed: AtomicBool,
    inflight: Arc<AtomicUsize>,
    shutdown: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

pub struct InflightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

impl AdapterCore {
    pub fn new(provider: &'static str, config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout.min(MAX_CONNECT_TIMEOUT))
            .build()
            .map_err(|error| ProviderError::InvalidConfig {
                provider: provider.to_owned(),
                errors: vec![format!("failed to build HTTP client: {error}")],
            })?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            provider,
            config,
            client,
            circuit: Mutex::new(CircuitState::default()),
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            inflight: Arc::new(AtomicUsize::new(0)),
            shutdown,
        })
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.resolved_base_url(),
            path.trim_start_matches('/')
        )
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn stream_timeout(&self) -> Duration {
        self.config.timeout.saturating_mul(STREAM_TIMEOUT_FACTOR)
    }

    pub fn deadline(&self) -> Instant {
        Instant::now() + self.timeout()
    }

    pub fn stream_deadline(&self) -> Instant {
        Instant::now() + self.stream_timeout()
    }

    /// Request override, then configured default, then the backend default.
    pub fn resolve_model(&self, request: &CompletionRequest, capabilities: &Capabilities) -> String {
        request
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| capabilities.default_model.clone())
    }

    pub fn require_api_key(&self) -> Result<&str, ProviderError> {
        self.config
            .api_key()
            .ok_or_else(|| ProviderError::Authentication {
                provider: self.provider.to_owned(),
                message: "missing API key".to_owned(),
            })
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Rejects calls after `destroy` and counts the call as in-flight.
    pub fn begin(&self) -> Result<InflightGuard, ProviderError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(ProviderError::Unavailable {
                provider: self.provider.to_owned(),
                message: "provider has been destroyed".to_owned(),
            });
        }
        self.inflight.fetch_add(1, Ordering::Relaxed);
        Ok(InflightGuard {
            counter: self.inflight.clone(),
        })
    }

    pub async fn status(&self) -> BackendStatus {
        let mut circuit = self.circuit.lock().await;
        let circuit_open = match circuit.open_until {
            Some(until) if until > Instant::now() => true,
            Some(_) => {
                circuit.open_until = None;
                circuit.consecutive_failures = 0;
                false
            }
            None => false,
        };

        BackendStatus {
            provider: self.provider.to_owned(),
            available: self.initialized.load(Ordering::Acquire)
                && !self.destroyed.load(Ordering::Acquire)
                && !circuit_open,
            load: self.inflight.load(Ordering::Relaxed),
            consecutive_failures: circuit.consecutive_failures,
        }
    }

    /// Feeds a call outcome into the circuit; only transient errors count.
    pub async fn record_outcome(&self, error: Option<&ProviderError>) {
        match error {
            None => self.mark_success().await,
            Some(error) if error.is_transient() => self.mark_failure(error).await,
            Some(_) => {}
        }
    }

    async fn mark_success(&self) {
        let mut circuit = self.circuit.lock().await;
        circuit.consecutive_failures = 0;
        circuit.open_until = None;
    }

    async fn mark_failure(&self, error: &ProviderError) {
        let mut circuit = self.circuit.lock().await;
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
        if circuit.consecutive_failures >= FAILURE_THRESHOLD {
            circuit.open_until = Some(Instant::now() + CIRCUIT_COOLDOWN);
            warn!(
                provider = self.provider,
                failures = circuit.consecutive_failures,
                cooldown_secs = CIRCUIT_COOLDOWN.as_secs(),
                error = %error,
                "circuit opened for provider"
            );
        }
    }

    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        debug!(provider = self.provider, "provider destroyed");
    }

    /// Sends a request built by `build`, retrying transient failures up to the
    /// configured retry count. Non-success statuses become typed errors.
    pub async fn send<F>(
        &self,
        build: F,
        model: Option<&str>,
        deadline: Instant,
    ) -> Result<Response, ProviderError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            let error = match timeout_at(deadline, build().send()).await {
                Err(_) => return Err(self.timeout_error()),
                Ok(Ok(response)) if response.status().is_success() => return Ok(response),
                Ok(Ok(response)) => self.status_error(response, model, deadline).await,
                Ok(Err(error)) => transport_error(self.provider, &error),
            };
            if attempt >= self.config.max_retries || !error.is_transient() {
                return Err(error);
            }

            let delay = RETRY_BASE_DELAY.saturating_mul(1u32 << attempt.min(6));
            if Instant::now() + delay >= deadline {
                return Err(error);
            }
            attempt += 1;
            debug!(
                provider = self.provider,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying provider request"
            );
            sleep(delay).await;
        }
    }

    pub async fn read_json<T: DeserializeOwned>(
        &self,
        response: Response,
        deadline: Instant,
    ) -> Result<T, ProviderError> {
        let bytes = match timeout_at(deadline, response.bytes()).await {
            Err(_) => return Err(self.timeout_error()),
            Ok(Err(error)) => return Err(transport_error(self.provider, &error)),
            Ok(Ok(bytes)) => bytes,
        };
        serde_json::from_slice(&bytes).map_err(|error| ProviderError::Provider {
            provider: self.provider.to_owned(),
            status: None,
            code: Some("invalid_response".to_owned()),
            message: error.to_string(),
        })
    }

    async fn status_error(
        &self,
        response: Response,
        model: Option<&str>,
        deadline: Instant,
    ) -> ProviderError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let body = match timeout_at(deadline, response.text()).await {
            Ok(Ok(body)) => body,
            _ => String::new(),
        };
        map_status_error(self.provider, status, retry_after, &body, model)
    }

    fn timeout_error(&self) -> ProviderError {
        ProviderError::Timeout {
            provider: self.provider.to_owned(),
            timeout_ms: self.config.timeout.as_millis() as u64,
        }
    }

    /// Runs a cheap probe and turns the outcome into a [`HealthStatus`].
    pub async fn health_report(
        &self,
        started: Instant,
        result: Result<(), ProviderError>,
    ) -> HealthStatus {
        self.record_outcome(result.as_ref().err()).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => HealthStatus {
                provider: self.provider.to_owned(),
                healthy: true,
                error: None,
                latency_ms,
                checked_at: unix_timestamp(),
            },
            Err(error) => {
                warn!(provider = self.provider, error = %error, "health check failed");
                HealthStatus {
                    provider: self.provider.to_owned(),
                    healthy: false,
                    error: Some(error.to_string()),
                    latency_ms,
                    checked_at: unix_timestamp(),
                }
            }
        }
    }

    /// Spawns the background reader that turns an HTTP body into stream events.
    pub fn relay_stream<D: StreamDecoder>(
        &self,
        response: Response,
        decoder: D,
        context: StreamContext,
        deadline: Instant,
        guard: InflightGuard,
    ) -> BackendStream {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let shutdown = self.shutdown.subscribe();
        let provider = self.provider;
        let stream_timeout_ms = self.stream_timeout().as_millis() as u64;

        tokio::spawn(async move {
            let _guard = guard;
            let reader = StreamReader {
                provider,
                stream_timeout_ms,
                deadline,
                tx: &tx,
            };
            match reader.pump(response, decoder, context, shutdown).await {
                Ok(Some(done)) => {
                    let _ = tx.send(Ok(done)).await;
                }
                Ok(None) => {
                    debug!(provider, "stream consumer went away, upstream read aborted");
                }
                Err(error) => {
                    warn!(provider, error = %error, "stream ended with error");
                    let _ = tx.send(Err(error)).await;
                }
            }
        });

        ReceiverStream::new(rx).boxed()
    }
}

/// Per-backend parser for one line of a streamed body.
pub trait StreamDecoder: Send + 'static {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamPiece>, ProviderError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamPiece {
    Text(String),
    Tool(ToolCallDelta),
    Usage {
        prompt: Option<u32>,
        completion: Option<u32>,
    },
    Finish(FinishReason),
    ResponseId(String),
    End,
}

#[derive(Debug, Clone)]
pub struct StreamContext {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub prompt_estimate: u32,
    pub pricing: ModelPricing,
}

impl StreamContext {
    pub fn new(
        provider: &str,
        model: &str,
        request: &CompletionRequest,
        capabilities: &Capabilities,
    ) -> Self {
        Self {
            id: response_id(provider, None),
            provider: provider.to_owned(),
            model: model.to_owned(),
            prompt_estimate: estimate_prompt_tokens(&request.messages),
            pricing: capabilities.pricing_for(model),
        }
    }
}

/// Folds stream pieces into the final `Done` event.
#[derive(Debug)]
pub struct StreamAccumulator {
    context: StreamContext,
    generated_chars: String,
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    finish_reason: Option<FinishReason>,
    saw_tool_call: bool,
}

enum Applied {
    Forward(StreamEvent),
    Absorbed,
    End,
}

impl StreamAccumulator {
    pub fn new(context: StreamContext) -> Self {
        Self {
            context,
            generated_chars: String::new(),
            prompt_tokens: None,
            completion_tokens: None,
            finish_reason: None,
            saw_tool_call: false,
        }
    }

    fn apply(&mut self, piece: StreamPiece) -> Applied {
        match piece {
            StreamPiece::Text(delta) if delta.is_empty() => Applied::Absorbed,
            StreamPiece::Text(delta) => {
                self.generated_chars.push_str(&delta);
                Applied::Forward(StreamEvent::Content { delta })
            }
            StreamPiece::Tool(delta) => {
                self.saw_tool_call = true;
                self.generated_chars.push_str(&delta.arguments);
                Applied::Forward(StreamEvent::ToolCall { delta })
            }
            StreamPiece::Usage { prompt, completion } => {
                self.prompt_tokens = prompt.or(self.prompt_tokens);
                self.completion_tokens = completion.or(self.completion_tokens);
                Applied::Absorbed
            }
            StreamPiece::Finish(reason) => {
                self.finish_reason = Some(reason);
                Applied::Absorbed
            }
            StreamPiece::ResponseId(id) => {
                self.context.id = id;
                Applied::Absorbed
            }
            StreamPiece::End => Applied::End,
        }
    }

    pub fn finish(self) -> StreamEvent {
        let usage = Usage::new(
            self.prompt_tokens.unwrap_or(self.context.prompt_estimate),
            self.completion_tokens
                .unwrap_or_else(|| estimate_tokens(&self.generated_chars)),
        );
        let finish_reason = self.finish_reason.unwrap_or(if self.saw_tool_call {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        });

        StreamEvent::Done {
            id: self.context.id,
            provider: self.context.provider,
            model: self.context.model,
            cost: self.context.pricing.cost(&usage),
            usage,
            finish_reason,
        }
    }
}

struct StreamReader<'a> {
    provider: &'static str,
    stream_timeout_ms: u64,
    deadline: Instant,
    tx: &'a mpsc::Sender<Result<StreamEvent, ProviderError>>,
}

enum Flow {
    Continue,
    Finished,
    ConsumerGone,
}

impl StreamReader<'_> {
    /// `Ok(None)` means the consumer dropped the stream.
    async fn pump<D: StreamDecoder>(
        &self,
        response: Response,
        mut decoder: D,
        context: StreamContext,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Option<StreamEvent>, ProviderError> {
        let mut upstream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut accumulator = StreamAccumulator::new(context);

        loop {
            let next = tokio::select! {
                _ = self.tx.closed() => return Ok(None),
                _ = sleep_until(self.deadline) => {
                    return Err(ProviderError::Timeout {
                        provider: self.provider.to_owned(),
                        timeout_ms: self.stream_timeout_ms,
                    });
                }
                _ = shutdown.changed() => {
                    return Err(ProviderError::Unavailable {
                        provider: self.provider.to_owned(),
                        message: "provider destroyed while streaming".to_owned(),
                    });
                }
                next = upstream.next() => next,
            };

            let Some(chunk) = next else {
                break;
            };
            let bytes = chunk.map_err(|error| transport_error(self.provider, &error))?;
            for line in lines.push(&bytes) {
                match self.process_line(&line, &mut decoder, &mut accumulator).await? {
                    Flow::Continue => {}
                    Flow::Finished => return Ok(Some(accumulator.finish())),
                    Flow::ConsumerGone => return Ok(None),
                }
            }
        }

        if let Some(line) = lines.finish() {
            match self
                .process_line(&line, &mut decoder, &mut accumulator)
                .await?
            {
                Flow::Continue => {}
                Flow::Finished => return Ok(Some(accumulator.finish())),
                Flow::ConsumerGone => return Ok(None),
            }
        }

        // Every decoder has an explicit end marker; EOF before it is a cut
        // connection, not a completion.
        Err(ProviderError::Provider {
            provider: self.provider.to_owned(),
            status: None,
            code: Some("incomplete_stream".to_owned()),
            message: "stream ended before the end-of-response marker".to_owned(),
        })
    }

    async fn process_line<D: StreamDecoder>(
        &self,
        line: &str,
        decoder: &mut D,
        accumulator: &mut StreamAccumulator,
    ) -> Result<Flow, ProviderError> {
        for piece in decoder.decode_line(line)? {
            match accumulator.apply(piece) {
                Applied::Forward(event) => {
                    if self.tx.send(Ok(event)).await.is_err() {
                        return Ok(Flow::ConsumerGone);
                    }
                }
                Applied::Absorbed => {}
                Applied::End => return Ok(Flow::Finished),
            }
        }
        Ok(Flow::Continue)
    }
}

/// Splits a byte stream into UTF-8 lines. Decoding happens per complete line
/// so multi-byte characters split across chunks survive.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(index) = self.pending.iter().position(|byte| *byte == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=index).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_owned());
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw).trim().to_owned();
        (!line.is_empty()).then_some(line)
    }
}

/// Emits a finished response as one content delta, its tool calls and `Done`.
/// Used by backends without native streaming or with streaming disabled.
pub fn single_shot_stream(response: CompletionResponse) -> BackendStream {
    let mut events = Vec::new();
    if !response.content.is_empty() {
        events.push(StreamEvent::Content {
            delta: response.content,
        });
    }
    for (index, call) in response.tool_calls.unwrap_or_default().into_iter().enumerate() {
        events.push(StreamEvent::ToolCall {
            delta: ToolCallDelta {
                index,
                id: Some(call.id),
                name: Some(call.name),
                arguments: call.arguments,
            },
        });
    }
    events.push(StreamEvent::Done {
        id: response.id,
        provider: response.provider,
        model: response.model,
        usage: response.usage,
        cost: response.cost,
        finish_reason: response.finish_reason,
    });

    stream::iter(events.into_iter().map(Ok)).boxed()
}

/// Sampling parameters after request values are layered over config defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sampling {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
}

impl Sampling {
    pub fn resolve(request: &CompletionRequest, config: &ProviderConfig) -> Self {
        Self {
            temperature: request.temperature.or(config.temperature),
            top_p: request.top_p.or(config.top_p),
            top_k: request.top_k.or(config.top_k),
            max_tokens: request.max_tokens.or(config.max_tokens),
            stop: if request.stop.is_empty() {
                config.stop_sequences.clone()
            } else {
                request.stop.clone()
            },
        }
    }
}

/// Inserts `value` under `key` unless it is `None`.
pub fn insert_opt<T: serde::Serialize>(
    body: &mut serde_json::Map<String, Value>,
    key: &str,
    value: Option<T>,
) {
    if let Some(value) = value.and_then(|value| serde_json::to_value(value).ok()) {
        body.insert(key.to_owned(), value);
    }
}

/// Length-based estimate: roughly four characters per token.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}

pub fn estimate_prompt_tokens(messages: &[Message]) -> u32 {
    let serialized = serde_json::to_string(messages).unwrap_or_default();
    estimate_tokens(&serialized)
}

/// Reported counts win per field; missing fields are estimated.
pub fn resolve_usage(
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    request: &CompletionRequest,
    completion_text: &str,
) -> Usage {
    Usage::new(
        prompt_tokens.unwrap_or_else(|| estimate_prompt_tokens(&request.messages)),
        completion_tokens.unwrap_or_else(|| estimate_tokens(completion_text)),
    )
}

/// Pulls the first system message out of the conversation. Later system
/// messages are dropped.
pub fn split_system(messages: &[Message]) -> (Option<String>, Vec<Message>) {
    let mut system = None;
    let mut conversation = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            MessageRole::System if system.is_none() => system = Some(message.content.clone()),
            MessageRole::System => {
                debug!("dropping additional system message");
            }
            _ => conversation.push(message.clone()),
        }
    }
    (system, conversation)
}

pub fn response_id(provider: &str, upstream: Option<String>) -> String {
    upstream
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("{provider}-{}", Uuid::new_v4()))
}

pub fn unix_timestamp() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_secs() as i64
}

pub fn transport_error(provider: &str, error: &reqwest::Error) -> ProviderError {
    if error.is_connect() {
        ProviderError::Unavailable {
            provider: provider.to_owned(),
            message: format!("connection failed: {error}"),
        }
    } else if error.is_timeout() {
        ProviderError::Timeout {
            provider: provider.to_owned(),
            timeout_ms: 0,
        }
    } else {
        ProviderError::Provider {
            provider: provider.to_owned(),
            status: error.status().map(|status| status.as_u16()),
            code: None,
            message: error.to_string(),
        }
    }
}

pub fn map_status_error(
    provider: &str,
    status: StatusCode,
    retry_after_secs: Option<u64>,
    body: &str,
    model: Option<&str>,
) -> ProviderError {
    let (code, message) = parse_error_body(body);
    let provider = provider.to_owned();

    match status.as_u16() {
        401 | 403 => ProviderError::Authentication { provider, message },
        400 if body.contains("API_KEY_INVALID") => {
            ProviderError::Authentication { provider, message }
        }
        429 if code.as_deref() == Some("insufficient_quota") => ProviderError::Provider {
            provider,
            status: Some(429),
            code,
            message,
        },
        429 => ProviderError::RateLimit {
            provider,
            message,
            retry_after_secs,
        },
        404 => match model {
            Some(model) => ProviderError::ModelNotFound {
                provider,
                model: model.to_owned(),
            },
            None => ProviderError::Provider {
                provider,
                status: Some(404),
                code,
                message,
            },
        },
        408 | 504 => ProviderError::Timeout {
            provider,
            timeout_ms: 0,
        },
        502 | 503 | 529 => ProviderError::Unavailable { provider, message },
        other => ProviderError::Provider {
            provider,
            status: Some(other),
            code,
            message,
        },
    }
}

/// Extracts `(code, message)` from the common JSON error envelopes.
fn parse_error_body(body: &str) -> (Option<String>, String) {
    let trimmed: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return (None, trimmed);
    };

    let error = value.get("error").unwrap_or(&value);
    if let Some(message) = error.as_str() {
        return (None, message.to_owned());
    }
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .unwrap_or(trimmed);
    let code = ["code", "type", "status"]
        .iter()
        .find_map(|key| error.get(*key).and_then(Value::as_str))
        .map(ToOwned::to_owned);
    (code, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{FeatureFlags, ModelInfo};

    #[test]
    fn estimates_four_chars_per_token() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn only_first_system_message_is_honored() {
        let messages = vec![
            Message::system("first"),
            Message::user("hi"),
            Message::system("second"),
            Message::assistant("hello"),
        ];
        let (system, conversation) = split_system(&messages);
        assert_eq!(system.as_deref(), Some("first"));
        assert_eq!(conversation, vec![Message::user("hi"), Message::assistant("hello")]);
    }

    #[test]
    fn reported_usage_wins_per_field() {
        let request = CompletionRequest::new(vec![Message::user("ping")]);
        let usage = resolve_usage(Some(40), None, &request, "abcdefgh");
        assert_eq!(usage.prompt_tokens, 40);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 42);
    }

    #[test]
    fn maps_http_statuses_to_error_kinds() {
        let auth = map_status_error("openai", StatusCode::UNAUTHORIZED, None, "{}", None);
        assert!(matches!(auth, ProviderError::Authentication { .. }));

        let limited = map_status_error(
            "openai",
            StatusCode::TOO_MANY_REQUESTS,
            Some(7),
            r#"{"error":{"message":"slow down","type":"rate_limit_error"}}"#,
            None,
        );
        match limited {
            ProviderError::RateLimit {
                retry_after_secs,
                message,
                ..
            } => {
                assert_eq!(retry_after_secs, Some(7));
                assert_eq!(message, "slow down");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let missing = map_status_error("ollama", StatusCode::NOT_FOUND, None, "", Some("llama9"));
        assert!(matches!(missing, ProviderError::ModelNotFound { ref model, .. } if model == "llama9"));

        let overloaded = map_status_error(
            "anthropic",
            StatusCode::from_u16(529).expect("valid status"),
            None,
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            None,
        );
        assert!(matches!(overloaded, ProviderError::Unavailable { .. }));

        let teapot = map_status_error("google", StatusCode::IM_A_TEAPOT, None, "short and stout", None);
        assert!(matches!(teapot, ProviderError::Provider { status: Some(418), .. }));
    }

    #[test]
    fn quota_exhaustion_keeps_its_code() {
        let error = map_status_error(
            "openai",
            StatusCode::TOO_MANY_REQUESTS,
            None,
            r#"{"error":{"message":"quota","type":"insufficient_quota","code":"insufficient_quota"}}"#,
            None,
        );
        assert_eq!(error.condition(), crate::fallback::FailureCondition::Cost);
    }

    #[test]
    fn google_invalid_key_is_authentication() {
        let error = map_status_error(
            "google",
            StatusCode::BAD_REQUEST,
            None,
            r#"{"error":{"code":400,"message":"API key not valid.","status":"INVALID_ARGUMENT","details":[{"reason":"API_KEY_INVALID"}]}}"#,
            None,
        );
        assert!(matches!(error, ProviderError::Authentication { .. }));
    }

    #[test]
    fn line_buffer_handles_split_chunks() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"data: {\"a\"").is_empty());
        let lines = buffer.push(b":1}\r\n\ndata: [DO");
        assert_eq!(lines, vec!["data: {\"a\":1}"]);
        assert!(buffer.push("NE]".as_bytes()).is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("data: [DONE]"));
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn line_buffer_keeps_multibyte_characters_intact() {
        let mut buffer = LineBuffer::default();
        let bytes = "héllo\n".as_bytes();
        assert!(buffer.push(&bytes[..2]).is_empty());
        assert_eq!(buffer.push(&bytes[2..]), vec!["héllo"]);
    }

    fn context() -> StreamContext {
        let capabilities = Capabilities {
            default_model: "m".to_owned(),
            models: vec![ModelInfo::new("m", 1000, 100, ModelPricing::new(1.0, 2.0))],
            features: FeatureFlags::default(),
        };
        StreamContext::new(
            "mock",
            "m",
            &CompletionRequest::new(vec![Message::user("hi")]),
            &capabilities,
        )
    }

    #[test]
    fn accumulator_prefers_streamed_usage() {
        let mut accumulator = StreamAccumulator::new(context());
        accumulator.apply(StreamPiece::Text("Hello".to_owned()));
        accumulator.apply(StreamPiece::Usage {
            prompt: Some(1000),
            completion: None,
        });
        accumulator.apply(StreamPiece::Usage {
            prompt: None,
            completion: Some(500),
        });
        accumulator.apply(StreamPiece::ResponseId("msg_1".to_owned()));

        match accumulator.finish() {
            StreamEvent::Done {
                id,
                usage,
                cost,
                finish_reason,
                ..
            } => {
                assert_eq!(id, "msg_1");
                assert_eq!(usage, Usage::new(1000, 500));
                assert!((cost.total_cost - 2.0).abs() < 1e-9);
                assert_eq!(finish_reason, FinishReason::Stop);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn accumulator_estimates_missing_usage_and_tool_finish() {
        let mut accumulator = StreamAccumulator::new(context());
        accumulator.apply(StreamPiece::Tool(ToolCallDelta {
            index: 0,
            id: Some("call_1".to_owned()),
            name: Some("lookup".to_owned()),
            arguments: "{\"q\":1}".to_owned(),
        }));

        match accumulator.finish() {
            StreamEvent::Done {
                usage,
                finish_reason,
                ..
            } => {
                assert_eq!(usage.completion_tokens, 2);
                assert!(usage.prompt_tokens > 0);
                assert_eq!(finish_reason, FinishReason::ToolCalls);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_shot_stream_ends_with_done() {
        let response = CompletionResponse {
            id: "r1".to_owned(),
            provider: "google".to_owned(),
            model: "m".to_owned(),
            content: "Hello world".to_owned(),
            tool_calls: None,
            usage: Usage::new(1, 2),
            cost: crate::models::Cost::zero(),
            finish_reason: FinishReason::Stop,
            created: 0,
        };
        let events: Vec<_> = single_shot_stream(response).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Ok(StreamEvent::Content { delta }) if delta == "Hello world"));
        assert!(matches!(&events[1], Ok(StreamEvent::Done { id, .. }) if id == "r1"));
    }
}
