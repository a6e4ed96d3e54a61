use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    backend::{
        common::{
            insert_opt, resolve_usage, response_id, single_shot_stream, split_system,
            unix_timestamp, AdapterCore, Sampling, StreamContext, StreamDecoder, StreamPiece,
        },
        BackendStatus, BackendStream, HealthStatus, InferenceBackend,
    },
    capabilities::{Capabilities, FeatureFlags, ModelInfo, ModelPricing},
    config::ProviderConfig,
    errors::ProviderError,
    models::{
        CompletionRequest, CompletionResponse, FinishReason, ToolCall, ToolCallDelta, ToolChoice,
    },
};

const PROVIDER: &str = "anthropic";
const DEFAULT_VERSION: &str = "2023-06-01";
/// The messages API requires `max_tokens`.
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicAdapter {
    core: AdapterCore,
    capabilities: Capabilities,
}

pub fn anthropic_capabilities() -> Capabilities {
    Capabilities {
        default_model: "claude-3-5-sonnet-20241022".to_owned(),
        models: vec![
            ModelInfo::new(
                "claude-3-5-sonnet-20241022",
                200_000,
                8_192,
                ModelPricing::new(0.003, 0.015),
            ),
            ModelInfo::new(
                "claude-3-5-haiku-20241022",
                200_000,
                8_192,
                ModelPricing::new(0.0008, 0.004),
            ),
            ModelInfo::new(
                "claude-3-opus-20240229",
                200_000,
                4_096,
                ModelPricing::new(0.015, 0.075),
            ),
        ],
        features: FeatureFlags {
            streaming: true,
            tool_use: true,
            vision: true,
            embeddings: false,
            fine_tuning: false,
            batching: true,
        },
    }
}

impl AnthropicAdapter {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            core: AdapterCore::new(PROVIDER, config)?,
            capabilities: anthropic_capabilities(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let config = self.core.config();
        let mut builder = self
            .core
            .client()
            .request(method, self.core.url(path))
            .header(
                "anthropic-version",
                config.option("version").unwrap_or(DEFAULT_VERSION),
            );
        if let Some(api_key) = config.api_key() {
            builder = builder.header("x-api-key", api_key);
        }
        builder
    }

    fn payload(&self, request: &CompletionRequest, model: &str, stream: bool) -> Value {
        let (system, conversation) = split_system(&request.messages);
        let messages = conversation
            .iter()
            .map(|message| json!({"role": message.role.as_str(), "content": message.content}))
            .collect::<Vec<_>>();

        let sampling = Sampling::resolve(request, self.core.config());
        let mut body = Map::new();
        body.insert("model".to_owned(), json!(model));
        body.insert("messages".to_owned(), Value::Array(messages));
        body.insert(
            "max_tokens".to_owned(),
            json!(sampling.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        );
        insert_opt(&mut body, "system", system);
        insert_opt(&mut body, "temperature", sampling.temperature);
        insert_opt(&mut body, "top_p", sampling.top_p);
        insert_opt(&mut body, "top_k", sampling.top_k);
        if !sampling.stop.is_empty() {
            body.insert("stop_sequences".to_owned(), json!(sampling.stop));
        }
        if stream {
            body.insert("stream".to_owned(), json!(true));
        }

        let tools = request.tools.as_ref().filter(|tools| !tools.is_empty());
        let choice = request.tool_choice.as_ref();
        // No "none" mode on this API; omitting the tools has the same effect.
        if let Some(tools) = tools.filter(|_| choice != Some(&ToolChoice::None)) {
            let tools = tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameters,
                    })
                })
                .collect::<Vec<_>>();
            body.insert("tools".to_owned(), Value::Array(tools));
            let choice = match choice {
                Some(ToolChoice::Required) => Some(json!({"type": "any"})),
                Some(ToolChoice::Tool(name)) => Some(json!({"type": "tool", "name": name})),
                Some(ToolChoice::Auto) => Some(json!({"type": "auto"})),
                _ => None,
            };
            insert_opt(&mut body, "tool_choice", choice);
        }

        Value::Object(body)
    }

    async fn execute(
        &self,
        request: &CompletionRequest,
        model: &str,
        deadline: Instant,
    ) -> Result<CompletionResponse, ProviderError> {
        let payload = self.payload(request, model, false);
        let response = self
            .core
            .send(
                || self.request(Method::POST, "v1/messages").json(&payload),
                Some(model),
                deadline,
            )
            .await?;
        let parsed: AnthropicResponse = self.core.read_json(response, deadline).await?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                AnthropicContentBlock::Text { text } => content.push_str(&text),
                AnthropicContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input.to_string(),
                }),
                AnthropicContentBlock::Other => {}
            }
        }

        let usage = resolve_usage(
            parsed.usage.as_ref().and_then(|usage| usage.input_tokens),
            parsed.usage.as_ref().and_then(|usage| usage.output_tokens),
            request,
            &content,
        );

        Ok(CompletionResponse {
            id: response_id(PROVIDER, parsed.id),
            provider: PROVIDER.to_owned(),
            model: parsed.model.unwrap_or_else(|| model.to_owned()),
            cost: self.capabilities.cost_for(model, &usage),
            usage,
            finish_reason: finish_reason(parsed.stop_reason.as_deref()),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            content,
            created: unix_timestamp(),
        })
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        self.core
            .send(
                || self.request(Method::GET, "v1/models"),
                None,
                self.core.deadline(),
            )
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl InferenceBackend for AnthropicAdapter {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        self.core.require_api_key()?;
        self.probe().await?;
        self.core.mark_initialized();
        info!(provider = PROVIDER, "provider initialized");
        Ok(())
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let _inflight = self.core.begin()?;
        let model = self.core.resolve_model(&request, &self.capabilities);
        let result = self.execute(&request, &model, self.core.deadline()).await;
        self.core.record_outcome(result.as_ref().err()).await;
        result
    }

    async fn stream_complete(
        &self,
        request: CompletionRequest,
    ) -> Result<BackendStream, ProviderError> {
        if !self.core.config().streaming {
            return Ok(single_shot_stream(self.complete(request).await?));
        }

        let guard = self.core.begin()?;
        let model = self.core.resolve_model(&request, &self.capabilities);
        let payload = self.payload(&request, &model, true);
        let deadline = self.core.stream_deadline();

        let opened = self
            .core
            .send(
                || self.request(Method::POST, "v1/messages").json(&payload),
                Some(&model),
                deadline,
            )
            .await;
        self.core.record_outcome(opened.as_ref().err()).await;
        let response = opened?;

        let context = StreamContext::new(PROVIDER, &model, &request, &self.capabilities);
        debug!(provider = PROVIDER, model = %model, "stream prepared");
        Ok(self.core.relay_stream(
            response,
            AnthropicStreamDecoder::default(),
            context,
            deadline,
            guard,
        ))
    }

    async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let result = self.probe().await;
        self.core.health_report(started, result).await
    }

    fn caching_enabled(&self) -> bool {
        self.core.config().caching
    }

    async fn status(&self) -> BackendStatus {
        self.core.status().await
    }

    async fn destroy(&self) {
        self.core.destroy().await;
    }
}

fn finish_reason(raw: Option<&str>) -> FinishReason {
    match raw {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

/// Typed SSE events. Only `data:` lines are inspected since every payload
/// repeats its event name in `type`.
#[derive(Debug, Default)]
pub struct AnthropicStreamDecoder {
    /// Content block index to tool-call ordinal.
    tool_blocks: HashMap<usize, usize>,
}

impl StreamDecoder for AnthropicStreamDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamPiece>, ProviderError> {
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(Vec::new());
        };
        let event: AnthropicStreamEvent =
            serde_json::from_str(payload.trim()).map_err(|error| ProviderError::Provider {
                provider: PROVIDER.to_owned(),
                status: None,
                code: Some("invalid_stream_chunk".to_owned()),
                message: error.to_string(),
            })?;

        let pieces = match event {
            AnthropicStreamEvent::MessageStart { message } => {
                let mut pieces = Vec::new();
                if let Some(id) = message.id {
                    pieces.push(StreamPiece::ResponseId(id));
                }
                if let Some(usage) = message.usage {
                    pieces.push(StreamPiece::Usage {
                        prompt: usage.input_tokens,
                        completion: usage.output_tokens.filter(|tokens| *tokens > 0),
                    });
                }
                pieces
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                AnthropicContentBlock::ToolUse { id, name, .. } => {
                    let ordinal = self.tool_blocks.len();
                    self.tool_blocks.insert(index, ordinal);
                    vec![StreamPiece::Tool(ToolCallDelta {
                        index: ordinal,
                        id: Some(id),
                        name: Some(name),
                        arguments: String::new(),
                    })]
                }
                AnthropicContentBlock::Text { text } => vec![StreamPiece::Text(text)],
                AnthropicContentBlock::Other => Vec::new(),
            },
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicDelta::TextDelta { text } => vec![StreamPiece::Text(text)],
                AnthropicDelta::InputJsonDelta { partial_json } => {
                    match self.tool_blocks.get(&index) {
                        Some(ordinal) if !partial_json.is_empty() => {
                            vec![StreamPiece::Tool(ToolCallDelta {
                                index: *ordinal,
                                id: None,
                                name: None,
                                arguments: partial_json,
                            })]
                        }
                        _ => Vec::new(),
                    }
                }
                AnthropicDelta::Other => Vec::new(),
            },
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                let mut pieces = Vec::new();
                if let Some(usage) = usage {
                    pieces.push(StreamPiece::Usage {
                        prompt: usage.input_tokens,
                        completion: usage.output_tokens,
                    });
                }
                if let Some(reason) = delta.and_then(|delta| delta.stop_reason) {
                    pieces.push(StreamPiece::Finish(finish_reason(Some(&reason))));
                }
                pieces
            }
            AnthropicStreamEvent::MessageStop => vec![StreamPiece::End],
            AnthropicStreamEvent::Error { error } => {
                return Err(stream_error(error));
            }
            AnthropicStreamEvent::Other => Vec::new(),
        };
        Ok(pieces)
    }
}

fn stream_error(error: AnthropicError) -> ProviderError {
    match error.error_type.as_deref() {
        Some("overloaded_error") | Some("api_error") => ProviderError::Unavailable {
            provider: PROVIDER.to_owned(),
            message: error.message,
        },
        Some("rate_limit_error") => ProviderError::RateLimit {
            provider: PROVIDER.to_owned(),
            message: error.message,
            retry_after_secs: None,
        },
        _ => ProviderError::Provider {
            provider: PROVIDER.to_owned(),
            status: None,
            code: error.error_type,
            message: error.message,
        },
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicStreamMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: AnthropicContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: AnthropicDelta,
    },
    MessageDelta {
        #[serde(default)]
        delta: Option<AnthropicMessageDelta>,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Error {
        error: AnthropicError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        #[serde(default)]
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    #[serde(default)]
    message: String,
}
