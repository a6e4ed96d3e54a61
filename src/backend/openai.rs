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

const PROVIDER: &str = "openai";

pub struct OpenAiAdapter {
    core: AdapterCore,
    capabilities: Capabilities,
}

pub fn openai_capabilities() -> Capabilities {
    Capabilities {
        default_model: "gpt-4o-mini".to_owned(),
        models: vec![
            ModelInfo::new("gpt-4o", 128_000, 16_384, ModelPricing::new(0.0025, 0.01)),
            ModelInfo::new(
                "gpt-4o-mini",
                128_000,
                16_384,
                ModelPricing::new(0.00015, 0.0006),
            ),
            ModelInfo::new("gpt-4-turbo", 128_000, 4_096, ModelPricing::new(0.01, 0.03)),
            ModelInfo::new(
                "gpt-3.5-turbo",
                16_385,
                4_096,
                ModelPricing::new(0.0005, 0.0015),
            ),
        ],
        features: FeatureFlags {
            streaming: true,
            tool_use: true,
            vision: true,
            embeddings: true,
            fine_tuning: true,
            batching: true,
        },
    }
}

impl OpenAiAdapter {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            core: AdapterCore::new(PROVIDER, config)?,
            capabilities: openai_capabilities(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let config = self.core.config();
        let mut builder = self.core.client().request(method, self.core.url(path));
        if let Some(api_key) = config.api_key() {
            builder = builder.bearer_auth(api_key);
        }
        if let Some(organization) = config.option("organization") {
            builder = builder.header("OpenAI-Organization", organization);
        }
        builder
    }

    fn payload(&self, request: &CompletionRequest, model: &str, stream: bool) -> Value {
        let (system, conversation) = split_system(&request.messages);
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        if let Some(system) = system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(
            conversation
                .iter()
                .map(|message| json!({"role": message.role.as_str(), "content": message.content})),
        );

        let sampling = Sampling::resolve(request, self.core.config());
        let mut body = Map::new();
        body.insert("model".to_owned(), json!(model));
        body.insert("messages".to_owned(), Value::Array(messages));
        body.insert("stream".to_owned(), json!(stream));
        insert_opt(&mut body, "temperature", sampling.temperature);
        insert_opt(&mut body, "top_p", sampling.top_p);
        insert_opt(&mut body, "max_tokens", sampling.max_tokens);
        if !sampling.stop.is_empty() {
            body.insert("stop".to_owned(), json!(sampling.stop));
        }
        if stream {
            body.insert("stream_options".to_owned(), json!({"include_usage": true}));
        }

        if let Some(tools) = request.tools.as_ref().filter(|tools| !tools.is_empty()) {
            let tools = tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect::<Vec<_>>();
            body.insert("tools".to_owned(), Value::Array(tools));
            if let Some(choice) = &request.tool_choice {
                body.insert("tool_choice".to_owned(), tool_choice(choice));
            }
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
                || self.request(Method::POST, "chat/completions").json(&payload),
                Some(model),
                deadline,
            )
            .await?;
        let parsed: OpenAiChatResponse = self.core.read_json(response, deadline).await?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            ProviderError::Provider {
                provider: PROVIDER.to_owned(),
                status: None,
                code: Some("invalid_response".to_owned()),
                message: "missing choices in response".to_owned(),
            }
        })?;
        let content = choice.message.content.unwrap_or_default();
        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect::<Vec<_>>();

        let usage = resolve_usage(
            parsed.usage.as_ref().map(|usage| usage.prompt_tokens),
            parsed.usage.as_ref().map(|usage| usage.completion_tokens),
            request,
            &content,
        );

        Ok(CompletionResponse {
            id: response_id(PROVIDER, parsed.id),
            provider: PROVIDER.to_owned(),
            model: model.to_owned(),
            cost: self.capabilities.cost_for(model, &usage),
            usage,
            finish_reason: finish_reason(choice.finish_reason.as_deref()),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            content,
            created: parsed.created.unwrap_or_else(unix_timestamp),
        })
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        self.core
            .send(
                || self.request(Method::GET, "models"),
                None,
                self.core.deadline(),
            )
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl InferenceBackend for OpenAiAdapter {
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
                || self.request(Method::POST, "chat/completions").json(&payload),
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
            OpenAiStreamDecoder::default(),
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

fn tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Required => json!("required"),
        ToolChoice::Tool(name) => json!({"type": "function", "function": {"name": name}}),
    }
}

fn finish_reason(raw: Option<&str>) -> FinishReason {
    match raw {
        Some("length") => FinishReason::Length,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

/// `data:` framed SSE with a `[DONE]` sentinel. Usage arrives in a trailing
/// chunk with no choices when `include_usage` is requested.
#[derive(Debug, Default)]
pub struct OpenAiStreamDecoder {
    saw_id: bool,
}

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamPiece>, ProviderError> {
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(Vec::new());
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            return Ok(vec![StreamPiece::End]);
        }

        let chunk: OpenAiStreamChunk =
            serde_json::from_str(payload).map_err(|error| ProviderError::Provider {
                provider: PROVIDER.to_owned(),
                status: None,
                code: Some("invalid_stream_chunk".to_owned()),
                message: error.to_string(),
            })?;

        if let Some(error) = chunk.error {
            return Err(ProviderError::Provider {
                provider: PROVIDER.to_owned(),
                status: None,
                code: error.code.or(error.error_type),
                message: error.message.unwrap_or_else(|| "stream error".to_owned()),
            });
        }

        let mut pieces = Vec::new();
        if let Some(id) = chunk.id.filter(|_| !self.saw_id) {
            self.saw_id = true;
            pieces.push(StreamPiece::ResponseId(id));
        }
        if let Some(usage) = chunk.usage {
            pieces.push(StreamPiece::Usage {
                prompt: Some(usage.prompt_tokens),
                completion: Some(usage.completion_tokens),
            });
        }

        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(content) = choice.delta.content.filter(|value| !value.is_empty()) {
                pieces.push(StreamPiece::Text(content));
            }
            for call in choice.delta.tool_calls.unwrap_or_default() {
                let function = call.function.unwrap_or_default();
                pieces.push(StreamPiece::Tool(ToolCallDelta {
                    index: call.index,
                    id: call.id,
                    name: function.name,
                    arguments: function.arguments.unwrap_or_default(),
                }));
            }
            if let Some(reason) = choice.finish_reason {
                pieces.push(StreamPiece::Finish(finish_reason(Some(&reason))));
            }
        }

        Ok(pieces)
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    error: Option<OpenAiStreamError>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallChunk>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallChunk {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionChunk>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiFunctionChunk {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
