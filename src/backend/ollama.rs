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
    models::{CompletionRequest, CompletionResponse, FinishReason, ToolCall, ToolCallDelta},
};

const PROVIDER: &str = "ollama";

/// Local Ollama server. No credentials; streaming bodies are NDJSON.
pub struct OllamaAdapter {
    core: AdapterCore,
    capabilities: Capabilities,
}

pub fn ollama_capabilities() -> Capabilities {
    Capabilities {
        default_model: "llama3.1".to_owned(),
        models: vec![
            ModelInfo::new("llama3.1", 128_000, 4_096, ModelPricing::FREE),
            ModelInfo::new("mistral", 32_768, 4_096, ModelPricing::FREE),
            ModelInfo::new("qwen2.5", 32_768, 8_192, ModelPricing::FREE),
        ],
        features: FeatureFlags {
            streaming: true,
            tool_use: true,
            vision: false,
            embeddings: true,
            fine_tuning: false,
            batching: false,
        },
    }
}

impl OllamaAdapter {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            core: AdapterCore::new(PROVIDER, config)?,
            capabilities: ollama_capabilities(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.core.client().request(method, self.core.url(path))
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
        let mut options = Map::new();
        insert_opt(&mut options, "temperature", sampling.temperature);
        insert_opt(&mut options, "top_p", sampling.top_p);
        insert_opt(&mut options, "top_k", sampling.top_k);
        insert_opt(&mut options, "num_predict", sampling.max_tokens);
        if !sampling.stop.is_empty() {
            options.insert("stop".to_owned(), json!(sampling.stop));
        }

        let mut body = Map::new();
        body.insert("model".to_owned(), json!(model));
        body.insert("messages".to_owned(), Value::Array(messages));
        body.insert("stream".to_owned(), json!(stream));
        if !options.is_empty() {
            body.insert("options".to_owned(), Value::Object(options));
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
                || self.request(Method::POST, "api/chat").json(&payload),
                Some(model),
                deadline,
            )
            .await?;
        let parsed: OllamaChatChunk = self.core.read_json(response, deadline).await?;
        if let Some(message) = parsed.error {
            return Err(chunk_error(message, model));
        }

        let message = parsed.message.unwrap_or_default();
        let tool_calls = message
            .tool_calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| ToolCall {
                id: format!("call_{index}"),
                name: call.function.name,
                arguments: call.function.arguments.to_string(),
            })
            .collect::<Vec<_>>();
        let usage = resolve_usage(
            parsed.prompt_eval_count,
            parsed.eval_count,
            request,
            &message.content,
        );
        let finish_reason = if tool_calls.is_empty() {
            finish_reason(parsed.done_reason.as_deref())
        } else {
            FinishReason::ToolCalls
        };

        Ok(CompletionResponse {
            id: response_id(PROVIDER, None),
            provider: PROVIDER.to_owned(),
            model: parsed.model.unwrap_or_else(|| model.to_owned()),
            cost: self.capabilities.cost_for(model, &usage),
            usage,
            finish_reason,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            content: message.content,
            created: unix_timestamp(),
        })
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        self.core
            .send(
                || self.request(Method::GET, "api/tags"),
                None,
                self.core.deadline(),
            )
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl InferenceBackend for OllamaAdapter {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        self.probe().await?;
        self.core.mark_initialized();
        info!(
            provider = PROVIDER,
            base_url = %self.core.config().resolved_base_url(),
            "provider initialized"
        );
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
                || self.request(Method::POST, "api/chat").json(&payload),
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
            OllamaStreamDecoder::new(model),
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
        Some("length") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

fn chunk_error(message: String, model: &str) -> ProviderError {
    if message.contains("not found") {
        ProviderError::ModelNotFound {
            provider: PROVIDER.to_owned(),
            model: model.to_owned(),
        }
    } else {
        ProviderError::Provider {
            provider: PROVIDER.to_owned(),
            status: None,
            code: None,
            message,
        }
    }
}

/// One JSON object per line; the final object carries `done: true` and the
/// eval counts.
#[derive(Debug)]
pub struct OllamaStreamDecoder {
    model: String,
    tool_calls: usize,
}

impl OllamaStreamDecoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            tool_calls: 0,
        }
    }
}

impl StreamDecoder for OllamaStreamDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamPiece>, ProviderError> {
        let chunk: OllamaChatChunk =
            serde_json::from_str(line).map_err(|error| ProviderError::Provider {
                provider: PROVIDER.to_owned(),
                status: None,
                code: Some("invalid_stream_chunk".to_owned()),
                message: error.to_string(),
            })?;
        if let Some(message) = chunk.error {
            return Err(chunk_error(message, &self.model));
        }

        let mut pieces = Vec::new();
        if let Some(message) = chunk.message {
            if !message.content.is_empty() {
                pieces.push(StreamPiece::Text(message.content));
            }
            for call in message.tool_calls {
                pieces.push(StreamPiece::Tool(ToolCallDelta {
                    index: self.tool_calls,
                    id: Some(format!("call_{}", self.tool_calls)),
                    name: Some(call.function.name),
                    arguments: call.function.arguments.to_string(),
                }));
                self.tool_calls += 1;
            }
        }

        if chunk.done {
            pieces.push(StreamPiece::Usage {
                prompt: chunk.prompt_eval_count,
                completion: chunk.eval_count,
            });
            if self.tool_calls == 0 {
                pieces.push(StreamPiece::Finish(finish_reason(
                    chunk.done_reason.as_deref(),
                )));
            } else {
                pieces.push(StreamPiece::Finish(FinishReason::ToolCalls));
            }
            pieces.push(StreamPiece::End);
        }
        Ok(pieces)
    }
}

#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Debug, Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}
