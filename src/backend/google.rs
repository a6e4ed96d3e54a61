use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::info;

use crate::{
    backend::{
        common::{
            insert_opt, resolve_usage, response_id, single_shot_stream, split_system,
            unix_timestamp, AdapterCore, Sampling,
        },
        BackendStatus, BackendStream, HealthStatus, InferenceBackend,
    },
    capabilities::{Capabilities, FeatureFlags, ModelInfo, ModelPricing},
    config::ProviderConfig,
    errors::ProviderError,
    models::{
        CompletionRequest, CompletionResponse, FinishReason, MessageRole, ToolCall, ToolChoice,
    },
};

const PROVIDER: &str = "google";

/// Gemini over `generateContent`. Streaming is emulated: the full response is
/// fetched and replayed as a single content delta.
pub struct GoogleAdapter {
    core: AdapterCore,
    capabilities: Capabilities,
}

pub fn google_capabilities() -> Capabilities {
    Capabilities {
        default_model: "gemini-1.5-flash".to_owned(),
        models: vec![
            ModelInfo::new(
                "gemini-1.5-pro",
                2_000_000,
                8_192,
                ModelPricing::new(0.00125, 0.005),
            ),
            ModelInfo::new(
                "gemini-1.5-flash",
                1_000_000,
                8_192,
                ModelPricing::new(0.000075, 0.0003),
            ),
            ModelInfo::new(
                "gemini-2.0-flash",
                1_000_000,
                8_192,
                ModelPricing::new(0.0001, 0.0004),
            ),
        ],
        features: FeatureFlags {
            streaming: false,
            tool_use: true,
            vision: true,
            embeddings: true,
            fine_tuning: false,
            batching: false,
        },
    }
}

impl GoogleAdapter {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            core: AdapterCore::new(PROVIDER, config)?,
            capabilities: google_capabilities(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self.core.client().request(method, self.core.url(path));
        if let Some(api_key) = self.core.config().api_key() {
            builder = builder.header("x-goog-api-key", api_key);
        }
        builder
    }

    fn payload(&self, request: &CompletionRequest) -> Value {
        let (system, conversation) = split_system(&request.messages);
        let contents = conversation
            .iter()
            .map(|message| {
                let role = match message.role {
                    MessageRole::Assistant => "model",
                    _ => "user",
                };
                json!({"role": role, "parts": [{"text": message.content}]})
            })
            .collect::<Vec<_>>();

        let sampling = Sampling::resolve(request, self.core.config());
        let mut generation = Map::new();
        insert_opt(&mut generation, "temperature", sampling.temperature);
        insert_opt(&mut generation, "topP", sampling.top_p);
        insert_opt(&mut generation, "topK", sampling.top_k);
        insert_opt(&mut generation, "maxOutputTokens", sampling.max_tokens);
        if !sampling.stop.is_empty() {
            generation.insert("stopSequences".to_owned(), json!(sampling.stop));
        }

        let mut body = Map::new();
        body.insert("contents".to_owned(), Value::Array(contents));
        insert_opt(
            &mut body,
            "systemInstruction",
            system.map(|text| json!({"parts": [{"text": text}]})),
        );
        if !generation.is_empty() {
            body.insert("generationConfig".to_owned(), Value::Object(generation));
        }

        if let Some(tools) = request.tools.as_ref().filter(|tools| !tools.is_empty()) {
            let declarations = tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    })
                })
                .collect::<Vec<_>>();
            body.insert(
                "tools".to_owned(),
                json!([{"functionDeclarations": declarations}]),
            );
            let config = match &request.tool_choice {
                Some(ToolChoice::Auto) => Some(json!({"mode": "AUTO"})),
                Some(ToolChoice::None) => Some(json!({"mode": "NONE"})),
                Some(ToolChoice::Required) => Some(json!({"mode": "ANY"})),
                Some(ToolChoice::Tool(name)) => {
                    Some(json!({"mode": "ANY", "allowedFunctionNames": [name]}))
                }
                None => None,
            };
            insert_opt(
                &mut body,
                "toolConfig",
                config.map(|config| json!({"functionCallingConfig": config})),
            );
        }

        Value::Object(body)
    }

    async fn execute(
        &self,
        request: &CompletionRequest,
        model: &str,
        deadline: Instant,
    ) -> Result<CompletionResponse, ProviderError> {
        let payload = self.payload(request);
        let path = format!("models/{model}:generateContent");
        let response = self
            .core
            .send(
                || self.request(Method::POST, &path).json(&payload),
                Some(model),
                deadline,
            )
            .await?;
        let parsed: GeminiResponse = self.core.read_json(response, deadline).await?;

        if let Some(reason) = parsed
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason)
        {
            return Err(ProviderError::Provider {
                provider: PROVIDER.to_owned(),
                status: None,
                code: Some("blocked".to_owned()),
                message: format!("prompt blocked: {reason}"),
            });
        }

        let candidate = parsed.candidates.into_iter().next().ok_or_else(|| {
            ProviderError::Provider {
                provider: PROVIDER.to_owned(),
                status: None,
                code: Some("invalid_response".to_owned()),
                message: "missing candidates in response".to_owned(),
            }
        })?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
            if let Some(text) = part.text {
                content.push_str(&text);
            }
            if let Some(call) = part.function_call {
                tool_calls.push(ToolCall {
                    id: format!("call_{}", tool_calls.len()),
                    name: call.name,
                    arguments: call.args.to_string(),
                });
            }
        }

        let usage = resolve_usage(
            parsed
                .usage_metadata
                .as_ref()
                .and_then(|usage| usage.prompt_token_count),
            parsed
                .usage_metadata
                .as_ref()
                .and_then(|usage| usage.candidates_token_count),
            request,
            &content,
        );
        let finish_reason = if !tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            finish_reason(candidate.finish_reason.as_deref())
        };

        Ok(CompletionResponse {
            id: response_id(PROVIDER, parsed.response_id),
            provider: PROVIDER.to_owned(),
            model: model.to_owned(),
            cost: self.capabilities.cost_for(model, &usage),
            usage,
            finish_reason,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            content,
            created: unix_timestamp(),
        })
    }

    async fn run(
        &self,
        request: &CompletionRequest,
        deadline: Instant,
    ) -> Result<CompletionResponse, ProviderError> {
        let _inflight = self.core.begin()?;
        let model = self.core.resolve_model(request, &self.capabilities);
        let result = self.execute(request, &model, deadline).await;
        self.core.record_outcome(result.as_ref().err()).await;
        result
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
impl InferenceBackend for GoogleAdapter {
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
        self.run(&request, self.core.deadline()).await
    }

    /// No native streaming: the round trip runs under the stream deadline and
    /// is replayed as one delta.
    async fn stream_complete(
        &self,
        request: CompletionRequest,
    ) -> Result<BackendStream, ProviderError> {
        let response = self.run(&request, self.core.stream_deadline()).await?;
        Ok(single_shot_stream(response))
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
        Some("MAX_TOKENS") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
    #[serde(default)]
    prompt_feedback: Option<GeminiPromptFeedback>,
    #[serde(default)]
    response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: Option<u32>,
    #[serde(default)]
    candidates_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}
