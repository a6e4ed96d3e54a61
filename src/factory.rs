use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::{
    backend::{
        anthropic::AnthropicAdapter, google::GoogleAdapter, ollama::OllamaAdapter,
        openai::OpenAiAdapter, InferenceBackend,
    },
    config::{ProviderConfig, ProviderKind},
    errors::ProviderError,
};

const MAX_TOKENS_CEILING: u32 = 100_000;

/// Backends that came up, plus the ones that did not and why.
pub struct ProviderSet {
    pub providers: Vec<Arc<dyn InferenceBackend>>,
    pub failures: Vec<(ProviderKind, ProviderError)>,
}

/// Checks a config without touching the network. Every violation is reported.
pub fn validate_config(config: &ProviderConfig) -> Result<(), ProviderError> {
    let mut errors = Vec::new();

    if config.kind.is_local() {
        let base_url = config.resolved_base_url();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            errors.push(format!("base URL must be http(s), got `{base_url}`"));
        }
    } else if config.api_key().is_none() {
        errors.push("API key is required".to_owned());
    }

    if let Some(temperature) = config.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            errors.push(format!("temperature must be within [0, 2], got {temperature}"));
        }
    }
    if let Some(top_p) = config.top_p {
        if !(0.0..=1.0).contains(&top_p) {
            errors.push(format!("top_p must be within [0, 1], got {top_p}"));
        }
    }
    if config.top_k == Some(0) {
        errors.push("top_k must be at least 1".to_owned());
    }
    if let Some(max_tokens) = config.max_tokens {
        if !(1..=MAX_TOKENS_CEILING).contains(&max_tokens) {
            errors.push(format!(
                "max_tokens must be within [1, {MAX_TOKENS_CEILING}], got {max_tokens}"
            ));
        }
    }
    if config.timeout.is_zero() {
        errors.push("timeout must be greater than zero".to_owned());
    }
    if config
        .default_model
        .as_deref()
        .is_some_and(|model| model.trim().is_empty())
    {
        errors.push("default model must not be blank".to_owned());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ProviderError::InvalidConfig {
            provider: config.kind.as_str().to_owned(),
            errors,
        })
    }
}

/// Validates and builds one adapter. No network traffic happens here.
pub fn create_provider(config: ProviderConfig) -> Result<Arc<dyn InferenceBackend>, ProviderError> {
    validate_config(&config)?;
    let backend: Arc<dyn InferenceBackend> = match config.kind {
        ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(config)?),
        ProviderKind::OpenAi => Arc::new(OpenAiAdapter::new(config)?),
        ProviderKind::Google => Arc::new(GoogleAdapter::new(config)?),
        ProviderKind::Ollama => Arc::new(OllamaAdapter::new(config)?),
    };
    Ok(backend)
}

pub struct ProviderFactory;

impl ProviderFactory {
    /// Builds and initializes every backend concurrently. One backend failing
    /// does not affect the others; only zero survivors is an error.
    pub async fn create(configs: Vec<ProviderConfig>) -> Result<ProviderSet, ProviderError> {
        let attempts = configs.into_iter().map(|config| async move {
            let kind = config.kind;
            let outcome = match create_provider(config) {
                Ok(backend) => backend.initialize().await.map(|()| backend),
                Err(error) => Err(error),
            };
            (kind, outcome)
        });

        let mut providers = Vec::new();
        let mut failures = Vec::new();
        for (kind, outcome) in join_all(attempts).await {
            match outcome {
                Ok(backend) => {
                    info!(provider = %kind, "provider ready");
                    providers.push(backend);
                }
                Err(error) => {
                    warn!(provider = %kind, error = %error, "provider failed to initialize");
                    failures.push((kind, error));
                }
            }
        }

        if providers.is_empty() {
            return Err(ProviderError::Initialization {
                failures: failures
                    .iter()
                    .map(|(kind, error)| format!("{kind}: {error}"))
                    .collect(),
            });
        }

        Ok(ProviderSet {
            providers,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn remote_backends_need_a_key() {
        let error = validate_config(&ProviderConfig::new(ProviderKind::OpenAi))
            .expect_err("missing key should fail");
        assert!(matches!(
            error,
            ProviderError::InvalidConfig { ref provider, ref errors }
                if provider == "openai" && errors.len() == 1
        ));
    }

    #[test]
    fn local_backend_needs_no_key() {
        assert!(validate_config(&ProviderConfig::ollama("http://localhost:11434")).is_ok());
        assert!(validate_config(&ProviderConfig::ollama("localhost:11434")).is_err());
    }

    #[test]
    fn reports_every_violation() {
        let mut config = ProviderConfig::new(ProviderKind::Anthropic)
            .with_api_key("key")
            .with_timeout(Duration::ZERO)
            .with_model(" ");
        config.temperature = Some(3.5);
        config.top_p = Some(1.5);
        config.top_k = Some(0);
        config.max_tokens = Some(0);

        match validate_config(&config) {
            Err(ProviderError::InvalidConfig { errors, .. }) => assert_eq!(errors.len(), 6),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn creates_adapter_without_network() {
        let backend = create_provider(
            ProviderConfig::new(ProviderKind::Google).with_api_key("AIza-test"),
        )
        .expect("google adapter");
        assert_eq!(backend.name(), "google");
        assert!(backend.get_model_info("gemini-1.5-pro").is_some());
    }
}
