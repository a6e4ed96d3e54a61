use std::{collections::BTreeMap, env, fmt, str::FromStr, time::Duration};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{cache::CacheConfig, errors::ProviderError, fallback::FallbackStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Google,
    Ollama,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Anthropic,
        ProviderKind::OpenAi,
        ProviderKind::Google,
        ProviderKind::Ollama,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Google => "google",
            Self::Ollama => "ollama",
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Ollama)
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Anthropic => "https://api.anthropic.com",
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Google => "https://generativelanguage.googleapis.com/v1beta",
            Self::Ollama => "http://localhost:11434",
        }
    }

    fn env_prefix(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC",
            Self::OpenAi => "OPENAI",
            Self::Google => "GOOGLE",
            Self::Ollama => "OLLAMA",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "google" | "gemini" => Ok(Self::Google),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("unknown provider `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub stop_sequences: Vec<String>,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub streaming: bool,
    pub caching: bool,
    /// Backend-specific string options such as `organization` or `version`.
    pub options: BTreeMap<String, String>,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            api_key: None,
            base_url: None,
            default_model: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: Vec::new(),
            max_tokens: None,
            timeout: Duration::from_secs(60),
            max_retries: 2,
            streaming: true,
            caching: true,
            options: BTreeMap::new(),
        }
    }

    pub fn ollama(base_url: impl Into<String>) -> Self {
        Self::new(ProviderKind::Ollama).with_base_url(base_url)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(api_key.into()));
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_caching(mut self, caching: bool) -> Self {
        self.caching = caching;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_ref()
            .map(|key| key.expose_secret())
            .filter(|key| !key.trim().is_empty())
    }

    pub fn resolved_base_url(&self) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(self.kind.default_base_url())
            .trim_end_matches('/')
            .to_owned()
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastLoaded,
}

impl FromStr for LoadBalancingStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "round-robin" => Ok(Self::RoundRobin),
            "least_loaded" | "least-loaded" => Ok(Self::LeastLoaded),
            other => Err(format!("unknown load balancing strategy `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub default_provider: Option<String>,
    pub load_balancing: Option<LoadBalancingStrategy>,
    pub cost_optimization: bool,
    /// Ceiling applied to requests that carry none of their own.
    pub max_cost: Option<f64>,
    pub streaming: bool,
    pub cache: CacheConfig,
    pub fallback: FallbackStrategy,
    pub health_check_interval: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_provider: None,
            load_balancing: None,
            cost_optimization: false,
            max_cost: None,
            streaming: true,
            cache: CacheConfig::default(),
            fallback: FallbackStrategy::default(),
            health_check_interval: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub providers: Vec<ProviderConfig>,
    pub manager: ManagerConfig,
}

impl RouterConfig {
    pub fn from_env() -> Result<Self, ProviderError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source. Providers are
    /// enabled by the presence of their credential (or base URL for ollama).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ProviderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let timeout = Duration::from_secs(parse_or(&read, "LLM_TIMEOUT_SECS", 60u64));
        let max_retries = parse_or(&read, "LLM_MAX_RETRIES", 2u32);
        let temperature = parse_opt::<f32>(&read, "LLM_TEMPERATURE");
        let top_p = parse_opt::<f32>(&read, "LLM_TOP_P");
        let max_tokens = parse_opt::<u32>(&read, "LLM_MAX_TOKENS");
        let streaming = read_bool(&read, "ROUTER_STREAMING_ENABLED", true);

        let mut providers = Vec::new();
        for kind in ProviderKind::ALL {
            let prefix = kind.env_prefix();
            let api_key = read(&format!("{prefix}_API_KEY"));
            let base_url = read(&format!("{prefix}_BASE_URL"));

            let enabled = if kind.is_local() {
                base_url.is_some() || read_bool(&read, "OLLAMA_ENABLED", false)
            } else {
                api_key.is_some()
            };
            if !enabled {
                continue;
            }

            let mut config = ProviderConfig::new(kind);
            config.api_key = api_key.map(SecretString::from);
            config.base_url = match (kind.is_local(), base_url) {
                (_, Some(url)) => Some(url),
                (true, None) => Some(kind.default_base_url().to_owned()),
                (false, None) => None,
            };
            config.default_model = read(&format!("{prefix}_MODEL"));
            config.temperature = temperature;
            config.top_p = top_p;
            config.max_tokens = max_tokens;
            config.timeout = timeout;
            config.max_retries = max_retries;
            config.streaming = streaming;
            config.caching = read_bool(&read, &format!("{prefix}_CACHE_ENABLED"), true);

            match kind {
                ProviderKind::OpenAi => {
                    if let Some(organization) = read("OPENAI_ORGANIZATION") {
                        config.options.insert("organization".to_owned(), organization);
                    }
                }
                ProviderKind::Anthropic => {
                    if let Some(version) = read("ANTHROPIC_VERSION") {
                        config.options.insert("version".to_owned(), version);
                    }
                }
                ProviderKind::Google | ProviderKind::Ollama => {}
            }

            providers.push(config);
        }

        let load_balancing = match read("ROUTER_LOAD_BALANCING") {
            None => None,
            Some(value) if value.eq_ignore_ascii_case("none") => None,
            Some(value) => Some(value.parse().map_err(router_config_error)?),
        };
        let fallback = match read("ROUTER_FALLBACK") {
            Some(value) => FallbackStrategy::parse(&value).map_err(router_config_error)?,
            None => FallbackStrategy::default(),
        };
        let health_secs = parse_or(&read, "ROUTER_HEALTH_CHECK_SECS", 0u64);

        let manager = ManagerConfig {
            default_provider: read("ROUTER_DEFAULT_PROVIDER"),
            load_balancing,
            cost_optimization: read_bool(&read, "ROUTER_COST_OPTIMIZATION", false),
            max_cost: parse_opt::<f64>(&read, "ROUTER_MAX_COST"),
            streaming,
            cache: CacheConfig {
                enabled: read_bool(&read, "ROUTER_CACHE_ENABLED", true),
                ttl: Duration::from_secs(parse_or(&read, "ROUTER_CACHE_TTL_SECS", 300u64)),
                max_entries: parse_or(&read, "ROUTER_CACHE_MAX_ENTRIES", 1000usize),
            },
            fallback,
            health_check_interval: (health_secs > 0).then(|| Duration::from_secs(health_secs)),
        };

        Ok(Self { providers, manager })
    }
}

fn router_config_error(error: String) -> ProviderError {
    ProviderError::InvalidConfig {
        provider: "router".to_owned(),
        errors: vec![error],
    }
}

fn parse_opt<T: FromStr>(read: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = read(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}

fn parse_or<T: FromStr>(read: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    parse_opt(read, key).unwrap_or(default)
}

fn read_bool(read: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    read(key)
        .map(|value| {
            let value = value.trim();
            value != "0" && !value.eq_ignore_ascii_case("false") && !value.eq_ignore_ascii_case("no")
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::fallback::FailureCondition;

    fn config_from(pairs: &[(&str, &str)]) -> RouterConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        RouterConfig::from_lookup(|key| vars.get(key).cloned()).expect("config should load")
    }

    #[test]
    fn providers_are_enabled_by_credentials() {
        let config = config_from(&[
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("OPENAI_API_KEY", "sk-openai"),
            ("OPENAI_MODEL", "gpt-4o-mini"),
            ("OPENAI_ORGANIZATION", "org-1"),
            ("GOOGLE_API_KEY", ""),
        ]);

        let kinds: Vec<_> = config.providers.iter().map(|p| p.kind).collect();
        assert_eq!(kinds, vec![ProviderKind::Anthropic, ProviderKind::OpenAi]);
        let openai = &config.providers[1];
        assert_eq!(openai.default_model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(openai.option("organization"), Some("org-1"));
        assert_eq!(openai.api_key(), Some("sk-openai"));
    }

    #[test]
    fn ollama_needs_no_key() {
        let config = config_from(&[("OLLAMA_ENABLED", "true")]);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(
            config.providers[0].base_url.as_deref(),
            Some("http://localhost:11434")
        );
    }

    #[test]
    fn router_settings_have_defaults() {
        let config = config_from(&[]);
        assert!(config.providers.is_empty());
        assert!(config.manager.cache.enabled);
        assert_eq!(config.manager.cache.ttl, Duration::from_secs(300));
        assert_eq!(config.manager.cache.max_entries, 1000);
        assert!(config.manager.load_balancing.is_none());
        assert!(!config.manager.cost_optimization);
        assert!(config.manager.fallback.is_empty());
        assert!(config.manager.health_check_interval.is_none());
    }

    #[test]
    fn router_settings_are_parsed() {
        let config = config_from(&[
            ("ROUTER_DEFAULT_PROVIDER", "anthropic"),
            ("ROUTER_LOAD_BALANCING", "least_loaded"),
            ("ROUTER_COST_OPTIMIZATION", "1"),
            ("ROUTER_MAX_COST", "0.05"),
            ("ROUTER_CACHE_ENABLED", "false"),
            ("ROUTER_FALLBACK", "rate_limit=openai"),
        ]);

        let manager = config.manager;
        assert_eq!(manager.default_provider.as_deref(), Some("anthropic"));
        assert_eq!(manager.load_balancing, Some(LoadBalancingStrategy::LeastLoaded));
        assert!(manager.cost_optimization);
        assert_eq!(manager.max_cost, Some(0.05));
        assert!(!manager.cache.enabled);
        assert!(manager.fallback.rule_for(FailureCondition::RateLimit).is_some());
    }

    #[test]
    fn caching_can_be_disabled_per_provider() {
        let config = config_from(&[
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("OPENAI_API_KEY", "sk-openai"),
            ("OPENAI_CACHE_ENABLED", "false"),
        ]);

        assert!(config.providers[0].caching);
        assert!(!config.providers[1].caching);
        assert!(config.manager.cache.enabled);
    }

    #[test]
    fn invalid_strategy_is_reported() {
        let error = RouterConfig::from_lookup(|key| {
            (key == "ROUTER_LOAD_BALANCING").then(|| "random".to_owned())
        })
        .expect_err("should fail");
        assert!(error.to_string().contains("random"));
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let config = ProviderConfig::new(ProviderKind::OpenAi).with_api_key("sk-secret");
        assert!(!format!("{config:?}").contains("sk-secret"));
    }
}
