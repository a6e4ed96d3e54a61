use prometheus::{
    opts, CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Registry, TextEncoder,
};
use serde::Serialize;

use crate::{fallback::FailureCondition, models::CompletionResponse};

/// Per-manager usage bookkeeping. Each instance owns its own registry, so
/// separate managers never share counters.
#[derive(Clone)]
pub struct UsageMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    tokens_total: IntCounterVec,
    cost_usd_total: CounterVec,
    errors_total: IntCounterVec,
    fallbacks_total: IntCounterVec,
    cache_lookups_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStats {
    pub provider: String,
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub errors: u64,
}

impl UsageMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            opts!(
                "router_provider_requests_total",
                "Successful completions served per provider"
            ),
            &["provider"],
        )?;
        let tokens_total = IntCounterVec::new(
            opts!("router_provider_tokens_total", "Token usage per provider"),
            &["provider", "kind"],
        )?;
        let cost_usd_total = CounterVec::new(
            opts!(
                "router_provider_cost_usd_total",
                "Computed spend in USD per provider"
            ),
            &["provider"],
        )?;
        let errors_total = IntCounterVec::new(
            opts!(
                "router_provider_errors_total",
                "Provider failures by classified condition"
            ),
            &["provider", "condition"],
        )?;
        let fallbacks_total = IntCounterVec::new(
            opts!(
                "router_fallbacks_total",
                "Requests served by a fallback provider"
            ),
            &["from", "to"],
        )?;
        let cache_lookups_total = IntCounterVec::new(
            opts!("router_cache_lookups_total", "Response cache lookups"),
            &["outcome"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "router_provider_request_duration_seconds",
                "Provider call latency in seconds",
            ),
            &["provider", "stream"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(tokens_total.clone()))?;
        registry.register(Box::new(cost_usd_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(fallbacks_total.clone()))?;
        registry.register(Box::new(cache_lookups_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            tokens_total,
            cost_usd_total,
            errors_total,
            fallbacks_total,
            cache_lookups_total,
            request_duration_seconds,
        })
    }

    pub fn observe_success(
        &self,
        provider: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
        cost_usd: f64,
    ) {
        self.requests_total.with_label_values(&[provider]).inc();
        self.tokens_total
            .with_label_values(&[provider, "prompt"])
            .inc_by(prompt_tokens as u64);
        self.tokens_total
            .with_label_values(&[provider, "completion"])
            .inc_by(completion_tokens as u64);
        if cost_usd > 0.0 {
            self.cost_usd_total
                .with_label_values(&[provider])
                .inc_by(cost_usd);
        }
    }

    pub fn observe_response(&self, response: &CompletionResponse) {
        self.observe_success(
            &response.provider,
            response.usage.prompt_tokens,
            response.usage.completion_tokens,
            response.cost.total_cost,
        );
    }

    pub fn observe_latency(&self, provider: &str, stream: bool, seconds: f64) {
        let stream_label = if stream { "true" } else { "false" };
        self.request_duration_seconds
            .with_label_values(&[provider, stream_label])
            .observe(seconds);
    }

    pub fn observe_error(&self, provider: &str, condition: FailureCondition) {
        self.errors_total
            .with_label_values(&[provider, condition.as_str()])
            .inc();
    }

    pub fn observe_fallback(&self, from: &str, to: &str) {
        self.fallbacks_total.with_label_values(&[from, to]).inc();
    }

    pub fn observe_cache(&self, hit: bool) {
        let outcome = if hit { "hit" } else { "miss" };
        self.cache_lookups_total.with_label_values(&[outcome]).inc();
    }

    pub fn request_count(&self, provider: &str) -> u64 {
        self.requests_total.with_label_values(&[provider]).get()
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_lookups_total.with_label_values(&["hit"]).get()
    }

    pub fn fallback_count(&self, from: &str, to: &str) -> u64 {
        self.fallbacks_total.with_label_values(&[from, to]).get()
    }

    pub fn provider_stats(&self, provider: &str) -> ProviderStats {
        let errors = FailureCondition::ALL
            .iter()
            .map(|condition| {
                self.errors_total
                    .with_label_values(&[provider, condition.as_str()])
                    .get()
            })
            .sum();

        ProviderStats {
            provider: provider.to_owned(),
            requests: self.request_count(provider),
            prompt_tokens: self
                .tokens_total
                .with_label_values(&[provider, "prompt"])
                .get(),
            completion_tokens: self
                .tokens_total
                .with_label_values(&[provider, "completion"])
                .get(),
            cost_usd: self.cost_usd_total.with_label_values(&[provider]).get(),
            errors,
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}
