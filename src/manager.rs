//! Request orchestration across registered backends.
//!
//! Per call the manager picks a backend, dispatches, and on failure walks the
//! matching fallback rule before giving up with the original error. Successful
//! non-streaming responses go through the response cache; streams are relayed
//! and accounted for when their `Done` event passes through.

use std::{
    collections::HashSet,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use futures_util::{future::join_all, StreamExt};
use tokio::{
    task::JoinHandle,
    time::{interval, sleep, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    backend::{
        common::{estimate_prompt_tokens, single_shot_stream},
        BackendStatus, BackendStream, HealthStatus, InferenceBackend,
    },
    cache::ResponseCache,
    config::{LoadBalancingStrategy, ManagerConfig},
    errors::ProviderError,
    fallback::FallbackRule,
    fingerprint::fingerprint_for,
    metrics::{ProviderStats, UsageMetrics},
    models::{CompletionRequest, CompletionResponse, StreamEvent},
};

/// Completion budget assumed by cost estimates when the request sets none.
const DEFAULT_COMPLETION_ESTIMATE: u32 = 256;

pub type ResponseStream = BackendStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub provider: String,
    /// Model substituted by cost optimization; `None` keeps the request's own.
    pub model: Option<String>,
}

pub struct ProviderManager {
    providers: Vec<Arc<dyn InferenceBackend>>,
    config: ManagerConfig,
    cache: ResponseCache,
    metrics: UsageMetrics,
    next_index: AtomicUsize,
    destroyed: AtomicBool,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProviderManager {
    pub fn new(
        providers: Vec<Arc<dyn InferenceBackend>>,
        config: ManagerConfig,
    ) -> Result<Self, ProviderError> {
        let mut seen = HashSet::new();
        let duplicates = providers
            .iter()
            .filter(|backend| !seen.insert(backend.name().to_owned()))
            .map(|backend| format!("provider `{}` registered twice", backend.name()))
            .collect::<Vec<_>>();
        if !duplicates.is_empty() {
            return Err(ProviderError::InvalidConfig {
                provider: "router".to_owned(),
                errors: duplicates,
            });
        }

        let metrics = UsageMetrics::new().map_err(|error| ProviderError::InvalidConfig {
            provider: "router".to_owned(),
            errors: vec![format!("metrics registry: {error}")],
        })?;

        info!(
            providers = %providers
                .iter()
                .map(|backend| backend.name())
                .collect::<Vec<_>>()
                .join(","),
            load_balancing = ?config.load_balancing,
            cost_optimization = config.cost_optimization,
            cache_enabled = config.cache.enabled,
            fallback_rules = config.fallback.rules.len(),
            "provider manager configured"
        );

        Ok(Self {
            providers,
            cache: ResponseCache::new(config.cache),
            config,
            metrics,
            next_index: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            health_task: Mutex::new(None),
        })
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|backend| backend.name().to_owned())
            .collect()
    }

    pub fn get_provider(&self, name: &str) -> Option<Arc<dyn InferenceBackend>> {
        self.providers
            .iter()
            .find(|backend| backend.name() == name)
            .cloned()
    }

    pub async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let request = self.prepare(request)?;

        let fingerprint = self.cache.is_enabled().then(|| fingerprint_for(&request));
        if let Some(fingerprint) = &fingerprint {
            if let Some(cached) = self.cache.get(fingerprint.as_str()).await {
                self.metrics.observe_cache(true);
                debug!(provider = %cached.provider, id = %cached.id, "serving cached response");
                return Ok(cached);
            }
            self.metrics.observe_cache(false);
        }

        let (backend, response) = self.serve(request).await?;

        if let Some(fingerprint) = fingerprint {
            if backend.caching_enabled() {
                self.cache.set(fingerprint.as_str(), &response).await;
            } else {
                debug!(provider = %backend.name(), "provider opted out of response caching");
            }
        }
        Ok(response)
    }

    /// Streams never touch the cache. When streaming is disabled for the
    /// router the call runs as a plain completion and replays the result as
    /// a single delta.
    pub async fn stream_complete(
        &self,
        request: CompletionRequest,
    ) -> Result<ResponseStream, ProviderError> {
        let mut request = self.prepare(request)?;
        if !self.config.streaming {
            let (_, response) = self.serve(request).await?;
            return Ok(single_shot_stream(response));
        }

        let selection = self.select_provider(&request).await?;
        let primary = self.require(&selection.provider)?;
        if let Some(model) = selection.model {
            request.model = Some(model);
        }

        let started = Instant::now();
        let (backend, upstream) = self
            .dispatch(primary, request, |backend, request| async move {
                backend.stream_complete(request).await
            })
            .await?;
        debug!(provider = %backend.name(), "stream opened");

        Ok(self.relay(backend.name().to_owned(), upstream, started))
    }

    /// Picks the backend for `request`: explicit preference, cost
    /// optimization, load balancing, configured default, first available.
    pub async fn select_provider(
        &self,
        request: &CompletionRequest,
    ) -> Result<Selection, ProviderError> {
        let available = self.available_providers().await;

        if let Some(preferred) = request.provider.as_deref() {
            if available.iter().any(|(backend, _)| backend.name() == preferred) {
                return Ok(Selection::keep(preferred));
            }
            debug!(provider = preferred, "preferred provider not available");
        }

        if self.config.cost_optimization {
            if let Some(ceiling) = request.max_cost.or(self.config.max_cost) {
                if let Some(selection) = cheapest_within(&available, request, ceiling) {
                    return Ok(selection);
                }
                debug!(ceiling, "no provider fits the cost ceiling");
            }
        }

        if let Some(strategy) = self.config.load_balancing.filter(|_| !available.is_empty()) {
            let chosen = match strategy {
                LoadBalancingStrategy::RoundRobin => {
                    let index = self.next_index.fetch_add(1, Ordering::Relaxed);
                    available.get(index % available.len())
                }
                LoadBalancingStrategy::LeastLoaded => {
                    available.iter().min_by_key(|(_, status)| status.load)
                }
            };
            if let Some((backend, _)) = chosen {
                return Ok(Selection::keep(backend.name()));
            }
        }

        if let Some(default) = self.config.default_provider.as_deref() {
            if available.iter().any(|(backend, _)| backend.name() == default) {
                return Ok(Selection::keep(default));
            }
        }

        available
            .first()
            .map(|(backend, _)| Selection::keep(backend.name()))
            .ok_or(ProviderError::NoAvailableProviders)
    }

    pub async fn statuses(&self) -> Vec<BackendStatus> {
        join_all(self.providers.iter().map(|backend| backend.status())).await
    }

    pub async fn health_check_all(&self) -> Vec<HealthStatus> {
        join_all(self.providers.iter().map(|backend| backend.health_check())).await
    }

    /// Probes every backend on `every`, refreshing circuit state. The task
    /// stops once the manager is dropped or destroyed.
    pub fn spawn_health_checks(self: &Arc<Self>, every: Duration) {
        if every.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if manager.destroyed.load(Ordering::Acquire) {
                    break;
                }
                let reports = manager.health_check_all().await;
                let unhealthy = reports.iter().filter(|report| !report.healthy).count();
                debug!(checked = reports.len(), unhealthy, "health checks completed");
            }
        });

        let previous = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn stats(&self) -> Vec<ProviderStats> {
        self.providers
            .iter()
            .map(|backend| self.metrics.provider_stats(backend.name()))
            .collect()
    }

    pub fn request_count(&self, provider: &str) -> u64 {
        self.metrics.request_count(provider)
    }

    pub fn metrics(&self) -> &UsageMetrics {
        &self.metrics
    }

    pub fn render_metrics(&self) -> Result<String, String> {
        self.metrics.render()
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.len().await
    }

    pub async fn purge_expired(&self) -> usize {
        self.cache.purge_expired().await
    }

    /// Stops health checks and tears down every backend. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        join_all(self.providers.iter().map(|backend| backend.destroy())).await;
        info!("provider manager destroyed");
    }

    fn prepare(&self, mut request: CompletionRequest) -> Result<CompletionRequest, ProviderError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(ProviderError::NoAvailableProviders);
        }
        request.validate().map_err(ProviderError::InvalidRequest)?;
        if request.max_cost.is_none() {
            request.max_cost = self.config.max_cost;
        }
        Ok(request)
    }

    /// Selects, dispatches and books one non-streaming call. No cache access.
    async fn serve(
        &self,
        mut request: CompletionRequest,
    ) -> Result<(Arc<dyn InferenceBackend>, CompletionResponse), ProviderError> {
        let selection = self.select_provider(&request).await?;
        let primary = self.require(&selection.provider)?;
        if let Some(model) = selection.model {
            request.model = Some(model);
        }

        let started = Instant::now();
        let (backend, response) = self
            .dispatch(primary, request, |backend, request| async move {
                backend.complete(request).await
            })
            .await?;

        self.metrics.observe_response(&response);
        self.metrics
            .observe_latency(backend.name(), false, started.elapsed().as_secs_f64());
        info!(
            provider = %response.provider,
            model = %response.model,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            cost_usd = response.cost.total_cost,
            latency_ms = started.elapsed().as_millis() as u64,
            "completion served"
        );
        Ok((backend, response))
    }

    fn require(&self, name: &str) -> Result<Arc<dyn InferenceBackend>, ProviderError> {
        self.get_provider(name)
            .ok_or(ProviderError::NoAvailableProviders)
    }

    /// Registered backends currently reporting available, in registry order.
    async fn available_providers(&self) -> Vec<(Arc<dyn InferenceBackend>, BackendStatus)> {
        let statuses = self.statuses().await;
        self.providers
            .iter()
            .cloned()
            .zip(statuses)
            .filter(|(_, status)| status.available)
            .collect()
    }

    /// Runs `call` on `primary`; on failure applies the fallback rule for the
    /// error's condition. Returns the backend that served the call.
    async fn dispatch<T, F, Fut>(
        &self,
        primary: Arc<dyn InferenceBackend>,
        request: CompletionRequest,
        call: F,
    ) -> Result<(Arc<dyn InferenceBackend>, T), ProviderError>
    where
        F: Fn(Arc<dyn InferenceBackend>, CompletionRequest) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let error = match self.attempt(&primary, request.clone(), &call).await {
            Ok(output) => return Ok((primary, output)),
            Err(error) => error,
        };

        let condition = error.condition();
        let Some(rule) = self.config.fallback.rule_for(condition) else {
            return Err(error);
        };

        for candidate in self.fallback_candidates(rule, primary.name()).await {
            let retargeted = retarget(&request, candidate.as_ref());
            match self.attempt(&candidate, retargeted, &call).await {
                Ok(output) => {
                    self.metrics.observe_fallback(primary.name(), candidate.name());
                    info!(
                        from = %primary.name(),
                        to = %candidate.name(),
                        condition = %condition,
                        "request served by fallback provider"
                    );
                    return Ok((candidate, output));
                }
                Err(fallback_error) => {
                    debug!(
                        provider = %candidate.name(),
                        error = %fallback_error,
                        "fallback candidate failed"
                    );
                }
            }
        }

        if rule.retry_original {
            let delay = error.retry_after().unwrap_or(rule.retry_delay);
            info!(
                provider = %primary.name(),
                delay_ms = delay.as_millis() as u64,
                "retrying original provider"
            );
            sleep(delay).await;
            if let Ok(output) = self.attempt(&primary, request, &call).await {
                return Ok((primary, output));
            }
        }

        Err(error)
    }

    async fn attempt<T, F, Fut>(
        &self,
        backend: &Arc<dyn InferenceBackend>,
        request: CompletionRequest,
        call: &F,
    ) -> Result<T, ProviderError>
    where
        F: Fn(Arc<dyn InferenceBackend>, CompletionRequest) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        debug!(
            provider = %backend.name(),
            model = ?request.model,
            "dispatching request"
        );
        let result = call(backend.clone(), request).await;
        if let Err(error) = &result {
            let condition = error.condition();
            self.metrics.observe_error(backend.name(), condition);
            warn!(
                provider = %backend.name(),
                condition = %condition,
                error = %error,
                "provider call failed"
            );
        }
        result
    }

    async fn fallback_candidates(
        &self,
        rule: &FallbackRule,
        failed: &str,
    ) -> Vec<Arc<dyn InferenceBackend>> {
        let mut candidates = Vec::new();
        for name in &rule.fallback_providers {
            if name == failed {
                continue;
            }
            let Some(backend) = self.get_provider(name) else {
                debug!(provider = %name, "fallback provider not registered");
                continue;
            };
            if !backend.status().await.available {
                debug!(provider = %name, "fallback provider unavailable");
                continue;
            }
            candidates.push(backend);
        }
        candidates
    }

    /// Forwards events untouched and books usage when `Done` passes through.
    fn relay(&self, provider: String, mut upstream: BackendStream, started: Instant) -> ResponseStream {
        let metrics = self.metrics.clone();
        let relayed = async_stream::stream! {
            while let Some(item) = upstream.next().await {
                let terminal = match &item {
                    Ok(StreamEvent::Done { usage, cost, .. }) => {
                        metrics.observe_success(
                            &provider,
                            usage.prompt_tokens,
                            usage.completion_tokens,
                            cost.total_cost,
                        );
                        metrics.observe_latency(&provider, true, started.elapsed().as_secs_f64());
                        info!(
                            provider = %provider,
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            cost_usd = cost.total_cost,
                            "stream completed"
                        );
                        true
                    }
                    Err(error) => {
                        metrics.observe_error(&provider, error.condition());
                        warn!(provider = %provider, error = %error, "stream failed");
                        true
                    }
                    Ok(_) => false,
                };
                yield item;
                if terminal {
                    break;
                }
            }
        };
        relayed.boxed()
    }
}

impl Selection {
    fn keep(provider: &str) -> Self {
        Self {
            provider: provider.to_owned(),
            model: None,
        }
    }
}

/// Cheapest (backend, model) pair whose estimate fits `ceiling`. Ties keep
/// registry order.
fn cheapest_within(
    available: &[(Arc<dyn InferenceBackend>, BackendStatus)],
    request: &CompletionRequest,
    ceiling: f64,
) -> Option<Selection> {
    let prompt_tokens = estimate_prompt_tokens(&request.messages);
    let completion_tokens = request.max_tokens.unwrap_or(DEFAULT_COMPLETION_ESTIMATE);

    let mut best: Option<(Selection, f64)> = None;
    for (backend, _) in available {
        let Some((model, estimate)) = backend.capabilities().cheapest_estimate(
            request.model.as_deref(),
            prompt_tokens,
            completion_tokens,
        ) else {
            continue;
        };
        if estimate > ceiling {
            continue;
        }
        let cheaper = match &best {
            Some((_, current)) => estimate < *current,
            None => true,
        };
        if cheaper {
            best = Some((
                Selection {
                    provider: backend.name().to_owned(),
                    model: Some(model),
                },
                estimate,
            ));
        }
    }

    if let Some((selection, estimate)) = &best {
        debug!(
            provider = %selection.provider,
            model = ?selection.model,
            estimate_usd = estimate,
            "cost-optimized selection"
        );
    }
    best.map(|(selection, _)| selection)
}

/// Drops a model override the candidate does not list so it falls back to its
/// own default.
fn retarget(request: &CompletionRequest, candidate: &dyn InferenceBackend) -> CompletionRequest {
    let mut request = request.clone();
    if request
        .model
        .as_deref()
        .is_some_and(|model| !candidate.capabilities().supports_model(model))
    {
        request.model = None;
    }
    request
}
