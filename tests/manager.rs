use std::{collections::HashMap, sync::Arc, time::Duration};

use futures_util::StreamExt;
use llm_provider_router::{
    backend::{mock::MockBackend, InferenceBackend},
    cache::CacheConfig,
    capabilities::{ModelInfo, ModelPricing},
    config::{LoadBalancingStrategy, ManagerConfig},
    errors::ProviderError,
    fallback::{FailureCondition, FallbackRule, FallbackStrategy},
    manager::{ProviderManager, Selection},
    models::{CompletionRequest, Message, StreamEvent},
};

fn request(text: &str) -> CompletionRequest {
    CompletionRequest::new(vec![Message::user(text)])
}

fn no_cache() -> ManagerConfig {
    ManagerConfig {
        cache: CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        },
        ..ManagerConfig::default()
    }
}

fn manager(mocks: &[Arc<MockBackend>], config: ManagerConfig) -> ProviderManager {
    let backends = mocks
        .iter()
        .map(|mock| mock.clone() as Arc<dyn InferenceBackend>)
        .collect();
    ProviderManager::new(backends, config).expect("manager")
}

fn rate_limited(provider: &str) -> ProviderError {
    ProviderError::RateLimit {
        provider: provider.to_owned(),
        message: "slow down".to_owned(),
        retry_after_secs: None,
    }
}

#[tokio::test]
async fn explicit_preference_wins_when_available() {
    let a = Arc::new(MockBackend::named("a"));
    let b = Arc::new(MockBackend::named("b"));
    let router = manager(&[a.clone(), b.clone()], no_cache());

    let response = router
        .complete(request("hi").with_provider("b"))
        .await
        .expect("completion");
    assert_eq!(response.provider, "b");

    b.set_available(false);
    let response = router
        .complete(request("hi").with_provider("b"))
        .await
        .expect("completion");
    assert_eq!(response.provider, "a");
}

#[tokio::test]
async fn cost_optimization_picks_cheapest_model_within_ceiling() {
    let a = Arc::new(MockBackend::named("a").with_pricing(0.03, 0.06));
    let b = Arc::new(MockBackend::named("b").with_models(vec![
        ModelInfo::new("b-large", 8_192, 2_048, ModelPricing::new(0.01, 0.02)),
        ModelInfo::new("b-small", 8_192, 2_048, ModelPricing::new(0.0005, 0.0015)),
    ]));
    let config = ManagerConfig {
        cost_optimization: true,
        ..no_cache()
    };
    let router = manager(&[a, b.clone()], config);

    let selection = router
        .select_provider(&request("hi").with_max_cost(1.0))
        .await
        .expect("selection");
    assert_eq!(
        selection,
        Selection {
            provider: "b".to_owned(),
            model: Some("b-small".to_owned()),
        }
    );

    let response = router
        .complete(request("hi").with_max_cost(1.0))
        .await
        .expect("completion");
    assert_eq!(response.provider, "b");
    assert_eq!(response.model, "b-small");
    assert_eq!(b.requested_models(), vec![Some("b-small".to_owned())]);
}

#[tokio::test]
async fn cost_optimization_falls_through_when_nothing_fits() {
    let a = Arc::new(MockBackend::named("a").with_pricing(10.0, 10.0));
    let b = Arc::new(MockBackend::named("b").with_pricing(20.0, 20.0));
    let config = ManagerConfig {
        cost_optimization: true,
        default_provider: Some("b".to_owned()),
        ..no_cache()
    };
    let router = manager(&[a, b], config);

    let selection = router
        .select_provider(&request("hi").with_max_cost(0.000_001))
        .await
        .expect("selection");
    assert_eq!(selection.provider, "b");
    assert_eq!(selection.model, None);
}

#[tokio::test]
async fn round_robin_spreads_requests_evenly() {
    let mocks = ["a", "b", "c"].map(|name| Arc::new(MockBackend::named(name)));
    let config = ManagerConfig {
        load_balancing: Some(LoadBalancingStrategy::RoundRobin),
        ..no_cache()
    };
    let router = manager(&mocks, config);

    let mut served = HashMap::new();
    for _ in 0..9 {
        let response = router.complete(request("hi")).await.expect("completion");
        *served.entry(response.provider).or_insert(0) += 1;
    }
    assert_eq!(served.get("a"), Some(&3));
    assert_eq!(served.get("b"), Some(&3));
    assert_eq!(served.get("c"), Some(&3));
}

#[tokio::test]
async fn least_loaded_prefers_idle_backend_and_breaks_ties_by_order() {
    let a = Arc::new(MockBackend::named("a"));
    let b = Arc::new(MockBackend::named("b"));
    let c = Arc::new(MockBackend::named("c"));
    let config = ManagerConfig {
        load_balancing: Some(LoadBalancingStrategy::LeastLoaded),
        ..no_cache()
    };
    let router = manager(&[a.clone(), b.clone(), c.clone()], config);

    a.set_load(4);
    b.set_load(1);
    c.set_load(1);
    let selection = router.select_provider(&request("hi")).await.expect("selection");
    assert_eq!(selection.provider, "b");
}

#[tokio::test]
async fn default_then_first_available() {
    let a = Arc::new(MockBackend::named("a"));
    let b = Arc::new(MockBackend::named("b"));
    let config = ManagerConfig {
        default_provider: Some("b".to_owned()),
        ..no_cache()
    };
    let router = manager(&[a.clone(), b.clone()], config);

    assert_eq!(
        router.select_provider(&request("hi")).await.expect("selection").provider,
        "b"
    );
    b.set_available(false);
    assert_eq!(
        router.select_provider(&request("hi")).await.expect("selection").provider,
        "a"
    );
}

#[tokio::test]
async fn no_available_providers_is_fatal() {
    let a = Arc::new(MockBackend::named("a"));
    a.set_available(false);
    let router = manager(&[a.clone()], no_cache());

    let error = router.complete(request("hi")).await.expect_err("no providers");
    assert!(matches!(error, ProviderError::NoAvailableProviders));
    assert_eq!(a.calls(), 0);
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_selection() {
    let a = Arc::new(MockBackend::named("a"));
    let router = manager(&[a.clone()], no_cache());

    let error = router
        .complete(CompletionRequest::new(Vec::new()))
        .await
        .expect_err("empty request");
    assert!(matches!(error, ProviderError::InvalidRequest(_)));
    assert_eq!(a.calls(), 0);
}

#[tokio::test]
async fn rate_limit_falls_back_past_unavailable_candidates() {
    let a = Arc::new(MockBackend::named("a").failing_with(rate_limited("a")));
    let b = Arc::new(MockBackend::named("b"));
    let c = Arc::new(MockBackend::named("c"));
    b.set_available(false);
    let config = ManagerConfig {
        default_provider: Some("a".to_owned()),
        fallback: FallbackStrategy::default().with_rule(FallbackRule::new(
            FailureCondition::RateLimit,
            ["a", "missing", "b", "c"],
        )),
        ..no_cache()
    };
    let router = manager(&[a.clone(), b.clone(), c.clone()], config);

    let response = router.complete(request("hi")).await.expect("fallback");
    assert_eq!(response.provider, "c");
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 0);
    assert_eq!(c.calls(), 1);
    assert_eq!(router.metrics().fallback_count("a", "c"), 1);
    assert_eq!(router.request_count("c"), 1);
    assert_eq!(router.request_count("a"), 0);
}

#[tokio::test]
async fn fallback_clears_models_the_candidate_does_not_list() {
    let anthropic = Arc::new(
        MockBackend::named("anthropic")
            .with_models(vec![ModelInfo::new(
                "claude-3-5-sonnet-20241022",
                200_000,
                8_192,
                ModelPricing::new(0.003, 0.015),
            )])
            .failing_with(ProviderError::Unavailable {
                provider: "anthropic".to_owned(),
                message: "overloaded".to_owned(),
            }),
    );
    let openai = Arc::new(MockBackend::named("openai").with_models(vec![ModelInfo::new(
        "gpt-4o-mini",
        128_000,
        16_384,
        ModelPricing::new(0.00015, 0.0006),
    )]));
    let config = ManagerConfig {
        fallback: FallbackStrategy::default().with_rule(FallbackRule::new(
            FailureCondition::Unavailable,
            ["openai"],
        )),
        ..no_cache()
    };
    let router = manager(&[anthropic.clone(), openai.clone()], config);

    let response = router
        .complete(
            request("hi")
                .with_provider("anthropic")
                .with_model("claude-3-5-sonnet-20241022"),
        )
        .await
        .expect("fallback");
    assert_eq!(response.provider, "openai");
    assert_eq!(response.model, "gpt-4o-mini");
    assert_eq!(openai.requested_models(), vec![None]);
}

#[tokio::test]
async fn original_error_surfaces_when_fallback_is_exhausted() {
    let a = Arc::new(MockBackend::named("a").failing_with(rate_limited("a")));
    let b = Arc::new(MockBackend::named("b").failing_with(ProviderError::Unavailable {
        provider: "b".to_owned(),
        message: "down".to_owned(),
    }));
    let config = ManagerConfig {
        fallback: FallbackStrategy::default()
            .with_rule(FallbackRule::new(FailureCondition::RateLimit, ["b"])),
        ..no_cache()
    };
    let router = manager(&[a, b.clone()], config);

    let error = router.complete(request("hi")).await.expect_err("exhausted");
    assert!(matches!(error, ProviderError::RateLimit { ref provider, .. } if provider == "a"));
    assert_eq!(b.calls(), 1);
}

#[tokio::test]
async fn errors_without_a_rule_are_not_retried() {
    let a = Arc::new(MockBackend::named("a").failing_with(ProviderError::Authentication {
        provider: "a".to_owned(),
        message: "bad key".to_owned(),
    }));
    let b = Arc::new(MockBackend::named("b"));
    let config = ManagerConfig {
        fallback: FallbackStrategy::default()
            .with_rule(FallbackRule::new(FailureCondition::RateLimit, ["b"])),
        ..no_cache()
    };
    let router = manager(&[a.clone(), b.clone()], config);

    let error = router.complete(request("hi")).await.expect_err("auth error");
    assert!(matches!(error, ProviderError::Authentication { .. }));
    assert_eq!(b.calls(), 0);
    assert_eq!(router.stats()[0].errors, 1);
}

#[tokio::test(start_paused = true)]
async fn retry_original_waits_for_retry_after_hint() {
    let a = Arc::new(MockBackend::named("a"));
    a.fail_next(ProviderError::RateLimit {
        provider: "a".to_owned(),
        message: "slow down".to_owned(),
        retry_after_secs: Some(30),
    });
    let config = ManagerConfig {
        fallback: FallbackStrategy::default().with_rule(
            FallbackRule::new(FailureCondition::RateLimit, Vec::<String>::new())
                .with_retry_original(Duration::from_secs(1)),
        ),
        ..no_cache()
    };
    let router = manager(&[a.clone()], config);

    let started = tokio::time::Instant::now();
    let response = router.complete(request("hi")).await.expect("retried");
    assert_eq!(response.provider, "a");
    assert_eq!(a.calls(), 2);
    assert!(started.elapsed() >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn cache_hits_until_ttl_expires() {
    let a = Arc::new(MockBackend::named("a"));
    let config = ManagerConfig {
        cache: CacheConfig {
            enabled: true,
            ttl: Duration::from_secs(60),
            max_entries: 10,
        },
        ..ManagerConfig::default()
    };
    let router = manager(&[a.clone()], config);

    let first = router.complete(request("repeat me")).await.expect("first");
    let second = router.complete(request("repeat me")).await.expect("second");
    assert_eq!(first, second);
    assert_eq!(a.calls(), 1);
    assert_eq!(router.request_count("a"), 1);
    assert_eq!(router.metrics().cache_hits(), 1);
    assert_eq!(router.cache_len().await, 1);

    // Routing hints do not split the cache.
    let third = router
        .complete(request("repeat me").with_provider("a").with_max_cost(5.0))
        .await
        .expect("third");
    assert_eq!(third.id, first.id);
    assert_eq!(a.calls(), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    let fourth = router.complete(request("repeat me")).await.expect("fourth");
    assert_ne!(fourth.id, first.id);
    assert_eq!(a.calls(), 2);

    router.clear_cache().await;
    assert_eq!(router.cache_len().await, 0);
}

#[tokio::test]
async fn stream_delivers_content_then_single_done() {
    let a = Arc::new(MockBackend::named("a").with_reply("Hello world"));
    let router = manager(&[a.clone()], no_cache());

    let events: Vec<StreamEvent> = router
        .stream_complete(request("greet me"))
        .await
        .expect("stream opens")
        .map(|event| event.expect("stream event"))
        .collect()
        .await;

    let text: String = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Content { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello world");
    assert_eq!(events.iter().filter(|event| event.is_done()).count(), 1);
    assert!(events.last().is_some_and(StreamEvent::is_done));
    assert_eq!(router.request_count("a"), 1);
    assert_eq!(router.cache_len().await, 0);
}

#[tokio::test]
async fn stream_open_errors_use_fallback() {
    let a = Arc::new(MockBackend::named("a").failing_with(rate_limited("a")));
    let b = Arc::new(MockBackend::named("b").with_reply("from b"));
    let config = ManagerConfig {
        fallback: FallbackStrategy::default()
            .with_rule(FallbackRule::new(FailureCondition::RateLimit, ["b"])),
        ..no_cache()
    };
    let router = manager(&[a, b], config);

    let events: Vec<_> = router
        .stream_complete(request("hi"))
        .await
        .expect("fallback stream")
        .collect()
        .await;
    match events.last() {
        Some(Ok(StreamEvent::Done { provider, .. })) => assert_eq!(provider, "b"),
        other => panic!("unexpected final event: {other:?}"),
    }
}

#[tokio::test]
async fn disabled_streaming_replays_without_touching_the_cache() {
    let a = Arc::new(MockBackend::named("a").with_reply("Hello world"));
    let config = ManagerConfig {
        streaming: false,
        ..ManagerConfig::default()
    };
    let router = manager(&[a.clone()], config);

    for _ in 0..2 {
        let events: Vec<StreamEvent> = router
            .stream_complete(request("same prompt"))
            .await
            .expect("stream opens")
            .map(|event| event.expect("stream event"))
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            StreamEvent::Content { delta } if delta == "Hello world"
        ));
        assert!(events[1].is_done());
    }

    assert_eq!(a.calls(), 2);
    assert_eq!(router.cache_len().await, 0);
    assert_eq!(router.metrics().cache_hits(), 0);
    assert_eq!(router.request_count("a"), 2);
}

#[tokio::test]
async fn providers_can_opt_out_of_caching() {
    let a = Arc::new(MockBackend::named("a").with_caching(false));
    let b = Arc::new(MockBackend::named("b"));
    let router = manager(&[a.clone(), b.clone()], ManagerConfig::default());

    router
        .complete(request("uncached").with_provider("a"))
        .await
        .expect("first");
    router
        .complete(request("uncached").with_provider("a"))
        .await
        .expect("second");
    assert_eq!(a.calls(), 2);
    assert_eq!(router.cache_len().await, 0);

    router
        .complete(request("cached").with_provider("b"))
        .await
        .expect("first");
    router
        .complete(request("cached").with_provider("b"))
        .await
        .expect("second");
    assert_eq!(b.calls(), 1);
    assert_eq!(router.cache_len().await, 1);
}

#[tokio::test]
async fn default_backend_serves_until_rate_limited_then_falls_back() {
    let anthropic = Arc::new(MockBackend::named("anthropic"));
    let openai = Arc::new(MockBackend::named("openai"));
    let config = ManagerConfig {
        default_provider: Some("anthropic".to_owned()),
        fallback: FallbackStrategy::default()
            .with_rule(FallbackRule::new(FailureCondition::RateLimit, ["openai"])),
        ..no_cache()
    };
    let router = manager(&[anthropic.clone(), openai.clone()], config);

    let selection = router
        .select_provider(&request("hello"))
        .await
        .expect("selection");
    assert_eq!(
        selection,
        Selection {
            provider: "anthropic".to_owned(),
            model: None,
        }
    );
    let response = router.complete(request("hello")).await.expect("completion");
    assert_eq!(response.provider, "anthropic");

    anthropic.fail_next(rate_limited("anthropic"));
    let response = router.complete(request("hello")).await.expect("fallback");
    assert_eq!(response.provider, "openai");
    assert_eq!(anthropic.calls(), 2);
    assert_eq!(openai.calls(), 1);
    assert_eq!(router.metrics().fallback_count("anthropic", "openai"), 1);
}

#[tokio::test]
async fn destroy_tears_down_backends() {
    let a = Arc::new(MockBackend::named("a"));
    let router = Arc::new(manager(&[a.clone()], no_cache()));
    router.spawn_health_checks(Duration::from_secs(3600));

    router.destroy().await;
    router.destroy().await;
    assert!(a.is_destroyed());
    assert!(router.complete(request("hi")).await.is_err());
}

#[tokio::test]
async fn duplicate_names_are_rejected() {
    let backends: Vec<Arc<dyn InferenceBackend>> = vec![
        Arc::new(MockBackend::named("a")),
        Arc::new(MockBackend::named("a")),
    ];
    let result = ProviderManager::new(backends, ManagerConfig::default());
    assert!(matches!(result, Err(ProviderError::InvalidConfig { .. })));
}
