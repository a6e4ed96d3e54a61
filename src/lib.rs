pub mod backend;
pub mod cache;
pub mod capabilities;
pub mod config;
pub mod errors;
pub mod factory;
pub mod fallback;
pub mod fingerprint;
pub mod manager;
pub mod metrics;
pub mod models;

use std::sync::Arc;

use config::RouterConfig;
use errors::ProviderError;
use factory::ProviderFactory;
use manager::ProviderManager;
use tracing::{info, warn};

/// Reads the environment, brings up every configured backend and wraps the
/// survivors in a manager. Periodic health checks start when configured.
pub async fn build_manager_from_env() -> Result<Arc<ProviderManager>, ProviderError> {
    build_manager(RouterConfig::from_env()?).await
}

pub async fn build_manager(config: RouterConfig) -> Result<Arc<ProviderManager>, ProviderError> {
    let RouterConfig { providers, manager } = config;
    if providers.is_empty() {
        return Err(ProviderError::Initialization {
            failures: vec!["no providers configured".to_owned()],
        });
    }

    let set = ProviderFactory::create(providers).await?;
    for (kind, error) in &set.failures {
        warn!(provider = %kind, error = %error, "provider skipped");
    }

    let health_check_interval = manager.health_check_interval;
    let router = Arc::new(ProviderManager::new(set.providers, manager)?);
    if let Some(every) = health_check_interval {
        router.spawn_health_checks(every);
    }
    info!(providers = %router.provider_names().join(","), "provider router ready");
    Ok(router)
}
