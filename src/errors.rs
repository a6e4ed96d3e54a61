use std::time::Duration;

use thiserror::Error;

use crate::fallback::FailureCondition;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("{provider}: authentication failed: {message}")]
    Authentication { provider: String, message: String },
    #[error("{provider}: rate limited: {message}")]
    RateLimit {
        provider: String,
        message: String,
        retry_after_secs: Option<u64>,
    },
    #[error("{provider}: model not found: {model}")]
    ModelNotFound { provider: String, model: String },
    #[error("{provider}: provider unavailable: {message}")]
    Unavailable { provider: String, message: String },
    #[error("{provider}: request timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },
    #[error("{provider}: provider error (status {}): {message}", status_label(*.status))]
    Provider {
        provider: String,
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },
    #[error("no available providers")]
    NoAvailableProviders,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{provider}: invalid configuration: {}", .errors.join("; "))]
    InvalidConfig {
        provider: String,
        errors: Vec<String>,
    },
    #[error("no provider could be initialized: {}", .failures.join("; "))]
    Initialization { failures: Vec<String> },
}

impl ProviderError {
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Authentication { provider, .. }
            | Self::RateLimit { provider, .. }
            | Self::ModelNotFound { provider, .. }
            | Self::Unavailable { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::Provider { provider, .. }
            | Self::InvalidConfig { provider, .. } => Some(provider),
            Self::NoAvailableProviders | Self::InvalidRequest(_) | Self::Initialization { .. } => {
                None
            }
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit {
                retry_after_secs: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Maps the error onto the condition keys used by fallback rules.
    pub fn condition(&self) -> FailureCondition {
        match self {
            Self::RateLimit { .. } => FailureCondition::RateLimit,
            Self::Unavailable { .. } => FailureCondition::Unavailable,
            Self::Timeout { .. } => FailureCondition::Timeout,
            Self::Provider { status, code, .. } if is_quota_failure(*status, code.as_deref()) => {
                FailureCondition::Cost
            }
            _ => FailureCondition::Error,
        }
    }

    /// Failures that say something about the backend's health rather than the request.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable { .. } | Self::Timeout { .. } => true,
            Self::Provider {
                status: Some(status),
                ..
            } => *status >= 500,
            Self::Provider { status: None, .. } => true,
            _ => false,
        }
    }
}

fn is_quota_failure(status: Option<u16>, code: Option<&str>) -> bool {
    status == Some(402) || code == Some("insufficient_quota")
}

fn status_label(status: Option<u16>) -> String {
    status
        .map(|status| status.to_string())
        .unwrap_or_else(|| "none".to_owned())
}
