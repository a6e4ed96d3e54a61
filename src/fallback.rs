//! Fallback policy: which substitute backends to try for each class of failure.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCondition {
    RateLimit,
    Unavailable,
    Timeout,
    Cost,
    Error,
}

impl FailureCondition {
    pub const ALL: [FailureCondition; 5] = [
        FailureCondition::RateLimit,
        FailureCondition::Unavailable,
        FailureCondition::Timeout,
        FailureCondition::Cost,
        FailureCondition::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::Cost => "cost",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FailureCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureCondition {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "rate_limit" => Ok(Self::RateLimit),
            "unavailable" => Ok(Self::Unavailable),
            "timeout" => Ok(Self::Timeout),
            "cost" => Ok(Self::Cost),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown failure condition `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRule {
    pub condition: FailureCondition,
    pub fallback_providers: Vec<String>,
    #[serde(default)]
    pub retry_original: bool,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: Duration,
}

fn default_retry_delay() -> Duration {
    DEFAULT_RETRY_DELAY
}

impl FallbackRule {
    pub fn new<I, S>(condition: FailureCondition, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            condition,
            fallback_providers: providers.into_iter().map(Into::into).collect(),
            retry_original: false,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_original(mut self, delay: Duration) -> Self {
        self.retry_original = true;
        self.retry_delay = delay;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackStrategy {
    pub rules: Vec<FallbackRule>,
}

impl FallbackStrategy {
    pub fn new(rules: Vec<FallbackRule>) -> Self {
        Self { rules }
    }

    pub fn with_rule(mut self, rule: FallbackRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// First rule registered for `condition`; later duplicates are ignored.
    pub fn rule_for(&self, condition: FailureCondition) -> Option<&FallbackRule> {
        self.rules.iter().find(|rule| rule.condition == condition)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Parses `rate_limit=openai|google;unavailable=ollama;timeout=openai+retry`.
    ///
    /// A `+retry` suffix retries the original backend after the default delay,
    /// `+retry=<secs>` sets the delay explicitly.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut rules = Vec::new();
        for clause in spec.split(';').map(str::trim).filter(|c| !c.is_empty()) {
            let (condition, targets) = clause
                .split_once('=')
                .ok_or_else(|| format!("fallback clause `{clause}` is missing `=`"))?;
            let condition = condition.parse::<FailureCondition>()?;

            let (targets, retry) = match targets.split_once('+') {
                Some((targets, retry)) => (targets, Some(parse_retry(retry)?)),
                None => (targets, None),
            };
            let providers = targets
                .split('|')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>();

            let mut rule = FallbackRule::new(condition, providers);
            if let Some(delay) = retry {
                rule = rule.with_retry_original(delay);
            }
            rules.push(rule);
        }
        Ok(Self { rules })
    }
}

fn parse_retry(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value == "retry" {
        return Ok(DEFAULT_RETRY_DELAY);
    }
    value
        .strip_prefix("retry=")
        .and_then(|secs| secs.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .ok_or_else(|| format!("invalid retry directive `{value}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rules_in_order() {
        let strategy =
            FallbackStrategy::parse("rate_limit=openai|google; unavailable=ollama;timeout=openai+retry=5")
                .expect("strategy should parse");

        assert_eq!(strategy.rules.len(), 3);
        let rate_limit = strategy
            .rule_for(FailureCondition::RateLimit)
            .expect("rate limit rule");
        assert_eq!(rate_limit.fallback_providers, vec!["openai", "google"]);
        assert!(!rate_limit.retry_original);

        let timeout = strategy
            .rule_for(FailureCondition::Timeout)
            .expect("timeout rule");
        assert!(timeout.retry_original);
        assert_eq!(timeout.retry_delay, Duration::from_secs(5));
        assert!(strategy.rule_for(FailureCondition::Cost).is_none());
    }

    #[test]
    fn first_matching_rule_wins() {
        let strategy = FallbackStrategy::default()
            .with_rule(FallbackRule::new(FailureCondition::Error, ["a"]))
            .with_rule(FallbackRule::new(FailureCondition::Error, ["b"]));

        let rule = strategy.rule_for(FailureCondition::Error).expect("rule");
        assert_eq!(rule.fallback_providers, vec!["a"]);
    }

    #[test]
    fn rejects_unknown_conditions() {
        let error = FallbackStrategy::parse("overheated=openai").expect_err("should fail");
        assert!(error.contains("overheated"));
        assert!(FallbackStrategy::parse("rate_limit").is_err());
    }
}
