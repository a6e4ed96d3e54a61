use serde::{Deserialize, Serialize};

use crate::models::{Cost, Usage};

/// USD per 1,000 tokens.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
pub struct ModelPricing {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

impl ModelPricing {
    pub const FREE: Self = Self {
        prompt_per_1k: 0.0,
        completion_per_1k: 0.0,
    };

    pub fn new(prompt_per_1k: f64, completion_per_1k: f64) -> Self {
        Self {
            prompt_per_1k,
            completion_per_1k,
        }
    }

    pub fn cost(&self, usage: &Usage) -> Cost {
        Cost::new(
            usage.prompt_tokens as f64 / 1000.0 * self.prompt_per_1k,
            usage.completion_tokens as f64 / 1000.0 * self.completion_per_1k,
        )
    }

    pub fn estimate(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        self.cost(&Usage::new(prompt_tokens, completion_tokens))
            .total_cost
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub context_length: u32,
    pub max_output_tokens: u32,
    pub pricing: ModelPricing,
}

impl ModelInfo {
    pub fn new(
        id: impl Into<String>,
        context_length: u32,
        max_output_tokens: u32,
        pricing: ModelPricing,
    ) -> Self {
        Self {
            id: id.into(),
            context_length,
            max_output_tokens,
            pricing,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct FeatureFlags {
    pub streaming: bool,
    pub tool_use: bool,
    pub vision: bool,
    pub embeddings: bool,
    pub fine_tuning: bool,
    pub batching: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Capabilities {
    pub default_model: String,
    pub models: Vec<ModelInfo>,
    pub features: FeatureFlags,
}

impl Capabilities {
    pub fn model(&self, id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|model| model.id == id)
    }

    pub fn supports_model(&self, id: &str) -> bool {
        self.model(id).is_some()
    }

    /// Unknown models are priced at zero; the backend may still serve them.
    pub fn pricing_for(&self, id: &str) -> ModelPricing {
        self.model(id)
            .map(|model| model.pricing)
            .unwrap_or(ModelPricing::FREE)
    }

    pub fn cost_for(&self, model: &str, usage: &Usage) -> Cost {
        self.pricing_for(model).cost(usage)
    }

    /// Cheapest model for the given token estimate. When `model` names a
    /// listed model only that one is considered.
    pub fn cheapest_estimate(
        &self,
        model: Option<&str>,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Option<(String, f64)> {
        let pinned = model.and_then(|id| self.model(id));
        let candidates: Vec<&ModelInfo> = match pinned {
            Some(info) => vec![info],
            None => self.models.iter().collect(),
        };

        candidates
            .into_iter()
            .map(|info| {
                (
                    info.id.clone(),
                    info.pricing.estimate(prompt_tokens, completion_tokens),
                )
            })
            .min_by(|left, right| left.1.total_cmp(&right.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Capabilities {
        Capabilities {
            default_model: "big".to_owned(),
            models: vec![
                ModelInfo::new("big", 100_000, 4096, ModelPricing::new(0.01, 0.03)),
                ModelInfo::new("small", 16_000, 2048, ModelPricing::new(0.001, 0.002)),
            ],
            features: FeatureFlags::default(),
        }
    }

    #[test]
    fn computes_cost_per_thousand_tokens() {
        let cost = ModelPricing::new(0.01, 0.03).cost(&Usage::new(2000, 500));
        assert!((cost.prompt_cost - 0.02).abs() < 1e-12);
        assert!((cost.completion_cost - 0.015).abs() < 1e-12);
        assert!((cost.total_cost - 0.035).abs() < 1e-12);
    }

    #[test]
    fn cheapest_estimate_prefers_lowest_price() {
        let (model, cost) = sample()
            .cheapest_estimate(None, 1000, 1000)
            .expect("models present");
        assert_eq!(model, "small");
        assert!((cost - 0.003).abs() < 1e-12);
    }

    #[test]
    fn cheapest_estimate_respects_pinned_model() {
        let (model, _) = sample()
            .cheapest_estimate(Some("big"), 1000, 1000)
            .expect("models present");
        assert_eq!(model, "big");

        let (model, _) = sample()
            .cheapest_estimate(Some("unlisted"), 1000, 1000)
            .expect("models present");
        assert_eq!(model, "small");
    }

    #[test]
    fn unknown_models_are_free() {
        let cost = sample().cost_for("mystery", &Usage::new(10, 10));
        assert_eq!(cost.total_cost, 0.0);
    }
}
