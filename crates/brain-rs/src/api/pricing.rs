//! Per-model pricing and cumulative cost tracking for pipeline runs.
//!
//! Cost estimates let experiment records compare the brain pipeline against
//! the baseline in dollars as well as tokens.

use crate::TokenUsage;
use serde::Serialize;

/// Per-model pricing for cost estimation (USD per 1M tokens).
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn estimate_cost(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (usage.completion_tokens as f64 / 1_000_000.0) * self.output_per_million
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            input_per_million: 2.50,
            output_per_million: 10.0,
        }
    }
}

/// Approximate pricing for a model by name.
///
/// Matches on the segment after the last `/` so org prefixes like
/// `"my-org/custom-mini"` don't decide the tier.
pub fn pricing_for_model(model: &str) -> ModelPricing {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();

    // Order matters: "gpt-4o-mini" must be checked before "gpt-4o".
    let (input, output) = if name.contains("4o-mini") || name.contains("4.1-mini") {
        (0.15, 0.60)
    } else if name.contains("gpt-4o") || name.contains("gpt-4.1") {
        (2.50, 10.0)
    } else if name.starts_with("o1") || name.starts_with("o3") {
        (15.0, 60.0)
    } else if name.contains("haiku") {
        (0.25, 1.25)
    } else if name.contains("sonnet") {
        (3.0, 15.0)
    } else if name.contains("opus") {
        (15.0, 75.0)
    } else if name.contains("gemini") && name.contains("flash") {
        (0.075, 0.30)
    } else if name.contains("deepseek") {
        (0.27, 1.10)
    } else if crate::api::scripted::is_small_model(&name) {
        (0.15, 0.60)
    } else {
        return ModelPricing::default();
    };
    ModelPricing {
        input_per_million: input,
        output_per_million: output,
    }
}

/// Cumulative usage and estimated cost across the calls of one run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CostTracker {
    pub usage: TokenUsage,
    pub estimated_cost_usd: f64,
    pub calls: u32,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call's usage against the given model's pricing.
    pub fn record(&mut self, model: &str, usage: &TokenUsage) {
        self.usage += *usage;
        self.estimated_cost_usd += pricing_for_model(model).estimate_cost(usage);
        self.calls += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mini_is_cheaper_than_full() {
        let mini = pricing_for_model("gpt-4o-mini");
        let full = pricing_for_model("openai/gpt-4o");
        assert!(mini.input_per_million < full.input_per_million);
        assert!(mini.output_per_million < full.output_per_million);
    }

    #[test]
    fn org_prefix_does_not_pick_tier() {
        let p = pricing_for_model("haiku-labs/gpt-4o");
        assert_eq!(p, pricing_for_model("gpt-4o"));
    }

    #[test]
    fn unknown_large_model_uses_default() {
        assert_eq!(pricing_for_model("dummy-large"), ModelPricing::default());
        assert_eq!(pricing_for_model("dummy-small").input_per_million, 0.15);
    }

    #[test]
    fn estimate_cost_scales_per_million() {
        let p = ModelPricing {
            input_per_million: 1.0,
            output_per_million: 2.0,
        };
        let cost = p.estimate_cost(&TokenUsage::new(1_000_000, 500_000));
        assert!((cost - 2.0).abs() < 1e-9);
    }

    #[test]
    fn tracker_accumulates() {
        let mut tracker = CostTracker::new();
        tracker.record("gpt-4o-mini", &TokenUsage::new(1000, 100));
        tracker.record("gpt-4o", &TokenUsage::new(2000, 200));
        assert_eq!(tracker.calls, 2);
        assert_eq!(tracker.usage, TokenUsage::new(3000, 300));
        assert!(tracker.estimated_cost_usd > 0.0);
    }
}
