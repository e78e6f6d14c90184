//! Markup pricing on top of provider list prices.

use serde::{Deserialize, Serialize};

use crate::ModelInfo;

/// Pricing policy applied to every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Percentage added on top of provider cost.
    pub markup_percentage: f64,
    /// Floor for the user charge of a single request, in USD.
    pub minimum_charge: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            markup_percentage: 25.0,
            minimum_charge: 0.001,
        }
    }
}

impl PricingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn markup_percentage(mut self, percent: f64) -> Self {
        self.markup_percentage = percent;
        self
    }

    pub fn minimum_charge(mut self, usd: f64) -> Self {
        self.minimum_charge = usd;
        self
    }

    /// Price `input`/`output` tokens on `model`. All figures are rounded to
    /// six decimal places.
    pub fn price(&self, model: &ModelInfo, input: u32, output: u32) -> CostBreakdown {
        let input_cost = f64::from(input) / 1_000_000.0 * model.cost_per_1m_input;
        let output_cost = f64::from(output) / 1_000_000.0 * model.cost_per_1m_output;
        let provider_cost = input_cost + output_cost;
        let markup = provider_cost * (self.markup_percentage / 100.0);
        let total_cost = provider_cost + markup;
        let user_charge = total_cost.max(self.minimum_charge);

        CostBreakdown {
            provider_cost: round6(provider_cost),
            markup: round6(markup),
            total_cost: round6(total_cost),
            user_charge: round6(user_charge),
        }
    }
}

/// Cost of a single request, in USD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub provider_cost: f64,
    pub markup: f64,
    pub total_cost: f64,
    /// What the user is billed: `total_cost`, but never below the minimum.
    pub user_charge: f64,
}

pub(crate) fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpt4o() -> ModelInfo {
        ModelInfo::new("openai/gpt-4o", "openai").with_pricing(2.5, 10.0)
    }

    #[test]
    fn applies_markup() {
        let cost = PricingConfig::default().price(&gpt4o(), 1_000_000, 100_000);
        assert_eq!(cost.provider_cost, 3.5);
        assert_eq!(cost.markup, 0.875);
        assert_eq!(cost.total_cost, 4.375);
        assert_eq!(cost.user_charge, 4.375);
    }

    #[test]
    fn enforces_minimum_charge() {
        let cost = PricingConfig::default().price(&gpt4o(), 10, 10);
        assert_eq!(cost.provider_cost, 0.000125);
        assert_eq!(cost.user_charge, 0.001);
    }

    #[test]
    fn free_models_still_pay_minimum() {
        let flash = ModelInfo::new("google/gemini-2.0-flash-exp", "google");
        let cost = PricingConfig::default().price(&flash, 5_000, 5_000);
        assert_eq!(cost.total_cost, 0.0);
        assert_eq!(cost.user_charge, 0.001);
    }

    #[test]
    fn rounds_to_six_places() {
        assert_eq!(round6(0.123_456_789), 0.123_457);
    }
}
