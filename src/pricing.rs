use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::event::TokenUsage;
use crate::money::UsdMicros;

/// Per-model token prices in USD micro-units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_usd_micros_per_token: u64,
    pub output_usd_micros_per_token: u64,
}

/// Price table for a customer type or an individual virtual key.
///
/// Serialized shape is the explicit schema stored in the `price_table`
/// durable table and in the pricing cache; unrecognized fields are
/// rejected by serde rather than silently carried.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTable {
    #[serde(default)]
    models: HashMap<String, ModelPricing>,
}

impl PriceTable {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn insert(&mut self, model: impl Into<String>, pricing: ModelPricing) {
        self.models.insert(model.into(), pricing);
    }

    pub fn model_pricing(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Cost of one completed call, or None when the model has no entry.
    /// Saturates instead of overflowing; the i64 boundary caps the result.
    pub fn cost_for_usage(&self, model: &str, usage: &TokenUsage) -> Option<UsdMicros> {
        let pricing = self.model_pricing(model)?;
        let input =
            u64::from(usage.input_tokens).saturating_mul(pricing.input_usd_micros_per_token);
        let output =
            u64::from(usage.output_tokens).saturating_mul(pricing.output_usd_micros_per_token);
        let total = input.saturating_add(output).min(i64::MAX as u64);
        Some(total as UsdMicros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PriceTable {
        let mut table = PriceTable::default();
        table.insert(
            "gpt-4o-mini",
            ModelPricing {
                input_usd_micros_per_token: 1,
                output_usd_micros_per_token: 2,
            },
        );
        table
    }

    #[test]
    fn costs_priced_models() {
        let usage = TokenUsage::new(3, 4);
        assert_eq!(table().cost_for_usage("gpt-4o-mini", &usage), Some(3 + 8));
    }

    #[test]
    fn unknown_model_has_no_cost() {
        let usage = TokenUsage::new(3, 4);
        assert_eq!(table().cost_for_usage("o1", &usage), None);
    }

    #[test]
    fn parses_stored_json_shape() {
        let raw = r#"{
          "models": {
            "gpt-4o-mini": {
              "input_usd_micros_per_token": 1,
              "output_usd_micros_per_token": 2
            }
          }
        }"#;
        let parsed = PriceTable::from_json_str(raw).expect("price table");
        assert_eq!(parsed, table());
    }

    #[test]
    fn cost_saturates_instead_of_overflowing() {
        let mut table = PriceTable::default();
        table.insert(
            "pricey",
            ModelPricing {
                input_usd_micros_per_token: u64::MAX,
                output_usd_micros_per_token: u64::MAX,
            },
        );
        let usage = TokenUsage::new(u32::MAX, u32::MAX);
        assert_eq!(table.cost_for_usage("pricey", &usage), Some(i64::MAX));
    }
}
