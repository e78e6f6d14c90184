//! Model registry: catalog metadata and pricing.
//!
//! The registry is seeded from compiled-in JSON ([`ModelRegistry::with_embedded_seed`])
//! and can be extended at build time with [`ModelRegistry::insert`].
//! Routing, fallback similarity and cost accounting all read from it.

mod pricing;

use std::collections::HashMap;

pub use pricing::{CostBreakdown, PricingConfig};

use crate::ModelInfo;

/// Catalog of known models, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: HashMap<String, ModelInfo>,
}

impl ModelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a model entry, replacing any existing entry with the same ID.
    pub fn insert(&mut self, info: ModelInfo) {
        self.entries.insert(info.id.clone(), info);
    }

    /// Get a model by ID.
    pub fn get(&self, model: &str) -> Option<&ModelInfo> {
        self.entries.get(model)
    }

    pub fn contains(&self, model: &str) -> bool {
        self.entries.contains_key(model)
    }

    /// All entries, sorted by id.
    pub fn list(&self) -> Vec<&ModelInfo> {
        let mut models: Vec<_> = self.entries.values().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Entries from a single provider.
    pub fn by_provider(&self, provider: &str) -> Vec<&ModelInfo> {
        let mut models: Vec<_> = self
            .entries
            .values()
            .filter(|m| m.provider == provider)
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Number of entries in the registry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Price a request against this catalog.
    ///
    /// Unknown models cost nothing: every field of the breakdown is zero.
    pub fn calculate_cost(
        &self,
        input_tokens: u32,
        output_tokens: u32,
        model: &str,
        pricing: &PricingConfig,
    ) -> CostBreakdown {
        match self.get(model) {
            Some(info) => pricing.price(info, input_tokens, output_tokens),
            None => CostBreakdown::default(),
        }
    }

    /// Create a registry pre-populated with the embedded seed data.
    pub fn with_embedded_seed() -> Self {
        let mut registry = Self::new();
        match serde_json::from_str::<Vec<ModelInfo>>(EMBEDDED_SEED) {
            Ok(entries) => {
                for entry in entries {
                    registry.insert(entry);
                }
            }
            Err(e) => {
                // Seed is compiled in and covered by tests; an empty
                // registry is still usable.
                tracing::warn!(error = %e, "failed to parse embedded model seed");
            }
        }
        registry
    }
}

/// Raw JSON seed data compiled into the binary.
const EMBEDDED_SEED: &str = include_str!("seed.json");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelBadge;

    #[test]
    fn embedded_seed_parses() {
        let registry = ModelRegistry::with_embedded_seed();
        assert_eq!(registry.len(), 29);

        let gpt4o = registry.get("openai/gpt-4o").unwrap();
        assert_eq!(gpt4o.provider, "openai");
        assert_eq!(gpt4o.badge, Some(ModelBadge::Smartest));
        assert_eq!(gpt4o.context_window, 128_000);
        assert!(gpt4o.has_capability("function-calling"));

        let turbo = registry.get("openai/gpt-4-turbo").unwrap();
        assert_eq!(turbo.badge, None);
    }

    #[test]
    fn provider_filter() {
        let registry = ModelRegistry::with_embedded_seed();
        let groq = registry.by_provider("groq");
        assert_eq!(groq.len(), 3);
        assert!(groq.iter().all(|m| m.badge == Some(ModelBadge::Fastest)));
    }

    #[test]
    fn unknown_model_costs_nothing() {
        let registry = ModelRegistry::with_embedded_seed();
        let cost = registry.calculate_cost(1_000, 1_000, "nope/nothing", &PricingConfig::default());
        assert_eq!(cost, CostBreakdown::default());
    }
}
