//! Model-id prefix to provider mapping.

use std::sync::Arc;

use super::CompletionProvider;
use crate::{HyphaeError, Result};

/// Resolves a model id such as `openai/gpt-4o` to the provider registered
/// for its `openai` prefix, or the default provider.
#[derive(Clone, Default)]
pub struct ProviderSet {
    by_prefix: Vec<(String, Arc<dyn CompletionProvider>)>,
    default: Option<Arc<dyn CompletionProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route models whose id starts with `{prefix}/` to `provider`.
    /// Later registrations for the same prefix replace earlier ones.
    pub fn register(mut self, prefix: impl Into<String>, provider: Arc<dyn CompletionProvider>) -> Self {
        let prefix = prefix.into();
        self.by_prefix.retain(|(p, _)| *p != prefix);
        self.by_prefix.push((prefix, provider));
        self
    }

    /// Provider for models no prefix matches.
    pub fn default_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.default = Some(provider);
        self
    }

    pub fn resolve(&self, model: &str) -> Result<Arc<dyn CompletionProvider>> {
        let prefix = model.split_once('/').map_or(model, |(p, _)| p);
        self.by_prefix
            .iter()
            .find(|(p, _)| p == prefix)
            .map(|(_, provider)| provider.clone())
            .or_else(|| self.default.clone())
            .ok_or_else(|| HyphaeError::NoProvider(model.to_owned()))
    }

    pub fn is_empty(&self) -> bool {
        self.by_prefix.is_empty() && self.default.is_none()
    }

    /// Registered prefixes, in registration order.
    pub fn prefixes(&self) -> Vec<&str> {
        self.by_prefix.iter().map(|(p, _)| p.as_str()).collect()
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("prefixes", &self.prefixes())
            .field("default", &self.default.as_ref().map(|p| p.name().to_owned()))
            .finish()
    }
}
