//! Model catalog entries.

use serde::{Deserialize, Serialize};

/// Marketing badge on a catalog entry. The router keys off `Fastest` and
/// `Smartest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelBadge {
    Fastest,
    Smartest,
    Balanced,
    New,
    Custom,
    Vision,
    Reasoning,
}

/// Information about an available model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier including provider prefix (e.g. "openai/gpt-4o").
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Provider name (e.g. "openai", "anthropic").
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<ModelBadge>,
    /// USD per million input tokens.
    pub cost_per_1m_input: f64,
    /// USD per million output tokens.
    pub cost_per_1m_output: f64,
    /// Maximum context window in tokens.
    pub context_window: u32,
    /// Free-form capability tags (e.g. "chat", "vision", "function-calling").
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ModelInfo {
    /// Create new model info with required fields.
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            provider: provider.into(),
            badge: None,
            cost_per_1m_input: 0.0,
            cost_per_1m_output: 0.0,
            context_window: 0,
            capabilities: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_badge(mut self, badge: ModelBadge) -> Self {
        self.badge = Some(badge);
        self
    }

    /// Set per-million-token input and output prices.
    pub fn with_pricing(mut self, input: f64, output: f64) -> Self {
        self.cost_per_1m_input = input;
        self.cost_per_1m_output = output;
        self
    }

    /// Set the context window size.
    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }
}
