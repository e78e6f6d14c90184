//! Request type for the orchestrator.

use serde::{Deserialize, Serialize};

use crate::cache::response::DEFAULT_NAMESPACE;
use crate::providers::CompletionRequest;
use crate::types::Message;
use crate::usage::Module;
use crate::{HyphaeError, Result};

/// One orchestrated generation.
///
/// Cache, dedup and fallback are on by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub user_id: String,
    /// Requested model, including provider prefix.
    pub model_id: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default = "enabled")]
    pub enable_cache: bool,
    #[serde(default = "enabled")]
    pub enable_dedup: bool,
    #[serde(default = "enabled")]
    pub enable_fallback: bool,
    /// Cache namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Attribution for cost accounting; `general-chat` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<Module>,
}

fn enabled() -> bool {
    true
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl GenerateRequest {
    pub fn new(user_id: impl Into<String>, model_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            user_id: user_id.into(),
            model_id: model_id.into(),
            messages,
            temperature: None,
            max_tokens: None,
            enable_cache: true,
            enable_dedup: true,
            enable_fallback: true,
            namespace: default_namespace(),
            module: None,
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn cache(mut self, enabled: bool) -> Self {
        self.enable_cache = enabled;
        self
    }

    pub fn dedup(mut self, enabled: bool) -> Self {
        self.enable_dedup = enabled;
        self
    }

    pub fn fallback(mut self, enabled: bool) -> Self {
        self.enable_fallback = enabled;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn module(mut self, module: Module) -> Self {
        self.module = Some(module);
        self
    }

    /// Reject requests with no user, model or messages.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(HyphaeError::InvalidInput("user_id is required".into()));
        }
        if self.model_id.trim().is_empty() {
            return Err(HyphaeError::InvalidInput("model_id is required".into()));
        }
        if self.messages.is_empty() {
            return Err(HyphaeError::InvalidInput("messages must not be empty".into()));
        }
        Ok(())
    }

    pub(crate) fn completion_request(&self) -> CompletionRequest {
        CompletionRequest {
            model: self.model_id.clone(),
            messages: self.messages.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}
