//! Response and streaming event types

use serde::{Deserialize, Serialize};

use crate::health::ModelHealth;

/// Token usage statistics reported by a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A single provider completion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    #[serde(default)]
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Events emitted during a streamed completion
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text content chunk
    Content(String),

    /// Usage statistics (typically at end of stream)
    Usage(Usage),

    /// Stream complete
    Done,
}

/// Input/output/total token counts on an [`AiResponse`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: u32,
    pub output: u32,
    pub total: u32,
}

impl From<Usage> for TokenCounts {
    fn from(usage: Usage) -> Self {
        Self {
            input: usage.prompt_tokens,
            output: usage.completion_tokens,
            total: usage.total_tokens,
        }
    }
}

/// Provenance attached to every orchestrated response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// True if a model other than the requested one served the response.
    pub fallback_used: bool,
    /// Provider calls made across all models (0 for cache hits).
    pub retry_attempts: u32,
    /// Models tried, in order.
    #[serde(default)]
    pub attempted: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<ModelHealth>,
}

/// Final result returned by [`Orchestrator::generate`](crate::Orchestrator::generate)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponse {
    pub content: String,
    /// The model that actually produced `content`.
    pub model_used: String,
    pub token_usage: TokenCounts,
    /// User charge in USD.
    pub cost: f64,
    pub cached: bool,
    pub from_dedup: bool,
    pub latency_ms: u64,
    pub metadata: ResponseMetadata,
}
