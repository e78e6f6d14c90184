//! The provider capability the orchestrator calls.
//!
//! A provider turns a message list into text, either in one response or as
//! a stream of [`StreamEvent`]s. Errors must be classifiable: network
//! failures, rate limits and 5xx map to the transient variants of
//! [`HyphaeError`](crate::HyphaeError), auth and bad requests to the fatal
//! ones.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::types::{Completion, Message, StreamEvent};

/// Stream of completion events.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// One provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Catalog model id, including provider prefix.
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Same request against a different model.
    pub fn for_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }
}

/// Text completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name for logging/debugging.
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Streamed completion. Implementations should end with a
    /// [`StreamEvent::Usage`] when the backend reports usage.
    async fn complete_stream(&self, request: &CompletionRequest) -> Result<CompletionStream>;
}
