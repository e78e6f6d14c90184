//! OpenAI-compatible chat completions client.
//!
//! Works against any endpoint that speaks the `/chat/completions` wire
//! format (OpenAI, Azure OpenAI deployments behind a proxy, OpenRouter,
//! Groq, DeepSeek, local servers).

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CompletionProvider, CompletionRequest, CompletionStream};
use crate::types::{Completion, Message, StreamEvent, Usage};
use crate::{HyphaeError, Result};

/// Default base URL for the OpenAI API
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAiCompatProvider {
    name: String,
    api_key: Option<String>,
    http: Client,
    base_url: String,
    strip_prefix: bool,
}

impl OpenAiCompatProvider {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_base_url(name, api_key, DEFAULT_BASE_URL)
    }

    /// Client with a custom base URL (for compatible gateways, or wiremock).
    pub fn with_base_url(
        name: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| Client::new());
        let api_key = api_key.into();

        Self {
            name: name.into(),
            api_key: (!api_key.is_empty()).then_some(api_key),
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            strip_prefix: true,
        }
    }

    /// Send the catalog id (`meta-llama/llama-3.3-70b-instruct`) unchanged
    /// instead of stripping the provider prefix. Aggregating gateways such
    /// as OpenRouter expect the full id.
    pub fn keep_model_prefix(mut self) -> Self {
        self.strip_prefix = false;
        self
    }

    fn wire_model<'a>(&self, model: &'a str) -> &'a str {
        if self.strip_prefix {
            model.split_once('/').map_or(model, |(_, rest)| rest)
        } else {
            model
        }
    }

    fn wire_request<'a>(&self, request: &'a CompletionRequest, stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: self.wire_model(&request.model),
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
            stream_options: stream.then_some(StreamOptions { include_usage: true }),
        }
    }

    async fn send(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.http.post(&url).json(&self.wire_request(request, stream));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(map_transport_error)?;
        handle_response_errors(response, &request.model).await
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let response = self.send(request, false).await?;
        let body: ChatResponse = response.json().await.map_err(map_transport_error)?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(HyphaeError::EmptyResponse)?;
        let usage = body
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(Completion {
            text,
            usage,
            model: body.model,
        })
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<CompletionStream> {
        let response = self.send(request, true).await?;
        let provider = self.name.clone();

        let events = response
            .bytes_stream()
            .eventsource()
            .map(move |item| match item {
                Ok(event) => {
                    let data = event.data.trim();
                    if data == "[DONE]" {
                        return vec![Ok(StreamEvent::Done)];
                    }
                    match serde_json::from_str::<ChatChunk>(data) {
                        Ok(chunk) => chunk_events(chunk),
                        Err(e) => {
                            debug!(provider = %provider, error = %e, "skipping unparseable SSE chunk");
                            Vec::new()
                        }
                    }
                }
                Err(e) => vec![Err(HyphaeError::Stream(e.to_string()))],
            })
            .flat_map(futures_util::stream::iter);

        Ok(Box::pin(events))
    }
}

fn chunk_events(chunk: ChatChunk) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();
    for choice in chunk.choices {
        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            events.push(Ok(StreamEvent::Content(content)));
        }
    }
    if let Some(u) = chunk.usage {
        events.push(Ok(StreamEvent::Usage(Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        })));
    }
    events
}

fn map_transport_error(e: reqwest::Error) -> HyphaeError {
    if e.is_timeout() {
        HyphaeError::Timeout(e.to_string())
    } else if e.is_connect() {
        HyphaeError::Connection(e.to_string())
    } else {
        HyphaeError::Http(e.to_string())
    }
}

/// Check response status and map to the matching error.
async fn handle_response_errors(response: reqwest::Response, model: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error.message)
        .unwrap_or(body);
    warn!(model, status = status.as_u16(), "provider returned error");

    Err(match status.as_u16() {
        401 | 403 => HyphaeError::AuthenticationFailed,
        404 => HyphaeError::ModelNotFound(model.to_owned()),
        429 => HyphaeError::RateLimited { retry_after },
        400 => HyphaeError::InvalidInput(message),
        code => HyphaeError::Api { status: code, message },
    })
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<WireUsage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_provider_prefix_by_default() {
        let p = OpenAiCompatProvider::new("openai", "k");
        assert_eq!(p.wire_model("openai/gpt-4o"), "gpt-4o");
        assert_eq!(p.wire_model("gpt-4o"), "gpt-4o");
        let p = p.keep_model_prefix();
        assert_eq!(p.wire_model("meta-llama/llama-3.3-70b-instruct"), "meta-llama/llama-3.3-70b-instruct");
    }

    #[test]
    fn stream_request_asks_for_usage() {
        let p = OpenAiCompatProvider::new("openai", "k");
        let request = CompletionRequest::new("openai/gpt-4o", vec![Message::user("hi")]);
        let json = serde_json::to_value(p.wire_request(&request, true)).unwrap();
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);
        assert!(json.get("temperature").is_none());

        let json = serde_json::to_value(p.wire_request(&request, false)).unwrap();
        assert!(json.get("stream").is_none());
    }

    #[test]
    fn chunk_with_usage_only() {
        let chunk: ChatChunk = serde_json::from_str(
            r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#,
        )
        .unwrap();
        let events = chunk_events(chunk);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ok(StreamEvent::Usage(u)) if u.total_tokens == 7));
    }
}
