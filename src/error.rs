//! Hyphae error types

use std::time::Duration;

use crate::store::StoreError;

/// Hyphae error types
#[derive(Debug, thiserror::Error)]
pub enum HyphaeError {
    // Admission errors
    /// The admission controller rejected the request (window full or
    /// penalty lock active).
    #[error("rate limit exceeded, retry after {retry_after:?} ({remaining} remaining)")]
    AdmissionDenied {
        retry_after: Duration,
        remaining: u32,
        /// Unix milliseconds at which the blocking window or lock ends.
        reset_at: i64,
    },

    #[error("circuit breaker open for {model}, retry after {retry_after:?}")]
    CircuitOpen { model: String, retry_after: Duration },

    /// Primary and every fallback model failed after their retry budgets.
    #[error("all models exhausted [{}]: {last_error}", .attempted.join(", "))]
    AllModelsExhausted {
        attempted: Vec<String>,
        last_error: String,
    },

    // Provider/network errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("provider rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("model not found: {0}")]
    ModelNotFound(String),

    // Streaming errors
    #[error("stream error: {0}")]
    Stream(String),

    #[error("empty response from model")]
    EmptyResponse,

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Shared state
    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    // Configuration errors
    #[error("no provider configured for model {0}")]
    NoProvider(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl HyphaeError {
    /// HTTP-equivalent status code, if the error carries or implies one.
    ///
    /// `RateLimited` maps to 429 and `Timeout` to 408 so that status-code
    /// allowlists in [`RetryConfig`](crate::resilience::RetryConfig) cover them.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            HyphaeError::Api { status, .. } => Some(*status),
            HyphaeError::RateLimited { .. } => Some(429),
            HyphaeError::Timeout(_) => Some(408),
            HyphaeError::AuthenticationFailed => Some(401),
            HyphaeError::ModelNotFound(_) => Some(404),
            _ => None,
        }
    }

    /// Machine-readable retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HyphaeError::RateLimited { retry_after } => *retry_after,
            HyphaeError::AdmissionDenied { retry_after, .. }
            | HyphaeError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Default transient classification: network failures, provider rate
    /// limits, 408 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            HyphaeError::Http(_)
            | HyphaeError::Timeout(_)
            | HyphaeError::Connection(_)
            | HyphaeError::RateLimited { .. } => true,
            HyphaeError::Api { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Errors no retry or alternate model can fix for this request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HyphaeError::AuthenticationFailed
                | HyphaeError::InvalidInput(_)
                | HyphaeError::AdmissionDenied { .. }
                | HyphaeError::Configuration(_)
        )
    }
}

impl From<StoreError> for HyphaeError {
    fn from(err: StoreError) -> Self {
        HyphaeError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for Hyphae operations
pub type Result<T> = std::result::Result<T, HyphaeError>;
