//! Retry with exponential backoff, and per-model circuit breakers.

pub mod circuit;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitRegistry, CircuitSnapshot, CircuitState};
pub use retry::{RetryConfig, RetryOutcome, RetryOverride, RetryPolicies, retry_with_backoff};
