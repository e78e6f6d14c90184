//! Telemetry metric name constants.
//!
//! Centralised metric names for hyphae operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `hyphae_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`, `_usd`).
//!
//! # Common labels
//!
//! - `model`: model id (e.g. "openai/gpt-4o")
//! - `status`: outcome, "ok" or "error"
//! - `direction`: token direction, "prompt" or "completion"
//! - `component`: stateful component that touched the store

/// Total provider calls dispatched by the orchestrator.
///
/// Labels: `model`, `status` ("ok" | "error").
pub const REQUESTS_TOTAL: &str = "hyphae_requests_total";

/// Provider call duration in seconds.
///
/// Labels: `model`.
pub const REQUEST_DURATION_SECONDS: &str = "hyphae_request_duration_seconds";

/// Total retry attempts (not counting the initial request).
///
/// Labels: `attempt`.
pub const RETRIES_TOTAL: &str = "hyphae_retries_total";

/// Total tokens consumed.
///
/// Labels: `model`, `direction` ("prompt" | "completion").
pub const TOKENS_TOTAL: &str = "hyphae_tokens_total";

/// User charge per request in USD.
///
/// Labels: `model`.
pub const REQUEST_COST_USD: &str = "hyphae_request_cost_usd";

/// Total response cache hits.
///
/// Labels: `kind` ("exact" | "semantic").
pub const CACHE_HITS_TOTAL: &str = "hyphae_cache_hits_total";

/// Total response cache misses.
pub const CACHE_MISSES_TOTAL: &str = "hyphae_cache_misses_total";

/// Requests that joined an in-flight identical request.
pub const DEDUP_JOINS_TOTAL: &str = "hyphae_dedup_joins_total";

/// Requests rejected by admission control.
///
/// Labels: `scope` ("tier" | "model" | "penalty").
pub const ADMISSION_DENIED_TOTAL: &str = "hyphae_admission_denied_total";

/// Requests served by a fallback model.
///
/// Labels: `from`, `to`.
pub const FALLBACKS_TOTAL: &str = "hyphae_fallbacks_total";

/// Calls rejected by an open circuit breaker.
///
/// Labels: `model`.
pub const CIRCUIT_REJECTIONS_TOTAL: &str = "hyphae_circuit_rejections_total";

/// Budget alerts that crossed their trigger threshold in a sweep.
///
/// Labels: `scope`.
pub const BUDGET_ALERTS_TRIGGERED_TOTAL: &str = "hyphae_budget_alerts_triggered_total";

/// Swallowed state store failures.
///
/// Labels: `component`.
pub const STORE_ERRORS_TOTAL: &str = "hyphae_store_errors_total";
