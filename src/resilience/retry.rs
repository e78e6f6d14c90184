//! Retry configuration, delay calculation, and the shared retry loop.
//!
//! [`retry_with_backoff`] is the single retry implementation; fallback
//! chains and streaming connection setup both go through it.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{HyphaeError, Result, telemetry};

/// Configuration for retry behaviour on transient errors.
///
/// Uses exponential backoff with ±25% jitter, capped at `max_delay_ms`.
/// An error is retryable when its status code is in
/// `retryable_status_codes`, its message contains one of
/// `retryable_error_patterns` (case-insensitive), or it is a transport
/// timeout/connection failure.
///
/// ```rust
/// # use hyphae::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_retries(5)
///     .initial_delay(Duration::from_millis(200))
///     .jitter(false);
/// assert_eq!(config.delay_for_attempt(2), Duration::from_millis(800));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the initial attempt. 0 = no retry. Default: 3.
    pub max_retries: u32,
    /// Base delay before the first retry. Default: 1000ms.
    pub initial_delay_ms: u64,
    /// Cap on any single delay. Default: 30s.
    pub max_delay_ms: u64,
    /// Growth factor per attempt. Default: 2.
    pub backoff_multiplier: f64,
    pub retryable_status_codes: Vec<u16>,
    pub retryable_error_patterns: Vec<String>,
    /// Whether to add random jitter to delays. Default: true.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
            retryable_error_patterns: [
                "ECONNRESET",
                "ETIMEDOUT",
                "ENOTFOUND",
                "ECONNREFUSED",
                "rate_limit_exceeded",
                "context_length_exceeded",
                "timed out",
                "connection reset",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new config with the default policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config that disables retries (single attempt).
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn retryable_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.retryable_status_codes = codes;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Unjittered delay for a given attempt number (0-indexed):
    /// `initial * multiplier^attempt`, capped at the max delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Delay actually slept before retry `attempt`.
    ///
    /// A provider `retry_after` hint takes precedence over the computed
    /// backoff. Either way the result never exceeds the max delay.
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let max = Duration::from_millis(self.max_delay_ms);
        match retry_after {
            Some(hint) => hint.min(max),
            None => {
                let base = self.delay_for_attempt(attempt);
                if self.jitter {
                    let factor = rand::rng().random_range(0.75..=1.25);
                    base.mul_f64(factor).min(max)
                } else {
                    base
                }
            }
        }
    }

    /// Whether `err` should be retried under this policy.
    pub fn is_retryable(&self, err: &HyphaeError) -> bool {
        if matches!(err, HyphaeError::Timeout(_) | HyphaeError::Connection(_)) {
            return true;
        }
        if let Some(status) = err.status_code()
            && self.retryable_status_codes.contains(&status)
        {
            return true;
        }
        let message = err.to_string().to_lowercase();
        self.retryable_error_patterns
            .iter()
            .any(|p| message.contains(&p.to_lowercase()))
    }

    /// Upper bound on time spent sleeping across all retries.
    pub fn max_total_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.saturating_mul(u64::from(self.max_retries)))
    }

    fn apply(&mut self, over: &RetryOverride) {
        if let Some(n) = over.max_retries {
            self.max_retries = n;
        }
        if let Some(ms) = over.initial_delay_ms {
            self.initial_delay_ms = ms;
        }
        if let Some(ms) = over.max_delay_ms {
            self.max_delay_ms = ms;
        }
        if let Some(m) = over.backoff_multiplier {
            self.backoff_multiplier = m;
        }
    }
}

/// Partial per-model override merged over the default policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOverride {
    pub max_retries: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

/// Default retry policy plus per-model overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicies {
    #[serde(flatten)]
    pub default: RetryConfig,
    pub models: HashMap<String, RetryOverride>,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        let over = |retries: u32, initial: u64, max: Option<u64>| RetryOverride {
            max_retries: Some(retries),
            initial_delay_ms: Some(initial),
            max_delay_ms: max,
            backoff_multiplier: None,
        };
        let models = [
            ("openai/gpt-4o", over(5, 2_000, None)),
            ("openai/o1", over(3, 5_000, Some(60_000))),
            ("anthropic/claude-3-5-sonnet-20241022", over(4, 1_500, None)),
            ("google/gemini-2.0-flash-exp", over(5, 500, None)),
        ]
        .into_iter()
        .map(|(id, o)| (id.to_owned(), o))
        .collect();

        Self {
            default: RetryConfig::default(),
            models,
        }
    }
}

impl RetryPolicies {
    /// Same policy for every model.
    pub fn uniform(config: RetryConfig) -> Self {
        Self {
            default: config,
            models: HashMap::new(),
        }
    }

    pub fn with_override(mut self, model: impl Into<String>, over: RetryOverride) -> Self {
        self.models.insert(model.into(), over);
        self
    }

    /// Effective policy for `model`.
    pub fn for_model(&self, model: &str) -> RetryConfig {
        let mut config = self.default.clone();
        if let Some(over) = self.models.get(model) {
            config.apply(over);
        }
        config
    }
}

/// What [`retry_with_backoff`] did.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// Calls made, including the first.
    pub attempts: u32,
    pub total_delay: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

// ============================================================================
// Shared retry helper
// ============================================================================

/// Execute an async operation with retry logic.
///
/// Retries errors classified retryable by `config` up to
/// `config.max_retries` times. Non-retryable errors are returned
/// immediately.
pub async fn retry_with_backoff<F, Fut, T>(mut operation: F, config: &RetryConfig) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut total_delay = Duration::ZERO;
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "succeeded after retry");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    total_delay,
                };
            }
            Err(e) if attempt < config.max_retries && config.is_retryable(&e) => {
                let delay = config.effective_delay(attempt, e.retry_after());
                metrics::counter!(telemetry::RETRIES_TOTAL, "attempt" => (attempt + 1).to_string())
                    .increment(1);
                warn!(
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "retrying after transient error"
                );
                tokio::time::sleep(delay).await;
                total_delay += delay;
                attempt += 1;
            }
            Err(e) => {
                return RetryOutcome {
                    result: Err(e),
                    attempts: attempt + 1,
                    total_delay,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_until_capped() {
        let config = RetryConfig::new().max_delay(Duration::from_millis(5_000));
        let delays: Vec<u64> = (0..5)
            .map(|a| config.delay_for_attempt(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let config = RetryConfig::new();
        for attempt in 0..4 {
            let base = config.delay_for_attempt(attempt).as_secs_f64();
            for _ in 0..200 {
                let d = config.effective_delay(attempt, None).as_secs_f64();
                assert!(d >= base * 0.75 - 1e-9, "{d} < 0.75 * {base}");
                assert!(d <= base * 1.25 + 1e-9, "{d} > 1.25 * {base}");
            }
        }
    }

    #[test]
    fn jittered_delay_respects_cap() {
        let config = RetryConfig::new().max_delay(Duration::from_millis(1_000));
        for _ in 0..200 {
            assert!(config.effective_delay(5, None) <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn retry_after_hint_wins_but_is_capped() {
        let config = RetryConfig::new();
        assert_eq!(
            config.effective_delay(0, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(
            config.effective_delay(0, Some(Duration::from_secs(600))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn classification() {
        let config = RetryConfig::default();
        assert!(config.is_retryable(&HyphaeError::RateLimited { retry_after: None }));
        assert!(config.is_retryable(&HyphaeError::Timeout("30s".into())));
        assert!(config.is_retryable(&HyphaeError::Api {
            status: 503,
            message: "overloaded".into()
        }));
        assert!(config.is_retryable(&HyphaeError::Http("read ECONNRESET".into())));
        assert!(config.is_retryable(&HyphaeError::Api {
            status: 400,
            message: "context_length_exceeded".into()
        }));
        assert!(!config.is_retryable(&HyphaeError::Api {
            status: 400,
            message: "bad request".into()
        }));
        assert!(!config.is_retryable(&HyphaeError::AuthenticationFailed));
        assert!(!config.is_retryable(&HyphaeError::InvalidInput("empty".into())));
    }

    #[test]
    fn per_model_overrides_merge() {
        let policies = RetryPolicies::default();
        let o1 = policies.for_model("openai/o1");
        assert_eq!(o1.max_retries, 3);
        assert_eq!(o1.initial_delay_ms, 5_000);
        assert_eq!(o1.max_delay_ms, 60_000);
        assert_eq!(o1.backoff_multiplier, 2.0);

        let gpt4o = policies.for_model("openai/gpt-4o");
        assert_eq!(gpt4o.max_retries, 5);
        assert_eq!(gpt4o.max_delay_ms, 30_000);

        assert_eq!(policies.for_model("unknown"), RetryConfig::default());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new().jitter(false);
        let outcome = retry_with_backoff(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(HyphaeError::Api {
                        status: 502,
                        message: "bad gateway".into(),
                    })
                } else {
                    Ok("done")
                }
            },
            &config,
        )
        .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.total_delay, Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new().max_retries(2).jitter(false);
        let outcome: RetryOutcome<()> = retry_with_backoff(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HyphaeError::Timeout("slow".into()))
            },
            &config,
        )
        .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = retry_with_backoff(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HyphaeError::AuthenticationFailed)
            },
            &RetryConfig::new(),
        )
        .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome.result, Err(HyphaeError::AuthenticationFailed)));
    }

    #[test]
    fn oversized_delays_saturate() {
        let config = RetryConfig::new().max_delay(Duration::MAX);
        assert_eq!(config.max_delay_ms, u64::MAX);
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1_000));
    }
}
