//! Fallback chains across models.
//!
//! Each model maps to an ordered list of alternates of similar capability
//! and price. [`FallbackRouter::retry_with_fallback`] exhausts the retry
//! budget on the primary before advancing through the chain. Alternates
//! currently reported `down` are deferred to the end of the chain rather
//! than dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::health::{HealthStatus, HealthTracker};
use crate::registry::ModelRegistry;
use crate::resilience::{RetryPolicies, retry_with_backoff};
use crate::{HyphaeError, Result, telemetry};

/// Static fallback table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub chains: HashMap<String, Vec<String>>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        const GPT4O: &str = "openai/gpt-4o";
        const GPT4O_MINI: &str = "openai/gpt-4o-mini";
        const SONNET: &str = "anthropic/claude-3-5-sonnet-20241022";
        const HAIKU: &str = "anthropic/claude-3-5-haiku-20241022";

        let table: &[(&str, &[&str])] = &[
            (GPT4O, &[GPT4O_MINI, SONNET]),
            (GPT4O_MINI, &[GPT4O, HAIKU]),
            ("openai/o1", &[GPT4O, SONNET]),
            ("openai/o3-mini", &[GPT4O_MINI, HAIKU]),
            (SONNET, &[GPT4O, "google/gemini-1.5-pro-latest"]),
            (HAIKU, &[GPT4O_MINI, "google/gemini-1.5-flash"]),
            ("anthropic/claude-3-opus-20240229", &[SONNET, GPT4O]),
            ("google/gemini-2.0-flash-exp", &["google/gemini-1.5-flash", GPT4O_MINI]),
            ("google/gemini-1.5-pro-latest", &[SONNET, GPT4O]),
            ("google/gemini-1.5-flash", &[GPT4O_MINI, HAIKU]),
            ("xai/grok-beta", &[GPT4O, SONNET]),
            ("xai/grok-2-1212", &[GPT4O, SONNET]),
            ("meta-llama/llama-3.3-70b-instruct", &[GPT4O, SONNET]),
            (
                "meta-llama/llama-3.1-405b-instruct",
                &["meta-llama/llama-3.3-70b-instruct", SONNET],
            ),
            ("crowelogic/mini", &[GPT4O_MINI, HAIKU]),
            ("azure/crowelogic", &[GPT4O, SONNET]),
        ];

        let chains = table
            .iter()
            .map(|(model, alts)| {
                (
                    (*model).to_owned(),
                    alts.iter().map(|a| (*a).to_owned()).collect(),
                )
            })
            .collect();
        Self { chains }
    }
}

impl FallbackConfig {
    pub fn with_chain<I, S>(mut self, model: impl Into<String>, alternates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chains
            .insert(model.into(), alternates.into_iter().map(Into::into).collect());
        self
    }
}

/// What [`FallbackRouter::retry_with_fallback`] did.
#[derive(Debug)]
pub struct FallbackOutcome<T> {
    pub result: Result<T>,
    /// Model that served the request, on success.
    pub model_used: Option<String>,
    /// Models tried, in order.
    pub attempted: Vec<String>,
    /// Provider calls across all models.
    pub attempts: u32,
    pub total_delay: Duration,
}

impl<T> FallbackOutcome<T> {
    pub fn fallback_used(&self, primary: &str) -> bool {
        self.model_used.as_deref().is_some_and(|m| m != primary)
    }
}

/// Health-aware fallback chain executor.
pub struct FallbackRouter {
    config: FallbackConfig,
    health: Arc<HealthTracker>,
    registry: Arc<ModelRegistry>,
}

impl FallbackRouter {
    pub fn new(config: FallbackConfig, health: Arc<HealthTracker>, registry: Arc<ModelRegistry>) -> Self {
        Self {
            config,
            health,
            registry,
        }
    }

    /// Configured alternates for `model` (empty if none).
    pub fn chain(&self, model: &str) -> &[String] {
        self.config.chains.get(model).map(Vec::as_slice).unwrap_or_default()
    }

    /// First alternate not reported `down`, or the first alternate if all are.
    pub async fn get_fallback(&self, model: &str) -> Option<String> {
        let chain = self.chain(model);
        for candidate in chain {
            if self.health.status(candidate).await != HealthStatus::Down {
                return Some(candidate.clone());
            }
        }
        chain.first().cloned()
    }

    /// First model in `models` not reported `down`, or the first if all are.
    pub async fn best_available(&self, models: &[String]) -> Option<String> {
        for model in models {
            if self.health.status(model).await != HealthStatus::Down {
                return Some(model.clone());
            }
        }
        models.first().cloned()
    }

    /// Up to three catalog models sharing a capability with `model`,
    /// nearest input price first.
    pub fn similar_models(&self, model: &str) -> Vec<String> {
        let Some(target) = self.registry.get(model) else {
            return Vec::new();
        };
        let mut similar: Vec<_> = self
            .registry
            .list()
            .into_iter()
            .filter(|m| m.id != target.id)
            .filter(|m| m.capabilities.iter().any(|c| target.has_capability(c)))
            .collect();
        let distance = |price: f64| (price - target.cost_per_1m_input).abs();
        similar.sort_by(|a, b| {
            distance(a.cost_per_1m_input).total_cmp(&distance(b.cost_per_1m_input))
        });
        similar.into_iter().take(3).map(|m| m.id.clone()).collect()
    }

    /// Run `operation` against `primary`, then each alternate in `chain`,
    /// each under its own retry policy from `policies`.
    ///
    /// Alternates reported `down` are tried after the healthy ones. If every
    /// model fails, the result is [`HyphaeError::AllModelsExhausted`], unless
    /// every failure was non-retryable, in which case the last error is
    /// returned unchanged.
    pub async fn retry_with_fallback<T, F, Fut>(
        &self,
        operation: F,
        primary: &str,
        chain: &[String],
        policies: &RetryPolicies,
    ) -> FallbackOutcome<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut healthy = Vec::with_capacity(chain.len());
        let mut deferred = Vec::new();
        for alternate in chain.iter().filter(|m| m.as_str() != primary) {
            if self.health.status(alternate).await == HealthStatus::Down {
                debug!(model = %alternate, "deferring fallback reported down");
                deferred.push(alternate.clone());
            } else {
                healthy.push(alternate.clone());
            }
        }
        let order = std::iter::once(primary.to_owned()).chain(healthy).chain(deferred);

        let mut attempted = Vec::new();
        let mut attempts = 0;
        let mut total_delay = Duration::ZERO;
        let mut last_error: Option<HyphaeError> = None;
        let mut any_retryable = false;

        for model in order {
            if !attempted.is_empty() {
                info!(from = primary, to = %model, "falling back");
            }
            attempted.push(model.clone());
            let config = policies.for_model(&model);
            let outcome = retry_with_backoff(|| operation(model.clone()), &config).await;
            attempts += outcome.attempts;
            total_delay += outcome.total_delay;

            match outcome.result {
                Ok(value) => {
                    if model != primary {
                        metrics::counter!(telemetry::FALLBACKS_TOTAL,
                            "from" => primary.to_owned(),
                            "to" => model.clone(),
                        )
                        .increment(1);
                    }
                    return FallbackOutcome {
                        result: Ok(value),
                        model_used: Some(model),
                        attempted,
                        attempts,
                        total_delay,
                    };
                }
                Err(e) => {
                    debug!(model = %model, error = %e, "model exhausted");
                    any_retryable |= config.is_retryable(&e);
                    last_error = Some(e);
                }
            }
        }

        let error = match last_error {
            Some(e) if !any_retryable => e,
            Some(e) => HyphaeError::AllModelsExhausted {
                attempted: attempted.clone(),
                last_error: e.to_string(),
            },
            None => HyphaeError::NoProvider(primary.to_owned()),
        };
        FallbackOutcome {
            result: Err(error),
            model_used: None,
            attempted,
            attempts,
            total_delay,
        }
    }
}
