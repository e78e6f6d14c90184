//! The request pipeline.
//!
//! `generate` runs admission, cache lookup, dedup, then provider execution
//! with fallback, retry and per-model circuit breakers. Successful responses
//! are priced, accounted and written back to the cache.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::GenerateRequest;
use super::stream::{AccountedStream, StreamLedger};
use crate::admission::{AdmissionController, TierResolver};
use crate::alerts::BudgetAlerts;
use crate::cache::{CacheDecision, CachePolicy, CachedResponse, CachedTokenUsage, ResponseCache};
use crate::dedup::{Deduplicator, RequestFingerprint};
use crate::fallback::FallbackRouter;
use crate::health::HealthTracker;
use crate::providers::{CompletionRequest, CompletionStream, ProviderSet, bounded_stream};
use crate::registry::{ModelRegistry, PricingConfig};
use crate::resilience::{CircuitRegistry, RetryPolicies, retry_with_backoff};
use crate::routing::IntelligentRouter;
use crate::telemetry;
use crate::types::{AiResponse, Completion, ResponseMetadata, TokenCounts, prompt_of};
use crate::usage::{TokenUsageEvent, UsageAccountant};
use crate::{HyphaeError, Result};

/// Provider output plus which models were involved.
#[derive(Debug, Clone)]
struct Execution {
    completion: Completion,
    model_used: String,
    attempted: Vec<String>,
    attempts: u32,
}

/// Orchestrates LLM requests over a set of providers.
///
/// Built with [`Orchestrator::builder`](crate::Orchestrator::builder).
pub struct Orchestrator {
    pub(super) providers: ProviderSet,
    pub(super) registry: Arc<ModelRegistry>,
    pub(super) pricing: PricingConfig,
    pub(super) admission: AdmissionController,
    pub(super) tiers: Arc<dyn TierResolver>,
    pub(super) cache: ResponseCache,
    pub(super) cache_policy: CachePolicy,
    pub(super) dedup: Deduplicator,
    pub(super) health: Arc<HealthTracker>,
    pub(super) retry: RetryPolicies,
    pub(super) circuits: CircuitRegistry,
    pub(super) fallback: FallbackRouter,
    pub(super) router: IntelligentRouter,
    pub(super) accountant: Arc<UsageAccountant>,
    pub(super) alerts: Arc<BudgetAlerts>,
    pub(super) stream_buffer: usize,
}

impl Orchestrator {
    /// Generate a complete response.
    #[instrument(skip_all, fields(user = %request.user_id, model = %request.model_id))]
    pub async fn generate(&self, request: GenerateRequest) -> Result<AiResponse> {
        request.validate()?;
        let started = Instant::now();

        let tier = self.tiers.tier_for(&request.user_id).await;
        self.admission
            .admit(&request.user_id, tier, Some(&request.model_id))
            .await?;

        let prompt = prompt_of(&request.messages).to_owned();
        let decision = self.cache_policy.classify(&prompt);
        let use_cache = request.enable_cache && decision.cache;

        if use_cache
            && let Some(hit) = self
                .cache
                .lookup(&prompt, &request.model_id, &request.namespace)
                .await
        {
            debug!(served_by = hit.served_by(), "serving cached response");
            return Ok(self.serve_cached(&request, hit, started).await);
        }

        let cache_write = use_cache.then_some(decision);
        let (req, prompt_ref) = (&request, prompt.as_str());
        let run = || async move {
            let execution = self.execute(req).await?;
            Ok::<_, HyphaeError>(self.complete(req, prompt_ref, cache_write, execution, started).await)
        };

        let result = if request.enable_dedup {
            let fingerprint = RequestFingerprint::new(&request.user_id, &prompt, &request.model_id);
            self.dedup
                .execute(&fingerprint, run)
                .await
                .map(|outcome| (outcome.result, outcome.from_cache))
        } else {
            run().await.map(|response| (response, false))
        };

        match result {
            Ok((response, false)) => Ok(response),
            Ok((response, true)) => Ok(self.serve_joined(&request, response, started).await),
            Err(e) => {
                warn!(error = %e, "generation failed");
                self.accountant.record_error(&request.model_id).await;
                Err(e)
            }
        }
    }

    /// Stream a response. Admission applies; cache and dedup do not.
    #[instrument(skip_all, fields(user = %request.user_id, model = %request.model_id))]
    pub async fn stream(&self, request: GenerateRequest) -> Result<CompletionStream> {
        request.validate()?;
        let started = Instant::now();

        let tier = self.tiers.tier_for(&request.user_id).await;
        self.admission
            .admit(&request.user_id, tier, Some(&request.model_id))
            .await?;

        let model = request.model_id.clone();
        let provider = self.providers.resolve(&model)?;
        let completion_request = request.completion_request();
        let breaker = self.circuits.breaker(&model);

        let inner = match breaker
            .execute(|| provider.complete_stream(&completion_request))
            .await
        {
            Ok(inner) => inner,
            Err(e) => {
                self.observe_failure(&model, &e).await;
                return Err(e);
            }
        };

        let ledger = StreamLedger {
            accountant: self.accountant.clone(),
            registry: self.registry.clone(),
            pricing: self.pricing.clone(),
            user_id: request.user_id.clone(),
            model_id: model,
            module: request.module.unwrap_or_default(),
            prompt_chars: prompt_of(&request.messages).chars().count(),
            started,
        };
        let bounded = bounded_stream(inner, self.stream_buffer);
        Ok(Box::pin(AccountedStream::new(bounded, ledger)))
    }

    /// Run requests `concurrency` at a time, preserving order.
    pub async fn batch_generate(
        &self,
        requests: Vec<GenerateRequest>,
        concurrency: usize,
    ) -> Vec<Result<AiResponse>> {
        let mut results = Vec::with_capacity(requests.len());
        let mut pending = requests.into_iter().peekable();
        while pending.peek().is_some() {
            let chunk: Vec<_> = pending
                .by_ref()
                .take(concurrency.max(1))
                .map(|r| self.generate(r))
                .collect();
            results.extend(futures_util::future::join_all(chunk).await);
        }
        results
    }

    async fn execute(&self, request: &GenerateRequest) -> Result<Execution> {
        let base = request.completion_request();

        if request.enable_fallback {
            let chain = self.fallback.chain(&request.model_id);
            let outcome = self
                .fallback
                .retry_with_fallback(
                    |model| self.call_model(base.for_model(model)),
                    &request.model_id,
                    chain,
                    &self.retry,
                )
                .await;
            let completion = outcome.result?;
            Ok(Execution {
                completion,
                model_used: outcome
                    .model_used
                    .unwrap_or_else(|| request.model_id.clone()),
                attempted: outcome.attempted,
                attempts: outcome.attempts,
            })
        } else {
            let config = self.retry.for_model(&request.model_id);
            let outcome = retry_with_backoff(|| self.call_model(base.clone()), &config).await;
            let attempts = outcome.attempts;
            let completion = outcome.result?;
            Ok(Execution {
                completion,
                model_used: request.model_id.clone(),
                attempted: vec![request.model_id.clone()],
                attempts,
            })
        }
    }

    /// One provider call through the model's breaker.
    async fn call_model(&self, request: CompletionRequest) -> Result<Completion> {
        let model = request.model.clone();
        let provider = self.providers.resolve(&model)?;
        let breaker = self.circuits.breaker(&model);

        let started = Instant::now();
        let result = breaker.execute(|| provider.complete(&request)).await;
        metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS, "model" => model.clone())
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(completion) if completion.text.is_empty() => {
                metrics::counter!(telemetry::REQUESTS_TOTAL, "model" => model.clone(), "status" => "error")
                    .increment(1);
                self.health.record_error(&model, &HyphaeError::EmptyResponse).await;
                return Err(HyphaeError::EmptyResponse);
            }
            Ok(_) => {
                metrics::counter!(telemetry::REQUESTS_TOTAL, "model" => model.clone(), "status" => "ok")
                    .increment(1);
                self.health.record_success(&model).await;
            }
            Err(e) => self.observe_failure(&model, e).await,
        }
        result
    }

    async fn observe_failure(&self, model: &str, error: &HyphaeError) {
        if matches!(error, HyphaeError::CircuitOpen { .. }) {
            return;
        }
        metrics::counter!(telemetry::REQUESTS_TOTAL, "model" => model.to_owned(), "status" => "error")
            .increment(1);
        if !error.is_fatal() {
            self.health.record_error(model, error).await;
        }
    }

    /// Price, account and cache a fresh execution.
    async fn complete(
        &self,
        request: &GenerateRequest,
        prompt: &str,
        cache: Option<CacheDecision>,
        execution: Execution,
        started: Instant,
    ) -> AiResponse {
        let usage = execution.completion.usage;
        let cost = self.registry.calculate_cost(
            usage.prompt_tokens,
            usage.completion_tokens,
            &execution.model_used,
            &self.pricing,
        );
        let latency_ms = elapsed_ms(started);

        self.accountant
            .record(
                TokenUsageEvent::new(&request.user_id, &execution.model_used)
                    .tokens(usage.prompt_tokens, usage.completion_tokens)
                    .cost(cost.user_charge)
                    .latency_ms(latency_ms)
                    .module(request.module.unwrap_or_default()),
            )
            .await;

        if let Some(decision) = cache {
            // Keyed by the requested model so later requests for it hit,
            // whichever model answered.
            let mut entry = CachedResponse::new(&execution.completion.text, &request.model_id);
            if execution.model_used != request.model_id {
                entry.model_used = Some(execution.model_used.clone());
            }
            entry.token_usage = Some(CachedTokenUsage {
                input: usage.prompt_tokens,
                output: usage.completion_tokens,
                cost: cost.user_charge,
            });
            self.cache
                .put(prompt, &request.model_id, &request.namespace, &entry, decision.ttl)
                .await;
        }

        let health = self.health.get_health(&execution.model_used).await;
        AiResponse {
            content: execution.completion.text,
            metadata: ResponseMetadata {
                fallback_used: execution.model_used != request.model_id,
                retry_attempts: execution.attempts,
                attempted: execution.attempted,
                health: Some(health),
            },
            model_used: execution.model_used,
            token_usage: usage.into(),
            cost: cost.user_charge,
            cached: false,
            from_dedup: false,
            latency_ms,
        }
    }

    async fn serve_cached(&self, request: &GenerateRequest, hit: CachedResponse, started: Instant) -> AiResponse {
        let token_usage = hit
            .token_usage
            .map(|t| TokenCounts {
                input: t.input,
                output: t.output,
                total: t.input + t.output,
            })
            .unwrap_or_default();
        let model_used = hit.served_by().to_owned();
        let latency_ms = elapsed_ms(started);
        self.record_free(request, &model_used, latency_ms).await;

        AiResponse {
            content: hit.content,
            metadata: ResponseMetadata {
                fallback_used: model_used != request.model_id,
                retry_attempts: 0,
                attempted: Vec::new(),
                health: None,
            },
            model_used,
            token_usage,
            cost: 0.0,
            cached: true,
            from_dedup: false,
            latency_ms,
        }
    }

    /// A follower's copy of the leader's response.
    async fn serve_joined(&self, request: &GenerateRequest, leader: AiResponse, started: Instant) -> AiResponse {
        let latency_ms = elapsed_ms(started);
        self.record_free(request, &leader.model_used, latency_ms).await;
        AiResponse {
            cost: 0.0,
            from_dedup: true,
            latency_ms,
            ..leader
        }
    }

    /// Usage event for a response that cost nothing to serve.
    async fn record_free(&self, request: &GenerateRequest, model_used: &str, latency_ms: u64) {
        self.accountant
            .record(
                TokenUsageEvent::new(&request.user_id, model_used)
                    .cached(true)
                    .latency_ms(latency_ms)
                    .module(request.module.unwrap_or_default()),
            )
            .await;
    }

    /// Models known to this orchestrator.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Usage and cost aggregates.
    pub fn accountant(&self) -> &Arc<UsageAccountant> {
        &self.accountant
    }

    /// Budget thresholds and alert history.
    pub fn alerts(&self) -> &Arc<BudgetAlerts> {
        &self.alerts
    }

    /// Per-model health scores.
    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// Router used for `model = "auto"` requests.
    pub fn router(&self) -> &IntelligentRouter {
        &self.router
    }

    /// Fallback chains per primary model.
    pub fn fallback(&self) -> &FallbackRouter {
        &self.fallback
    }

    /// Circuit breakers keyed by model.
    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    /// Exact and semantic response cache.
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// In-flight request deduplication.
    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    /// Per-user rate limiting.
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
