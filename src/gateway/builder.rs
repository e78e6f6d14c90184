//! Builder for configuring orchestrator instances

use std::sync::Arc;

use super::Orchestrator;
use crate::admission::{AdmissionConfig, AdmissionController, StaticTier, TierResolver};
use crate::alerts::{AlertsConfig, BudgetAlerts, Notifier};
use crate::cache::{CacheConfig, CachePolicy, ResponseCache};
use crate::config::Config;
use crate::dedup::{DedupConfig, Deduplicator};
use crate::fallback::{FallbackConfig, FallbackRouter};
use crate::health::{HealthConfig, HealthTracker};
use crate::providers::{CompletionProvider, DEFAULT_STREAM_BUFFER, OpenAiCompatProvider, ProviderSet};
use crate::registry::{ModelRegistry, PricingConfig};
use crate::resilience::{CircuitConfig, CircuitRegistry, RetryPolicies};
use crate::routing::IntelligentRouter;
use crate::store::{MemoryStore, StateStore};
use crate::usage::{AccountingConfig, UsageAccountant};
use crate::{HyphaeError, Result};

/// Main entry point for creating orchestrator instances.
pub struct Hyphae;

impl Hyphae {
    /// Create a new builder for configuring the orchestrator.
    pub fn builder() -> HyphaeBuilder {
        HyphaeBuilder::new()
    }
}

impl Orchestrator {
    /// Same as [`Hyphae::builder`].
    pub fn builder() -> HyphaeBuilder {
        HyphaeBuilder::new()
    }
}

/// Builder for configuring orchestrator instances.
pub struct HyphaeBuilder {
    store: Option<Arc<dyn StateStore>>,
    providers: ProviderSet,
    registry: Option<ModelRegistry>,
    config: Config,
    tiers: Arc<dyn TierResolver>,
    notifier: Option<Arc<dyn Notifier>>,
    stream_buffer: usize,
}

impl HyphaeBuilder {
    /// Builder with in-memory state, default configuration and no providers.
    pub fn new() -> Self {
        Self {
            store: None,
            providers: ProviderSet::new(),
            registry: None,
            config: Config::default(),
            tiers: Arc::new(StaticTier::default()),
            notifier: None,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    /// Start from a loaded configuration, registering its providers.
    ///
    /// The store is not opened here; pass one with [`store`](Self::store)
    /// (see [`store::connect`](crate::store::connect)) or the builder falls
    /// back to an in-process [`MemoryStore`].
    pub fn from_config(config: &Config) -> Self {
        let mut builder = Self::new().config(config.clone());
        for entry in &config.providers {
            let base_url = entry
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
            let mut provider = OpenAiCompatProvider::with_base_url(&entry.prefix, entry.api_key(), base_url);
            if entry.keep_model_prefix {
                provider = provider.keep_model_prefix();
            }
            let provider: Arc<dyn CompletionProvider> = Arc::new(provider);
            builder = if entry.prefix == "*" {
                builder.default_provider(provider)
            } else {
                builder.provider(entry.prefix.clone(), provider)
            };
        }
        builder
    }

    /// Shared state store (default: a fresh [`MemoryStore`]).
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Route models with id prefix `prefix/` to `provider`.
    pub fn provider(mut self, prefix: impl Into<String>, provider: Arc<dyn CompletionProvider>) -> Self {
        self.providers = self.providers.register(prefix, provider);
        self
    }

    /// Provider for models no prefix matches.
    pub fn default_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.providers = self.providers.default_provider(provider);
        self
    }

    /// Configure the OpenAI API for `openai/` models.
    pub fn openai(self, api_key: impl Into<String>) -> Self {
        self.provider("openai", Arc::new(OpenAiCompatProvider::new("openai", api_key)))
    }

    /// Configure an OpenAI-compatible endpoint for `prefix/` models.
    pub fn openai_compatible(
        self,
        prefix: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let prefix = prefix.into();
        let provider = OpenAiCompatProvider::with_base_url(prefix.clone(), api_key, base_url);
        self.provider(prefix, Arc::new(provider))
    }

    /// Model catalog (default: the embedded seed).
    pub fn registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace every component configuration at once.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Rate limits per tier and per model.
    pub fn admission(mut self, config: AdmissionConfig) -> Self {
        self.config.admission = config;
        self
    }

    /// Response cache TTLs and semantic matching.
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.config.cache = config;
        self
    }

    /// Rules deciding whether and how long a prompt is cached.
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.config.cache_policy = policy;
        self
    }

    /// In-flight deduplication window and polling.
    pub fn dedup(mut self, config: DedupConfig) -> Self {
        self.config.dedup = config;
        self
    }

    /// Health score thresholds.
    pub fn health(mut self, config: HealthConfig) -> Self {
        self.config.health = config;
        self
    }

    /// Retry policy per provider.
    pub fn retry(mut self, policies: RetryPolicies) -> Self {
        self.config.retry = policies;
        self
    }

    /// Circuit breaker thresholds.
    pub fn circuit(mut self, config: CircuitConfig) -> Self {
        self.config.circuit = config;
        self
    }

    /// Fallback chains per primary model.
    pub fn fallback(mut self, config: FallbackConfig) -> Self {
        self.config.fallback = config;
        self
    }

    /// Per-model token prices.
    pub fn pricing(mut self, config: PricingConfig) -> Self {
        self.config.pricing = config;
        self
    }

    /// Usage aggregate retention.
    pub fn accounting(mut self, config: AccountingConfig) -> Self {
        self.config.accounting = config;
        self
    }

    /// Budget thresholds.
    pub fn alerts(mut self, config: AlertsConfig) -> Self {
        self.config.alerts = config;
        self
    }

    /// Source of user tiers (default: everyone is `free`).
    pub fn tier_resolver(mut self, resolver: Arc<dyn TierResolver>) -> Self {
        self.tiers = resolver;
        self
    }

    /// Budget alert dispatch (default: log).
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Events buffered per stream between provider and consumer.
    pub fn stream_buffer(mut self, events: usize) -> Self {
        self.stream_buffer = events.max(1);
        self
    }

    /// Build the orchestrator.
    pub fn build(self) -> Result<Orchestrator> {
        if self.providers.is_empty() {
            return Err(HyphaeError::Configuration(
                "at least one provider must be configured".into(),
            ));
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::with_max_entries(self.config.store.max_entries)));
        let registry = Arc::new(self.registry.unwrap_or_else(ModelRegistry::with_embedded_seed));
        let config = self.config;

        let health = Arc::new(HealthTracker::new(store.clone(), config.health));
        let accountant = Arc::new(UsageAccountant::new(store.clone(), config.accounting));
        let mut alerts = BudgetAlerts::new(store.clone(), accountant.clone(), config.alerts);
        if let Some(notifier) = self.notifier {
            alerts = alerts.with_notifier(notifier);
        }

        Ok(Orchestrator {
            providers: self.providers,
            pricing: config.pricing,
            admission: AdmissionController::new(store.clone(), config.admission),
            tiers: self.tiers,
            cache: ResponseCache::new(store.clone(), config.cache),
            cache_policy: config.cache_policy,
            dedup: Deduplicator::new(store, config.dedup),
            retry: config.retry,
            circuits: CircuitRegistry::new(config.circuit),
            fallback: FallbackRouter::new(config.fallback, health.clone(), registry.clone()),
            router: IntelligentRouter::new(registry.clone(), health.clone()),
            registry,
            health,
            accountant,
            alerts: Arc::new(alerts),
            stream_buffer: self.stream_buffer,
        })
    }
}

impl Default for HyphaeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
