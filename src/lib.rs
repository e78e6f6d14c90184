//! Hyphae - resilient, cost-aware orchestration for LLM requests
//!
//! Every request passes through admission control, a shared response
//! cache, in-flight deduplication, and a resilience layer (retry with
//! backoff, per-model circuit breakers, health-aware fallback chains)
//! before reaching a provider. Token usage and cost are accounted per
//! user, model, day and module, and budget alerts sweep over those
//! aggregates.
//!
//! All cross-instance state lives behind the [`StateStore`] trait:
//! [`MemoryStore`] for a single process, `RedisStore` (feature `redis`)
//! for a fleet.
//!
//! # Example
//!
//! ```rust,no_run
//! use hyphae::{GenerateRequest, Hyphae, Message};
//!
//! #[tokio::main]
//! async fn main() -> hyphae::Result<()> {
//!     let orchestrator = Hyphae::builder()
//!         .openai("sk-your-key")
//!         .build()?;
//!
//!     let response = orchestrator
//!         .generate(GenerateRequest::new(
//!             "researcher-42",
//!             "openai/gpt-4o-mini",
//!             vec![Message::user("What is Trichoderma?")],
//!         ))
//!         .await?;
//!
//!     println!("{} (via {}, ${:.4})", response.content, response.model_used, response.cost);
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod alerts;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fallback;
pub mod gateway;
pub mod health;
pub mod providers;
pub mod registry;
pub mod resilience;
pub mod routing;
pub mod store;
pub mod telemetry;
pub mod traits;
pub mod types;
pub mod usage;
pub mod version;

// Re-export main types at crate root
pub use error::{HyphaeError, Result};
pub use gateway::{GenerateRequest, Hyphae, HyphaeBuilder, Orchestrator};
pub use traits::AiGateway;
pub use version::{PKG_VERSION, version_string};

pub use admission::{AdmissionConfig, AdmissionController, RateLimitConfig, StaticTier, Tier, TierResolver};
pub use alerts::{BudgetAlert, BudgetAlerts, NewBudgetAlert, Notifier};
pub use cache::{CacheConfig, CachePolicy, ResponseCache};
pub use config::Config;
pub use dedup::{DedupConfig, Deduplicator, RequestFingerprint};
pub use fallback::{FallbackConfig, FallbackRouter};
pub use health::{HealthConfig, HealthStatus, HealthTracker, ModelHealth};
pub use providers::{CompletionProvider, CompletionRequest, CompletionStream, OpenAiCompatProvider, ProviderSet};
pub use registry::{CostBreakdown, ModelRegistry, PricingConfig};
pub use resilience::{CircuitBreaker, CircuitConfig, CircuitState, RetryConfig, RetryPolicies};
pub use routing::{IntelligentRouter, ModelRecommendation, RoutingPreferences};
pub use store::{MemoryStore, StateStore, StoreError};
pub use usage::{DateRange, Module, TokenUsageEvent, UsageAccountant};

pub use types::{
    AiResponse, Completion, Message, ModelBadge, ModelInfo, ResponseMetadata, Role, StreamEvent,
    TokenCounts, Usage,
};
