//! Admission control: tiered fixed-window rate limiting with penalty locks.
//!
//! Counters live in the shared [`StateStore`] so every orchestrator
//! instance enforces the same window. Keys:
//!
//! - `ratelimit:{user}:{tier}`: tier window counter
//! - `ratelimit:{user}:penalty`: tier penalty lock (unix ms)
//! - `ratelimit:{user}:model:{model}`: per-model window counter
//! - `ratelimit:{user}:model:{model}:penalty`: per-model penalty lock
//!
//! The read-then-increment sequence is not transactional; concurrent first
//! requests in a fresh window may both see zero. Admission fails open when
//! the store is unreachable.

mod tier;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use tier::Tier;

use crate::store::{self, StateStore, StoreResult, prefix, unix_millis};
use crate::{HyphaeError, Result, telemetry};

/// Limit for one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
    /// Lockout applied when the window is exceeded. 0 disables it.
    #[serde(default)]
    pub penalty_ms: u64,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window_ms: duration_ms(window),
            penalty_ms: 0,
        }
    }

    pub fn with_penalty(mut self, penalty: Duration) -> Self {
        self.penalty_ms = duration_ms(penalty);
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn penalty(&self) -> Option<Duration> {
        (self.penalty_ms > 0).then(|| Duration::from_millis(self.penalty_ms))
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Tier limits plus per-model overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub free: RateLimitConfig,
    pub pro: RateLimitConfig,
    pub expert: RateLimitConfig,
    pub master: RateLimitConfig,
    /// Additional window per model id, checked before the tier window.
    pub models: HashMap<String, RateLimitConfig>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        const MINUTE: Duration = Duration::from_secs(60);
        let models = [
            (
                "openai/o1",
                RateLimitConfig::new(5, MINUTE).with_penalty(Duration::from_secs(120)),
            ),
            ("openai/gpt-4o", RateLimitConfig::new(20, MINUTE)),
            ("anthropic/claude-3-opus-20240229", RateLimitConfig::new(10, MINUTE)),
            ("anthropic/claude-3-5-sonnet-20241022", RateLimitConfig::new(30, MINUTE)),
        ]
        .into_iter()
        .map(|(id, cfg)| (id.to_owned(), cfg))
        .collect();

        Self {
            free: RateLimitConfig::new(10, MINUTE).with_penalty(Duration::from_secs(300)),
            pro: RateLimitConfig::new(50, MINUTE).with_penalty(MINUTE),
            expert: RateLimitConfig::new(200, MINUTE).with_penalty(Duration::from_secs(30)),
            master: RateLimitConfig::new(1000, MINUTE),
            models,
        }
    }
}

impl AdmissionConfig {
    pub fn tier(&self, tier: Tier) -> &RateLimitConfig {
        match tier {
            Tier::Free => &self.free,
            Tier::Pro => &self.pro,
            Tier::Expert => &self.expert,
            Tier::Master => &self.master,
        }
    }

    pub fn with_tier(mut self, tier: Tier, config: RateLimitConfig) -> Self {
        match tier {
            Tier::Free => self.free = config,
            Tier::Pro => self.pro = config,
            Tier::Expert => self.expert = config,
            Tier::Master => self.master = config,
        }
        self
    }

    pub fn with_model(mut self, model: impl Into<String>, config: RateLimitConfig) -> Self {
        self.models.insert(model.into(), config);
        self
    }

    /// Drop all per-model overrides.
    pub fn without_model_limits(mut self) -> Self {
        self.models.clear();
        self
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Unix milliseconds at which the window (or penalty lock) resets.
    pub reset_at: i64,
    /// Set when denied; whole seconds, rounded up.
    pub retry_after: Option<Duration>,
}

impl AdmissionDecision {
    fn denied(reset_at: i64, now: i64) -> Self {
        let wait_ms = u64::try_from(reset_at.saturating_sub(now)).unwrap_or(0);
        Self {
            allowed: false,
            remaining: 0,
            reset_at,
            retry_after: Some(Duration::from_secs(wait_ms.div_ceil(1000))),
        }
    }

    fn into_result(self) -> Result<Self> {
        match self.retry_after {
            Some(retry_after) if !self.allowed => Err(HyphaeError::AdmissionDenied {
                retry_after,
                remaining: self.remaining,
                reset_at: self.reset_at,
            }),
            _ => Ok(self),
        }
    }
}

/// Resolves the subscription tier of a user.
#[async_trait]
pub trait TierResolver: Send + Sync {
    async fn tier_for(&self, user_id: &str) -> Tier;
}

/// Assigns every user the same tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticTier(pub Tier);

#[async_trait]
impl TierResolver for StaticTier {
    async fn tier_for(&self, _user_id: &str) -> Tier {
        self.0
    }
}

/// One rate-limit window and its penalty lock.
struct WindowScope {
    label: &'static str,
    counter_key: String,
    penalty_key: String,
}

impl WindowScope {
    fn tier(user_id: &str, tier: Tier) -> Self {
        Self {
            label: "tier",
            counter_key: store::key(prefix::RATE_LIMIT, &[user_id, tier.as_str()]),
            penalty_key: store::key(prefix::RATE_LIMIT, &[user_id, "penalty"]),
        }
    }

    fn model(user_id: &str, model: &str) -> Self {
        Self {
            label: "model",
            counter_key: store::key(prefix::RATE_LIMIT, &[user_id, "model", model]),
            penalty_key: store::key(prefix::RATE_LIMIT, &[user_id, "model", model, "penalty"]),
        }
    }
}

/// A window's count as read before admission.
struct WindowState {
    current: u32,
    reset_at: i64,
}

/// Tiered admission controller.
pub struct AdmissionController {
    store: Arc<dyn StateStore>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn StateStore>, config: AdmissionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Check and consume one request for `user_id`.
    ///
    /// Never errors: a store failure admits the request with a full
    /// remaining budget.
    pub async fn check(&self, user_id: &str, tier: Tier, model: Option<&str>) -> AdmissionDecision {
        let now = unix_millis();
        match self.evaluate(user_id, tier, model, now).await {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(user = user_id, tier = %tier, "admission denied");
                }
                decision
            }
            Err(e) => {
                warn!(error = %e, user = user_id, "admission store unavailable, failing open");
                metrics::counter!(telemetry::STORE_ERRORS_TOTAL, "component" => "admission")
                    .increment(1);
                let config = self.config.tier(tier);
                AdmissionDecision {
                    allowed: true,
                    remaining: config.max_requests,
                    reset_at: now.saturating_add(i64::try_from(config.window_ms).unwrap_or(i64::MAX)),
                    retry_after: None,
                }
            }
        }
    }

    /// Like [`check`](Self::check), but a denial becomes
    /// [`HyphaeError::AdmissionDenied`].
    pub async fn admit(&self, user_id: &str, tier: Tier, model: Option<&str>) -> Result<AdmissionDecision> {
        self.check(user_id, tier, model).await.into_result()
    }

    /// Delete every counter and lock held for `user_id`.
    pub async fn reset(&self, user_id: &str) -> Result<()> {
        let pattern = store::glob(prefix::RATE_LIMIT, &[user_id]);
        let keys = self.store.keys(&pattern).await?;
        self.store.del_many(&keys).await?;
        Ok(())
    }

    async fn evaluate(
        &self,
        user_id: &str,
        tier: Tier,
        model: Option<&str>,
        now: i64,
    ) -> StoreResult<AdmissionDecision> {
        let tier_config = self.config.tier(tier);
        let tier_scope = WindowScope::tier(user_id, tier);

        if let Some(denied) = self.penalty_lock(&tier_scope, tier_config, now).await? {
            return Ok(denied);
        }

        let mut model_window = None;
        if let Some((model_id, model_config)) =
            model.and_then(|m| self.config.models.get_key_value(m))
        {
            let scope = WindowScope::model(user_id, model_id);
            if let Some(denied) = self.penalty_lock(&scope, model_config, now).await? {
                return Ok(denied);
            }
            let window = self.inspect(&scope, model_config, now).await?;
            model_window = Some((scope, model_config, window));
        }
        let tier_window = self.inspect(&tier_scope, tier_config, now).await?;

        // Nothing is counted unless both windows have room.
        if let Some((scope, config, window)) = &model_window
            && window.current >= config.max_requests
        {
            return self.deny(scope, config, window, now).await;
        }
        if tier_window.current >= tier_config.max_requests {
            return self.deny(&tier_scope, tier_config, &tier_window, now).await;
        }

        self.count(&tier_scope, tier_config, &tier_window).await?;
        let mut decision = AdmissionDecision {
            allowed: true,
            remaining: tier_config.max_requests - tier_window.current - 1,
            reset_at: tier_window.reset_at,
            retry_after: None,
        };
        if let Some((scope, config, window)) = model_window {
            self.count(&scope, config, &window).await?;
            let remaining = config.max_requests - window.current - 1;
            if remaining < decision.remaining {
                decision.remaining = remaining;
                decision.reset_at = window.reset_at;
            }
        }
        Ok(decision)
    }

    /// Denial if a penalty lock is active for `scope`.
    async fn penalty_lock(
        &self,
        scope: &WindowScope,
        config: &RateLimitConfig,
        now: i64,
    ) -> StoreResult<Option<AdmissionDecision>> {
        if config.penalty().is_none() {
            return Ok(None);
        }
        let until: Option<i64> = store::get_json(self.store.as_ref(), &scope.penalty_key).await?;
        match until {
            Some(until) if now < until => {
                metrics::counter!(telemetry::ADMISSION_DENIED_TOTAL, "scope" => "penalty")
                    .increment(1);
                Ok(Some(AdmissionDecision::denied(until, now)))
            }
            _ => Ok(None),
        }
    }

    /// Current count and reset time of a window, without counting.
    async fn inspect(
        &self,
        scope: &WindowScope,
        config: &RateLimitConfig,
        now: i64,
    ) -> StoreResult<WindowState> {
        let current: u32 = store::get_json(self.store.as_ref(), &scope.counter_key)
            .await?
            .unwrap_or(0);
        let reset_at = match self.store.ttl(&scope.counter_key).await? {
            Some(ttl) => now.saturating_add(i64::try_from(duration_ms(ttl)).unwrap_or(i64::MAX)),
            None => now.saturating_add(i64::try_from(config.window_ms).unwrap_or(i64::MAX)),
        };
        Ok(WindowState { current, reset_at })
    }

    /// Reject against a full window, installing a penalty lock if the
    /// window has one.
    async fn deny(
        &self,
        scope: &WindowScope,
        config: &RateLimitConfig,
        window: &WindowState,
        now: i64,
    ) -> StoreResult<AdmissionDecision> {
        metrics::counter!(telemetry::ADMISSION_DENIED_TOTAL, "scope" => scope.label).increment(1);
        if let Some(penalty) = config.penalty() {
            let until = now.saturating_add(i64::try_from(duration_ms(penalty)).unwrap_or(i64::MAX));
            store::set_json(self.store.as_ref(), &scope.penalty_key, &until, penalty).await?;
            return Ok(AdmissionDecision::denied(until, now));
        }
        Ok(AdmissionDecision::denied(window.reset_at, now))
    }

    /// Count one request; the first in a window starts its TTL.
    async fn count(
        &self,
        scope: &WindowScope,
        config: &RateLimitConfig,
        window: &WindowState,
    ) -> StoreResult<()> {
        if window.current == 0 {
            store::set_json(self.store.as_ref(), &scope.counter_key, &1_u32, config.window()).await
        } else {
            self.store.incr(&scope.counter_key).await.map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn controller(config: AdmissionConfig) -> (Arc<MemoryStore>, AdmissionController) {
        let store = Arc::new(MemoryStore::new());
        let admission = AdmissionController::new(store.clone(), config);
        (store, admission)
    }

    #[test]
    fn default_tier_table() {
        let config = AdmissionConfig::default();
        assert_eq!(config.tier(Tier::Free).max_requests, 10);
        assert_eq!(config.tier(Tier::Free).penalty(), Some(Duration::from_secs(300)));
        assert_eq!(config.tier(Tier::Pro).max_requests, 50);
        assert_eq!(config.tier(Tier::Expert).penalty(), Some(Duration::from_secs(30)));
        assert_eq!(config.tier(Tier::Master).max_requests, 1000);
        assert_eq!(config.tier(Tier::Master).penalty(), None);
        assert_eq!(config.models["openai/o1"].max_requests, 5);
    }

    #[tokio::test]
    async fn window_admits_exactly_max_requests() {
        let config = AdmissionConfig::default()
            .without_model_limits()
            .with_tier(Tier::Master, RateLimitConfig::new(3, Duration::from_secs(60)));
        let (_, admission) = controller(config);

        for expected_remaining in [2, 1, 0] {
            let d = admission.check("alice", Tier::Master, None).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }

        let denied = admission.check("alice", Tier::Master, None).await;
        assert!(!denied.allowed);
        let retry_after = denied.retry_after.unwrap();
        assert!(retry_after > Duration::ZERO);
        assert!(retry_after <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn users_have_independent_windows() {
        let config = AdmissionConfig::default()
            .with_tier(Tier::Master, RateLimitConfig::new(1, Duration::from_secs(60)));
        let (_, admission) = controller(config);

        assert!(admission.check("alice", Tier::Master, None).await.allowed);
        assert!(!admission.check("alice", Tier::Master, None).await.allowed);
        assert!(admission.check("bob", Tier::Master, None).await.allowed);
    }

    #[tokio::test]
    async fn exceeding_window_installs_penalty() {
        let config = AdmissionConfig::default().with_tier(
            Tier::Free,
            RateLimitConfig::new(1, Duration::from_secs(60)).with_penalty(Duration::from_secs(300)),
        );
        let (store, admission) = controller(config);

        assert!(admission.check("alice", Tier::Free, None).await.allowed);

        let denied = admission.check("alice", Tier::Free, None).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(300)));
        assert!(store.get("ratelimit:alice:penalty").await.unwrap().is_some());

        // Penalty holds even once the tier counter is gone.
        store.del("ratelimit:alice:free").await.unwrap();
        let still_denied = admission.check("alice", Tier::Free, None).await;
        assert!(!still_denied.allowed);
    }

    #[tokio::test]
    async fn model_window_checked_before_tier() {
        let config = AdmissionConfig::default()
            .without_model_limits()
            .with_model("openai/o1", RateLimitConfig::new(1, Duration::from_secs(60)));
        let (store, admission) = controller(config);

        assert!(admission.check("alice", Tier::Pro, Some("openai/o1")).await.allowed);
        let denied = admission.check("alice", Tier::Pro, Some("openai/o1")).await;
        assert!(!denied.allowed);

        // The denied request did not consume tier quota.
        let tier_count = store.get("ratelimit:alice:pro").await.unwrap();
        assert_eq!(tier_count.as_deref(), Some("1"));

        // Other models are unaffected.
        assert!(admission.check("alice", Tier::Pro, Some("openai/gpt-4o-mini")).await.allowed);
    }

    #[tokio::test]
    async fn tier_denial_leaves_model_window_untouched() {
        let config = AdmissionConfig::default()
            .without_model_limits()
            .with_tier(Tier::Free, RateLimitConfig::new(1, Duration::from_secs(60)))
            .with_tier(Tier::Pro, RateLimitConfig::new(100, Duration::from_secs(60)))
            .with_model("m", RateLimitConfig::new(5, Duration::from_secs(60)));
        let (store, admission) = controller(config);

        let mut admitted = 0;
        for _ in 0..5 {
            if admission.check("alice", Tier::Free, Some("m")).await.allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);

        let model_count = store.get("ratelimit:alice:model:m").await.unwrap();
        assert_eq!(model_count.as_deref(), Some("1"));

        // Four model slots are still free on a roomier tier.
        let d = admission.check("alice", Tier::Pro, Some("m")).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 3);
    }

    #[tokio::test]
    async fn remaining_reports_the_tighter_window() {
        let config = AdmissionConfig::default()
            .without_model_limits()
            .with_tier(Tier::Pro, RateLimitConfig::new(50, Duration::from_secs(60)))
            .with_model("openai/o1", RateLimitConfig::new(3, Duration::from_secs(60)));
        let (_, admission) = controller(config);

        let d = admission.check("alice", Tier::Pro, Some("openai/o1")).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 2);

        let d = admission.check("alice", Tier::Pro, None).await;
        assert_eq!(d.remaining, 48);
    }

    #[tokio::test]
    async fn admit_maps_denial_to_error() {
        let config = AdmissionConfig::default()
            .with_tier(Tier::Master, RateLimitConfig::new(1, Duration::from_secs(60)));
        let (_, admission) = controller(config);

        admission.admit("alice", Tier::Master, None).await.unwrap();
        let err = admission.admit("alice", Tier::Master, None).await.unwrap_err();
        assert!(matches!(err, HyphaeError::AdmissionDenied { remaining: 0, .. }));
    }

    #[tokio::test]
    async fn reset_clears_counters() {
        let config = AdmissionConfig::default()
            .with_tier(Tier::Master, RateLimitConfig::new(1, Duration::from_secs(60)));
        let (_, admission) = controller(config);

        assert!(admission.check("alice", Tier::Master, None).await.allowed);
        assert!(!admission.check("alice", Tier::Master, None).await.allowed);
        admission.reset("alice").await.unwrap();
        assert!(admission.check("alice", Tier::Master, None).await.allowed);
    }

    #[tokio::test]
    async fn reset_treats_user_id_literally() {
        let config = AdmissionConfig::default()
            .with_tier(Tier::Master, RateLimitConfig::new(1, Duration::from_secs(60)));
        let (_, admission) = controller(config);

        assert!(admission.check("alice", Tier::Master, None).await.allowed);
        assert!(admission.check("*", Tier::Master, None).await.allowed);

        admission.reset("*").await.unwrap();
        assert!(admission.check("*", Tier::Master, None).await.allowed);
        assert!(!admission.check("alice", Tier::Master, None).await.allowed);
    }
}
