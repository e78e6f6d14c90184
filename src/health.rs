//! Per-model health, shared across instances.
//!
//! Each failure bumps `health:{model}`'s error count and a success resets
//! it. The record expires after the health TTL, so a model with no recent
//! traffic reads as `healthy` again. Tracking never fails the caller.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::{self, StateStore, StoreResult, prefix, unix_millis};
use crate::telemetry;

/// Health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        })
    }
}

/// Stored health record for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelHealth {
    pub model_id: String,
    pub status: HealthStatus,
    /// Unix milliseconds of the last update.
    pub last_checked: i64,
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ModelHealth {
    /// Record for a model with no recent failures.
    pub fn healthy(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            status: HealthStatus::Healthy,
            last_checked: unix_millis(),
            error_count: 0,
            last_error: None,
        }
    }
}

/// Classification thresholds and record lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub ttl_secs: u64,
    /// Error count at which a model is `degraded`.
    pub degraded_threshold: u32,
    /// Error count at which a model is `down`.
    pub down_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            degraded_threshold: 3,
            down_threshold: 5,
        }
    }
}

impl HealthConfig {
    pub fn classify(&self, error_count: u32) -> HealthStatus {
        if error_count >= self.down_threshold {
            HealthStatus::Down
        } else if error_count >= self.degraded_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Records and reports model health.
pub struct HealthTracker {
    store: Arc<dyn StateStore>,
    config: HealthConfig,
}

impl HealthTracker {
    pub fn new(store: Arc<dyn StateStore>, config: HealthConfig) -> Self {
        Self { store, config }
    }

    pub async fn record_success(&self, model: &str) {
        let health = ModelHealth::healthy(model);
        if let Err(e) = self.write(&health).await {
            self.swallow("record_success", &e);
        }
    }

    pub async fn record_error(&self, model: &str, error: &(impl fmt::Display + ?Sized)) {
        let previous = self.get_health(model).await;
        let error_count = previous.error_count.saturating_add(1);
        let status = self.config.classify(error_count);
        if status != previous.status {
            info!(model, from = %previous.status, to = %status, "model health changed");
        }
        let health = ModelHealth {
            model_id: model.to_owned(),
            status,
            last_checked: unix_millis(),
            error_count,
            last_error: Some(error.to_string()),
        };
        if let Err(e) = self.write(&health).await {
            self.swallow("record_error", &e);
        }
    }

    /// Current record, or `healthy` if none exists or the store fails.
    pub async fn get_health(&self, model: &str) -> ModelHealth {
        let key = store::key(prefix::HEALTH, &[model]);
        match store::get_json::<ModelHealth>(self.store.as_ref(), &key).await {
            Ok(Some(health)) => health,
            Ok(None) => ModelHealth::healthy(model),
            Err(e) => {
                self.swallow("get_health", &e);
                ModelHealth::healthy(model)
            }
        }
    }

    pub async fn status(&self, model: &str) -> HealthStatus {
        self.get_health(model).await.status
    }

    /// Forget a model's record.
    pub async fn reset(&self, model: &str) -> crate::Result<()> {
        self.store.del(&store::key(prefix::HEALTH, &[model])).await?;
        Ok(())
    }

    /// Every live record.
    pub async fn all(&self) -> crate::Result<Vec<ModelHealth>> {
        let keys = self.store.keys(&store::glob(prefix::HEALTH, &[])).await?;
        let records: Vec<Option<ModelHealth>> = store::mget_json(self.store.as_ref(), &keys).await?;
        let mut records: Vec<ModelHealth> = records.into_iter().flatten().collect();
        records.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(records)
    }

    async fn write(&self, health: &ModelHealth) -> StoreResult<()> {
        let key = store::key(prefix::HEALTH, &[&health.model_id]);
        store::set_json(self.store.as_ref(), &key, health, self.config.ttl()).await
    }

    fn swallow(&self, operation: &str, error: &store::StoreError) {
        warn!(operation, error = %error, "health store error");
        metrics::counter!(telemetry::STORE_ERRORS_TOTAL, "component" => "health").increment(1);
    }
}
