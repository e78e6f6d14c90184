//! Cross-instance request deduplication.
//!
//! Identical requests (same user, prompt and model) arriving within the
//! dedup window run the wrapped operation once. The first caller (the
//! leader) writes a `pending` marker to `dedup:{fingerprint}`; later callers
//! (followers) poll the marker until the leader writes `completed` with its
//! result, and return that result with `from_cache = true`.
//!
//! A follower whose wait times out, or whose marker disappears because the
//! leader failed, runs the operation itself. A pending marker older than the
//! window is treated as absent, so a crashed leader cannot block a
//! fingerprint past one window.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;
use crate::cache::content_hash;
use crate::store::{self, StateStore, StoreError, StoreResult, prefix, unix_millis};
use crate::telemetry;

/// Dedup window and follower polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long an identical request is considered a duplicate.
    pub window_ms: u64,
    /// Follower poll interval.
    pub poll_interval_ms: u64,
    /// Maximum time a follower waits for the leader.
    pub wait_timeout_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_ms: 5_000,
            poll_interval_ms: 500,
            wait_timeout_ms: 30_000,
        }
    }
}

impl DedupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// Identity of a request for dedup purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFingerprint {
    pub user_id: String,
    pub prompt: String,
    pub model_id: String,
    /// Unix milliseconds when the request arrived.
    pub timestamp: i64,
}

impl RequestFingerprint {
    pub fn new(
        user_id: impl Into<String>,
        prompt: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            prompt: prompt.into(),
            model_id: model_id.into(),
            timestamp: unix_millis(),
        }
    }

    /// SHA-256 hex of `user:prompt:model`. The timestamp is not part of it.
    pub fn id(&self) -> String {
        content_hash(&format!("{}:{}:{}", self.user_id, self.prompt, self.model_id))
    }
}

/// Result of [`Deduplicator::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct DedupOutcome<T> {
    pub result: T,
    /// True if the result came from another caller's execution.
    pub from_cache: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum DedupEntry<T> {
    Pending { timestamp: i64 },
    Completed { result: T, timestamp: i64 },
}

/// Status-only view for stats.
#[derive(Deserialize)]
struct EntryStatus {
    status: String,
}

/// Counts of live dedup markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub pending: usize,
    pub completed: usize,
    pub total: usize,
}

enum Registration<T> {
    Leader,
    Follower,
    Completed(T),
    /// Store unavailable; run without dedup.
    Bypass,
}

/// Store-backed request deduplicator.
pub struct Deduplicator {
    store: Arc<dyn StateStore>,
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn StateStore>, config: DedupConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Run `operation` once per fingerprint within the configured window.
    pub async fn execute<T, F, Fut>(
        &self,
        fingerprint: &RequestFingerprint,
        operation: F,
    ) -> Result<DedupOutcome<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let window = Duration::from_millis(self.config.window_ms);
        self.execute_within(fingerprint, window, operation).await
    }

    /// Like [`execute`](Self::execute) with an explicit window.
    pub async fn execute_within<T, F, Fut>(
        &self,
        fingerprint: &RequestFingerprint,
        window: Duration,
        operation: F,
    ) -> Result<DedupOutcome<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = store::key(prefix::DEDUP, &[&fingerprint.id()]);

        match self.register::<T>(&key, window).await {
            Registration::Completed(result) => {
                debug!(model = %fingerprint.model_id, "dedup returned completed result");
                metrics::counter!(telemetry::DEDUP_JOINS_TOTAL).increment(1);
                return Ok(DedupOutcome {
                    result,
                    from_cache: true,
                });
            }
            Registration::Follower => {
                debug!(model = %fingerprint.model_id, "waiting for in-flight request");
                metrics::counter!(telemetry::DEDUP_JOINS_TOTAL).increment(1);
                if let Some(result) = self.wait_for::<T>(&key).await {
                    return Ok(DedupOutcome {
                        result,
                        from_cache: true,
                    });
                }
                debug!(model = %fingerprint.model_id, "leader result unavailable, executing independently");
            }
            Registration::Leader | Registration::Bypass => {}
        }

        match operation().await {
            Ok(result) => {
                self.complete(&key, &result, window).await;
                Ok(DedupOutcome {
                    result,
                    from_cache: false,
                })
            }
            Err(e) => {
                self.cancel(&key).await;
                Err(e)
            }
        }
    }

    /// Count live markers by status.
    pub async fn stats(&self) -> Result<DedupStats> {
        let keys = self.store.keys(&store::glob(prefix::DEDUP, &[])).await?;
        let entries: Vec<Option<EntryStatus>> = store::mget_json(self.store.as_ref(), &keys).await?;
        let mut stats = DedupStats::default();
        for entry in entries.into_iter().flatten() {
            match entry.status.as_str() {
                "pending" => stats.pending += 1,
                "completed" => stats.completed += 1,
                _ => {}
            }
            stats.total += 1;
        }
        Ok(stats)
    }

    /// Remove every dedup marker.
    pub async fn clear(&self) -> Result<()> {
        let keys = self.store.keys(&store::glob(prefix::DEDUP, &[])).await?;
        self.store.del_many(&keys).await?;
        Ok(())
    }

    async fn register<T: DeserializeOwned>(&self, key: &str, window: Duration) -> Registration<T> {
        match self.try_register(key, window).await {
            Ok(registration) => registration,
            Err(e) => {
                warn!(error = %e, "dedup store unavailable, executing without dedup");
                metrics::counter!(telemetry::STORE_ERRORS_TOTAL, "component" => "dedup")
                    .increment(1);
                Registration::Bypass
            }
        }
    }

    async fn try_register<T: DeserializeOwned>(
        &self,
        key: &str,
        window: Duration,
    ) -> StoreResult<Registration<T>> {
        let now = unix_millis();
        let existing: Option<DedupEntry<T>> = store::get_json(self.store.as_ref(), key).await?;
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);

        let stale = |timestamp: i64| now - timestamp > window_ms;
        match existing {
            Some(DedupEntry::Completed { result, timestamp }) if !stale(timestamp) => {
                Ok(Registration::Completed(result))
            }
            Some(DedupEntry::Pending { timestamp }) if !stale(timestamp) => {
                Ok(Registration::Follower)
            }
            _ => {
                let pending = DedupEntry::<()>::Pending { timestamp: now };
                write_entry(self.store.as_ref(), key, &pending, window).await?;
                Ok(Registration::Leader)
            }
        }
    }

    /// Poll until the leader completes, the marker vanishes, or the wait
    /// times out.
    async fn wait_for<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let timeout = Duration::from_millis(self.config.wait_timeout_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let started = tokio::time::Instant::now();

        while started.elapsed() < timeout {
            match store::get_json::<DedupEntry<T>>(self.store.as_ref(), key).await {
                Ok(None) => return None,
                Ok(Some(DedupEntry::Completed { result, .. })) => return Some(result),
                Ok(Some(DedupEntry::Pending { .. })) => tokio::time::sleep(poll).await,
                Err(e) => {
                    warn!(error = %e, "dedup poll failed");
                    return None;
                }
            }
        }
        None
    }

    async fn complete<T: Serialize>(&self, key: &str, result: &T, window: Duration) {
        let entry = DedupEntry::Completed {
            result,
            timestamp: unix_millis(),
        };
        if let Err(e) = write_entry(self.store.as_ref(), key, &entry, window).await {
            warn!(error = %e, "failed to publish dedup result");
        }
    }

    async fn cancel(&self, key: &str) {
        if let Err(e) = self.store.del(key).await {
            warn!(error = %e, "failed to cancel dedup marker");
        }
    }
}

async fn write_entry<T: Serialize>(
    store: &dyn StateStore,
    key: &str,
    entry: &DedupEntry<T>,
    ttl: Duration,
) -> std::result::Result<(), StoreError> {
    store::set_json(store, key, entry, ttl).await
}
