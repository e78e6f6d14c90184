//! Shared response cache.
//!
//! Entries live in the [`StateStore`] so every orchestrator instance sees the
//! same cache. Keys:
//!
//! - `cache:{namespace}:{sha256(prompt:model)}`: the cached response
//! - `cache:{namespace}:semantic:{cluster}`: JSON list of exact keys whose
//!   prompts normalize to the same cluster
//!
//! The cluster key is the first 16 hex chars of SHA-256 over the first ten
//! case-folded, whitespace-collapsed words of the prompt. Near-duplicate
//! prompts ("What is Trichoderma?" vs "what  is trichoderma?") therefore
//! share a cached answer without any embedding model.
//!
//! Cache operations never fail the caller. Store errors are logged and
//! treated as misses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::content_hash;
use crate::store::{self, StateStore, StoreResult, prefix};
use crate::telemetry;

/// Default namespace when a request does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Words considered when computing the semantic cluster key.
const SEMANTIC_WORDS: usize = 10;

/// Configuration for the response cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maintain semantic clusters on write and consult them on miss.
    pub semantic_match: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            semantic_match: true,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn semantic_match(mut self, enabled: bool) -> Self {
        self.semantic_match = enabled;
        self
    }
}

/// Token usage recorded with a cached response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedTokenUsage {
    pub input: u32,
    pub output: u32,
    pub cost: f64,
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub content: String,
    /// The model the entry is cached under (the requested model).
    pub model_id: String,
    /// The model that actually produced `content`, when it differs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    /// Unix milliseconds at write time.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<CachedTokenUsage>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CachedResponse {
    pub fn new(content: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model_id: model_id.into(),
            model_used: None,
            timestamp: store::unix_millis(),
            token_usage: None,
            metadata: HashMap::new(),
        }
    }

    /// Model that served the content: `model_used` if set, else `model_id`.
    pub fn served_by(&self) -> &str {
        self.model_used.as_deref().unwrap_or(&self.model_id)
    }
}

/// Key counts for a namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_keys: usize,
    pub semantic_keys: usize,
    /// Keys holding responses (total minus semantic clusters).
    pub estimated_size: usize,
}

/// Exact-key cache entry key.
pub fn cache_key(prompt: &str, model: &str, namespace: &str) -> String {
    let hash = content_hash(&format!("{prompt}:{model}"));
    store::key(prefix::CACHE, &[namespace, &hash])
}

/// Cluster id shared by prompts that agree on their first ten normalized words.
pub fn semantic_key(prompt: &str) -> String {
    let lower = prompt.to_lowercase();
    let leading: Vec<&str> = lower.split_whitespace().take(SEMANTIC_WORDS).collect();
    let mut hash = content_hash(&leading.join(" "));
    hash.truncate(16);
    hash
}

fn cluster_key(prompt: &str, namespace: &str) -> String {
    store::key(prefix::CACHE, &[namespace, "semantic", &semantic_key(prompt)])
}

/// Namespaced response cache over the shared store.
pub struct ResponseCache {
    store: Arc<dyn StateStore>,
    config: CacheConfig,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn StateStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    /// Exact lookup.
    pub async fn get(&self, prompt: &str, model: &str, namespace: &str) -> Option<CachedResponse> {
        let key = cache_key(prompt, model, namespace);
        match store::get_json::<CachedResponse>(self.store.as_ref(), &key).await {
            Ok(Some(hit)) => {
                debug!(model, namespace, "cache hit");
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "kind" => "exact").increment(1);
                Some(hit)
            }
            Ok(None) => {
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
                None
            }
            Err(e) => {
                self.swallow("get", &e);
                None
            }
        }
    }

    /// Near-duplicate lookup: the first cluster member cached for `model`.
    pub async fn get_semantic(
        &self,
        prompt: &str,
        model: &str,
        namespace: &str,
    ) -> Option<CachedResponse> {
        match self.lookup_cluster(prompt, model, namespace).await {
            Ok(Some(hit)) => {
                debug!(model, namespace, "semantic cache hit");
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "kind" => "semantic").increment(1);
                Some(hit)
            }
            Ok(None) => None,
            Err(e) => {
                self.swallow("get_semantic", &e);
                None
            }
        }
    }

    /// Exact lookup, then semantic lookup if enabled.
    pub async fn lookup(&self, prompt: &str, model: &str, namespace: &str) -> Option<CachedResponse> {
        if let Some(hit) = self.get(prompt, model, namespace).await {
            return Some(hit);
        }
        if self.config.semantic_match {
            return self.get_semantic(prompt, model, namespace).await;
        }
        None
    }

    /// Store `response` under `(prompt, model, namespace)` for `ttl`.
    pub async fn put(
        &self,
        prompt: &str,
        model: &str,
        namespace: &str,
        response: &CachedResponse,
        ttl: Duration,
    ) {
        if let Err(e) = self.write(prompt, model, namespace, response, ttl).await {
            self.swallow("put", &e);
        }
    }

    pub async fn invalidate(&self, prompt: &str, model: &str, namespace: &str) {
        let key = cache_key(prompt, model, namespace);
        if let Err(e) = self.store.del(&key).await {
            self.swallow("invalidate", &e);
        }
    }

    /// Drop every entry and cluster in `namespace`.
    pub async fn invalidate_namespace(&self, namespace: &str) {
        let pattern = store::glob(prefix::CACHE, &[namespace]);
        let result = match self.store.keys(&pattern).await {
            Ok(keys) => self.store.del_many(&keys).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.swallow("invalidate_namespace", &e);
        }
    }

    pub async fn stats(&self, namespace: &str) -> CacheStats {
        let all = store::glob(prefix::CACHE, &[namespace]);
        let semantic = store::glob(prefix::CACHE, &[namespace, "semantic"]);
        let counts = async {
            let total = self.store.keys(&all).await?.len();
            let semantic = self.store.keys(&semantic).await?.len();
            StoreResult::Ok((total, semantic))
        };
        match counts.await {
            Ok((total_keys, semantic_keys)) => CacheStats {
                total_keys,
                semantic_keys,
                estimated_size: total_keys.saturating_sub(semantic_keys),
            },
            Err(e) => {
                self.swallow("stats", &e);
                CacheStats::default()
            }
        }
    }

    /// Pre-populate the cache. Entries are `(prompt, model, response)`.
    pub async fn warmup(&self, namespace: &str, entries: &[(String, String, CachedResponse)], ttl: Duration) {
        for (prompt, model, response) in entries {
            self.put(prompt, model, namespace, response, ttl).await;
        }
    }

    async fn write(
        &self,
        prompt: &str,
        model: &str,
        namespace: &str,
        response: &CachedResponse,
        ttl: Duration,
    ) -> StoreResult<()> {
        let key = cache_key(prompt, model, namespace);
        store::set_json(self.store.as_ref(), &key, response, ttl).await?;

        if self.config.semantic_match {
            let cluster = cluster_key(prompt, namespace);
            let mut members: Vec<String> = store::get_json(self.store.as_ref(), &cluster)
                .await?
                .unwrap_or_default();
            if !members.contains(&key) {
                members.push(key);
                store::set_json(self.store.as_ref(), &cluster, &members, ttl).await?;
            }
        }
        Ok(())
    }

    async fn lookup_cluster(
        &self,
        prompt: &str,
        model: &str,
        namespace: &str,
    ) -> StoreResult<Option<CachedResponse>> {
        let cluster = cluster_key(prompt, namespace);
        let members: Vec<String> = match store::get_json(self.store.as_ref(), &cluster).await? {
            Some(members) => members,
            None => return Ok(None),
        };
        if members.is_empty() {
            return Ok(None);
        }
        let responses: Vec<Option<CachedResponse>> =
            store::mget_json(self.store.as_ref(), &members).await?;
        Ok(responses.into_iter().flatten().find(|r| r.model_id == model))
    }

    fn swallow(&self, operation: &str, error: &store::StoreError) {
        warn!(operation, error = %error, "response cache store error");
        metrics::counter!(telemetry::STORE_ERRORS_TOTAL, "component" => "cache").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn cache() -> ResponseCache {
        ResponseCache::new(Arc::new(MemoryStore::new()), CacheConfig::default())
    }

    #[test]
    fn cache_key_depends_on_all_inputs() {
        let base = cache_key("hello", "openai/gpt-4o", "default");
        assert!(base.starts_with("cache:default:"));
        assert_ne!(base, cache_key("hello", "openai/gpt-4o-mini", "default"));
        assert_ne!(base, cache_key("hello", "openai/gpt-4o", "lab"));
        assert_ne!(base, cache_key("hello!", "openai/gpt-4o", "default"));
        assert_eq!(base, cache_key("hello", "openai/gpt-4o", "default"));
    }

    #[test]
    fn semantic_key_normalizes() {
        let a = semantic_key("What is Trichoderma?");
        assert_eq!(a.len(), 16);
        assert_eq!(a, semantic_key("  what   IS\ttrichoderma?  "));
        assert_ne!(a, semantic_key("What is Penicillium?"));
    }

    #[test]
    fn semantic_key_ignores_words_past_ten() {
        let base = "one two three four five six seven eight nine ten";
        assert_eq!(
            semantic_key(&format!("{base} eleven")),
            semantic_key(&format!("{base} twelve thirteen"))
        );
    }

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let cache = cache();
        let response = CachedResponse::new("A genus of fungi.", "openai/gpt-4o");
        cache
            .put("What is Trichoderma?", "openai/gpt-4o", "default", &response, Duration::from_secs(60))
            .await;

        let hit = cache.get("What is Trichoderma?", "openai/gpt-4o", "default").await;
        assert_eq!(hit, Some(response));
        assert!(cache.get("What is Trichoderma?", "openai/gpt-4o", "other").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = cache();
        let response = CachedResponse::new("answer", "m");
        cache.put("q", "m", "default", &response, Duration::from_secs(30)).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get("q", "m", "default").await.is_none());
        assert!(cache.get_semantic("q", "m", "default").await.is_none());
    }

    #[tokio::test]
    async fn semantic_lookup_matches_model() {
        let cache = cache();
        let response = CachedResponse::new("A genus of fungi.", "openai/gpt-4o");
        cache
            .put("What is Trichoderma?", "openai/gpt-4o", "default", &response, Duration::from_secs(60))
            .await;

        let near = "what is  trichoderma?";
        assert!(cache.get(near, "openai/gpt-4o", "default").await.is_none());
        assert_eq!(
            cache.get_semantic(near, "openai/gpt-4o", "default").await,
            Some(response.clone())
        );
        assert!(cache.get_semantic(near, "anthropic/claude-3-5-haiku-20241022", "default").await.is_none());
        assert_eq!(cache.lookup(near, "openai/gpt-4o", "default").await, Some(response));
    }

    #[tokio::test]
    async fn semantic_disabled_skips_clusters() {
        let cache = ResponseCache::new(
            Arc::new(MemoryStore::new()),
            CacheConfig::new().semantic_match(false),
        );
        let response = CachedResponse::new("x", "m");
        cache.put("Hello there", "m", "default", &response, Duration::from_secs(60)).await;

        assert_eq!(cache.stats("default").await.semantic_keys, 0);
        assert!(cache.lookup("hello  there", "m", "default").await.is_none());
    }

    #[tokio::test]
    async fn stats_and_namespace_invalidation() {
        let cache = cache();
        let ttl = Duration::from_secs(60);
        cache.put("a", "m", "lab", &CachedResponse::new("1", "m"), ttl).await;
        cache.put("b", "m", "lab", &CachedResponse::new("2", "m"), ttl).await;
        cache.put("c", "m", "default", &CachedResponse::new("3", "m"), ttl).await;

        let stats = cache.stats("lab").await;
        assert_eq!(stats.total_keys, 4);
        assert_eq!(stats.semantic_keys, 2);
        assert_eq!(stats.estimated_size, 2);

        cache.invalidate_namespace("lab").await;
        assert_eq!(cache.stats("lab").await.total_keys, 0);
        assert!(cache.get("c", "m", "default").await.is_some());
    }

    #[tokio::test]
    async fn invalidate_single_entry() {
        let cache = cache();
        cache
            .put("q", "m", "default", &CachedResponse::new("1", "m"), Duration::from_secs(60))
            .await;
        cache.invalidate("q", "m", "default").await;
        assert!(cache.get("q", "m", "default").await.is_none());
    }

    #[tokio::test]
    async fn warmup_populates_entries() {
        let cache = cache();
        let entries = vec![
            ("q1".to_owned(), "m".to_owned(), CachedResponse::new("a1", "m")),
            ("q2".to_owned(), "m".to_owned(), CachedResponse::new("a2", "m")),
        ];
        cache.warmup("default", &entries, Duration::from_secs(60)).await;
        assert_eq!(cache.get("q2", "m", "default").await.unwrap().content, "a2");
    }
}
