//! Shared key/value state.
//!
//! Every stateful component (admission, cache, dedup, health, accounting,
//! alerts) reads and writes through a [`StateStore`]. Process-local memory
//! is never authoritative: running several orchestrator instances against
//! the same store gives them a single view of rate-limit windows, cache
//! entries and usage aggregates.
//!
//! Values are strings. Structured records are stored as JSON via
//! [`get_json`] / [`set_json`] / [`mget_json`].

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use crate::config::StoreConfig;

/// Errors raised by a state store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("value at '{key}' is not an integer")]
    NotAnInteger { key: String },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key namespaces used by the orchestrator components.
pub mod prefix {
    pub const RATE_LIMIT: &str = "ratelimit";
    pub const CACHE: &str = "cache";
    pub const DEDUP: &str = "dedup";
    pub const HEALTH: &str = "health";
    pub const TOKENS: &str = "tokens";
}

/// Build a `:`-separated key under `prefix`.
pub fn key(prefix: &str, parts: &[&str]) -> String {
    let mut out = String::from(prefix);
    for part in parts {
        out.push(':');
        out.push_str(part);
    }
    out
}

/// Glob matching every key under `prefix:parts..:`.
///
/// `parts` are taken literally: glob metacharacters in them are escaped,
/// so a user id of `*` only matches that user's keys.
pub fn glob(prefix: &str, parts: &[&str]) -> String {
    let mut out = escape_glob(prefix);
    for part in parts {
        out.push(':');
        out.push_str(&escape_glob(part));
    }
    out.push_str(":*");
    out
}

/// Backslash-escape `*`, `?`, `[`, `]` and `\`.
pub fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Current wall-clock time in unix milliseconds.
pub(crate) fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Minimal key/value contract with Redis-compatible semantics.
///
/// `incr` must be atomic. A missing key increments to 1. `keys` takes a
/// glob pattern where `*` matches any run of characters and `\` makes the
/// next character literal.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set `key` to `value`, expiring after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()>;

    /// Atomically increment the integer at `key` and return the new value.
    /// Preserves any existing TTL.
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    async fn del(&self, key: &str) -> StoreResult<()>;

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Fetch several keys at once. The result is positionally aligned with
    /// `keys`.
    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    /// Remaining lifetime of `key`, or `None` if it is absent or has no
    /// expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    async fn del_many(&self, keys: &[String]) -> StoreResult<()> {
        for key in keys {
            self.del(key).await?;
        }
        Ok(())
    }
}

/// Read and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> StoreResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, raw, ttl).await
}

/// Batch-read JSON values. Entries that fail to decode come back as `None`.
pub async fn mget_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    keys: &[String],
) -> StoreResult<Vec<Option<T>>> {
    let raw = store.mget(keys).await?;
    Ok(raw
        .into_iter()
        .zip(keys)
        .map(|(value, key)| {
            value.and_then(|v| match serde_json::from_str(&v) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "skipping undecodable store value");
                    None
                }
            })
        })
        .collect())
}

/// Match `key` against a glob where `*` matches any (possibly empty) run
/// and `\` escapes the next byte.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let p = pattern.as_bytes();
    let k = key.as_bytes();
    let (mut pi, mut ki) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ki < k.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            mark = ki;
            pi += 1;
        } else if pi + 1 < p.len() && p[pi] == b'\\' && p[pi + 1] == k[ki] {
            pi += 2;
            ki += 1;
        } else if pi < p.len() && p[pi] != b'\\' && p[pi] == k[ki] {
            pi += 1;
            ki += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ki = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Open the store described by `config`.
pub async fn connect(config: &StoreConfig) -> crate::Result<Arc<dyn StateStore>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::with_max_entries(config.max_entries))),
        #[cfg(feature = "redis")]
        "redis" => {
            let url = config.url.as_deref().ok_or_else(|| {
                crate::HyphaeError::Configuration("store.url is required for redis".into())
            })?;
            Ok(Arc::new(RedisStore::connect(url).await?))
        }
        other => Err(crate::HyphaeError::Configuration(format!(
            "unsupported store backend '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_joins_parts() {
        assert_eq!(key(prefix::RATE_LIMIT, &["alice", "pro"]), "ratelimit:alice:pro");
        assert_eq!(key(prefix::HEALTH, &[]), "health");
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("cache:*", "cache:default:abc"));
        assert!(glob_match("tokens:*:totals", "tokens:alice:totals"));
        assert!(!glob_match("tokens:*:totals", "tokens:alice:events:1"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[test]
    fn escaped_parts_match_literally() {
        let pattern = glob(prefix::RATE_LIMIT, &["*"]);
        assert_eq!(pattern, "ratelimit:\\*:*");
        assert!(glob_match(&pattern, "ratelimit:*:pro"));
        assert!(!glob_match(&pattern, "ratelimit:alice:pro"));

        let pattern = glob(prefix::TOKENS, &["a[1]?", "events"]);
        assert!(glob_match(&pattern, "tokens:a[1]?:events:42"));
        assert!(!glob_match(&pattern, "tokens:a1x:events:42"));
        assert_eq!(glob(prefix::DEDUP, &[]), "dedup:*");
    }
}
