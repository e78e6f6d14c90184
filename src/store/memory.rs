//! In-process [`StateStore`] backed by moka.
//!
//! Suitable for a single instance and for tests. Expiry uses the tokio
//! clock, so `tokio::time::pause` / `advance` drive TTLs deterministically.

use std::time::Duration;

use async_trait::async_trait;
use moka::Expiry;
use moka::sync::Cache;
use tokio::time::Instant;

use super::{StateStore, StoreError, StoreResult, glob_match};

/// Default capacity before least-recently-used eviction kicks in.
pub const DEFAULT_MAX_ENTRIES: u64 = 100_000;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

/// Hands each entry's own deadline to moka so expired values are reclaimed.
struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        value.remaining(Instant::now())
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.remaining(Instant::now())
    }
}

/// Process-local state store.
pub struct MemoryStore {
    entries: Cache<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_max_entries(max_entries: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(EntryExpiry)
            .build();
        Self { entries }
    }

    /// Fetch an entry, dropping it if its deadline has passed.
    fn live(&self, key: &str) -> Option<Entry> {
        let entry = self.entries.get(key)?;
        if entry.is_live(Instant::now()) {
            Some(entry)
        } else {
            self.entries.invalidate(key);
            None
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.live(key).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
        let entry = Entry {
            value,
            expires_at: Some(Instant::now() + ttl),
        };
        self.entries.insert(key.to_owned(), entry);
        Ok(())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let now = Instant::now();
        let mut not_integer = false;

        let updated = self.entries.entry_by_ref(key).and_upsert_with(|existing| {
            let current = existing
                .map(|e| e.into_value())
                .filter(|e| e.is_live(now));
            match current {
                Some(current) => match current.value.parse::<i64>() {
                    Ok(n) => Entry {
                        value: (n + 1).to_string(),
                        expires_at: current.expires_at,
                    },
                    Err(_) => {
                        not_integer = true;
                        current
                    }
                },
                None => Entry {
                    value: "1".to_owned(),
                    expires_at: None,
                },
            }
        });

        if not_integer {
            return Err(StoreError::NotAnInteger { key: key.to_owned() });
        }
        updated
            .into_value()
            .value
            .parse()
            .map_err(|_| StoreError::NotAnInteger { key: key.to_owned() })
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.entries.invalidate(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && glob_match(pattern, key))
            .map(|(key, _)| key.as_ref().clone())
            .collect())
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        Ok(keys.iter().map(|k| self.live(k).map(|e| e.value)).collect())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        Ok(self.live(key).and_then(|e| e.remaining(Instant::now())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_on_tokio_clock() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), Duration::from_secs(5)).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.get("k").await.unwrap().is_some());
        let ttl = store.ttl("k").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.keys("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn incr_creates_and_increments() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("n").await.unwrap(), 1);
        assert_eq!(store.incr("n").await.unwrap(), 2);
        assert_eq!(store.ttl("n").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_preserves_ttl() {
        let store = MemoryStore::new();
        store.set("n", "4".into(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.incr("n").await.unwrap(), 5);
        assert!(store.ttl("n").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn incr_rejects_non_integer() {
        let store = MemoryStore::new();
        store.set("n", "abc".into(), Duration::from_secs(60)).await.unwrap();
        assert!(matches!(
            store.incr("n").await,
            Err(StoreError::NotAnInteger { .. })
        ));
        assert_eq!(store.get("n").await.unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn keys_and_mget() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.set("cache:a:1", "x".into(), ttl).await.unwrap();
        store.set("cache:a:2", "y".into(), ttl).await.unwrap();
        store.set("cache:b:1", "z".into(), ttl).await.unwrap();

        let mut keys = store.keys("cache:a:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["cache:a:1", "cache:a:2"]);

        let values = store
            .mget(&["cache:a:1".into(), "nope".into(), "cache:b:1".into()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some("x".into()), None, Some("z".into())]);
    }

    #[tokio::test]
    async fn del_removes_key() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), Duration::from_secs(60)).await.unwrap();
        store.del("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
