//! Redis-backed [`StateStore`] for multi-instance deployments.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{StateStore, StoreError, StoreResult};

/// State store over a shared Redis instance.
///
/// Wraps a [`ConnectionManager`], which reconnects transparently; clones
/// share the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1/` or `rediss://...`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Backend(format!("failed to open Redis client: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect to Redis: {e}")))?;
        tracing::info!("connected to Redis state store");
        Ok(Self { conn })
    }
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl StateStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(backend)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let _: () = conn.pset_ex(key, value, millis).await.map_err(backend)?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1_i64).await.map_err(backend)?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.map_err(backend)?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(pattern).await.map_err(backend)?;
        Ok(keys)
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(values)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        // -2: missing, -1: no expiry
        let millis: i64 = conn.pttl(key).await.map_err(backend)?;
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    async fn del_many(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys).await.map_err(backend)?;
        Ok(())
    }
}
