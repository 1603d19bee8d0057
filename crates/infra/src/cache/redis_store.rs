//! Redis-backed key-value store (`GET` / `SET .. EX` / `DEL`).
//!
//! Uses a multiplexed [`ConnectionManager`], which reconnects on its own after
//! connection loss. `close` drops the manager; the store is unusable afterwards.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use super::{CacheError, KeyValueStore};

pub struct RedisStore {
    manager: RwLock<Option<ConnectionManager>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379/0`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Store(format!("invalid redis url: {}", e)))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Store(format!("redis connection failed: {}", e)))?;
        Ok(Self {
            manager: RwLock::new(Some(manager)),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        self.manager.read().await.clone().ok_or(CacheError::Closed)
    }
}

/// `EX` takes whole seconds; round up so an entry never expires early.
fn expiry_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    #[instrument(skip(self), err)]
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Store(format!("GET failed: {}", e)))?;
        Ok(value)
    }

    #[instrument(skip(self, value), fields(bytes = value.len()), err)]
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(expiry_seconds(ttl));
        }
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Store(format!("SET failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let _: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Store(format!("DEL failed: {}", e)))?;
        Ok(())
    }

    async fn close(&self) {
        if self.manager.write().await.take().is_some() {
            debug!("redis connection manager dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_rounds_up_to_whole_seconds() {
        assert_eq!(expiry_seconds(Duration::from_secs(86_400)), 86_400);
        assert_eq!(expiry_seconds(Duration::from_millis(1_500)), 2);
        assert_eq!(expiry_seconds(Duration::from_millis(10)), 1);
        assert_eq!(expiry_seconds(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn malformed_url_is_rejected() {
        let err = RedisStore::connect("not a url").await.unwrap_err();
        assert!(matches!(err, CacheError::Store(_)));
    }
}
