//! Key-value caching.
//!
//! [`KeyValueStore`] is the raw string store (Redis in production, an
//! in-memory map in tests). [`CacheRepository`](repository::CacheRepository)
//! layers typed JSON entries on top of it, addressed by
//! [`StorageKey`](courier_core::StorageKey)s.
//!
//! The cache has no transactional coupling with the relational store.
//! Concurrent writers race; the last `set` wins until the entry expires.

use std::time::Duration;

use async_trait::async_trait;
use courier_core::KeyError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod in_memory;
pub mod keys;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod repository;

pub use in_memory::{InMemoryStore, StoreCounters};
pub use keys::{StateKey, StatePart, UserIdKey, UserKey};
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use repository::{CacheRepository, UserAlias};

/// Cache layer error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The stored payload does not decode into the entity.
    #[error("invalid cached {entity}: {reason}")]
    Validation {
        entity: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("cache store error: {0}")]
    Store(String),

    #[error("failed to encode cache entry: {0}")]
    Encode(String),

    #[error("cache store closed")]
    Closed,
}

/// Raw string key-value store with optional per-entry TTL.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value`, replacing any previous entry. `None` means no expiry.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Remove `key`; absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Drop the underlying connection. Later calls fail with [`CacheError::Closed`].
    async fn close(&self);
}

/// A type stored in the cache as a JSON object.
pub trait CachedEntity: Serialize + DeserializeOwned + Send + Sync {
    /// Name used in validation errors.
    const ENTITY: &'static str;

    /// Checks beyond what deserialization enforces.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// What to do when a cached payload fails to decode or validate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// Surface [`CacheError::Validation`] to the caller.
    #[default]
    Fail,
    /// Log, evict the entry and read through to the store.
    TreatAsMiss,
}
