//! In-memory key-value store for tests/dev.
//!
//! Expiry is measured with [`tokio::time::Instant`], so tests running on a
//! paused runtime can step past a TTL with `tokio::time::advance`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{CacheError, KeyValueStore};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Operation counters.
#[derive(Debug, Default)]
pub struct StoreCounters {
    gets: AtomicUsize,
    sets: AtomicUsize,
    deletes: AtomicUsize,
}

impl StoreCounters {
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: RwLock<HashMap<String, Entry>>,
    counters: StoreCounters,
    closed: AtomicBool,
}

/// Shared in-memory store; clones see the same entries.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> &StoreCounters {
        &self.inner.counters
    }

    /// Raw stored value, ignoring expiry. Does not count as a `get`.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.inner
            .entries
            .read()
            .ok()
            .and_then(|entries| entries.get(key).map(|e| e.value.clone()))
    }

    /// Remaining time to live of a live entry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.inner.entries.read().ok()?;
        let expires_at = entries.get(key)?.expires_at?;
        expires_at.checked_duration_since(Instant::now())
    }

    fn check_open(&self) -> Result<(), CacheError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    fn poisoned() -> CacheError {
        CacheError::Store("lock poisoned".to_string())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check_open()?;
        self.inner.counters.gets.fetch_add(1, Ordering::SeqCst);

        let now = Instant::now();
        let mut entries = self.inner.entries.write().map_err(|_| Self::poisoned())?;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.check_open()?;
        self.inner.counters.sets.fetch_add(1, Ordering::SeqCst);

        let entry = Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.inner
            .entries
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check_open()?;
        self.inner.counters.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner
            .entries
            .write()
            .map_err(|_| Self::poisoned())?
            .remove(key);
        Ok(())
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}
