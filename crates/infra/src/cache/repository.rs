//! Typed cache entries on top of a [`KeyValueStore`].
//!
//! Every entry is a JSON object. Decoding is strict: a payload that is not
//! valid JSON, is not an object, does not fit the entity, or fails the
//! entity's own validation is reported as [`CacheError::Validation`] naming
//! the entity.

use std::time::Duration;

use courier_core::{ExternalId, StorageKey, UserDto, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::keys::{UserIdKey, UserKey};
use super::{CacheError, CachedEntity, KeyValueStore};

impl CachedEntity for UserDto {
    const ENTITY: &'static str = "user";

    fn validate(&self) -> Result<(), String> {
        UserDto::validate(self).map_err(|e| e.to_string())
    }
}

/// Value stored under a [`UserIdKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAlias {
    pub external_id: ExternalId,
}

impl CachedEntity for UserAlias {
    const ENTITY: &'static str = "user alias";

    fn validate(&self) -> Result<(), String> {
        if self.external_id.get() <= 0 {
            return Err(format!("external id must be positive, got {}", self.external_id));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CacheRepository<S> {
    store: S,
}

impl<S: KeyValueStore> CacheRepository<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Decoded entry under `key`, or `None` when absent or expired.
    #[instrument(skip_all, fields(entity = E::ENTITY), err)]
    pub async fn get<K, E>(&self, key: &K) -> Result<Option<E>, CacheError>
    where
        K: StorageKey,
        E: CachedEntity,
    {
        let key = key.pack()?;
        match self.store.get(&key).await? {
            Some(raw) => decode::<E>(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub async fn set<K, V>(&self, key: &K, value: &V, ttl: Option<Duration>) -> Result<(), CacheError>
    where
        K: StorageKey,
        V: Serialize,
    {
        let key = key.pack()?;
        let payload = encode(value)?;
        self.store.set(&key, payload, ttl).await
    }

    pub async fn delete<K: StorageKey>(&self, key: &K) -> Result<(), CacheError> {
        self.store.delete(&key.pack()?).await
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    /// Cache `user` under its external id, along with the id alias.
    #[instrument(skip_all, fields(user_id = %user.id(), external_id = %user.external_id()), err)]
    pub async fn save_user(&self, user: &UserDto, ttl: Option<Duration>) -> Result<(), CacheError> {
        let external_id = user.external_id();
        self.set(&UserKey { external_id }, user, ttl).await?;
        self.set(&UserIdKey { id: user.id() }, &UserAlias { external_id }, ttl)
            .await?;
        debug!("user cached");
        Ok(())
    }

    pub async fn get_user(&self, external_id: ExternalId) -> Result<Option<UserDto>, CacheError> {
        self.get(&UserKey { external_id }).await
    }

    /// External id of a cached user, looked up by store id.
    pub async fn resolve_user_id(&self, id: UserId) -> Result<Option<ExternalId>, CacheError> {
        let alias: Option<UserAlias> = self.get(&UserIdKey { id }).await?;
        Ok(alias.map(|a| a.external_id))
    }

    pub async fn delete_user(&self, external_id: ExternalId) -> Result<(), CacheError> {
        self.delete(&UserKey { external_id }).await
    }
}

fn decode<E: CachedEntity>(raw: &str) -> Result<E, CacheError> {
    let invalid = |reason: String| CacheError::Validation {
        entity: E::ENTITY,
        reason,
    };
    let json: serde_json::Value = serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;
    if !json.is_object() {
        return Err(invalid("payload is not a JSON object".to_string()));
    }
    let entity: E = serde_json::from_value(json).map_err(|e| invalid(e.to_string()))?;
    entity.validate().map_err(invalid)?;
    Ok(entity)
}

fn encode<V: Serialize>(value: &V) -> Result<String, CacheError> {
    let json = serde_json::to_value(value).map_err(|e| CacheError::Encode(e.to_string()))?;
    if !json.is_object() {
        return Err(CacheError::Encode(
            "cache values must serialize to a JSON object".to_string(),
        ));
    }
    Ok(json.to_string())
}
