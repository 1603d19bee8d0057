//! User access with cache-aside reads.
//!
//! ## Reads
//!
//! `get` and `by_external_id` consult the cache first. A hit never touches the
//! relational store. A miss reads the store through a fresh session scope and,
//! when a row exists, caches it with the configured TTL. Absent users are not
//! cached.
//!
//! The cache is keyed by external id. `get(id)` reaches the entry through the
//! `user_ids:<id>` alias written alongside every cached user.
//!
//! ## Writes
//!
//! `update` persists exactly the fields assigned since the DTO was loaded and
//! then overwrites the cache entry. The two writes are independent: if the
//! cache write fails the row is already committed, and the stale entry lives
//! until its TTL runs out.

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::{
    DomainError, ExternalId, LocaleResolver, PlatformUser, StorageKey, UserChange, UserDto, UserId,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheError, CacheRepository, CachedEntity, DecodeFailurePolicy, KeyValueStore};
use crate::cache::{UserAlias, UserIdKey, UserKey};
use crate::config::CacheConfig;
use crate::db::{Session, SessionPool, SessionScope, User};
use crate::error::DataError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Bots are never registered as users.
    #[error("platform user {0} is a bot")]
    BotUser(ExternalId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserServiceConfig {
    /// Lifetime of cached users; `None` keeps them until overwritten.
    pub users_ttl: Option<Duration>,
    pub decode_failure: DecodeFailurePolicy,
}

impl Default for UserServiceConfig {
    fn default() -> Self {
        Self {
            users_ttl: Some(Duration::from_secs(CacheConfig::DEFAULT_USERS_TTL_SECS)),
            decode_failure: DecodeFailurePolicy::default(),
        }
    }
}

impl From<&CacheConfig> for UserServiceConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            users_ttl: config.users_ttl(),
            decode_failure: config.decode_failure,
        }
    }
}

pub struct UserService<P, S> {
    pool: P,
    cache: CacheRepository<S>,
    config: UserServiceConfig,
}

impl<P, S> UserService<P, S>
where
    P: SessionPool,
    S: KeyValueStore,
{
    pub fn new(pool: P, cache: CacheRepository<S>, config: UserServiceConfig) -> Self {
        Self {
            pool,
            cache,
            config,
        }
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn cache(&self) -> &CacheRepository<S> {
        &self.cache
    }

    /// Register a user seen for the first time. The locale is the platform's
    /// language when supported, otherwise the resolver's default.
    ///
    /// Fails with [`DataError::UniqueViolation`] when the external id is
    /// already registered. Nothing is cached.
    #[instrument(skip_all, fields(external_id = %platform.id), err)]
    pub async fn create(
        &self,
        platform: &PlatformUser,
        locales: &impl LocaleResolver,
    ) -> Result<UserDto, ServiceError> {
        let locale = locales.resolve(platform.language_code.as_deref());
        let mut rows = [User::from_platform(platform, locale)];

        let scope = SessionScope::acquire(&self.pool).await?;
        let committed = scope.unit_of_work().commit(&mut rows).await;
        release(scope, committed).await?;

        let [row] = rows;
        let user = row.dto()?;
        debug!(user_id = %user.id(), locale = %user.locale(), "user created");
        Ok(user)
    }

    /// User by store id.
    #[instrument(skip(self), err)]
    pub async fn get(&self, id: UserId) -> Result<Option<UserDto>, ServiceError> {
        if let Some(external_id) = self.cached_alias(id).await? {
            if let Some(user) = self.cached(external_id).await? {
                if user.id() == id {
                    debug!("cache hit");
                    return Ok(Some(user));
                }
            }
        }

        let scope = SessionScope::acquire(&self.pool).await?;
        let found = scope.repository().users().get(id).await;
        let found = release(scope, found).await?;
        self.populate(found).await
    }

    /// User by platform id.
    #[instrument(skip(self), err)]
    pub async fn by_external_id(
        &self,
        external_id: ExternalId,
    ) -> Result<Option<UserDto>, ServiceError> {
        if let Some(user) = self.cached(external_id).await? {
            debug!("cache hit");
            return Ok(Some(user));
        }

        let scope = SessionScope::acquire(&self.pool).await?;
        let found = scope.repository().users().by_external_id(external_id).await;
        let found = release(scope, found).await?;
        self.populate(found).await
    }

    /// Apply `changes`, persist the fields touched since load and refresh the
    /// cache entry. The DTO is marked loaded once the row is committed.
    #[instrument(skip_all, fields(user_id = %user.id()), err)]
    pub async fn update(
        &self,
        user: &mut UserDto,
        changes: impl IntoIterator<Item = UserChange>,
    ) -> Result<(), ServiceError> {
        for change in changes {
            user.apply(change);
        }
        user.validate()?;

        let diff = user.changes().clone();
        let scope = SessionScope::acquire(&self.pool).await?;
        let written = scope.repository().users().update(user.id(), &diff).await;
        release(scope, written).await?;
        user.mark_loaded();
        debug!(fields = ?diff.names().collect::<Vec<_>>(), "user updated");

        self.cache.save_user(user, self.config.users_ttl).await?;
        Ok(())
    }

    /// Look the user up by platform id and register them when unknown.
    #[instrument(skip_all, fields(external_id = %platform.id), err)]
    pub async fn get_or_create(
        &self,
        platform: &PlatformUser,
        locales: &impl LocaleResolver,
    ) -> Result<UserDto, ServiceError> {
        if platform.is_bot {
            return Err(ServiceError::BotUser(platform.id));
        }
        if let Some(user) = self.by_external_id(platform.id).await? {
            return Ok(user);
        }

        match self.create(platform, locales).await {
            Ok(user) => {
                info!(user_id = %user.id(), name = %user.name(), "new user registered");
                Ok(user)
            }
            // Registered concurrently between the lookup and the insert.
            Err(ServiceError::Data(err)) if err.is_unique_violation() => self
                .by_external_id(platform.id)
                .await?
                .ok_or(ServiceError::Data(err)),
            Err(err) => Err(err),
        }
    }

    /// The user stopped the bot.
    pub async fn block(&self, user: &mut UserDto, at: DateTime<Utc>) -> Result<(), ServiceError> {
        self.update(user, [UserChange::BlockedAt(Some(at))]).await
    }

    /// The user restarted the bot.
    pub async fn unblock(&self, user: &mut UserDto) -> Result<(), ServiceError> {
        self.update(user, [UserChange::BlockedAt(None)]).await
    }

    /// Drop the cache connection and close the pool.
    pub async fn close(&self) {
        self.cache.close().await;
        self.pool.close().await;
    }

    async fn cached(&self, external_id: ExternalId) -> Result<Option<UserDto>, ServiceError> {
        self.read_cache(&UserKey { external_id }).await
    }

    async fn cached_alias(&self, id: UserId) -> Result<Option<ExternalId>, ServiceError> {
        let alias: Option<UserAlias> = self.read_cache(&UserIdKey { id }).await?;
        Ok(alias.map(|a| a.external_id))
    }

    async fn read_cache<K, E>(&self, key: &K) -> Result<Option<E>, ServiceError>
    where
        K: StorageKey,
        E: CachedEntity,
    {
        match self.cache.get(key).await {
            Ok(entry) => Ok(entry),
            Err(CacheError::Validation { entity, reason })
                if self.config.decode_failure == DecodeFailurePolicy::TreatAsMiss =>
            {
                warn!(entity, %reason, "discarding undecodable cache entry");
                self.cache.delete(key).await?;
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn populate(&self, row: Option<User>) -> Result<Option<UserDto>, ServiceError> {
        let Some(row) = row else {
            debug!("user not found");
            return Ok(None);
        };
        let user = row.dto()?;
        self.cache.save_user(&user, self.config.users_ttl).await?;
        Ok(Some(user))
    }
}

/// Release the scope, then surface the operation's error before the
/// release error.
async fn release<S, T>(scope: SessionScope<S>, result: Result<T, DataError>) -> Result<T, DataError>
where
    S: Session,
{
    let released = scope.close().await;
    let value = result?;
    released?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryStore;
    use crate::db::{InMemoryDatabase, Model};
    use courier_core::{Locale, LocaleSet};

    fn service() -> (
        InMemoryDatabase,
        InMemoryStore,
        UserService<InMemoryDatabase, InMemoryStore>,
    ) {
        let db = InMemoryDatabase::new();
        let store = InMemoryStore::new();
        let service = UserService::new(
            db.clone(),
            CacheRepository::new(store.clone()),
            UserServiceConfig::default(),
        );
        (db, store, service)
    }

    fn platform(id: i64, language_code: Option<&str>) -> PlatformUser {
        PlatformUser {
            id: ExternalId::new(id),
            full_name: "A".into(),
            language_code: language_code.map(str::to_string),
            is_bot: false,
        }
    }

    #[tokio::test]
    async fn create_resolves_locale_and_does_not_cache() {
        let (_, store, service) = service();
        let locales = LocaleSet::new(vec![Locale::En, Locale::Uk], Locale::En);

        let uk = service.create(&platform(1, Some("uk")), &locales).await.unwrap();
        let fallback = service.create(&platform(2, Some("de")), &locales).await.unwrap();

        assert_eq!(uk.locale(), Locale::Uk);
        assert_eq!(uk.locale_code(), Some("uk"));
        assert_eq!(fallback.locale(), Locale::En);
        assert_eq!(store.counters().sets(), 0);
    }

    #[tokio::test]
    async fn bots_are_rejected() {
        let (db, _, service) = service();
        let mut bot = platform(9, None);
        bot.is_bot = true;

        let err = service.get_or_create(&bot, &LocaleSet::default()).await.unwrap_err();
        assert!(matches!(err, ServiceError::BotUser(id) if id == ExternalId::new(9)));
        assert_eq!(db.stats().acquired(), 0);
    }

    #[tokio::test]
    async fn get_or_create_registers_once() {
        let (db, _, service) = service();
        let locales = LocaleSet::default();

        let first = service.get_or_create(&platform(5, None), &locales).await.unwrap();
        let second = service.get_or_create(&platform(5, None), &locales).await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(db.rows(User::TABLE).len(), 1);
    }

    #[tokio::test]
    async fn invalid_changes_are_not_persisted() {
        let (db, _, service) = service();
        let mut user = service
            .create(&platform(1, None), &LocaleSet::default())
            .await
            .unwrap();
        let writes = db.stats().writes();

        let err = service
            .update(&mut user, [UserChange::Name("  ".into())])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Domain(_)));
        assert_eq!(db.stats().writes(), writes);
    }

    #[tokio::test]
    async fn undecodable_entries_fail_by_default() {
        let (_, store, service) = service();
        store.set("users:1", "{}".into(), None).await.unwrap();

        let err = service.by_external_id(ExternalId::new(1)).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Cache(CacheError::Validation { entity: "user", .. })
        ));
    }

    #[tokio::test]
    async fn undecodable_entries_can_be_treated_as_misses() {
        let db = InMemoryDatabase::new();
        let store = InMemoryStore::new();
        let service = UserService::new(
            db.clone(),
            CacheRepository::new(store.clone()),
            UserServiceConfig {
                decode_failure: DecodeFailurePolicy::TreatAsMiss,
                ..UserServiceConfig::default()
            },
        );
        let created = service
            .create(&platform(1, None), &LocaleSet::default())
            .await
            .unwrap();
        store.set("users:1", "{\"broken\": true}".into(), None).await.unwrap();

        let user = service.by_external_id(ExternalId::new(1)).await.unwrap();
        assert_eq!(user, Some(created));
        assert_eq!(store.counters().deletes(), 1);
        assert!(store.raw("users:1").is_some_and(|raw| raw.contains("\"name\"")));
    }
}
