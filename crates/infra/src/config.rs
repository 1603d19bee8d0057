//! Configuration loading and representation.
//!
//! Built-in defaults are merged with environment variables, one prefix per
//! section:
//!
//! | Section | Prefix | Example |
//! |---------|--------|---------|
//! | `postgres` | `POSTGRES_` | `POSTGRES_HOST`, `POSTGRES_DB` |
//! | `pool` | `SQL_POOL_` | `SQL_POOL_MAX_CONNECTIONS` |
//! | `redis` | `REDIS_` | `REDIS_HOST`, `REDIS_DB` |
//! | `cache` | `CACHE_` | `CACHE_USERS_TTL_SECS`, `CACHE_DECODE_FAILURE` |
//! | `locales` | `LOCALES_` | `LOCALES_SUPPORTED=en,uk`, `LOCALES_DEFAULT` |
//!
//! Passwords (`POSTGRES_PASSWORD`, `REDIS_PASSWORD`) are taken verbatim, never
//! parsed, so `123456` or `007` stay strings.

use std::time::Duration;

use courier_core::LocaleSet;
use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use thiserror::Error;

use crate::cache::DecodeFailurePolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub postgres: PostgresConfig,
    pub pool: PoolConfig,
    pub redis: RedisConfig,
    pub cache: CacheConfig,
    pub locales: LocaleSet,
}

impl AppConfig {
    /// Defaults overlaid with the environment.
    pub fn figment() -> Figment {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(section("POSTGRES_", "postgres"))
            .merge(section("SQL_POOL_", "pool"))
            .merge(section("REDIS_", "redis"))
            .merge(section("CACHE_", "cache"))
            .merge(section("LOCALES_", "locales"));
        for (var, key) in SECRETS {
            if let Ok(value) = std::env::var(var) {
                figment = figment.merge(Serialized::default(key, value));
            }
        }
        figment
    }

    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_connections must be at least 1".to_string(),
            ));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(ConfigError::Invalid(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        if !self.locales.supported.contains(&self.locales.default) {
            return Err(ConfigError::Invalid(format!(
                "default locale {} is not among the supported locales",
                self.locales.default
            )));
        }
        Ok(())
    }
}

/// Variables read as raw strings, with the key they fill.
const SECRETS: [(&str, &str); 2] = [
    ("POSTGRES_PASSWORD", "postgres.password"),
    ("REDIS_PASSWORD", "redis.password"),
];

/// Env vars starting with `prefix`, nested under `key`. Passwords are left to
/// [`SECRETS`].
fn section(prefix: &str, key: &'static str) -> Env {
    Env::prefixed(prefix)
        .ignore(&["password"])
        .map(move |name| format!("{}.{}", key, name.as_str().to_ascii_lowercase()).into())
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub db: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            db: "postgres".to_string(),
        }
    }
}

impl std::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("db", &self.db)
            .finish()
    }
}

impl PostgresConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.db);
        if self.password.is_empty() {
            return options;
        }
        options.password(&self.password)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    /// Connections older than this are recycled.
    pub max_lifetime_secs: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_secs: 30,
            idle_timeout_secs: Some(600),
            max_lifetime_secs: Some(1800),
        }
    }
}

impl PoolConfig {
    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_secs))
            .idle_timeout(self.idle_timeout_secs.map(Duration::from_secs))
            .max_lifetime(self.max_lifetime_secs.map(Duration::from_secs))
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl RedisConfig {
    /// `redis://[:password@]host:port/db`
    pub fn build_url(&self) -> String {
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL of cached users in seconds; `0` disables expiry.
    pub users_ttl_secs: u64,
    pub decode_failure: DecodeFailurePolicy,
}

impl CacheConfig {
    pub const DEFAULT_USERS_TTL_SECS: u64 = 24 * 60 * 60;

    pub fn users_ttl(&self) -> Option<Duration> {
        match self.users_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            users_ttl_secs: Self::DEFAULT_USERS_TTL_SECS,
            decode_failure: DecodeFailurePolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::Locale;
    use figment::Jail;

    #[test]
    fn defaults_load_without_environment() {
        Jail::expect_with(|_| {
            let config = AppConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config, AppConfig::default());
            assert_eq!(config.cache.users_ttl(), Some(Duration::from_secs(86_400)));
            assert_eq!(config.locales.supported.len(), Locale::ALL.len());
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_each_section() {
        Jail::expect_with(|jail| {
            jail.set_env("POSTGRES_HOST", "db.internal");
            jail.set_env("POSTGRES_DB", "bot");
            jail.set_env("POSTGRES_PASSWORD", "123456");
            jail.set_env("REDIS_PASSWORD", "007");
            jail.set_env("SQL_POOL_MAX_CONNECTIONS", "20");
            jail.set_env("REDIS_DB", "2");
            jail.set_env("CACHE_USERS_TTL_SECS", "60");
            jail.set_env("CACHE_DECODE_FAILURE", "treat_as_miss");
            jail.set_env("LOCALES_SUPPORTED", "en,uk");
            jail.set_env("LOCALES_DEFAULT", "uk");

            let config = AppConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.postgres.host, "db.internal");
            assert_eq!(config.postgres.db, "bot");
            assert_eq!(config.postgres.password, "123456");
            assert_eq!(config.redis.password.as_deref(), Some("007"));
            assert_eq!(config.pool.max_connections, 20);
            assert_eq!(config.redis.db, 2);
            assert_eq!(config.cache.users_ttl(), Some(Duration::from_secs(60)));
            assert_eq!(config.cache.decode_failure, DecodeFailurePolicy::TreatAsMiss);
            assert_eq!(config.locales.supported, vec![Locale::En, Locale::Uk]);
            assert_eq!(config.locales.default, Locale::Uk);
            Ok(())
        });
    }

    #[test]
    fn default_locale_must_be_supported() {
        Jail::expect_with(|jail| {
            jail.set_env("LOCALES_SUPPORTED", "en");
            jail.set_env("LOCALES_DEFAULT", "uk");
            assert!(matches!(AppConfig::load(), Err(ConfigError::Invalid(_))));
            Ok(())
        });
    }

    #[test]
    fn zero_ttl_disables_expiry() {
        let cache = CacheConfig {
            users_ttl_secs: 0,
            ..CacheConfig::default()
        };
        assert_eq!(cache.users_ttl(), None);
    }

    #[test]
    fn redis_url_includes_password_when_set() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.build_url(), "redis://localhost:6379/0");

        redis.password = Some("s3cret".into());
        assert_eq!(redis.build_url(), "redis://:s3cret@localhost:6379/0");
        assert!(!format!("{:?}", redis).contains("s3cret"));
    }

    #[test]
    fn postgres_debug_hides_password() {
        let postgres = PostgresConfig {
            password: "hunter2".into(),
            ..PostgresConfig::default()
        };
        assert!(!format!("{:?}", postgres).contains("hunter2"));
    }
}
