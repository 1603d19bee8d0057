//! Infrastructure layer: relational sessions, key-value cache, config, services.
//!
//! - [`db`]: models, sessions (Postgres and in-memory), repository, unit of
//!   work and the session scope.
//! - [`cache`]: key-value stores (Redis and in-memory) and the typed cache
//!   repository.
//! - [`services`]: the user service doing cache-aside reads.
//! - [`config`]: environment-driven configuration.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod services;


pub use cache::{CacheError, CacheRepository, DecodeFailurePolicy, InMemoryStore, KeyValueStore};
#[cfg(feature = "redis")]
pub use cache::RedisStore;
pub use config::{AppConfig, ConfigError};
pub use db::{InMemoryDatabase, PgSessionPool, SessionPool, SessionScope};
pub use error::DataError;
pub use services::{ServiceError, UserService, UserServiceConfig};
