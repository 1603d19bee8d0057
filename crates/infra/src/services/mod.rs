//! Application-facing services composing the relational store and the cache.

pub mod user;

pub use user::{ServiceError, UserService, UserServiceConfig};
