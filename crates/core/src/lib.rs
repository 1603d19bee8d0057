//! `courier-core`: domain building blocks of the bot's data-access layer.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, storage keys, change-tracked records and locales.

pub mod error;
pub mod id;
pub mod key;
pub mod locale;
pub mod tracking;
pub mod user;
pub mod value;

pub use error::{DomainError, DomainResult};
pub use id::{ExternalId, UserId};
pub use key::{KeyError, KeyPart, KeySchema, KeySchemaError, StorageKey};
pub use locale::{Locale, LocaleResolver, LocaleSet};
pub use tracking::ChangeTracker;
pub use user::{PlatformUser, UserChange, UserDto};
pub use value::{FieldMap, FromValue, Value};
