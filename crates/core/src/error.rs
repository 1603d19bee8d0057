//! Domain error model.

use thiserror::Error;

use crate::key::KeyError;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures of domain values (identifiers,
/// locales, storage keys, record shape). Store failures belong to the
/// infrastructure crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A locale code is not part of the catalogue.
    #[error("unknown locale: {0}")]
    UnknownLocale(String),

    /// A storage key could not be built.
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_locale(code: impl Into<String>) -> Self {
        Self::UnknownLocale(code.into())
    }
}
