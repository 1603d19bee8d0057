//! Relational store error model.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `DataError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | DataError | Scenario |
//! |------------|----------------------|-----------|----------|
//! | Database (unique violation) | `23505` | `UniqueViolation` | Duplicate external id on create |
//! | Database (other) | Any other | `Database` | Constraint/type errors |
//! | PoolTimedOut / PoolClosed / Io / Tls | N/A | `Acquire` | Pool exhausted or store unreachable |
//! | ColumnDecode / ColumnNotFound | N/A | `Decode` | Row does not match the model |
//! | Other | N/A | `Database` | Anything else |

use thiserror::Error;

/// Relational layer error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DataError {
    /// A unique constraint rejected the write. Not retried.
    #[error("unique constraint violated on {table}: {message}")]
    UniqueViolation { table: String, message: String },

    /// No session could be obtained (pool exhausted, store unreachable, pool closed).
    #[error("failed to acquire a session: {0}")]
    Acquire(String),

    #[error("database error: {0}")]
    Database(String),

    /// A row could not be turned into a model.
    #[error("failed to decode row: {0}")]
    Decode(String),

    #[error("unknown column {column} on {table}")]
    UnknownColumn { table: &'static str, column: String },

    #[error("value for {table}.{column} does not match the column type")]
    TypeMismatch { table: &'static str, column: String },

    /// The session was released and can no longer be used.
    #[error("session already released")]
    Released,

    #[error("failed to release session: {0}")]
    Release(String),
}

impl DataError {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, DataError::UniqueViolation { .. })
    }
}

/// Map a SQLx error raised while running `operation` against `table`.
pub(crate) fn map_sqlx_error(table: &str, operation: &str, err: sqlx::Error) -> DataError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("{} in {}: {}", operation, table, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => DataError::UniqueViolation {
                    table: table.to_string(),
                    message: db_err
                        .constraint()
                        .map(|c| format!("{} ({})", db_err.message(), c))
                        .unwrap_or_else(|| db_err.message().to_string()),
                },
                _ => DataError::Database(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            DataError::Acquire(format!("timed out waiting for a connection in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            DataError::Acquire(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::Io(e) => DataError::Acquire(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => DataError::Acquire(format!("tls error in {}: {}", operation, e)),
        sqlx::Error::ColumnDecode { index, source } => {
            DataError::Decode(format!("column {} in {}: {}", index, table, source))
        }
        sqlx::Error::ColumnNotFound(column) => {
            DataError::Decode(format!("column {} missing from {} row", column, table))
        }
        other => DataError::Database(format!("sqlx error in {}: {}", operation, other)),
    }
}
