//! Relational data access: models, predicates, sessions.
//!
//! ## Layers
//!
//! - [`Model`] describes how a row type maps onto a relation ([`TableDef`]).
//! - [`Session`] is one transactional conversation with the store. It speaks
//!   in untyped [`Record`]s and [`Condition`]s so that backends do not need to
//!   know about concrete models.
//! - [`Repository`](repository::Repository) and
//!   [`UnitOfWork`](uow::UnitOfWork) are the typed faces of a session.
//! - [`SessionScope`](scope::SessionScope) ties one session to one logical
//!   operation and guarantees it is released.
//!
//! ## Transactions
//!
//! A session begins a transaction on acquisition and again lazily after each
//! commit. Work that is never committed is rolled back when the session is
//! released.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use courier_core::{FieldMap, FromValue, Value};

use crate::error::DataError;

pub mod in_memory;
pub mod models;
pub mod postgres;
pub mod repository;
pub mod scope;
pub mod uow;

pub use in_memory::{InMemoryDatabase, InMemorySession, StoreStats};
pub use models::User;
pub use postgres::{PgSession, PgSessionPool};
pub use repository::{Repository, UsersRepository};
pub use scope::SessionScope;
pub use uow::UnitOfWork;

/// Untyped row: column name to value.
pub type Record = BTreeMap<&'static str, Value>;

/// Storage type of a column.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    BigInt,
    Text,
    Bool,
    Timestamp,
}

impl ColumnKind {
    /// `Null` matches every kind; nullability is the store's business.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (ColumnKind::BigInt, Value::Int(_))
                | (ColumnKind::Text, Value::Text(_))
                | (ColumnKind::Bool, Value::Bool(_))
                | (ColumnKind::Timestamp, Value::Timestamp(_))
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub kind: ColumnKind,
    /// Filled in by the store when omitted on insert.
    pub generated: bool,
}

impl ColumnDef {
    pub const fn new(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            kind,
            generated: false,
        }
    }

    pub const fn generated(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            kind,
            generated: true,
        }
    }
}

/// Relation metadata.
#[derive(Debug)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
    pub primary_key: &'static str,
    /// Columns carrying a unique constraint besides the primary key.
    pub unique: &'static [&'static str],
    /// Timestamp column refreshed by every update.
    pub touched_on_update: Option<&'static str>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Result<&ColumnDef, DataError> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DataError::UnknownColumn {
                table: self.name,
                column: name.to_string(),
            })
    }

    /// Check that every field names a column and carries a fitting value.
    pub fn check_fields<'n, 'v>(
        &self,
        fields: impl IntoIterator<Item = (&'n str, &'v Value)>,
    ) -> Result<(), DataError> {
        for (name, value) in fields {
            let column = self.column(name)?;
            if !column.kind.accepts(value) {
                return Err(DataError::TypeMismatch {
                    table: self.name,
                    column: name.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn check_conditions(&self, conditions: &[Condition]) -> Result<(), DataError> {
        self.check_fields(conditions.iter().map(|c| (c.column, &c.value)))
    }

    pub fn check_record(&self, record: &Record) -> Result<(), DataError> {
        self.check_fields(record.iter().map(|(name, value)| (*name, value)))
    }

    /// Columns every unique check has to look at, primary key first.
    pub fn unique_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.primary_key).chain(self.unique.iter().copied())
    }
}

/// Comparison used by a [`Condition`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    IsNull,
    IsNotNull,
}

/// Untyped predicate on one column.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: &'static str,
    pub op: Op,
    pub value: Value,
}

impl Condition {
    /// Evaluate against a record. Missing columns read as `Null`.
    pub fn matches(&self, record: &Record) -> bool {
        let actual = record.get(self.column).unwrap_or(&Value::Null);
        match self.op {
            Op::Eq if self.value.is_null() => actual.is_null(),
            Op::Eq => !actual.is_null() && *actual == self.value,
            Op::Ne if self.value.is_null() => !actual.is_null(),
            Op::Ne => !actual.is_null() && *actual != self.value,
            Op::IsNull => actual.is_null(),
            Op::IsNotNull => !actual.is_null(),
        }
    }
}

pub fn matches_all(conditions: &[Condition], record: &Record) -> bool {
    conditions.iter().all(|c| c.matches(record))
}

/// Predicate bound to model `M`, so a filter for one relation cannot be used
/// against another.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter<M> {
    condition: Condition,
    _model: PhantomData<fn() -> M>,
}

impl<M> Filter<M> {
    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    pub fn into_condition(self) -> Condition {
        self.condition
    }
}

pub(crate) fn conditions<M>(filters: &[Filter<M>]) -> Vec<Condition> {
    filters.iter().map(|f| f.condition.clone()).collect()
}

/// Typed column handle used to build [`Filter`]s.
#[derive(Debug)]
pub struct Column<M> {
    name: &'static str,
    _model: PhantomData<fn() -> M>,
}

impl<M> Clone for Column<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for Column<M> {}

impl<M> Column<M> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _model: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    fn filter(self, op: Op, value: Value) -> Filter<M> {
        Filter {
            condition: Condition {
                column: self.name,
                op,
                value,
            },
            _model: PhantomData,
        }
    }

    pub fn eq(self, value: impl Into<Value>) -> Filter<M> {
        self.filter(Op::Eq, value.into())
    }

    pub fn ne(self, value: impl Into<Value>) -> Filter<M> {
        self.filter(Op::Ne, value.into())
    }

    pub fn is_null(self) -> Filter<M> {
        self.filter(Op::IsNull, Value::Null)
    }

    pub fn is_not_null(self) -> Filter<M> {
        self.filter(Op::IsNotNull, Value::Null)
    }
}

/// A row type stored in one relation.
pub trait Model: Sized + Send + Sync + 'static {
    const TABLE: &'static TableDef;

    fn to_record(&self) -> Record;

    fn from_record(record: Record) -> Result<Self, DataError>;

    fn primary_key(&self) -> Value;
}

/// Pull a typed column value out of a record.
pub(crate) fn take<T: FromValue>(
    record: &mut Record,
    table: &TableDef,
    column: &'static str,
) -> Result<T, DataError> {
    let value = record.remove(column).unwrap_or(Value::Null);
    T::from_value(value).ok_or_else(|| {
        DataError::decode(format!("unexpected value for {}.{}", table.name, column))
    })
}

/// One transactional conversation with the relational store.
///
/// Methods take `&self` so that a repository and a unit of work can share the
/// session for the duration of a scope.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Rows matching every condition, ordered by primary key.
    async fn fetch(
        &self,
        table: &'static TableDef,
        conditions: &[Condition],
        limit: Option<usize>,
    ) -> Result<Vec<Record>, DataError>;

    /// Update matching rows; returns them when `returning` is set.
    async fn update(
        &self,
        table: &'static TableDef,
        conditions: &[Condition],
        fields: &FieldMap,
        returning: bool,
    ) -> Result<Vec<Record>, DataError>;

    /// Delete matching rows, returning how many matched.
    async fn delete(
        &self,
        table: &'static TableDef,
        conditions: &[Condition],
    ) -> Result<u64, DataError>;

    /// Insert and return the stored row (generated columns filled in).
    async fn insert(&self, table: &'static TableDef, record: Record) -> Result<Record, DataError>;

    /// Insert, or overwrite the row with the same primary key.
    async fn upsert(&self, table: &'static TableDef, record: Record) -> Result<Record, DataError>;

    async fn commit(&self) -> Result<(), DataError>;

    /// Roll back anything uncommitted and hand the connection back.
    async fn close(self) -> Result<(), DataError>
    where
        Self: Sized;
}

/// Source of sessions.
#[async_trait]
pub trait SessionPool: Send + Sync {
    type Session: Session;

    /// Waits for a free connection up to the pool's acquire timeout.
    async fn acquire(&self) -> Result<Self::Session, DataError>;

    /// Close the pool; later acquisitions fail.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    const NAME: Column<Probe> = Column::new("name");

    fn record(name: Option<&str>) -> Record {
        let mut r = Record::new();
        r.insert("name", Value::from(name));
        r
    }

    #[test]
    fn conditions_follow_sql_null_semantics() {
        let named = record(Some("a"));
        let anonymous = record(None);

        assert!(NAME.eq("a").condition().matches(&named));
        assert!(!NAME.eq("a").condition().matches(&anonymous));
        assert!(!NAME.ne("a").condition().matches(&anonymous));
        assert!(NAME.ne("b").condition().matches(&named));
        assert!(NAME.is_null().condition().matches(&anonymous));
        assert!(NAME.is_not_null().condition().matches(&named));
    }

    #[test]
    fn column_kinds_accept_null() {
        assert!(ColumnKind::Text.accepts(&Value::Null));
        assert!(!ColumnKind::BigInt.accepts(&Value::Text("1".into())));
    }
}
