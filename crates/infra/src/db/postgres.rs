//! Postgres-backed sessions.
//!
//! A [`PgSession`] owns at most one open transaction. The transaction is begun
//! when the session is acquired and again on first use after every commit;
//! `close` rolls back whatever was not committed. Dropping a session without
//! closing it has the same effect because SQLx rolls back a dropped
//! [`Transaction`].
//!
//! Statements are assembled with [`QueryBuilder`] from the table metadata, so
//! every value travels as a bind parameter and `Null` binds carry the column's
//! type.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::{Mutex, MutexGuard};
use tracing::instrument;

use async_trait::async_trait;
use courier_core::{FieldMap, Value};

use super::{Condition, ColumnKind, Op, Record, Session, SessionPool, TableDef};
use crate::config::{PoolConfig, PostgresConfig};
use crate::error::{map_sqlx_error, DataError};

/// Connection pool handing out [`PgSession`]s.
#[derive(Debug, Clone)]
pub struct PgSessionPool {
    pool: PgPool,
}

impl PgSessionPool {
    /// Open the pool, failing fast when the store is unreachable.
    pub async fn connect(postgres: &PostgresConfig, pool: &PoolConfig) -> Result<Self, DataError> {
        let pool = pool
            .pool_options()
            .connect_with(postgres.connect_options())
            .await
            .map_err(|e| map_sqlx_error("pool", "connect", e))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the relations this crate reads and writes, if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), DataError> {
        sqlx::query(USERS_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("users", "create table", e))?;
        Ok(())
    }
}

const USERS_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id          BIGSERIAL PRIMARY KEY,
        external_id BIGINT NOT NULL UNIQUE,
        name        TEXT NOT NULL,
        locale      TEXT NOT NULL,
        locale_code TEXT NULL,
        blocked_at  TIMESTAMPTZ NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

#[async_trait]
impl SessionPool for PgSessionPool {
    type Session = PgSession;

    #[instrument(skip(self), err)]
    async fn acquire(&self) -> Result<PgSession, DataError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("session", "begin", e))?;
        Ok(PgSession {
            pool: self.pool.clone(),
            tx: Mutex::new(Some(tx)),
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// One transactional conversation with Postgres.
pub struct PgSession {
    pool: PgPool,
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl std::fmt::Debug for PgSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSession")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

type TxGuard<'a> = MutexGuard<'a, Option<Transaction<'static, Postgres>>>;

impl PgSession {
    async fn transaction(&self) -> Result<TxGuard<'_>, DataError> {
        let mut guard = self.tx.lock().await;
        if guard.is_none() {
            let tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("session", "begin", e))?;
            *guard = Some(tx);
        }
        Ok(guard)
    }

    async fn fetch_records(
        &self,
        table: &'static TableDef,
        operation: &str,
        mut query: QueryBuilder<'static, Postgres>,
    ) -> Result<Vec<Record>, DataError> {
        let mut guard = self.transaction().await?;
        let tx = guard.as_mut().ok_or(DataError::Released)?;
        let rows = query
            .build()
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error(table.name, operation, e))?;
        rows.iter().map(|row| decode_row(table, row)).collect()
    }
}

#[async_trait]
impl Session for PgSession {
    #[instrument(skip_all, fields(table = table.name, limit = ?limit), err)]
    async fn fetch(
        &self,
        table: &'static TableDef,
        conditions: &[Condition],
        limit: Option<usize>,
    ) -> Result<Vec<Record>, DataError> {
        let query = build_select(table, conditions, limit)?;
        self.fetch_records(table, "select", query).await
    }

    #[instrument(skip_all, fields(table = table.name, fields = fields.len()), err)]
    async fn update(
        &self,
        table: &'static TableDef,
        conditions: &[Condition],
        fields: &FieldMap,
        returning: bool,
    ) -> Result<Vec<Record>, DataError> {
        let mut query = build_update(table, conditions, fields, returning)?;
        if returning {
            return self.fetch_records(table, "update", query).await;
        }

        let mut guard = self.transaction().await?;
        let tx = guard.as_mut().ok_or(DataError::Released)?;
        query
            .build()
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error(table.name, "update", e))?;
        Ok(Vec::new())
    }

    #[instrument(skip_all, fields(table = table.name), err)]
    async fn delete(
        &self,
        table: &'static TableDef,
        conditions: &[Condition],
    ) -> Result<u64, DataError> {
        let mut query = build_delete(table, conditions)?;
        let mut guard = self.transaction().await?;
        let tx = guard.as_mut().ok_or(DataError::Released)?;
        let result = query
            .build()
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error(table.name, "delete", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip_all, fields(table = table.name), err)]
    async fn insert(&self, table: &'static TableDef, record: Record) -> Result<Record, DataError> {
        let query = build_insert(table, &record)?;
        single(table, self.fetch_records(table, "insert", query).await?)
    }

    #[instrument(skip_all, fields(table = table.name), err)]
    async fn upsert(&self, table: &'static TableDef, record: Record) -> Result<Record, DataError> {
        let query = build_upsert(table, &record)?;
        single(table, self.fetch_records(table, "upsert", query).await?)
    }

    #[instrument(skip(self), err)]
    async fn commit(&self) -> Result<(), DataError> {
        let tx = self.tx.lock().await.take();
        if let Some(tx) = tx {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("session", "commit", e))?;
        }
        Ok(())
    }

    async fn close(self) -> Result<(), DataError> {
        if let Some(tx) = self.tx.into_inner() {
            tx.rollback()
                .await
                .map_err(|e| DataError::Release(e.to_string()))?;
        }
        Ok(())
    }
}

fn single(table: &TableDef, mut rows: Vec<Record>) -> Result<Record, DataError> {
    match rows.pop() {
        Some(row) if rows.is_empty() => Ok(row),
        _ => Err(DataError::Database(format!(
            "expected exactly one row back from {}",
            table.name
        ))),
    }
}

fn decode_row(table: &TableDef, row: &PgRow) -> Result<Record, DataError> {
    let mut record = Record::new();
    for column in table.columns {
        let value = match column.kind {
            ColumnKind::BigInt => row.try_get::<Option<i64>, _>(column.name).map(Value::from),
            ColumnKind::Text => row.try_get::<Option<String>, _>(column.name).map(Value::from),
            ColumnKind::Bool => row.try_get::<Option<bool>, _>(column.name).map(Value::from),
            ColumnKind::Timestamp => row
                .try_get::<Option<DateTime<Utc>>, _>(column.name)
                .map(Value::from),
        }
        .map_err(|e| map_sqlx_error(table.name, "decode", e))?;
        record.insert(column.name, value);
    }
    Ok(record)
}

fn push_ident(query: &mut QueryBuilder<'static, Postgres>, name: &str) {
    query.push("\"").push(name).push("\"");
}

fn push_value(query: &mut QueryBuilder<'static, Postgres>, kind: ColumnKind, value: &Value) {
    match (value, kind) {
        (Value::Int(v), _) => query.push_bind(*v),
        (Value::Bool(v), _) => query.push_bind(*v),
        (Value::Text(v), _) => query.push_bind(v.clone()),
        (Value::Timestamp(v), _) => query.push_bind(*v),
        (Value::Null, ColumnKind::BigInt) => query.push_bind(None::<i64>),
        (Value::Null, ColumnKind::Text) => query.push_bind(None::<String>),
        (Value::Null, ColumnKind::Bool) => query.push_bind(None::<bool>),
        (Value::Null, ColumnKind::Timestamp) => query.push_bind(None::<DateTime<Utc>>),
    };
}

fn push_column_list(query: &mut QueryBuilder<'static, Postgres>, names: &[&str]) {
    for (i, name) in names.iter().enumerate() {
        if i > 0 {
            query.push(", ");
        }
        push_ident(query, name);
    }
}

fn push_returning(query: &mut QueryBuilder<'static, Postgres>, table: &TableDef) {
    let names: Vec<&str> = table.columns.iter().map(|c| c.name).collect();
    query.push(" RETURNING ");
    push_column_list(query, &names);
}

fn push_where(
    query: &mut QueryBuilder<'static, Postgres>,
    table: &TableDef,
    conditions: &[Condition],
) -> Result<(), DataError> {
    for (i, condition) in conditions.iter().enumerate() {
        query.push(if i == 0 { " WHERE " } else { " AND " });
        push_ident(query, condition.column);
        let kind = table.column(condition.column)?.kind;
        match condition.op {
            Op::Eq | Op::IsNull if condition.value.is_null() => {
                query.push(" IS NULL");
            }
            Op::Ne | Op::IsNotNull if condition.value.is_null() => {
                query.push(" IS NOT NULL");
            }
            Op::Eq => {
                query.push(" = ");
                push_value(query, kind, &condition.value);
            }
            Op::Ne => {
                query.push(" <> ");
                push_value(query, kind, &condition.value);
            }
            Op::IsNull => {
                query.push(" IS NULL");
            }
            Op::IsNotNull => {
                query.push(" IS NOT NULL");
            }
        }
    }
    Ok(())
}

/// Columns written by an insert: generated columns are left to the store
/// unless a value was supplied.
fn insert_columns(table: &TableDef, record: &Record) -> Result<Vec<(&'static str, Value)>, DataError> {
    table.check_record(record)?;
    let mut columns = Vec::new();
    for column in table.columns {
        let value = record.get(column.name).cloned().unwrap_or(Value::Null);
        if column.generated && value.is_null() {
            continue;
        }
        columns.push((column.name, value));
    }
    Ok(columns)
}

fn push_values(
    query: &mut QueryBuilder<'static, Postgres>,
    table: &TableDef,
    columns: &[(&'static str, Value)],
) -> Result<(), DataError> {
    if columns.is_empty() {
        query.push(" DEFAULT VALUES");
        return Ok(());
    }
    let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
    query.push(" (");
    push_column_list(query, &names);
    query.push(") VALUES (");
    for (i, (name, value)) in columns.iter().enumerate() {
        if i > 0 {
            query.push(", ");
        }
        push_value(query, table.column(name)?.kind, value);
    }
    query.push(")");
    Ok(())
}

pub(crate) fn build_select(
    table: &TableDef,
    conditions: &[Condition],
    limit: Option<usize>,
) -> Result<QueryBuilder<'static, Postgres>, DataError> {
    table.check_conditions(conditions)?;
    let names: Vec<&str> = table.columns.iter().map(|c| c.name).collect();
    let mut query = QueryBuilder::new("SELECT ");
    push_column_list(&mut query, &names);
    query.push(" FROM ");
    push_ident(&mut query, table.name);
    push_where(&mut query, table, conditions)?;
    query.push(" ORDER BY ");
    push_ident(&mut query, table.primary_key);
    if let Some(limit) = limit {
        query.push(" LIMIT ");
        query.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }
    Ok(query)
}

pub(crate) fn build_update(
    table: &TableDef,
    conditions: &[Condition],
    fields: &FieldMap,
    returning: bool,
) -> Result<QueryBuilder<'static, Postgres>, DataError> {
    table.check_conditions(conditions)?;
    table.check_fields(fields.iter())?;
    if fields.is_empty() {
        return Err(DataError::Database(format!(
            "update of {} without fields",
            table.name
        )));
    }

    let mut query = QueryBuilder::new("UPDATE ");
    push_ident(&mut query, table.name);
    query.push(" SET ");
    for (i, (name, value)) in fields.iter().enumerate() {
        if i > 0 {
            query.push(", ");
        }
        push_ident(&mut query, name);
        query.push(" = ");
        push_value(&mut query, table.column(name)?.kind, value);
    }
    if let Some(touched) = table.touched_on_update.filter(|c| !fields.contains(c)) {
        query.push(", ");
        push_ident(&mut query, touched);
        query.push(" = NOW()");
    }
    push_where(&mut query, table, conditions)?;
    if returning {
        push_returning(&mut query, table);
    }
    Ok(query)
}

pub(crate) fn build_delete(
    table: &TableDef,
    conditions: &[Condition],
) -> Result<QueryBuilder<'static, Postgres>, DataError> {
    table.check_conditions(conditions)?;
    let mut query = QueryBuilder::new("DELETE FROM ");
    push_ident(&mut query, table.name);
    push_where(&mut query, table, conditions)?;
    Ok(query)
}

pub(crate) fn build_insert(
    table: &TableDef,
    record: &Record,
) -> Result<QueryBuilder<'static, Postgres>, DataError> {
    let columns = insert_columns(table, record)?;
    let mut query = QueryBuilder::new("INSERT INTO ");
    push_ident(&mut query, table.name);
    push_values(&mut query, table, &columns)?;
    push_returning(&mut query, table);
    Ok(query)
}

/// Insert-or-overwrite keyed on the primary key. A record without a key is a
/// plain insert.
pub(crate) fn build_upsert(
    table: &TableDef,
    record: &Record,
) -> Result<QueryBuilder<'static, Postgres>, DataError> {
    let keyed = record
        .get(table.primary_key)
        .is_some_and(|v| !v.is_null());
    if !keyed {
        return build_insert(table, record);
    }

    let columns = insert_columns(table, record)?;
    let mut query = QueryBuilder::new("INSERT INTO ");
    push_ident(&mut query, table.name);
    push_values(&mut query, table, &columns)?;
    query.push(" ON CONFLICT (");
    push_ident(&mut query, table.primary_key);
    query.push(") DO UPDATE SET ");

    let mut first = true;
    let assignments = columns
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| *name != table.primary_key && Some(*name) != table.touched_on_update);
    for name in assignments {
        if !first {
            query.push(", ");
        }
        first = false;
        push_ident(&mut query, name);
        query.push(" = EXCLUDED.");
        push_ident(&mut query, name);
    }
    if let Some(touched) = table.touched_on_update {
        if !first {
            query.push(", ");
        }
        push_ident(&mut query, touched);
        query.push(" = NOW()");
    }
    push_returning(&mut query, table);
    Ok(query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::User;
    use crate::db::Model;
    use courier_core::user::fields;
    use courier_core::{ExternalId, Locale, PlatformUser, UserId};

    fn user() -> User {
        User::from_platform(
            &PlatformUser {
                id: ExternalId::new(111),
                full_name: "A".into(),
                language_code: None,
                is_bot: false,
            },
            Locale::En,
        )
    }

    #[test]
    fn select_binds_every_value() {
        let conditions = vec![
            User::EXTERNAL_ID.eq(111_i64).into_condition(),
            User::BLOCKED_AT.is_null().into_condition(),
        ];
        let query = build_select(User::TABLE, &conditions, Some(1)).unwrap();
        let sql = query.sql();

        assert!(sql.starts_with("SELECT \"id\", \"external_id\""));
        assert!(sql.contains("FROM \"users\" WHERE \"external_id\" = $1 AND \"blocked_at\" IS NULL"));
        assert!(sql.ends_with("ORDER BY \"id\" LIMIT $2"));
    }

    #[test]
    fn equality_with_null_becomes_is_null() {
        let conditions = vec![User::NAME.eq(None::<String>).into_condition()];
        let query = build_select(User::TABLE, &conditions, None).unwrap();
        assert!(query.sql().contains("\"name\" IS NULL"));
        assert!(!query.sql().contains("LIMIT"));
    }

    #[test]
    fn insert_leaves_generated_columns_to_the_store() {
        let query = build_insert(User::TABLE, &user().to_record()).unwrap();
        let sql = query.sql();

        assert!(sql.starts_with("INSERT INTO \"users\" (\"external_id\", \"name\""));
        assert!(!sql.contains("\"created_at\", \"updated_at\") VALUES"));
        assert!(sql.contains("RETURNING \"id\""));
    }

    #[test]
    fn update_touches_updated_at() {
        let mut fields_map = FieldMap::new();
        fields_map.insert(fields::NAME, Value::from("B"));
        let conditions = vec![User::ID.eq(1_i64).into_condition()];
        let query = build_update(User::TABLE, &conditions, &fields_map, false).unwrap();

        assert_eq!(
            query.sql(),
            "UPDATE \"users\" SET \"name\" = $1, \"updated_at\" = NOW() WHERE \"id\" = $2"
        );
    }

    #[test]
    fn update_rejects_unknown_columns() {
        let mut fields_map = FieldMap::new();
        fields_map.insert("nickname", Value::from("B"));
        let err = build_update(User::TABLE, &[], &fields_map, false).err();
        assert!(matches!(err, Some(DataError::UnknownColumn { .. })));
    }

    #[test]
    fn upsert_conflicts_on_primary_key() {
        let mut row = user();
        row.id = Some(UserId::new(3));
        let query = build_upsert(User::TABLE, &row.to_record()).unwrap();
        let sql = query.sql();

        assert!(sql.contains("ON CONFLICT (\"id\") DO UPDATE SET \"external_id\" = EXCLUDED.\"external_id\""));
        assert!(sql.contains("\"updated_at\" = NOW() RETURNING"));
    }

    #[test]
    fn upsert_without_key_is_an_insert() {
        let query = build_upsert(User::TABLE, &user().to_record()).unwrap();
        assert!(!query.sql().contains("ON CONFLICT"));
    }

    #[test]
    fn schema_declares_every_column() {
        for column in User::TABLE.columns {
            let declared = USERS_SCHEMA
                .lines()
                .any(|line| line.trim_start().starts_with(&format!("{} ", column.name)));
            assert!(declared, "{} missing from schema", column.name);
        }
    }

    #[test]
    fn delete_filters_by_condition() {
        let conditions = vec![User::ID.eq(1_i64).into_condition()];
        let query = build_delete(User::TABLE, &conditions).unwrap();
        assert_eq!(query.sql(), "DELETE FROM \"users\" WHERE \"id\" = $1");
    }
}
