//! In-memory relational store for tests/dev.
//!
//! Each session works on a private copy of the tables taken when its
//! transaction begins and keeps a journal of what it wrote: inserted rows,
//! the fields set on existing rows, and removed keys. Commit replays the
//! journal onto the current shared rows under one write lock, re-checking
//! unique constraints, so concurrent sessions writing different fields of the
//! same row keep each other's changes.
//! Primary keys come from a shared sequence, like a database sequence they are
//! never handed out twice even when a transaction rolls back.
//!
//! Every statement is counted in [`StoreStats`], which is what tests use to
//! prove that a cache hit never reached the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use courier_core::{FieldMap, Value};

use super::{matches_all, Condition, Record, Session, SessionPool, TableDef};
use crate::error::DataError;

type Tables = HashMap<&'static str, Vec<Record>>;

/// Statement and session counters.
#[derive(Debug, Default)]
pub struct StoreStats {
    acquired: AtomicUsize,
    released: AtomicUsize,
    reads: AtomicUsize,
    writes: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl StoreStats {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Sessions acquired but not yet released.
    pub fn open_sessions(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: RwLock<Tables>,
    sequence: AtomicI64,
    stats: StoreStats,
    closed: AtomicBool,
}

/// Shared in-memory database; cloning yields another handle to the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    shared: Arc<Shared>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &StoreStats {
        &self.shared.stats
    }

    /// Committed rows of a table, in primary key order.
    pub fn rows(&self, table: &TableDef) -> Vec<Record> {
        let tables = match self.shared.tables.read() {
            Ok(t) => t,
            Err(_) => return vec![],
        };
        let mut rows = tables.get(table.name).cloned().unwrap_or_default();
        rows.sort_by_key(|r| pk_order(table, r));
        rows
    }

    fn snapshot(&self) -> Result<Tables, DataError> {
        self.shared
            .tables
            .read()
            .map(|t| t.clone())
            .map_err(|_| DataError::Database("lock poisoned".to_string()))
    }

    fn next_id(&self) -> i64 {
        self.shared.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn apply(&self, journal: Vec<Journal>) -> Result<(), DataError> {
        let mut tables = self
            .shared
            .tables
            .write()
            .map_err(|_| DataError::Database("lock poisoned".to_string()))?;

        // Replay on a copy so a failing entry leaves the shared tables untouched.
        let mut next = tables.clone();
        for entry in journal {
            match entry {
                Journal::Put { table, record } => {
                    let rows = next.entry(table.name).or_default();
                    put(table, rows, record)?;
                }
                Journal::Patch {
                    table,
                    key,
                    fields,
                    row,
                } => {
                    let rows = next.entry(table.name).or_default();
                    let current = rows
                        .iter()
                        .find(|r| r.get(table.primary_key) == Some(&key))
                        .cloned();
                    // A patch whose row was removed meanwhile matches nothing,
                    // unless it came from an upsert.
                    let patched = match (current, row) {
                        (Some(mut current), _) => {
                            current.extend(fields);
                            current
                        }
                        (None, Some(row)) => row,
                        (None, None) => continue,
                    };
                    put(table, rows, patched)?;
                }
                Journal::Remove { table, key } => {
                    if let Some(rows) = next.get_mut(table.name) {
                        rows.retain(|r| r.get(table.primary_key) != Some(&key));
                    }
                }
            }
        }
        *tables = next;
        Ok(())
    }
}

#[async_trait]
impl SessionPool for InMemoryDatabase {
    type Session = InMemorySession;

    async fn acquire(&self) -> Result<InMemorySession, DataError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(DataError::Acquire("connection pool closed".to_string()));
        }
        StoreStats::bump(&self.shared.stats.acquired);
        Ok(InMemorySession {
            db: self.clone(),
            tx: Mutex::new(None),
        })
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
enum Journal {
    Put {
        table: &'static TableDef,
        record: Record,
    },
    /// Fields written to the row with primary key `key`. `row` is the full
    /// row an upsert inserts when the key is gone at commit time.
    Patch {
        table: &'static TableDef,
        key: Value,
        fields: Record,
        row: Option<Record>,
    },
    Remove {
        table: &'static TableDef,
        key: Value,
    },
}

#[derive(Debug)]
struct Working {
    tables: Tables,
    journal: Vec<Journal>,
}

/// Session over an [`InMemoryDatabase`].
#[derive(Debug)]
pub struct InMemorySession {
    db: InMemoryDatabase,
    tx: Mutex<Option<Working>>,
}

impl InMemorySession {
    fn with_working<T>(
        &self,
        f: impl FnOnce(&InMemoryDatabase, &mut Working) -> Result<T, DataError>,
    ) -> Result<T, DataError> {
        let mut guard = self
            .tx
            .lock()
            .map_err(|_| DataError::Database("lock poisoned".to_string()))?;
        if guard.is_none() {
            *guard = Some(Working {
                tables: self.db.snapshot()?,
                journal: Vec::new(),
            });
        }
        match guard.as_mut() {
            Some(working) => f(&self.db, working),
            None => Err(DataError::Released),
        }
    }

    fn stats(&self) -> &StoreStats {
        self.db.stats()
    }
}

impl Working {
    fn rows(&mut self, table: &TableDef) -> &mut Vec<Record> {
        self.tables.entry(table.name).or_default()
    }

    fn insert(
        &mut self,
        db: &InMemoryDatabase,
        table: &'static TableDef,
        mut record: Record,
    ) -> Result<Record, DataError> {
        table.check_record(&record)?;
        let now = Utc::now();
        for column in table.columns.iter().filter(|c| c.generated) {
            let missing = record.get(column.name).is_none_or(Value::is_null);
            if !missing {
                continue;
            }
            let value = if column.name == table.primary_key {
                Value::Int(db.next_id())
            } else {
                Value::Timestamp(now)
            };
            record.insert(column.name, value);
        }

        let rows = self.rows(table);
        check_unique(table, rows, &record, None)?;
        rows.push(record.clone());
        self.journal.push(Journal::Put {
            table,
            record: record.clone(),
        });
        Ok(record)
    }
}

#[async_trait]
impl Session for InMemorySession {
    async fn fetch(
        &self,
        table: &'static TableDef,
        conditions: &[Condition],
        limit: Option<usize>,
    ) -> Result<Vec<Record>, DataError> {
        table.check_conditions(conditions)?;
        StoreStats::bump(&self.stats().reads);
        self.with_working(|_, working| {
            let mut rows: Vec<Record> = working
                .rows(table)
                .iter()
                .filter(|r| matches_all(conditions, r))
                .cloned()
                .collect();
            rows.sort_by_key(|r| pk_order(table, r));
            if let Some(limit) = limit {
                rows.truncate(limit);
            }
            Ok(rows)
        })
    }

    async fn update(
        &self,
        table: &'static TableDef,
        conditions: &[Condition],
        fields: &FieldMap,
        returning: bool,
    ) -> Result<Vec<Record>, DataError> {
        table.check_conditions(conditions)?;
        table.check_fields(fields.iter())?;
        StoreStats::bump(&self.stats().writes);
        self.with_working(|_, working| {
            let now = Utc::now();
            let rows = working.tables.entry(table.name).or_default();

            let mut changed: Record = fields.iter().map(|(n, v)| (n, v.clone())).collect();
            if let Some(column) = table.touched_on_update {
                changed.insert(column, Value::Timestamp(now));
            }

            let mut updated = Vec::new();
            for row in rows.iter().filter(|r| matches_all(conditions, r)) {
                let mut next = row.clone();
                next.extend(changed.clone());
                updated.push(next);
            }
            for row in &updated {
                check_unique(table, rows, row, row.get(table.primary_key))?;
            }
            for row in &updated {
                put(table, rows, row.clone())?;
                working.journal.push(Journal::Patch {
                    table,
                    key: row.get(table.primary_key).cloned().unwrap_or(Value::Null),
                    fields: changed.clone(),
                    row: None,
                });
            }
            Ok(if returning { updated } else { Vec::new() })
        })
    }

    async fn delete(
        &self,
        table: &'static TableDef,
        conditions: &[Condition],
    ) -> Result<u64, DataError> {
        table.check_conditions(conditions)?;
        StoreStats::bump(&self.stats().writes);
        self.with_working(|_, working| {
            let rows = working.tables.entry(table.name).or_default();
            let (removed, kept): (Vec<Record>, Vec<Record>) =
                rows.drain(..).partition(|r| matches_all(conditions, r));
            *rows = kept;
            for row in &removed {
                working.journal.push(Journal::Remove {
                    table,
                    key: row.get(table.primary_key).cloned().unwrap_or(Value::Null),
                });
            }
            Ok(removed.len() as u64)
        })
    }

    async fn insert(&self, table: &'static TableDef, record: Record) -> Result<Record, DataError> {
        StoreStats::bump(&self.stats().writes);
        self.with_working(|db, working| working.insert(db, table, record))
    }

    async fn upsert(&self, table: &'static TableDef, record: Record) -> Result<Record, DataError> {
        StoreStats::bump(&self.stats().writes);
        self.with_working(|db, working| {
            let key = record.get(table.primary_key).cloned().unwrap_or(Value::Null);
            let existing = if key.is_null() {
                None
            } else {
                working
                    .rows(table)
                    .iter()
                    .find(|r| r.get(table.primary_key) == Some(&key))
                    .cloned()
            };
            let Some(existing) = existing else {
                return working.insert(db, table, record);
            };

            table.check_record(&record)?;
            let mut changed = Record::new();
            for (name, value) in record {
                let generated = table.column(name).map(|c| c.generated).unwrap_or(false);
                if generated && value.is_null() {
                    continue;
                }
                changed.insert(name, value);
            }
            if let Some(column) = table.touched_on_update {
                changed.insert(column, Value::Timestamp(Utc::now()));
            }
            let mut merged = existing;
            merged.extend(changed.clone());

            let rows = working.rows(table);
            put(table, rows, merged.clone())?;
            working.journal.push(Journal::Patch {
                table,
                key,
                fields: changed,
                row: Some(merged.clone()),
            });
            Ok(merged)
        })
    }

    async fn commit(&self) -> Result<(), DataError> {
        let working = self
            .tx
            .lock()
            .map_err(|_| DataError::Database("lock poisoned".to_string()))?
            .take();
        if let Some(working) = working {
            self.db.apply(working.journal)?;
        }
        StoreStats::bump(&self.stats().commits);
        Ok(())
    }

    async fn close(self) -> Result<(), DataError> {
        drop(self);
        Ok(())
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        let pending = match self.tx.get_mut() {
            Ok(working) => working.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if pending.is_some_and(|w| !w.journal.is_empty()) {
            StoreStats::bump(&self.stats().rollbacks);
        }
        StoreStats::bump(&self.stats().released);
    }
}

fn pk_order(table: &TableDef, record: &Record) -> i64 {
    match record.get(table.primary_key) {
        Some(Value::Int(v)) => *v,
        _ => i64::MAX,
    }
}

/// Insert `record`, or replace the row with the same primary key.
fn put(table: &TableDef, rows: &mut Vec<Record>, record: Record) -> Result<(), DataError> {
    let key = record.get(table.primary_key).cloned();
    check_unique(table, rows, &record, key.as_ref())?;
    match rows
        .iter_mut()
        .find(|r| key.is_some() && r.get(table.primary_key) == key.as_ref())
    {
        Some(row) => *row = record,
        None => rows.push(record),
    }
    Ok(())
}

/// Reject `candidate` if another row shares a value in any unique column.
/// Rows whose primary key equals `replacing` are the candidate's own row.
fn check_unique(
    table: &TableDef,
    rows: &[Record],
    candidate: &Record,
    replacing: Option<&Value>,
) -> Result<(), DataError> {
    for column in table.unique_columns() {
        let Some(value) = candidate.get(column).filter(|v| !v.is_null()) else {
            continue;
        };
        let clash = rows.iter().any(|row| {
            let own = replacing.is_some() && row.get(table.primary_key) == replacing;
            !own && row.get(column) == Some(value)
        });
        if clash {
            return Err(DataError::UniqueViolation {
                table: table.name.to_string(),
                message: format!("duplicate key value violates unique constraint on {}", column),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::User;
    use crate::db::Model;
    use courier_core::user::fields;
    use courier_core::{ExternalId, Locale, PlatformUser};

    fn row(external_id: i64) -> Record {
        let platform = PlatformUser {
            id: ExternalId::new(external_id),
            full_name: format!("user {}", external_id),
            language_code: None,
            is_bot: false,
        };
        User::from_platform(&platform, Locale::En).to_record()
    }

    #[tokio::test]
    async fn insert_assigns_monotonic_ids_and_timestamps() {
        let db = InMemoryDatabase::new();
        let session = db.acquire().await.unwrap();
        let first = session.insert(User::TABLE, row(1)).await.unwrap();
        let second = session.insert(User::TABLE, row(2)).await.unwrap();
        session.commit().await.unwrap();

        assert_eq!(first.get("id"), Some(&Value::Int(1)));
        assert_eq!(second.get("id"), Some(&Value::Int(2)));
        assert!(matches!(first.get("created_at"), Some(Value::Timestamp(_))));
        assert_eq!(db.rows(User::TABLE).len(), 2);
    }

    #[tokio::test]
    async fn unique_columns_are_enforced() {
        let db = InMemoryDatabase::new();
        let session = db.acquire().await.unwrap();
        session.insert(User::TABLE, row(111)).await.unwrap();
        let err = session.insert(User::TABLE, row(111)).await.unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn commit_rechecks_uniqueness_across_sessions() {
        let db = InMemoryDatabase::new();
        let a = db.acquire().await.unwrap();
        let b = db.acquire().await.unwrap();
        a.insert(User::TABLE, row(7)).await.unwrap();
        b.insert(User::TABLE, row(7)).await.unwrap();

        a.commit().await.unwrap();
        let err = b.commit().await.unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(db.rows(User::TABLE).len(), 1);
    }

    #[tokio::test]
    async fn uncommitted_work_is_rolled_back_on_close() {
        let db = InMemoryDatabase::new();
        let session = db.acquire().await.unwrap();
        session.insert(User::TABLE, row(1)).await.unwrap();
        session.close().await.unwrap();

        assert!(db.rows(User::TABLE).is_empty());
        assert_eq!(db.stats().rollbacks(), 1);
        assert_eq!(db.stats().open_sessions(), 0);
    }

    #[tokio::test]
    async fn concurrent_updates_of_different_fields_both_survive() {
        let db = InMemoryDatabase::new();
        let seed = db.acquire().await.unwrap();
        seed.insert(User::TABLE, row(1)).await.unwrap();
        seed.commit().await.unwrap();

        let a = db.acquire().await.unwrap();
        let b = db.acquire().await.unwrap();
        let by_id = [User::ID.eq(1_i64).into_condition()];
        let mut rename = FieldMap::new();
        rename.insert(fields::NAME, "B");
        let mut relocate = FieldMap::new();
        relocate.insert(fields::LOCALE, "uk");

        a.update(User::TABLE, &by_id, &rename, false).await.unwrap();
        b.update(User::TABLE, &by_id, &relocate, false).await.unwrap();
        a.commit().await.unwrap();
        b.commit().await.unwrap();

        let stored = &db.rows(User::TABLE)[0];
        assert_eq!(stored.get(fields::NAME), Some(&Value::from("B")));
        assert_eq!(stored.get(fields::LOCALE), Some(&Value::from("uk")));
    }

    #[tokio::test]
    async fn updates_of_rows_deleted_meanwhile_are_dropped() {
        let db = InMemoryDatabase::new();
        let seed = db.acquire().await.unwrap();
        seed.insert(User::TABLE, row(1)).await.unwrap();
        seed.commit().await.unwrap();

        let writer = db.acquire().await.unwrap();
        let remover = db.acquire().await.unwrap();
        let by_id = [User::ID.eq(1_i64).into_condition()];
        let mut rename = FieldMap::new();
        rename.insert(fields::NAME, "B");

        writer.update(User::TABLE, &by_id, &rename, false).await.unwrap();
        remover.delete(User::TABLE, &by_id).await.unwrap();
        remover.commit().await.unwrap();
        writer.commit().await.unwrap();

        assert!(db.rows(User::TABLE).is_empty());
    }

    #[tokio::test]
    async fn closed_pool_refuses_sessions() {
        let db = InMemoryDatabase::new();
        db.close().await;
        assert!(matches!(db.acquire().await, Err(DataError::Acquire(_))));
    }
}
