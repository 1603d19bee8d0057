//! Field-level change tracking for data-transfer records.
//!
//! A tracked record routes every assignment through [`ChangeTracker::record`].
//! Two views are kept:
//!
//! - `state`: every field ever assigned, construction included, in first
//!   assignment order with the latest value;
//! - `changes`: only the assignments made since the record was last marked
//!   loaded.
//!
//! Records built from a stored row or a cache payload are marked loaded as the
//! last construction step, so their `changes` start empty while `state` already
//! holds the full row.

use crate::value::{FieldMap, Value};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeTracker {
    state: FieldMap,
    changes: FieldMap,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, field: &'static str, value: impl Into<Value>) {
        let value = value.into();
        self.state.insert(field, value.clone());
        self.changes.insert(field, value);
    }

    pub fn state(&self) -> &FieldMap {
        &self.state
    }

    pub fn changes(&self) -> &FieldMap {
        &self.changes
    }

    pub fn is_dirty(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Forget pending changes; `state` is left untouched.
    pub fn mark_loaded(&mut self) {
        self.changes.clear();
    }
}
