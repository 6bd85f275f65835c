//! Concurrent table storage.
//!
//! The `FactStore` maintains:
//! - One row set per (owner, table), shared copy-on-write behind an `Arc`
//! - The schema each table was created with
//! - A broadcast channel announcing every effective change
//!
//! Writers hold the table's shard lock only while swapping in the new row
//! set; readers clone the `Arc` and never observe a half-applied diff.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

use crate::eval::TableSource;
use crate::schema::TableSchema;
use crate::value::{Row, TableId};

/// Default capacity of the change channel.
pub const DEFAULT_CHANGE_CAPACITY: usize = 1024;

/// Errors from table updates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("unknown table: {0}")]
    UnknownTable(TableId),

    #[error("row for {table} has {actual} columns, expected {expected}")]
    ArityMismatch {
        table: TableId,
        expected: usize,
        actual: usize,
    },

    #[error("table {table} already exists with {existing} columns, not {requested}")]
    SchemaConflict {
        table: TableId,
        existing: usize,
        requested: usize,
    },
}

/// Rows to insert into and delete from one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub inserts: Vec<Row>,
    pub deletes: Vec<Row>,
}

impl Diff {
    pub fn inserts(rows: impl IntoIterator<Item = Row>) -> Self {
        Self {
            inserts: rows.into_iter().collect(),
            deletes: Vec::new(),
        }
    }

    pub fn deletes(rows: impl IntoIterator<Item = Row>) -> Self {
        Self {
            inserts: Vec::new(),
            deletes: rows.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }
}

/// The effective change a diff made to a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChange {
    pub table: TableId,
    pub inserted: Vec<Row>,
    pub deleted: Vec<Row>,
}

impl TableChange {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Debug, Clone)]
struct TableEntry {
    schema: TableSchema,
    rows: Arc<HashSet<Row>>,
}

/// Mapping from table identity to a set of rows.
#[derive(Debug)]
pub struct FactStore {
    tables: DashMap<TableId, TableEntry>,
    changes: broadcast::Sender<TableChange>,
}

impl Default for FactStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHANGE_CAPACITY)
    }
}

impl FactStore {
    pub fn new(change_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_capacity.max(1));
        Self {
            tables: DashMap::new(),
            changes,
        }
    }

    /// Subscribe to effective table changes.
    pub fn subscribe(&self) -> broadcast::Receiver<TableChange> {
        self.changes.subscribe()
    }

    fn broadcast(&self, change: &TableChange) {
        if self.changes.send(change.clone()).is_err() {
            trace!(table = %change.table, "no subscribers for table change");
        }
    }

    /// Create a table if it does not exist. An existing table keeps its
    /// schema; asking for a different column count is an error.
    pub fn ensure_table(&self, table: &TableId, schema: TableSchema) -> Result<(), StoreError> {
        let entry = self.tables.entry(table.clone()).or_insert_with(|| TableEntry {
            schema: schema.clone(),
            rows: Arc::new(HashSet::new()),
        });
        if entry.schema.arity() != schema.arity() {
            return Err(StoreError::SchemaConflict {
                table: table.clone(),
                existing: entry.schema.arity(),
                requested: schema.arity(),
            });
        }
        Ok(())
    }

    pub fn contains(&self, table: &TableId) -> bool {
        self.tables.contains_key(table)
    }

    pub fn schema(&self, table: &TableId) -> Option<TableSchema> {
        self.tables.get(table).map(|e| e.schema.clone())
    }

    pub fn arity(&self, table: &TableId) -> Option<usize> {
        self.tables.get(table).map(|e| e.schema.arity())
    }

    /// Snapshot of a table's rows.
    pub fn rows(&self, table: &TableId) -> Option<Arc<HashSet<Row>>> {
        self.tables.get(table).map(|e| Arc::clone(&e.rows))
    }

    /// Tables owned by `owner`, sorted by name.
    pub fn tables(&self, owner: &str) -> Vec<TableId> {
        let mut tables: Vec<TableId> = self
            .tables
            .iter()
            .filter(|e| e.key().owner == owner)
            .map(|e| e.key().clone())
            .collect();
        tables.sort();
        tables
    }

    /// Consistent snapshots of several tables. Missing tables are omitted.
    pub fn snapshot<'a>(&self, tables: impl IntoIterator<Item = &'a TableId>) -> Snapshot {
        let tables = tables
            .into_iter()
            .filter_map(|id| self.rows(id).map(|rows| (id.clone(), rows)))
            .collect();
        Snapshot { tables }
    }

    /// Apply deletes then inserts. Inserting a present row or deleting an
    /// absent one is a no-op. Returns the effective change, or `None` when
    /// nothing changed.
    pub fn apply_diff(&self, table: &TableId, diff: Diff) -> Result<Option<TableChange>, StoreError> {
        let change = {
            let mut entry = self
                .tables
                .get_mut(table)
                .ok_or_else(|| StoreError::UnknownTable(table.clone()))?;

            let arity = entry.schema.arity();
            if let Some(row) = diff
                .inserts
                .iter()
                .chain(diff.deletes.iter())
                .find(|row| row.arity() != arity)
            {
                return Err(StoreError::ArityMismatch {
                    table: table.clone(),
                    expected: arity,
                    actual: row.arity(),
                });
            }

            let previous = Arc::clone(&entry.rows);
            let mut rows = (*previous).clone();
            for row in &diff.deletes {
                rows.remove(row);
            }
            for row in &diff.inserts {
                rows.insert(row.clone());
            }

            let mut seen = HashSet::new();
            let inserted: Vec<Row> = diff
                .inserts
                .into_iter()
                .filter(|row| !previous.contains(row) && seen.insert(row.clone()))
                .collect();
            let deleted: Vec<Row> = diff
                .deletes
                .into_iter()
                .filter(|row| previous.contains(row) && !rows.contains(row) && seen.insert(row.clone()))
                .collect();

            if inserted.is_empty() && deleted.is_empty() {
                return Ok(None);
            }
            entry.rows = Arc::new(rows);
            TableChange {
                table: table.clone(),
                inserted,
                deleted,
            }
        };

        trace!(
            table = %table,
            inserted = change.inserted.len(),
            deleted = change.deleted.len(),
            "table changed"
        );
        self.broadcast(&change);
        Ok(Some(change))
    }

    /// Replace a table's contents, applying only the difference.
    pub fn replace(
        &self,
        table: &TableId,
        rows: impl IntoIterator<Item = Row>,
    ) -> Result<Option<TableChange>, StoreError> {
        let current = self
            .rows(table)
            .ok_or_else(|| StoreError::UnknownTable(table.clone()))?;
        let next: HashSet<Row> = rows.into_iter().collect();
        let diff = Diff {
            inserts: next.difference(&current).cloned().collect(),
            deletes: current.difference(&next).cloned().collect(),
        };
        self.apply_diff(table, diff)
    }

    /// Check that `table` exists and every row fits its schema.
    fn check<'r>(&self, table: &TableId, rows: impl IntoIterator<Item = &'r Row>) -> Result<(), StoreError> {
        let arity = self
            .arity(table)
            .ok_or_else(|| StoreError::UnknownTable(table.clone()))?;
        match rows.into_iter().find(|row| row.arity() != arity) {
            Some(row) => Err(StoreError::ArityMismatch {
                table: table.clone(),
                expected: arity,
                actual: row.arity(),
            }),
            None => Ok(()),
        }
    }

    /// Apply diffs to several tables. Every diff is checked before any table
    /// is written, so a rejected batch leaves the store untouched.
    ///
    /// Callers that drop tables must not do so while a batch is applied.
    pub fn apply_all(&self, diffs: Vec<(TableId, Diff)>) -> Result<Vec<TableChange>, StoreError> {
        for (table, diff) in &diffs {
            self.check(table, diff.inserts.iter().chain(&diff.deletes))?;
        }
        let mut changes = Vec::new();
        for (table, diff) in diffs {
            changes.extend(self.apply_diff(&table, diff)?);
        }
        Ok(changes)
    }

    /// Replace the contents of several tables, checked like [`Self::apply_all`].
    pub fn replace_all(&self, tables: Vec<(TableId, Vec<Row>)>) -> Result<Vec<TableChange>, StoreError> {
        for (table, rows) in &tables {
            self.check(table, rows)?;
        }
        let mut changes = Vec::new();
        for (table, rows) in tables {
            changes.extend(self.replace(&table, rows)?);
        }
        Ok(changes)
    }

    /// Remove a table, reporting its rows as deleted.
    pub fn drop_table(&self, table: &TableId) -> Option<TableChange> {
        let (_, entry) = self.tables.remove(table)?;
        let change = TableChange {
            table: table.clone(),
            inserted: Vec::new(),
            deleted: entry.rows.iter().cloned().collect(),
        };
        if !change.is_empty() {
            self.broadcast(&change);
        }
        Some(change)
    }

    /// Remove every table of an owner.
    pub fn drop_owner(&self, owner: &str) -> Vec<TableChange> {
        self.tables(owner)
            .iter()
            .filter_map(|table| self.drop_table(table))
            .collect()
    }

    /// Row counts of every table, for diagnostics.
    pub fn sizes(&self) -> HashMap<TableId, usize> {
        self.tables
            .iter()
            .map(|e| (e.key().clone(), e.rows.len()))
            .collect()
    }
}

impl TableSource for FactStore {
    fn rows(&self, table: &TableId) -> Option<Arc<HashSet<Row>>> {
        FactStore::rows(self, table)
    }
}

/// Point-in-time view of a set of tables.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    tables: HashMap<TableId, Arc<HashSet<Row>>>,
}

impl Snapshot {
    pub fn insert(&mut self, table: TableId, rows: impl IntoIterator<Item = Row>) {
        self.tables.insert(table, Arc::new(rows.into_iter().collect()));
    }
}

impl TableSource for Snapshot {
    fn rows(&self, table: &TableId) -> Option<Arc<HashSet<Row>>> {
        self.tables.get(table).cloned()
    }
}
