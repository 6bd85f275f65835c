//! Derived-table writes buffered for one propagation.
//!
//! Policies evaluated during a propagation read each other's new tables
//! through this overlay. Nothing reaches the fact store until the whole
//! propagation has converged.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use accord_datalog::{FactStore, Row, TableId, TableSource};

/// New contents of one derived table.
#[derive(Debug, Clone)]
pub(crate) struct Staged {
    pub(crate) arity: usize,
    pub(crate) rows: Arc<HashSet<Row>>,
}

/// Overlay of staged tables on top of the store. `None` marks a drop.
pub(crate) struct StagedTables<'s> {
    store: &'s FactStore,
    tables: BTreeMap<TableId, Option<Staged>>,
}

impl<'s> StagedTables<'s> {
    pub(crate) fn new(store: &'s FactStore) -> Self {
        Self {
            store,
            tables: BTreeMap::new(),
        }
    }

    pub(crate) fn rows(&self, id: &TableId) -> Option<Arc<HashSet<Row>>> {
        match self.tables.get(id) {
            Some(staged) => staged.as_ref().map(|s| s.rows.clone()),
            None => self.store.rows(id),
        }
    }

    fn arity(&self, id: &TableId) -> Option<usize> {
        match self.tables.get(id) {
            Some(staged) => staged.as_ref().map(|s| s.arity),
            None => self.store.arity(id),
        }
    }

    /// Tables of `owner` as this overlay sees them.
    pub(crate) fn tables(&self, owner: &str) -> BTreeSet<TableId> {
        let mut tables: BTreeSet<TableId> = self.store.tables(owner).into_iter().collect();
        for (id, staged) in self.tables.range(TableId::new(owner, "")..) {
            if id.owner != owner {
                break;
            }
            if staged.is_some() {
                tables.insert(id.clone());
            } else {
                tables.remove(id);
            }
        }
        tables
    }

    /// Stage new contents for a table. Returns whether a reader would see a
    /// difference.
    pub(crate) fn replace(&mut self, id: TableId, arity: usize, rows: HashSet<Row>) -> bool {
        let changed = match (self.arity(&id), self.rows(&id)) {
            (Some(current_arity), Some(current)) if current_arity == arity => *current != rows,
            (Some(_), Some(current)) => !current.is_empty() || !rows.is_empty(),
            _ => !rows.is_empty(),
        };
        self.tables.insert(
            id,
            Some(Staged {
                arity,
                rows: Arc::new(rows),
            }),
        );
        changed
    }

    /// Stage a drop. Returns whether the table had rows.
    pub(crate) fn drop_table(&mut self, id: TableId) -> bool {
        let had_rows = self.rows(&id).is_some_and(|rows| !rows.is_empty());
        self.tables.insert(id, None);
        had_rows
    }

    pub(crate) fn into_tables(self) -> BTreeMap<TableId, Option<Staged>> {
        self.tables
    }
}

impl TableSource for StagedTables<'_> {
    fn rows(&self, table: &TableId) -> Option<Arc<HashSet<Row>>> {
        StagedTables::rows(self, table)
    }
}
