// In-Memory Store
//
// Reference implementation of the store boundary. Keeps tables,
// splits, properties and written rows in process memory, journals
// every call, and can be told to fail specific operations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Mutation, MutationSink, StoreError, TableOperations};

/// Operation kinds recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Exists,
    Delete,
    Create,
    AddSplits,
    SetProperty,
    Flush,
    Compact,
    Write,
}

impl StoreOp {
    /// Whether the operation changes remote state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, StoreOp::Exists)
    }
}

/// A single journaled call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub op: StoreOp,
    pub table: String,
}

#[derive(Debug, Default, Clone)]
struct TableData {
    splits: BTreeSet<String>,
    properties: BTreeMap<String, String>,
    rows: Vec<Mutation>,
}

#[derive(Debug, Clone)]
struct Fault {
    op: StoreOp,
    table: Option<String>,
    /// Matching calls allowed through before the fault fires.
    skip: usize,
    error: StoreError,
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, TableData>,
    journal: Vec<StoreCall>,
    faults: Vec<Fault>,
}

/// Shared handle; clones observe the same tables.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every future `op` fail with `error`.
    ///
    /// With `table = None` the fault applies to all tables.
    pub fn fail(&self, op: StoreOp, table: Option<&str>, error: StoreError) {
        self.fail_after(op, table, 0, error);
    }

    /// Like `fail`, but lets the first `skip` matching calls succeed.
    pub fn fail_after(&self, op: StoreOp, table: Option<&str>, skip: usize, error: StoreError) {
        self.lock().faults.push(Fault {
            op,
            table: table.map(str::to_string),
            skip,
            error,
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    pub fn journal(&self) -> Vec<StoreCall> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Journaled calls that changed remote state.
    pub fn mutating_calls(&self) -> Vec<StoreCall> {
        self.lock()
            .journal
            .iter()
            .filter(|call| call.op.is_mutation())
            .cloned()
            .collect()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.lock().tables.keys().cloned().collect()
    }

    pub fn splits(&self, table: &str) -> Option<BTreeSet<String>> {
        self.lock().tables.get(table).map(|t| t.splits.clone())
    }

    pub fn properties(&self, table: &str) -> Option<BTreeMap<String, String>> {
        self.lock().tables.get(table).map(|t| t.properties.clone())
    }

    pub fn rows(&self, table: &str) -> Option<Vec<Mutation>> {
        self.lock().tables.get(table).map(|t| t.rows.clone())
    }

    /// Journal the call, then apply `f` unless a fault matches.
    fn call<T>(
        &self,
        op: StoreOp,
        table: &str,
        f: impl FnOnce(&mut BTreeMap<String, TableData>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut inner = self.lock();
        inner.journal.push(StoreCall {
            op,
            table: table.to_string(),
        });

        let fault = inner
            .faults
            .iter_mut()
            .find(|fault| fault.op == op && fault.table.as_deref().map_or(true, |t| t == table));
        if let Some(fault) = fault {
            if fault.skip == 0 {
                return Err(fault.error.clone());
            }
            fault.skip -= 1;
        }

        f(&mut inner.tables)
    }
}

fn table_mut<'a>(
    tables: &'a mut BTreeMap<String, TableData>,
    table: &str,
) -> Result<&'a mut TableData, StoreError> {
    tables
        .get_mut(table)
        .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
}

impl TableOperations for InMemoryStore {
    fn exists(&self, table: &str) -> Result<bool, StoreError> {
        self.call(StoreOp::Exists, table, |tables| Ok(tables.contains_key(table)))
    }

    fn delete(&self, table: &str) -> Result<(), StoreError> {
        self.call(StoreOp::Delete, table, |tables| {
            tables
                .remove(table)
                .map(|_| ())
                .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
        })
    }

    fn create(&self, table: &str) -> Result<(), StoreError> {
        self.call(StoreOp::Create, table, |tables| {
            if tables.contains_key(table) {
                return Err(StoreError::TableExists(table.to_string()));
            }
            tables.insert(table.to_string(), TableData::default());
            Ok(())
        })
    }

    fn add_splits(&self, table: &str, splits: &BTreeSet<String>) -> Result<(), StoreError> {
        self.call(StoreOp::AddSplits, table, |tables| {
            let data = table_mut(tables, table)?;
            data.splits.extend(splits.iter().cloned());
            Ok(())
        })
    }

    fn set_property(&self, table: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.call(StoreOp::SetProperty, table, |tables| {
            let data = table_mut(tables, table)?;
            data.properties.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn flush(&self, table: &str) -> Result<(), StoreError> {
        self.call(StoreOp::Flush, table, |tables| table_mut(tables, table).map(|_| ()))
    }

    fn compact(&self, table: &str) -> Result<(), StoreError> {
        self.call(StoreOp::Compact, table, |tables| table_mut(tables, table).map(|_| ()))
    }
}

impl MutationSink for InMemoryStore {
    fn write(&mut self, table: &str, mutation: Mutation) -> Result<(), StoreError> {
        self.call(StoreOp::Write, table, |tables| {
            table_mut(tables, table)?.rows.push(mutation);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_delete_lifecycle() {
        let store = InMemoryStore::new();
        assert!(!store.exists("t").unwrap());

        store.create("t").unwrap();
        assert!(store.exists("t").unwrap());
        assert_eq!(
            store.create("t").unwrap_err(),
            StoreError::TableExists("t".into())
        );

        store.delete("t").unwrap();
        assert_eq!(
            store.delete("t").unwrap_err(),
            StoreError::TableNotFound("t".into())
        );
    }

    #[test]
    fn faults_are_scoped_to_table() {
        let store = InMemoryStore::new();
        store.fail(
            StoreOp::Create,
            Some("bad"),
            StoreError::Unavailable("down".into()),
        );

        assert!(store.create("good").is_ok());
        assert_eq!(
            store.create("bad").unwrap_err(),
            StoreError::Unavailable("down".into())
        );
    }

    #[test]
    fn delayed_fault_lets_early_calls_through() {
        let store = InMemoryStore::new();
        store.create("t").unwrap();
        store.fail_after(
            StoreOp::Flush,
            Some("t"),
            2,
            StoreError::Rejected("busy".into()),
        );

        assert!(store.flush("t").is_ok());
        assert!(store.flush("t").is_ok());
        assert!(store.flush("t").is_err());
        assert!(store.flush("t").is_err());
    }

    #[test]
    fn journal_separates_reads_from_mutations() {
        let store = InMemoryStore::new();
        store.exists("t").unwrap();
        store.create("t").unwrap();
        store.set_property("t", "k", "v").unwrap();

        assert_eq!(store.journal().len(), 3);
        let ops: Vec<_> = store.mutating_calls().into_iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![StoreOp::Create, StoreOp::SetProperty]);
        assert_eq!(store.properties("t").unwrap()["k"], "v");
    }
}
