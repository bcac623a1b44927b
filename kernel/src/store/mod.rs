// Store Client Boundary
//
// Defines the contract the kernel expects from the sharded
// key-value store. Implementations may talk to a real cluster,
// a test double, etc.
//
// This module defines *interfaces only*, plus the mutation type
// written through the sink.

pub mod memory;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub use memory::{InMemoryStore, StoreCall, StoreOp};

/// Errors surfaced by the store client.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    /// Transport-level failure. Never retried inside the kernel.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("table `{0}` not found")]
    TableNotFound(String),

    #[error("table `{0}` already exists")]
    TableExists(String),

    #[error("store rejected operation: {0}")]
    Rejected(String),
}

/// Schema-level operations on the store.
///
/// Properties required from implementations:
/// - Calls are synchronous and may be slow
/// - `add_splits` receives a sorted set
/// - Timeouts and retries are the implementation's concern
pub trait TableOperations: Send + Sync {
    fn exists(&self, table: &str) -> Result<bool, StoreError>;

    fn delete(&self, table: &str) -> Result<(), StoreError>;

    fn create(&self, table: &str) -> Result<(), StoreError>;

    fn add_splits(&self, table: &str, splits: &BTreeSet<String>) -> Result<(), StoreError>;

    fn set_property(&self, table: &str, key: &str, value: &str) -> Result<(), StoreError>;

    fn flush(&self, table: &str) -> Result<(), StoreError>;

    /// Full major compaction of the table.
    fn compact(&self, table: &str) -> Result<(), StoreError>;
}

/// One cell of a row mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub family: String,
    pub qualifier: String,
    pub value: Vec<u8>,
}

/// A set of cell writes against a single row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub row: String,
    pub cells: Vec<Cell>,
}

impl Mutation {
    pub fn new(row: impl Into<String>) -> Self {
        Self {
            row: row.into(),
            cells: Vec::new(),
        }
    }

    pub fn put(
        mut self,
        family: impl Into<String>,
        qualifier: impl Into<String>,
        value: Vec<u8>,
    ) -> Self {
        self.cells.push(Cell {
            family: family.into(),
            qualifier: qualifier.into(),
            value,
        });
        self
    }
}

/// Downstream writer for consolidated records.
pub trait MutationSink {
    fn write(&mut self, table: &str, mutation: Mutation) -> Result<(), StoreError>;
}

/// Sink that holds writes until they are explicitly committed.
///
/// Dropping the buffer discards everything written to it.
#[derive(Debug, Default)]
pub struct MutationBuffer {
    pending: Vec<(String, Mutation)>,
}

impl MutationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &(String, Mutation)> {
        self.pending.iter()
    }

    /// Forward every buffered write to `sink`, in write order.
    pub fn commit<S: MutationSink + ?Sized>(self, sink: &mut S) -> Result<usize, StoreError> {
        let count = self.pending.len();
        for (table, mutation) in self.pending {
            sink.write(&table, mutation)?;
        }
        Ok(count)
    }
}

impl MutationSink for MutationBuffer {
    fn write(&mut self, table: &str, mutation: Mutation) -> Result<(), StoreError> {
        self.pending.push((table.to_string(), mutation));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_commits_in_write_order() {
        let store = InMemoryStore::default();
        store.create("meta_temp").unwrap();

        let mut buffer = MutationBuffer::new();
        buffer
            .write("meta_temp", Mutation::new("a").put("f", "q", b"1".to_vec()))
            .unwrap();
        buffer
            .write("meta_temp", Mutation::new("b").put("f", "q", b"2".to_vec()))
            .unwrap();
        assert_eq!(buffer.len(), 2);
        assert!(store.rows("meta_temp").unwrap().is_empty());

        let mut sink = store.clone();
        assert_eq!(buffer.commit(&mut sink).unwrap(), 2);

        let rows: Vec<_> = store
            .rows("meta_temp")
            .unwrap()
            .into_iter()
            .map(|m| m.row)
            .collect();
        assert_eq!(rows, vec!["a", "b"]);
    }

    #[test]
    fn commit_to_missing_table_fails() {
        let store = InMemoryStore::default();
        let mut buffer = MutationBuffer::new();
        buffer.write("missing", Mutation::new("a")).unwrap();

        let mut sink = store.clone();
        let err = buffer.commit(&mut sink).unwrap_err();
        assert_eq!(err, StoreError::TableNotFound("missing".into()));
    }
}
