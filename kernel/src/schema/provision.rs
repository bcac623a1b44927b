// Schema Provisioning
//
// Brings the store's table set to the state described by a list
// of table specs: create or recreate, pre-split, set the context,
// flush, attach aggregation properties, and optionally compact.
//
// Operations on the same physical table are serialised through
// `TableLocks`; different tables may be provisioned concurrently.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{TableSpec, CONTEXT_PROPERTY, DEFAULT_CONTEXT};
use crate::store::{StoreError, TableOperations};

pub const DEFAULT_TEMP_SUFFIX: &str = "_temp";

/// How failures are handled across a provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailureMode {
    /// The first failure aborts the run.
    #[default]
    Strict,

    /// Failures are logged and recorded as warnings; the failing
    /// table is abandoned and the run moves on.
    FireAndForget,
}

/// Provisioning step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubStep {
    Resolve,
    Exists,
    Delete,
    Create,
    Split,
    Property,
    Flush,
    Binding,
    Compact,
}

impl fmt::Display for SubStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubStep::Resolve => "resolve",
            SubStep::Exists => "exists",
            SubStep::Delete => "delete",
            SubStep::Create => "create",
            SubStep::Split => "split",
            SubStep::Property => "property",
            SubStep::Flush => "flush",
            SubStep::Binding => "binding",
            SubStep::Compact => "compact",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("provisioning `{table}` failed at {sub_step}: {source}")]
    Store {
        table: String,
        sub_step: SubStep,
        #[source]
        source: StoreError,
    },

    #[error("table `{table}` resolves to a name already used in this run")]
    DuplicateTable { table: String },
}

impl ProvisionError {
    pub fn table(&self) -> &str {
        match self {
            ProvisionError::Store { table, .. } | ProvisionError::DuplicateTable { table } => table,
        }
    }

    pub fn sub_step(&self) -> SubStep {
        match self {
            ProvisionError::Store { sub_step, .. } => *sub_step,
            ProvisionError::DuplicateTable { .. } => SubStep::Resolve,
        }
    }

    /// True when the underlying store could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ProvisionError::Store {
                source: StoreError::Unavailable(_),
                ..
            }
        )
    }
}

fn at(table: &str, sub_step: SubStep) -> impl FnOnce(StoreError) -> ProvisionError + '_ {
    move |source| ProvisionError::Store {
        table: table.to_string(),
        sub_step,
        source,
    }
}

/// What provisioning did to one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TableAction {
    /// Already present and not marked for deletion.
    Unchanged,
    Created,
    /// Existed, was dropped and created again.
    Recreated,
    /// Abandoned in fire-and-forget mode.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOutcome {
    pub table: String,
    pub action: TableAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub outcomes: Vec<TableOutcome>,
    pub warnings: Vec<ProvisionError>,
}

impl ProvisionReport {
    pub fn action(&self, table: &str) -> Option<TableAction> {
        self.outcomes
            .iter()
            .find(|o| o.table == table)
            .map(|o| o.action)
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// One mutex per resolved table name.
///
/// Entries are dropped by `release` once no caller holds them, so
/// the map only holds tables currently being provisioned.
#[derive(Debug, Default)]
pub struct TableLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TableLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock handle for `table`, created on first use.
    pub fn handle(&self, table: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Give back a handle from `handle`, pruning the entry if idle.
    pub fn release(&self, table: &str, handle: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one in `handle`.
        if Arc::strong_count(&handle) == 2 {
            locks.remove(table);
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct SchemaProvisioner<T: TableOperations> {
    ops: T,
    temp_suffix: String,
    context: String,
    mode: FailureMode,
    locks: TableLocks,
}

impl<T: TableOperations> SchemaProvisioner<T> {
    pub fn new(ops: T) -> Self {
        Self {
            ops,
            temp_suffix: DEFAULT_TEMP_SUFFIX.to_string(),
            context: DEFAULT_CONTEXT.to_string(),
            mode: FailureMode::Strict,
            locks: TableLocks::new(),
        }
    }

    pub fn with_temp_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.temp_suffix = suffix.into();
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.mode = mode;
        self
    }

    /// Context for specs that do not set their own.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Provision every spec in order.
    ///
    /// Duplicate resolved names are rejected before any store call,
    /// regardless of failure mode.
    pub fn provision(&self, specs: &[TableSpec]) -> Result<ProvisionReport, ProvisionError> {
        let names = self.resolve_all(specs)?;
        let mut report = ProvisionReport::default();

        for (spec, table) in specs.iter().zip(names) {
            let handle = self.locks.handle(&table);
            let result = {
                let _guard = handle.lock().unwrap_or_else(PoisonError::into_inner);
                self.provision_locked(spec, &table, &mut report)
            };
            self.locks.release(&table, handle);

            let action = result?;
            if action != TableAction::Failed {
                info!(table = %table, action = ?action, "table provisioned");
            }
            report.outcomes.push(TableOutcome { table, action });
        }

        Ok(report)
    }

    /// Provision one table while holding its lock.
    fn provision_locked(
        &self,
        spec: &TableSpec,
        table: &str,
        report: &mut ProvisionReport,
    ) -> Result<TableAction, ProvisionError> {
        let action = match self.provision_table(spec, table) {
            Ok(action) => action,
            Err(err) => {
                self.tolerate(err, report)?;
                return Ok(TableAction::Failed);
            }
        };

        if spec.compact_after_create && action != TableAction::Unchanged {
            if let Err(err) = run_compaction(&self.ops, table) {
                self.tolerate(err, report)?;
            }
        }
        Ok(action)
    }

    /// Strict mode propagates; fire-and-forget records a warning.
    fn tolerate(
        &self,
        err: ProvisionError,
        report: &mut ProvisionReport,
    ) -> Result<(), ProvisionError> {
        match self.mode {
            FailureMode::Strict => Err(err),
            FailureMode::FireAndForget => {
                warn!(
                    table = %err.table(),
                    sub_step = %err.sub_step(),
                    error = %err,
                    "provisioning failure ignored"
                );
                report.warnings.push(err);
                Ok(())
            }
        }
    }

    fn resolve_all(&self, specs: &[TableSpec]) -> Result<Vec<String>, ProvisionError> {
        let mut seen = BTreeSet::new();
        specs
            .iter()
            .map(|spec| {
                let table = spec.physical_name(&self.temp_suffix);
                if seen.insert(table.clone()) {
                    Ok(table)
                } else {
                    Err(ProvisionError::DuplicateTable { table })
                }
            })
            .collect()
    }

    fn provision_table(&self, spec: &TableSpec, table: &str) -> Result<TableAction, ProvisionError> {
        let exists = self.ops.exists(table).map_err(at(table, SubStep::Exists))?;
        if exists && !spec.delete_if_exists {
            debug!(table, "table present, nothing to do");
            return Ok(TableAction::Unchanged);
        }

        if exists {
            match self.ops.delete(table) {
                Ok(()) | Err(StoreError::TableNotFound(_)) => {}
                Err(err) => return Err(at(table, SubStep::Delete)(err)),
            }
            debug!(table, "existing table deleted");
        }

        let splits = spec.split_points();
        self.ops.create(table).map_err(at(table, SubStep::Create))?;
        if !splits.is_empty() {
            self.ops
                .add_splits(table, &splits)
                .map_err(at(table, SubStep::Split))?;
        }
        debug!(table, splits = splits.len(), "table created");

        let context = spec.context.as_deref().unwrap_or(&self.context);
        self.ops
            .set_property(table, CONTEXT_PROPERTY, context)
            .map_err(at(table, SubStep::Property))?;

        // Splits must be in effect before any writer starts.
        self.ops.flush(table).map_err(at(table, SubStep::Flush))?;

        if let Some(profile) = &spec.aggregation {
            for (key, value) in profile.properties() {
                self.ops
                    .set_property(table, &key, &value)
                    .map_err(at(table, SubStep::Binding))?;
            }
            debug!(table, group = %profile.group, "aggregation attached");
        }

        Ok(if exists {
            TableAction::Recreated
        } else {
            TableAction::Created
        })
    }
}

fn run_compaction<T: TableOperations + ?Sized>(ops: &T, table: &str) -> Result<(), ProvisionError> {
    ops.flush(table).map_err(at(table, SubStep::Flush))?;
    ops.compact(table).map_err(at(table, SubStep::Compact))
}

/// Flush and fully compact a table.
///
/// In fire-and-forget mode a failure is logged and swallowed.
pub fn compact_table<T: TableOperations + ?Sized>(
    ops: &T,
    table: &str,
    mode: FailureMode,
) -> Result<(), ProvisionError> {
    match (run_compaction(ops, table), mode) {
        (Ok(()), _) => Ok(()),
        (Err(err), FailureMode::FireAndForget) => {
            warn!(table, error = %err, "compaction failed");
            Ok(())
        }
        (Err(err), FailureMode::Strict) => Err(err),
    }
}

/// Set one property on each table, stopping at the first failure.
pub fn set_property_all<T, S>(
    ops: &T,
    tables: &[S],
    key: &str,
    value: &str,
) -> Result<(), ProvisionError>
where
    T: TableOperations + ?Sized,
    S: AsRef<str>,
{
    for table in tables {
        let table = table.as_ref();
        ops.set_property(table, key, value)
            .map_err(at(table, SubStep::Property))?;
    }
    Ok(())
}
