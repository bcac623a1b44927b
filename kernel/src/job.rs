// Prep Job Driver
//
// Runs the bootstrap stage end to end:
// status → provision → merge → commit → status
//
// Merge output is buffered and only committed once the whole
// stream has been consumed without a fatal error.

use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, PrepConfig};
use crate::merge::{ConsolidationMerger, MergeError, MergeReport};
use crate::schema::{ProvisionError, ProvisionReport, SchemaProvisioner};
use crate::status::{JobStatus, RunId, StatusError, StatusNotifier};
use crate::store::{MutationBuffer, MutationSink, StoreError, TableOperations};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error("commit failed: {0}")]
    Commit(#[from] StoreError),

    #[error("status: {0}")]
    Status(#[from] StatusError),

    /// Valid groups were committed; these type keys were not.
    #[error("unknown metadata types: {0:?}")]
    RejectedGroups(Vec<String>),
}

#[derive(Debug)]
pub struct JobOutcome {
    pub run_id: RunId,
    pub provision: ProvisionReport,
    pub merge: MergeReport,
    pub committed: usize,
}

/// Run one prep job against `ops`, writing consolidated records to `sink`.
pub fn run_prep_job<T, S, I, N>(
    config: &PrepConfig,
    ops: T,
    sink: &mut S,
    fragments: I,
    notifier: &mut N,
) -> Result<JobOutcome, JobError>
where
    T: TableOperations,
    S: MutationSink + ?Sized,
    I: IntoIterator<Item = (String, Vec<u8>)>,
    N: StatusNotifier + ?Sized,
{
    let run_id = RunId::new();
    info!(%run_id, tables = config.tables.len(), "prep job started");

    // Every error, including a failed status update, ends in an attempt to report `Failed`.
    let result = notifier
        .update(run_id, JobStatus::Running)
        .map_err(JobError::from)
        .and_then(|()| execute(run_id, config, ops, sink, fragments))
        .and_then(|outcome| {
            notifier.update(run_id, JobStatus::Succeeded)?;
            Ok(outcome)
        });

    match result {
        Ok(outcome) => {
            info!(%run_id, committed = outcome.committed, "prep job succeeded");
            Ok(outcome)
        }
        Err(err) => {
            error!(%run_id, error = %err, "prep job failed");
            if let Err(status_err) = notifier.update(run_id, JobStatus::Failed) {
                warn!(%run_id, error = %status_err, "could not report failure");
            }
            Err(err)
        }
    }
}

fn execute<T, S, I>(
    run_id: RunId,
    config: &PrepConfig,
    ops: T,
    sink: &mut S,
    fragments: I,
) -> Result<JobOutcome, JobError>
where
    T: TableOperations,
    S: MutationSink + ?Sized,
    I: IntoIterator<Item = (String, Vec<u8>)>,
{
    config.validate()?;

    let provisioner = SchemaProvisioner::new(ops)
        .with_context(config.context.as_str())
        .with_temp_suffix(config.temp_suffix.as_str())
        .with_failure_mode(config.failure_mode);
    let provision = provisioner.provision(&config.tables)?;

    let merger = ConsolidationMerger::new(config.metadata_target());
    let mut buffer = MutationBuffer::new();
    let merge = merger.merge(fragments, &mut buffer)?;
    debug!(%run_id, pending = buffer.len(), "committing merge output");
    let committed = buffer.commit(sink)?;

    if !merge.is_clean() {
        return Err(JobError::RejectedGroups(merge.rejected_type_keys()));
    }

    Ok(JobOutcome {
        run_id,
        provision,
        merge,
        committed,
    })
}
