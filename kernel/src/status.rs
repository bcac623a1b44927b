// Job Status Reporting
//
// The driver reports a terminal outcome through a notifier; where
// that status ends up is the notifier's business.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one prep run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Failed,
    Succeeded,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

/// Serialized form of a status update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub run_id: RunId,
    pub status: JobStatus,
}

#[derive(Debug, thiserror::Error)]
#[error("status update to {status:?} failed: {reason}")]
pub struct StatusError {
    pub status: JobStatus,
    pub reason: String,
}

pub trait StatusNotifier {
    fn update(&mut self, run_id: RunId, status: JobStatus) -> Result<(), StatusError>;
}

/// Keeps every update in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub history: Vec<StatusRecord>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        self.history.iter().map(|r| r.status).collect()
    }

    pub fn last(&self) -> Option<JobStatus> {
        self.history.last().map(|r| r.status)
    }
}

impl StatusNotifier for RecordingNotifier {
    fn update(&mut self, run_id: RunId, status: JobStatus) -> Result<(), StatusError> {
        self.history.push(StatusRecord { run_id, status });
        Ok(())
    }
}
