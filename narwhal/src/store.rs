use async_trait::async_trait;
use uuid::Uuid;

use crate::run::{Run, RunId, RunPatch, RunStatus, RunnableKind};

/// Errors surfaced by run store backends.
#[derive(Debug, thiserror::Error)]
pub enum RunStoreError {
    /// No record exists for the requested run id.
    #[error("run {0} not found")]
    NotFound(RunId),
    /// An insert collided with an existing id after bounded retries.
    #[error("run id conflict for {0}")]
    Conflict(RunId),
    /// The backend failed; retryable at the caller's discretion.
    #[error("run store backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Filter for listing runs.
///
/// Both fields are optional; an empty filter matches everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunFilter {
    /// Restrict to runs of a specific agent or team configuration.
    pub runnable_id: Option<Uuid>,
    /// Restrict to runs in a specific status.
    pub status: Option<RunStatus>,
}

impl RunFilter {
    /// Whether a record matches this filter.
    pub fn matches(&self, run: &Run) -> bool {
        if let Some(rid) = self.runnable_id {
            if run.runnable_id != rid {
                return false;
            }
        }
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        true
    }
}

/// Durable, transactional persistence of run records.
///
/// The store is the sole source of truth for status transitions visible
/// outside the subsystem. All mutations after insert go through
/// [`RunStore::transition`], a compare-and-set keyed on the current status;
/// concurrent transitions on the same id are serialised by the backend and
/// losers observe a `false` return.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new record with `status = pending` and `submitted_at = now`.
    ///
    /// Id collisions are retried internally; [`RunStoreError::Conflict`] is
    /// returned only if retries are exhausted.
    async fn insert_pending(
        &self,
        runnable_kind: RunnableKind,
        runnable_id: Uuid,
        input_variables: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Run, RunStoreError>;

    /// Compare-and-set status transition.
    ///
    /// Mutates the record only if its current status is one of `expected`,
    /// applying `patch` atomically with the status change. Returns whether
    /// the transition occurred; a successful return means the write is
    /// durable. A `false` return is not an error: another writer moved the
    /// status first and the caller should re-read.
    async fn transition(
        &self,
        id: RunId,
        expected: &[RunStatus],
        next: RunStatus,
        patch: RunPatch,
    ) -> Result<bool, RunStoreError>;

    /// Fetch a single record.
    async fn fetch(&self, id: RunId) -> Result<Run, RunStoreError>;

    /// List records matching the filter, newest first.
    async fn list(&self, filter: RunFilter) -> Result<Vec<Run>, RunStoreError>;

    /// All records with a non-terminal status, as a point-in-time snapshot.
    ///
    /// Used by the reaper; runs that go terminal after the snapshot is taken
    /// simply lose the subsequent compare-and-set.
    async fn list_active(&self) -> Result<Vec<Run>, RunStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::Run;

    #[test]
    fn test_filter_matches() {
        let run = Run::pending(
            RunnableKind::Agent,
            Uuid::now_v7(),
            serde_json::Map::new(),
        );

        assert!(RunFilter::default().matches(&run));
        assert!(RunFilter {
            runnable_id: Some(run.runnable_id),
            status: Some(RunStatus::Pending),
        }
        .matches(&run));
        assert!(!RunFilter {
            runnable_id: Some(Uuid::now_v7()),
            status: None,
        }
        .matches(&run));
        assert!(!RunFilter {
            runnable_id: None,
            status: Some(RunStatus::Running),
        }
        .matches(&run));
    }
}
