use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use narwhal::run::{Run, RunId, RunPatch, RunStatus, RunnableKind};
use narwhal::store::{RunFilter, RunStore, RunStoreError};

/// In-memory run store with the same compare-and-set semantics as the
/// postgres backend. Transitions on the same id are serialised by a single
/// lock, so losers observe a `false` return exactly as they would in
/// production.
#[derive(Clone, Default)]
pub struct InMemoryRunStore {
    runs: Arc<Mutex<HashMap<RunId, Run>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing the insert path.
    pub fn put(&self, run: Run) {
        self.runs.lock().insert(run.id, run);
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert_pending(
        &self,
        runnable_kind: RunnableKind,
        runnable_id: Uuid,
        input_variables: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Run, RunStoreError> {
        let run = Run::pending(runnable_kind, runnable_id, input_variables);
        self.runs.lock().insert(run.id, run.clone());
        Ok(run)
    }

    async fn transition(
        &self,
        id: RunId,
        expected: &[RunStatus],
        next: RunStatus,
        patch: RunPatch,
    ) -> Result<bool, RunStoreError> {
        let mut runs = self.runs.lock();
        let run = runs.get_mut(&id).ok_or(RunStoreError::NotFound(id))?;
        if !expected.contains(&run.status) {
            return Ok(false);
        }
        patch.apply(run, next);
        Ok(true)
    }

    async fn fetch(&self, id: RunId) -> Result<Run, RunStoreError> {
        self.runs
            .lock()
            .get(&id)
            .cloned()
            .ok_or(RunStoreError::NotFound(id))
    }

    async fn list(&self, filter: RunFilter) -> Result<Vec<Run>, RunStoreError> {
        let mut runs: Vec<Run> = self
            .runs
            .lock()
            .values()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(runs)
    }

    async fn list_active(&self) -> Result<Vec<Run>, RunStoreError> {
        let mut runs: Vec<Run> = self
            .runs
            .lock()
            .values()
            .filter(|run| !run.status.is_terminal())
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(runs)
    }
}
