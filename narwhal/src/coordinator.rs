use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{self, MessageBus, ResultEnvelope};
use crate::config::OrchestratorConfig;
use crate::run::{Run, RunId, RunPatch, RunStatus, RunnableKind};
use crate::scheduler::{
    LaunchError, WorkerHandle, WorkerScheduler, WorkerSpec, WORKER_LABEL,
};
use crate::store::{RunFilter, RunStore, RunStoreError};
use crate::worker::{
    ENV_INPUT_VARIABLES, ENV_LOG_CHANNEL, ENV_RESULT_CHANNEL, ENV_RUNNABLE_ID,
    ENV_RUNNABLE_KIND, ENV_RUN_ID,
};

/// Error message recorded when the reaper fails a run whose worker died
/// without writing a terminal status.
pub const WORKER_LOST_ERROR: &str = "worker disappeared";

/// Cooperative shutdown signal shared by the reaper, the cleanup sweep,
/// and the streaming gateways.
///
/// Clones are cheap and all observe the same signal. Cancellation is
/// one-way: once signalled, the token stays cancelled for its lifetime.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    shared: Arc<TokenState>,
}

#[derive(Debug)]
struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal shutdown to every clone of this token.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Whether shutdown has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Suspend until shutdown is signalled; returns immediately if it
    /// already has been.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.shared.notify.notified().await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors surfaced by coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] RunStoreError),
    /// The worker could not be scheduled; the run was moved to `failed`.
    #[error("failed to launch worker for run {run_id}: {message}")]
    Launch { run_id: RunId, message: String },
}

/// Accepts start requests, schedules workers, and reaps orphans.
///
/// Every mutation is a compare-and-set in the run store, so the coordinator
/// tolerates crashes between steps: a partially-launched pending run is
/// reaped after the grace period, and the deterministic launch request id
/// prevents double-scheduling on retry.
pub struct RunCoordinator {
    store: Arc<dyn RunStore>,
    bus: Arc<dyn MessageBus>,
    scheduler: Arc<dyn WorkerScheduler>,
    config: OrchestratorConfig,
    /// First time each active worker was observed as `unknown`.
    unknown_since: Mutex<HashMap<RunId, Instant>>,
}

impl std::fmt::Debug for RunCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn RunStore>,
        bus: Arc<dyn MessageBus>,
        scheduler: Arc<dyn WorkerScheduler>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            bus,
            scheduler,
            config,
            unknown_since: Mutex::new(HashMap::new()),
        }
    }

    /// Deterministic launch request id for a run, stable across retries.
    pub fn launch_request_id(run_id: RunId) -> String {
        format!("run-{run_id}")
    }

    fn worker_spec(&self, run: &Run) -> WorkerSpec {
        let mut env: BTreeMap<String, String> =
            self.config.worker_extra_env.clone();
        env.insert(ENV_RUN_ID.to_string(), run.id.to_string());
        env.insert(ENV_RUNNABLE_ID.to_string(), run.runnable_id.to_string());
        env.insert(
            ENV_RUNNABLE_KIND.to_string(),
            run.runnable_kind.as_str().to_string(),
        );
        env.insert(
            ENV_INPUT_VARIABLES.to_string(),
            Value::Object(run.input_variables.clone()).to_string(),
        );
        env.insert(ENV_LOG_CHANNEL.to_string(), bus::log_channel(run.id));
        env.insert(ENV_RESULT_CHANNEL.to_string(), bus::result_channel(run.id));

        let mut labels = BTreeMap::new();
        labels.insert(WORKER_LABEL.0.to_string(), WORKER_LABEL.1.to_string());
        labels.insert("run_id".to_string(), run.id.to_string());

        WorkerSpec {
            request_id: Self::launch_request_id(run.id),
            image: self.config.worker_image.clone(),
            env,
            secret_names: vec![
                "narwhal-store-credentials".to_string(),
                "narwhal-bus-credentials".to_string(),
            ],
            labels,
            resource_requests: self.config.worker_resource_requests.clone(),
            resource_limits: self.config.worker_resource_limits.clone(),
        }
    }

    /// Start a run: insert a pending record, schedule a worker, stamp the
    /// record running, and return it without waiting for execution.
    pub async fn start(
        &self,
        runnable_kind: RunnableKind,
        runnable_id: Uuid,
        input_variables: serde_json::Map<String, Value>,
    ) -> Result<Run, CoordinatorError> {
        let run = self
            .store
            .insert_pending(runnable_kind, runnable_id, input_variables)
            .await?;
        let run_id = run.id;
        info!(%run_id, kind = %runnable_kind, %runnable_id, "run submitted");
        crate::telemetry::record_run_started(runnable_kind.as_str());

        let spec = self.worker_spec(&run);
        let handle = match self.launch_with_backoff(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                let message = e.to_string();
                warn!(%run_id, "worker launch failed: {message}");
                let _ = self
                    .store
                    .transition(
                        run_id,
                        &[RunStatus::Pending],
                        RunStatus::Failed,
                        RunPatch::failed(&message),
                    )
                    .await;
                self.publish_end(run_id, Some(message.as_str())).await;
                return Err(CoordinatorError::Launch { run_id, message });
            }
        };

        let moved = self
            .store
            .transition(
                run_id,
                &[RunStatus::Pending],
                RunStatus::Running,
                RunPatch::running(handle.as_str()),
            )
            .await?;
        if !moved {
            // A fast worker stamped running (or even finished) first. The
            // existing status wins, but the worker's own stamp carries no
            // handle, so attach it or the reaper cannot watch this worker.
            let current = self.store.fetch(run_id).await?;
            if current.status == RunStatus::Running && current.worker_handle.is_none() {
                let attached = self
                    .store
                    .transition(
                        run_id,
                        &[RunStatus::Running],
                        RunStatus::Running,
                        RunPatch::worker_attached(handle.as_str()),
                    )
                    .await?;
                debug!(%run_id, attached, "pending->running lost to worker; backfilled handle");
            } else {
                debug!(%run_id, status = %current.status, "pending->running transition lost; leaving record as-is");
            }
        }

        Ok(self.store.fetch(run_id).await?)
    }

    async fn launch_with_backoff(
        &self,
        spec: &WorkerSpec,
    ) -> Result<WorkerHandle, LaunchError> {
        let deadline = Instant::now() + self.config.launch_retry_budget;
        let mut delay = Duration::from_millis(250);
        loop {
            match self.scheduler.launch(spec).await {
                Ok(handle) => return Ok(handle),
                Err(LaunchError::Permanent(e)) => {
                    return Err(LaunchError::Permanent(e));
                }
                Err(LaunchError::Transient(e)) => {
                    if Instant::now() + delay >= deadline {
                        return Err(LaunchError::Transient(e));
                    }
                    debug!(
                        request_id = %spec.request_id,
                        "transient launch failure; retrying in {delay:?}: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
            }
        }
    }

    /// Attempt to cancel a run. Terminal runs are left untouched.
    pub async fn cancel(&self, run_id: RunId) -> Result<Run, CoordinatorError> {
        let run = self.store.fetch(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let moved = self
            .store
            .transition(
                run_id,
                RunStatus::ACTIVE,
                RunStatus::Cancelled,
                RunPatch::cancelled(),
            )
            .await?;
        if moved {
            info!(%run_id, "run cancelled");
            crate::telemetry::record_run_completed("cancelled");
            observe_duration(&run, "cancelled");
            self.publish_end(run_id, Some("cancelled")).await;
            if let Some(handle) = &run.worker_handle {
                if let Err(e) = self.scheduler.delete(&WorkerHandle(handle.clone())).await {
                    warn!(%run_id, "worker delete after cancel failed: {e}");
                }
            }
        }

        Ok(self.store.fetch(run_id).await?)
    }

    /// One reaper sweep over all active runs; returns how many were failed.
    ///
    /// The reaper is the sole fallback writer for terminal status when a
    /// worker dies without updating the store. It must run on exactly one
    /// coordinator instance.
    pub async fn reap(&self) -> Result<usize, CoordinatorError> {
        let active = self.store.list_active().await?;
        let mut reaped = 0;

        for run in active {
            let Some(handle) = run.worker_handle.clone().map(WorkerHandle) else {
                // Only a pending run that never got a worker is an orphan
                // here (coordinator died between insert and launch). A
                // handle-less running record means the worker stamped first
                // and the coordinator's backfill is still in flight.
                if run.status == RunStatus::Pending {
                    let age = (chrono::Utc::now() - run.submitted_at)
                        .to_std()
                        .unwrap_or_default();
                    if age >= self.config.reaper_unknown_grace
                        && self.fail_run(&run, WORKER_LOST_ERROR).await
                    {
                        reaped += 1;
                    }
                }
                continue;
            };

            let phase = match self.scheduler.inspect(&handle).await {
                Ok(phase) => phase,
                Err(e) => {
                    warn!(run_id = %run.id, "inspect failed during reap: {e}");
                    continue;
                }
            };

            match phase {
                crate::scheduler::WorkerPhase::Active
                | crate::scheduler::WorkerPhase::Succeeded => {
                    self.unknown_since.lock().remove(&run.id);
                }
                crate::scheduler::WorkerPhase::Failed => {
                    self.unknown_since.lock().remove(&run.id);
                    if self.fail_run(&run, WORKER_LOST_ERROR).await {
                        let _ = self.scheduler.delete(&handle).await;
                        reaped += 1;
                    }
                }
                crate::scheduler::WorkerPhase::Unknown => {
                    let first_seen = {
                        let mut unknowns = self.unknown_since.lock();
                        *unknowns.entry(run.id).or_insert_with(Instant::now)
                    };
                    if first_seen.elapsed() >= self.config.reaper_unknown_grace {
                        self.unknown_since.lock().remove(&run.id);
                        if self.fail_run(&run, WORKER_LOST_ERROR).await {
                            let _ = self.scheduler.delete(&handle).await;
                            reaped += 1;
                        }
                    }
                }
            }
        }

        if reaped > 0 {
            info!(reaped, "reaper sweep moved orphaned runs to failed");
        }
        Ok(reaped)
    }

    async fn fail_run(&self, run: &Run, message: &str) -> bool {
        match self
            .store
            .transition(
                run.id,
                RunStatus::ACTIVE,
                RunStatus::Failed,
                RunPatch::failed(message),
            )
            .await
        {
            Ok(true) => {
                warn!(run_id = %run.id, "run failed: {message}");
                crate::telemetry::record_run_completed("failed");
                observe_duration(run, "failed");
                self.publish_end(run.id, Some(message)).await;
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(run_id = %run.id, "reaper transition failed: {e}");
                false
            }
        }
    }

    async fn publish_end(&self, run_id: RunId, error: Option<&str>) {
        let envelope = match error {
            Some(message) => ResultEnvelope::end_error(message),
            None => ResultEnvelope::end(),
        };
        if let Err(e) = self
            .bus
            .publish(&bus::result_channel(run_id), envelope.to_bytes())
            .await
        {
            debug!(%run_id, "end envelope publish failed: {e}");
        }
    }

    /// One cleanup sweep deleting worker resources of old terminal runs.
    pub async fn cleanup_workers(&self) -> Result<usize, CoordinatorError> {
        let mut deleted = 0;
        for status in [RunStatus::Completed, RunStatus::Failed, RunStatus::Cancelled] {
            let runs = self
                .store
                .list(RunFilter {
                    runnable_id: None,
                    status: Some(status),
                })
                .await?;
            for run in runs {
                let Some(handle) = run.worker_handle.clone().map(WorkerHandle) else {
                    continue;
                };
                let Some(ended_at) = run.ended_at else {
                    continue;
                };
                let age = (chrono::Utc::now() - ended_at).to_std().unwrap_or_default();
                if age < self.config.cleanup_completed_age {
                    continue;
                }
                // Delete is idempotent; re-deleting an already-removed
                // resource on later sweeps is a no-op.
                match self.scheduler.delete(&handle).await {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!(run_id = %run.id, "cleanup delete failed: {e}"),
                }
            }
        }
        Ok(deleted)
    }

    /// Spawn the periodic reaper sweep.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        shutdown: ShutdownToken,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let period = coordinator.config.reaper_period;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("reaper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(period) => {
                        if let Err(e) = coordinator.reap().await {
                            warn!("reaper sweep error: {e}");
                        }
                    }
                }
            }
        })
    }

    /// Spawn the periodic worker-resource cleanup sweep.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        shutdown: ShutdownToken,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let period = coordinator.config.cleanup_period;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("cleanup sweep shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(period) => {
                        match coordinator.cleanup_workers().await {
                            Ok(0) => {}
                            Ok(n) => debug!(deleted = n, "cleanup sweep removed worker resources"),
                            Err(e) => warn!("cleanup sweep error: {e}"),
                        }
                    }
                }
            }
        })
    }
}

/// Record how long a run spent executing, when it ever started.
fn observe_duration(run: &Run, status: &str) {
    if let Some(started_at) = run.started_at {
        let elapsed = (chrono::Utc::now() - started_at)
            .to_std()
            .unwrap_or_default();
        crate::telemetry::observe_run_duration(status, elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_launch_request_id_is_deterministic() {
        let run_id = RunId::new();
        assert_eq!(
            RunCoordinator::launch_request_id(run_id),
            RunCoordinator::launch_request_id(run_id),
        );
        assert_eq!(
            RunCoordinator::launch_request_id(run_id),
            format!("run-{run_id}")
        );
    }

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());

        timeout(Duration::from_secs(1), clone1.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = token.clone();

        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter did not observe cancellation")
            .expect("waiter panicked");
    }

    #[tokio::test]
    async fn test_shutdown_token_default_not_cancelled() {
        let token = ShutdownToken::default();
        assert!(!token.is_cancelled());
    }
}
