use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ResourceBounds;

/// Label attached to every worker resource so sweeps can select them.
pub const WORKER_LABEL: (&str, &str) = ("app", "narwhal-run-worker");

/// Opaque identifier of a worker resource at the scheduler.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerHandle(pub String);

impl WorkerHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WorkerHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Observed lifecycle phase of a worker resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPhase {
    /// The worker exists and has not reached a terminal state.
    Active,
    /// The worker exited successfully.
    Succeeded,
    /// The worker exited with a failure.
    Failed,
    /// The scheduler has no record of the worker.
    Unknown,
}

/// Specification for a one-shot worker.
///
/// `request_id` is caller-supplied and deterministic so launch retries are
/// idempotent: launching the same request id twice yields at most one
/// worker. Credentials are referenced by secret name, never inlined.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Idempotency key for this launch.
    pub request_id: String,
    /// Worker image reference.
    pub image: String,
    /// Plain environment passed to the worker.
    pub env: BTreeMap<String, String>,
    /// Names of secrets to mount for credentialed connections.
    pub secret_names: Vec<String>,
    /// Labels attached to the worker resource.
    pub labels: BTreeMap<String, String>,
    /// Resource requests.
    pub resource_requests: ResourceBounds,
    /// Resource limits.
    pub resource_limits: ResourceBounds,
}

/// Errors from launching a worker.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Retryable with backoff (scheduler briefly unreachable, quota churn).
    #[error("transient launch failure: {0}")]
    Transient(#[source] anyhow::Error),
    /// Not retryable (bad image reference, auth, malformed spec).
    #[error("permanent launch failure: {0}")]
    Permanent(#[source] anyhow::Error),
}

/// Thin contract over an external container scheduler.
///
/// Implementations hold no business logic; retries, backoff, and terminal
/// bookkeeping belong to the coordinator. All three operations honour
/// caller cancellation by being short-lived single calls.
#[async_trait]
pub trait WorkerScheduler: Send + Sync {
    /// Create a one-shot worker. Idempotent keyed on `spec.request_id`.
    async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerHandle, LaunchError>;

    /// Observe the current phase of a worker.
    ///
    /// `Unknown` for a handle previously observed as existing is treated as
    /// failed by the reaper only after a grace period.
    async fn inspect(&self, handle: &WorkerHandle) -> anyhow::Result<WorkerPhase>;

    /// Tear down a worker resource. Idempotent.
    async fn delete(&self, handle: &WorkerHandle) -> anyhow::Result<()>;
}

/// Scheduler that runs workers as local child processes.
///
/// Single-node stand-in for a cluster scheduler: the image reference is
/// interpreted as the worker executable path. Cluster implementations (one
/// Job per run on Kubernetes and the like) live behind [`WorkerScheduler`]
/// and are a deployment concern.
pub struct LocalProcessScheduler {
    workers: Arc<Mutex<HashMap<String, Child>>>,
}

impl Default for LocalProcessScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalProcessScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcessScheduler").finish_non_exhaustive()
    }
}

impl LocalProcessScheduler {
    pub fn new() -> Self {
        Self {
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl WorkerScheduler for LocalProcessScheduler {
    async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerHandle, LaunchError> {
        let mut workers = self.workers.lock().await;
        if workers.contains_key(&spec.request_id) {
            debug!(request_id = %spec.request_id, "launch replayed; reusing existing worker");
            return Ok(WorkerHandle(spec.request_id.clone()));
        }

        let child = Command::new(&spec.image)
            .envs(spec.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    LaunchError::Permanent(e.into())
                }
                _ => LaunchError::Transient(e.into()),
            })?;

        info!(request_id = %spec.request_id, pid = child.id(), "spawned local worker process");
        workers.insert(spec.request_id.clone(), child);
        Ok(WorkerHandle(spec.request_id.clone()))
    }

    async fn inspect(&self, handle: &WorkerHandle) -> anyhow::Result<WorkerPhase> {
        let mut workers = self.workers.lock().await;
        let Some(child) = workers.get_mut(&handle.0) else {
            return Ok(WorkerPhase::Unknown);
        };
        match child.try_wait()? {
            None => Ok(WorkerPhase::Active),
            Some(status) if status.success() => Ok(WorkerPhase::Succeeded),
            Some(status) => {
                debug!(handle = %handle, code = ?status.code(), "worker process exited nonzero");
                Ok(WorkerPhase::Failed)
            }
        }
    }

    async fn delete(&self, handle: &WorkerHandle) -> anyhow::Result<()> {
        let mut workers = self.workers.lock().await;
        if let Some(mut child) = workers.remove(&handle.0) {
            if let Err(e) = child.start_kill() {
                // Already exited; reap below.
                debug!(handle = %handle, "kill skipped: {e}");
            }
            let _ = child.wait().await;
            info!(handle = %handle, "deleted local worker process");
        } else {
            warn!(handle = %handle, "delete for unknown worker; treating as already gone");
        }
        Ok(())
    }
}
