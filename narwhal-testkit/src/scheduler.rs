use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use narwhal::bus::MessageBus;
use narwhal::run::{RunId, RunStatus};
use narwhal::scheduler::{
    LaunchError, WorkerHandle, WorkerPhase, WorkerScheduler, WorkerSpec,
};
use narwhal::store::RunStore;
use narwhal::worker::{RunnableResolver, WorkerEnv, WorkerHarness, ENV_RUN_ID};

/// Scripted outcome for one launch attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptedLaunch {
    Ok,
    Transient,
    Permanent,
}

/// Scheduler fake with scripted launch outcomes and settable phases.
///
/// Launches are idempotent per request id, matching the contract: replays
/// return the existing handle without creating another worker.
#[derive(Clone, Default)]
pub struct MockWorkerScheduler {
    inner: Arc<Mutex<MockInner>>,
}

#[derive(Default)]
struct MockInner {
    script: VecDeque<ScriptedLaunch>,
    launch_attempts: usize,
    workers: HashSet<String>,
    phases: HashMap<String, WorkerPhase>,
    deleted: Vec<String>,
}

impl MockWorkerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for upcoming launch attempts; once the script is
    /// exhausted, launches succeed.
    pub fn script_launches<I: IntoIterator<Item = ScriptedLaunch>>(&self, outcomes: I) {
        self.inner.lock().script.extend(outcomes);
    }

    /// Force the phase reported for a handle.
    pub fn set_phase(&self, handle: &WorkerHandle, phase: WorkerPhase) {
        self.inner.lock().phases.insert(handle.0.clone(), phase);
    }

    /// Total launch attempts, including idempotent replays and failures.
    pub fn launch_attempts(&self) -> usize {
        self.inner.lock().launch_attempts
    }

    /// Number of distinct workers actually created.
    pub fn workers_created(&self) -> usize {
        self.inner.lock().workers.len()
    }

    /// Handles passed to `delete`, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.inner.lock().deleted.clone()
    }
}

#[async_trait]
impl WorkerScheduler for MockWorkerScheduler {
    async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerHandle, LaunchError> {
        let mut inner = self.inner.lock();
        inner.launch_attempts += 1;

        if inner.workers.contains(&spec.request_id) {
            return Ok(WorkerHandle(spec.request_id.clone()));
        }

        match inner.script.pop_front().unwrap_or(ScriptedLaunch::Ok) {
            ScriptedLaunch::Ok => {
                inner.workers.insert(spec.request_id.clone());
                inner
                    .phases
                    .insert(spec.request_id.clone(), WorkerPhase::Active);
                Ok(WorkerHandle(spec.request_id.clone()))
            }
            ScriptedLaunch::Transient => Err(LaunchError::Transient(anyhow::anyhow!(
                "scripted transient failure"
            ))),
            ScriptedLaunch::Permanent => Err(LaunchError::Permanent(anyhow::anyhow!(
                "scripted permanent failure"
            ))),
        }
    }

    async fn inspect(&self, handle: &WorkerHandle) -> anyhow::Result<WorkerPhase> {
        Ok(self
            .inner
            .lock()
            .phases
            .get(&handle.0)
            .copied()
            .unwrap_or(WorkerPhase::Unknown))
    }

    async fn delete(&self, handle: &WorkerHandle) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.deleted.push(handle.0.clone());
        inner.workers.remove(&handle.0);
        inner.phases.remove(&handle.0);
        Ok(())
    }
}

/// Scheduler that runs the real worker harness as a tokio task.
///
/// Gives tests a complete control plane in one process: launches execute the
/// genuine [`WorkerHarness`] against the shared store and bus, `delete`
/// aborts the task (the moral equivalent of killing the container), and
/// `inspect` reports phases from task state.
pub struct InProcessScheduler {
    store: Arc<dyn RunStore>,
    bus: Arc<dyn MessageBus>,
    resolver: Arc<dyn RunnableResolver>,
    aggregation_soft_cap: usize,
    tasks: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    results: Arc<Mutex<HashMap<String, RunStatus>>>,
    deleted: Mutex<HashSet<String>>,
}

impl InProcessScheduler {
    pub fn new(
        store: Arc<dyn RunStore>,
        bus: Arc<dyn MessageBus>,
        resolver: Arc<dyn RunnableResolver>,
    ) -> Self {
        Self {
            store,
            bus,
            resolver,
            aggregation_soft_cap: 64 * 1024 * 1024,
            tasks: Mutex::new(HashMap::new()),
            results: Arc::new(Mutex::new(HashMap::new())),
            deleted: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl WorkerScheduler for InProcessScheduler {
    async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerHandle, LaunchError> {
        let handle = WorkerHandle(spec.request_id.clone());
        {
            let tasks = self.tasks.lock();
            if tasks.contains_key(&spec.request_id) {
                return Ok(handle);
            }
        }

        let run_id: RunId = spec
            .env
            .get(ENV_RUN_ID)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| {
                LaunchError::Permanent(anyhow::anyhow!("worker spec missing {ENV_RUN_ID}"))
            })?;

        let run = self
            .store
            .fetch(run_id)
            .await
            .map_err(|e| LaunchError::Permanent(e.into()))?;
        let env = WorkerEnv::for_run(
            run_id,
            run.runnable_kind,
            run.runnable_id,
            run.input_variables,
        );

        let harness = WorkerHarness::new(
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            Arc::clone(&self.resolver),
            env,
            self.aggregation_soft_cap,
        );
        let results = Arc::clone(&self.results);
        let request_id = spec.request_id.clone();
        let task = tokio::spawn(async move {
            let status = harness
                .execute()
                .await
                .unwrap_or(RunStatus::Failed);
            results.lock().insert(request_id, status);
        });

        self.tasks.lock().insert(spec.request_id.clone(), task);
        Ok(handle)
    }

    async fn inspect(&self, handle: &WorkerHandle) -> anyhow::Result<WorkerPhase> {
        if self.deleted.lock().contains(&handle.0) {
            return Ok(WorkerPhase::Unknown);
        }
        let finished = self
            .tasks
            .lock()
            .get(&handle.0)
            .map(|task| task.is_finished());
        match finished {
            None => Ok(WorkerPhase::Unknown),
            Some(false) => Ok(WorkerPhase::Active),
            Some(true) => Ok(match self.results.lock().get(&handle.0) {
                Some(RunStatus::Completed) => WorkerPhase::Succeeded,
                _ => WorkerPhase::Failed,
            }),
        }
    }

    async fn delete(&self, handle: &WorkerHandle) -> anyhow::Result<()> {
        self.deleted.lock().insert(handle.0.clone());
        if let Some(task) = self.tasks.lock().remove(&handle.0) {
            task.abort();
        }
        Ok(())
    }
}
