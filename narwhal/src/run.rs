use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a run.
///
/// Uses UUID v7 for time-ordered uniqueness and efficient indexing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    /// Create a new run ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of runnable a run executes.
///
/// The core treats both variants as opaque references; resolution of the
/// underlying configuration is delegated to an external collaborator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnableKind {
    /// A single configured actor.
    Agent,
    /// A composite of agents executed together.
    Team,
}

impl RunnableKind {
    /// Get the string representation of this runnable kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnableKind::Agent => "agent",
            RunnableKind::Team => "team",
        }
    }
}

impl Display for RunnableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnableKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(RunnableKind::Agent),
            "team" => Ok(RunnableKind::Team),
            other => Err(format!("invalid runnable kind: {other}")),
        }
    }
}

/// Lifecycle states of a run.
///
/// Transitions obey `pending -> running -> {completed, failed, cancelled}`
/// plus `pending -> {failed, cancelled}`. Terminal states never change.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Record exists; no worker has been scheduled yet.
    Pending,
    /// A worker has been scheduled and the run is executing.
    Running,
    /// The run finished successfully; `output_data` is set.
    Completed,
    /// The run failed; `error_message` is set.
    Failed,
    /// The run was cancelled by a caller; `error_message` is set.
    Cancelled,
}

impl RunStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Get the string representation of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// All non-terminal statuses, in lifecycle order.
    pub const ACTIVE: &'static [RunStatus] =
        &[RunStatus::Pending, RunStatus::Running];
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("invalid run status: {other}")),
        }
    }
}

/// Durable record of one execution attempt of a runnable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run.
    pub id: RunId,
    /// Kind of runnable being executed.
    pub runnable_kind: RunnableKind,
    /// Reference to the externally-managed agent or team configuration.
    pub runnable_id: Uuid,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// Free-form input mapping provided at submission.
    pub input_variables: serde_json::Map<String, Value>,
    /// Aggregated final output; set only when `status` is `completed`.
    pub output_data: Option<Value>,
    /// Human-readable failure reason; set only on `failed` or `cancelled`.
    pub error_message: Option<String>,
    /// When the record was inserted.
    pub submitted_at: DateTime<Utc>,
    /// When the run transitioned to `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Opaque scheduler handle for the worker resource; set on `running`.
    pub worker_handle: Option<String>,
}

impl Run {
    /// Create a fresh pending record.
    pub fn pending(
        runnable_kind: RunnableKind,
        runnable_id: Uuid,
        input_variables: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            id: RunId::new(),
            runnable_kind,
            runnable_id,
            status: RunStatus::Pending,
            input_variables,
            output_data: None,
            error_message: None,
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
            worker_handle: None,
        }
    }
}

/// Field updates applied atomically with a compare-and-set transition.
///
/// Only the fields a given transition is allowed to touch are ever set;
/// the constructors below are the sole way transitions are built, which
/// keeps `output_data` and `error_message` mutually exclusive.
#[derive(Clone, Debug, Default)]
pub struct RunPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub worker_handle: Option<String>,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
}

impl RunPatch {
    /// Patch for `pending -> running`: stamps `started_at` and records the
    /// worker handle.
    pub fn running(worker_handle: impl Into<String>) -> Self {
        Self {
            started_at: Some(Utc::now()),
            worker_handle: Some(worker_handle.into()),
            ..Default::default()
        }
    }

    /// Patch for `running -> running` taken by the worker when the
    /// coordinator has not stamped the record yet (fast-start race).
    pub fn started() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Patch attaching the scheduler handle to an already-running record,
    /// taken by the coordinator when the worker's own stamp won the race.
    pub fn worker_attached(worker_handle: impl Into<String>) -> Self {
        Self {
            worker_handle: Some(worker_handle.into()),
            ..Default::default()
        }
    }

    /// Patch for a successful terminal transition.
    pub fn completed(output_data: Value) -> Self {
        Self {
            ended_at: Some(Utc::now()),
            output_data: Some(output_data),
            ..Default::default()
        }
    }

    /// Patch for a failed terminal transition.
    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            ended_at: Some(Utc::now()),
            error_message: Some(error_message.into()),
            ..Default::default()
        }
    }

    /// Patch for a cancelled terminal transition.
    pub fn cancelled() -> Self {
        Self {
            ended_at: Some(Utc::now()),
            error_message: Some("cancelled".to_string()),
            ..Default::default()
        }
    }

    /// Apply this patch to a record in place, together with the new status.
    ///
    /// Shared by the in-memory store and tests; the postgres backend applies
    /// the equivalent update in a single conditional statement.
    pub fn apply(&self, run: &mut Run, next: RunStatus) {
        run.status = next;
        if let Some(t) = self.started_at {
            run.started_at.get_or_insert(t);
        }
        if let Some(t) = self.ended_at {
            run.ended_at.get_or_insert(t);
        }
        if let Some(h) = &self.worker_handle {
            run.worker_handle = Some(h.clone());
        }
        if let Some(v) = &self.output_data {
            run.output_data = Some(v.clone());
        }
        if let Some(m) = &self.error_message {
            run.error_message = Some(m.clone());
        }
    }
}
