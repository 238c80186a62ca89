//! Narwhal - run orchestration and streaming control plane for AI runnables.
//!
//! Narwhal accepts requests to execute long-running AI runnables
//! (individually-configured agents, or groups of agents called teams) and
//! supervises their execution as short-lived, isolated worker processes on a
//! container-orchestration cluster. For each execution it persists a durable
//! record, schedules a worker, mediates real-time streaming of result chunks
//! and log lines back to connected HTTP clients, and records the terminal
//! outcome.
//!
//! # Core Concepts
//!
//! - **Run**: One execution attempt of a runnable, with a durable record and
//!   a terminal outcome. Status transitions follow
//!   `pending -> running -> {completed, failed, cancelled}` and are enforced
//!   with compare-and-set writes through the [`RunStore`] trait.
//!
//! - **Message Bus**: The [`MessageBus`] trait is a topic-based pub/sub
//!   fabric with two channel families per run, `run_results:{id}` and
//!   `run_logs:{id}`. Channels are ephemeral; late subscribers see only
//!   messages published after subscription.
//!
//! - **Worker Scheduler**: The [`WorkerScheduler`] trait is a thin contract
//!   over an external container scheduler: launch a one-shot worker, observe
//!   its phase, delete its resources. Launches are idempotent keyed by a
//!   deterministic request id.
//!
//! - **Coordinator**: The [`RunCoordinator`] inserts the pending record,
//!   schedules the worker, stamps the record running, and runs the reaper
//!   and cleanup sweeps that handle crashed or orphaned workers.
//!
//! - **Worker Harness**: The [`WorkerHarness`] executes inside the scheduled
//!   container: it resolves the runnable, streams chunks to the result
//!   channel, mirrors logs onto the log channel, and writes the terminal
//!   outcome back to the store with retry.
//!
//! - **Gateways**: The [`gateway`] module serves the versioned HTTP surface:
//!   run CRUD, a server-push SSE result stream, and a WebSocket log stream.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL persistence support via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Quick Start
//!
//! ```ignore
//! use narwhal::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = OrchestratorConfig::from_env();
//!     let bus = Arc::new(InProcMessageBus::new(config.result_channel_buffer));
//!
//!     // Wire a store, scheduler, and token verifier for your deployment,
//!     // then serve the router:
//!     // let app = gateway::router(state);
//!     // axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The control plane and the worker share this crate: the coordinator and
//! gateways run in the `narwhald` binary, the harness in `narwhal-worker`.
//! Both sides speak through two seams only - the run store (durable state,
//! compare-and-set transitions) and the message bus (ephemeral streaming).
//! Exactly one writer ever records a terminal status for a run: the worker
//! in the normal case, the coordinator's reaper when the worker dies first.

/// Topic-based publish/subscribe fabric bridging workers and gateways.
///
/// The `bus` module defines the [`MessageBus`] and [`Subscription`] traits,
/// the canonical [`ResultEnvelope`] wire format, channel naming, and the
/// in-process [`InProcMessageBus`] implementation.
pub mod bus;

/// Configuration structures for the coordinator, gateways, and worker.
///
/// The `config` module defines [`OrchestratorConfig`] and
/// [`PersistenceConfig`] for tuning system behavior.
pub mod config;

/// Run coordination: start, cancel, reap, and clean up.
///
/// The `coordinator` module provides [`RunCoordinator`] along with
/// [`ShutdownToken`] for graceful shutdown signaling.
pub mod coordinator;

/// Client-facing HTTP surface.
///
/// The `gateway` module assembles the axum router: REST endpoints, the SSE
/// result stream gateway, the WebSocket log stream gateway, bearer-token
/// authentication, and HTTP error mapping.
pub mod gateway;

/// Core run record definitions.
///
/// The `run` module defines [`Run`], [`RunId`], [`RunStatus`],
/// [`RunnableKind`], and [`RunPatch`].
pub mod run;

/// Contract over the external container scheduler.
///
/// The `scheduler` module defines the [`WorkerScheduler`] trait,
/// [`WorkerSpec`], [`WorkerHandle`], [`WorkerPhase`], and the single-node
/// [`LocalProcessScheduler`].
pub mod scheduler;

/// Durable run persistence.
///
/// The `store` module defines the [`RunStore`] trait, [`RunStoreError`],
/// and [`RunFilter`].
pub mod store;

/// Worker-runtime harness.
///
/// The `worker` module defines the [`Runnable`] and [`RunnableResolver`]
/// seams, the worker environment contract, output aggregation and chunk
/// splitting, the bus log sink, and [`WorkerHarness`].
pub mod worker;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides the sqlx-backed [`RunStore`]
/// implementation when the `postgres` feature is enabled.
pub mod persistence;

#[cfg(feature = "metrics")]
/// Prometheus metrics instrumentation.
///
/// The `metrics` module provides Prometheus metrics for monitoring run
/// orchestration when the `metrics` feature is enabled.
pub mod metrics;

/// Tracing and telemetry instrumentation.
///
/// The `telemetry` module provides helper functions for creating tracing
/// spans and recording metrics during run lifecycle events.
pub mod telemetry;

pub use bus::{
    log_channel, result_channel, BusError, BusMessage, InProcMessageBus,
    MessageBus, ResultEnvelope, Subscription, MAX_ENVELOPE_BYTES,
};
pub use config::{OrchestratorConfig, PersistenceConfig, ResourceBounds};
pub use coordinator::{
    CoordinatorError, RunCoordinator, ShutdownToken, WORKER_LOST_ERROR,
};
pub use run::{Run, RunId, RunPatch, RunStatus, RunnableKind};
pub use scheduler::{
    LaunchError, LocalProcessScheduler, WorkerHandle, WorkerPhase,
    WorkerScheduler, WorkerSpec,
};
pub use store::{RunFilter, RunStore, RunStoreError};
pub use worker::{
    BusLogLayer, ChunkStream, OutputAggregate, Runnable, RunnableResolver,
    WorkerEnv, WorkerHarness,
};

// Re-export telemetry helpers for convenience
#[doc(inline)]
pub use telemetry::{
    record_run_completed, record_run_started, run_start_span, stream_span,
    worker_span,
};
