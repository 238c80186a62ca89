//! narwhal-worker - the worker-runtime entry point.
//!
//! Executes exactly one run: reads the invocation contract from the
//! environment, streams chunks and logs to the message bus, and writes the
//! terminal outcome back to the run store. The process exit code is
//! advisory only; the status recorded in the store is authoritative.
//!
//! Runnable resolution is deployment-specific. This reference binary wires
//! an echo resolver so the full lifecycle can be exercised without the
//! agent service; production images link their own [`RunnableResolver`].

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use narwhal::persistence::PostgresRunStore;
use narwhal::worker::{
    BusLogLayer, ChunkStream, Runnable, RunnableResolver, WorkerEnv,
    WorkerHarness,
};
use narwhal::{
    InProcMessageBus, MessageBus, OrchestratorConfig, RunStatus, RunnableKind,
};

/// Reference runnable: echoes the submitted `message` input as one chunk.
struct EchoRunnable;

#[async_trait]
impl Runnable for EchoRunnable {
    async fn run(
        &self,
        input: serde_json::Map<String, Value>,
    ) -> anyhow::Result<ChunkStream> {
        let message = input
            .get("message")
            .cloned()
            .unwrap_or(Value::String(String::new()));
        Ok(Box::pin(futures::stream::once(async move { Ok(message) })))
    }
}

struct EchoResolver;

#[async_trait]
impl RunnableResolver for EchoResolver {
    async fn resolve(
        &self,
        _kind: RunnableKind,
        _runnable_id: Uuid,
    ) -> anyhow::Result<Box<dyn Runnable>> {
        Ok(Box::new(EchoRunnable))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = WorkerEnv::from_env().context("reading worker environment")?;
    let config = OrchestratorConfig::from_env();

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await
        .context("connecting to run store")?;
    let store = Arc::new(PostgresRunStore::new(pool));

    // Single-process bus; cross-process deployments substitute a networked
    // MessageBus implementation here.
    let bus: Arc<dyn MessageBus> =
        Arc::new(InProcMessageBus::new(config.result_channel_buffer));

    // Every log event this process emits is mirrored onto the run's log
    // channel, without ever blocking the execution path.
    let (log_layer, log_task) = BusLogLayer::new(
        bus.clone(),
        env.log_channel.clone(),
        config.client_send_buffer,
    );
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(log_layer)
        .init();

    info!(run_id = %env.run_id, kind = %env.runnable_kind, "worker starting");

    let harness = WorkerHarness::new(
        store,
        bus,
        Arc::new(EchoResolver),
        env,
        config.aggregation_soft_cap,
    );
    let status = harness.execute().await?;
    info!(status = %status, "worker finished");

    // The log layer lives in the global subscriber, so its publisher task
    // never sees a closed queue; give it a moment to drain instead.
    drop(log_task);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    std::process::exit(if status == RunStatus::Completed { 0 } else { 1 });
}
