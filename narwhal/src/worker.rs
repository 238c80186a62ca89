//! Worker-runtime harness.
//!
//! The worker executes inside the scheduled container: it reads its contract
//! from the environment, resolves the runnable through an external
//! collaborator, streams output chunks to the run's result channel, mirrors
//! log lines onto the log channel, and writes the terminal outcome back to
//! the run store. The exit code is advisory only; the store is authoritative.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::{Context, Layer};
use uuid::Uuid;

use crate::bus::{self, MessageBus, ResultEnvelope, MAX_ENVELOPE_BYTES};
use crate::run::{RunId, RunPatch, RunStatus, RunnableKind};
use crate::store::{RunStore, RunStoreError};

/// Environment variable carrying the run identifier.
pub const ENV_RUN_ID: &str = "RUN_ID";
/// Environment variable carrying the runnable configuration reference.
pub const ENV_RUNNABLE_ID: &str = "RUNNABLE_ID";
/// Environment variable carrying the runnable kind (`agent` or `team`).
pub const ENV_RUNNABLE_KIND: &str = "RUNNABLE_KIND";
/// Environment variable carrying the JSON-encoded input mapping.
pub const ENV_INPUT_VARIABLES: &str = "INPUT_VARIABLES";
/// Environment variable carrying the derived log channel name.
pub const ENV_LOG_CHANNEL: &str = "LOG_CHANNEL";
/// Environment variable carrying the derived result channel name.
pub const ENV_RESULT_CHANNEL: &str = "RESULT_CHANNEL";

/// Lazy sequence of output chunks produced by a runnable.
///
/// Not restartable; cancelled by dropping the stream.
pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<Value>> + Send>>;

/// The abstract unit being executed; opaque to this core.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Begin execution with the submitted input mapping.
    async fn run(
        &self,
        input: serde_json::Map<String, Value>,
    ) -> anyhow::Result<ChunkStream>;
}

/// External collaborator that resolves agent/team configuration into an
/// executable runnable. The core never inspects the configuration shape.
#[async_trait]
pub trait RunnableResolver: Send + Sync {
    async fn resolve(
        &self,
        kind: RunnableKind,
        runnable_id: Uuid,
    ) -> anyhow::Result<Box<dyn Runnable>>;
}

/// Worker invocation contract, parsed from the environment.
#[derive(Clone, Debug)]
pub struct WorkerEnv {
    pub run_id: RunId,
    pub runnable_id: Uuid,
    pub runnable_kind: RunnableKind,
    pub input_variables: serde_json::Map<String, Value>,
    pub log_channel: String,
    pub result_channel: String,
}

impl WorkerEnv {
    /// Parse the contract from process environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let run_id: RunId = required(ENV_RUN_ID)?.parse()?;
        let runnable_id: Uuid = required(ENV_RUNNABLE_ID)?.parse()?;
        let runnable_kind: RunnableKind = required(ENV_RUNNABLE_KIND)?
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let input_variables = match std::env::var(ENV_INPUT_VARIABLES) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(_) => serde_json::Map::new(),
        };
        let log_channel = std::env::var(ENV_LOG_CHANNEL)
            .unwrap_or_else(|_| bus::log_channel(run_id));
        let result_channel = std::env::var(ENV_RESULT_CHANNEL)
            .unwrap_or_else(|_| bus::result_channel(run_id));
        Ok(Self {
            run_id,
            runnable_id,
            runnable_kind,
            input_variables,
            log_channel,
            result_channel,
        })
    }

    /// Build an env directly; used by in-process schedulers and tests.
    pub fn for_run(
        run_id: RunId,
        runnable_kind: RunnableKind,
        runnable_id: Uuid,
        input_variables: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            run_id,
            runnable_id,
            runnable_kind,
            input_variables,
            log_channel: bus::log_channel(run_id),
            result_channel: bus::result_channel(run_id),
        }
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing required env var {key}"))
}

/// In-memory aggregate of the chunks published so far.
///
/// String chunks concatenate; anything else collects into an array. Past the
/// soft cap the aggregate is replaced by a spill reference that records only
/// the size (artifact storage is an external concern).
#[derive(Debug)]
pub enum OutputAggregate {
    Empty,
    Text(String),
    Items(Vec<Value>),
    Spilled { size_bytes: usize },
}

impl OutputAggregate {
    pub fn new() -> Self {
        OutputAggregate::Empty
    }

    /// Fold one chunk into the aggregate. `serialized_len` is the wire size
    /// of the chunk, already known from publishing.
    pub fn push(&mut self, chunk: &Value, serialized_len: usize, soft_cap: usize) {
        if let OutputAggregate::Spilled { size_bytes } = self {
            *size_bytes += serialized_len;
            return;
        }

        match (std::mem::replace(self, OutputAggregate::Empty), chunk) {
            (OutputAggregate::Empty, Value::String(s)) => {
                *self = OutputAggregate::Text(s.clone());
            }
            (OutputAggregate::Empty, other) => {
                *self = OutputAggregate::Items(vec![other.clone()]);
            }
            (OutputAggregate::Text(mut acc), Value::String(s)) => {
                acc.push_str(s);
                *self = OutputAggregate::Text(acc);
            }
            (OutputAggregate::Text(acc), other) => {
                *self = OutputAggregate::Items(vec![Value::String(acc), other.clone()]);
            }
            (OutputAggregate::Items(mut items), other) => {
                items.push(other.clone());
                *self = OutputAggregate::Items(items);
            }
            (spilled @ OutputAggregate::Spilled { .. }, _) => {
                *self = spilled;
            }
        }

        let current = self.approx_bytes();
        if current > soft_cap {
            warn!(
                size_bytes = current,
                soft_cap, "output aggregate exceeded soft cap; spilling"
            );
            *self = OutputAggregate::Spilled {
                size_bytes: current,
            };
        }
    }

    fn approx_bytes(&self) -> usize {
        match self {
            OutputAggregate::Empty => 0,
            OutputAggregate::Text(s) => s.len(),
            OutputAggregate::Items(items) => items
                .iter()
                .map(|v| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0))
                .sum(),
            OutputAggregate::Spilled { size_bytes } => *size_bytes,
        }
    }

    /// Final `output_data` value for the run record.
    pub fn into_value(self) -> Value {
        match self {
            OutputAggregate::Empty => Value::Null,
            OutputAggregate::Text(s) => Value::String(s),
            OutputAggregate::Items(items) => Value::Array(items),
            OutputAggregate::Spilled { size_bytes } => serde_json::json!({
                "spilled": true,
                "size_bytes": size_bytes,
            }),
        }
    }
}

impl Default for OutputAggregate {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a chunk into one or more envelopes no larger than
/// [`MAX_ENVELOPE_BYTES`] on the wire.
///
/// String payloads split on character boundaries. Non-string payloads that
/// overflow are re-framed as serialized-JSON text pieces.
pub fn split_chunk(chunk: Value) -> Vec<ResultEnvelope> {
    let envelope = ResultEnvelope::chunk(chunk);
    if envelope.to_bytes().len() <= MAX_ENVELOPE_BYTES {
        return vec![envelope];
    }

    let text = match envelope {
        ResultEnvelope::Chunk {
            payload: Value::String(s),
        } => s,
        ResultEnvelope::Chunk { payload } => {
            serde_json::to_string(&payload).unwrap_or_default()
        }
        ResultEnvelope::End { .. } => unreachable!("split only applies to chunks"),
    };

    // Envelope framing plus JSON string escaping overhead.
    let budget = MAX_ENVELOPE_BYTES / 2;
    let mut pieces = Vec::new();
    let mut current = String::with_capacity(budget);
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > budget {
            pieces.push(ResultEnvelope::chunk(Value::String(std::mem::take(
                &mut current,
            ))));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        pieces.push(ResultEnvelope::chunk(Value::String(current)));
    }
    pieces
}

/// Tracing layer that mirrors every log event onto a bus log channel.
///
/// Events are formatted to single lines and handed to a bounded queue
/// drained by a publisher task, so the execution path never blocks on the
/// bus. Overflow or publish failure drops the line and counts it.
pub struct BusLogLayer {
    tx: mpsc::Sender<String>,
    drops: Arc<AtomicU64>,
}

impl BusLogLayer {
    /// Create the layer and spawn its publisher task.
    pub fn new(
        bus: Arc<dyn MessageBus>,
        channel: String,
        capacity: usize,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<String>(capacity);
        let drops = Arc::new(AtomicU64::new(0));
        let task_drops = Arc::clone(&drops);
        let task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if bus
                    .publish(&channel, bytes::Bytes::from(line))
                    .await
                    .is_err()
                {
                    task_drops.fetch_add(1, Ordering::Relaxed);
                    crate::telemetry::record_log_drop();
                }
            }
        });
        (Self { tx, drops }, task)
    }

    /// Number of log lines dropped on overflow or publish failure.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

impl<S: tracing::Subscriber> Layer<S> for BusLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();
        let line = format!("{} {}: {}", meta.level(), meta.target(), visitor.finish());
        if self.tx.try_send(line).is_err() {
            self.drops.fetch_add(1, Ordering::Relaxed);
            crate::telemetry::record_log_drop();
        }
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl tracing::field::Visit for LineVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push_str(&format!(" {}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

/// Executes one run inside the worker process.
pub struct WorkerHarness {
    store: Arc<dyn RunStore>,
    bus: Arc<dyn MessageBus>,
    resolver: Arc<dyn RunnableResolver>,
    env: WorkerEnv,
    aggregation_soft_cap: usize,
    chunk_drops: AtomicU64,
}

impl WorkerHarness {
    pub fn new(
        store: Arc<dyn RunStore>,
        bus: Arc<dyn MessageBus>,
        resolver: Arc<dyn RunnableResolver>,
        env: WorkerEnv,
        aggregation_soft_cap: usize,
    ) -> Self {
        Self {
            store,
            bus,
            resolver,
            env,
            aggregation_soft_cap,
            chunk_drops: AtomicU64::new(0),
        }
    }

    /// Number of chunks dropped because a bus publish failed.
    pub fn chunk_drops(&self) -> u64 {
        self.chunk_drops.load(Ordering::Relaxed)
    }

    /// Run the full worker lifecycle and return the terminal status.
    pub async fn execute(&self) -> anyhow::Result<RunStatus> {
        let run_id = self.env.run_id;
        let run = self.store.fetch(run_id).await?;

        if run.status.is_terminal() {
            info!(%run_id, status = %run.status, "run already terminal; nothing to do");
            return Ok(run.status);
        }

        // Either the coordinator or this worker stamps the running
        // transition; whichever compare-and-set lands first wins and the
        // loser proceeds without error.
        if run.status == RunStatus::Pending {
            let moved = self
                .store
                .transition(
                    run_id,
                    &[RunStatus::Pending],
                    RunStatus::Running,
                    RunPatch::started(),
                )
                .await?;
            if moved {
                debug!(%run_id, "worker stamped running before coordinator");
            }
        }

        let outcome = self.run_to_completion().await;

        match outcome {
            Ok(output) => {
                self.publish_envelope(ResultEnvelope::end()).await;
                let status = self
                    .finalize(RunStatus::Completed, RunPatch::completed(output))
                    .await;
                Ok(status)
            }
            Err(e) => {
                let message = e.to_string();
                self.publish_envelope(ResultEnvelope::end_error(&message))
                    .await;
                let status = self
                    .finalize(RunStatus::Failed, RunPatch::failed(message))
                    .await;
                Ok(status)
            }
        }
    }

    async fn run_to_completion(&self) -> anyhow::Result<Value> {
        let runnable = self
            .resolver
            .resolve(self.env.runnable_kind, self.env.runnable_id)
            .await?;
        let mut stream = runnable.run(self.env.input_variables.clone()).await?;

        let mut aggregate = OutputAggregate::new();
        while let Some(item) = stream.next().await {
            let chunk = item?;
            for envelope in split_chunk(chunk) {
                let bytes = envelope.to_bytes();
                let len = bytes.len();
                if self
                    .bus
                    .publish(&self.env.result_channel, bytes)
                    .await
                    .is_err()
                {
                    // Chunks are not required to be persisted; drop and count.
                    self.chunk_drops.fetch_add(1, Ordering::Relaxed);
                }
                if let ResultEnvelope::Chunk { payload } = &envelope {
                    aggregate.push(payload, len, self.aggregation_soft_cap);
                }
            }
        }
        Ok(aggregate.into_value())
    }

    async fn publish_envelope(&self, envelope: ResultEnvelope) {
        if self
            .bus
            .publish(&self.env.result_channel, envelope.to_bytes())
            .await
            .is_err()
        {
            warn!(run_id = %self.env.run_id, "failed to publish terminal envelope");
            self.chunk_drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Write the terminal transition, retrying store errors with backoff
    /// until it lands or another writer has already finished the run.
    async fn finalize(&self, next: RunStatus, patch: RunPatch) -> RunStatus {
        let run_id = self.env.run_id;
        let mut delay = Duration::from_millis(500);
        loop {
            match self
                .store
                .transition(
                    run_id,
                    &[RunStatus::Pending, RunStatus::Running],
                    next,
                    patch.clone(),
                )
                .await
            {
                Ok(true) => {
                    info!(%run_id, status = %next, "terminal status recorded");
                    crate::telemetry::record_run_completed(next.as_str());
                    if let Ok(run) = self.store.fetch(run_id).await {
                        if let (Some(started), Some(ended)) = (run.started_at, run.ended_at) {
                            crate::telemetry::observe_run_duration(
                                next.as_str(),
                                (ended - started).to_std().unwrap_or_default().as_secs_f64(),
                            );
                        }
                    }
                    return next;
                }
                Ok(false) => match self.store.fetch(run_id).await {
                    Ok(run) if run.status.is_terminal() => {
                        // Another writer (cancel or reaper) finished first.
                        info!(%run_id, status = %run.status, "terminal transition lost; keeping existing status");
                        return run.status;
                    }
                    Ok(run) => {
                        warn!(%run_id, status = %run.status, "terminal transition missed; retrying");
                    }
                    Err(e) => {
                        warn!(%run_id, "re-read after lost transition failed: {e}");
                    }
                },
                Err(RunStoreError::NotFound(_)) => {
                    warn!(%run_id, "run vanished during finalize; giving up");
                    return next;
                }
                Err(e) => {
                    warn!(%run_id, "terminal transition failed: {e}; retrying in {delay:?}");
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(30));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_concatenates_strings() {
        let mut agg = OutputAggregate::new();
        agg.push(&Value::String("he".into()), 2, 1024);
        agg.push(&Value::String("llo".into()), 3, 1024);
        assert_eq!(agg.into_value(), Value::String("hello".into()));
    }

    #[test]
    fn test_aggregate_collects_mixed_values() {
        let mut agg = OutputAggregate::new();
        agg.push(&Value::String("a".into()), 1, 1024);
        agg.push(&serde_json::json!({"b": 2}), 8, 1024);
        let value = agg.into_value();
        let items = value.as_array().expect("array aggregate");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Value::String("a".into()));
    }

    #[test]
    fn test_aggregate_spills_past_soft_cap() {
        let mut agg = OutputAggregate::new();
        agg.push(&Value::String("x".repeat(64).into()), 64, 32);
        agg.push(&Value::String("y".into()), 1, 32);
        let value = agg.into_value();
        assert_eq!(value["spilled"], Value::Bool(true));
        assert!(value["size_bytes"].as_u64().unwrap() >= 64);
    }

    #[test]
    fn test_empty_aggregate_is_null() {
        assert_eq!(OutputAggregate::new().into_value(), Value::Null);
    }

    #[test]
    fn test_split_chunk_passthrough_under_limit() {
        let envelopes = split_chunk(Value::String("small".into()));
        assert_eq!(envelopes.len(), 1);
        assert_eq!(
            envelopes[0],
            ResultEnvelope::chunk(Value::String("small".into()))
        );
    }

    #[test]
    fn test_split_chunk_splits_oversized_string() {
        let big = "z".repeat(MAX_ENVELOPE_BYTES + 1024);
        let envelopes = split_chunk(Value::String(big.clone()));
        assert!(envelopes.len() > 1);

        let mut reassembled = String::new();
        for env in &envelopes {
            assert!(env.to_bytes().len() <= MAX_ENVELOPE_BYTES);
            match env {
                ResultEnvelope::Chunk {
                    payload: Value::String(s),
                } => reassembled.push_str(s),
                other => panic!("unexpected envelope: {other:?}"),
            }
        }
        assert_eq!(reassembled, big);
    }

    #[test]
    fn test_worker_env_for_run_derives_channels() {
        let run_id = RunId::new();
        let env = WorkerEnv::for_run(
            run_id,
            RunnableKind::Agent,
            Uuid::now_v7(),
            serde_json::Map::new(),
        );
        assert_eq!(env.result_channel, format!("run_results:{run_id}"));
        assert_eq!(env.log_channel, format!("run_logs:{run_id}"));
    }
}
