use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use narwhal::run::RunnableKind;
use narwhal::worker::{ChunkStream, Runnable, RunnableResolver};

/// Runnable that replays a canned chunk sequence.
///
/// Optionally sleeps between chunks (to exercise backpressure) and
/// optionally fails after the last chunk.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunnable {
    chunks: Vec<Value>,
    error: Option<String>,
    chunk_delay: Option<Duration>,
}

impl ScriptedRunnable {
    /// Runnable emitting the given string chunks then finishing cleanly.
    pub fn emitting<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(|s| Value::String(s.into())).collect(),
            error: None,
            chunk_delay: None,
        }
    }

    /// Runnable emitting arbitrary JSON chunks.
    pub fn emitting_values(chunks: Vec<Value>) -> Self {
        Self {
            chunks,
            error: None,
            chunk_delay: None,
        }
    }

    /// Fail with this message after all chunks have been emitted.
    pub fn then_fail(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Sleep between chunks.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }
}

#[async_trait]
impl Runnable for ScriptedRunnable {
    async fn run(
        &self,
        _input: serde_json::Map<String, Value>,
    ) -> anyhow::Result<ChunkStream> {
        let chunks = self.chunks.clone();
        let error = self.error.clone();
        let delay = self.chunk_delay;

        let stream = async_stream::stream! {
            for chunk in chunks {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(chunk);
            }
            if let Some(message) = error {
                yield Err(anyhow::anyhow!(message));
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Resolver serving scripted runnables by runnable id, with an optional
/// default for unregistered ids.
#[derive(Clone, Default)]
pub struct ScriptedResolver {
    by_id: Arc<Mutex<HashMap<Uuid, ScriptedRunnable>>>,
    fallback: Arc<Mutex<Option<ScriptedRunnable>>>,
}

impl ScriptedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver that serves the same runnable for every id.
    pub fn always(runnable: ScriptedRunnable) -> Self {
        let resolver = Self::new();
        *resolver.fallback.lock() = Some(runnable);
        resolver
    }

    /// Register a runnable for a specific id.
    pub fn register(&self, runnable_id: Uuid, runnable: ScriptedRunnable) {
        self.by_id.lock().insert(runnable_id, runnable);
    }
}

#[async_trait]
impl RunnableResolver for ScriptedResolver {
    async fn resolve(
        &self,
        kind: RunnableKind,
        runnable_id: Uuid,
    ) -> anyhow::Result<Box<dyn Runnable>> {
        if let Some(runnable) = self.by_id.lock().get(&runnable_id).cloned() {
            return Ok(Box::new(runnable));
        }
        if let Some(runnable) = self.fallback.lock().clone() {
            return Ok(Box::new(runnable));
        }
        anyhow::bail!("unknown {kind} configuration {runnable_id}")
    }
}
