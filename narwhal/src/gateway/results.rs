use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{result_channel, ResultEnvelope, Subscription};
use crate::run::{Run, RunId, RunStatus};
use crate::store::RunStore;

use super::{ApiError, AppState};

/// Synthetic envelopes reconstructing a finished run's outcome from the
/// durable record, for subscribers that joined after the fact.
fn terminal_events(run: &Run) -> Vec<ResultEnvelope> {
    match run.status {
        RunStatus::Completed => vec![
            ResultEnvelope::chunk(
                run.output_data.clone().unwrap_or(serde_json::Value::Null),
            ),
            ResultEnvelope::end(),
        ],
        RunStatus::Failed | RunStatus::Cancelled => {
            vec![ResultEnvelope::end_error(
                run.error_message
                    .clone()
                    .unwrap_or_else(|| run.status.as_str().to_string()),
            )]
        }
        RunStatus::Pending | RunStatus::Running => Vec::new(),
    }
}

/// `GET /runs/{id}/stream` - server-push stream of result events.
///
/// Delivers every envelope published for the run, in publication order for
/// this subscription, until the terminal sentinel, then closes. The
/// subscription is taken out before the status read so a worker finishing
/// between the two steps cannot be missed.
pub async fn stream_results(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let run_id = RunId(id);

    let sub = state
        .bus
        .subscribe(&result_channel(run_id))
        .await
        .map_err(|_| ApiError::Internal("message bus unavailable".to_string()))?;
    // NotFound drops the subscription, which releases it.
    let run = state.store.fetch(run_id).await?;

    crate::telemetry::record_stream_connected("results");

    let (tx, mut rx) = mpsc::channel::<ResultEnvelope>(state.config.client_send_buffer);
    let overflow = Arc::new(AtomicBool::new(false));

    if run.status.is_terminal() {
        // Late subscriber: replay the outcome from the durable record.
        tokio::spawn(async move {
            let mut sub = sub;
            for envelope in terminal_events(&run) {
                if tx.send(envelope).await.is_err() {
                    break;
                }
            }
            sub.release();
        });
    } else {
        tokio::spawn(forward_results(
            sub,
            Arc::clone(&state.store),
            run_id,
            tx,
            Arc::clone(&overflow),
            state.config.status_poll_period,
        ));
    }

    let stream = async_stream::stream! {
        while let Some(envelope) = rx.recv().await {
            let is_end = envelope.is_end();
            let data = serde_json::to_string(&envelope).unwrap_or_default();
            yield Ok::<_, Infallible>(Event::default().data(data));
            if is_end {
                break;
            }
        }
        if overflow.load(Ordering::SeqCst) {
            let envelope = ResultEnvelope::end_error("client overflow");
            let data = serde_json::to_string(&envelope).unwrap_or_default();
            yield Ok(Event::default().data(data));
        }
        crate::telemetry::record_stream_disconnected("results");
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Pump envelopes from the bus subscription into the per-connection queue.
///
/// Exits on the terminal sentinel, client disconnect, queue overflow, or a
/// terminal status observed via the store poll; the subscription is released
/// on every path.
async fn forward_results(
    mut sub: Box<dyn Subscription>,
    store: Arc<dyn RunStore>,
    run_id: RunId,
    tx: mpsc::Sender<ResultEnvelope>,
    overflow: Arc<AtomicBool>,
    poll_period: Duration,
) {
    let start = tokio::time::Instant::now() + poll_period;
    let mut poll = tokio::time::interval_at(start, poll_period);

    loop {
        tokio::select! {
            msg = sub.recv() => {
                let Some(msg) = msg else { break };
                let Ok(envelope) = ResultEnvelope::from_bytes(&msg.payload) else {
                    debug!(%run_id, "discarding malformed result envelope");
                    continue;
                };
                let is_end = envelope.is_end();
                match tx.try_send(envelope) {
                    Ok(()) => {
                        if is_end {
                            break;
                        }
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(%run_id, "client overflow; closing result stream");
                        overflow.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            _ = poll.tick() => {
                // The terminal envelope may have been published just before
                // this subscription existed; the durable record is the
                // fallback source of truth.
                match store.fetch(run_id).await {
                    Ok(run) if run.status.is_terminal() => {
                        if !drain_pending(&mut sub, &tx).await {
                            for envelope in terminal_events(&run) {
                                if tx.try_send(envelope).is_err() {
                                    break;
                                }
                            }
                        }
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    sub.release();
}

/// Forward whatever is already buffered on the subscription. Returns whether
/// the terminal sentinel was among the drained messages.
async fn drain_pending(
    sub: &mut Box<dyn Subscription>,
    tx: &mpsc::Sender<ResultEnvelope>,
) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_millis(25), sub.recv()).await {
            Ok(Some(msg)) => {
                if let Ok(envelope) = ResultEnvelope::from_bytes(&msg.payload) {
                    let is_end = envelope.is_end();
                    if tx.try_send(envelope).is_err() {
                        return false;
                    }
                    if is_end {
                        return true;
                    }
                }
            }
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunPatch, RunnableKind};

    fn finished_run(status: RunStatus, patch: RunPatch) -> Run {
        let mut run = Run::pending(
            RunnableKind::Agent,
            Uuid::now_v7(),
            serde_json::Map::new(),
        );
        patch.apply(&mut run, status);
        run
    }

    #[test]
    fn test_terminal_events_for_completed_run() {
        let run = finished_run(
            RunStatus::Completed,
            RunPatch::completed(serde_json::Value::String("hello".into())),
        );
        let events = terminal_events(&run);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            ResultEnvelope::chunk(serde_json::Value::String("hello".into()))
        );
        assert_eq!(events[1], ResultEnvelope::end());
    }

    #[test]
    fn test_terminal_events_for_failed_run() {
        let run = finished_run(RunStatus::Failed, RunPatch::failed("worker disappeared"));
        let events = terminal_events(&run);
        assert_eq!(events, vec![ResultEnvelope::end_error("worker disappeared")]);
    }

    #[test]
    fn test_terminal_events_for_cancelled_run() {
        let run = finished_run(RunStatus::Cancelled, RunPatch::cancelled());
        let events = terminal_events(&run);
        assert_eq!(events, vec![ResultEnvelope::end_error("cancelled")]);
    }

    #[test]
    fn test_no_synthetic_events_for_active_run() {
        let run = Run::pending(
            RunnableKind::Team,
            Uuid::now_v7(),
            serde_json::Map::new(),
        );
        assert!(terminal_events(&run).is_empty());
    }
}
