use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::debug;
use uuid::Uuid;

use crate::bus::{log_channel, Subscription};
use crate::run::RunId;

use super::{ApiError, AppState};

/// `GET /ws/runs/{id}/logs` - log stream over WebSocket.
///
/// One UTF-8 text frame per log line, server to client only. Closes with a
/// normal-closure code when the run reaches a terminal status (observed via
/// a periodic store poll; log channels carry no terminal sentinel), when the
/// client disconnects, or on gateway shutdown.
pub async fn stream_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let run_id = RunId(id);

    // Subscribe before the status check, mirroring the result gateway.
    let sub = state
        .bus
        .subscribe(&log_channel(run_id))
        .await
        .map_err(|_| ApiError::Internal("message bus unavailable".to_string()))?;
    state.store.fetch(run_id).await?;

    Ok(ws.on_upgrade(move |socket| handle_log_socket(socket, sub, state, run_id)))
}

async fn handle_log_socket(
    socket: WebSocket,
    mut sub: Box<dyn Subscription>,
    state: AppState,
    run_id: RunId,
) {
    crate::telemetry::record_stream_connected("logs");

    let (mut sender, mut receiver) = socket.split();
    let poll_start = tokio::time::Instant::now() + state.config.status_poll_period;
    let mut poll = tokio::time::interval_at(poll_start, state.config.status_poll_period);
    let mut run_finished = false;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                debug!(%run_id, "log stream closing on gateway shutdown");
                break;
            }
            msg = sub.recv() => {
                let Some(msg) = msg else { break };
                let line = String::from_utf8_lossy(&msg.payload).to_string();
                let send = sender.send(Message::Text(line.into()));
                match tokio::time::timeout(state.config.client_send_timeout, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        // Dead or stalled client.
                        debug!(%run_id, "log send failed; closing stream");
                        break;
                    }
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                        debug!(%run_id, "log stream client disconnected");
                        break;
                    }
                    // Server-to-client only; any other client frame is ignored.
                    Some(Ok(_)) => {}
                }
            }
            _ = poll.tick() => {
                if let Ok(run) = state.store.fetch(run_id).await {
                    if run.status.is_terminal() {
                        run_finished = true;
                        break;
                    }
                }
            }
        }
    }

    if run_finished {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: "run finished".into(),
        };
        let _ = sender.send(Message::Close(Some(frame))).await;
    }

    sub.release();
    crate::telemetry::record_stream_disconnected("logs");
}
