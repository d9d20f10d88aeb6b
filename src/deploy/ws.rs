use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::time::Instant;
use tracing::{debug, warn};

use hostdeck_common::{DeployRequest, Rejection, RunId};

use super::api::{ApiError, SharedState};
use super::stream::RunSubscription;
use crate::errors::DeployError;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// How long `/api/deploy/stream` waits for the request frame.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Close code for a deploy refused because its slot is busy.
pub const CLOSE_SLOT_OCCUPIED: u16 = 4409;

/// Close code for any other refused or malformed deploy request.
pub const CLOSE_REJECTED: u16 = 4400;

pub fn rejection_close_code(rejection: &Rejection) -> u16 {
    match rejection {
        Rejection::SlotOccupied { .. } => CLOSE_SLOT_OCCUPIED,
        _ => CLOSE_REJECTED,
    }
}

// ── Handlers ─────────────────────────────────────────────────────────

/// Attach to an existing run: replay, then live events until `done`.
pub async fn run_events_handler(
    State(state): State<SharedState>,
    Path(id): Path<RunId>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let run = state
        .orchestrator
        .get(id)
        .ok_or(DeployError::RunNotFound { id })?;
    Ok(ws
        .on_upgrade(move |socket| async move {
            let (sender, receiver) = socket.split();
            run_socket_loop(sender, receiver, run.subscribe()).await;
        })
        .into_response())
}

/// Start a run from the first text frame and stream it on the same socket.
pub async fn deploy_stream_handler(
    State(state): State<SharedState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_deploy_stream(socket, state))
}

async fn handle_deploy_stream(socket: WebSocket, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();

    let request = match read_request(&mut receiver).await {
        Ok(request) => request,
        Err(reason) => {
            debug!(reason, "deploy stream closed before a valid request");
            close_with(&mut sender, CLOSE_REJECTED, reason).await;
            return;
        }
    };

    match state.orchestrator.start(&request) {
        Ok(run) => {
            let subscription = run.subscribe();
            run_socket_loop(sender, receiver, subscription).await;
        }
        Err(rejection) => {
            close_with(&mut sender, rejection_close_code(&rejection), rejection.code()).await;
        }
    }
}

/// Wait for the first text frame and decode it as a deploy request.
async fn read_request(
    receiver: &mut SplitStream<WebSocket>,
) -> Result<DeployRequest, &'static str> {
    let first_text = async {
        loop {
            match receiver.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Binary(_))) => return Err("invalid-request"),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Err("closed"),
            }
        }
    };
    let text = tokio::time::timeout(REQUEST_TIMEOUT, first_text)
        .await
        .map_err(|_| "request-timeout")??;
    parse_request(text.as_str())
}

pub fn parse_request(text: &str) -> Result<DeployRequest, &'static str> {
    serde_json::from_str(text).map_err(|_| "invalid-request")
}

async fn close_with(sender: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}

// ── Socket loop ──────────────────────────────────────────────────────

/// Forward a run subscription to the socket with ping/pong keepalive.
///
/// Ends after `done` is sent or when the client goes away. Disconnecting
/// never cancels the run.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut subscription: RunSubscription,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("websocket peer stopped answering pings");
                    return;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    return;
                }
                awaiting_pong = true;
            }

            event = subscription.next() => {
                match event {
                    Some(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "failed to serialize run event");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            return;
                        }
                        if event.is_terminal() {
                            close_with(&mut sender, close_code::NORMAL, "done").await;
                            return;
                        }
                    }
                    None => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
