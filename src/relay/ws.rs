use std::fmt::Display;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, Stream, StreamExt, stream::SplitSink};
use tokio::sync::mpsc;

use super::api::{ApiError, SharedState};
use super::bridge::{ConsoleConnection, SessionBridge};
use super::hub::{Outbound, RelayHub, WorkerConnection};
use super::messages::WorkerEvent;

/// How often to send WebSocket Ping frames. Missed pongs are not fatal.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Drain queued frames into the socket, pinging on an interval. Ends when
/// the queue closes or the peer goes away.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            frame = rx.recv() => {
                match frame {
                    Some(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Worker ───────────────────────────────────────────────────────────

pub async fn worker_handler(
    ws: WebSocketUpgrade,
    Path(job_id): Path<i64>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_worker(socket, job_id, state))
}

async fn handle_worker(socket: WebSocket, job_id: i64, state: SharedState) {
    let (sender, receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sender, rx));
    run_worker(&state.hub, job_id, tx, receiver).await;
    writer.abort();
}

/// Parse one worker text frame and apply it. False when the frame is not a
/// worker event.
pub(crate) async fn dispatch_worker_frame(hub: &RelayHub, job_id: i64, text: &str) -> bool {
    match WorkerEvent::parse(text) {
        Some(event) => {
            hub.handle_worker_event(job_id, event).await;
            true
        }
        None => {
            tracing::debug!(job_id, "Ignoring malformed worker frame");
            false
        }
    }
}

/// Track the worker for the life of its inbound stream, then report the
/// disconnect.
pub(crate) async fn run_worker<S, E>(hub: &RelayHub, job_id: i64, tx: Outbound, mut incoming: S)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let connection_id = hub.next_connection_id();
    hub.attach_worker(job_id, WorkerConnection::new(connection_id, tx));

    while let Some(msg) = incoming.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                dispatch_worker_frame(hub, job_id, text.as_str()).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(job_id, error = %e, "Worker socket error");
                break;
            }
        }
    }

    hub.worker_disconnected(job_id, connection_id);
}

// ── Observer ─────────────────────────────────────────────────────────

pub async fn observer_handler(
    ws: WebSocketUpgrade,
    Path(job_id): Path<i64>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get_job(job_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Job {} not found", job_id)));
    }
    Ok(ws.on_upgrade(move |socket| handle_observer(socket, job_id, state)))
}

async fn handle_observer(socket: WebSocket, job_id: i64, state: SharedState) {
    let (sender, receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sender, rx));
    run_observer(&state.hub, job_id, tx, receiver).await;
    writer.abort();
}

/// Subscribe for the life of the inbound stream. Client frames are ignored.
pub(crate) async fn run_observer<S, E>(hub: &RelayHub, job_id: i64, tx: Outbound, mut incoming: S)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
{
    let observer_id = hub.attach_observer(job_id, tx);

    while let Some(msg) = incoming.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    hub.detach_observer(job_id, observer_id);
}

// ── Console ──────────────────────────────────────────────────────────

pub async fn console_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_console(socket, state))
}

async fn handle_console(socket: WebSocket, state: SharedState) {
    let (sender, receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sender, rx));
    run_console(&state.bridge, tx, receiver).await;
    writer.abort();
}

pub(crate) async fn run_console<S, E>(bridge: &SessionBridge, tx: Outbound, mut incoming: S)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut conn = ConsoleConnection::new(tx);
    while let Some(msg) = incoming.next().await {
        match msg {
            Ok(Message::Text(text)) => bridge.handle_frame(&mut conn, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Console socket error");
                break;
            }
        }
    }

    bridge.disconnect(&mut conn);
}
