//! Per-connection session management over WebSocket.
//!
//! Each connection runs three tasks: the inbound loop (this module's
//! `handle_socket`), which processes protocol messages strictly in receipt
//! order; one outbound writer draining a channel of server messages onto the
//! socket; and, while a session is bound, one observer streaming PTY output
//! and watching for process exit. The observer and the inbound loop share the
//! connection's active-session slot, so whichever side tears a session down
//! first wins and the other side sees the registry entry gone.

use std::io::Read;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{parse_client_message, ClientMessage, ServerMessage};
use crate::pty::registry::SessionRegistry;
use crate::pty::session::{find_utf8_boundary, PtySession, DEFAULT_COLS, DEFAULT_ROWS, READ_BUFFER_SIZE};
use crate::AppState;

const OUTBOUND_CHANNEL_SIZE: usize = 256;
const DEFAULT_ARGS: &[&str] = &["onboard"];

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (ws_sink, mut ws_stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CHANNEL_SIZE);
    let writer = tokio::spawn(write_outbound(ws_sink, out_rx));

    let conn = Connection {
        state,
        out_tx,
        active: Arc::new(Mutex::new(None)),
    };
    info!("client connected");

    while let Some(message) = ws_stream.next().await {
        match message {
            Ok(Message::Text(text)) => conn.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
        }
    }

    // Sole teardown guarantee for the connection: runs for graceful closes
    // and abrupt drops alike.
    conn.teardown().await;
    writer.abort();
    info!("client disconnected");
}

/// Single writer for the socket; every producer goes through the channel, so
/// acknowledgements and session output interleave without reordering either.
async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerMessage>,
) {
    while let Some(msg) = rx.recv().await {
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "failed to serialize server message");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}

struct Connection {
    state: AppState,
    out_tx: mpsc::Sender<ServerMessage>,
    /// The at-most-one session bound to this connection, shared with the
    /// session observer so exit observation can clear it.
    active: Arc<Mutex<Option<String>>>,
}

impl Connection {
    async fn send(&self, msg: ServerMessage) {
        let _ = self.out_tx.send(msg).await;
    }

    async fn handle_text(&self, text: &str) {
        match parse_client_message(text) {
            Ok(Some(msg)) => self.dispatch(msg).await,
            Ok(None) => warn!("ignoring message with unrecognized type"),
            Err(e) => {
                self.send(ServerMessage::Error {
                    message: e.to_string(),
                })
                .await
            }
        }
    }

    async fn dispatch(&self, msg: ClientMessage) {
        match msg {
            ClientMessage::Start { command, args } => self.handle_start(command, args).await,
            ClientMessage::Input { data } => self.handle_input(&data).await,
            ClientMessage::Resize { cols, rows } => self.handle_resize(cols, rows).await,
            ClientMessage::Kill => self.handle_kill().await,
        }
    }

    async fn handle_start(&self, command: Option<String>, args: Option<Vec<String>>) {
        let command = command.unwrap_or_else(|| self.state.config.command.clone());
        let args = args
            .unwrap_or_else(|| DEFAULT_ARGS.iter().map(|a| a.to_string()).collect());

        let mut active = self.active.lock().await;

        // Replace semantics: the previous process must be fully gone before
        // the new one is spawned.
        if let Some(old) = active.take() {
            if self.state.registry.terminate(&old).await.is_some() {
                info!(session_id = %old, "terminated session replaced by new start");
            }
        }

        let id = Uuid::new_v4().to_string();
        let spawned = {
            let id = id.clone();
            let command = command.clone();
            let args = args.clone();
            tokio::task::spawn_blocking(move || {
                PtySession::spawn(id, &command, &args, DEFAULT_COLS, DEFAULT_ROWS)
            })
            .await
        };
        let (session, reader) = match spawned {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!(command = %command, error = %e, "failed to start session");
                self.send(ServerMessage::Error {
                    message: e.to_string(),
                })
                .await;
                return;
            }
            Err(e) => {
                error!(error = %e, "spawn task failed");
                self.send(ServerMessage::Error {
                    message: "failed to start session".to_string(),
                })
                .await;
                return;
            }
        };

        let session = Arc::new(session);
        self.state.registry.insert(session.clone());
        *active = Some(id.clone());
        info!(
            session_id = %id,
            command = %session.command,
            pid = session.pid,
            "session started"
        );

        // Acknowledge before attaching the observer so `started` always
        // precedes the session's first `output` on the wire.
        self.send(ServerMessage::Started { session_id: id }).await;

        tokio::spawn(observe_session(
            session,
            reader,
            self.state.registry.clone(),
            self.out_tx.clone(),
            self.active.clone(),
        ));
    }

    async fn handle_input(&self, data: &str) {
        match self.current_session().await {
            Some(session) => {
                if let Err(e) = session.write_input(data.as_bytes()) {
                    self.send(ServerMessage::Error {
                        message: e.to_string(),
                    })
                    .await;
                }
            }
            None => {
                self.send(ServerMessage::Error {
                    message: "No active session".to_string(),
                })
                .await
            }
        }
    }

    async fn handle_resize(&self, cols: Option<u16>, rows: Option<u16>) {
        // Unlike input, a resize without a session is not worth reporting.
        if let Some(session) = self.current_session().await {
            let cols = cols.unwrap_or(DEFAULT_COLS);
            let rows = rows.unwrap_or(DEFAULT_ROWS);
            if let Err(e) = session.resize(cols, rows) {
                debug!(session_id = %session.id, error = %e, "resize failed");
            }
        }
    }

    async fn handle_kill(&self) {
        let mut active = self.active.lock().await;
        let Some(id) = active.clone() else { return };

        if self.state.registry.terminate(&id).await.is_some() {
            *active = None;
            info!(session_id = %id, "session killed by client");
            self.send(ServerMessage::Killed).await;
        }
        // Entry already gone: the exit observer won the race and its `exit`
        // message is the terminal outcome.
    }

    async fn current_session(&self) -> Option<Arc<PtySession>> {
        let active = self.active.lock().await;
        active
            .as_deref()
            .and_then(|id| self.state.registry.get(id))
    }

    async fn teardown(&self) {
        let mut active = self.active.lock().await;
        if let Some(id) = active.take() {
            if self.state.registry.terminate(&id).await.is_some() {
                info!(session_id = %id, "terminated session after disconnect");
            }
        }
    }
}

/// Streams PTY output to the connection and observes process exit.
///
/// Output chunks go out verbatim, in production order, re-aligned to UTF-8
/// boundaries with a carry buffer for split multibyte sequences. On EOF the
/// child is reaped; removal from the registry decides who reports
/// termination, so when the entry is already gone (explicit kill,
/// replacement, disconnect) the observer stays silent.
async fn observe_session(
    session: Arc<PtySession>,
    mut reader: Box<dyn Read + Send>,
    registry: Arc<SessionRegistry>,
    out_tx: mpsc::Sender<ServerMessage>,
    active: Arc<Mutex<Option<String>>>,
) {
    let session_id = session.id.clone();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let read_result = tokio::task::spawn_blocking(move || {
            let result = reader.read(&mut buf);
            (reader, buf, result)
        })
        .await;

        let (returned_reader, returned_buf, result) = match read_result {
            Ok(parts) => parts,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "PTY read task failed");
                break;
            }
        };
        reader = returned_reader;
        buf = returned_buf;

        match result {
            Ok(0) => {
                if !pending.is_empty() {
                    let data = String::from_utf8_lossy(&pending).into_owned();
                    let _ = out_tx.send(ServerMessage::Output { data }).await;
                }
                break;
            }
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let valid = find_utf8_boundary(&pending);
                if valid > 0 {
                    let data = String::from_utf8_lossy(&pending[..valid]).into_owned();
                    pending.drain(..valid);
                    if out_tx.send(ServerMessage::Output { data }).await.is_err() {
                        // Connection gone; teardown reaps the process.
                        return;
                    }
                }
            }
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "PTY read failed");
                break;
            }
        }
    }

    // Claim the entry before reaping: whoever removes it owns the
    // termination report, and claiming first keeps `terminate` from blocking
    // on a child the observer is mid-wait on.
    if registry.remove(&session_id).is_none() {
        debug!(session_id = %session_id, "session already removed, skipping exit report");
        return;
    }

    let exit = {
        let session = session.clone();
        tokio::task::spawn_blocking(move || session.kill_and_wait())
            .await
            .unwrap_or_default()
    };

    {
        let mut active = active.lock().await;
        if active.as_deref() == Some(session_id.as_str()) {
            *active = None;
        }
    }
    info!(session_id = %session_id, exit_code = ?exit.exit_code, "session exited");
    let _ = out_tx
        .send(ServerMessage::Exit {
            exit_code: exit.exit_code,
            signal: exit.signal,
        })
        .await;
}
