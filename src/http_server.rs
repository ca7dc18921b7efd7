//! HTTP server implementation using Axum: the operator API and the terminal
//! WebSocket.

use crate::advice::Suggestion;
use crate::error::Error;
use crate::pty::WindowSize;
use crate::sandbox::{Sandbox, SandboxKey, SandboxSummary};
use crate::state::AppState;
use crate::terminal::{SessionMode, SessionSummary, TerminalEvent};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Messages a terminal client sends over `/ws`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Open {
        student_id: String,
        course_name: String,
        #[serde(default)]
        rows: Option<u16>,
        #[serde(default)]
        cols: Option<u16>,
    },
    Attach {
        session_id: String,
    },
    Input {
        data: String,
    },
    Resize {
        rows: u16,
        cols: u16,
    },
    Ask {
        question: String,
    },
    Close,
}

/// Messages the server sends over `/ws`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Opened { session_id: String, mode: SessionMode },
    Output { data: String },
    Suggestion { suggestion: Suggestion },
    Closed { session_id: String },
    Error { message: String },
}

#[derive(Serialize)]
struct SandboxesResponse {
    backend: &'static str,
    /// Everything the backend reports, resolved by this process or not.
    sandboxes: Vec<SandboxSummary>,
    /// Sandboxes handed to sessions since startup.
    resolved: Vec<Sandbox>,
}

#[derive(Serialize)]
struct ResetResponse {
    key: SandboxKey,
    closed_sessions: usize,
}

#[derive(Serialize)]
struct AdviceStatus {
    strategy: &'static str,
    provider: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", delete(close_session))
        .route("/api/sandboxes", get(list_sandboxes))
        .route("/api/sandboxes/:key/reset", post(reset_sandbox))
        .route("/api/advice/status", get(advice_status))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    // Spawn idle reaper
    let terminals = state.terminals.clone();
    tokio::spawn(async move {
        let mut interval = interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let reaped = terminals.reap_idle().await;
            if reaped > 0 {
                info!(reaped, "closed idle sessions");
            }
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "starting HTTP server");
    axum::serve(listener, router(state)).await
}

fn error_status(e: &Error) -> StatusCode {
    match e {
        Error::Provision { .. } | Error::Backend(_) => StatusCode::BAD_GATEWAY,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::Connect { .. } | Error::FallbackDisabled => StatusCode::SERVICE_UNAVAILABLE,
        Error::Spawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.terminals.list_active().await)
}

async fn close_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.terminals.close(&id).await;
    StatusCode::NO_CONTENT
}

async fn list_sandboxes(
    State(state): State<AppState>,
) -> Result<Json<SandboxesResponse>, (StatusCode, String)> {
    let registry = state.terminals.registry();
    let sandboxes = registry.list().await.map_err(|e| (error_status(&e), e.to_string()))?;
    Ok(Json(SandboxesResponse {
        backend: registry.backend_name(),
        sandboxes,
        resolved: registry.known().await,
    }))
}

async fn reset_sandbox(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<ResetResponse>, (StatusCode, String)> {
    let key = SandboxKey::parse(&raw).ok_or((StatusCode::BAD_REQUEST, "invalid sandbox key".to_string()))?;
    let closed_sessions = state.terminals.reset_sandbox(&key).await.map_err(|e| {
        error!(sandbox = %key, error = %e, "sandbox reset failed");
        (error_status(&e), e.to_string())
    })?;
    Ok(Json(ResetResponse { key, closed_sessions }))
}

async fn advice_status(State(state): State<AppState>) -> Json<AdviceStatus> {
    let strategy = state.terminals.advice().strategy();
    Json(AdviceStatus {
        strategy: strategy.label(),
        provider: strategy.provider_name().map(str::to_string),
    })
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Forwards one session's events to the socket writer until the session
/// closes or the writer goes away.
fn forward_events(
    session_id: String,
    mut events: broadcast::Receiver<TerminalEvent>,
    tx: mpsc::Sender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let msg = match events.recv().await {
                Ok(TerminalEvent::Output(data)) => ServerMessage::Output { data },
                Ok(TerminalEvent::Suggestion(suggestion)) => ServerMessage::Suggestion { suggestion },
                Ok(TerminalEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                    let _ = tx
                        .send(ServerMessage::Closed {
                            session_id: session_id.clone(),
                        })
                        .await;
                    return;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session_id = %session_id, skipped, "client fell behind, dropped events");
                    continue;
                }
            };
            if tx.send(msg).await.is_err() {
                return;
            }
        }
    })
}

/// The socket's current session and the task relaying its events.
#[derive(Default)]
struct Binding {
    session_id: Option<String>,
    forwarder: Option<JoinHandle<()>>,
}

impl Binding {
    fn bind(&mut self, session_id: String, forwarder: JoinHandle<()>) {
        self.unbind();
        self.session_id = Some(session_id);
        self.forwarder = Some(forwarder);
    }

    fn unbind(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
        self.session_id = None;
    }
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(256);

    // Task: forward channel messages to WebSocket sink
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("ws send: failed to serialize message: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut binding = Binding::default();
    while let Some(Ok(msg)) = ws_stream.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let parsed: ClientMessage = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                let _ = tx
                    .send(ServerMessage::Error {
                        message: format!("invalid message: {e}"),
                    })
                    .await;
                continue;
            }
        };
        if handle_message(&state, &tx, &mut binding, parsed).await.is_err() {
            break;
        }
    }

    // Sessions outlive the socket; they can be re-attached or get reaped.
    if let Some(id) = &binding.session_id {
        debug!(session_id = %id, "websocket disconnected, session detached");
    }
    binding.unbind();
    drop(tx);
    let _ = send_task.await;
}

/// Applies one client message. Errors only when the writer is gone.
async fn handle_message(
    state: &AppState,
    tx: &mpsc::Sender<ServerMessage>,
    binding: &mut Binding,
    msg: ClientMessage,
) -> Result<(), mpsc::error::SendError<ServerMessage>> {
    let terminals = &state.terminals;
    match msg {
        ClientMessage::Open {
            student_id,
            course_name,
            rows,
            cols,
        } => {
            let defaults = terminals.default_size();
            let size = WindowSize {
                rows: rows.unwrap_or(defaults.rows),
                cols: cols.unwrap_or(defaults.cols),
            };
            match terminals.open(&student_id, &course_name, size).await {
                Ok(opened) => {
                    tx.send(ServerMessage::Opened {
                        session_id: opened.session_id.clone(),
                        mode: opened.mode,
                    })
                    .await?;
                    for notice in opened.notices {
                        tx.send(ServerMessage::Output {
                            data: format!("{notice}\r\n"),
                        })
                        .await?;
                    }
                    let forwarder = forward_events(opened.session_id.clone(), opened.events, tx.clone());
                    binding.bind(opened.session_id, forwarder);
                }
                Err(e) => {
                    error!(student = %student_id, course = %course_name, error = %e, "terminal open failed");
                    tx.send(ServerMessage::Error {
                        message: e.client_message(),
                    })
                    .await?;
                }
            }
        }
        ClientMessage::Attach { session_id } => match terminals.attach(&session_id).await {
            Some(attached) => {
                tx.send(ServerMessage::Opened {
                    session_id: session_id.clone(),
                    mode: attached.mode,
                })
                .await?;
                let forwarder = forward_events(session_id.clone(), attached.events, tx.clone());
                binding.bind(session_id, forwarder);
            }
            None => {
                tx.send(ServerMessage::Error {
                    message: format!("no such session: {session_id}"),
                })
                .await?;
            }
        },
        ClientMessage::Input { data } => {
            if let Some(id) = &binding.session_id {
                terminals.send_input(id, &data).await;
            }
        }
        ClientMessage::Resize { rows, cols } => {
            if let Some(id) = &binding.session_id {
                if let Err(e) = terminals.resize(id, WindowSize { rows, cols }).await {
                    warn!(session_id = %id, error = %e, "resize failed");
                }
            }
        }
        ClientMessage::Ask { question } => {
            let answer = match &binding.session_id {
                Some(id) => terminals.ask(id, &question).await,
                None => None,
            };
            let msg = match answer {
                Some(suggestion) => ServerMessage::Suggestion { suggestion },
                None => ServerMessage::Error {
                    message: "nothing to answer from yet".to_string(),
                },
            };
            tx.send(msg).await?;
        }
        ClientMessage::Close => {
            if let Some(id) = binding.session_id.clone() {
                binding.unbind();
                terminals.close(&id).await;
                tx.send(ServerMessage::Closed { session_id: id }).await?;
            }
        }
    }
    Ok(())
}
