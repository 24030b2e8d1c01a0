//! HTTP/WebSocket surface.
//!
//! One chat WebSocket per user at `/v1/ws/chat/:uid/:mode`. Incoming frames
//! are parsed into [`ClientMessage`]s and handed to the session manager;
//! outgoing frames flow through a per-connection channel registered with the
//! [`ConnectionManager`], so a reconnect cleanly replaces the old socket.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::messages::ClientMessage;
use crate::pipeline::ChatMode;
use crate::session::SessionManager;
use crate::transport::ConnectionManager;

#[derive(Clone)]
pub struct ServerState {
    pub sessions: Arc<SessionManager>,
    pub connections: Arc<ConnectionManager>,
    pub auth: BackendAuthConfig,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub async fn serve(
    bind_addr: &str,
    sessions: Arc<SessionManager>,
    connections: Arc<ConnectionManager>,
    timeout_rx: mpsc::Receiver<String>,
) -> Result<()> {
    let bind_addr = bind_addr
        .parse::<SocketAddr>()
        .context("Invalid bind address (expected host:port)")?;

    let auth = load_auth_config()?;
    let state = Arc::new(ServerState {
        sessions: Arc::clone(&sessions),
        connections,
        auth,
    });

    spawn_timeout_bridge(timeout_rx, sessions);

    let protected = Router::new()
        .route("/health", get(health))
        .route("/ws/chat/:uid/:mode", get(ws_chat_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let app = Router::new().nest("/v1", protected);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind server to {}", bind_addr))?;
    tracing::info!("Beebo backend listening on http://{}", bind_addr);
    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}

/// Tool-call timeouts fire off the turn loop; this bridge feeds them back
/// through it so the synthesized error results get a model response.
fn spawn_timeout_bridge(mut timeout_rx: mpsc::Receiver<String>, sessions: Arc<SessionManager>) {
    tokio::spawn(async move {
        while let Some(uid) = timeout_rx.recv().await {
            if let Err(e) = sessions.process_tool_timeout(&uid).await {
                tracing::error!("Tool timeout handling failed for {}: {:#}", uid, e);
            }
        }
    });
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("BEEBO_AUTH_MODE").ok())?;
    let token = std::env::var("BEEBO_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "BEEBO_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Auth mode is disabled; all routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid BEEBO_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn ws_chat_route(
    State(state): State<Arc<ServerState>>,
    Path((uid, mode)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let mode = match ChatMode::parse(&mode) {
        Ok(mode) => mode,
        Err(e) => {
            tracing::warn!("Rejecting chat socket for {}: {:#}", uid, e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_chat_socket(state, socket, uid, mode))
        .into_response()
}

async fn handle_chat_socket(
    state: Arc<ServerState>,
    socket: WebSocket,
    uid: String,
    mode: ChatMode,
) {
    tracing::info!("Chat socket opened for {} in {} mode", uid, mode.as_str());
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Value>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let payload = match serde_json::to_string(&frame) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("Failed to serialize outgoing frame: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    state.connections.connect(&uid, tx.clone()).await;

    if let Err(e) = state.sessions.start_conversation(&uid, mode).await {
        tracing::error!("Failed to open conversation for {}: {:#}", uid, e);
    }

    while let Some(incoming) = ws_rx.next().await {
        match incoming {
            Ok(Message::Text(text)) => {
                let data: Value = match serde_json::from_str(&text) {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::warn!("Unparseable frame from {}: {}", uid, e);
                        continue;
                    }
                };
                match ClientMessage::parse(&data) {
                    Ok(message) => {
                        if let Err(e) = state.sessions.process_client_message(&uid, message).await
                        {
                            tracing::error!("Turn failed for {}: {:#}", uid, e);
                        }
                    }
                    Err(e) => tracing::warn!("Unrecognized frame from {}: {:#}", uid, e),
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    state.connections.disconnect(&uid, &tx).await;
    state.sessions.end_session(&uid).await;
    writer.abort();
    tracing::info!("Chat socket closed for {}", uid);
}
