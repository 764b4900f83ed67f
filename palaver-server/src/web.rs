//! HTTP surface: the WebSocket transport plus a small JSON API.
//!
//! `/ws` upgrades to a WebSocket and bridges it to the same connection
//! handler the raw TCP listener uses, one JSON frame per text message.
//! The REST routes are reads over the persistence layer, plus the account
//! routes from [`crate::auth`].

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::protocol::{MessageRecord, UserRecord};
use crate::server::SharedState;

// ── WebSocket ↔ frame bridge ───────────────────────────────────────────

/// A WebSocket exposed as `AsyncRead + AsyncWrite`.
///
/// Each inbound message comes out of the reader as exactly one
/// newline-terminated frame; each line written to the writer goes back out
/// as one text message.
pub struct WsBridge {
    reader: tokio::io::ReadHalf<tokio::io::DuplexStream>,
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
}

fn bridge_ws(socket: WebSocket) -> WsBridge {
    let (ws_tx, mut ws_rx) = tokio::sync::mpsc::channel::<WsMessage>(64);

    let (conn_side, bridge_side) = tokio::io::duplex(16384);
    let (conn_read, conn_write) = tokio::io::split(conn_side);
    let (mut bridge_read, mut bridge_write) = tokio::io::split(bridge_side);

    // Owns the socket: inbound frames into the bridge, queued frames out.
    tokio::spawn(async move {
        let mut socket = socket;
        let send_timeout = tokio::time::Duration::from_secs(30);
        loop {
            tokio::select! {
                frame = socket.recv() => {
                    let bytes = match frame {
                        Some(Ok(WsMessage::Text(text))) => text.as_bytes().to_vec(),
                        Some(Ok(WsMessage::Binary(data))) => data.to_vec(),
                        Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(_)) => continue,
                    };
                    if bridge_write.write_all(&single_frame(bytes)).await.is_err() {
                        break;
                    }
                }
                msg = ws_rx.recv() => {
                    let Some(msg) = msg else { break };
                    match tokio::time::timeout(send_timeout, socket.send(msg)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) | Err(_) => {
                            tracing::debug!("WebSocket send failed or timed out, closing bridge");
                            break;
                        }
                    }
                }
            }
        }
        let _ = bridge_write.shutdown().await;
        let _ = socket.send(WsMessage::Close(None)).await;
    });

    // Splits the handler's output into lines, one text frame each.
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        let mut pending = Vec::new();
        loop {
            match bridge_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    for line in drain_lines(&mut pending) {
                        if ws_tx.send(WsMessage::Text(line.into())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    WsBridge {
        reader: conn_read,
        writer: conn_write,
    }
}

/// Fold one WebSocket message into a single line. A raw CR or LF can only
/// sit between JSON tokens (inside strings they must be escaped), so
/// turning them into spaces keeps a pretty-printed frame intact.
fn single_frame(mut bytes: Vec<u8>) -> Vec<u8> {
    for b in bytes.iter_mut() {
        if *b == b'\n' || *b == b'\r' {
            *b = b' ';
        }
    }
    bytes.push(b'\n');
    bytes
}

/// Remove every complete line from `pending`, leaving any partial tail.
fn drain_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(&pending[..pos]).into_owned();
        pending.drain(..=pos);
        lines.push(line);
    }
    lines
}

impl AsyncRead for WsBridge {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for WsBridge {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

// ── Axum router ────────────────────────────────────────────────────────

/// Build the axum router with WebSocket, REST and auth endpoints.
pub fn router(state: Arc<SharedState>) -> Router {
    let origin = match state.config.frontend_url.parse::<HeaderValue>() {
        Ok(origin) => Some(origin),
        Err(e) => {
            tracing::warn!("Ignoring invalid frontend URL {}: {e}", state.config.frontend_url);
            None
        }
    };
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origin))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true);

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/users", get(users))
        .route("/messages/{user1}/{user2}", get(conversation))
        .merge(crate::auth::routes())
        .layer(cors)
        .with_state(state)
        .layer(axum::middleware::from_fn(security_headers))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<SharedState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<SharedState>) {
    tracing::info!("New connection (websocket)");
    if let Err(e) = crate::connection::handle_generic(bridge_ws(socket), state).await {
        tracing::error!("WebSocket connection error: {e}");
    }
}

// ── REST handlers ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub identified: usize,
    pub uptime_secs: u64,
}

async fn health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.registry.len(),
        identified: state.registry.bound_count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

/// Every known user, online first.
async fn users(State(state): State<Arc<SharedState>>) -> Result<Json<Vec<UserRecord>>, StatusCode> {
    state
        .with_db(|db| db.list_users())
        .map(Json)
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Both directions of a conversation, oldest first.
async fn conversation(
    Path((user1, user2)): Path<(String, String)>,
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Vec<MessageRecord>>, StatusCode> {
    state
        .with_db(|db| db.messages_between(&user1, &user2))
        .map(Json)
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn security_headers(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    resp
}
