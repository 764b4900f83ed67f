//! Per-client connection handler.
//!
//! Each connection (raw TCP, or a WebSocket bridged to a byte stream) runs
//! one task that reads newline-delimited JSON frames and handles them one
//! at a time, plus a writer task draining the connection's outbound queue.
//!
//! Direct messages are persisted and delivered by [`routing`].
//!
//! When the read side ends (EOF, I/O error, or a closed WebSocket) the
//! connection is removed from the registry and presence is updated, once.

pub mod routing;

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::presence;
use crate::protocol::{validate_username, ClientEvent, ServerEvent};
use crate::registry::ConnectionId;
use crate::server::SharedState;

/// Largest accepted inbound frame, excluding the trailing newline.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Handle a plain TCP connection.
pub async fn handle(stream: TcpStream, state: Arc<SharedState>) -> Result<()> {
    let peer = stream.peer_addr()?;
    tracing::info!(%peer, "New connection (tcp)");
    handle_generic(stream, state).await
}

/// Handle a generic async stream (WebSocket bridge or other wrappers).
pub async fn handle_generic<S>(stream: S, state: Arc<SharedState>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);

    let (tx, rx) = mpsc::channel::<ServerEvent>(state.config.outbound_buffer.max(1));
    let conn_id = state.registry.connect(tx);
    tracing::info!(conn_id, "Connection opened");

    // The writer exits on its own once the registry drops the sender.
    tokio::spawn(write_loop(conn_id, writer, rx));

    let result = read_loop(conn_id, BufReader::new(reader), &state).await;

    let username = presence::on_disconnect(&state, conn_id);
    tracing::info!(
        conn_id,
        username = username.as_deref().unwrap_or("-"),
        "Connection closed"
    );
    result
}

async fn read_loop<R>(conn_id: ConnectionId, mut reader: R, state: &SharedState) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        match next_frame(&mut reader, &mut buf).await? {
            Frame::Eof => return Ok(()),
            Frame::TooLong => {
                tracing::warn!(conn_id, "Frame too long, dropping");
                reply(state, conn_id, ServerEvent::error("frame too long"));
            }
            Frame::Line => {
                let Ok(text) = std::str::from_utf8(&buf) else {
                    reply(state, conn_id, ServerEvent::error("frame is not valid UTF-8"));
                    continue;
                };
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                tracing::debug!(conn_id, "<- {text}");
                match serde_json::from_str::<ClientEvent>(text) {
                    Ok(event) => dispatch(state, conn_id, event),
                    Err(e) => {
                        tracing::warn!(conn_id, "Malformed frame: {e}");
                        reply(state, conn_id, ServerEvent::error(format!("malformed frame: {e}")));
                    }
                }
            }
        }
    }
}

enum Frame {
    /// A complete frame is in the buffer.
    Line,
    /// The frame exceeded [`MAX_FRAME_LEN`] and was discarded.
    TooLong,
    Eof,
}

async fn next_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = MAX_FRAME_LEN as u64 + 1;
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Frame::Eof);
    }
    if buf.len() > MAX_FRAME_LEN && buf.last() != Some(&b'\n') {
        // Skip the rest of the oversized line.
        let mut rest = Vec::new();
        loop {
            rest.clear();
            let m = (&mut *reader).take(limit).read_until(b'\n', &mut rest).await?;
            if m == 0 || rest.last() == Some(&b'\n') {
                break;
            }
        }
        return Ok(Frame::TooLong);
    }
    Ok(Frame::Line)
}

/// Handle one inbound event for a connection. Runs to completion before the
/// connection's next frame is read.
pub fn dispatch(state: &SharedState, conn_id: ConnectionId, event: ClientEvent) {
    match event {
        ClientEvent::Identify { username } => {
            if let Err(reason) = validate_username(&username) {
                tracing::warn!(conn_id, "Rejected identify: {reason}");
                reply(state, conn_id, ServerEvent::error(reason));
                return;
            }
            presence::on_identify(state, conn_id, &username);
        }
        ClientEvent::Send { receiver, body, sender } => {
            let sender = match resolve_sender(state, conn_id, sender) {
                Ok(sender) => sender,
                Err(reason) => {
                    tracing::warn!(conn_id, receiver = %receiver, "Rejected send: {reason}");
                    reply(state, conn_id, ServerEvent::error(reason));
                    return;
                }
            };
            routing::route(state, &sender, &receiver, &body);
        }
        ClientEvent::Logout { username } => {
            if state.config.enforce_identity
                && state.registry.username_of(conn_id).as_deref() != Some(username.as_str())
            {
                tracing::warn!(conn_id, username = %username, "Rejected logout for another identity");
                reply(state, conn_id, ServerEvent::error("cannot log out another user"));
                return;
            }
            presence::on_logout(state, conn_id, &username);
        }
        ClientEvent::Ping => reply(state, conn_id, ServerEvent::Pong),
    }
}

/// Decide which username a `send` goes out as.
///
/// Without `enforce_identity` a claimed sender is taken as given. With it,
/// a claimed sender must equal the connection's bound username.
fn resolve_sender(
    state: &SharedState,
    conn_id: ConnectionId,
    claimed: Option<String>,
) -> Result<String, &'static str> {
    let bound = state.registry.username_of(conn_id);
    match (claimed, bound) {
        (Some(claimed), _) if !state.config.enforce_identity => Ok(claimed),
        (Some(claimed), Some(bound)) if claimed == bound => Ok(claimed),
        (Some(_), Some(_)) => Err("sender does not match identified username"),
        (None, Some(bound)) => Ok(bound),
        (_, None) => Err("identify before sending"),
    }
}

fn reply(state: &SharedState, conn_id: ConnectionId, event: ServerEvent) {
    state.registry.send_to(conn_id, event);
}

async fn write_loop<W>(conn_id: ConnectionId, mut writer: W, mut rx: mpsc::Receiver<ServerEvent>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        if let Err(e) = write_event(&mut writer, &event).await {
            tracing::warn!(conn_id, "Write error: {e}");
            return;
        }
        // Drain any queued frames and flush them together.
        let mut batch_count = 0;
        while let Ok(queued) = rx.try_recv() {
            if let Err(e) = write_event(&mut writer, &queued).await {
                tracing::warn!(conn_id, "Write error: {e}");
                return;
            }
            batch_count += 1;
            if batch_count >= 64 {
                break;
            }
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!(conn_id, "Flush error: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_event<W>(writer: &mut W, event: &ServerEvent) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}
