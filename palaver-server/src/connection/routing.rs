//! # Message routing
//!
//! Persistence and delivery are separate concerns:
//!
//! - **Persistence**: every routed message is appended to the message
//!   store, whether or not the receiver is online.
//! - **Delivery**: if some connection is bound to the receiver's username
//!   (see [`ConnectionRegistry::lookup_connection`]) the stored record is
//!   pushed to that one connection. Otherwise nothing is sent.
//!
//! The sender is never told which of the two happened. Sender and receiver
//! are opaque strings here; whether the sender must match the connection's
//! identity is decided by the caller (see `enforce_identity`).
//!
//! [`ConnectionRegistry::lookup_connection`]: crate::registry::ConnectionRegistry::lookup_connection

use crate::protocol::ServerEvent;
use crate::registry::ConnectionId;
use crate::server::SharedState;

/// Outcome of routing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteResult {
    /// Stored and queued for this connection.
    Delivered(ConnectionId),
    /// Stored; the receiver has no live connection (or its queue is full).
    Stored,
    /// The message store rejected the write. Nothing was delivered.
    NotStored,
}

/// Persist a message and deliver it to the receiver's live connection.
pub fn route(state: &SharedState, sender: &str, receiver: &str, body: &str) -> RouteResult {
    let Some(record) = state.with_db(|db| db.append_message(sender, receiver, body)) else {
        tracing::warn!(sender, receiver, "Message not stored, skipping delivery");
        return RouteResult::NotStored;
    };

    let Some(conn_id) = state.registry.lookup_connection(receiver) else {
        tracing::debug!(sender, receiver, msgid = %record.id, "Receiver offline, stored only");
        return RouteResult::Stored;
    };

    if state
        .registry
        .send_to(conn_id, ServerEvent::MessageDelivered { message: record })
    {
        tracing::debug!(sender, receiver, conn_id, "Message delivered");
        RouteResult::Delivered(conn_id)
    } else {
        RouteResult::Stored
    }
}
