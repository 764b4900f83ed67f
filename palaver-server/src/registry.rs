//! Connection registry.
//!
//! The in-memory source of truth for "who is reachable right now". Every
//! live connection has a [`Session`] holding its outbound queue and, once it
//! has identified, its username. Nothing here touches storage.
//!
//! Bindings are not unique per username: two connections may claim the same
//! name. [`ConnectionRegistry::lookup_connection`] then returns the
//! lowest-numbered (earliest accepted) connection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::ServerEvent;

/// Opaque per-connection identifier, assigned in accept order.
pub type ConnectionId = u64;

/// Server-side state of one live connection.
#[derive(Debug)]
pub struct Session {
    tx: mpsc::Sender<ServerEvent>,
    username: Option<String>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<BTreeMap<ConnectionId, Session>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new anonymous connection and return its ID.
    pub fn connect(&self, tx: mpsc::Sender<ServerEvent>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.lock().insert(id, Session { tx, username: None });
        id
    }

    /// Remove a connection entirely, returning the username it was bound to.
    pub fn disconnect(&self, conn_id: ConnectionId) -> Option<String> {
        self.sessions.lock().remove(&conn_id).and_then(|s| s.username)
    }

    /// Bind `username` to a connection, replacing any earlier binding for
    /// that connection and returning the name it replaced. Other connections
    /// bound to the same name are left alone. Binding a connection that
    /// already closed is a no-op.
    pub fn bind(&self, conn_id: ConnectionId, username: &str) -> Option<String> {
        match self.sessions.lock().get_mut(&conn_id) {
            Some(session) => session.username.replace(username.to_string()),
            None => {
                tracing::debug!(conn_id, username, "bind on closed connection ignored");
                None
            }
        }
    }

    /// Clear a connection's binding, returning the username it held.
    /// Idempotent: unbinding an anonymous or unknown connection returns `None`.
    pub fn unbind(&self, conn_id: ConnectionId) -> Option<String> {
        self.sessions.lock().get_mut(&conn_id).and_then(|s| s.username.take())
    }

    /// Username bound to a connection, if any.
    pub fn username_of(&self, conn_id: ConnectionId) -> Option<String> {
        self.sessions.lock().get(&conn_id).and_then(|s| s.username.clone())
    }

    /// First connection (in accept order) bound to `username`.
    pub fn lookup_connection(&self, username: &str) -> Option<ConnectionId> {
        self.sessions
            .lock()
            .iter()
            .find(|(_, s)| s.username.as_deref() == Some(username))
            .map(|(id, _)| *id)
    }

    /// Whether any live connection is bound to `username`.
    pub fn is_anyone_bound(&self, username: &str) -> bool {
        self.lookup_connection(username).is_some()
    }

    /// Number of live connections, identified or not.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Number of connections that have identified.
    pub fn bound_count(&self) -> usize {
        self.sessions.lock().values().filter(|s| s.username.is_some()).count()
    }

    /// Queue an event for one connection. Returns `false` if the connection
    /// is gone or its outbound queue is full.
    pub fn send_to(&self, conn_id: ConnectionId, event: ServerEvent) -> bool {
        let sessions = self.sessions.lock();
        let Some(session) = sessions.get(&conn_id) else {
            return false;
        };
        queue(conn_id, &session.tx, event)
    }

    /// Queue an event for every live connection, anonymous ones included.
    /// Returns how many connections accepted it.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        let sessions = self.sessions.lock();
        sessions
            .iter()
            .filter(|(id, s)| queue(**id, &s.tx, event.clone()))
            .count()
    }
}

fn queue(conn_id: ConnectionId, tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(conn_id, "Outbound buffer full, dropping frame");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
