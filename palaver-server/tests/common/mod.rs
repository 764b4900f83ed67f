//! Shared helpers: in-process connections driven through `dispatch`
//! without any sockets.

#![allow(dead_code)]

use std::sync::Arc;

use palaver_server::config::ServerConfig;
use palaver_server::connection::dispatch;
use palaver_server::db::Db;
use palaver_server::presence;
use palaver_server::protocol::{ClientEvent, MessageRecord, ServerEvent, UserRecord};
use palaver_server::registry::ConnectionId;
use palaver_server::server::SharedState;
use tokio::sync::mpsc;

pub fn state() -> Arc<SharedState> {
    state_with(ServerConfig::for_test())
}

pub fn strict_state() -> Arc<SharedState> {
    let mut config = ServerConfig::for_test();
    config.enforce_identity = true;
    state_with(config)
}

pub fn state_with(config: ServerConfig) -> Arc<SharedState> {
    SharedState::new(config, Db::open_memory().unwrap())
}

/// A registered connection whose outbound queue the test reads directly.
pub struct Client {
    pub id: ConnectionId,
    rx: mpsc::Receiver<ServerEvent>,
}

impl Client {
    pub fn connect(state: &SharedState) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let id = state.registry.connect(tx);
        Self { id, rx }
    }

    pub fn identify(&self, state: &SharedState, username: &str) {
        dispatch(state, self.id, ClientEvent::Identify { username: username.into() });
    }

    pub fn send(&self, state: &SharedState, sender: Option<&str>, receiver: &str, body: &str) {
        dispatch(
            state,
            self.id,
            ClientEvent::Send {
                receiver: receiver.into(),
                body: body.into(),
                sender: sender.map(Into::into),
            },
        );
    }

    pub fn logout(&self, state: &SharedState, username: &str) {
        dispatch(state, self.id, ClientEvent::Logout { username: username.into() });
    }

    pub fn disconnect(self, state: &SharedState) -> Option<String> {
        presence::on_disconnect(state, self.id)
    }

    /// Everything queued for this connection so far.
    pub fn events(&mut self) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn snapshots(&mut self) -> Vec<Vec<UserRecord>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::PresenceSnapshot { users } => Some(users),
                _ => None,
            })
            .collect()
    }

    pub fn deliveries(&mut self) -> Vec<MessageRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::MessageDelivered { message } => Some(message),
                _ => None,
            })
            .collect()
    }
}

/// `(username, is_online)` pairs in snapshot order.
pub fn flags(users: &[UserRecord]) -> Vec<(String, bool)> {
    users.iter().map(|u| (u.username.clone(), u.is_online)).collect()
}

pub fn is_online(state: &SharedState, username: &str) -> Option<bool> {
    state
        .with_db(|db| db.find_user(username))
        .flatten()
        .map(|u| u.is_online)
}
