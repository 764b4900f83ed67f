//! Presence: keeps each user's online flag in step with the registry and
//! broadcasts the full user list whenever it changes.
//!
//! Each transition runs under `SharedState::presence_gate`: the registry
//! mutation, the directory write and the snapshot that is broadcast all
//! belong to one event.
//!
//! Known gap: going offline does not check whether another connection
//! still holds the same username. If two connections identify as `alice`
//! and one of them leaves, `alice` is marked offline although the other is
//! still reachable. Open for decision: count bindings per username, or
//! refuse a second `identify` for a name that is already bound.

use chrono::Utc;

use crate::protocol::{ServerEvent, UserRecord};
use crate::registry::ConnectionId;
use crate::server::SharedState;

/// A connection identified as `username`.
///
/// A connection that was already bound under another name gives that name
/// up, and it goes offline in the same transition.
pub fn on_identify(state: &SharedState, conn_id: ConnectionId, username: &str) {
    let _gate = state.presence_gate.lock();
    if let Some(previous) = state.registry.bind(conn_id, username).filter(|p| p != username) {
        go_offline(state, &previous);
    }
    state.with_db(|db| db.upsert_user(username, true, Utc::now()));
    tracing::info!(conn_id, username, "User identified");
    broadcast_snapshot(state);
}

/// A connection logged out as `username`. The connection stays open but
/// becomes anonymous. If it was bound under a different name, that name
/// goes offline too.
pub fn on_logout(state: &SharedState, conn_id: ConnectionId, username: &str) {
    let _gate = state.presence_gate.lock();
    let dropped = state.registry.unbind(conn_id);
    go_offline(state, username);
    if let Some(dropped) = dropped.filter(|d| d != username) {
        go_offline(state, &dropped);
    }
    tracing::info!(conn_id, username, "User logged out");
    broadcast_snapshot(state);
}

/// A connection closed. Runs exactly once per connection, after its last
/// frame has been handled. Returns the username it was bound to, if any;
/// anonymous connections cause no directory write and no broadcast.
pub fn on_disconnect(state: &SharedState, conn_id: ConnectionId) -> Option<String> {
    let _gate = state.presence_gate.lock();
    let username = state.registry.disconnect(conn_id)?;
    go_offline(state, &username);
    tracing::info!(conn_id, username = %username, "User disconnected");
    broadcast_snapshot(state);
    Some(username)
}

/// Current user list in broadcast order, or `None` if the directory is unreadable.
pub fn snapshot(state: &SharedState) -> Option<Vec<UserRecord>> {
    state.with_db(|db| db.list_users())
}

fn go_offline(state: &SharedState, username: &str) {
    if state.registry.is_anyone_bound(username) {
        tracing::warn!(username, "Marking offline while another connection is still bound");
    }
    state.with_db(|db| db.mark_offline(username, Utc::now()));
}

fn broadcast_snapshot(state: &SharedState) {
    let Some(users) = snapshot(state) else {
        tracing::warn!("Skipping presence broadcast, directory unavailable");
        return;
    };
    let reached = state.registry.broadcast(&ServerEvent::PresenceSnapshot { users });
    tracing::debug!(reached, "Presence snapshot broadcast");
}
