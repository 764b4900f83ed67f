//! Wire frames exchanged with clients.
//!
//! Each frame is a JSON object tagged by `type`:
//!
//! ```json
//! {"type":"identify","username":"alice"}
//! {"type":"send","receiver":"bob","body":"hi"}
//! {"type":"presence_snapshot","users":[{"username":"alice","isOnline":true,"lastSeen":"2024-05-01T10:00:00Z"}]}
//! ```
//!
//! On raw TCP a frame is one line; on WebSocket it is one text message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable presence state for one username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub username: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

/// A stored direct message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// ULID assigned at write time.
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Claim a username for this connection.
    Identify { username: String },
    /// Send a direct message. `sender` defaults to the identified username.
    Send {
        receiver: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    /// Mark `username` offline and drop this connection's binding.
    Logout { username: String },
    Ping,
}

/// Frames sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Every known user, online first, then by username.
    PresenceSnapshot { users: Vec<UserRecord> },
    /// A message addressed to this connection's username.
    MessageDelivered { message: MessageRecord },
    Pong,
    /// The previous frame was rejected. Never sent for routing or storage outcomes.
    Error { reason: String },
}

impl ServerEvent {
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error { reason: reason.into() }
    }
}

/// Longest username accepted by `identify`.
pub const MAX_USERNAME_LEN: usize = 64;

/// Check a username claimed by `identify`.
pub fn validate_username(username: &str) -> Result<(), &'static str> {
    if username.trim().is_empty() {
        return Err("username must not be empty");
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err("username is too long");
    }
    if username.chars().any(char::is_control) {
        return Err("username contains control characters");
    }
    Ok(())
}
