//! Direct-messaging server with live presence.
//!
//! Clients connect over WebSocket (`/ws`) or raw TCP, announce a username
//! with `identify`, and exchange point-to-point messages. Every message is
//! persisted; it is also delivered live when the receiver is connected.
//! Every membership change broadcasts the full user list to all connections.

pub mod auth;
pub mod config;
pub mod connection;
pub mod db;
pub mod msgid;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod web;
