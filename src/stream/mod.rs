//! Realtime stream modules.
//!
//! - `client`: websocket transport, handshake, and reconnect handling.
//! - `connection`: consumer handle, lifecycle state, and handler dispatch.
//! - `proto`: protocol messages shared with the stream service.

/// Websocket client, connection builder, and reconnecting worker.
pub mod client;
/// Connection handle, events, and callback dispatch.
pub mod connection;
/// Stream protocol messages.
pub mod proto;
