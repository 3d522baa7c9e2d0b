//! Rust SDK for CipherX trading signals and realtime signal streams.
//!
//! The crate is organized by transport surface:
//! - `client`: the [`CipherXClient`] facade handed to consumers.
//! - `transport`: authenticated HTTP executor with bounded retries.
//! - `resources`: typed signal, token, and wallet clients.
//! - `stream`: reconnecting websocket client with callback dispatch.
//! - `retry`: shared retry and timeout utilities.

/// Facade composing every client.
pub mod client;
/// Client options and environment loading.
pub mod config;
/// REST error type and shared error kinds.
pub mod error;
/// Typed resource clients.
pub mod resources;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Realtime stream client, protocol types, and connection handle.
pub mod stream;
/// Authenticated request executor.
pub mod transport;
/// Wire models for signals, tokens, and wallets.
pub mod types;

pub use client::{CipherXClient, EnrichedSignal};
pub use config::{ClientOptions, StreamOptions};
pub use error::{ApiError, ErrorKind};
pub use resources::signals::SignalFilter;
pub use retry::RetryPolicy;
pub use stream::client::StreamError;
pub use stream::connection::{ConnectionState, StreamConnection, StreamEvent, StreamFault};
pub use stream::proto::StreamSubscription;
pub use types::{AlertRules, Signal, SignalAction, Token, Wallet, WalletTracking};
