//! Client options, defaults, and environment loading.

use std::time::Duration;

use secrecy::SecretString;

use crate::retry::RetryPolicy;

pub const API_BASE_URL: &str = "https://api.cipherx.io";
pub const LOCAL_API_BASE_URL: &str = "http://localhost:8080";
pub const STREAM_ENDPOINT: &str = "wss://stream.cipherx.io/v1/ws";
pub const LOCAL_STREAM_ENDPOINT: &str = "ws://localhost:8082/v1/ws";

pub const API_KEY_ENV: &str = "CIPHERX_API_KEY";
pub const API_URL_ENV: &str = "CIPHERX_API_URL";
pub const STREAM_URL_ENV: &str = "CIPHERX_STREAM_URL";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientDefaults;

impl ClientDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HANDLER_QUEUE_CAPACITY: usize = 1024;
}

/// Options for the realtime stream connection.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Backoff between reconnect attempts. `max_attempts` caps consecutive
    /// failed attempts before the connection closes with a terminal error.
    pub reconnect: RetryPolicy,
    /// Events buffered per handler before new events are dropped for it.
    pub handler_queue_capacity: usize,
    /// Upper bound for the websocket upgrade plus `hello_ok` exchange.
    pub handshake_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            reconnect: RetryPolicy::reconnect(),
            handler_queue_capacity: ClientDefaults::HANDLER_QUEUE_CAPACITY,
            handshake_timeout: ClientDefaults::HANDSHAKE_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub base_url: String,
    pub stream_url: String,
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub stream: StreamOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: API_BASE_URL.to_string(),
            stream_url: STREAM_ENDPOINT.to_string(),
            connect_timeout: ClientDefaults::CONNECT_TIMEOUT,
            attempt_timeout: ClientDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::standard(),
            stream: StreamOptions::default(),
        }
    }
}

impl ClientOptions {
    /// Defaults with endpoint overrides taken from the environment.
    ///
    /// A `.env` file in the working directory is loaded first when present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut options = Self::default();
        if let Some(url) = non_empty_env(API_URL_ENV) {
            options = options.with_base_url(url);
        }
        if let Some(url) = non_empty_env(STREAM_URL_ENV) {
            options = options.with_stream_url(url);
        }
        options
    }

    /// Points both endpoints at the local development defaults.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        if local {
            self.base_url = LOCAL_API_BASE_URL.to_string();
            self.stream_url = LOCAL_STREAM_ENDPOINT.to_string();
        } else {
            self.base_url = API_BASE_URL.to_string();
            self.stream_url = STREAM_ENDPOINT.to_string();
        }
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = normalize_url(url.into());
        self
    }

    pub fn with_stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = normalize_url(url.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_stream_options(mut self, stream: StreamOptions) -> Self {
        self.stream = stream;
        self
    }
}

/// Reads the API key from `CIPHERX_API_KEY`, loading `.env` first.
pub fn api_key_from_env() -> Option<SecretString> {
    dotenvy::dotenv().ok();
    non_empty_env(API_KEY_ENV).map(SecretString::new)
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn normalize_url(url: String) -> String {
    url.trim().trim_end_matches('/').to_string()
}
