//! Error types for the REST surface and the shared [`ErrorKind`] taxonomy.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::retry::RetryDecision;

/// Coarse error category shared by REST errors and stream faults.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Missing or rejected credential. Never retried.
    Auth,
    /// Non-retryable client error reported by the server.
    Request,
    /// Transient network or server failure.
    Transport,
    /// Transient failures persisted past the retry cap.
    ExhaustedRetries,
    /// The requested resource does not exist.
    NotFound,
    /// Response body did not match the expected schema.
    Decode,
    /// Stream disconnect that could not be recovered.
    Connection,
    /// Caller supplied an invalid argument.
    InvalidRequest,
    /// Caller cancelled the operation.
    Cancelled,
}

/// Errors returned by the REST transport and resource clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("http status {status}: {message}")]
    Request { status: StatusCode, message: String },

    #[error("service unavailable, status {status}: {message}")]
    Unavailable {
        status: StatusCode,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("giving up after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: usize,
        #[source]
        last: Box<ApiError>,
    },

    #[error("{resource} not found: {key}")]
    NotFound { resource: &'static str, key: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request cancelled")]
    Cancelled,
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::Request { .. } => ErrorKind::Request,
            Self::Unavailable { .. } | Self::Transport(_) => ErrorKind::Transport,
            Self::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Decode(_) => ErrorKind::Decode,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// HTTP status attached to the error, if the server produced one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Request { status, .. } | Self::Unavailable { status, .. } => Some(*status),
            Self::Transport(err) => err.status(),
            Self::ExhaustedRetries { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Whether the transport retries this error on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::Unavailable { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn retry_decision(&self) -> RetryDecision {
        match self {
            Self::Unavailable {
                retry_after: Some(delay),
                ..
            } => RetryDecision::RetryAfter(*delay),
            other => other.is_retryable().into(),
        }
    }
}
