//! Typed resource clients over [`Transport`](crate::transport::Transport).
//!
//! - `signals`: trading signal listing and lookup.
//! - `tokens`: token market metadata.
//! - `wallets`: wallet summaries and alert tracking.

use serde::de::DeserializeOwned;

use crate::error::ApiError;
use crate::transport::ApiResponse;

/// Signal listing and lookup.
pub mod signals;
/// Token metadata lookup.
pub mod tokens;
/// Wallet summaries and tracking registration.
pub mod wallets;

pub(crate) fn decode_body<T: DeserializeOwned>(
    what: &'static str,
    response: &ApiResponse,
) -> Result<T, ApiError> {
    serde_json::from_str(&response.body)
        .map_err(|err| ApiError::Decode(format!("{what} response: {err}")))
}

/// Maps a 404 from the transport onto [`ApiError::NotFound`].
pub(crate) fn not_found_as<'a>(
    resource: &'static str,
    key: &'a str,
) -> impl FnOnce(ApiError) -> ApiError + 'a {
    move |error| match error {
        ApiError::Request { status, .. } if status == reqwest::StatusCode::NOT_FOUND => {
            ApiError::NotFound {
                resource,
                key: key.to_string(),
            }
        }
        other => other,
    }
}

/// Validates a value that is interpolated into a URL path.
pub(crate) fn path_segment<'a>(what: &str, value: &'a str) -> Result<&'a str, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::InvalidRequest(format!("{what} must not be empty")));
    }
    if value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#' | '%'))
    {
        return Err(ApiError::InvalidRequest(format!(
            "{what} contains characters not allowed in a path: {value}"
        )));
    }
    Ok(value)
}
