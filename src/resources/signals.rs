use serde::Deserialize;

use crate::error::ApiError;
use crate::resources::{decode_body, not_found_as, path_segment};
use crate::transport::{ApiRequest, Transport};
use crate::types::Signal;

/// Server-side query options for [`Signals::list`].
///
/// Every field is sent as a query parameter; nothing is filtered locally.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SignalFilter {
    /// Inclusive lower bound on confidence, within `[0, 1]`.
    pub min_confidence: Option<f64>,
    /// Maximum number of signals to return.
    pub limit: Option<u32>,
    /// Restrict to one token, by symbol or address.
    pub token: Option<String>,
}

impl SignalFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = Some(min_confidence);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn validate(&self) -> Result<(), ApiError> {
        if let Some(min) = self.min_confidence {
            if !min.is_finite() || !(0.0..=1.0).contains(&min) {
                return Err(ApiError::InvalidRequest(format!(
                    "min_confidence must be within [0, 1], got {min}"
                )));
            }
        }
        if let Some(token) = self.token.as_deref() {
            if token.trim().is_empty() {
                return Err(ApiError::InvalidRequest(
                    "token filter must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn to_request(&self) -> ApiRequest {
        ApiRequest::get("/v1/signals")
            .query_opt("minConfidence", self.min_confidence)
            .query_opt("limit", self.limit)
            .query_opt("token", self.token.as_deref().map(str::trim))
    }

    /// Rejects a page that contradicts the filter the server was given.
    fn check_page(&self, signals: &[Signal]) -> Result<(), ApiError> {
        if let Some(limit) = self.limit {
            if signals.len() > limit as usize {
                return Err(ApiError::Decode(format!(
                    "server returned {} signals for limit {limit}",
                    signals.len()
                )));
            }
        }
        if let Some(min) = self.min_confidence {
            if let Some(signal) = signals.iter().find(|s| s.confidence.value() < min) {
                return Err(ApiError::Decode(format!(
                    "signal {} has confidence {} below requested minimum {min}",
                    signal.id,
                    signal.confidence.value()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SignalPage {
    signals: Vec<Signal>,
}

/// Client for the `/v1/signals` resource.
#[derive(Clone)]
pub struct Signals {
    transport: Transport,
}

impl Signals {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// Lists signals in the order the server returns them.
    pub async fn list(&self, filter: &SignalFilter) -> Result<Vec<Signal>, ApiError> {
        filter.validate()?;
        let response = self.transport.execute(&filter.to_request()).await?;
        let page: SignalPage = decode_body("signals", &response)?;
        filter.check_page(&page.signals)?;
        Ok(page.signals)
    }

    /// Fetches one signal by id.
    pub async fn get(&self, id: &str) -> Result<Signal, ApiError> {
        let id = path_segment("signal id", id)?;
        let request = ApiRequest::get(format!("/v1/signals/{id}"));
        let response = self
            .transport
            .execute(&request)
            .await
            .map_err(not_found_as("signal", id))?;
        decode_body("signal", &response)
    }
}
