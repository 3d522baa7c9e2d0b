use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ClientOptions;
use crate::error::ApiError;
use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);
pub(crate) const API_KEY_HEADER: &str = "x-api-key";

/// A single REST call: method, path relative to the base URL, query pairs and
/// an optional JSON body.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(&'static str, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn query(mut self, key: &'static str, value: impl ToString) -> Self {
        self.query.push((key, value.to_string()));
        self
    }

    pub fn query_opt<T: ToString>(self, key: &'static str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.query(key, value),
            None => self,
        }
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Successful response with the raw body left for the caller to decode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

/// Authenticated HTTP executor with bounded retries.
///
/// Clones share the underlying connection pool.
#[derive(Clone)]
pub struct Transport {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl Transport {
    pub fn new(api_key: Option<SecretString>, options: &ClientOptions) -> Result<Self, ApiError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            base_url: options.base_url.clone(),
            api_key,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Executes `request`, retrying transient failures.
    ///
    /// Fails with [`ApiError::Auth`] before any network call when no
    /// credential is configured. Transient failures that outlast the policy
    /// surface as [`ApiError::ExhaustedRetries`].
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ApiError::Auth("api key is not configured".to_string()))?;
        let endpoint = self.endpoint(&request.path);

        let result = retry_async(
            &self.retry_policy,
            |attempt| {
                let endpoint = endpoint.clone();
                async move { self.send_attempt(&endpoint, request, api_key, attempt).await }
            },
            ApiError::retry_decision,
        )
        .await;

        match result {
            Err(error) if error.is_retryable() => {
                let attempts = self.retry_policy.max_attempts.max(1);
                warn!(
                    event = "api_retries_exhausted",
                    method = %request.method,
                    path = %request.path,
                    attempts,
                    error = %error
                );
                Err(ApiError::ExhaustedRetries {
                    attempts,
                    last: Box::new(error),
                })
            }
            other => other,
        }
    }

    /// Executes `request` unless `cancel` resolves first.
    ///
    /// On cancellation the in-flight attempt and any pending backoff are
    /// dropped and [`ApiError::Cancelled`] is returned.
    pub async fn execute_until<F>(
        &self,
        request: &ApiRequest,
        cancel: F,
    ) -> Result<ApiResponse, ApiError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => {
                debug!(event = "api_request_cancelled", path = %request.path);
                Err(ApiError::Cancelled)
            }
            result = self.execute(request) => result,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_attempt(
        &self,
        endpoint: &str,
        request: &ApiRequest,
        api_key: &SecretString,
        attempt: usize,
    ) -> Result<ApiResponse, ApiError> {
        debug!(
            event = "api_request",
            method = %request.method,
            path = %request.path,
            attempt
        );

        let mut builder = self
            .http
            .request(request.method.clone(), endpoint)
            .timeout(self.attempt_timeout)
            .header(API_KEY_HEADER, api_key.expose_secret());

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(ApiError::Transport)?;
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.map_err(ApiError::Transport)?;

        if status.is_success() {
            return Ok(ApiResponse { status, body });
        }

        Err(classify_status(status, &body, retry_after))
    }
}

fn classify_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> ApiError {
    let message = summarize_error_body(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Auth(message),
        StatusCode::TOO_MANY_REQUESTS => ApiError::Unavailable {
            status,
            message,
            retry_after,
        },
        status if status.is_server_error() => ApiError::Unavailable {
            status,
            message,
            retry_after,
        },
        status => ApiError::Request { status, message },
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(std::cmp::min(Duration::from_secs(seconds), MAX_RETRY_AFTER))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
