//! Bounded exponential-backoff retry for remote calls.
//!
//! [`RetryPolicy::call`] wraps any zero-argument async operation that returns
//! `Result<T, FetchError>`. Only [`FetchError::Transient`] is retried; every
//! other error is returned on the spot.
//!
//! # Backoff
//!
//! The wait before retry `n` (1-based) is `initial × 2^(n-1)`, capped at
//! `max`. With the defaults (3 attempts, 2s initial, 10s cap) a call that
//! keeps failing waits 2s, then 4s, then gives up with the last error.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::config::RetryConfig;

/// Errors from a remote fetch, classified for the retry policy.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network failure, timeout, rate limiting or server error. Retried.
    #[error("transient network error: {0}")]
    Transient(String),
    /// Non-retryable HTTP status (client errors other than 429).
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    /// Response body could not be decoded.
    #[error("invalid upstream response: {0}")]
    Decode(String),
    /// Local misconfiguration (missing credential, bad URL).
    #[error("configuration error: {0}")]
    Config(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    /// Classify a `reqwest` transport error.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else if err.is_builder() {
            FetchError::Config(err.to_string())
        } else {
            FetchError::Transient(err.to_string())
        }
    }

    /// Classify a non-success HTTP status. 429 and 5xx are transient.
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status.as_u16() == 429 || status.is_server_error() {
            FetchError::Transient(format!("HTTP {}: {}", status, body))
        } else {
            FetchError::Status {
                status: status.as_u16(),
                body,
            }
        }
    }
}

/// Send a prepared request and decode a successful JSON body.
pub async fn get_json<T: serde::de::DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, FetchError> {
    let response = request.send().await.map_err(FetchError::from_reqwest)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(FetchError::from_status(status, body));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| FetchError::Decode(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `operation`, retrying transient failures until attempts run out.
    pub async fn call<T, F, Fut>(&self, mut operation: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff_for(attempt);
                    warn!(attempt, ?delay, error = %err, "remote call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
