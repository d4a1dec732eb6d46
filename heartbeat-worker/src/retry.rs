//! HTTP POST client with bounded retries
//!
//! Providers get three retries on a fixed 1 s / 3 s / 8 s schedule, each
//! delay stretched by uniform jitter in [0, 25 %]. Only transport errors and
//! the retryable status set are retried; everything else surfaces
//! immediately. The idempotency key, when given, rides on every attempt so a
//! retried request can never double-deliver.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

/// Default timeout for provider requests
const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Base delay before each retry
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(8),
];
/// Statuses worth retrying
const RETRYABLE_STATUSES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];
/// Upper bound of the uniform jitter, as a fraction of the base delay
const JITTER_FACTOR: f64 = 0.25;
/// How much of an error body is worth keeping in logs
const ERROR_BODY_LIMIT: usize = 512;

/// Errors from provider HTTP calls
#[derive(Error, Debug)]
pub enum HttpClientError {
    /// Connection/TLS/timeout failure on the final attempt
    #[error("transport error after {attempts} attempts: {source}")]
    Transport {
        /// Attempts made, including the first
        attempts: usize,
        /// Underlying reqwest error
        #[source]
        source: reqwest::Error,
    },

    /// Non-retryable status; surfaced without retrying
    #[error("terminal status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, truncated
        body: String,
    },

    /// Retryable status on the final attempt
    #[error("status {status} after {attempts} attempts: {body}")]
    Exhausted {
        /// Attempts made, including the first
        attempts: usize,
        /// HTTP status code of the last response
        status: u16,
        /// Response body, truncated
        body: String,
    },

    /// The request body could not be replayed for a retry
    #[error("request is not replayable")]
    NotReplayable,
}

impl HttpClientError {
    /// Whether the outer supervisor may retry the cycle over this error
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Exhausted { .. })
    }

    /// Status code of the provider response, when there was one
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } | Self::Exhausted { status, .. } => Some(*status),
            Self::Transport { .. } | Self::NotReplayable => None,
        }
    }

    /// Provider response body, when there was one
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Status { body, .. } | Self::Exhausted { body, .. } => Some(body.as_str()),
            Self::Transport { .. } | Self::NotReplayable => None,
        }
    }
}

/// Shared retrying POST client
pub struct RetryClient {
    http: reqwest::Client,
    delays: Vec<Duration>,
    rng: Mutex<StdRng>,
}

impl RetryClient {
    /// Creates the client with the production schedule
    #[must_use]
    pub fn new() -> Self {
        Self::with_schedule(RETRY_DELAYS.to_vec(), rand::random())
    }

    /// Creates the client with an explicit schedule and RNG seed, for
    /// deterministic tests
    #[must_use]
    pub fn with_schedule(delays: Vec<Duration>, seed: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            http,
            delays,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// POSTs a JSON body, retrying per the schedule
    ///
    /// # Errors
    ///
    /// `HttpClientError` once the schedule is exhausted or on the first
    /// non-retryable status
    pub async fn post_json(
        &self,
        url: &str,
        bearer: Option<&str>,
        idempotency_key: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, HttpClientError> {
        let mut request = self.http.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        self.send_with_retries(request).await
    }

    /// POSTs a urlencoded form, retrying per the schedule
    ///
    /// # Errors
    ///
    /// As [`Self::post_json`]
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<serde_json::Value, HttpClientError> {
        let request = self.http.post(url).form(&form.to_vec());
        self.send_with_retries(request).await
    }

    async fn send_with_retries(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<serde_json::Value, HttpClientError> {
        let max_attempts = self.delays.len() + 1;

        for attempt in 1..=max_attempts {
            let prepared = request.try_clone().ok_or(HttpClientError::NotReplayable)?;
            match prepared.send().await {
                Ok(response) if response.status().is_success() => {
                    // Some endpoints answer 2xx with an empty body
                    return Ok(response.json().await.unwrap_or(serde_json::Value::Null));
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let mut body = response.text().await.unwrap_or_default();
                    body.truncate(ERROR_BODY_LIMIT);
                    if !RETRYABLE_STATUSES.contains(&status) {
                        return Err(HttpClientError::Status { status, body });
                    }
                    if attempt == max_attempts {
                        return Err(HttpClientError::Exhausted {
                            attempts: attempt,
                            status,
                            body,
                        });
                    }
                    tracing::warn!(status, attempt, "retryable provider status");
                }
                Err(source) => {
                    if attempt == max_attempts {
                        return Err(HttpClientError::Transport {
                            attempts: attempt,
                            source,
                        });
                    }
                    tracing::warn!(error = %source, attempt, "transport error, retrying");
                }
            }
            tokio::time::sleep(self.jittered_delay(attempt - 1)).await;
        }

        unreachable!("loop returns on the final attempt")
    }

    fn jittered_delay(&self, retry_index: usize) -> Duration {
        let base = self.delays[retry_index.min(self.delays.len() - 1)];
        let roll: f64 = self.rng.lock().unwrap().gen();
        base + base.mul_f64(roll * JITTER_FACTOR)
    }
}

impl Default for RetryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_a_quarter_of_base() {
        let client = RetryClient::with_schedule(RETRY_DELAYS.to_vec(), 7);
        for _ in 0..64 {
            let delay = client.jittered_delay(2);
            assert!(delay >= Duration::from_secs(8));
            assert!(delay <= Duration::from_secs(10));
        }
    }

    #[test]
    fn retryable_status_set_matches_policy() {
        for status in [408, 425, 429, 500, 502, 503, 504] {
            assert!(RETRYABLE_STATUSES.contains(&status));
        }
        for status in [400, 401, 403, 404, 409, 422] {
            assert!(!RETRYABLE_STATUSES.contains(&status));
        }
    }
}
