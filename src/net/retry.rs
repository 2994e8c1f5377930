use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::HttpSettings;
use crate::net::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::net::Headers;

/// Errors surfaced to handlers by the retry client
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Failure that no amount of retrying can fix
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("request to {url} failed after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        #[source]
        last: TransportError,
    },
}

/// Per-request options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: Headers,
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Serialize `value` as the JSON request body
    pub fn json<T: Serialize>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.body = Some(serde_json::to_vec(value)?);
        if !self.headers.contains("content-type") {
            self.headers.insert("Content-Type", "application/json");
        }
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_retry: u32,
    /// Wait before the second attempt
    pub retry_wait: Duration,
    pub backoff_multiplier: f64,
    pub max_wait: Duration,
    /// Response statuses treated like a transport failure
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: 3,
            retry_wait: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_wait: Duration::from_secs(30),
            retry_statuses: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &HttpSettings) -> Self {
        Self {
            max_retry: settings.max_retry,
            retry_wait: Duration::from_millis(settings.retry_wait_ms),
            backoff_multiplier: settings.backoff_multiplier,
            max_wait: Duration::from_millis(settings.max_wait_ms),
            retry_statuses: settings.retry_statuses.clone(),
        }
    }

    /// Fixed wait between attempts, no backoff
    pub fn fixed(max_retry: u32, retry_wait: Duration) -> Self {
        Self {
            max_retry,
            retry_wait,
            backoff_multiplier: 1.0,
            max_wait: retry_wait,
            ..Self::default()
        }
    }

    /// Wait after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let wait = self.retry_wait.as_secs_f64() * factor;
        Duration::from_secs_f64(wait.min(self.max_wait.as_secs_f64().max(self.retry_wait.as_secs_f64())))
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }
}

/// HTTP client that retries transport failures and retryable statuses
#[derive(Clone)]
pub struct RetryClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RetryClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse, RequestError> {
        self.request(Method::GET, url, RequestOptions::default()).await
    }

    pub async fn post_json<T: Serialize>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<HttpResponse, RequestError> {
        let options = RequestOptions::default()
            .json(body)
            .map_err(|e| RequestError::Transport {
                url: url.to_string(),
                source: TransportError::InvalidRequest(e.to_string()),
            })?;
        self.request(Method::POST, url, options).await
    }

    /// Send with the client's default policy
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse, RequestError> {
        self.send(method, url, options, self.policy.max_retry, self.policy.retry_wait)
            .await
    }

    /// Send with an explicit attempt budget and base wait.
    ///
    /// `max_retry` counts every attempt including the first. Invalid URLs and
    /// non-retryable transport errors fail immediately without consuming the
    /// budget; a retryable status on the last attempt is reported as exhaustion.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
        max_retry: u32,
        retry_wait: Duration,
    ) -> Result<HttpResponse, RequestError> {
        let request = build_request(method, url, options)?;
        let policy = RetryPolicy {
            max_retry: max_retry.max(1),
            retry_wait,
            ..self.policy.clone()
        };

        let mut attempt = 0;
        loop {
            attempt += 1;

            let failure = match self.transport.send(request.clone()).await {
                Ok(response) if policy.is_retryable_status(response.status) => {
                    TransportError::Status(response.status)
                }
                Ok(response) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", url, attempt);
                    }
                    return Ok(response);
                }
                Err(e) if !e.is_retryable() => {
                    return Err(RequestError::Transport {
                        url: url.to_string(),
                        source: e,
                    });
                }
                Err(e) => e,
            };

            if attempt >= policy.max_retry {
                warn!("Giving up on {} after {} attempts: {}", url, attempt, failure);
                return Err(RequestError::Exhausted {
                    url: url.to_string(),
                    attempts: attempt,
                    last: failure,
                });
            }

            let wait = policy.delay_for(attempt);
            debug!(
                "Attempt {}/{} for {} failed ({}), retrying in {:?}",
                attempt, policy.max_retry, url, failure, wait
            );
            sleep(wait).await;
        }
    }
}

fn build_request(method: Method, url: &str, options: RequestOptions) -> Result<HttpRequest, RequestError> {
    let mut parsed = Url::parse(url).map_err(|e| RequestError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RequestError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }

    if !options.query.is_empty() {
        let mut pairs = parsed.query_pairs_mut();
        for (name, value) in &options.query {
            pairs.append_pair(name, value);
        }
    }

    Ok(HttpRequest {
        method,
        url: parsed,
        headers: options.headers,
        body: options.body,
        timeout: options.timeout,
    })
}
