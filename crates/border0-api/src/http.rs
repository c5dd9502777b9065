//! Retrying HTTP executor.
//!
//! Every control-plane call goes through [`HttpExecutor::execute`], which
//! attaches the bearer token, classifies failures, and retries transient
//! ones with exponential backoff. Cancellation is honored both while a
//! request is in flight and while sleeping between attempts; a cancelled
//! call drops the pooled idle connections before returning.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::{default_backoff, BackoffFn};
use crate::config::ApiConfig;
use crate::error::{ApiError, Result};

/// Header carrying the bearer token on every control-plane request.
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

/// Error bodies longer than this are truncated when used as a message.
const MAX_ERROR_BODY: usize = 1024;

/// A control-plane request, pre-serialized so it can be replayed on retry.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    body: Option<Vec<u8>>,
    headers: Vec<(String, String)>,
}

impl Request {
    /// A request without a body.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    /// `GET path`.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// `POST path`.
    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Attach a JSON body.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Encode` if `body` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body).map_err(|e| ApiError::Encode(e.to_string()))?;
        self.body = Some(bytes);
        Ok(self)
    }

    /// Attach an extra header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The request method.
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// The path relative to the API base URL.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    body: Vec<u8>,
}

impl Response {
    /// The HTTP status.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// The raw body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Decode` if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Structured error body returned by the control plane.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[allow(dead_code)]
    #[serde(default)]
    status_code: u16,
    #[serde(default)]
    error_message: String,
}

/// HTTP executor with bearer authentication and status-classified retries.
pub struct HttpExecutor {
    client: RwLock<reqwest::Client>,
    base_url: String,
    token: RwLock<Option<String>>,
    timeout: Duration,
    retry_max: u32,
    wait_min: Duration,
    wait_max: Duration,
    backoff: BackoffFn,
    pool_generation: AtomicU64,
}

impl HttpExecutor {
    /// Create an executor from client configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let timeout = config.request_timeout();
        Ok(Self {
            client: RwLock::new(build_client()?),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(config.auth_token.clone()),
            timeout,
            retry_max: config.retry_max,
            wait_min: config.retry_wait_min(),
            wait_max: config.retry_wait_max(),
            backoff: default_backoff(),
            pool_generation: AtomicU64::new(0),
        })
    }

    /// Replace the backoff function.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffFn) -> Self {
        self.backoff = backoff;
        self
    }

    /// The API base URL, without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The current bearer token.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    /// Replace the bearer token.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    /// How many times the idle connection pool has been dropped.
    #[must_use]
    pub fn pool_generation(&self) -> u64 {
        self.pool_generation.load(Ordering::SeqCst)
    }

    /// Drop all pooled idle connections by swapping in a fresh client.
    pub fn drain_idle_connections(&self) {
        match build_client() {
            Ok(fresh) => {
                *self.client.write() = fresh;
                self.pool_generation.fetch_add(1, Ordering::SeqCst);
                debug!("Dropped idle control-plane connections");
            }
            Err(e) => warn!(error = %e, "Failed to rebuild HTTP client"),
        }
    }

    /// Execute a request, retrying transient failures.
    ///
    /// A failure is retried unless it is a 401 or a 404, for at most
    /// `retry_max` retries. Before retry `i` the executor sleeps
    /// `backoff(min, max, i)`.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Cancelled` if `cancel` fires, otherwise
    /// `ApiError::Exhausted` wrapping the last attempt's error.
    pub async fn execute(&self, cancel: &CancellationToken, request: &Request) -> Result<Response> {
        let url = format!("{}/{}", self.base_url, request.path.trim_start_matches('/'));
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(self.cancelled()),
                outcome = self.attempt(&url, request) => outcome,
            };

            let err = match outcome {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if !err.is_retryable() || attempts > self.retry_max {
                debug!(
                    method = %request.method,
                    path = %request.path,
                    attempts,
                    error = %err,
                    "Control-plane request failed"
                );
                return Err(ApiError::Exhausted {
                    attempts,
                    source: Box::new(err),
                });
            }

            let delay = (self.backoff)(self.wait_min, self.wait_max, attempts - 1);
            warn!(
                method = %request.method,
                path = %request.path,
                attempt = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Control-plane request failed, retrying"
            );

            tokio::select! {
                () = cancel.cancelled() => return Err(self.cancelled()),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn cancelled(&self) -> ApiError {
        self.drain_idle_connections();
        ApiError::Cancelled
    }

    async fn attempt(&self, url: &str, request: &Request) -> Result<Response> {
        let client = self.client.read().clone();
        let token = self.token();

        let mut builder = client
            .request(request.method.clone(), url)
            .timeout(self.timeout);
        if let Some(token) = token {
            builder = builder.header(ACCESS_TOKEN_HEADER, token);
        }
        builder = match &request.body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone()),
            None => builder.header(ACCEPT, "application/json"),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();

        if status.is_success() {
            return Ok(Response { status, body });
        }
        Err(error_from_body(status, &body))
    }
}

impl fmt::Debug for HttpExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpExecutor")
            .field("base_url", &self.base_url)
            .field("has_token", &self.token.read().is_some())
            .field("retry_max", &self.retry_max)
            .field("wait_min", &self.wait_min)
            .field("wait_max", &self.wait_max)
            .finish_non_exhaustive()
    }
}

fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(ApiError::Http)
}

fn error_from_body(status: StatusCode, body: &[u8]) -> ApiError {
    let message = match serde_json::from_slice::<ErrorBody>(body) {
        Ok(parsed) if !parsed.error_message.is_empty() => parsed.error_message,
        _ => {
            let end = body.len().min(MAX_ERROR_BODY);
            String::from_utf8_lossy(&body[..end]).trim().to_string()
        }
    };
    ApiError::Status {
        status_code: status.as_u16(),
        message,
    }
}
