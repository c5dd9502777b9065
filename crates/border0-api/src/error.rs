//! Control-plane error types.

use thiserror::Error;

/// A result type using `ApiError`.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors that can occur while talking to the control plane.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The control plane answered with a non-2xx status.
    #[error("{status_code}: {message}")]
    Status {
        /// HTTP status of the response.
        status_code: u16,
        /// Message extracted from the error body.
        message: String,
    },

    /// The retrying executor gave up; wraps the last attempt's error.
    #[error("failed after {attempts} attempt{}: {source}", plural_suffix(.attempts))]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The error of the final attempt.
        source: Box<ApiError>,
    },

    /// The caller cancelled the request scope.
    #[error("context cancelled")]
    Cancelled,

    /// Transport-level failure (connect, TLS, timeout, body read).
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A request body could not be encoded.
    #[error("invalid request: {0}")]
    Encode(String),

    /// A 2xx body could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),

    /// The bearer token is malformed or lacks a required claim.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Device authorization did not complete before its deadline.
    #[error("device authorization timed out")]
    DeviceAuthTimeout,

    /// Local I/O failure (token file, terminal prompt).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ApiError {
    /// The innermost error, looking through retry wrappers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Exhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// HTTP status carried by the error, or `0` if there is none.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self.root() {
            Self::Status { status_code, .. } => *status_code,
            _ => 0,
        }
    }

    /// Returns `true` if the control plane reported the resource as absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status_code() == 404
    }

    /// Returns `true` if the control plane rejected the bearer token.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.status_code() == 401
    }

    /// Returns `true` if the caller cancelled the request.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }

    /// Returns `true` if the executor should try the request again.
    ///
    /// Every failure except 401, 404 and cancellation is retried, 400 included.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Self::Status { status_code, .. } => !matches!(status_code, 401 | 404),
            Self::Http(_) | Self::Decode(_) => true,
            _ => false,
        }
    }
}

fn plural_suffix(count: &u32) -> &'static str {
    if *count == 1 {
        ""
    } else {
        "s"
    }
}

/// Returns `true` if `err` carries a 404 from the control plane.
#[must_use]
pub fn is_not_found(err: &ApiError) -> bool {
    err.is_not_found()
}
