//! Control-plane client configuration.

use std::time::Duration;

use serde::Deserialize;

/// Environment variable holding the default bearer token.
pub const ENV_AUTH_TOKEN: &str = "BORDER0_AUTH_TOKEN";
/// Environment variable overriding the control-plane base URL.
pub const ENV_BASE_URL: &str = "BORDER0_BASE_URL";

/// Configuration for talking to the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the REST API (e.g., `https://api.border0.com/api/v1`).
    #[serde(default = "ApiConfig::default_base_url")]
    pub base_url: String,

    /// Base URL of the web portal used for device authorization.
    #[serde(default = "ApiConfig::default_portal_url")]
    pub portal_url: String,

    /// Bearer token; when absent the caller is expected to authenticate.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Retries after the first attempt.
    #[serde(default = "ApiConfig::default_retry_max")]
    pub retry_max: u32,

    /// Lower bound of the retry backoff, in milliseconds.
    #[serde(default = "ApiConfig::default_retry_wait_min_ms")]
    pub retry_wait_min_ms: u64,

    /// Upper bound of the retry backoff, in milliseconds.
    #[serde(default = "ApiConfig::default_retry_wait_max_ms")]
    pub retry_wait_max_ms: u64,

    /// Per-attempt request timeout in seconds.
    #[serde(default = "ApiConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl ApiConfig {
    fn default_base_url() -> String {
        "https://api.border0.com/api/v1".to_string()
    }

    fn default_portal_url() -> String {
        "https://portal.border0.com".to_string()
    }

    const fn default_retry_max() -> u32 {
        4
    }

    const fn default_retry_wait_min_ms() -> u64 {
        1_000
    }

    const fn default_retry_wait_max_ms() -> u64 {
        30_000
    }

    const fn default_request_timeout() -> u64 {
        30
    }

    /// Defaults overlaid with `BORDER0_BASE_URL` and `BORDER0_AUTH_TOKEN`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            config.base_url = url;
        }
        config.auth_token = lookup(ENV_AUTH_TOKEN).filter(|v| !v.is_empty());
        config
    }

    /// Set the base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the bearer token.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Set the retry count and backoff bounds.
    #[must_use]
    pub fn with_retries(mut self, retry_max: u32, wait_min: Duration, wait_max: Duration) -> Self {
        self.retry_max = retry_max;
        self.retry_wait_min_ms = u64::try_from(wait_min.as_millis()).unwrap_or(u64::MAX);
        self.retry_wait_max_ms = u64::try_from(wait_max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Lower retry backoff bound as a `Duration`.
    #[must_use]
    pub const fn retry_wait_min(&self) -> Duration {
        Duration::from_millis(self.retry_wait_min_ms)
    }

    /// Upper retry backoff bound as a `Duration`.
    #[must_use]
    pub const fn retry_wait_max(&self) -> Duration {
        Duration::from_millis(self.retry_wait_max_ms)
    }

    /// Per-attempt request timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            portal_url: Self::default_portal_url(),
            auth_token: None,
            retry_max: Self::default_retry_max(),
            retry_wait_min_ms: Self::default_retry_wait_min_ms(),
            retry_wait_max_ms: Self::default_retry_wait_max_ms(),
            request_timeout_seconds: Self::default_request_timeout(),
        }
    }
}
