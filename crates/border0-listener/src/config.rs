//! Listener configuration.

use std::time::Duration;

use border0_api::{ApiConfig, AuthMethod, BackoffConfig};
use serde::Deserialize;

use crate::error::{ListenerError, Result};

/// Environment variable holding the default socket name.
pub const ENV_SOCKET_NAME: &str = "BORDER0_SOCKET_NAME";
/// Environment variable overriding the dispatcher address.
pub const ENV_TUNNEL_SERVER: &str = "BORDER0_TUNNEL_SERVER";

/// Configuration for a [`Listener`](crate::Listener).
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Control-plane client settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Name of the socket to bind.
    #[serde(default)]
    pub socket_name: String,

    /// Dispatcher `host:port`.
    #[serde(default = "ListenerConfig::default_tunnel_server")]
    pub tunnel_server: String,

    /// Transport handshake timeout in seconds.
    #[serde(default = "ListenerConfig::default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,

    /// Interval between keep-alives in milliseconds.
    #[serde(default = "ListenerConfig::default_keepalive_interval")]
    pub keepalive_interval_ms: u64,

    /// Reply deadline for a keep-alive in milliseconds.
    #[serde(default = "ListenerConfig::default_keepalive_timeout")]
    pub keepalive_timeout_ms: u64,

    /// Consecutive missed keep-alives after which a session is dead.
    #[serde(default = "ListenerConfig::default_keepalive_max_missed")]
    pub keepalive_max_missed: u32,

    /// Reconnect backoff schedule.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Write a token obtained interactively to the token file.
    #[serde(default = "ListenerConfig::default_persist_token")]
    pub persist_token: bool,

    /// How to obtain a token when none is configured.
    #[serde(skip)]
    pub auth_method: AuthMethod,
}

impl ListenerConfig {
    fn default_tunnel_server() -> String {
        "tunnel.border0.com:22".to_string()
    }

    const fn default_handshake_timeout() -> u64 {
        10
    }

    const fn default_keepalive_interval() -> u64 {
        10_000
    }

    const fn default_keepalive_timeout() -> u64 {
        5_000
    }

    const fn default_keepalive_max_missed() -> u32 {
        4
    }

    const fn default_persist_token() -> bool {
        true
    }

    /// Defaults overlaid with the `BORDER0_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self {
            api: ApiConfig::from_lookup(&lookup),
            ..Self::default()
        };
        if let Some(name) = lookup(ENV_SOCKET_NAME).filter(|v| !v.is_empty()) {
            config.socket_name = name;
        }
        if let Some(server) = lookup(ENV_TUNNEL_SERVER).filter(|v| !v.is_empty()) {
            config.tunnel_server = server;
        }
        config
    }

    /// Set the bearer token.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.api.auth_token = Some(token.into());
        self
    }

    /// Set the socket name.
    #[must_use]
    pub fn with_socket_name(mut self, name: impl Into<String>) -> Self {
        self.socket_name = name.into();
        self
    }

    /// Set the dispatcher address.
    #[must_use]
    pub fn with_tunnel_server(mut self, addr: impl Into<String>) -> Self {
        self.tunnel_server = addr.into();
        self
    }

    /// Set the authentication flow.
    #[must_use]
    pub fn with_auth_method(mut self, method: AuthMethod) -> Self {
        self.auth_method = method;
        self
    }

    /// Set the keep-alive interval, reply deadline and miss budget.
    #[must_use]
    pub fn with_keepalive(mut self, interval: Duration, timeout: Duration, max_missed: u32) -> Self {
        self.keepalive_interval_ms = millis(interval);
        self.keepalive_timeout_ms = millis(timeout);
        self.keepalive_max_missed = max_missed;
        self
    }

    /// Set the reconnect schedule.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Handshake timeout as a `Duration`.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    /// Keep-alive interval as a `Duration`.
    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Keep-alive reply deadline as a `Duration`.
    #[must_use]
    pub const fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    /// Reject values the keep-alive loop or the reconnect schedule cannot
    /// run with.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.keepalive_interval_ms == 0 {
            return Err(ListenerError::Config(
                "keepalive_interval_ms must be positive".to_string(),
            ));
        }
        if self.keepalive_timeout_ms == 0 {
            return Err(ListenerError::Config(
                "keepalive_timeout_ms must be positive".to_string(),
            ));
        }
        if self.keepalive_max_missed == 0 {
            return Err(ListenerError::Config(
                "keepalive_max_missed must be at least 1".to_string(),
            ));
        }
        self.reconnect.validate()
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            socket_name: String::new(),
            tunnel_server: Self::default_tunnel_server(),
            handshake_timeout_seconds: Self::default_handshake_timeout(),
            keepalive_interval_ms: Self::default_keepalive_interval(),
            keepalive_timeout_ms: Self::default_keepalive_timeout(),
            keepalive_max_missed: Self::default_keepalive_max_missed(),
            reconnect: ReconnectConfig::default(),
            persist_token: Self::default_persist_token(),
            auth_method: AuthMethod::default(),
        }
    }
}

/// Reconnect backoff parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// First delay after a reset, in milliseconds.
    #[serde(default = "ReconnectConfig::default_initial")]
    pub initial_ms: u64,

    /// Upper bound for a single delay, in milliseconds.
    #[serde(default = "ReconnectConfig::default_max")]
    pub max_ms: u64,

    /// Growth factor between consecutive delays.
    #[serde(default = "ReconnectConfig::default_multiplier")]
    pub multiplier: f64,

    /// Jitter as a fraction of the current delay.
    #[serde(default = "ReconnectConfig::default_randomization_factor")]
    pub randomization_factor: f64,
}

impl ReconnectConfig {
    const fn default_initial() -> u64 {
        500
    }

    const fn default_max() -> u64 {
        60_000
    }

    const fn default_multiplier() -> f64 {
        1.5
    }

    const fn default_randomization_factor() -> f64 {
        0.5
    }

    /// A fixed delay without growth or jitter.
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        let ms = millis(delay);
        Self {
            initial_ms: ms,
            max_ms: ms,
            multiplier: 1.0,
            randomization_factor: 0.0,
        }
    }

    /// Check the schedule: growth of at least 1, jitter within `[0, 1]`
    /// and `initial_ms <= max_ms`.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ListenerError::Config(format!(
                "reconnect.multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(ListenerError::Config(format!(
                "reconnect.randomization_factor must be within [0, 1], got {}",
                self.randomization_factor
            )));
        }
        if self.initial_ms > self.max_ms {
            return Err(ListenerError::Config(format!(
                "reconnect.initial_ms ({}) exceeds reconnect.max_ms ({})",
                self.initial_ms, self.max_ms
            )));
        }
        Ok(())
    }

    /// The schedule as backoff parameters; reconnects never give up.
    #[must_use]
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.initial_ms),
            max: Duration::from_millis(self.max_ms),
            multiplier: self.multiplier,
            randomization_factor: self.randomization_factor,
            max_elapsed: None,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: Self::default_initial(),
            max_ms: Self::default_max(),
            multiplier: Self::default_multiplier(),
            randomization_factor: Self::default_randomization_factor(),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
