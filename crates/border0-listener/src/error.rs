//! Error types for the tunnel listener.

use border0_api::ApiError;
use border0_core::CoreError;
use thiserror::Error;

use crate::lifecycle::ListenerState;

/// A result type using `ListenerError`.
pub type Result<T> = std::result::Result<T, ListenerError>;

/// Errors that can occur while running a listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Control-plane failure, reported with the control plane's own text.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Invalid socket data.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Key generation, certificate parsing, or host key decoding failed.
    #[error("key error: {0}")]
    Key(String),

    /// The signed certificate does not certify the key that was submitted.
    #[error("signed certificate does not match the submitted public key")]
    CertificateMismatch,

    /// The dispatcher presented a host key other than the pinned one.
    #[error("dispatcher host key does not match the pinned key")]
    HostKeyMismatch,

    /// The dispatcher refused the certificate.
    #[error("dispatcher rejected authentication for {principal}")]
    AuthRejected {
        /// The principal that was presented.
        principal: String,
    },

    /// The transport handshake did not finish in time.
    #[error("handshake with {addr} timed out")]
    HandshakeTimeout {
        /// The dispatcher address.
        addr: String,
    },

    /// The transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The dispatcher refused to open the remote listening endpoint.
    #[error("remote listen failed: {0}")]
    RemoteListen(String),

    /// The control shell failed or ended abnormally.
    #[error("shell session: {0}")]
    Shell(String),

    /// Too many consecutive keep-alives went unanswered.
    #[error("session dead after {missed} missed keep-alives")]
    KeepaliveDead {
        /// Consecutive misses at the time the session was abandoned.
        missed: u32,
    },

    /// The session was closed locally.
    #[error("tunnel session closed")]
    SessionClosed,

    /// The remote listener reached end-of-stream; a new session is on its way.
    #[error("listener closed and reconnecting")]
    SessionEnded,

    /// The listener was closed.
    #[error("listener closed")]
    Closed,

    /// The operation is not allowed in the listener's current state.
    #[error("listener is {0}")]
    InvalidState(ListenerState),

    /// Invalid listener configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ListenerError {
    /// Returns `true` if retrying cannot help: the control plane rejected
    /// the bearer token, or the listener is closed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Api(e) => e.is_unauthorized() || e.is_cancelled(),
            Self::Core(_) | Self::Closed | Self::InvalidState(_) | Self::Config(_) => true,
            _ => false,
        }
    }

    /// Returns `true` for end-of-session conditions that drive a reconnect.
    #[must_use]
    pub const fn is_session_end(&self) -> bool {
        matches!(
            self,
            Self::KeepaliveDead { .. } | Self::SessionClosed | Self::SessionEnded | Self::Shell(_)
        )
    }
}

impl From<russh::Error> for ListenerError {
    fn from(e: russh::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<russh::keys::ssh_key::Error> for ListenerError {
    fn from(e: russh::keys::ssh_key::Error) -> Self {
        Self::Key(e.to_string())
    }
}
