//! Border0 reverse-tunnel listener.
//!
//! A [`Listener`] binds a named socket on the Border0 platform and accepts
//! the connections the platform's dispatcher forwards to it, without
//! opening any inbound port locally:
//!
//! - **Certificates**: every dial uses a fresh P-256 key signed by the
//!   control plane ([`cert`]); the host key returned with it is pinned
//! - **Sessions**: an SSH transport with a remote port forward and a
//!   control shell whose end marks the end of the session ([`session`],
//!   [`ssh`])
//! - **Liveness**: keep-alives every 10 s, four misses end the session
//!   ([`keepalive`])
//! - **Reconnects**: a supervisor redials with exponential backoff; accept
//!   callers move to the new session without seeing end-of-stream
//!
//! # Architecture
//!
//! ```text
//!   embedder ── accept() ──▶ Listener ──reads──▶ current session
//!                               │                     ▲
//!                               │ start()             │ publishes
//!                               ▼                     │
//!                         control plane ◀── sign ── Supervisor ── dial ──▶ dispatcher
//! ```
//!
//! # Example
//!
//! ```no_run
//! use border0_listener::Listener;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = Listener::from_env().with_socket_name("sdk-socket-http");
//! listener.start().await?;
//! println!("listening on {:?}", listener.addr());
//!
//! loop {
//!     let mut conn = listener.accept().await?;
//!     tokio::spawn(async move {
//!         let mut buf = [0u8; 1024];
//!         if let Ok(n) = conn.read(&mut buf).await {
//!             let _ = conn.write_all(&buf[..n]).await;
//!         }
//!     });
//! }
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cert;
pub mod config;
pub mod error;
pub mod keepalive;
pub mod lifecycle;
pub mod listener;
pub mod session;
pub mod ssh;
mod supervisor;
pub mod transport;

pub use cert::{EphemeralKey, SignedIdentity};
pub use config::{ListenerConfig, ReconnectConfig};
pub use error::{ListenerError, Result};
pub use lifecycle::ListenerState;
pub use listener::Listener;
pub use session::TunnelSession;
pub use ssh::SshDialer;
pub use transport::{
    DialRequest, Dialer, RemoteListener, ShellChannel, Transport, TunnelConnection, TunnelStream,
};
