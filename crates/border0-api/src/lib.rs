//! Border0 control-plane client.
//!
//! This crate provides the REST surface the tunnel listener depends on:
//!
//! - **Executor**: [`HttpExecutor`] attaches the bearer token, classifies
//!   failures and retries transient ones with exponential backoff
//! - **Sockets**: the [`ControlPlane`] trait and its [`ApiClient`]
//!   implementation (get, create, sign key)
//! - **Authentication**: device authorization and legacy login in [`auth`]
//! - **Tokens**: unverified claim decoding in [`claims`] and the persisted
//!   token file in [`token`]
//!
//! # Retry policy
//!
//! ```text
//!   attempt ──▶ 2xx ─────────────────────────────▶ Ok(response)
//!      │
//!      ├──▶ 401 / 404 ───────────────────────────▶ Err(failed after N attempts)
//!      │
//!      └──▶ other error ──▶ attempts > retry_max? ─ yes ─▶ Err(failed after N attempts)
//!                                 │ no
//!                                 ▼
//!                   sleep min(max, min·2^i), cancellable
//!                                 │
//!                                 └──▶ attempt
//! ```
//!
//! # Example
//!
//! ```no_run
//! use border0_api::{ApiClient, ApiConfig, ControlPlane};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ApiClient::new(ApiConfig::from_env())?;
//! let cancel = CancellationToken::new();
//!
//! match client.get_socket(&cancel, "sdk-socket-http").await? {
//!     Some(socket) => println!("found {}", socket.name),
//!     None => println!("socket does not exist yet"),
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod auth;
pub mod backoff;
pub mod claims;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod prompt;
pub mod token;

pub use auth::{authenticate, AuthMethod, DeviceAuthOptions};
pub use backoff::{BackoffConfig, BackoffFn, ExponentialBackoff};
pub use claims::TokenClaims;
pub use client::{ApiClient, ControlPlane, SignedSocketKey};
pub use config::ApiConfig;
pub use error::{is_not_found, ApiError, Result};
pub use http::{HttpExecutor, Request, Response};
