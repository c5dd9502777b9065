//! Core types for the Border0 SDK.
//!
//! This crate provides the data model shared by the control-plane client and
//! the tunnel listener:
//!
//! - **Identifiers**: the server-assigned [`SocketId`]
//! - **Sockets**: the [`Socket`] descriptor and its [`SocketType`]
//! - **Time**: [`FlexibleTime`], which accepts both RFC 3339 strings and
//!   Unix-seconds integers on the wire
//!
//! # Example
//!
//! ```
//! use border0_core::{Socket, SocketType};
//!
//! let socket = Socket::new("sdk-socket-http", SocketType::Http);
//! assert_eq!(socket.socket_type.as_str(), "http");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod socket;
pub mod time;

pub use error::{CoreError, Result};
pub use ids::{IdError, SocketId};
pub use socket::{Socket, SocketType};
pub use time::FlexibleTime;
