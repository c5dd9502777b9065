//! Listener lifecycle state machine.
//!
//! # State Machine
//!
//! ```text
//!   ┌───────────┐
//!   │  Created  │
//!   └─────┬─────┘
//!         │ start()
//!         ▼
//!   ┌────────────────┐   fail   ┌──────────┐
//!   │ Authenticating │─────────▶│  Failed  │
//!   └───────┬────────┘          └──────────┘
//!           │ ok                     ▲
//!           ▼                        │ fail
//!   ┌────────────────┐               │
//!   │ EnsuringSocket │───────────────┤
//!   └───────┬────────┘               │
//!           │ ok                     │
//!           ▼                        │
//!   ┌────────────────┐               │
//!   │    Dialing     │───────────────┘
//!   └───────┬────────┘◀──────────┐
//!           │ ok                 │ shell ends / keep-alive fails
//!           ▼                    │
//!   ┌────────────────┐           │
//!   │      Live      │───────────┘
//!   └───────┬────────┘
//!           │ close()
//!           ▼
//!   ┌────────────────┐
//!   │     Closed     │
//!   └────────────────┘
//! ```

use std::fmt;

/// Where a listener is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    /// Built but not started.
    Created,
    /// Resolving a bearer token.
    Authenticating,
    /// Looking up or creating the socket.
    EnsuringSocket,
    /// Signing a certificate and dialing the dispatcher.
    Dialing,
    /// A tunnel session is serving connections.
    Live,
    /// Closed by the embedder.
    Closed,
    /// Startup failed with a terminal error.
    Failed,
}

impl ListenerState {
    /// Returns `true` once no further transitions can happen.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Authenticating => "authenticating",
            Self::EnsuringSocket => "ensuring socket",
            Self::Dialing => "dialing",
            Self::Live => "live",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Check if a state transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: ListenerState, to: ListenerState) -> bool {
    use ListenerState::{Authenticating, Closed, Created, Dialing, EnsuringSocket, Failed, Live};

    matches!(
        (from, to),
        (Created, Authenticating)
            | (Authenticating, EnsuringSocket)
            | (EnsuringSocket, Dialing)
            | (Dialing, Live)
            // reconnect
            | (Live, Dialing)
            | (Authenticating | EnsuringSocket | Dialing, Failed)
            | (Created | Authenticating | EnsuringSocket | Dialing | Live, Closed)
    )
}
