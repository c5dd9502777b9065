//! The listener façade.
//!
//! A [`Listener`] binds a Border0 socket and hands out the connections the
//! dispatcher forwards to it. After [`Listener::start`] returns it is
//! silent but self-healing: dead sessions are replaced in the background
//! and [`Listener::accept`] transparently moves on to the new one.

use std::net::SocketAddr;
use std::sync::Arc;

use border0_api::{auth, token, ApiClient, ControlPlane, ExponentialBackoff, TokenClaims};
use border0_core::{Socket, SocketType};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ListenerConfig;
use crate::error::{ListenerError, Result};
use crate::keepalive::KeepaliveConfig;
use crate::lifecycle::ListenerState;
use crate::session::TunnelSession;
use crate::ssh::SshDialer;
use crate::supervisor::{Shared, Supervisor};
use crate::transport::{Dialer, TunnelConnection};

/// A reverse-tunnel listener bound to one socket.
pub struct Listener {
    config: ListenerConfig,
    api_client: Option<Arc<ApiClient>>,
    control_plane: Option<Arc<dyn ControlPlane>>,
    dialer: Arc<dyn Dialer>,
    shared: Arc<Shared>,
    errors: parking_lot::Mutex<Option<mpsc::Receiver<ListenerError>>>,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Create a listener from configuration.
    #[must_use]
    pub fn new(config: ListenerConfig) -> Self {
        let (shared, errors) = Shared::new();
        Self {
            config,
            api_client: None,
            control_plane: None,
            dialer: Arc::new(SshDialer::new()),
            shared,
            errors: parking_lot::Mutex::new(Some(errors)),
            supervisor: parking_lot::Mutex::new(None),
        }
    }

    /// Create a listener configured from `BORDER0_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(ListenerConfig::from_env())
    }

    /// Use `token` as the bearer token.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.api.auth_token = Some(token.into());
        self
    }

    /// Bind the socket named `name`.
    #[must_use]
    pub fn with_socket_name(mut self, name: impl Into<String>) -> Self {
        self.config.socket_name = name.into();
        self
    }

    /// Use an existing control-plane client for authentication and socket
    /// operations.
    #[must_use]
    pub fn with_api_client(mut self, client: Arc<ApiClient>) -> Self {
        self.api_client = Some(client);
        self
    }

    /// Use a custom implementation for socket operations.
    #[must_use]
    pub fn with_control_plane(mut self, control_plane: Arc<dyn ControlPlane>) -> Self {
        self.control_plane = Some(control_plane);
        self
    }

    /// Use a custom dispatcher transport.
    #[must_use]
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// The listener's configuration.
    #[must_use]
    pub const fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        self.shared.status().state
    }

    /// Authenticate, make sure the socket exists, and bring up the first
    /// tunnel session.
    ///
    /// Returns once a session is live. Dial failures are retried in the
    /// background until then; only terminal errors end startup.
    ///
    /// # Errors
    ///
    /// Returns the first terminal error: control-plane rejection (verbatim),
    /// a malformed token, an invalid socket name or configuration, or
    /// `ListenerError::Closed` if the listener is closed while starting.
    pub async fn start(&self) -> Result<()> {
        let state = self.state();
        if state != ListenerState::Created {
            return Err(ListenerError::InvalidState(state));
        }
        Socket::validate_name(&self.config.socket_name)?;
        self.config.validate()?;

        let result = self.bring_up().await;
        if let Err(e) = &result {
            if !self.state().is_final() && self.shared.transition(ListenerState::Failed) {
                warn!(socket = %self.config.socket_name, error = %e, "Listener start failed");
            }
        }
        result
    }

    async fn bring_up(&self) -> Result<()> {
        let shutdown = self.shared.shutdown.clone();

        self.shared.transition(ListenerState::Authenticating);
        let client = match &self.api_client {
            Some(client) => Arc::clone(client),
            None => Arc::new(ApiClient::new(self.config.api.clone())?),
        };
        let bearer = self.resolve_token(&client).await?;
        let principal = TokenClaims::decode_unverified(&bearer)?.dispatcher_principal()?;

        self.shared.transition(ListenerState::EnsuringSocket);
        let api: Arc<dyn ControlPlane> = match &self.control_plane {
            Some(control_plane) => Arc::clone(control_plane),
            None => client as Arc<dyn ControlPlane>,
        };
        self.ensure_socket(api.as_ref()).await?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let supervisor = Supervisor {
            api,
            dialer: Arc::clone(&self.dialer),
            shared: Arc::clone(&self.shared),
            socket_name: self.config.socket_name.clone(),
            principal,
            tunnel_server: self.config.tunnel_server.clone(),
            handshake_timeout: self.config.handshake_timeout(),
            keepalive: KeepaliveConfig {
                interval: self.config.keepalive_interval(),
                timeout: self.config.keepalive_timeout(),
                max_missed: self.config.keepalive_max_missed,
            },
            backoff: ExponentialBackoff::new(self.config.reconnect.backoff()),
        };
        if shutdown.is_cancelled() {
            return Err(ListenerError::Closed);
        }
        *self.supervisor.lock() = Some(tokio::spawn(supervisor.run(ready_tx)));

        ready_rx.await.map_err(|_| ListenerError::Closed)?
    }

    /// Bearer token from configuration, the client, the token file, or an
    /// interactive flow, in that order.
    async fn resolve_token(&self, client: &ApiClient) -> Result<String> {
        if let Some(bearer) = self.config.api.auth_token.clone().filter(|t| !t.is_empty()) {
            client.set_token(bearer.clone());
            return Ok(bearer);
        }
        if let Some(bearer) = client.token().filter(|t| !t.is_empty()) {
            return Ok(bearer);
        }
        match token::load_token() {
            Ok(Some(bearer)) => {
                debug!("Using persisted token");
                client.set_token(bearer.clone());
                return Ok(bearer);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to read persisted token"),
        }

        let bearer =
            auth::authenticate(client, &self.shared.shutdown, &self.config.auth_method).await?;
        if self.config.persist_token {
            match token::save_token(&bearer) {
                Ok(path) => info!(path = %path.display(), "Saved token"),
                Err(e) => warn!(error = %e, "Failed to persist token"),
            }
        }
        Ok(bearer)
    }

    async fn ensure_socket(&self, api: &dyn ControlPlane) -> Result<()> {
        let name = &self.config.socket_name;
        let cancel = &self.shared.shutdown;
        if api.get_socket(cancel, name).await?.is_some() {
            debug!(socket = %name, "Socket exists");
            return Ok(());
        }
        let created = api
            .create_socket(cancel, &Socket::new(name.clone(), SocketType::Http))
            .await?;
        info!(socket = %created.name, "Socket created");
        Ok(())
    }

    /// Wait for the next forwarded connection.
    ///
    /// End-of-stream on a dying session is never returned: it is reported
    /// on the error channel and the call continues on the next session.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Closed` once the listener is closed or failed.
    pub async fn accept(&self) -> Result<TunnelConnection> {
        let mut min_generation = 1;
        loop {
            let session = self.wait_for_session(min_generation).await?;
            if let Some(conn) = session.listener().accept().await {
                return Ok(conn);
            }
            if self.shared.shutdown.is_cancelled() {
                return Err(ListenerError::Closed);
            }

            let generation = session.generation();
            self.shared.report_session_end(generation);
            session.close().await;
            min_generation = generation + 1;
        }
    }

    async fn wait_for_session(&self, min_generation: u64) -> Result<Arc<TunnelSession>> {
        let mut status = self.shared.subscribe();
        loop {
            let current = *status.borrow_and_update();
            if current.state.is_final() {
                return Err(ListenerError::Closed);
            }
            if current.generation >= min_generation {
                if let Some(session) = self.shared.current() {
                    if session.generation() >= min_generation {
                        return Ok(session);
                    }
                }
            }
            status.changed().await.map_err(|_| ListenerError::Closed)?;
        }
    }

    /// Address of the current remote endpoint; the last known one while
    /// reconnecting, `None` before the first session.
    #[must_use]
    pub fn addr(&self) -> Option<SocketAddr> {
        self.shared.last_addr()
    }

    /// Take the receiving end of the advisory error channel.
    ///
    /// The channel has a single reader: the first call returns it and later
    /// calls return `None`.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<ListenerError>> {
        self.errors.lock().take()
    }

    /// Close the current session and stop reconnecting. Idempotent.
    pub async fn close(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();
        if let Some(session) = self.shared.current() {
            session.close().await;
        }
        self.shared.transition(ListenerState::Closed);

        let supervisor = self.supervisor.lock().take();
        if let Some(task) = supervisor {
            if let Err(e) = task.await {
                debug!(error = %e, "Supervisor task ended abnormally");
            }
        }
        info!(socket = %self.config.socket_name, "Listener closed");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("socket_name", &self.config.socket_name)
            .field("state", &self.state())
            .field("addr", &self.addr())
            .finish_non_exhaustive()
    }
}
