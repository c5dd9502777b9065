//! Reconnect supervisor.
//!
//! The supervisor owns the dial loop of a started listener: sign a fresh
//! key, dial, publish the session, wait for it to end, back off, repeat.
//! It is the only writer of the current-session pointer; the façade reads
//! it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use border0_api::{ControlPlane, ExponentialBackoff};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cert;
use crate::error::{ListenerError, Result};
use crate::keepalive::KeepaliveConfig;
use crate::lifecycle::{is_valid_transition, ListenerState};
use crate::session::TunnelSession;
use crate::transport::{DialRequest, Dialer};

/// Advisory errors buffered for the embedder before new ones are dropped.
pub const ERROR_BACKLOG: usize = 16;

/// Published listener status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Status {
    pub(crate) state: ListenerState,
    /// Generation of the most recently published session; `0` before the
    /// first one.
    pub(crate) generation: u64,
}

/// State shared between the supervisor and the façade.
pub(crate) struct Shared {
    current: RwLock<Option<Arc<TunnelSession>>>,
    last_addr: RwLock<Option<SocketAddr>>,
    status: watch::Sender<Status>,
    state_lock: Mutex<()>,
    errors: mpsc::Sender<ListenerError>,
    eof_reported: AtomicU64,
    pub(crate) shutdown: CancellationToken,
}

impl Shared {
    pub(crate) fn new() -> (Arc<Self>, mpsc::Receiver<ListenerError>) {
        let (errors, errors_rx) = mpsc::channel(ERROR_BACKLOG);
        let (status, _) = watch::channel(Status {
            state: ListenerState::Created,
            generation: 0,
        });
        let shared = Arc::new(Self {
            current: RwLock::new(None),
            last_addr: RwLock::new(None),
            status,
            state_lock: Mutex::new(()),
            errors,
            eof_reported: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });
        (shared, errors_rx)
    }

    pub(crate) fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub(crate) fn current(&self) -> Option<Arc<TunnelSession>> {
        self.current.read().clone()
    }

    pub(crate) fn last_addr(&self) -> Option<SocketAddr> {
        *self.last_addr.read()
    }

    /// Move to `to` if the state machine allows it.
    pub(crate) fn transition(&self, to: ListenerState) -> bool {
        let _guard = self.state_lock.lock();
        let from = self.status().state;
        if from == to {
            return true;
        }
        if !is_valid_transition(from, to) {
            debug!(%from, %to, "Ignoring state transition");
            return false;
        }
        self.status.send_modify(|status| status.state = to);
        debug!(%from, %to, "Listener state changed");
        true
    }

    fn publish(&self, session: Arc<TunnelSession>) {
        let _guard = self.state_lock.lock();
        if self.status().state.is_final() {
            return;
        }
        let generation = session.generation();
        *self.last_addr.write() = Some(session.addr());
        *self.current.write() = Some(session);
        self.status.send_modify(|status| {
            status.state = ListenerState::Live;
            status.generation = generation;
        });
    }

    /// Post an advisory error; dropped if the embedder is not keeping up.
    pub(crate) fn post_error(&self, err: ListenerError) {
        if let Err(e) = self.errors.try_send(err) {
            debug!(error = %e, "Error channel full, dropping error");
        }
    }

    /// Post `SessionEnded` once per session generation.
    pub(crate) fn report_session_end(&self, generation: u64) {
        if self.eof_reported.fetch_max(generation, Ordering::SeqCst) < generation {
            self.post_error(ListenerError::SessionEnded);
        }
    }
}

/// Inputs of the dial loop.
pub(crate) struct Supervisor {
    pub(crate) api: Arc<dyn ControlPlane>,
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) socket_name: String,
    pub(crate) principal: String,
    pub(crate) tunnel_server: String,
    pub(crate) handshake_timeout: std::time::Duration,
    pub(crate) keepalive: KeepaliveConfig,
    pub(crate) backoff: ExponentialBackoff,
}

impl Supervisor {
    /// Run until the listener is closed or startup fails terminally.
    ///
    /// `ready` receives `Ok(())` when the first session is live, or the
    /// terminal error that prevented it.
    pub(crate) async fn run(mut self, ready: oneshot::Sender<Result<()>>) {
        let mut ready = Some(ready);
        let mut generation: u64 = 0;
        let shutdown = self.shared.shutdown.clone();

        while !shutdown.is_cancelled() {
            self.shared.transition(ListenerState::Dialing);

            match self.connect(generation + 1).await {
                Ok(session) => {
                    generation = session.generation();
                    self.shared.publish(Arc::clone(&session));
                    info!(
                        socket = %self.socket_name,
                        remote_addr = %session.addr(),
                        generation,
                        "Listener live"
                    );
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(()));
                    }

                    let outcome = tokio::select! {
                        outcome = session.wait() => outcome,
                        () = shutdown.cancelled() => {
                            session.close().await;
                            break;
                        }
                    };
                    if shutdown.is_cancelled() {
                        break;
                    }
                    match outcome {
                        Ok(()) => {
                            self.backoff.reset();
                            info!(generation, "Tunnel session finished, reconnecting");
                        }
                        Err(e) if e.is_session_end() => {
                            info!(generation, reason = %e, "Tunnel session ended, reconnecting");
                        }
                        Err(e) => warn!(generation, error = %e, "Tunnel session lost, reconnecting"),
                    }
                }
                Err(e) if shutdown.is_cancelled() => {
                    debug!(error = %e, "Dial aborted by close");
                    break;
                }
                Err(e) if ready.is_some() && e.is_terminal() => {
                    error!(socket = %self.socket_name, error = %e, "Listener failed to start");
                    self.shared.transition(ListenerState::Failed);
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(e));
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        socket = %self.socket_name,
                        attempt = self.backoff.attempt() + 1,
                        error = %e,
                        "Dial failed"
                    );
                    if ready.is_none() {
                        self.shared.post_error(e);
                    }
                }
            }

            let Some(delay) = self.backoff.next_delay() else {
                break;
            };
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.shared.transition(ListenerState::Closed);
        debug!(socket = %self.socket_name, "Supervisor stopped");
    }

    async fn connect(&self, generation: u64) -> Result<Arc<TunnelSession>> {
        let identity =
            cert::sign_identity(self.api.as_ref(), &self.shared.shutdown, &self.socket_name)
                .await?;
        let request = DialRequest {
            addr: self.tunnel_server.clone(),
            user: self.principal.clone(),
            identity,
            handshake_timeout: self.handshake_timeout,
        };
        let session =
            TunnelSession::establish(self.dialer.as_ref(), request, self.keepalive, generation)
                .await?;
        Ok(Arc::new(session))
    }
}
