//! One tunnel session: transport, remote listener, control shell and
//! keep-alive task.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ListenerError, Result};
use crate::keepalive::{self, KeepaliveConfig};
use crate::transport::{DialRequest, Dialer, RemoteListener, ShellChannel, Transport};

/// Host the dispatcher is asked to listen on.
pub const REMOTE_LISTEN_HOST: &str = "localhost";
/// Port the dispatcher is asked to listen on; `0` lets it choose.
pub const REMOTE_LISTEN_PORT: u32 = 0;

/// A live tunnel session.
pub struct TunnelSession {
    generation: u64,
    transport: Arc<dyn Transport>,
    listener: RemoteListener,
    shell: tokio::sync::Mutex<Option<Box<dyn ShellChannel>>>,
    done: CancellationToken,
    keepalive_dead: Arc<Mutex<Option<u32>>>,
    keepalive_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TunnelSession {
    /// Dial the dispatcher, open the remote listener and the control shell,
    /// and start keep-alives.
    ///
    /// # Errors
    ///
    /// Returns the dial error, or the remote-listen or shell error after
    /// closing the transport.
    pub async fn establish(
        dialer: &dyn Dialer,
        request: DialRequest,
        keepalive: KeepaliveConfig,
        generation: u64,
    ) -> Result<Self> {
        let addr = request.addr.clone();
        let transport = dialer.dial(request).await?;

        let listener = match transport.listen(REMOTE_LISTEN_HOST, REMOTE_LISTEN_PORT).await {
            Ok(listener) => listener,
            Err(e) => {
                transport.close().await;
                return Err(match e {
                    ListenerError::RemoteListen(_) => e,
                    other => ListenerError::RemoteListen(other.to_string()),
                });
            }
        };

        let shell = match transport.open_shell().await {
            Ok(shell) => shell,
            Err(e) => {
                listener.close();
                transport.close().await;
                return Err(e);
            }
        };

        let done = CancellationToken::new();
        let keepalive_dead = Arc::new(Mutex::new(None));
        let task = tokio::spawn({
            let transport = Arc::clone(&transport);
            let done = done.clone();
            let dead = Arc::clone(&keepalive_dead);
            async move {
                if let Some(missed) = keepalive::run(transport, keepalive, done.clone()).await {
                    *dead.lock() = Some(missed);
                    done.cancel();
                }
            }
        });

        info!(
            dispatcher = %addr,
            remote_addr = %listener.addr(),
            generation,
            "Tunnel session established"
        );

        Ok(Self {
            generation,
            transport,
            listener,
            shell: tokio::sync::Mutex::new(Some(shell)),
            done,
            keepalive_dead,
            keepalive_task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    /// Sequence number assigned by the supervisor.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// The remote listening endpoint.
    #[must_use]
    pub const fn listener(&self) -> &RemoteListener {
        &self.listener
    }

    /// Address of the remote listening endpoint.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.listener.addr()
    }

    /// Returns `true` once the session has ended or been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Block until the shell ends, the keep-alive loop gives up, or the
    /// session is closed; the session is closed on return.
    ///
    /// # Errors
    ///
    /// Returns `Ok(())` only for a clean shell exit. Otherwise returns the
    /// shell error, `ListenerError::KeepaliveDead`, or
    /// `ListenerError::SessionClosed`.
    pub async fn wait(&self) -> Result<()> {
        let Some(mut shell) = self.shell.lock().await.take() else {
            return Err(ListenerError::SessionClosed);
        };

        let outcome = tokio::select! {
            result = shell.wait() => result,
            () = self.done.cancelled() => Err(self.end_reason()),
        };

        match &outcome {
            Ok(()) => debug!(generation = self.generation, "Control shell exited"),
            Err(e) => warn!(generation = self.generation, error = %e, "Tunnel session ended"),
        }

        self.close().await;
        outcome
    }

    /// Tear the session down. Idempotent; concurrent callers return once
    /// the transport is closed.
    pub async fn close(&self) {
        self.done.cancel();
        self.listener.close();
        let mut task = self.keepalive_task.lock().await;
        if let Some(task) = task.take() {
            task.abort();
            self.transport.close().await;
            debug!(generation = self.generation, "Tunnel session closed");
        }
    }

    fn end_reason(&self) -> ListenerError {
        match *self.keepalive_dead.lock() {
            Some(missed) => ListenerError::KeepaliveDead { missed },
            None => ListenerError::SessionClosed,
        }
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("generation", &self.generation)
            .field("addr", &self.listener.addr())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
