//! Dispatcher transport seam.
//!
//! The tunnel session only needs a handful of operations from the
//! authenticated transport: open a remote listening endpoint, open the
//! control shell, send keep-alives and close. They are expressed as the
//! [`Dialer`] and [`Transport`] traits so the session, the supervisor and
//! the façade can run against any implementation; [`crate::ssh`] provides
//! the production one.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cert::SignedIdentity;
use crate::error::Result;

/// Inbound connections buffered per session before new ones are refused.
pub const INCOMING_BACKLOG: usize = 64;

/// Everything needed to open one authenticated transport.
#[derive(Debug, Clone)]
pub struct DialRequest {
    /// Dispatcher `host:port`.
    pub addr: String,
    /// Principal presented to the dispatcher.
    pub user: String,
    /// Certificate-bearing credential and pinned host key.
    pub identity: SignedIdentity,
    /// Deadline for connect plus authentication.
    pub handshake_timeout: Duration,
}

/// Opens authenticated transports to the dispatcher.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect, verify the host key against `request.identity.host_key`, and
    /// authenticate with the certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection, host-key check, or
    /// authentication fails, or the handshake timeout elapses.
    async fn dial(&self, request: DialRequest) -> Result<Arc<dyn Transport>>;
}

/// One established, authenticated transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ask the dispatcher to listen on `host:port` and forward inbound
    /// connections over this transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the dispatcher refuses the request.
    async fn listen(&self, host: &str, port: u32) -> Result<RemoteListener>;

    /// Open the control shell: a PTY-backed interactive session whose end
    /// marks the end of the tunnel session.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel, PTY, or shell request fails.
    async fn open_shell(&self) -> Result<Box<dyn ShellChannel>>;

    /// Send one keep-alive and wait for the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is closed or the request fails.
    async fn keepalive(&self) -> Result<()>;

    /// Tear the transport down. Idempotent.
    async fn close(&self);
}

/// The control shell of a session.
#[async_trait]
pub trait ShellChannel: Send {
    /// Block until the shell ends, discarding its output.
    ///
    /// Returns `Ok(())` for a clean exit.
    ///
    /// # Errors
    ///
    /// Returns an error for a non-zero exit or if the transport went away.
    async fn wait(&mut self) -> Result<()>;
}

/// A byte stream carried over the tunnel.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

/// An inbound connection forwarded by the dispatcher.
pub struct TunnelConnection {
    stream: Box<dyn TunnelStream>,
    originator: String,
}

impl TunnelConnection {
    /// Wrap a forwarded stream.
    pub fn new(stream: impl TunnelStream + 'static, originator: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            originator: originator.into(),
        }
    }

    /// `host:port` of the remote peer as reported by the dispatcher.
    #[must_use]
    pub fn originator(&self) -> &str {
        &self.originator
    }

    /// Unwrap the underlying stream.
    #[must_use]
    pub fn into_inner(self) -> Box<dyn TunnelStream> {
        self.stream
    }
}

impl fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("originator", &self.originator)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for TunnelConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.stream).poll_shutdown(cx)
    }
}

/// Sending half of a session's inbound queue, held by the transport.
pub type IncomingSender = mpsc::Sender<TunnelConnection>;

/// Sending and receiving halves of a session's inbound queue.
#[must_use]
pub fn incoming_channel() -> (IncomingSender, mpsc::Receiver<TunnelConnection>) {
    mpsc::channel(INCOMING_BACKLOG)
}

/// The dispatcher-side listening endpoint of one session.
///
/// [`accept`](Self::accept) yields `None` at end-of-stream: after
/// [`close`](Self::close) or once the transport drops its sending half.
#[derive(Debug)]
pub struct RemoteListener {
    addr: SocketAddr,
    incoming: Mutex<mpsc::Receiver<TunnelConnection>>,
    closed: CancellationToken,
}

impl RemoteListener {
    /// Create a listener reporting `addr` and fed by `incoming`.
    #[must_use]
    pub fn new(addr: SocketAddr, incoming: mpsc::Receiver<TunnelConnection>) -> Self {
        Self {
            addr,
            incoming: Mutex::new(incoming),
            closed: CancellationToken::new(),
        }
    }

    /// Address the dispatcher reported for the endpoint.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the next inbound connection; `None` means end-of-stream.
    pub async fn accept(&self) -> Option<TunnelConnection> {
        if self.closed.is_cancelled() {
            return None;
        }
        let mut incoming = self.incoming.lock().await;
        // Queued connections of a closed listener are never handed out.
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            conn = incoming.recv() => conn,
        }
    }

    /// Stop accepting. Pending and future `accept` calls return `None`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
