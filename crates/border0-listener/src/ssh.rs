//! SSH transport to the dispatcher.
//!
//! The dispatcher speaks SSH: the listener authenticates with its signed
//! user certificate, pins the host key returned alongside that certificate,
//! requests a remote port forward on `localhost:0`, and keeps an
//! interactive shell open as the session's liveness anchor.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg, Session};
use russh::keys::ssh_key::public::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::{ListenerError, Result};
use crate::transport::{
    incoming_channel, DialRequest, Dialer, IncomingSender, RemoteListener, ShellChannel, Transport,
    TunnelConnection,
};

/// Terminal type requested for the control shell.
pub const SHELL_TERM: &str = "xterm-256color";
/// Control shell width in columns.
pub const SHELL_COLUMNS: u32 = 80;
/// Control shell height in rows.
pub const SHELL_ROWS: u32 = 40;

/// Socket path of the global request sent as a keep-alive.
///
/// The request is a `cancel-streamlocal-forward@openssh.com` for a path that
/// is never forwarded, so a live dispatcher answers it with a failure. The
/// connection's request queue resolves the reply, unlike
/// `keepalive@openssh.com` whose replies are discarded.
pub const KEEPALIVE_REQUEST_PATH: &str = "keepalive@border0.com";

/// Dials the dispatcher over SSH.
#[derive(Debug, Clone, Default)]
pub struct SshDialer;

impl SshDialer {
    /// Create a dialer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Connection callbacks: host-key pinning and forwarded-channel intake.
struct TunnelHandler {
    host_key: PublicKey,
    incoming: IncomingSender,
}

impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let pinned = server_public_key.key_data() == self.host_key.key_data();
        if !pinned {
            warn!(
                presented = %server_public_key.algorithm(),
                "Dispatcher host key does not match the pinned key"
            );
        }
        Ok(pinned)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let originator = format!("{originator_address}:{originator_port}");
        debug!(
            connected = %format!("{connected_address}:{connected_port}"),
            originator = %originator,
            "Forwarded connection"
        );
        let conn = TunnelConnection::new(channel.into_stream(), originator);
        if let Err(e) = self.incoming.try_send(conn) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("Inbound backlog full, dropping forwarded connection");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!("Listener gone, dropping forwarded connection");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(&self, request: DialRequest) -> Result<Arc<dyn Transport>> {
        let DialRequest {
            addr,
            user,
            identity,
            handshake_timeout,
        } = request;

        let (incoming, receiver) = incoming_channel();
        let handler = TunnelHandler {
            host_key: identity.host_key.clone(),
            incoming,
        };
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..client::Config::default()
        });

        let handshake = async {
            let mut handle = client::connect(config, addr.as_str(), handler)
                .await
                .map_err(|e| match e {
                    russh::Error::UnknownKey => ListenerError::HostKeyMismatch,
                    other => ListenerError::Transport(format!("connect to {addr}: {other}")),
                })?;

            let auth = handle
                .authenticate_openssh_cert(
                    user.clone(),
                    Arc::clone(&identity.private_key),
                    identity.certificate.clone(),
                )
                .await?;
            if !auth.success() {
                return Err(ListenerError::AuthRejected {
                    principal: user.clone(),
                });
            }
            Ok::<_, ListenerError>(handle)
        };

        let handle = tokio::time::timeout(handshake_timeout, handshake)
            .await
            .map_err(|_| ListenerError::HandshakeTimeout { addr: addr.clone() })??;

        debug!(dispatcher = %addr, principal = %user, "Authenticated to dispatcher");

        Ok(Arc::new(SshTransport {
            handle: Mutex::new(handle),
            incoming: parking_lot::Mutex::new(Some(receiver)),
        }))
    }
}

struct SshTransport {
    handle: Mutex<Handle<TunnelHandler>>,
    incoming: parking_lot::Mutex<Option<mpsc::Receiver<TunnelConnection>>>,
}

#[async_trait]
impl Transport for SshTransport {
    async fn listen(&self, host: &str, port: u32) -> Result<RemoteListener> {
        let bound = self
            .handle
            .lock()
            .await
            .tcpip_forward(host, port)
            .await
            .map_err(|e| ListenerError::RemoteListen(e.to_string()))?;
        let bound = u16::try_from(bound)
            .map_err(|_| ListenerError::RemoteListen(format!("invalid port {bound}")))?;

        let receiver = self
            .incoming
            .lock()
            .take()
            .ok_or_else(|| ListenerError::RemoteListen("already listening".to_string()))?;

        Ok(RemoteListener::new(
            SocketAddr::from((Ipv4Addr::LOCALHOST, bound)),
            receiver,
        ))
    }

    async fn open_shell(&self) -> Result<Box<dyn ShellChannel>> {
        let channel = self.handle.lock().await.channel_open_session().await?;
        channel
            .request_pty(false, SHELL_TERM, SHELL_COLUMNS, SHELL_ROWS, 0, 0, &[])
            .await?;
        channel.request_shell(true).await?;
        Ok(Box::new(SshShell { channel }))
    }

    async fn keepalive(&self) -> Result<()> {
        let handle = self.handle.lock().await;
        if handle.is_closed() {
            return Err(ListenerError::Transport("connection closed".to_string()));
        }
        // Only request success and failure count as a reply.
        match handle.cancel_streamlocal_forward(KEEPALIVE_REQUEST_PATH).await {
            Ok(()) | Err(russh::Error::RequestDenied) => Ok(()),
            Err(e) => Err(ListenerError::Transport(format!("keep-alive: {e}"))),
        }
    }

    async fn close(&self) {
        let handle = self.handle.lock().await;
        if handle.is_closed() {
            return;
        }
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(error = %e, "Disconnect failed");
        }
    }
}

struct SshShell {
    channel: Channel<Msg>,
}

#[async_trait]
impl ShellChannel for SshShell {
    async fn wait(&mut self) -> Result<()> {
        let mut exit_status = None;
        while let Some(msg) = self.channel.wait().await {
            match msg {
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::Close => break,
                // stdout is discarded
                _ => {}
            }
        }
        match exit_status {
            Some(0) => Ok(()),
            Some(code) => Err(ListenerError::Shell(format!("exited with status {code}"))),
            None => Err(ListenerError::Shell(
                "closed without exit status".to_string(),
            )),
        }
    }
}
