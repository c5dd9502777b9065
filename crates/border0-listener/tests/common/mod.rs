//! Test fixtures: a wiremock control plane and an in-memory dispatcher.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use border0_api::backoff::zero_backoff;
use border0_api::{ApiClient, ApiConfig};
use border0_listener::transport::{incoming_channel, IncomingSender};
use border0_listener::{
    DialRequest, Dialer, Listener, ListenerConfig, ListenerError, ReconnectConfig, RemoteListener,
    Result, ShellChannel, SignedIdentity, Transport, TunnelConnection,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use parking_lot::Mutex;
use russh::keys::ssh_key::certificate::{Builder, CertType};
use russh::keys::ssh_key::private::PrivateKey;
use russh::keys::ssh_key::public::PublicKey;
use russh::keys::ssh_key::Algorithm;
use serde_json::json;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const SOCKET: &str = "sdk-socket-http";
pub const SUB: &str = "1c5e9a2d-7f3b-4e8a-9d6c-0b2f4e6a8c1d";
pub const PRINCIPAL: &str = "1c5e9a2d7f3b4e8a9d6c0b2f4e6a8c1d";
pub const REMOTE_PORT: u16 = 34567;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn bearer_token() -> String {
    encode(
        &Header::default(),
        &json!({"sub": SUB, "exp": 4_102_444_800_i64}),
        &EncodingKey::from_secret(b"issued-by-the-control-plane"),
    )
    .unwrap()
}

pub fn socket_body() -> serde_json::Value {
    json!({
        "socket_id": "2b0b1c7e-55a5-4a8e-9c38-1f0b7d1ad4f1",
        "name": SOCKET,
        "socket_type": "http",
    })
}

pub fn error_body(code: u16, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(code).set_body_json(json!({
        "status_code": code,
        "error_message": message,
    }))
}

/// Signs whatever public key is submitted, like the real control plane,
/// and returns the dispatcher's current host key.
pub struct SignKeyResponder {
    ca: PrivateKey,
    dispatcher: MockDispatcher,
}

impl SignKeyResponder {
    pub fn new(dispatcher: &MockDispatcher) -> Self {
        Self {
            ca: PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap(),
            dispatcher: dispatcher.clone(),
        }
    }
}

impl Respond for SignKeyResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let public = PublicKey::from_openssh(body["ssh_public_key"].as_str().unwrap()).unwrap();

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let mut builder = Builder::new_with_random_nonce(
            &mut rand::rngs::OsRng,
            public.key_data().clone(),
            now - 60,
            now + 3600,
        )
        .unwrap();
        builder.serial(1).unwrap();
        builder.key_id(SOCKET).unwrap();
        builder.cert_type(CertType::User).unwrap();
        builder.valid_principal(PRINCIPAL).unwrap();
        let cert = builder.sign(&self.ca).unwrap();

        ResponseTemplate::new(200).set_body_json(json!({
            "signed_ssh_cert": cert.to_openssh().unwrap(),
            "host_key": STANDARD.encode(self.dispatcher.host_key().to_bytes().unwrap()),
        }))
    }
}

/// Mount `POST /socket/{SOCKET}/signkey` backed by `dispatcher`'s host key.
pub async fn mount_sign_key(server: &MockServer, dispatcher: &MockDispatcher) {
    Mock::given(method("POST"))
        .and(path(format!("/api/v1/socket/{SOCKET}/signkey")))
        .respond_with(SignKeyResponder::new(dispatcher))
        .mount(server)
        .await;
}

/// Mount `GET /socket/{SOCKET}` answering with an existing socket.
pub async fn mount_existing_socket(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(format!("/api/v1/socket/{SOCKET}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(socket_body()))
        .mount(server)
        .await;
}

/// Listener configuration pointed at `server` with test-sized timings.
pub fn test_config(server: &MockServer, retry_max: u32) -> ListenerConfig {
    let api = ApiConfig::default()
        .with_base_url(format!("{}/api/v1", server.uri()))
        .with_retries(retry_max, Duration::from_millis(1), Duration::from_millis(5));
    ListenerConfig {
        api,
        ..ListenerConfig::default()
    }
    .with_socket_name(SOCKET)
    .with_tunnel_server("dispatcher.test:22")
    .with_keepalive(Duration::from_millis(50), Duration::from_millis(20), 4)
    .with_reconnect(ReconnectConfig::fixed(Duration::from_millis(20)))
}

/// A listener wired to `server` and `dispatcher` with test-sized timings.
pub fn listener(server: &MockServer, dispatcher: &MockDispatcher, retry_max: u32) -> Listener {
    listener_with_config(dispatcher, test_config(server, retry_max))
}

/// A listener wired to `dispatcher` using `config`.
pub fn listener_with_config(dispatcher: &MockDispatcher, config: ListenerConfig) -> Listener {
    let client = ApiClient::new(config.api.clone())
        .unwrap()
        .with_backoff(zero_backoff());
    Listener::new(config)
        .with_auth_token(bearer_token())
        .with_api_client(Arc::new(client))
        .with_dialer(Arc::new(dispatcher.clone()))
}

struct MockSession {
    incoming: Mutex<Option<IncomingSender>>,
    receiver: Mutex<Option<mpsc::Receiver<TunnelConnection>>>,
    killed: CancellationToken,
    clean_exit: AtomicBool,
    answers_keepalive: AtomicBool,
    listening: AtomicBool,
    closed: AtomicBool,
}

impl MockSession {
    fn is_live(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
            && !self.killed.is_cancelled()
            && !self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Counters {
    dials: AtomicUsize,
    refuse_next: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    closed: AtomicUsize,
    keepalives: AtomicUsize,
}

struct Inner {
    host: Mutex<PrivateKey>,
    counters: Counters,
    users: Mutex<Vec<String>>,
    identities: Mutex<Vec<SignedIdentity>>,
    dial_times: Mutex<Vec<Instant>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

fn random_host_key() -> PrivateKey {
    PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap()
}

/// An in-memory dispatcher implementing [`Dialer`].
#[derive(Clone)]
pub struct MockDispatcher {
    inner: Arc<Inner>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                host: Mutex::new(random_host_key()),
                counters: Counters::default(),
                users: Mutex::new(Vec::new()),
                identities: Mutex::new(Vec::new()),
                dial_times: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn host_key(&self) -> PublicKey {
        self.inner.host.lock().public_key().clone()
    }

    /// Switch to a new host key; later signing responses carry it.
    pub fn rotate_host_key(&self) -> PublicKey {
        let mut host = self.inner.host.lock();
        *host = random_host_key();
        host.public_key().clone()
    }

    /// Identities presented by accepted dials, oldest first.
    pub fn identities(&self) -> Vec<SignedIdentity> {
        self.inner.identities.lock().clone()
    }

    /// When each dial arrived, refused ones included.
    pub fn dial_times(&self) -> Vec<Instant> {
        self.inner.dial_times.lock().clone()
    }

    pub fn dials(&self) -> usize {
        self.inner.counters.dials.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.inner.counters.max_active.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.inner.counters.active.load(Ordering::SeqCst)
    }

    pub fn closed_sessions(&self) -> usize {
        self.inner.counters.closed.load(Ordering::SeqCst)
    }

    pub fn keepalives(&self) -> usize {
        self.inner.counters.keepalives.load(Ordering::SeqCst)
    }

    pub fn users(&self) -> Vec<String> {
        self.inner.users.lock().clone()
    }

    /// Refuse the next `n` dials.
    pub fn refuse_next(&self, n: usize) {
        self.inner.counters.refuse_next.store(n, Ordering::SeqCst);
    }

    fn latest(&self) -> Option<Arc<MockSession>> {
        self.inner.sessions.lock().last().cloned()
    }

    async fn live_session(&self) -> Arc<MockSession> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(session) = self.latest().filter(|s| s.is_live()) {
                    return session;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no live session")
    }

    /// Wait until `n` sessions have been established.
    pub async fn wait_for_sessions(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let live = self.latest().is_some_and(|s| s.is_live());
                if self.inner.sessions.lock().len() >= n && live {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sessions were not established in time");
    }

    /// Kill the current session from the dispatcher's side.
    pub async fn drop_session(&self) {
        let session = self.live_session().await;
        session.incoming.lock().take();
        session.killed.cancel();
    }

    /// End the current session with a clean shell exit.
    pub async fn end_session_cleanly(&self) {
        let session = self.live_session().await;
        session.clean_exit.store(true, Ordering::SeqCst);
        session.incoming.lock().take();
        session.killed.cancel();
    }

    /// Stop answering keep-alives on the current session.
    pub async fn silence_keepalives(&self) {
        let session = self.live_session().await;
        session.answers_keepalive.store(false, Ordering::SeqCst);
    }

    /// Open an inbound connection through the current session.
    pub async fn connect(&self) -> DuplexStream {
        let session = self.live_session().await;
        let (client, server) = tokio::io::duplex(1024);
        let sender = session.incoming.lock().clone().expect("session has no sender");
        sender
            .send(TunnelConnection::new(server, "203.0.113.7:51234"))
            .await
            .expect("listener is gone");
        client
    }
}

#[async_trait]
impl Dialer for MockDispatcher {
    async fn dial(&self, request: DialRequest) -> Result<Arc<dyn Transport>> {
        let counters = &self.inner.counters;
        counters.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.dial_times.lock().push(Instant::now());

        if counters
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ListenerError::Transport("connection refused".to_string()));
        }
        if request.identity.host_key.key_data() != self.host_key().key_data() {
            return Err(ListenerError::HostKeyMismatch);
        }
        if !request
            .identity
            .certificate
            .valid_principals()
            .contains(&request.user)
        {
            return Err(ListenerError::AuthRejected {
                principal: request.user,
            });
        }
        self.inner.users.lock().push(request.user);
        self.inner.identities.lock().push(request.identity);

        let (tx, rx) = incoming_channel();
        let session = Arc::new(MockSession {
            incoming: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            killed: CancellationToken::new(),
            clean_exit: AtomicBool::new(false),
            answers_keepalive: AtomicBool::new(true),
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.inner.sessions.lock().push(Arc::clone(&session));

        let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_active.fetch_max(active, Ordering::SeqCst);

        Ok(Arc::new(MockTransport {
            session,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockTransport {
    session: Arc<MockSession>,
    inner: Arc<Inner>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn listen(&self, host: &str, port: u32) -> Result<RemoteListener> {
        assert_eq!(host, "localhost");
        assert_eq!(port, 0);
        let receiver = self
            .session
            .receiver
            .lock()
            .take()
            .ok_or_else(|| ListenerError::RemoteListen("already listening".to_string()))?;
        self.session.listening.store(true, Ordering::SeqCst);
        Ok(RemoteListener::new(
            SocketAddr::from(([127, 0, 0, 1], REMOTE_PORT)),
            receiver,
        ))
    }

    async fn open_shell(&self) -> Result<Box<dyn ShellChannel>> {
        Ok(Box::new(MockShell {
            session: Arc::clone(&self.session),
        }))
    }

    async fn keepalive(&self) -> Result<()> {
        if self.session.killed.is_cancelled() {
            return Err(ListenerError::Transport("connection lost".to_string()));
        }
        if !self.session.answers_keepalive.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.counters.keepalives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        if !self.session.closed.swap(true, Ordering::SeqCst) {
            self.inner.counters.active.fetch_sub(1, Ordering::SeqCst);
            self.inner.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
        self.session.incoming.lock().take();
        self.session.killed.cancel();
    }
}

struct MockShell {
    session: Arc<MockSession>,
}

#[async_trait]
impl ShellChannel for MockShell {
    async fn wait(&mut self) -> Result<()> {
        self.session.killed.cancelled().await;
        if self.session.clean_exit.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ListenerError::Shell("connection lost".to_string()))
        }
    }
}
