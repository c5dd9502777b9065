//! End-to-end listener behavior against a mocked control plane and
//! dispatcher.

mod common;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use border0_listener::{DialRequest, Dialer, ListenerError, ListenerState, ReconnectConfig};
use common::{
    error_body, init_tracing, listener, listener_with_config, mount_existing_socket,
    mount_sign_key, socket_body, test_config, MockDispatcher, PRINCIPAL, REMOTE_PORT, SOCKET,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use wiremock::matchers::{body_partial_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn remote_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], REMOTE_PORT))
}

async fn ping_pong(dispatcher: &MockDispatcher, listener: &border0_listener::Listener) {
    let mut client = dispatcher.connect().await;
    client.write_all(b"ping").await.unwrap();

    let mut conn = timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("accept timed out")
        .unwrap();
    assert_eq!(conn.originator(), "203.0.113.7:51234");
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    conn.write_all(b"pong").await.unwrap();

    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn start_creates_missing_socket_and_goes_live() {
    init_tracing();
    let server = MockServer::start().await;
    let dispatcher = MockDispatcher::new();

    Mock::given(method("GET"))
        .and(path(format!("/api/v1/socket/{SOCKET}")))
        .and(header_exists("x-access-token"))
        .respond_with(error_body(404, "socket not found"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/socket"))
        .and(body_partial_json(json!({"name": SOCKET, "socket_type": "http"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(socket_body()))
        .expect(1)
        .mount(&server)
        .await;
    mount_sign_key(&server, &dispatcher).await;

    let listener = listener(&server, &dispatcher, 3);
    assert_eq!(listener.state(), ListenerState::Created);
    assert_eq!(listener.addr(), None);

    timeout(Duration::from_secs(2), listener.start())
        .await
        .expect("start timed out")
        .unwrap();

    assert_eq!(listener.state(), ListenerState::Live);
    assert_eq!(listener.addr(), Some(remote_addr()));
    assert_eq!(dispatcher.users(), vec![PRINCIPAL.to_string()]);

    ping_pong(&dispatcher, &listener).await;

    listener.close().await;
    assert_eq!(listener.state(), ListenerState::Closed);
    assert_eq!(dispatcher.active(), 0);
}

#[tokio::test]
async fn start_reuses_existing_socket() {
    let server = MockServer::start().await;
    let dispatcher = MockDispatcher::new();

    mount_existing_socket(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/socket"))
        .respond_with(ResponseTemplate::new(200).set_body_json(socket_body()))
        .expect(0)
        .mount(&server)
        .await;
    mount_sign_key(&server, &dispatcher).await;

    let listener = listener(&server, &dispatcher, 3);
    timeout(Duration::from_secs(2), listener.start())
        .await
        .expect("start timed out")
        .unwrap();
    assert_eq!(listener.state(), ListenerState::Live);

    listener.close().await;
}

#[tokio::test]
async fn unauthorized_start_fails_without_dialing() {
    let server = MockServer::start().await;
    let dispatcher = MockDispatcher::new();

    Mock::given(method("GET"))
        .and(path(format!("/api/v1/socket/{SOCKET}")))
        .respond_with(error_body(401, "unauthorized"))
        .expect(1)
        .mount(&server)
        .await;
    mount_sign_key(&server, &dispatcher).await;

    let listener = listener(&server, &dispatcher, 3);
    let err = listener.start().await.unwrap_err();

    assert_eq!(err.to_string(), "failed after 1 attempt: 401: unauthorized");
    assert_eq!(dispatcher.dials(), 0);
    assert_eq!(listener.state(), ListenerState::Failed);

    let err = listener.accept().await.unwrap_err();
    assert!(matches!(err, ListenerError::Closed));
}

#[tokio::test]
async fn transient_server_errors_are_retried() {
    let server = MockServer::start().await;
    let dispatcher = MockDispatcher::new();

    Mock::given(method("GET"))
        .and(path(format!("/api/v1/socket/{SOCKET}")))
        .respond_with(error_body(500, "try again"))
        .up_to_n_times(3)
        .expect(3)
        .mount(&server)
        .await;
    mount_existing_socket(&server).await;
    mount_sign_key(&server, &dispatcher).await;

    let listener = listener(&server, &dispatcher, 3);
    timeout(Duration::from_secs(2), listener.start())
        .await
        .expect("start timed out")
        .unwrap();
    assert_eq!(listener.state(), ListenerState::Live);

    listener.close().await;
}

#[tokio::test]
async fn start_rejects_invalid_socket_name() {
    let server = MockServer::start().await;
    let dispatcher = MockDispatcher::new();

    let listener = listener(&server, &dispatcher, 3).with_socket_name("Not A Socket!");
    let err = listener.start().await.unwrap_err();

    assert!(matches!(err, ListenerError::Core(_)), "{err:?}");
    assert_eq!(dispatcher.dials(), 0);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let server = MockServer::start().await;
    let dispatcher = MockDispatcher::new();
    mount_existing_socket(&server).await;
    mount_sign_key(&server, &dispatcher).await;

    let listener = listener(&server, &dispatcher, 3);
    listener.start().await.unwrap();

    let err = listener.start().await.unwrap_err();
    assert!(matches!(err, ListenerError::InvalidState(ListenerState::Live)));
    assert_eq!(dispatcher.dials(), 1);

    listener.close().await;
}

#[tokio::test]
async fn refused_dials_are_retried_before_start_returns() {
    let server = MockServer::start().await;
    let dispatcher = MockDispatcher::new();
    mount_existing_socket(&server).await;
    mount_sign_key(&server, &dispatcher).await;
    dispatcher.refuse_next(2);

    let listener = listener(&server, &dispatcher, 3);
    let mut errors = listener.take_errors().unwrap();
    timeout(Duration::from_secs(2), listener.start())
        .await
        .expect("start timed out")
        .unwrap();

    assert_eq!(dispatcher.dials(), 3);
    assert!(errors.try_recv().is_err());
    assert!(listener.take_errors().is_none());

    listener.close().await;
}

#[tokio::test]
async fn dropped_session_reconnects_transparently() {
    init_tracing();
    let server = MockServer::start().await;
    let dispatcher = MockDispatcher::new();
    mount_existing_socket(&server).await;
    mount_sign_key(&server, &dispatcher).await;

    let listener = listener(&server, &dispatcher, 3);
    let mut errors = listener.take_errors().unwrap();
    listener.start().await.unwrap();

    let accepting = {
        let listener = &listener;
        async move { listener.accept().await }
    };
    let reconnect = async {
        dispatcher.drop_session().await;
        dispatcher.wait_for_sessions(2).await;
        let mut client = dispatcher.connect().await;
        client.write_all(b"ping").await.unwrap();
        client
    };
    let (accepted, mut client) = timeout(Duration::from_secs(5), async {
        tokio::join!(accepting, reconnect)
    })
    .await
    .expect("reconnect timed out");

    let mut conn = accepted.unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    conn.write_all(b"pong").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    let err = timeout(Duration::from_secs(1), errors.recv())
        .await
        .expect("no error reported")
        .unwrap();
    assert_eq!(err.to_string(), "listener closed and reconnecting");
    assert!(errors.try_recv().is_err());

    assert_eq!(listener.state(), ListenerState::Live);
    assert_eq!(listener.addr(), Some(remote_addr()));
    assert_eq!(dispatcher.dials(), 2);
    assert!(dispatcher.max_active() <= 1);

    listener.close().await;
}

#[tokio::test]
async fn missed_keepalives_end_the_session() {
    let server = MockServer::start().await;
    let dispatcher = MockDispatcher::new();
    mount_existing_socket(&server).await;
    mount_sign_key(&server, &dispatcher).await;

    let listener = listener(&server, &dispatcher, 3);
    listener.start().await.unwrap();
    assert_eq!(dispatcher.dials(), 1);

    dispatcher.silence_keepalives().await;
    dispatcher.wait_for_sessions(2).await;

    assert_eq!(dispatcher.dials(), 2);
    assert_eq!(dispatcher.closed_sessions(), 1);
    assert!(dispatcher.max_active() <= 1);

    ping_pong(&dispatcher, &listener).await;
    listener.close().await;
}

#[tokio::test]
async fn at_most_one_session_across_reconnects() {
    let server = MockServer::start().await;
    let dispatcher = MockDispatcher::new();
    mount_existing_socket(&server).await;
    mount_sign_key(&server, &dispatcher).await;

    let listener = listener(&server, &dispatcher, 3);
    listener.start().await.unwrap();

    for round in 2..=4 {
        dispatcher.drop_session().await;
        dispatcher.wait_for_sessions(round).await;
        assert!(dispatcher.max_active() <= 1, "round {round}");
    }
    assert_eq!(dispatcher.dials(), 4);

    listener.close().await;
    assert_eq!(dispatcher.active(), 0);
}

#[tokio::test]
async fn close_is_idempotent_and_unblocks_accept() {
    let server = MockServer::start().await;
    let dispatcher = MockDispatcher::new();
    mount_existing_socket(&server).await;
    mount_sign_key(&server, &dispatcher).await;

    let listener = listener(&server, &dispatcher, 3);
    listener.start().await.unwrap();

    let (accepted, ()) = tokio::join!(listener.accept(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        listener.close().await;
    });
    assert!(matches!(accepted, Err(ListenerError::Closed)));

    listener.close().await;
    assert_eq!(listener.state(), ListenerState::Closed);
    assert!(matches!(listener.accept().await, Err(ListenerError::Closed)));
    assert!(matches!(
        listener.start().await,
        Err(ListenerError::InvalidState(ListenerState::Closed))
    ));
}

#[tokio::test]
async fn unusable_reconnect_schedule_fails_start_without_dialing() {
    let server = MockServer::start().await;
    let dispatcher = MockDispatcher::new();
    mount_existing_socket(&server).await;
    mount_sign_key(&server, &dispatcher).await;

    let reconnect: ReconnectConfig =
        serde_json::from_str(r#"{"initial_ms": 20, "multiplier": -1.0}"#).unwrap();
    let config = test_config(&server, 3).with_reconnect(reconnect);
    let listener = listener_with_config(&dispatcher, config);

    let err = timeout(Duration::from_secs(2), listener.start())
        .await
        .expect("start timed out")
        .unwrap_err();

    assert!(matches!(err, ListenerError::Config(_)), "{err:?}");
    assert!(err.is_terminal());
    assert_eq!(dispatcher.dials(), 0);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn reconnect_backoff_grows_on_loss_and_resets_on_clean_exit() {
    let server = MockServer::start().await;
    let dispatcher = MockDispatcher::new();
    mount_existing_socket(&server).await;
    mount_sign_key(&server, &dispatcher).await;

    let config = test_config(&server, 3).with_reconnect(ReconnectConfig {
        initial_ms: 30,
        max_ms: 10_000,
        multiplier: 4.0,
        randomization_factor: 0.0,
    });
    let listener = listener_with_config(&dispatcher, config);
    listener.start().await.unwrap();

    // lost sessions: 30 ms, 120 ms, 480 ms
    for (established, floor_ms) in [(2, 30), (3, 120), (4, 480)] {
        let dropped = Instant::now();
        dispatcher.drop_session().await;
        dispatcher.wait_for_sessions(established).await;
        let gap = dispatcher.dial_times()[established - 1].duration_since(dropped);
        assert!(gap >= Duration::from_millis(floor_ms), "redial {established} after {gap:?}");
    }

    // a clean exit rewinds to 30 ms instead of 1920 ms
    let ended = Instant::now();
    dispatcher.end_session_cleanly().await;
    dispatcher.wait_for_sessions(5).await;
    let gap = dispatcher.dial_times()[4].duration_since(ended);
    assert!(gap >= Duration::from_millis(30), "{gap:?}");
    assert!(gap < Duration::from_millis(1000), "backoff kept growing: {gap:?}");

    // and growth restarts from there
    let dropped = Instant::now();
    dispatcher.drop_session().await;
    dispatcher.wait_for_sessions(6).await;
    let gap = dispatcher.dial_times()[5].duration_since(dropped);
    assert!(gap >= Duration::from_millis(120), "{gap:?}");
    assert!(gap < Duration::from_millis(1000), "{gap:?}");

    assert_eq!(listener.state(), ListenerState::Live);
    listener.close().await;
}

#[tokio::test]
async fn redial_pins_the_latest_host_key() {
    let server = MockServer::start().await;
    let dispatcher = MockDispatcher::new();
    mount_existing_socket(&server).await;
    mount_sign_key(&server, &dispatcher).await;

    let listener = listener(&server, &dispatcher, 3);
    listener.start().await.unwrap();

    let retired = dispatcher.host_key();
    let rotated = dispatcher.rotate_host_key();
    assert_ne!(retired.key_data(), rotated.key_data());

    dispatcher.drop_session().await;
    dispatcher.wait_for_sessions(2).await;
    assert_eq!(dispatcher.dials(), 2);

    let identities = dispatcher.identities();
    assert_eq!(identities.len(), 2);
    assert_eq!(identities[0].host_key.key_data(), retired.key_data());
    assert_eq!(identities[1].host_key.key_data(), rotated.key_data());

    ping_pong(&dispatcher, &listener).await;

    // the first credential still pins the retired key
    let stale = DialRequest {
        addr: "dispatcher.test:22".to_string(),
        user: PRINCIPAL.to_string(),
        identity: identities[0].clone(),
        handshake_timeout: Duration::from_secs(1),
    };
    let Err(err) = dispatcher.dial(stale).await else {
        panic!("dial with a retired host key succeeded");
    };
    assert!(matches!(err, ListenerError::HostKeyMismatch));

    listener.close().await;
}
