//! Server-side rule enforcement observed from the wire: session caps,
//! unknown profiles, self-follows, and operations without a session.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use client::{ClientError, ClientSession};
use nf_proto::{Address, ErrorKind, MessageBody, MessageType, Username};
use nf_test_utils::within;
use nf_transport::{Config, DatagramEndpoint, ReliableTransport, WorkerRegistry};
use server::{Pipeline, ProfileStore, MAX_SESSIONS_PER_PROFILE};

struct TestServer {
    addr: Address,
    transport: ReliableTransport,
    registry: WorkerRegistry,
    store: Arc<ProfileStore>,
}

fn fast_config() -> Config {
    Config::default()
        .with_bump_interval(Duration::from_millis(1))
        .with_poll_timeout(Duration::from_millis(5))
}

async fn start_server(data_file: &Path, config: Config) -> TestServer {
    let store = Arc::new(ProfileStore::new(data_file));
    store.load().await;
    let udp = DatagramEndpoint::bind(Address::localhost(0)).await.unwrap();
    let port = udp.local_addr().unwrap().port;
    let transport = ReliableTransport::start(udp, config);
    let registry = WorkerRegistry::new();
    Pipeline::start(&registry, transport.clone(), store.clone());
    TestServer {
        addr: Address::localhost(port),
        transport,
        registry,
        store,
    }
}

impl TestServer {
    async fn shutdown(self) {
        self.transport.stop_receiving();
        self.transport.disconnect_timeout(1_000_000, 4).await;
        self.store.shutdown();
        self.registry.join_all().await;
    }
}

fn username(content: &str) -> Username {
    Username::new(content).unwrap()
}

/// With two sessions allowed per profile, the third concurrent connect is
/// answered with TOO_MANY_SESSIONS while the first two stand.
#[tokio::test]
async fn third_session_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start_server(&dir.path().join("server_data"), fast_config()).await;

    let mut sessions = Vec::new();
    for _ in 0..MAX_SESSIONS_PER_PROFILE {
        let session = within(
            "connect",
            ClientSession::connect(username("@helloworld"), srv.addr, fast_config()),
        )
        .await
        .unwrap();
        sessions.push(session);
    }

    let refused = within(
        "third connect",
        ClientSession::connect(username("@helloworld"), srv.addr, fast_config()),
    )
    .await;
    match refused {
        Err(ClientError::Refused(kind)) => assert_eq!(kind, ErrorKind::TooManySessions),
        Err(other) => panic!("expected TOO_MANY_SESSIONS, got {other:?}"),
        Ok(_) => panic!("expected TOO_MANY_SESSIONS, got a session"),
    }

    // The cap frees up once a session leaves.
    let leaving = sessions.pop().unwrap();
    within("disconnect", leaving.disconnect()).await.unwrap();
    let replacement = within(
        "replacement connect",
        ClientSession::connect(username("@helloworld"), srv.addr, fast_config()),
    )
    .await;
    assert!(replacement.is_ok());

    srv.shutdown().await;
}

#[tokio::test]
async fn follow_errors_cross_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start_server(&dir.path().join("server_data"), fast_config()).await;

    let session = within(
        "connect",
        ClientSession::connect(username("@helloworld"), srv.addr, fast_config()),
    )
    .await
    .unwrap();

    let unknown = within("follow unknown", session.follow(&username("@missing_one"))).await;
    match unknown {
        Err(ClientError::Refused(kind)) => assert_eq!(kind, ErrorKind::UnknownUsername),
        other => panic!("expected UNKNOWN_USERNAME, got {other:?}"),
    }

    let own = within("follow self", session.follow(&username("@helloworld"))).await;
    match own {
        Err(ClientError::Refused(kind)) => assert_eq!(kind, ErrorKind::CannotFollowSelf),
        other => panic!("expected CANNOT_FOLLOW_SELF, got {other:?}"),
    }

    srv.shutdown().await;
}

/// After a graceful disconnect the transport connection lingers for cache
/// replay, but the session is gone: a follow through it is NO_CONNECTION.
#[tokio::test]
async fn operations_after_disconnect_have_no_session() {
    let dir = tempfile::tempdir().unwrap();
    // Long linger so the connection still exists when the follow arrives.
    let srv = start_server(
        &dir.path().join("server_data"),
        fast_config().with_disconnect_linger_ticks(10_000),
    )
    .await;

    let udp = DatagramEndpoint::bind(Address::localhost(0)).await.unwrap();
    let transport = ReliableTransport::start(udp, fast_config());

    let connect = transport
        .send_req(srv.addr, MessageBody::ConnectReq { username: username("@helloworld") })
        .await
        .unwrap();
    within("connect resp", connect.await_response())
        .await
        .unwrap()
        .message
        .body
        .expect_resp(MessageType::Connect)
        .unwrap();

    let goodbye = transport
        .send_req(srv.addr, MessageBody::DisconnectReq)
        .await
        .unwrap();
    within("disconnect resp", goodbye.await_response())
        .await
        .unwrap()
        .message
        .body
        .expect_resp(MessageType::Disconnect)
        .unwrap();

    let follow = transport
        .send_req(srv.addr, MessageBody::FollowReq { username: username("@helloworld") })
        .await
        .unwrap();
    let resp = within("follow resp", follow.await_response()).await.unwrap();
    match resp.message.body {
        MessageBody::ErrorResp { kind } => assert_eq!(kind, ErrorKind::NoConnection),
        other => panic!("expected NO_CONNECTION error, got {other:?}"),
    }

    assert_eq!(srv.store.session_username(transport.local_addr().unwrap()), None);
    srv.shutdown().await;
}
