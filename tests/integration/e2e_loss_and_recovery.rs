//! End-to-end resilience: a lossy uplink still completes exchanges, and a
//! server restart recovers profiles and followers from the snapshot.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use client::ClientSession;
use nf_proto::{Address, MessageBody, MessageType, NotifMessage, Username};
use nf_test_utils::{drop_first_copies, within};
use nf_transport::{Config, DatagramEndpoint, ReliableTransport, WorkerRegistry};
use server::{Pipeline, ProfileStore};

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

async fn start_server(data_file: &Path) -> TestServer {
    let store = Arc::new(ProfileStore::new(data_file));
    store.load().await;
    let udp = DatagramEndpoint::bind(Address::localhost(0)).await.unwrap();
    let port = udp.local_addr().unwrap().port;
    let transport = ReliableTransport::start(udp, fast_config());
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

/// A link that eats the first 9 copies of every datagram still completes a
/// connect/follow exchange when the client retries 10 times per request.
#[tokio::test]
async fn lossy_uplink_still_completes_exchanges() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start_server(&dir.path().join("server_data")).await;

    let attempts = 10;
    let udp = DatagramEndpoint::bind(Address::localhost(0))
        .await
        .unwrap()
        .with_fault_plan(drop_first_copies(attempts - 1));
    let transport = ReliableTransport::start(
        udp,
        fast_config().with_max_req_attempts(attempts),
    );

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

    let client_addr = transport.local_addr().unwrap();
    assert_eq!(
        srv.store.session_username(client_addr),
        Some(username("@helloworld"))
    );

    srv.shutdown().await;
}

/// Profiles and follower relationships survive a restart; sessions do not.
/// After the restart, a publish still reaches the re-connected follower.
#[tokio::test]
async fn snapshot_recovers_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let data_file = dir.path().join("server_data");

    {
        let srv = start_server(&data_file).await;

        let alice = within(
            "alice connect",
            ClientSession::connect(username("@helloworld"), srv.addr, fast_config()),
        )
        .await
        .unwrap();
        let bob = within(
            "bob connect",
            ClientSession::connect(username("@goodbye"), srv.addr, fast_config()),
        )
        .await
        .unwrap();
        within("follow", bob.follow(&username("@helloworld"))).await.unwrap();
        within("alice disconnect", alice.disconnect()).await.unwrap();
        within("bob disconnect", bob.disconnect()).await.unwrap();
        srv.shutdown().await;
    }

    let srv = start_server(&data_file).await;
    assert!(srv.store.has_profile(&username("@helloworld")));
    assert!(srv.store.has_profile(&username("@goodbye")));
    assert_eq!(
        srv.store
            .followers_of(&username("@helloworld"))
            .map(|followers| followers.len()),
        Some(1)
    );

    let alice = within(
        "alice reconnect",
        ClientSession::connect(username("@helloworld"), srv.addr, fast_config()),
    )
    .await
    .unwrap();
    let bob = within(
        "bob reconnect",
        ClientSession::connect(username("@goodbye"), srv.addr, fast_config()),
    )
    .await
    .unwrap();

    within(
        "publish after restart",
        alice.notify(NotifMessage::new("welcome back").unwrap()),
    )
    .await
    .unwrap();
    let delivery = within("delivery after restart", bob.next_delivery())
        .await
        .unwrap();
    assert_eq!(delivery.sender, username("@helloworld"));
    assert_eq!(delivery.message, NotifMessage::new("welcome back").unwrap());

    srv.shutdown().await;
}
