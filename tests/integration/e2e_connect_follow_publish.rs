//! End-to-end happy path: two clients connect over real UDP loopback, one
//! follows the other, a publish lands as a delivered notification.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use client::ClientSession;
use nf_proto::{Address, NotifMessage, Username};
use nf_test_utils::within;
use nf_transport::{Config, DatagramEndpoint, ReliableTransport, WorkerRegistry};
use server::{Pipeline, ProfileStore};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

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

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_follow_publish_deliver() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start_server(&dir.path().join("server_data")).await;

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
    within(
        "publish",
        alice.notify(NotifMessage::new("Hello, World!").unwrap()),
    )
    .await
    .unwrap();

    let delivery = within("delivery", bob.next_delivery()).await.unwrap();
    assert_eq!(delivery.sender, username("@helloworld"));
    assert_eq!(delivery.message, NotifMessage::new("Hello, World!").unwrap());

    within("alice disconnect", alice.disconnect()).await.unwrap();
    within("bob disconnect", bob.disconnect()).await.unwrap();
    srv.shutdown().await;
}

/// A follower with two live sessions gets the notification on both.
#[tokio::test]
async fn delivery_reaches_every_session_of_the_follower() {
    let dir = tempfile::tempdir().unwrap();
    let srv = start_server(&dir.path().join("server_data")).await;

    let author = within(
        "author connect",
        ClientSession::connect(username("@helloworld"), srv.addr, fast_config()),
    )
    .await
    .unwrap();
    let desk = within(
        "desk connect",
        ClientSession::connect(username("@goodbye"), srv.addr, fast_config()),
    )
    .await
    .unwrap();
    let phone = within(
        "phone connect",
        ClientSession::connect(username("@goodbye"), srv.addr, fast_config()),
    )
    .await
    .unwrap();

    within("follow", desk.follow(&username("@helloworld"))).await.unwrap();
    within(
        "publish",
        author.notify(NotifMessage::new("everywhere at once").unwrap()),
    )
    .await
    .unwrap();

    let on_desk = within("desk delivery", desk.next_delivery()).await.unwrap();
    let on_phone = within("phone delivery", phone.next_delivery()).await.unwrap();
    assert_eq!(on_desk, on_phone);
    assert_eq!(on_desk.message, NotifMessage::new("everywhere at once").unwrap());

    srv.shutdown().await;
}
