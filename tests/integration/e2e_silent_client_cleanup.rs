//! A client that vanishes without a disconnect is pinged, given up on, and
//! its session cleaned up through the synthesized disconnect path.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nf_proto::{Address, Envelope, Message, MessageBody, MessageType, Username};
use nf_test_utils::within;
use nf_transport::cooldown::LinearConfig;
use nf_transport::{Config, DatagramEndpoint, ReliableTransport, WorkerRegistry};
use server::{Pipeline, ProfileStore};

fn username(content: &str) -> Username {
    Username::new(content).unwrap()
}

async fn start_server(data_file: &Path, config: Config) -> (Address, ReliableTransport, WorkerRegistry, Arc<ProfileStore>) {
    let store = Arc::new(ProfileStore::new(data_file));
    store.load().await;
    let udp = DatagramEndpoint::bind(Address::localhost(0)).await.unwrap();
    let port = udp.local_addr().unwrap().port;
    let transport = ReliableTransport::start(udp, config);
    let registry = WorkerRegistry::new();
    Pipeline::start(&registry, transport.clone(), store.clone());
    (Address::localhost(port), transport, registry, store)
}

#[tokio::test]
async fn vanished_client_session_is_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    // Aggressive silence schedule: ping from tick 30, give up at tick 80
    // (milliseconds, at the 1ms bump interval).
    let config = Config::default()
        .with_bump_interval(Duration::from_millis(1))
        .with_poll_timeout(Duration::from_millis(5))
        .with_silence(LinearConfig {
            ticks_per_attempt: 10,
            max_ticks: 80,
            start_delay: 30,
        });
    let (server_addr, transport, registry, store) =
        start_server(&dir.path().join("server_data"), config).await;

    // A bare endpoint stands in for a client whose process died: it can
    // connect, but it will never answer a ping.
    let raw = DatagramEndpoint::bind(Address::localhost(0)).await.unwrap();
    let raw_addr = Address::localhost(raw.local_addr().unwrap().port);

    let connect = Envelope::new(
        server_addr,
        Message::request(MessageBody::ConnectReq { username: username("@helloworld") }),
    );
    raw.send(&connect).await.unwrap();
    let resp = within("connect resp", raw.recv()).await.unwrap();
    resp.message.body.expect_resp(MessageType::Connect).unwrap();
    assert_eq!(store.session_username(raw_addr), Some(username("@helloworld")));

    // The server probes the quiet peer before giving up on it.
    let probe = within("ping probe", raw.recv()).await.unwrap();
    assert_eq!(probe.message.body, MessageBody::PingReq);

    // Stay silent until the synthesized disconnect removes the session.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.session_username(raw_addr).is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session should be cleaned up after the peer is abandoned"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The slot is free again: the same profile can connect twice more.
    for port_hint in 0..2 {
        let another = DatagramEndpoint::bind(Address::localhost(0)).await.unwrap();
        let connect = Envelope::new(
            server_addr,
            Message::request(MessageBody::ConnectReq { username: username("@helloworld") }),
        );
        another.send(&connect).await.unwrap();
        let resp = within("reconnect resp", another.recv()).await.unwrap();
        assert!(
            resp.message.body.expect_resp(MessageType::Connect).is_ok(),
            "reconnect {port_hint} should be accepted"
        );
    }

    transport.stop_receiving();
    transport.disconnect_timeout(1_000_000, 4).await;
    store.shutdown();
    registry.join_all().await;
}
