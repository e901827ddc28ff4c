//! Shared helpers for transport and end-to-end tests: canned fault plans
//! for the datagram endpoint and small await-with-deadline wrappers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use nf_proto::Address;
use nf_transport::FaultPlan;

/// Generous default deadline for test awaits.
pub const TEST_WAIT: Duration = Duration::from_secs(5);

/// Await `future` under [`TEST_WAIT`], panicking with `what` on deadline.
pub async fn within<T>(what: &str, future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(TEST_WAIT, future).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Bind an ephemeral UDP socket to reserve a port and return its address.
/// The socket is dropped before returning, so the port is only probably
/// still free; prefer binding port 0 directly where the code under test
/// allows it.
pub fn free_local_addr() -> Address {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind ephemeral socket");
    let port = socket.local_addr().expect("socket has a local address").port();
    Address::localhost(port)
}

/// Drop the first `copies` transmissions of every distinct datagram, then
/// let further copies through.  Retransmissions carry identical bytes, so
/// this simulates a link that loses the first `copies` attempts of each
/// message.
pub fn drop_first_copies(copies: u64) -> FaultPlan {
    let counts: Mutex<HashMap<Vec<u8>, u64>> = Mutex::new(HashMap::new());
    FaultPlan::from_fn(move |bytes, _remote| {
        let mut counts = counts.lock().unwrap();
        let seen = counts.entry(bytes.to_vec()).or_insert(0);
        *seen += 1;
        *seen <= copies
    })
}

/// Drop every outbound datagram addressed to `remote`; everything else
/// passes.  Simulates a one-way partition.
pub fn drop_towards(remote: Address) -> FaultPlan {
    FaultPlan::from_fn(move |_bytes, to| to == remote)
}

/// Drop everything.
pub fn drop_all() -> FaultPlan {
    FaultPlan::from_fn(|_bytes, _remote| true)
}
