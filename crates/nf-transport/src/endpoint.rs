//! Datagram endpoint: one serialized envelope per UDP datagram.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;

use nf_proto::wire::{from_bytes, to_bytes};
use nf_proto::{Address, Envelope, WireError};

/// Default cap on a single encoded message.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("socket i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("datagram from {remote} did not decode: {source}")]
    Decode {
        remote: Address,
        source: WireError,
    },
    #[error("encoded message is {len} bytes, over the {max}-byte datagram cap")]
    Oversized { len: usize, max: usize },
    #[error("peer address is not IPv4: {0}")]
    NotIpv4(SocketAddr),
}

impl EndpointError {
    /// Failures caused by a peer's bytes rather than by the local socket.
    /// These are logged and dropped; socket errors propagate.
    pub fn is_wire_noise(&self) -> bool {
        matches!(self, EndpointError::Decode { .. } | EndpointError::NotIpv4(_))
    }
}

/// Sends and receives single serialized messages over UDP.
pub struct DatagramEndpoint {
    socket: UdpSocket,
    max_datagram_size: usize,
    #[cfg(feature = "test-support")]
    fault_plan: Option<FaultPlan>,
}

impl DatagramEndpoint {
    /// Bind to a concrete address (servers bind their configured port).
    pub async fn bind(addr: Address) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::from(addr)).await?;
        Ok(Self::from_socket(socket))
    }

    /// Bind to an OS-assigned port on all interfaces (clients).
    pub async fn bind_ephemeral() -> std::io::Result<Self> {
        Self::bind(Address::new(Ipv4Addr::UNSPECIFIED, 0)).await
    }

    fn from_socket(socket: UdpSocket) -> Self {
        DatagramEndpoint {
            socket,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            #[cfg(feature = "test-support")]
            fault_plan: None,
        }
    }

    pub fn with_max_datagram_size(mut self, max: usize) -> Self {
        self.max_datagram_size = max;
        self
    }

    /// Install an outbound fault plan; datagrams it rejects are silently
    /// dropped instead of transmitted.
    #[cfg(feature = "test-support")]
    pub fn with_fault_plan(mut self, plan: FaultPlan) -> Self {
        self.fault_plan = Some(plan);
        self
    }

    pub fn local_addr(&self) -> Result<Address, EndpointError> {
        let addr = self.socket.local_addr()?;
        Address::try_from(addr).map_err(|_| EndpointError::NotIpv4(addr))
    }

    /// Encode and transmit one envelope to its remote.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), EndpointError> {
        let bytes = to_bytes(&envelope.message);
        if bytes.len() > self.max_datagram_size {
            return Err(EndpointError::Oversized {
                len: bytes.len(),
                max: self.max_datagram_size,
            });
        }

        #[cfg(feature = "test-support")]
        if let Some(plan) = &self.fault_plan {
            if plan.should_drop(&bytes, envelope.remote) {
                return Ok(());
            }
        }

        self.socket
            .send_to(&bytes, SocketAddr::from(envelope.remote))
            .await?;
        Ok(())
    }

    /// Await one datagram and decode it.
    pub async fn recv(&self) -> Result<Envelope, EndpointError> {
        let mut buf = vec![0u8; self.max_datagram_size + 1];
        let (count, src) = self.socket.recv_from(&mut buf).await?;
        let remote = Address::try_from(src).map_err(|_| EndpointError::NotIpv4(src))?;
        let message = from_bytes(&buf[..count])
            .map_err(|source| EndpointError::Decode { remote, source })?;
        Ok(Envelope::new(remote, message))
    }

    /// Like [`recv`](Self::recv), but gives up after `timeout`, returning
    /// `Ok(None)`.
    pub async fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Envelope>, EndpointError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}

/// Decides, per encoded datagram, whether the endpoint should drop it
/// instead of transmitting.  Only available to tests.
#[cfg(feature = "test-support")]
#[derive(Clone)]
pub struct FaultPlan {
    decide: std::sync::Arc<dyn Fn(&[u8], Address) -> bool + Send + Sync>,
}

#[cfg(feature = "test-support")]
impl FaultPlan {
    pub fn from_fn(decide: impl Fn(&[u8], Address) -> bool + Send + Sync + 'static) -> Self {
        FaultPlan { decide: std::sync::Arc::new(decide) }
    }

    pub fn should_drop(&self, bytes: &[u8], remote: Address) -> bool {
        (self.decide)(bytes, remote)
    }
}
