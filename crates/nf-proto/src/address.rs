//! IPv4/UDP peer addresses and the CLI parsing helpers for them.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::wire::{WireDecode, WireEncode, WireError, WireReader, WireWriter};

/// An (IPv4, UDP port) pair identifying a peer.
///
/// Ordered lexicographically (address first, then port) so it can key the
/// connection and session tables.  Renders as `a.b.c.d:port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    pub ipv4: Ipv4Addr,
    pub port: u16,
}

impl Address {
    pub const fn new(ipv4: Ipv4Addr, port: u16) -> Self {
        Address { ipv4, port }
    }

    /// Loopback address on the given port, for tests and defaults.
    pub const fn localhost(port: u16) -> Self {
        Address::new(Ipv4Addr::LOCALHOST, port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ipv4, self.port)
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        SocketAddr::V4(SocketAddrV4::new(addr.ipv4, addr.port))
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Address::new(*addr.ip(), addr.port())
    }
}

impl TryFrom<SocketAddr> for Address {
    type Error = InvalidIpv4;

    fn try_from(addr: SocketAddr) -> Result<Self, InvalidIpv4> {
        match addr {
            SocketAddr::V4(v4) => Ok(Address::from(v4)),
            SocketAddr::V6(v6) => Err(InvalidIpv4 {
                content: v6.to_string(),
            }),
        }
    }
}

impl WireEncode for Address {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u32(u32::from(self.ipv4));
        w.put_u16(self.port);
    }
}

impl WireDecode for Address {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let ipv4 = Ipv4Addr::from(r.take_u32()?);
        let port = r.take_u16()?;
        Ok(Address::new(ipv4, port))
    }
}

/// Argument was not a dotted-quad IPv4 address.
#[derive(Debug, Clone, thiserror::Error)]
#[error("'{content}' is not a valid IPv4 address")]
pub struct InvalidIpv4 {
    pub content: String,
}

/// Argument was not a valid UDP port number.
#[derive(Debug, Clone, thiserror::Error)]
#[error("port '{content}' is invalid: {reason}")]
pub struct InvalidUdpPort {
    pub content: String,
    pub reason: &'static str,
}

/// Parse a dotted-quad IPv4 address from a CLI argument.
pub fn parse_ipv4(content: &str) -> Result<Ipv4Addr, InvalidIpv4> {
    content.parse::<Ipv4Addr>().map_err(|_| InvalidIpv4 {
        content: content.to_owned(),
    })
}

/// Parse a UDP port from a CLI argument.  Port 0 is rejected; binds that
/// want an ephemeral port ask the endpoint for one explicitly.
pub fn parse_udp_port(content: &str) -> Result<u16, InvalidUdpPort> {
    let port: u16 = content.parse().map_err(|_| InvalidUdpPort {
        content: content.to_owned(),
        reason: "must be a number between 1 and 65535",
    })?;
    if port == 0 {
        return Err(InvalidUdpPort {
            content: content.to_owned(),
            reason: "number is out of range",
        });
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_as_dotted_quad_and_port() {
        let addr = Address::new(Ipv4Addr::new(10, 0, 3, 7), 3232);
        assert_eq!(addr.to_string(), "10.0.3.7:3232");
    }

    #[test]
    fn orders_by_address_then_port() {
        let a = Address::new(Ipv4Addr::new(10, 0, 0, 1), 9000);
        let b = Address::new(Ipv4Addr::new(10, 0, 0, 2), 80);
        let c = Address::new(Ipv4Addr::new(10, 0, 0, 2), 81);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn rejects_bad_ports() {
        assert!(parse_udp_port("0").is_err());
        assert!(parse_udp_port("65536").is_err());
        assert!(parse_udp_port("12x").is_err());
        assert_eq!(parse_udp_port("4545").unwrap(), 4545);
    }
}
