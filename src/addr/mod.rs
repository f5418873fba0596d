//! Endpoint and connection identity types
//!
//! Engine callbacks report raw socket addresses; this module turns them into
//! the comparable keys used by the connection registries.
//!
//! # Identities
//!
//! ```text
//! stream:   StreamId { local: client ip:port, remote: dialled ip:port }
//! datagram: FlowId   { source: client ip:port }
//! ```
//!
//! *Local* is always the TUN-side client (the packet source) and *remote*
//! is the destination it tried to reach. A datagram flow is keyed by the
//! source only, so one flow serves every destination a client talks to.

pub mod packet;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AddressError;

/// Transport protocol of a connection or flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Stream connections
    Tcp,
    /// Datagram flows
    Udp,
}

impl Protocol {
    /// IP protocol number
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }

    /// Lowercase protocol name, as shown in the stats report
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(AddressError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Canonicalize a socket address
///
/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are folded to plain IPv4 so
/// that the same client never yields two different registry keys.
#[must_use]
pub fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

/// A protocol-qualified network endpoint
///
/// Immutable once constructed; equality is structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    protocol: Protocol,
    addr: SocketAddr,
}

impl Endpoint {
    /// Create an endpoint, canonicalizing the address
    #[must_use]
    pub fn new(protocol: Protocol, addr: SocketAddr) -> Self {
        Self {
            protocol,
            addr: canonical(addr),
        }
    }

    /// Parse an `ip:port` string (IPv6 in brackets) for the given protocol
    ///
    /// # Errors
    ///
    /// Returns `AddressError::InvalidAddress` if the string is not a socket
    /// address.
    pub fn parse(protocol: Protocol, s: &str) -> Result<Self, AddressError> {
        let addr: SocketAddr = s
            .trim()
            .parse()
            .map_err(|_| AddressError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(protocol, addr))
    }

    /// Transport protocol
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Socket address
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    /// IP address
    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Registry key for a stream connection (four-tuple)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    /// Client side of the connection
    pub local: SocketAddr,
    /// Destination the client dialled
    pub remote: SocketAddr,
}

impl StreamId {
    /// Create a stream identity from canonicalized addresses
    #[must_use]
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            local: canonical(local),
            remote: canonical(remote),
        }
    }

    /// Local endpoint
    #[must_use]
    pub fn local_endpoint(&self) -> Endpoint {
        Endpoint::new(Protocol::Tcp, self.local)
    }

    /// Remote endpoint
    #[must_use]
    pub fn remote_endpoint(&self) -> Endpoint {
        Endpoint::new(Protocol::Tcp, self.remote)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp:{} -> {}", self.local, self.remote)
    }
}

/// Registry key for a datagram flow (source endpoint only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    /// Client source address
    pub source: SocketAddr,
}

impl FlowId {
    /// Create a flow identity from a canonicalized source address
    #[must_use]
    pub fn new(source: SocketAddr) -> Self {
        Self {
            source: canonical(source),
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "udp:{}", self.source)
    }
}
