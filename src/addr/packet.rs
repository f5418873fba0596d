//! IP packet header inspection
//!
//! The bridge never interprets TCP sequence space; it only needs the
//! transport identity of a packet (protocol, source, destination, a few TCP
//! flags) to log, route and validate what is handed to the engine. Header
//! parsing uses `smoltcp::wire` in checked mode, so truncated or inconsistent
//! packets are rejected instead of read out of bounds.
//!
//! The IPv4 builders at the bottom produce well-formed packets with valid
//! checksums; they are used by the in-memory engine's tests and by embedders
//! that synthesize traffic.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::ops::Range;

use bytes::Bytes;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket,
};

use super::Protocol;
use crate::error::AddressError;

/// IPv4 header length without options
const IPV4_HEADER_LEN: usize = 20;

/// IPv6 fixed header length
const IPV6_HEADER_LEN: usize = 40;

/// TCP header length without options
const TCP_HEADER_LEN: usize = 20;

/// UDP header length
const UDP_HEADER_LEN: usize = 8;

/// Default hop limit for synthesized packets
const DEFAULT_TTL: u8 = 64;

/// TCP control flags relevant to connection lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    /// SYN
    pub syn: bool,
    /// ACK
    pub ack: bool,
    /// FIN
    pub fin: bool,
    /// RST
    pub rst: bool,
}

impl TcpFlags {
    /// Flags of an initial connection request
    #[must_use]
    pub const fn syn() -> Self {
        Self {
            syn: true,
            ack: false,
            fin: false,
            rst: false,
        }
    }

    /// Flags of a plain data segment
    #[must_use]
    pub const fn ack() -> Self {
        Self {
            syn: false,
            ack: true,
            fin: false,
            rst: false,
        }
    }

    /// True for a SYN without ACK (new inbound connection)
    #[must_use]
    pub const fn is_connection_request(&self) -> bool {
        self.syn && !self.ack
    }
}

/// Transport-level summary of an IP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketInfo {
    /// Transport protocol
    pub protocol: Protocol,
    /// Source address
    pub src: SocketAddr,
    /// Destination address
    pub dst: SocketAddr,
    /// TCP flags (all false for UDP)
    pub flags: TcpFlags,
    /// Byte range of the transport payload within the inspected buffer
    pub payload: Range<usize>,
}

impl PacketInfo {
    /// Borrow the transport payload out of the buffer that was inspected
    #[must_use]
    pub fn payload<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        &packet[self.payload.clone()]
    }
}

/// Inspect an IPv4 or IPv6 packet carrying TCP or UDP
///
/// # Errors
///
/// Returns `AddressError::Malformed` for truncated headers and
/// `AddressError::Unsupported` for other IP versions or transports.
pub fn inspect(packet: &[u8]) -> Result<PacketInfo, AddressError> {
    match packet.first().map(|b| b >> 4) {
        Some(4) => inspect_v4(packet),
        Some(6) => inspect_v6(packet),
        Some(v) => Err(AddressError::Unsupported(format!("IP version {v}"))),
        None => Err(AddressError::Malformed("empty packet".into())),
    }
}

/// Check that a buffer starts with a complete IPv4 or IPv6 header
///
/// Says nothing about the transport: ICMP, fragments and extension headers
/// all pass.
///
/// # Errors
///
/// Returns `AddressError::Malformed` for a truncated or inconsistent IP
/// header and `AddressError::Unsupported` for other IP versions.
pub fn check_ip_header(packet: &[u8]) -> Result<(), AddressError> {
    match packet.first().map(|b| b >> 4) {
        Some(4) => Ipv4Packet::new_checked(packet)
            .map(|_| ())
            .map_err(|e| AddressError::Malformed(format!("ipv4: {e}"))),
        Some(6) => Ipv6Packet::new_checked(packet)
            .map(|_| ())
            .map_err(|e| AddressError::Malformed(format!("ipv6: {e}"))),
        Some(v) => Err(AddressError::Unsupported(format!("IP version {v}"))),
        None => Err(AddressError::Malformed("empty packet".into())),
    }
}

fn inspect_v4(packet: &[u8]) -> Result<PacketInfo, AddressError> {
    let ip = Ipv4Packet::new_checked(packet)
        .map_err(|e| AddressError::Malformed(format!("ipv4: {e}")))?;
    let src = IpAddr::V4(Ipv4Addr::from(ip.src_addr().0));
    let dst = IpAddr::V4(Ipv4Addr::from(ip.dst_addr().0));
    let offset = usize::from(ip.header_len());
    inspect_transport(ip.next_header(), ip.payload(), offset, src, dst)
}

fn inspect_v6(packet: &[u8]) -> Result<PacketInfo, AddressError> {
    let ip = Ipv6Packet::new_checked(packet)
        .map_err(|e| AddressError::Malformed(format!("ipv6: {e}")))?;
    let src = IpAddr::V6(Ipv6Addr::from(ip.src_addr().0));
    let dst = IpAddr::V6(Ipv6Addr::from(ip.dst_addr().0));
    inspect_transport(ip.next_header(), ip.payload(), IPV6_HEADER_LEN, src, dst)
}

fn inspect_transport(
    next_header: IpProtocol,
    segment: &[u8],
    offset: usize,
    src: IpAddr,
    dst: IpAddr,
) -> Result<PacketInfo, AddressError> {
    match next_header {
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(segment)
                .map_err(|e| AddressError::Malformed(format!("tcp: {e}")))?;
            let start = offset + usize::from(tcp.header_len());
            Ok(PacketInfo {
                protocol: Protocol::Tcp,
                src: SocketAddr::new(src, tcp.src_port()),
                dst: SocketAddr::new(dst, tcp.dst_port()),
                flags: TcpFlags {
                    syn: tcp.syn(),
                    ack: tcp.ack(),
                    fin: tcp.fin(),
                    rst: tcp.rst(),
                },
                payload: start..offset + segment.len(),
            })
        }
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(segment)
                .map_err(|e| AddressError::Malformed(format!("udp: {e}")))?;
            let start = offset + UDP_HEADER_LEN;
            Ok(PacketInfo {
                protocol: Protocol::Udp,
                src: SocketAddr::new(src, udp.src_port()),
                dst: SocketAddr::new(dst, udp.dst_port()),
                flags: TcpFlags::default(),
                payload: start..offset + usize::from(udp.len()),
            })
        }
        other => Err(AddressError::Unsupported(format!("transport {other}"))),
    }
}

fn to_ipv4_address(addr: &SocketAddrV4) -> Ipv4Address {
    Ipv4Address(addr.ip().octets())
}

fn write_ipv4_header(buf: &mut [u8], protocol: IpProtocol, src: &SocketAddrV4, dst: &SocketAddrV4) {
    let total_len = buf.len();
    let mut ip = Ipv4Packet::new_unchecked(buf);
    ip.set_version(4);
    ip.set_header_len(IPV4_HEADER_LEN as u8);
    ip.set_total_len(total_len as u16);
    ip.set_hop_limit(DEFAULT_TTL);
    ip.set_next_header(protocol);
    ip.set_src_addr(to_ipv4_address(src));
    ip.set_dst_addr(to_ipv4_address(dst));
    ip.fill_checksum();
}

/// Build an IPv4/UDP packet
#[must_use]
pub fn build_ipv4_udp(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Bytes {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut buf = vec![0u8; IPV4_HEADER_LEN + udp_len];
    write_ipv4_header(&mut buf, IpProtocol::Udp, &src, &dst);

    let mut udp = UdpPacket::new_unchecked(&mut buf[IPV4_HEADER_LEN..]);
    udp.set_src_port(src.port());
    udp.set_dst_port(dst.port());
    udp.set_len(udp_len as u16);
    udp.payload_mut().copy_from_slice(payload);
    udp.fill_checksum(
        &IpAddress::Ipv4(to_ipv4_address(&src)),
        &IpAddress::Ipv4(to_ipv4_address(&dst)),
    );

    Bytes::from(buf)
}

/// Build an IPv4/TCP segment with the given flags
///
/// Sequence and acknowledgement numbers are left at zero; the bridge does
/// not interpret them.
#[must_use]
pub fn build_ipv4_tcp(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    flags: TcpFlags,
    payload: &[u8],
) -> Bytes {
    let mut buf = vec![0u8; IPV4_HEADER_LEN + TCP_HEADER_LEN + payload.len()];
    write_ipv4_header(&mut buf, IpProtocol::Tcp, &src, &dst);

    let mut tcp = TcpPacket::new_unchecked(&mut buf[IPV4_HEADER_LEN..]);
    tcp.set_src_port(src.port());
    tcp.set_dst_port(dst.port());
    tcp.set_header_len(TCP_HEADER_LEN as u8);
    tcp.set_syn(flags.syn);
    tcp.set_ack(flags.ack);
    tcp.set_fin(flags.fin);
    tcp.set_rst(flags.rst);
    tcp.set_window_len(u16::MAX);
    tcp.payload_mut().copy_from_slice(payload);
    tcp.fill_checksum(
        &IpAddress::Ipv4(to_ipv4_address(&src)),
        &IpAddress::Ipv4(to_ipv4_address(&dst)),
    );

    Bytes::from(buf)
}
