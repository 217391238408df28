pub mod assembler;
pub mod connection;
pub mod network;
pub mod window;

use std::{fmt, net::IpAddr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};

pub use assembler::TcpAssembler;
pub use connection::TcpConnection;
pub use network::{NetworkStream, StreamReader, StreamSettings};
pub use window::ReceiveWindow;

const HTTP_METHODS: [&str; 8] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "TRACE", "OPTIONS", "PATCH",
];

/// One side of a TCP connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Endpoint { address, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Direction independent identity of a connection. Both orderings of the
/// same endpoint pair produce the same key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn new(a: &Endpoint, b: &Endpoint) -> Self {
        let a = a.to_string();
        let b = b.to_string();

        if a < b {
            ConnectionKey(format!("{a}-{b}"))
        } else {
            ConnectionKey(format!("{b}-{a}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

/// Sequence space view of a single captured TCP packet.
#[derive(Clone)]
pub struct Segment {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload: Bytes,
}

impl Segment {
    /// Sequence number right after the last payload byte.
    pub fn end_seq(&self) -> u32 {
        self.seq.wrapping_add(self.payload.len() as u32)
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("seq", &self.seq)
            .field("ack", &self.ack)
            .field("flags", &self.flags)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// A decoded TCP packet together with its addressing and capture time.
pub struct EnrichedPacket {
    pub ts: DateTime<Utc>,
    pub source: Endpoint,
    pub dest: Endpoint,
    pub segment: Segment,
}

impl fmt::Debug for EnrichedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrichedPacket")
            .field("ts", &self.ts)
            .field("source", &self.source)
            .field("dest", &self.dest)
            .field("segment", &self.segment)
            .finish()
    }
}

impl EnrichedPacket {
    /// Extract addressing and TCP fields. Returns `None` for anything that is
    /// not TCP over IPv4/IPv6.
    pub fn enrich_packet(sliced: &SlicedPacket, ts: DateTime<Utc>) -> Option<EnrichedPacket> {
        let tcp = match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => tcp,
            _ => return None,
        };

        let (src_addr, dst_addr) = match &sliced.net {
            Some(NetSlice::Ipv4(ip4)) => (
                IpAddr::V4(ip4.header().source_addr()),
                IpAddr::V4(ip4.header().destination_addr()),
            ),
            Some(NetSlice::Ipv6(ip6)) => (
                IpAddr::V6(ip6.header().source_addr()),
                IpAddr::V6(ip6.header().destination_addr()),
            ),
            _ => return None,
        };

        Some(EnrichedPacket {
            ts,
            source: Endpoint::new(src_addr, tcp.source_port()),
            dest: Endpoint::new(dst_addr, tcp.destination_port()),
            segment: Segment {
                seq: tcp.sequence_number(),
                ack: tcp.acknowledgment_number(),
                flags: TcpFlags {
                    syn: tcp.syn(),
                    ack: tcp.ack(),
                    fin: tcp.fin(),
                    rst: tcp.rst(),
                },
                payload: Bytes::copy_from_slice(tcp.payload()),
            },
        })
    }
}

/// True when the payload starts like an HTTP/1.x request line.
pub fn is_http_request_data(payload: &[u8]) -> bool {
    if payload.len() < 8 {
        return false;
    }

    let head = &payload[..8];

    match head.iter().position(|b| *b == b' ') {
        Some(idx) => HTTP_METHODS
            .iter()
            .any(|method| method.as_bytes() == &head[..idx]),
        None => false,
    }
}
