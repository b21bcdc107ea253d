//! TCP packet decoding
//!
//! Parses raw frames (Ethernet or BSD loopback, optionally VLAN-tagged,
//! IPv4/IPv6, TCP) into [`DecodedPacket`]s carrying the connection
//! endpoints, a 64-bit flow hash and the TCP payload. Non-TCP packets are
//! dropped here.

pub mod pool;

pub use pool::Pool;

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use tracing::warn;

use crate::capture::CaptureInfo;

/// One endpoint of a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Directional connection key (source and destination endpoints).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub src: Endpoint,
    pub dst: Endpoint,
}

impl ConnKey {
    /// The same connection viewed from the opposite direction.
    pub fn reverse(&self) -> ConnKey {
        ConnKey {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// TCP header flags relevant to reassembly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub ack: bool,
    pub psh: bool,
}

/// The broken-down structure of a decoded TCP packet.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub ts: DateTime<Utc>,
    /// Combined network + transport flow hash. Both directions of a
    /// connection produce the same value so that they are handled by the
    /// same assembly worker.
    pub flow_hash: u64,
    pub conn: ConnKey,
    pub seq: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
}

/// Reusable packet decoder. Not threadsafe; each decode worker owns one.
#[derive(Debug, Default)]
pub struct Decoder {
    largest_truncated: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a raw frame into a [`DecodedPacket`]. Returns `None` for
    /// anything that is not TCP over IPv4/IPv6.
    pub fn decode(&mut self, info: &CaptureInfo, data: &[u8]) -> Option<DecodedPacket> {
        if info.cap_len < info.orig_len && info.orig_len > self.largest_truncated {
            warn!(
                length = info.orig_len,
                captured = info.cap_len,
                "packet truncated, consider increasing snaplen"
            );
            self.largest_truncated = info.orig_len;
        }

        // An interface frame starts with Ethernet or, on loopback devices,
        // a 4-byte BSD null/loopback family header. Try Ethernet first.
        let sliced = match SlicedPacket::from_ethernet(data) {
            Ok(s) if has_tcp(&s) => s,
            _ => slice_loopback(data)?,
        };

        let (src_ip, dst_ip) = match sliced.net.as_ref()? {
            NetSlice::Ipv4(ipv4) => {
                let h = ipv4.header();
                (
                    IpAddr::from(h.source_addr()),
                    IpAddr::from(h.destination_addr()),
                )
            }
            NetSlice::Ipv6(ipv6) => {
                let h = ipv6.header();
                (
                    IpAddr::from(h.source_addr()),
                    IpAddr::from(h.destination_addr()),
                )
            }
        };

        let tcp = match sliced.transport.as_ref()? {
            TransportSlice::Tcp(tcp) => tcp,
            _ => return None,
        };

        let conn = ConnKey {
            src: Endpoint {
                ip: src_ip,
                port: tcp.source_port(),
            },
            dst: Endpoint {
                ip: dst_ip,
                port: tcp.destination_port(),
            },
        };

        Some(DecodedPacket {
            ts: info.ts,
            flow_hash: flow_hash(&conn),
            conn,
            seq: tcp.sequence_number(),
            flags: TcpFlags {
                syn: tcp.syn(),
                fin: tcp.fin(),
                rst: tcp.rst(),
                ack: tcp.ack(),
                psh: tcp.psh(),
            },
            payload: tcp.payload().to_vec(),
        })
    }
}

fn has_tcp(sliced: &SlicedPacket<'_>) -> bool {
    matches!(sliced.transport, Some(TransportSlice::Tcp(_)))
}

/// BSD null/loopback encapsulation: a 4-byte host-endian address family
/// followed by the IP packet.
fn slice_loopback(data: &[u8]) -> Option<SlicedPacket<'_>> {
    if data.len() < 4 {
        return None;
    }
    let family = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
    // AF_INET and the BSD variants of AF_INET6
    if !matches!(family, 2 | 10 | 24 | 28 | 30) {
        return None;
    }
    let sliced = SlicedPacket::from_ip(&data[4..]).ok()?;
    has_tcp(&sliced).then_some(sliced)
}

/// Combined network + transport flow hash.
///
/// The per-layer hashes are direction-independent (endpoints are fed in a
/// canonical order), so both halves of a connection land on the same
/// assembly worker; the per-connection ordering guarantee of the pipeline
/// depends on this.
pub fn flow_hash(conn: &ConnKey) -> u64 {
    let net = symmetric_pair_hash(&ip_bytes(conn.src.ip), &ip_bytes(conn.dst.ip));
    let transport = symmetric_pair_hash(&conn.src.port.to_be_bytes(), &conn.dst.port.to_be_bytes());
    hash_combine(net, transport)
}

fn ip_bytes(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn symmetric_pair_hash(a: &[u8], b: &[u8]) -> u64 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut h = fnv1a(FNV_OFFSET, lo);
    h = fnv1a(h, hi);
    h
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x100_0000_01b3;

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// boost-style hash_combine over two 64-bit values.
fn hash_combine(h: u64, k: u64) -> u64 {
    const M: u64 = 0xc6a4_a793_5bd1_e995;
    const R: u32 = 47;

    let mut k = k.wrapping_mul(M);
    k ^= k >> R;
    k = k.wrapping_mul(M);

    let mut h = h ^ k;
    h = h.wrapping_mul(M);
    h.wrapping_add(0xe654_6b64)
}
