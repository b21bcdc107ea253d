//! TCP stream sequencing
//!
//! Orders the segments of each half-connection by sequence number and
//! delivers them as contiguous byte runs with explicit loss markers. At
//! most one out-of-order segment is buffered per connection and per worker
//! in total: reordering beyond that is not healed, the gap is reported and
//! the stream keeps flowing.
//!
//! All sequence arithmetic is wrapping 32-bit, compared via the signed
//! distance between positions.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::trace;

use crate::decode::{ConnKey, DecodedPacket};

/// How long a half-connection may sit idle (in packet time) before it is
/// flushed and completed.
pub const STREAM_IDLE_SECS: i64 = 60;

/// A delivery to one half-connection's stream.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent<'a> {
    /// Contiguous stream bytes, preceded by `skip` bytes that were lost.
    /// `skip` is −1 when the stream was joined mid-conversation and the
    /// amount of prior loss is unknown.
    Data { skip: isize, bytes: &'a [u8] },
    /// No more data will be delivered for this half-connection.
    Complete,
}

/// An out-of-order segment parked until the stream catches up.
#[derive(Debug)]
struct Page {
    seq: u32,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct HalfStream {
    /// Sequence number of the next expected byte; `None` until the first
    /// segment is seen.
    next_seq: Option<u32>,
    page: Option<Page>,
    last_seen: DateTime<Utc>,
}

/// Signed distance from `b` to `a` in sequence space.
fn seq_delta(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Per-worker TCP reassembler over directional half-connections.
#[derive(Debug, Default)]
pub struct Reassembler {
    streams: HashMap<ConnKey, HalfStream>,
    /// Worker-wide out-of-order page budget (max one page total).
    pages_used: usize,
    /// Most recent packet timestamp observed, driving idle flushes.
    latest_ts: DateTime<Utc>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of half-connections currently tracked.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Most recent packet timestamp seen by this reassembler.
    pub fn latest_ts(&self) -> DateTime<Utc> {
        self.latest_ts
    }

    /// Feed one decoded packet, invoking `deliver` for every stream event
    /// it produces for the packet's half-connection. After a `Complete`
    /// the half-connection's state is discarded.
    pub fn assemble<F>(&mut self, pkt: &DecodedPacket, mut deliver: F)
    where
        F: FnMut(StreamEvent<'_>),
    {
        if pkt.ts > self.latest_ts {
            self.latest_ts = pkt.ts;
        }

        let stream = self.streams.entry(pkt.conn).or_default();
        stream.last_seen = pkt.ts;

        if pkt.flags.rst {
            Self::finish(&mut self.streams, &mut self.pages_used, &pkt.conn, &mut deliver);
            return;
        }

        if pkt.flags.syn {
            // ISN consumes one sequence number
            stream.next_seq = Some(pkt.seq.wrapping_add(1));
            if pkt.flags.fin {
                Self::finish(&mut self.streams, &mut self.pages_used, &pkt.conn, &mut deliver);
            }
            return;
        }

        if !pkt.payload.is_empty() {
            self.deliver_payload(&pkt.conn, pkt.seq, &pkt.payload, &mut deliver);
        }

        if pkt.flags.fin {
            Self::finish(&mut self.streams, &mut self.pages_used, &pkt.conn, &mut deliver);
        }
    }

    fn deliver_payload<F>(&mut self, key: &ConnKey, seq: u32, payload: &[u8], deliver: &mut F)
    where
        F: FnMut(StreamEvent<'_>),
    {
        let Some(stream) = self.streams.get_mut(key) else {
            return;
        };

        let Some(expected) = stream.next_seq else {
            // joined mid-conversation; unknown amount of prior loss
            stream.next_seq = Some(seq.wrapping_add(payload.len() as u32));
            deliver(StreamEvent::Data {
                skip: -1,
                bytes: payload,
            });
            Self::flush_contiguous(stream, &mut self.pages_used, deliver);
            return;
        };

        let delta = seq_delta(seq, expected);
        if delta == 0 {
            stream.next_seq = Some(seq.wrapping_add(payload.len() as u32));
            deliver(StreamEvent::Data {
                skip: 0,
                bytes: payload,
            });
            Self::flush_contiguous(stream, &mut self.pages_used, deliver);
        } else if delta < 0 {
            // retransmission or overlap; trim the stale prefix
            let overlap = (-delta) as usize;
            if overlap >= payload.len() {
                return;
            }
            let fresh = &payload[overlap..];
            stream.next_seq = Some(expected.wrapping_add(fresh.len() as u32));
            deliver(StreamEvent::Data {
                skip: 0,
                bytes: fresh,
            });
            Self::flush_contiguous(stream, &mut self.pages_used, deliver);
        } else {
            // future segment
            if stream.page.is_none() && self.pages_used == 0 {
                trace!(seq, expected, "buffering out-of-order segment");
                stream.page = Some(Page {
                    seq,
                    bytes: payload.to_vec(),
                });
                self.pages_used = 1;
                return;
            }
            // the reorder budget is spent: flush whatever is parked, then
            // this segment, reporting the gaps instead of healing them
            if let Some(page) = stream.page.take() {
                self.pages_used -= 1;
                let gap = seq_delta(page.seq, expected).max(0) as isize;
                stream.next_seq = Some(page.seq.wrapping_add(page.bytes.len() as u32));
                deliver(StreamEvent::Data {
                    skip: gap,
                    bytes: &page.bytes,
                });
            }
            let expected = stream.next_seq.unwrap_or(seq);
            let delta = seq_delta(seq, expected);
            if delta <= 0 {
                let overlap = (-delta) as usize;
                if overlap < payload.len() {
                    let fresh = &payload[overlap..];
                    stream.next_seq = Some(expected.wrapping_add(fresh.len() as u32));
                    deliver(StreamEvent::Data {
                        skip: 0,
                        bytes: fresh,
                    });
                }
            } else {
                stream.next_seq = Some(seq.wrapping_add(payload.len() as u32));
                deliver(StreamEvent::Data {
                    skip: delta as isize,
                    bytes: payload,
                });
            }
        }
    }

    /// Deliver a parked page if the stream has caught up to it.
    fn flush_contiguous<F>(stream: &mut HalfStream, pages_used: &mut usize, deliver: &mut F)
    where
        F: FnMut(StreamEvent<'_>),
    {
        let Some(next) = stream.next_seq else { return };
        let Some(page) = &stream.page else { return };

        let delta = seq_delta(page.seq, next);
        if delta > 0 {
            return;
        }
        let page = stream.page.take().unwrap_or(Page {
            seq: next,
            bytes: Vec::new(),
        });
        *pages_used -= 1;
        let overlap = (-delta) as usize;
        if overlap >= page.bytes.len() {
            return;
        }
        let fresh = &page.bytes[overlap..];
        stream.next_seq = Some(next.wrapping_add(fresh.len() as u32));
        deliver(StreamEvent::Data {
            skip: 0,
            bytes: fresh,
        });
    }

    /// Complete a half-connection: flush any parked page (reporting its
    /// gap), signal completion and drop the state.
    fn finish<F>(
        streams: &mut HashMap<ConnKey, HalfStream>,
        pages_used: &mut usize,
        key: &ConnKey,
        deliver: &mut F,
    ) where
        F: FnMut(StreamEvent<'_>),
    {
        if let Some(mut stream) = streams.remove(key) {
            if let Some(page) = stream.page.take() {
                *pages_used -= 1;
                let gap = stream
                    .next_seq
                    .map(|next| seq_delta(page.seq, next).max(0) as isize)
                    .unwrap_or(-1);
                deliver(StreamEvent::Data {
                    skip: gap,
                    bytes: &page.bytes,
                });
            }
        }
        deliver(StreamEvent::Complete);
    }

    /// Flush half-connections idle longer than [`STREAM_IDLE_SECS`],
    /// judged by packet time rather than wall clock so that replayed
    /// traces behave identically to live captures. Invokes `deliver` with
    /// the connection key for each completed stream.
    pub fn flush_idle<F>(&mut self, mut deliver: F)
    where
        F: FnMut(&ConnKey, StreamEvent<'_>),
    {
        let cutoff = self.latest_ts - Duration::seconds(STREAM_IDLE_SECS);
        let idle: Vec<ConnKey> = self
            .streams
            .iter()
            .filter(|(_, s)| s.last_seen < cutoff)
            .map(|(k, _)| *k)
            .collect();
        for key in idle {
            trace!(conn = %key, "flushing idle half-connection");
            Self::finish(&mut self.streams, &mut self.pages_used, &key, &mut |evt| {
                deliver(&key, evt)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{flow_hash, Endpoint, TcpFlags};

    fn conn() -> ConnKey {
        ConnKey {
            src: Endpoint {
                ip: "10.0.0.1".parse().unwrap(),
                port: 40000,
            },
            dst: Endpoint {
                ip: "10.0.0.2".parse().unwrap(),
                port: 11211,
            },
        }
    }

    fn packet(seq: u32, payload: &[u8], flags: TcpFlags) -> DecodedPacket {
        packet_at(seq, payload, flags, Utc::now())
    }

    fn packet_at(seq: u32, payload: &[u8], flags: TcpFlags, ts: DateTime<Utc>) -> DecodedPacket {
        let conn = conn();
        DecodedPacket {
            ts,
            flow_hash: flow_hash(&conn),
            conn,
            seq,
            flags,
            payload: payload.to_vec(),
        }
    }

    /// Owned mirror of StreamEvent for assertions.
    #[derive(Debug, PartialEq, Eq)]
    enum Evt {
        Data(isize, Vec<u8>),
        Complete,
    }

    fn collect(r: &mut Reassembler, pkt: &DecodedPacket) -> Vec<Evt> {
        let mut out = Vec::new();
        r.assemble(pkt, |evt| {
            out.push(match evt {
                StreamEvent::Data { skip, bytes } => Evt::Data(skip, bytes.to_vec()),
                StreamEvent::Complete => Evt::Complete,
            })
        });
        out
    }

    const DATA: TcpFlags = TcpFlags {
        syn: false,
        fin: false,
        rst: false,
        ack: true,
        psh: true,
    };

    #[test]
    fn test_in_order_delivery() {
        let mut r = Reassembler::new();
        let syn = TcpFlags {
            syn: true,
            ..Default::default()
        };
        assert_eq!(collect(&mut r, &packet(100, b"", syn)), vec![]);
        assert_eq!(
            collect(&mut r, &packet(101, b"hello", DATA)),
            vec![Evt::Data(0, b"hello".to_vec())]
        );
        assert_eq!(
            collect(&mut r, &packet(106, b" world", DATA)),
            vec![Evt::Data(0, b" world".to_vec())]
        );
    }

    #[test]
    fn test_mid_stream_join_reports_unknown_loss() {
        let mut r = Reassembler::new();
        assert_eq!(
            collect(&mut r, &packet(5000, b"data", DATA)),
            vec![Evt::Data(-1, b"data".to_vec())]
        );
        assert_eq!(
            collect(&mut r, &packet(5004, b"more", DATA)),
            vec![Evt::Data(0, b"more".to_vec())]
        );
    }

    #[test]
    fn test_duplicate_segment_ignored() {
        let mut r = Reassembler::new();
        collect(&mut r, &packet(100, b"abcd", DATA));
        assert_eq!(collect(&mut r, &packet(100, b"abcd", DATA)), vec![]);
    }

    #[test]
    fn test_overlap_is_trimmed() {
        let mut r = Reassembler::new();
        collect(&mut r, &packet(100, b"abcd", DATA));
        assert_eq!(
            collect(&mut r, &packet(102, b"cdef", DATA)),
            vec![Evt::Data(0, b"ef".to_vec())]
        );
    }

    #[test]
    fn test_single_reorder_is_healed() {
        let mut r = Reassembler::new();
        collect(&mut r, &packet(100, b"ab", DATA));
        // 104..108 arrives before 102..104
        assert_eq!(collect(&mut r, &packet(104, b"efgh", DATA)), vec![]);
        assert_eq!(
            collect(&mut r, &packet(102, b"cd", DATA)),
            vec![Evt::Data(0, b"cd".to_vec()), Evt::Data(0, b"efgh".to_vec())]
        );
    }

    #[test]
    fn test_second_reorder_flushes_with_gap() {
        let mut r = Reassembler::new();
        collect(&mut r, &packet(100, b"ab", DATA));
        // two out-of-order segments exceed the page budget; the first is
        // flushed with its gap reported, the second follows contiguously
        assert_eq!(collect(&mut r, &packet(104, b"ef", DATA)), vec![]);
        assert_eq!(
            collect(&mut r, &packet(106, b"gh", DATA)),
            vec![Evt::Data(2, b"ef".to_vec()), Evt::Data(0, b"gh".to_vec())]
        );
    }

    #[test]
    fn test_fin_flushes_page_and_completes() {
        let mut r = Reassembler::new();
        collect(&mut r, &packet(100, b"ab", DATA));
        collect(&mut r, &packet(104, b"ef", DATA));
        let fin = TcpFlags {
            fin: true,
            ack: true,
            ..Default::default()
        };
        assert_eq!(
            collect(&mut r, &packet(106, b"", fin)),
            vec![Evt::Data(2, b"ef".to_vec()), Evt::Complete]
        );
        assert_eq!(r.stream_count(), 0);
    }

    #[test]
    fn test_rst_completes_stream() {
        let mut r = Reassembler::new();
        collect(&mut r, &packet(100, b"ab", DATA));
        let rst = TcpFlags {
            rst: true,
            ..Default::default()
        };
        assert_eq!(collect(&mut r, &packet(102, b"", rst)), vec![Evt::Complete]);
        assert_eq!(r.stream_count(), 0);
    }

    #[test]
    fn test_idle_flush_uses_packet_time() {
        let mut r = Reassembler::new();
        let t0 = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        collect(&mut r, &packet_at(100, b"ab", DATA, t0));
        assert_eq!(r.stream_count(), 1);

        // nothing is idle yet
        let mut flushed = Vec::new();
        r.flush_idle(|key, evt| {
            if matches!(evt, StreamEvent::Complete) {
                flushed.push(*key);
            }
        });
        assert!(flushed.is_empty());

        // a much later packet on another connection moves packet time
        // forward past the idle cutoff
        let mut other = packet_at(1, b"zz", DATA, t0 + Duration::seconds(120));
        other.conn.src.port = 40001;
        r.assemble(&other, |_| {});

        r.flush_idle(|key, evt| {
            if matches!(evt, StreamEvent::Complete) {
                flushed.push(*key);
            }
        });
        assert_eq!(flushed, vec![conn()]);
        assert_eq!(r.stream_count(), 1);
    }

    #[test]
    fn test_page_budget_is_worker_wide() {
        let mut r = Reassembler::new();
        collect(&mut r, &packet(100, b"ab", DATA));
        // parked page on this connection consumes the only page
        assert_eq!(collect(&mut r, &packet(104, b"ef", DATA)), vec![]);

        // a reorder on a second connection cannot buffer and is delivered
        // immediately with its gap
        let mut other = packet(200, b"xy", DATA);
        other.conn.src.port = 40002;
        let mut other_first = packet(190, b"qq", DATA);
        other_first.conn.src.port = 40002;
        collect(&mut r, &other_first);
        let mut out = Vec::new();
        r.assemble(&packet_reseq(&other, 200), |evt| {
            if let StreamEvent::Data { skip, bytes } = evt {
                out.push(Evt::Data(skip, bytes.to_vec()));
            }
        });
        assert_eq!(out, vec![Evt::Data(8, b"xy".to_vec())]);
    }

    fn packet_reseq(p: &DecodedPacket, seq: u32) -> DecodedPacket {
        let mut p = p.clone();
        p.seq = seq;
        p
    }
}
