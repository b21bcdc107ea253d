//! Replay pacing
//!
//! Throttles a file-based [`PacketSource`] according to the timestamp
//! accompanying each packet, recreating the input rate of a previously
//! captured trace. If the downstream pipeline stalls, packets whose
//! timestamp has expired are dropped and counted, mirroring kernel drop
//! behavior on a live capture.

use std::thread;

use chrono::{DateTime, Duration, Utc};
use std::time::Instant;

use super::{CaptureError, CaptureStats, PacketBuffer, PacketSource, READ_TIMEOUT};

const PENDING_PACKETS: usize = 1000;
const PENDING_BYTES: usize = 8 * 1024 * 1024;

/// Pacing slack: one pcap read timeout, matching the batching latency a
/// live capture would exhibit.
fn slack() -> Duration {
    Duration::microseconds(READ_TIMEOUT.as_micros() as i64)
}

/// Timestamp-pacing wrapper around a file-based packet source.
pub struct Replayer<S> {
    inner: S,
    /// Wall time of the first `collect_packets` call.
    start: Option<Instant>,
    /// Timestamp of the first packet returned from the source.
    first: Option<DateTime<Utc>>,
    pending: PacketBuffer,
    cursor: usize,
    received: u64,
    dropped: u64,
}

impl<S: PacketSource> Replayer<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            start: None,
            first: None,
            pending: PacketBuffer::new(PENDING_PACKETS, PENDING_BYTES),
            cursor: 0,
            received: 0,
            dropped: 0,
        }
    }

    fn elapsed(&self) -> Duration {
        match self.start {
            Some(start) => {
                Duration::microseconds(start.elapsed().as_micros().min(i64::MAX as u128) as i64)
            }
            None => Duration::zero(),
        }
    }

    fn fill(&mut self) -> Result<(), CaptureError> {
        self.pending.clear();
        self.cursor = 0;
        self.inner.collect_packets(&mut self.pending)?;
        if self.first.is_none() && self.pending.packet_len() > 0 {
            self.first = Some(self.pending.packet(0).info.ts);
        }
        Ok(())
    }

    /// Drop pending packets whose timestamp is further behind the replay
    /// clock than half a slack interval.
    fn drop_expired(&mut self, elapsed: Duration) {
        let Some(first) = self.first else { return };
        let drop_until = first + elapsed - slack() / 2;
        while self.cursor < self.pending.packet_len()
            && self.pending.packet(self.cursor).info.ts <= drop_until
        {
            self.cursor += 1;
            self.dropped += 1;
        }
    }
}

impl<S: PacketSource> PacketSource for Replayer<S> {
    fn collect_packets(&mut self, pb: &mut PacketBuffer) -> Result<(), CaptureError> {
        if self.start.is_none() {
            self.start = Some(Instant::now());
        }
        let elapsed = self.elapsed();

        self.drop_expired(elapsed);
        while self.cursor >= self.pending.packet_len() {
            self.fill()?;
            self.drop_expired(elapsed);
        }

        // first is set once fill has produced at least one packet
        let Some(first) = self.first else {
            return Err(CaptureError::TimeoutExpired);
        };
        let write_until = first + elapsed + slack();

        pb.clear();
        let mut wrote = 0;
        while self.cursor < self.pending.packet_len() {
            let p = self.pending.packet(self.cursor);
            if p.info.ts > write_until {
                if wrote == 0 {
                    thread::sleep(READ_TIMEOUT);
                    return Err(CaptureError::TimeoutExpired);
                }
                break;
            }
            if pb.append(p.info, p.data).is_err() {
                break;
            }
            self.cursor += 1;
            self.received += 1;
            wrote += 1;
        }
        Ok(())
    }

    fn discard_packet(&mut self) -> Result<(), CaptureError> {
        if self.start.is_none() {
            self.start = Some(Instant::now());
        }
        if self.cursor >= self.pending.packet_len() {
            self.fill()?;
            if self.pending.packet_len() == 0 {
                return Ok(());
            }
        }

        let ts = self.pending.packet(self.cursor).info.ts;
        let Some(first) = self.first else {
            return Ok(());
        };
        if ts - first > self.elapsed() + slack() {
            thread::sleep(READ_TIMEOUT);
            return Err(CaptureError::TimeoutExpired);
        }
        self.cursor += 1;
        self.received += 1;
        Ok(())
    }

    fn stats(&mut self) -> CaptureStats {
        let inner = self.inner.stats();
        CaptureStats {
            kernel_received: inner.kernel_received,
            received: self.received,
            dropped: inner.dropped + self.dropped,
        }
    }
}
