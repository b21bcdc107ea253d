//! Compact packet storage
//!
//! `PacketBuffer` stores a batch of packets in a single preallocated byte
//! arena with an offsets table. Appends fail rather than grow, which gives
//! every pipeline worker a hard memory ceiling.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Capture metadata for a single packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureInfo {
    /// When the packet was captured.
    pub ts: DateTime<Utc>,
    /// Number of bytes actually captured.
    pub cap_len: usize,
    /// Original length of the packet on the wire.
    pub orig_len: usize,
}

/// A single packet's data plus capture metadata.
///
/// The data slice points into a `PacketBuffer` arena and is valid until the
/// next call to [`PacketBuffer::clear`].
#[derive(Debug, Clone, Copy)]
pub struct PacketData<'a> {
    pub info: CaptureInfo,
    pub data: &'a [u8],
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// The buffer cannot hold enough data bytes to store this packet.
    #[error("packet buffer out of space for more bytes")]
    BytesFull,
    /// The buffer cannot hold more packets.
    #[error("packet buffer out of space for more packets")]
    PacketsFull,
}

/// Fixed-capacity packet batch.
///
/// `offsets[i]` is the end of packet `i` in `data`; packet `i` spans
/// `data[offsets[i-1]..offsets[i]]` (0 for `i == 0`).
#[derive(Debug)]
pub struct PacketBuffer {
    num_packets: usize,
    infos: Vec<CaptureInfo>,
    offsets: Vec<usize>,
    data: Box<[u8]>,
}

impl PacketBuffer {
    /// Create a `PacketBuffer` holding at most `max_packets` packets and
    /// `max_bytes` bytes of packet data.
    pub fn new(max_packets: usize, max_bytes: usize) -> Self {
        let zero = CaptureInfo {
            ts: DateTime::<Utc>::MIN_UTC,
            cap_len: 0,
            orig_len: 0,
        };
        Self {
            num_packets: 0,
            infos: vec![zero; max_packets],
            offsets: vec![0; max_packets],
            data: vec![0u8; max_bytes].into_boxed_slice(),
        }
    }

    fn bytes_stored(&self) -> usize {
        if self.num_packets == 0 {
            0
        } else {
            self.offsets[self.num_packets - 1]
        }
    }

    /// Number of additional data bytes this buffer can hold.
    pub fn bytes_remaining(&self) -> usize {
        self.data.len() - self.bytes_stored()
    }

    /// Add a packet, copying `data` into the arena.
    pub fn append(&mut self, info: CaptureInfo, data: &[u8]) -> Result<(), BufferError> {
        if self.num_packets >= self.offsets.len() {
            return Err(BufferError::PacketsFull);
        }
        let start = self.bytes_stored();
        if start + data.len() > self.data.len() {
            return Err(BufferError::BytesFull);
        }

        self.infos[self.num_packets] = info;
        self.offsets[self.num_packets] = start + data.len();
        self.data[start..start + data.len()].copy_from_slice(data);
        self.num_packets += 1;
        Ok(())
    }

    /// Packet capacity of this buffer.
    pub fn packet_cap(&self) -> usize {
        self.offsets.len()
    }

    /// Number of packets currently stored.
    pub fn packet_len(&self) -> usize {
        self.num_packets
    }

    /// The packet at index `n`, which must be less than `packet_len`.
    pub fn packet(&self, n: usize) -> PacketData<'_> {
        let start = if n > 0 { self.offsets[n - 1] } else { 0 };
        let end = self.offsets[n];
        PacketData {
            info: self.infos[n],
            data: &self.data[start..end],
        }
    }

    /// Iterate over all stored packets.
    pub fn packets(&self) -> impl Iterator<Item = PacketData<'_>> {
        (0..self.num_packets).map(move |n| self.packet(n))
    }

    /// Remove all packets.
    pub fn clear(&mut self) {
        self.num_packets = 0;
        if !self.offsets.is_empty() {
            self.offsets[0] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(cap_len: usize) -> CaptureInfo {
        CaptureInfo {
            ts: Utc::now(),
            cap_len,
            orig_len: cap_len,
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let mut pb = PacketBuffer::new(4, 64);
        pb.append(info(3), b"abc").unwrap();
        pb.append(info(5), b"defgh").unwrap();

        assert_eq!(pb.packet_len(), 2);
        assert_eq!(pb.packet(0).data, b"abc");
        assert_eq!(pb.packet(1).data, b"defgh");
        assert_eq!(pb.bytes_remaining(), 64 - 8);
    }

    #[test]
    fn test_packets_full() {
        let mut pb = PacketBuffer::new(1, 64);
        pb.append(info(1), b"a").unwrap();
        assert_eq!(pb.append(info(1), b"b"), Err(BufferError::PacketsFull));
    }

    #[test]
    fn test_bytes_full_leaves_buffer_unchanged() {
        let mut pb = PacketBuffer::new(4, 4);
        pb.append(info(3), b"abc").unwrap();
        assert_eq!(pb.append(info(2), b"de"), Err(BufferError::BytesFull));
        assert_eq!(pb.packet_len(), 1);
        assert_eq!(pb.packet(0).data, b"abc");
    }

    #[test]
    fn test_clear_resets_cursors() {
        let mut pb = PacketBuffer::new(2, 8);
        pb.append(info(4), b"abcd").unwrap();
        pb.append(info(4), b"efgh").unwrap();
        pb.clear();
        assert_eq!(pb.packet_len(), 0);
        assert_eq!(pb.bytes_remaining(), 8);
        pb.append(info(2), b"xy").unwrap();
        assert_eq!(pb.packet(0).data, b"xy");
    }
}
