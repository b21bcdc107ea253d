//! Packet capture
//!
//! Reads packets from a live network interface or a pcap file into
//! [`PacketBuffer`] batches. File sources are wrapped in a [`Replayer`]
//! that throttles delivery to the original capture timestamps unless
//! `--nodelay` is given.

mod buffer;
mod replay;

pub use buffer::{BufferError, CaptureInfo, PacketBuffer, PacketData};
pub use replay::Replayer;

use std::time::Duration;

use chrono::{DateTime, Utc};
use pcap::{Activated, Capture};
use thiserror::Error;
use tracing::debug;

const SNAP_LEN: i32 = 65535;

/// The pcap read timeout, and the pacing slack of the replayer.
pub const READ_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("must specify a network interface or file")]
    NoSource,
    #[error("cannot specify both network interface and file")]
    AmbiguousSource,
    #[error("need at least one port")]
    NoPorts,
    /// The read timeout elapsed with no packets available. Benign.
    #[error("capture read timeout expired")]
    TimeoutExpired,
    /// The underlying source is exhausted.
    #[error("end of packet stream")]
    Eof,
    #[error(transparent)]
    Pcap(#[from] pcap::Error),
}

/// Capture statistics compatible with those from a pcap handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Packets seen by the kernel filter.
    pub kernel_received: u64,
    /// Packets delivered to the process.
    pub received: u64,
    /// Packets dropped by the kernel buffer or the replay pacer.
    pub dropped: u64,
}

/// An abstract source of network packets.
pub trait PacketSource: Send {
    /// Fill `pb` with packets. Returns early with success once the buffer's
    /// packet or byte capacity is reached, or once the read timeout elapses
    /// with at least one packet buffered.
    fn collect_packets(&mut self, pb: &mut PacketBuffer) -> Result<(), CaptureError>;

    /// Read a single packet and discard its contents.
    fn discard_packet(&mut self) -> Result<(), CaptureError>;

    /// Runtime statistics for this source.
    fn stats(&mut self) -> CaptureStats;
}

/// Create a [`PacketSource`] bound to the given network interface or pcap
/// file (`"-"` means stdin).
///
/// `buffer_size` is the amount of kernel memory in MiB to allocate for
/// temporary packet storage on live captures. File sources are paced to
/// their original timestamps unless `no_delay` is set.
pub fn new_source(
    interface: Option<&str>,
    infile: Option<&str>,
    buffer_size: usize,
    no_delay: bool,
    ports: &[u16],
) -> Result<Box<dyn PacketSource>, CaptureError> {
    let bpf = port_filter(ports)?;
    match (interface, infile) {
        (Some(_), Some(_)) => Err(CaptureError::AmbiguousSource),
        (None, None) => Err(CaptureError::NoSource),
        (Some(iface), None) => {
            let mut handle = Capture::from_device(iface)?
                .snaplen(SNAP_LEN)
                .promisc(true)
                .timeout(READ_TIMEOUT.as_millis() as i32)
                .buffer_size((buffer_size * 1024 * 1024) as i32)
                .open()?;
            handle.filter(&bpf, true)?;
            debug!(interface = iface, filter = %bpf, "opened live capture");
            Ok(Box::new(Source::new(handle.into(), true)))
        }
        (None, Some(path)) => {
            let mut handle = open_file(path)?;
            handle.filter(&bpf, true)?;
            debug!(file = path, filter = %bpf, "opened offline capture");
            let src = Source::new(handle.into(), false);
            if no_delay {
                Ok(Box::new(src))
            } else {
                Ok(Box::new(Replayer::new(src)))
            }
        }
    }
}

fn open_file(path: &str) -> Result<Capture<pcap::Offline>, pcap::Error> {
    if path == "-" {
        #[cfg(unix)]
        {
            return unsafe { Capture::from_raw_fd(0) };
        }
        #[cfg(not(unix))]
        return Err(pcap::Error::PcapError("stdin capture requires unix".into()));
    }
    Capture::from_file(path)
}

/// Build the kernel BPF expression for a set of server ports.
fn port_filter(ports: &[u16]) -> Result<String, CaptureError> {
    if ports.is_empty() {
        return Err(CaptureError::NoPorts);
    }
    let terms: Vec<String> = ports.iter().map(|p| format!("tcp src port {p}")).collect();
    Ok(terms.join(" or "))
}

pub(crate) fn packet_timestamp(header: &pcap::PacketHeader) -> DateTime<Utc> {
    let secs = header.ts.tv_sec as i64;
    let nanos = (header.ts.tv_usec as u32).saturating_mul(1000);
    DateTime::from_timestamp(secs, nanos).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// pcap-backed packet source.
pub struct Source {
    handle: Capture<dyn Activated>,
    live: bool,
    received: u64,
}

impl Source {
    fn new(handle: Capture<dyn Activated>, live: bool) -> Self {
        Self {
            handle,
            live,
            received: 0,
        }
    }
}

impl PacketSource for Source {
    fn collect_packets(&mut self, pb: &mut PacketBuffer) -> Result<(), CaptureError> {
        pb.clear();
        for i in 0..pb.packet_cap() {
            match self.handle.next_packet() {
                Ok(packet) => {
                    let info = CaptureInfo {
                        ts: packet_timestamp(packet.header),
                        cap_len: packet.header.caplen as usize,
                        orig_len: packet.header.len as usize,
                    };
                    // append copies the data, which is required because the
                    // pcap read buffer is reused on the next call
                    match pb.append(info, packet.data) {
                        Ok(()) => self.received += 1,
                        Err(BufferError::BytesFull) | Err(BufferError::PacketsFull) => {
                            return Ok(())
                        }
                    }
                }
                Err(pcap::Error::TimeoutExpired) if i > 0 => return Ok(()),
                Err(pcap::Error::TimeoutExpired) => return Err(CaptureError::TimeoutExpired),
                Err(pcap::Error::NoMorePackets) if i > 0 => return Ok(()),
                Err(pcap::Error::NoMorePackets) => return Err(CaptureError::Eof),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn discard_packet(&mut self) -> Result<(), CaptureError> {
        match self.handle.next_packet() {
            Ok(_) => Ok(()),
            Err(pcap::Error::TimeoutExpired) => Err(CaptureError::TimeoutExpired),
            Err(pcap::Error::NoMorePackets) => Err(CaptureError::Eof),
            Err(e) => Err(e.into()),
        }
    }

    fn stats(&mut self) -> CaptureStats {
        if self.live {
            match self.handle.stats() {
                Ok(s) => CaptureStats {
                    kernel_received: s.received as u64,
                    received: self.received,
                    dropped: (s.dropped + s.if_dropped) as u64,
                },
                Err(_) => CaptureStats {
                    received: self.received,
                    ..Default::default()
                },
            }
        } else {
            CaptureStats {
                kernel_received: self.received,
                received: self.received,
                dropped: 0,
            }
        }
    }
}
