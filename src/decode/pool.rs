//! Decode worker pool
//!
//! The pool operates in pull mode: each worker publishes itself together
//! with its reusable [`PacketBuffer`] on a ready queue, and the pool writes
//! captured packets directly into that buffer before handing it back. When
//! no worker is ready the pool discards the next packet and counts the
//! drop. This is the backpressure valve of the pipeline.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use tracing::{debug, warn};

use super::{DecodedPacket, Decoder};
use crate::capture::{CaptureError, PacketBuffer, PacketSource};
use crate::stats::PipelineStats;

/// Packets per decode batch.
const BATCH_PACKETS: usize = 1000;
/// Bytes of packet data per decode batch.
const BATCH_BYTES: usize = 8 * 1024 * 1024;

const STATS_REFRESH: Duration = Duration::from_millis(500);

/// Receives batches of decoded packets. Invoked concurrently from multiple
/// worker threads.
pub type Handler = Arc<dyn Fn(Vec<DecodedPacket>) + Send + Sync>;

struct Ready {
    id: usize,
    buf: PacketBuffer,
}

/// A pool of decode workers bound to a single [`PacketSource`].
pub struct Pool {
    src: Box<dyn PacketSource>,
    ready_rx: Receiver<Ready>,
    work_txs: Vec<Option<Sender<PacketBuffer>>>,
    stats: Arc<PipelineStats>,
    last_stats_refresh: Instant,
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Create a pool of `num_workers` decode workers delivering decoded
    /// batches to `handler`.
    pub fn new(
        num_workers: usize,
        src: Box<dyn PacketSource>,
        handler: Handler,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let num_workers = num_workers.max(1);
        let (ready_tx, ready_rx) = bounded(num_workers);

        let mut work_txs = Vec::with_capacity(num_workers);
        let mut workers = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let (work_tx, work_rx) = bounded::<PacketBuffer>(1);
            work_txs.push(Some(work_tx));
            let ready_tx = ready_tx.clone();
            let handler = handler.clone();
            workers.push(thread::spawn(move || {
                worker_loop(id, ready_tx, work_rx, handler)
            }));
        }

        Self {
            src,
            ready_rx,
            work_txs,
            stats,
            last_stats_refresh: Instant::now(),
            workers,
        }
    }

    /// Drive the source, filling ready workers' buffers. Returns once the
    /// source reports end of stream (after shutting the workers down) or
    /// fails permanently.
    pub fn run(&mut self) -> Result<(), CaptureError> {
        loop {
            self.maybe_refresh_stats();
            match self.ready_rx.try_recv() {
                Ok(Ready { id, mut buf }) => {
                    let res = loop {
                        match self.src.collect_packets(&mut buf) {
                            Err(CaptureError::TimeoutExpired) => continue,
                            other => break other,
                        }
                    };
                    match res {
                        Ok(()) => {
                            self.stats
                                .packets_captured
                                .fetch_add(buf.packet_len() as u64, Ordering::Relaxed);
                            self.dispatch(id, buf);
                        }
                        Err(CaptureError::Eof) => {
                            debug!("reached end of packet stream, draining decode workers");
                            self.shutdown(id);
                            self.refresh_stats();
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(error = %e, "error collecting packets");
                            buf.clear();
                            self.dispatch(id, buf);
                        }
                    }
                }
                Err(TryRecvError::Empty) => match self.src.discard_packet() {
                    Ok(()) => {
                        self.stats.parser_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(CaptureError::TimeoutExpired) => {}
                    Err(CaptureError::Eof) => {
                        // wait for a worker to become ready so the EOF path
                        // above can run the orderly shutdown
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => warn!(error = %e, "error discarding packet"),
                },
                Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    fn dispatch(&mut self, id: usize, buf: PacketBuffer) {
        if let Some(tx) = &self.work_txs[id] {
            // capacity 1 and the worker just published readiness, so this
            // cannot block
            let _ = tx.send(buf);
        }
    }

    fn shutdown(&mut self, first: usize) {
        self.work_txs[first] = None;
        let remaining = self.work_txs.iter().filter(|tx| tx.is_some()).count();
        for _ in 0..remaining {
            match self.ready_rx.recv() {
                Ok(Ready { id, .. }) => self.work_txs[id] = None,
                Err(_) => break,
            }
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!("decode pool exiting");
    }

    fn maybe_refresh_stats(&mut self) {
        if self.last_stats_refresh.elapsed() >= STATS_REFRESH {
            self.refresh_stats();
        }
    }

    fn refresh_stats(&mut self) {
        let s = self.src.stats();
        self.stats
            .kernel_received
            .store(s.kernel_received, Ordering::Relaxed);
        self.stats.source_received.store(s.received, Ordering::Relaxed);
        self.stats.kernel_dropped.store(s.dropped, Ordering::Relaxed);
        self.last_stats_refresh = Instant::now();
    }
}

fn worker_loop(
    id: usize,
    ready_tx: Sender<Ready>,
    work_rx: Receiver<PacketBuffer>,
    handler: Handler,
) {
    let mut decoder = Decoder::new();
    if ready_tx
        .send(Ready {
            id,
            buf: PacketBuffer::new(BATCH_PACKETS, BATCH_BYTES),
        })
        .is_err()
    {
        return;
    }

    while let Ok(buf) = work_rx.recv() {
        let batch: Vec<DecodedPacket> = buf
            .packets()
            .filter_map(|pd| decoder.decode(&pd.info, pd.data))
            .collect();
        if !batch.is_empty() {
            handler(batch);
        }
        if ready_tx.send(Ready { id, buf }).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureInfo, CaptureStats};
    use crate::decode::tests::make_tcp_packet;
    use crate::decode::TcpFlags;
    use chrono::Utc;
    use parking_lot::Mutex;

    /// Source that yields a fixed set of frames then EOF.
    struct ScriptedSource {
        frames: Vec<Vec<u8>>,
        received: u64,
    }

    impl PacketSource for ScriptedSource {
        fn collect_packets(&mut self, pb: &mut PacketBuffer) -> Result<(), CaptureError> {
            pb.clear();
            if self.frames.is_empty() {
                return Err(CaptureError::Eof);
            }
            for frame in self.frames.drain(..) {
                let info = CaptureInfo {
                    ts: Utc::now(),
                    cap_len: frame.len(),
                    orig_len: frame.len(),
                };
                pb.append(info, &frame).unwrap();
                self.received += 1;
            }
            Ok(())
        }

        fn discard_packet(&mut self) -> Result<(), CaptureError> {
            if self.frames.is_empty() {
                return Err(CaptureError::Eof);
            }
            self.frames.remove(0);
            Ok(())
        }

        fn stats(&mut self) -> CaptureStats {
            CaptureStats {
                kernel_received: self.received,
                received: self.received,
                dropped: 0,
            }
        }
    }

    #[test]
    fn test_pool_decodes_and_drains_on_eof() {
        let frames = vec![
            make_tcp_packet(40000, 11211, 1, TcpFlags::default(), b"get a\r\n"),
            make_tcp_packet(11211, 40000, 1, TcpFlags::default(), b"END\r\n"),
        ];
        let src = ScriptedSource {
            frames,
            received: 0,
        };

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let handler: Handler = Arc::new(move |batch: Vec<DecodedPacket>| {
            seen2.lock().extend(batch);
        });

        let stats = Arc::new(PipelineStats::default());
        let mut pool = Pool::new(2, Box::new(src), handler, stats.clone());
        pool.run().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(stats.snapshot().packets_captured, 2);
        // both directions of the connection share a flow hash
        assert_eq!(seen[0].flow_hash, seen[1].flow_hash);
    }
}
