//! TCP assembly
//!
//! Partitions decoded packets by connection hash onto a pool of workers,
//! each of which reassembles its connections' byte streams and feeds them
//! to the protocol state machines. Dispatch is push-with-drop: a worker
//! whose queue is full loses the batch, and the drop is counted.

pub mod reader;
pub mod reassembly;
mod worker;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender, TrySendError};
use tracing::debug;

use crate::decode::DecodedPacket;
use crate::protocol::{EventSink, ProtocolKind};
use crate::stats::PipelineStats;
use worker::{WorkItem, Worker};

/// Work-queue depth per assembly worker, in packet batches.
const WORKER_QUEUE_DEPTH: usize = 128;

/// A pool of workers each responsible for a set of TCP conversations.
pub struct Pool {
    txs: Vec<Sender<WorkItem>>,
    stats: Arc<PipelineStats>,
    handles: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Create `num_workers` assembly workers. `server_ports` decides
    /// packet direction; `protocol` picks the state machine installed on
    /// new connections; events flow to `sink`.
    pub fn new(
        num_workers: usize,
        server_ports: Vec<u16>,
        protocol: ProtocolKind,
        sink: Arc<dyn EventSink>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let num_workers = num_workers.max(1);
        let server_ports = Arc::new(server_ports);
        let mut txs = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (tx, rx) = bounded(WORKER_QUEUE_DEPTH);
            txs.push(tx);
            let worker = Worker::new(rx, server_ports.clone(), protocol, sink.clone());
            handles.push(thread::spawn(move || worker.run()));
        }
        Self {
            txs,
            stats,
            handles,
        }
    }

    /// Partition packets by connection and dispatch them to workers.
    /// Threadsafe; called concurrently from the decode workers.
    pub fn handle_packets(&self, packets: Vec<DecodedPacket>) {
        let n = self.txs.len();
        let mut buckets: Vec<Vec<DecodedPacket>> = (0..n).map(|_| Vec::new()).collect();
        for pkt in packets {
            let slot = (pkt.flow_hash % n as u64) as usize;
            buckets[slot].push(pkt);
        }
        for (i, bucket) in buckets.into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            if let Err(TrySendError::Full(WorkItem::Packets(dropped))) =
                self.txs[i].try_send(WorkItem::Packets(bucket))
            {
                self.stats
                    .parser_dropped
                    .fetch_add(dropped.len() as u64, Ordering::Relaxed);
            }
        }
    }

    /// Ask every worker to flush its consumers' buffered events, blocking
    /// until all have acknowledged. Used before emitting a final report.
    pub fn drain(&self) {
        let mut acks = Vec::with_capacity(self.txs.len());
        for tx in &self.txs {
            let (ack_tx, ack_rx) = bounded(1);
            if tx.send(WorkItem::Drain(ack_tx)).is_ok() {
                acks.push(ack_rx);
            }
        }
        for ack in acks {
            let _ = ack.recv();
        }
    }

    /// Close the work queues and wait for the workers to tear down their
    /// conversations.
    pub fn shutdown(mut self) {
        self.txs.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        debug!("assembly pool exited");
    }
}
