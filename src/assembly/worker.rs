//! Assembly worker
//!
//! Each worker owns a TCP reassembler and the consumers for the
//! connections hashed to it. All packets of a connection are handled by
//! one worker, so consumers are single-threaded: the protocol state
//! machine runs inline on the reassembly callback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use crossbeam_channel::{select, tick, Receiver, Sender};
use tracing::{debug, trace};

use super::reassembly::{Reassembler, StreamEvent};
use super::reader::Reader;
use crate::decode::{ConnKey, DecodedPacket};
use crate::protocol::{Consumer, EventSink, ProtocolKind};

/// How long a consumer may sit without traffic before it is torn down.
/// This reclaims connections for which only one direction is ever
/// observed (asymmetric routing); normally-closing connections are
/// completed by the 60 s stream idle flush well before this.
const CONSUMER_IDLE_SECS: i64 = 300;

/// Bound on the per-worker pool of recycled readers.
const READER_POOL_CAP: usize = 128;

pub(super) enum WorkItem {
    Packets(Vec<DecodedPacket>),
    /// Flush all consumers' buffered events and acknowledge.
    Drain(Sender<()>),
}

struct Entry {
    consumer: Consumer,
    last_seen: DateTime<Utc>,
}

pub(super) struct Worker {
    rx: Receiver<WorkItem>,
    reassembler: Reassembler,
    /// Consumers keyed by canonical connection key (server endpoint in
    /// destination position).
    consumers: HashMap<ConnKey, Entry>,
    reader_pool: Vec<Reader>,
    server_ports: Arc<Vec<u16>>,
    protocol: ProtocolKind,
    sink: Arc<dyn EventSink>,
}

impl Worker {
    pub(super) fn new(
        rx: Receiver<WorkItem>,
        server_ports: Arc<Vec<u16>>,
        protocol: ProtocolKind,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            rx,
            reassembler: Reassembler::new(),
            consumers: HashMap::new(),
            reader_pool: Vec::new(),
            server_ports,
            protocol,
            sink,
        }
    }

    pub(super) fn run(mut self) {
        let ticker = tick(StdDuration::from_secs(1));
        let rx = self.rx.clone();
        loop {
            select! {
                recv(rx) -> msg => match msg {
                    Ok(WorkItem::Packets(batch)) => {
                        for pkt in &batch {
                            self.handle_packet(pkt);
                        }
                    }
                    Ok(WorkItem::Drain(ack)) => {
                        for entry in self.consumers.values_mut() {
                            entry.consumer.flush_events();
                        }
                        let _ = ack.send(());
                    }
                    Err(_) => {
                        self.teardown_all();
                        return;
                    }
                },
                recv(ticker) -> _ => self.flush(),
            }
        }
    }

    /// A packet is "from the server" when its source port is one of the
    /// configured server ports; its connection key is reversed to the
    /// canonical form before lookup.
    fn direction(&self, conn: &ConnKey) -> (bool, ConnKey) {
        let from_server = self.server_ports.contains(&conn.src.port);
        let canonical = if from_server { conn.reverse() } else { *conn };
        (from_server, canonical)
    }

    fn handle_packet(&mut self, pkt: &DecodedPacket) {
        let (from_server, canonical) = self.direction(&pkt.conn);

        if !self.consumers.contains_key(&canonical) {
            let client = self.take_reader();
            let server = self.take_reader();
            trace!(conn = %canonical, "new conversation");
            self.consumers.insert(
                canonical,
                Entry {
                    consumer: Consumer::new(
                        client,
                        server,
                        self.protocol.new_fsm(),
                        self.sink.clone(),
                    ),
                    last_seen: pkt.ts,
                },
            );
        }
        let Some(entry) = self.consumers.get_mut(&canonical) else {
            return;
        };
        entry.last_seen = pkt.ts;

        let mut wrote = false;
        let mut completed = false;
        self.reassembler.assemble(pkt, |evt| match evt {
            StreamEvent::Data { skip, bytes } => {
                wrote = true;
                if from_server {
                    entry.consumer.write_server(skip, bytes);
                } else {
                    entry.consumer.write_client(skip, bytes);
                }
            }
            StreamEvent::Complete => {
                completed = true;
                entry.consumer.stream_complete(from_server);
            }
        });

        if wrote || completed {
            entry.consumer.run();
        }
        if completed || entry.consumer.is_done() {
            self.close_consumer(&canonical);
        }
    }

    /// Once-per-second maintenance: complete idle streams and reclaim
    /// long-dead consumers.
    fn flush(&mut self) {
        let mut completed = Vec::new();
        {
            let consumers = &mut self.consumers;
            let ports = &self.server_ports;
            self.reassembler.flush_idle(|key, evt| {
                let from_server = ports.contains(&key.src.port);
                let canonical = if from_server { key.reverse() } else { *key };
                let Some(entry) = consumers.get_mut(&canonical) else {
                    return;
                };
                match evt {
                    StreamEvent::Data { skip, bytes } => {
                        if from_server {
                            entry.consumer.write_server(skip, bytes);
                        } else {
                            entry.consumer.write_client(skip, bytes);
                        }
                    }
                    StreamEvent::Complete => {
                        entry.consumer.stream_complete(from_server);
                        completed.push(canonical);
                    }
                }
            });
        }
        let flushed = completed.len();
        for key in completed {
            if let Some(entry) = self.consumers.get_mut(&key) {
                entry.consumer.run();
            }
            self.close_consumer(&key);
        }

        let latest = self.reassembler.latest_ts();
        if latest > DateTime::<Utc>::MIN_UTC {
            let cutoff = latest - Duration::seconds(CONSUMER_IDLE_SECS);
            let stale: Vec<ConnKey> = self
                .consumers
                .iter()
                .filter(|(_, e)| e.last_seen < cutoff)
                .map(|(k, _)| *k)
                .collect();
            if flushed > 0 || !stale.is_empty() {
                debug!(flushed, reclaimed = stale.len(), "assembly maintenance");
            }
            for key in stale {
                self.close_consumer(&key);
            }
        }
    }

    fn take_reader(&mut self) -> Reader {
        self.reader_pool.pop().unwrap_or_default()
    }

    fn close_consumer(&mut self, key: &ConnKey) {
        let Some(entry) = self.consumers.remove(key) else {
            return;
        };
        let (mut client, mut server) = entry.consumer.into_readers();
        if self.reader_pool.len() + 2 <= READER_POOL_CAP {
            client.reset();
            server.reset();
            self.reader_pool.push(client);
            self.reader_pool.push(server);
        }
    }

    fn teardown_all(&mut self) {
        let keys: Vec<ConnKey> = self.consumers.keys().copied().collect();
        for key in keys {
            self.close_consumer(&key);
        }
    }
}
