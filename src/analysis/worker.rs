//! Analysis shard
//!
//! A single-threaded event loop accumulating usage data for the cache
//! keys hashed to it. The loop reacts to one of three signals: a batch of
//! events, a request for the current summary, or a reset request.

use std::collections::HashMap;

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};

use super::aggregate::{KeyAggregator, KeyAggregatorFactory};
use crate::protocol::Event;

/// Event batches buffered per shard before drops begin.
const SHARD_QUEUE_DEPTH: usize = 1024;

/// One shard's grouped results: composite key values plus aggregate
/// results per tracked key.
pub(super) type ShardSnapshot = Vec<(Vec<String>, Vec<i64>)>;

/// Threadsafe handle to one shard.
pub(super) struct ShardHandle {
    event_tx: Sender<Vec<Event>>,
    report_tx: Sender<Sender<ShardSnapshot>>,
    reset_tx: Sender<()>,
}

impl ShardHandle {
    /// Enqueue events without blocking. On a full queue the batch is
    /// returned so the caller can account for the drop.
    pub(super) fn handle_events(&self, evts: Vec<Event>) -> Result<(), Vec<Event>> {
        match self.event_tx.try_send(evts) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(evts)) | Err(TrySendError::Disconnected(evts)) => Err(evts),
        }
    }

    /// Request a summary of the shard's current state.
    pub(super) fn snapshot(&self) -> ShardSnapshot {
        let (reply_tx, reply_rx) = bounded(1);
        if self.report_tx.send(reply_tx).is_err() {
            return ShardSnapshot::default();
        }
        reply_rx.recv().unwrap_or_default()
    }

    /// Ask the shard to clear all tracked keys.
    pub(super) fn reset(&self) {
        let _ = self.reset_tx.send(());
    }
}

/// Spawn a shard worker; returns its handle. The worker exits when the
/// handle is dropped.
pub(super) fn spawn_shard(factory: KeyAggregatorFactory) -> ShardHandle {
    let (event_tx, event_rx) = bounded(SHARD_QUEUE_DEPTH);
    let (report_tx, report_rx) = bounded::<Sender<ShardSnapshot>>(0);
    let (reset_tx, reset_rx) = bounded(0);
    std::thread::spawn(move || {
        Shard {
            factory,
            aggregators: HashMap::new(),
            free: Vec::new(),
        }
        .run(event_rx, report_rx, reset_rx)
    });
    ShardHandle {
        event_tx,
        report_tx,
        reset_tx,
    }
}

struct Shard {
    factory: KeyAggregatorFactory,
    /// One aggregator per flattened key.
    aggregators: HashMap<String, KeyAggregator>,
    /// Reset aggregators awaiting reuse.
    free: Vec<KeyAggregator>,
}

impl Shard {
    fn run(
        mut self,
        event_rx: Receiver<Vec<Event>>,
        report_rx: Receiver<Sender<ShardSnapshot>>,
        reset_rx: Receiver<()>,
    ) {
        loop {
            select! {
                recv(event_rx) -> msg => match msg {
                    Ok(evts) => {
                        for evt in evts {
                            self.handle_event(evt);
                        }
                    }
                    Err(_) => return,
                },
                recv(report_rx) -> msg => match msg {
                    Ok(reply) => {
                        // account for everything enqueued before the request
                        self.drain_pending(&event_rx);
                        let _ = reply.send(self.assemble_results());
                    }
                    Err(_) => return,
                },
                recv(reset_rx) -> msg => match msg {
                    Ok(()) => {
                        self.drain_pending(&event_rx);
                        self.reset_aggregators();
                    }
                    Err(_) => return,
                },
            }
        }
    }

    fn drain_pending(&mut self, event_rx: &Receiver<Vec<Event>>) {
        while let Ok(evts) = event_rx.try_recv() {
            for evt in evts {
                self.handle_event(evt);
            }
        }
    }

    fn handle_event(&mut self, evt: Event) {
        let flat = self.factory.flat_key(&evt);
        let ka = match self.aggregators.entry(flat) {
            std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => {
                let mut ka = self
                    .free
                    .pop()
                    .unwrap_or_else(|| self.factory.new_aggregator());
                ka.key = self.factory.key(&evt);
                v.insert(ka)
            }
        };
        ka.add(&evt);
    }

    fn reset_aggregators(&mut self) {
        for (_, mut ka) in self.aggregators.drain() {
            ka.reset();
            self.free.push(ka);
        }
    }

    fn assemble_results(&self) -> ShardSnapshot {
        self.aggregators
            .values()
            .map(|ka| (ka.key.clone(), ka.result()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventKind;

    fn event(key: &str, size: usize) -> Event {
        Event {
            kind: EventKind::GetHit,
            key: key.to_string(),
            size,
        }
    }

    #[test]
    fn test_shard_accumulates_and_snapshots() {
        let factory = KeyAggregatorFactory::parse("key,cnt(size),sum(size)").unwrap();
        let shard = spawn_shard(factory);
        shard
            .handle_events(vec![event("a", 5), event("a", 7), event("b", 1)])
            .unwrap();

        let mut snap = shard.snapshot();
        snap.sort();
        assert_eq!(
            snap,
            vec![
                (vec!["a".to_string()], vec![2, 12]),
                (vec!["b".to_string()], vec![1, 1]),
            ]
        );
    }

    #[test]
    fn test_shard_reset_clears_state() {
        let factory = KeyAggregatorFactory::parse("key,cnt(size)").unwrap();
        let shard = spawn_shard(factory);
        shard.handle_events(vec![event("a", 5)]).unwrap();
        shard.reset();
        assert!(shard.snapshot().is_empty());

        // aggregators recycled from the pool start clean
        shard.handle_events(vec![event("c", 9)]).unwrap();
        assert_eq!(shard.snapshot(), vec![(vec!["c".to_string()], vec![1])]);
    }
}
