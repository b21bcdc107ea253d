//! Analysis
//!
//! Accumulates protocol events into grouped summary statistics. Events
//! are sharded by key hash onto single-threaded workers; the pool
//! prioritizes responsiveness over consistency and drops input when a
//! shard cannot keep up.

pub mod aggregate;
pub mod filter;
pub mod report;
mod worker;

pub use aggregate::{DescriptorError, KeyAggregatorFactory};
pub use report::{Report, ReportRow};

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;

use crate::protocol::{Event, EventSink};
use crate::stats::PipelineStats;
use filter::KeyFilter;
use worker::{spawn_shard, ShardHandle};

/// Tracks datastore activity by hashing events to a fixed set of shard
/// workers.
pub struct Pool {
    shards: Vec<ShardHandle>,
    filter: KeyFilter,
    factory: KeyAggregatorFactory,
    stats: Arc<PipelineStats>,
}

impl Pool {
    /// Create a pool of `num_workers` shards aggregating according to
    /// `descriptor`.
    pub fn new(
        num_workers: usize,
        descriptor: &str,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, DescriptorError> {
        let factory = KeyAggregatorFactory::parse(descriptor)?;
        let shards = (0..num_workers.max(1))
            .map(|_| spawn_shard(factory.clone()))
            .collect();
        Ok(Self {
            shards,
            filter: KeyFilter::new(),
            factory,
            stats,
        })
    }

    /// Set an RE2-style pattern restricting which keys are tracked.
    /// Existing results are invalidated by a pattern change, so all shard
    /// state is cleared.
    pub fn set_filter_pattern(&self, pattern: &str) -> Result<(), regex::Error> {
        self.filter.set_pattern(pattern)?;
        self.reset();
        Ok(())
    }

    /// Record a batch of events. Surviving events are partitioned to
    /// their shards; a full shard queue drops that shard's share.
    /// Threadsafe.
    pub fn handle_events(&self, evts: Vec<Event>) {
        let evts = self.filter.filter_events(evts);
        let n = self.shards.len();
        let mut buckets: Vec<Vec<Event>> = (0..n).map(|_| Vec::new()).collect();
        for evt in evts {
            let slot = (fnv1a(evt.key.as_bytes()) % n as u64) as usize;
            buckets[slot].push(evt);
        }
        for (i, bucket) in buckets.into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let len = bucket.len() as u64;
            match self.shards[i].handle_events(bucket) {
                Ok(()) => {
                    self.stats.responses_parsed.fetch_add(len, Ordering::Relaxed);
                }
                Err(_dropped) => {
                    self.stats.analysis_dropped.fetch_add(len, Ordering::Relaxed);
                }
            }
        }
    }

    /// Snapshot all shards' current state. The result is copied, not a
    /// consistent cut: shards keep accumulating while the report is
    /// collected. With `reset`, each shard clears itself after reporting.
    pub fn report(&self, reset: bool) -> Report {
        let mut rows = Vec::new();
        for shard in &self.shards {
            for (key, values) in shard.snapshot() {
                rows.push(ReportRow { key, values });
            }
            if reset {
                shard.reset();
            }
        }
        Report {
            timestamp: Utc::now(),
            key_col_names: self.factory.key_names.clone(),
            val_col_names: self.factory.agg_names.clone(),
            rows,
        }
    }

    /// Clear all recorded activity.
    pub fn reset(&self) {
        for shard in &self.shards {
            shard.reset();
        }
    }
}

impl EventSink for Pool {
    fn handle_events(&self, evts: Vec<Event>) {
        Pool::handle_events(self, evts)
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x100_0000_01b3;

/// 64-bit FNV-1a, the shard partition hash.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
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

    fn new_pool(workers: usize, desc: &str) -> (Pool, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::default());
        let pool = Pool::new(workers, desc, stats.clone()).unwrap();
        (pool, stats)
    }

    #[test]
    fn test_bad_descriptor_is_rejected() {
        let stats = Arc::new(PipelineStats::default());
        assert!(Pool::new(4, "key,frob(size)", stats).is_err());
    }

    #[test]
    fn test_events_grouped_across_shards() {
        let (pool, stats) = new_pool(4, "key,max(size),sum(size)");
        pool.handle_events(vec![
            event("key1", 10),
            event("key2", 5),
            event("key1", 60),
        ]);

        let mut rep = pool.report(false);
        rep.sort_by(-2);
        assert_eq!(rep.key_col_names, vec!["key"]);
        assert_eq!(rep.val_col_names, vec!["max(size)", "sum(size)"]);
        assert_eq!(rep.rows.len(), 2);
        assert_eq!(rep.rows[0].key, vec!["key1"]);
        assert_eq!(rep.rows[0].values, vec![60, 70]);
        assert_eq!(stats.snapshot().responses_parsed, 3);
    }

    #[test]
    fn test_report_with_reset_clears_state() {
        let (pool, _stats) = new_pool(2, "key,cnt(size)");
        pool.handle_events(vec![event("a", 1)]);
        let rep = pool.report(true);
        assert_eq!(rep.rows.len(), 1);
        let rep = pool.report(false);
        assert!(rep.rows.is_empty());
    }

    #[test]
    fn test_filter_applies_and_resets() {
        let (pool, stats) = new_pool(2, "key,cnt(size)");
        pool.handle_events(vec![event("user:1", 1)]);
        pool.set_filter_pattern("^user:").unwrap();
        // the pattern change reset existing state
        assert!(pool.report(false).rows.is_empty());

        pool.handle_events(vec![event("user:2", 1), event("sess:9", 1)]);
        let rep = pool.report(false);
        assert_eq!(rep.rows.len(), 1);
        assert_eq!(rep.rows[0].key, vec!["user:2"]);
        // filtered-out events count as neither handled nor dropped
        assert_eq!(stats.snapshot().responses_parsed, 2);
        assert_eq!(stats.snapshot().packets_dropped_analysis, 0);
    }

    #[test]
    fn test_conservation_handled_plus_dropped() {
        let (pool, stats) = new_pool(3, "key,cnt(size)");
        let sent = 500;
        for i in 0..sent {
            pool.handle_events(vec![event(&format!("k{i}"), 1)]);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.responses_parsed + snap.packets_dropped_analysis, sent);
    }

    #[test]
    fn test_same_key_same_shard() {
        // identical keys must always group into a single row
        let (pool, _stats) = new_pool(8, "key,cnt(size)");
        for _ in 0..50 {
            pool.handle_events(vec![event("hot", 1)]);
        }
        let rep = pool.report(false);
        assert_eq!(rep.rows.len(), 1);
        assert_eq!(rep.rows[0].values, vec![50]);
    }
}
