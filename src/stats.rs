//! Pipeline runtime counters
//!
//! One shared set of atomic counters updated by the pipeline stages and
//! sampled by the presentation layer. Counters are cumulative; the
//! presentation layer derives incremental views by diffing snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Packets seen by the kernel capture filter.
    pub kernel_received: AtomicU64,
    /// Packets that passed the filter and were delivered to the process.
    pub source_received: AtomicU64,
    /// Packets collected into decode buffers.
    pub packets_captured: AtomicU64,
    /// Packets dropped by the kernel buffer (or the replay pacer).
    pub kernel_dropped: AtomicU64,
    /// Packets discarded because no decode worker was ready, plus packets
    /// dropped on a full assembly queue.
    pub parser_dropped: AtomicU64,
    /// Events dropped on a full analysis queue.
    pub analysis_dropped: AtomicU64,
    /// Events recorded by the analysis pool.
    pub responses_parsed: AtomicU64,
}

/// Plain-value snapshot of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_entered_filter: u64,
    pub packets_passed_filter: u64,
    pub packets_captured: u64,
    pub packets_dropped_kernel: u64,
    pub packets_dropped_parser: u64,
    pub packets_dropped_analysis: u64,
    pub responses_parsed: u64,
}

impl StatsSnapshot {
    pub fn packets_dropped_total(&self) -> u64 {
        self.packets_dropped_kernel + self.packets_dropped_parser + self.packets_dropped_analysis
    }

    /// Counter-wise difference from an earlier snapshot.
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            packets_entered_filter: self
                .packets_entered_filter
                .saturating_sub(earlier.packets_entered_filter),
            packets_passed_filter: self
                .packets_passed_filter
                .saturating_sub(earlier.packets_passed_filter),
            packets_captured: self.packets_captured.saturating_sub(earlier.packets_captured),
            packets_dropped_kernel: self
                .packets_dropped_kernel
                .saturating_sub(earlier.packets_dropped_kernel),
            packets_dropped_parser: self
                .packets_dropped_parser
                .saturating_sub(earlier.packets_dropped_parser),
            packets_dropped_analysis: self
                .packets_dropped_analysis
                .saturating_sub(earlier.packets_dropped_analysis),
            responses_parsed: self.responses_parsed.saturating_sub(earlier.responses_parsed),
        }
    }
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_entered_filter: self.kernel_received.load(Ordering::Relaxed),
            packets_passed_filter: self.source_received.load(Ordering::Relaxed),
            packets_captured: self.packets_captured.load(Ordering::Relaxed),
            packets_dropped_kernel: self.kernel_dropped.load(Ordering::Relaxed),
            packets_dropped_parser: self.parser_dropped.load(Ordering::Relaxed),
            packets_dropped_analysis: self.analysis_dropped.load(Ordering::Relaxed),
            responses_parsed: self.responses_parsed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_diff() {
        let stats = PipelineStats::default();
        stats.packets_captured.store(10, Ordering::Relaxed);
        stats.responses_parsed.store(4, Ordering::Relaxed);
        let a = stats.snapshot();

        stats.packets_captured.store(25, Ordering::Relaxed);
        stats.responses_parsed.store(9, Ordering::Relaxed);
        stats.parser_dropped.store(2, Ordering::Relaxed);
        let b = stats.snapshot();

        let inc = b.since(&a);
        assert_eq!(inc.packets_captured, 15);
        assert_eq!(inc.responses_parsed, 5);
        assert_eq!(inc.packets_dropped_parser, 2);
        assert_eq!(inc.packets_dropped_total(), 2);
    }
}
