//! Reporting
//!
//! Periodically snapshots the analysis pool and runtime counters, and
//! renders the result either as a table (default) or as newline-delimited
//! JSON (`--nogui`). One report per interval; in non-cumulative mode the
//! aggregation state is reset after each snapshot.

mod json;

pub use json::JsonWriter;

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{select, tick, Receiver};
use tabled::builder::Builder;
use tabled::settings::Style;
use tracing::info;

use crate::analysis;
use crate::assembly;
use crate::stats::{PipelineStats, StatsSnapshot};

/// A report plus the derived totals and counter snapshots handed to the
/// output layer.
pub struct ReportSummary {
    pub report: analysis::Report,
    /// Distinct keys seen in this interval, before truncation.
    pub total_keys: usize,
    /// Bandwidth accounted to all keys (from the `sum(size)` column).
    pub total_bandwidth: i64,
    /// Bandwidth accounted to the reported (truncated) rows.
    pub reported_bandwidth: i64,
    pub incremental: StatsSnapshot,
    pub cumulative: StatsSnapshot,
}

/// Configuration for the report loop.
pub struct PresenterConfig {
    pub interval: Duration,
    pub cumulative: bool,
    pub top: usize,
    /// Emit JSON lines instead of tables.
    pub json: bool,
    pub output: Option<std::path::PathBuf>,
}

/// The periodic report loop.
pub struct Presenter {
    analysis: Arc<analysis::Pool>,
    assembly: Arc<assembly::Pool>,
    stats: Arc<PipelineStats>,
    cfg: PresenterConfig,
    writer: Option<JsonWriter>,
    last_snapshot: StatsSnapshot,
}

impl Presenter {
    pub fn new(
        analysis: Arc<analysis::Pool>,
        assembly: Arc<assembly::Pool>,
        stats: Arc<PipelineStats>,
        cfg: PresenterConfig,
    ) -> std::io::Result<Self> {
        let writer = if cfg.json {
            Some(JsonWriter::new(cfg.output.as_deref())?)
        } else {
            None
        };
        Ok(Self {
            analysis,
            assembly,
            stats,
            cfg,
            writer,
            last_snapshot: StatsSnapshot::default(),
        })
    }

    /// Emit a report every interval until `shutdown` fires, then emit one
    /// final report covering the remainder.
    pub fn run(&mut self, shutdown: Receiver<()>) -> std::io::Result<()> {
        let ticker = tick(self.cfg.interval);
        loop {
            select! {
                recv(ticker) -> _ => self.emit(false)?,
                recv(shutdown) -> _ => {
                    self.emit(true)?;
                    return Ok(());
                }
            }
        }
    }

    fn emit(&mut self, final_report: bool) -> std::io::Result<()> {
        if final_report {
            // pick up events still buffered in the conversations
            self.assembly.drain();
        }

        let mut report = self.analysis.report(!self.cfg.cumulative);
        let sort_col = if report.val_col_names.len() >= 2 { -2 } else { -1 };
        report.sort_by(sort_col);

        let total_keys = report.rows.len();
        let total_bandwidth = report.column_total("sum(size)");
        report.truncate(self.cfg.top);
        let reported_bandwidth = report.column_total("sum(size)");

        let cumulative = self.stats.snapshot();
        let incremental = cumulative.since(&self.last_snapshot);
        self.last_snapshot = cumulative;

        let summary = ReportSummary {
            report,
            total_keys,
            total_bandwidth,
            reported_bandwidth,
            incremental,
            cumulative,
        };

        match &mut self.writer {
            Some(writer) => writer.write(&summary)?,
            None => render_table(&summary),
        }
        Ok(())
    }
}

fn render_table(summary: &ReportSummary) {
    let report = &summary.report;
    let mut builder = Builder::default();
    let header: Vec<String> = report
        .key_col_names
        .iter()
        .chain(&report.val_col_names)
        .cloned()
        .collect();
    builder.push_record(header);
    for row in &report.rows {
        let cells: Vec<String> = row
            .key
            .iter()
            .cloned()
            .chain(row.values.iter().map(|v| v.to_string()))
            .collect();
        builder.push_record(cells);
    }
    let table = builder.build().with(Style::sharp()).to_string();
    println!("{table}");

    let pct = if summary.total_bandwidth > 0 {
        100.0 * summary.reported_bandwidth as f64 / summary.total_bandwidth as f64
    } else {
        0.0
    };
    info!(
        "keys: {} of {} shown ({:.1}% of {} bytes) | interval: {} captured, {} parsed, {} dropped (kernel {}, parser {}, analysis {}) | total: {} captured, {} parsed, {} dropped",
        report.rows.len(),
        summary.total_keys,
        pct,
        summary.total_bandwidth,
        summary.incremental.packets_captured,
        summary.incremental.responses_parsed,
        summary.incremental.packets_dropped_total(),
        summary.incremental.packets_dropped_kernel,
        summary.incremental.packets_dropped_parser,
        summary.incremental.packets_dropped_analysis,
        summary.cumulative.packets_captured,
        summary.cumulative.responses_parsed,
        summary.cumulative.packets_dropped_total(),
    );
}
