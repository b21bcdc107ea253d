//! JSON report output
//!
//! Writes one JSON object per report interval, newline delimited, to
//! stdout or to a file opened append-only with synchronous writes so
//! partially written reports cannot be observed.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use serde_json::{json, Map, Value};

use super::ReportSummary;
use crate::stats::StatsSnapshot;

enum Output {
    Stdout,
    File(File),
}

/// Newline-delimited JSON report writer.
pub struct JsonWriter {
    out: Output,
}

impl JsonWriter {
    pub fn new(path: Option<&Path>) -> io::Result<Self> {
        let out = match path {
            None => Output::Stdout,
            Some(path) => {
                let mut opts = OpenOptions::new();
                opts.create(true).append(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    opts.custom_flags(libc::O_SYNC);
                }
                Output::File(opts.open(path)?)
            }
        };
        Ok(Self { out })
    }

    pub fn write(&mut self, summary: &ReportSummary) -> io::Result<()> {
        let line = serde_json::to_string(&to_json(summary))?;
        match &mut self.out {
            Output::Stdout => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(line.as_bytes())?;
                stdout.write_all(b"\n")?;
                stdout.flush()
            }
            Output::File(f) => {
                f.write_all(line.as_bytes())?;
                f.write_all(b"\n")
            }
        }
    }
}

fn to_json(summary: &ReportSummary) -> Value {
    let report = &summary.report;
    let rows: Vec<Value> = report
        .rows
        .iter()
        .map(|row| {
            let mut m = Map::new();
            for (name, value) in report.key_col_names.iter().zip(&row.key) {
                m.insert(name.clone(), Value::from(value.clone()));
            }
            for (name, value) in report.val_col_names.iter().zip(&row.values) {
                m.insert(name.clone(), Value::from(*value));
            }
            Value::Object(m)
        })
        .collect();

    let percentage = if summary.total_bandwidth > 0 {
        100.0 * summary.reported_bandwidth as f64 / summary.total_bandwidth as f64
    } else {
        0.0
    };

    json!({
        "ts": report.timestamp.timestamp(),
        "ts_s": report.timestamp.to_rfc3339(),
        "totalKeys": summary.total_keys,
        "totalBandwidth": summary.total_bandwidth,
        "reportedKeys": report.rows.len(),
        "reportedBandwidth": summary.reported_bandwidth,
        "reportedBandwidthPercentage": percentage,
        "rows": rows,
        "stats": {
            "incremental": stats_json(&summary.incremental),
        },
    })
}

fn stats_json(s: &StatsSnapshot) -> Value {
    json!({
        "PacketsEnteredFilter": s.packets_entered_filter,
        "PacketsPassedFilter": s.packets_passed_filter,
        "PacketsCaptured": s.packets_captured,
        "PacketsDroppedKernel": s.packets_dropped_kernel,
        "PacketsDroppedParser": s.packets_dropped_parser,
        "PacketsDroppedAnalysis": s.packets_dropped_analysis,
        "PacketsDroppedTotal": s.packets_dropped_total(),
        "ResponsesParsed": s.responses_parsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Report, ReportRow};
    use chrono::Utc;

    fn summary() -> ReportSummary {
        ReportSummary {
            report: Report {
                timestamp: Utc::now(),
                key_col_names: vec!["key".into()],
                val_col_names: vec!["max(size)".into(), "sum(size)".into()],
                rows: vec![ReportRow {
                    key: vec!["key1".into()],
                    values: vec![60, 100],
                }],
            },
            total_keys: 5,
            total_bandwidth: 400,
            reported_bandwidth: 100,
            incremental: StatsSnapshot {
                packets_captured: 10,
                responses_parsed: 3,
                ..Default::default()
            },
            cumulative: StatsSnapshot::default(),
        }
    }

    #[test]
    fn test_report_json_shape() {
        let v = to_json(&summary());
        assert_eq!(v["totalKeys"], 5);
        assert_eq!(v["totalBandwidth"], 400);
        assert_eq!(v["reportedKeys"], 1);
        assert_eq!(v["reportedBandwidthPercentage"], 25.0);
        assert_eq!(v["rows"][0]["key"], "key1");
        assert_eq!(v["rows"][0]["max(size)"], 60);
        assert_eq!(v["rows"][0]["sum(size)"], 100);
        assert_eq!(v["stats"]["incremental"]["PacketsCaptured"], 10);
        assert_eq!(v["stats"]["incremental"]["ResponsesParsed"], 3);
        assert_eq!(v["stats"]["incremental"]["PacketsDroppedTotal"], 0);
    }

    #[test]
    fn test_zero_bandwidth_has_no_nan() {
        let mut s = summary();
        s.total_bandwidth = 0;
        let v = to_json(&s);
        assert_eq!(v["reportedBandwidthPercentage"], 0.0);
    }
}
