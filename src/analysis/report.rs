//! Report assembly
//!
//! A report is a snapshot of the grouped aggregation results, sortable by
//! any value column and truncatable to the hottest rows.

use chrono::{DateTime, Utc};

/// One grouped row: composite key values and aggregate results, both in
/// descriptor order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub key: Vec<String>,
    pub values: Vec<i64>,
}

/// Key activity recorded since the last reset.
#[derive(Debug, Clone)]
pub struct Report {
    pub timestamp: DateTime<Utc>,
    pub key_col_names: Vec<String>,
    pub val_col_names: Vec<String>,
    pub rows: Vec<ReportRow>,
}

impl Report {
    /// Sort rows by a signed 1-based value-column index: `2` sorts
    /// ascending by the second value column, `-2` descending. `0` and
    /// out-of-range indices leave the order unchanged.
    pub fn sort_by(&mut self, col: isize) {
        let idx = (col.unsigned_abs()).wrapping_sub(1);
        if col == 0 || idx >= self.val_col_names.len() {
            return;
        }
        self.rows.sort_by_key(|r| r.values.get(idx).copied().unwrap_or(0));
        if col < 0 {
            self.rows.reverse();
        }
    }

    /// Keep only the first `n` rows.
    pub fn truncate(&mut self, n: usize) {
        self.rows.truncate(n);
    }

    /// Sum of the value column named `name`; falls back to the second
    /// value column, the convention for bandwidth totals under the
    /// default format's `sum(size)`.
    pub fn column_total(&self, name: &str) -> i64 {
        let idx = match self.val_col_names.iter().position(|c| c == name) {
            Some(idx) => idx,
            None if self.val_col_names.len() > 1 => 1,
            None => return 0,
        };
        self.rows
            .iter()
            .map(|r| r.values.get(idx).copied().unwrap_or(0))
            .sum()
    }
}
