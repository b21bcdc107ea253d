//! Grouped aggregation
//!
//! A descriptor string such as `"key, size, sum(size), p99(size)"`
//! configures how events are grouped and summarized: bare field names
//! become key columns, `func(field)` tokens become aggregate columns over
//! integer fields.

use hdrhistogram::Histogram;
use regex::Regex;
use thiserror::Error;

use crate::protocol::Event;

/// Highest value tracked by percentile aggregators, just over a minute
/// assuming microsecond measurements.
const PERCENTILE_MAX_VALUE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("bad aggregate descriptor: {0}")]
pub struct DescriptorError(pub String);

/// An event field usable as a key or aggregation input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Key,
    Size,
}

impl Field {
    fn parse(desc: &str) -> Result<Field, DescriptorError> {
        match desc {
            "key" => Ok(Field::Key),
            "size" => Ok(Field::Size),
            other => Err(DescriptorError(other.to_string())),
        }
    }

    /// Whether the field can be viewed as an integer and aggregated.
    fn is_integer(&self) -> bool {
        matches!(self, Field::Size)
    }

    fn as_string(&self, e: &Event) -> String {
        match self {
            Field::Key => e.key.clone(),
            Field::Size => e.size.to_string(),
        }
    }

    fn as_i64(&self, e: &Event) -> i64 {
        match self {
            Field::Key => 0,
            Field::Size => e.size as i64,
        }
    }
}

/// The supported aggregation functions.
#[derive(Debug, Clone, Copy, PartialEq)]
enum AggKind {
    Count,
    Min,
    Max,
    Sum,
    Mean,
    /// Quantile in `[0, 1]`.
    Percentile(f64),
}

impl AggKind {
    /// Parse an aggregator name: `cnt`, `min`, `max`, `sum`, `avg`/`mean`,
    /// or `pNNN` where the decimal point position follows from the token
    /// length (`p99` → 0.99, `p999` → 0.999, `p9999` → 0.9999).
    fn parse(desc: &str) -> Result<AggKind, DescriptorError> {
        match desc {
            "cnt" => Ok(AggKind::Count),
            "min" => Ok(AggKind::Min),
            "max" => Ok(AggKind::Max),
            "sum" => Ok(AggKind::Sum),
            "avg" | "mean" => Ok(AggKind::Mean),
            _ => {
                let digits = desc
                    .strip_prefix('p')
                    .filter(|d| d.len() >= 2)
                    .and_then(|d| d.parse::<u32>().ok())
                    .ok_or_else(|| DescriptorError(desc.to_string()))?;
                let shift = desc.len() as i32 - 3;
                let percent = digits as f64 / 10f64.powi(shift);
                Ok(AggKind::Percentile(percent / 100.0))
            }
        }
    }
}

/// Summarizes a stream of integers to a single number.
#[derive(Debug)]
pub enum Aggregator {
    Count {
        count: i64,
    },
    Min {
        min: i64,
        seen: bool,
    },
    Max {
        max: i64,
        seen: bool,
    },
    Sum {
        sum: i64,
    },
    Mean {
        sum: i64,
        count: i64,
    },
    Percentile {
        q: f64,
        hist: Box<Histogram<u64>>,
    },
}

impl Aggregator {
    fn new(kind: AggKind) -> Aggregator {
        match kind {
            AggKind::Count => Aggregator::Count { count: 0 },
            AggKind::Min => Aggregator::Min { min: 0, seen: false },
            AggKind::Max => Aggregator::Max { max: 0, seen: false },
            AggKind::Sum => Aggregator::Sum { sum: 0 },
            AggKind::Mean => Aggregator::Mean { sum: 0, count: 0 },
            AggKind::Percentile(q) => Aggregator::Percentile {
                q,
                hist: Box::new(new_histogram()),
            },
        }
    }

    pub fn add(&mut self, n: i64) {
        match self {
            Aggregator::Count { count } => *count += 1,
            Aggregator::Min { min, seen } => {
                if !*seen || *min > n {
                    *min = n;
                }
                *seen = true;
            }
            Aggregator::Max { max, seen } => {
                if !*seen || *max < n {
                    *max = n;
                }
                *seen = true;
            }
            Aggregator::Sum { sum } => *sum += n,
            Aggregator::Mean { sum, count } => {
                *sum += n;
                *count += 1;
            }
            Aggregator::Percentile { hist, .. } => {
                let v = n.max(0) as u64;
                if hist.record(v).is_err() {
                    // value beyond the tracked range, record at the top so
                    // the overflow stays visible
                    let _ = hist.record(hist.high());
                }
            }
        }
    }

    pub fn result(&self) -> i64 {
        match self {
            Aggregator::Count { count } => *count,
            Aggregator::Min { min, .. } => *min,
            Aggregator::Max { max, .. } => *max,
            Aggregator::Sum { sum } => *sum,
            Aggregator::Mean { sum, count } => {
                if *count == 0 {
                    0
                } else {
                    sum / count
                }
            }
            Aggregator::Percentile { q, hist } => {
                let v = hist.value_at_quantile(*q);
                if v >= hist.high() {
                    // the true value is unknown but large; make it obvious
                    i64::MAX
                } else {
                    v as i64
                }
            }
        }
    }

    pub fn reset(&mut self) {
        match self {
            Aggregator::Count { count } => *count = 0,
            Aggregator::Min { min, seen } => {
                *min = 0;
                *seen = false;
            }
            Aggregator::Max { max, seen } => {
                *max = 0;
                *seen = false;
            }
            Aggregator::Sum { sum } => *sum = 0,
            Aggregator::Mean { sum, count } => {
                *sum = 0;
                *count = 0;
            }
            Aggregator::Percentile { hist, .. } => hist.reset(),
        }
    }
}

fn new_histogram() -> Histogram<u64> {
    // 3 significant digits over [1, PERCENTILE_MAX_VALUE]
    Histogram::new_with_bounds(1, PERCENTILE_MAX_VALUE, 3).expect("failed to create histogram")
}

/// Tracks all requested aggregates for a single composite key.
#[derive(Debug)]
pub struct KeyAggregator {
    /// Values of the key fields this aggregator groups by.
    pub key: Vec<String>,
    agg_fields: Vec<Field>,
    aggs: Vec<Aggregator>,
}

impl KeyAggregator {
    /// Update every aggregate from one event.
    pub fn add(&mut self, e: &Event) {
        for (agg, field) in self.aggs.iter_mut().zip(&self.agg_fields) {
            agg.add(field.as_i64(e));
        }
    }

    /// Aggregation results in descriptor order.
    pub fn result(&self) -> Vec<i64> {
        self.aggs.iter().map(|a| a.result()).collect()
    }

    /// Clear accumulators so the object can go back to a pool.
    pub fn reset(&mut self) {
        self.key.clear();
        for agg in &mut self.aggs {
            agg.reset();
        }
    }
}

/// Creates [`KeyAggregator`]s that share one method of aggregation,
/// parsed from a descriptor string.
#[derive(Debug, Clone)]
pub struct KeyAggregatorFactory {
    key_fields: Vec<Field>,
    /// Key column names, in descriptor order.
    pub key_names: Vec<String>,
    agg_fields: Vec<Field>,
    agg_kinds: Vec<AggKind>,
    /// Aggregate column names, in descriptor order (`"sum(size)"`).
    pub agg_names: Vec<String>,
}

impl KeyAggregatorFactory {
    /// Parse a descriptor such as `"key,max(size),sum(size)"`.
    pub fn parse(descriptor: &str) -> Result<KeyAggregatorFactory, DescriptorError> {
        let agg_re = Regex::new(r"^([a-z0-9]+)\(([a-z]+)\)$")
            .map_err(|e| DescriptorError(e.to_string()))?;

        let mut f = KeyAggregatorFactory {
            key_fields: Vec::new(),
            key_names: Vec::new(),
            agg_fields: Vec::new(),
            agg_kinds: Vec::new(),
            agg_names: Vec::new(),
        };

        for token in descriptor.split(',') {
            let token = token.trim();
            if let Ok(field) = Field::parse(token) {
                f.key_fields.push(field);
                f.key_names.push(token.to_string());
                continue;
            }
            let caps = agg_re
                .captures(token)
                .ok_or_else(|| DescriptorError(token.to_string()))?;
            let kind = AggKind::parse(&caps[1])?;
            let field = Field::parse(&caps[2])?;
            if !field.is_integer() {
                return Err(DescriptorError(token.to_string()));
            }
            f.agg_fields.push(field);
            f.agg_kinds.push(kind);
            f.agg_names.push(token.to_string());
        }

        if f.key_names.is_empty() && f.agg_names.is_empty() {
            return Err(DescriptorError(descriptor.to_string()));
        }
        Ok(f)
    }

    pub fn new_aggregator(&self) -> KeyAggregator {
        KeyAggregator {
            key: Vec::new(),
            agg_fields: self.agg_fields.clone(),
            aggs: self.agg_kinds.iter().map(|k| Aggregator::new(*k)).collect(),
        }
    }

    /// The composite key values of an event, in descriptor order.
    pub fn key(&self, e: &Event) -> Vec<String> {
        self.key_fields.iter().map(|f| f.as_string(e)).collect()
    }

    /// A single map key for an event: each key-field value followed by a
    /// NUL byte, unique for any value set not containing NUL.
    pub fn flat_key(&self, e: &Event) -> String {
        let mut out = String::new();
        for field in &self.key_fields {
            out.push_str(&field.as_string(e));
            out.push('\0');
        }
        out
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
    fn test_descriptor_round_trip() {
        let f = KeyAggregatorFactory::parse("key, size, sum(size), p99(size)").unwrap();
        assert_eq!(f.key_names, vec!["key", "size"]);
        assert_eq!(f.agg_names, vec!["sum(size)", "p99(size)"]);
    }

    #[test]
    fn test_bad_descriptors() {
        for desc in ["bogus", "sum(key)", "frobnicate(size)", "p(size)", ""] {
            assert!(
                KeyAggregatorFactory::parse(desc).is_err(),
                "descriptor {desc:?} should fail"
            );
        }
    }

    #[test]
    fn test_aggregation_example() {
        // five sizes [10,10,10,10,60] under key,max(size),sum(size),avg(size)
        let f = KeyAggregatorFactory::parse("key,max(size),sum(size),avg(size)").unwrap();
        let mut ka = f.new_aggregator();
        for size in [10, 10, 10, 10, 60] {
            let e = event("key1", size);
            if ka.key.is_empty() {
                ka.key = f.key(&e);
            }
            ka.add(&e);
        }
        assert_eq!(ka.key, vec!["key1"]);
        assert_eq!(ka.result(), vec![60, 100, 20]);
    }

    #[test]
    fn test_count_min_mean() {
        let f = KeyAggregatorFactory::parse("key,cnt(size),min(size),mean(size)").unwrap();
        let mut ka = f.new_aggregator();
        for size in [7, 3, 5] {
            ka.add(&event("k", size));
        }
        assert_eq!(ka.result(), vec![3, 3, 5]);
    }

    #[test]
    fn test_reset_equals_fresh() {
        let f = KeyAggregatorFactory::parse("key,cnt(size),min(size),max(size),sum(size),avg(size),p90(size)")
            .unwrap();
        let mut ka = f.new_aggregator();
        for size in [1, 100, 50] {
            ka.add(&event("k", size));
        }
        ka.reset();
        let fresh = f.new_aggregator();
        assert_eq!(ka.result(), fresh.result());

        // and reuse after reset behaves like new
        for size in [4, 6] {
            ka.add(&event("k", size));
        }
        assert_eq!(ka.result(), vec![2, 4, 6, 10, 5, 6]);
    }

    #[test]
    fn test_percentile_quantile_derivation() {
        assert_eq!(AggKind::parse("p50").unwrap(), AggKind::Percentile(0.50));
        assert_eq!(AggKind::parse("p99").unwrap(), AggKind::Percentile(0.99));
        assert_eq!(AggKind::parse("p999").unwrap(), AggKind::Percentile(0.999));
        assert_eq!(
            AggKind::parse("p9999").unwrap(),
            AggKind::Percentile(0.9999)
        );
    }

    #[test]
    fn test_percentile_result() {
        let mut agg = Aggregator::new(AggKind::Percentile(0.5));
        for n in 1..=100 {
            agg.add(n * 10);
        }
        let median = agg.result();
        // 3 significant digits of accuracy around 500
        assert!((495..=505).contains(&median), "median {median}");
    }

    #[test]
    fn test_percentile_overflow_reports_max() {
        let mut agg = Aggregator::new(AggKind::Percentile(1.0));
        agg.add(5);
        agg.add(i64::MAX);
        assert_eq!(agg.result(), i64::MAX);
    }

    #[test]
    fn test_flat_key_uniqueness() {
        let f = KeyAggregatorFactory::parse("key,size,cnt(size)").unwrap();
        let a = f.flat_key(&event("ab", 1));
        let b = f.flat_key(&event("a", 1));
        let c = f.flat_key(&event("ab", 1));
        assert_eq!(a, c);
        assert_ne!(a, b);
        // tuple boundaries matter: ("ab","1") != ("a","b1") shaped keys
        assert_eq!(a, "ab\u{0}1\u{0}");
    }
}
