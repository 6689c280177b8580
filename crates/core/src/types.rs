//! Core data types for the tickhouse pipeline.

use chrono::{DateTime, SecondsFormat, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Timestamp in milliseconds since Unix epoch (UTC).
pub type TimestampMs = i64;

/// Price type with ordering support.
pub type Price = OrderedFloat<f64>;

/// Start of the fixed-width bucket containing `ts_ms`.
///
/// Uses Euclidean division so pre-epoch timestamps floor downwards.
#[inline]
pub fn bucket_start(ts_ms: TimestampMs, bucket_seconds: u32) -> TimestampMs {
    let width = i64::from(bucket_seconds.max(1)) * 1_000;
    ts_ms.div_euclid(width) * width
}

/// Render a timestamp as RFC 3339 UTC with millisecond precision.
pub fn format_ts(ts_ms: TimestampMs) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ts_ms.to_string())
}

/// Option side of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "CALL")]
    Call,
    #[serde(rename = "PUT")]
    Put,
    /// Side could not be determined from the file name.
    #[serde(rename = "NA")]
    Unknown,
}

impl Side {
    /// Column value used in tables.
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Call => "CALL",
            Side::Put => "PUT",
            Side::Unknown => "NA",
        }
    }

    /// Infer the side from a file name: `CALL` wins over `PUT`, otherwise `NA`.
    pub fn infer_from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_uppercase())
            .unwrap_or_default();
        if name.contains("CALL") {
            Side::Call
        } else if name.contains("PUT") {
            Side::Put
        } else {
            Side::Unknown
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "CALL" | "C" => Ok(Side::Call),
            "PUT" | "P" => Ok(Side::Put),
            "NA" => Ok(Side::Unknown),
            other => Err(crate::Error::config(format!("unknown side `{other}`"))),
        }
    }
}

/// Identity of one option contract.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstrumentKey {
    /// Year-month series code.
    pub ymcode: String,
    /// CALL / PUT.
    pub side: Side,
    /// Contract code.
    pub code: String,
}

impl InstrumentKey {
    pub fn new(ymcode: impl Into<String>, side: Side, code: impl Into<String>) -> Self {
        Self {
            ymcode: ymcode.into(),
            side,
            code: code.into(),
        }
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.ymcode, self.side, self.code)
    }
}

/// A raw tick as loaded into the bronze layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTick {
    #[serde(flatten)]
    pub key: InstrumentKey,
    pub strike: Option<f64>,
    /// Exchange-local date (`YYYYMMDD`).
    pub idate: Option<i64>,
    /// Exchange-local time (`HHMMSS`).
    pub itime: Option<i64>,
    /// Exchange-local timestamp text as exported.
    pub tdate: Option<String>,
    /// Event time in UTC.
    pub ts_utc: TimestampMs,
    pub tcnt: Option<i64>,
    /// Trade price.
    pub c: Option<f64>,
    pub o: Option<f64>,
    pub h: Option<f64>,
    pub l: Option<f64>,
    /// Open interest.
    pub oi: Option<f64>,
    pub ccnt: Option<i64>,
    pub source_file: String,
    pub ingest_ts: TimestampMs,
}

/// A reference code row as loaded into the bronze layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRow {
    #[serde(flatten)]
    pub key: InstrumentKey,
    pub lastday: Option<i64>,
    /// Declared strike, when the export carries one.
    pub strike: Option<f64>,
    pub source_file: String,
    pub ingest_ts: TimestampMs,
}

/// A deduplicated, type-normalized tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SilverTick {
    #[serde(flatten)]
    pub key: InstrumentKey,
    pub strike: Option<f64>,
    pub ts_utc: TimestampMs,
    pub price: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub oi: Option<f64>,
    pub tcnt: Option<i64>,
    pub ccnt: Option<i64>,
    pub source_file: String,
    pub ingest_ts: TimestampMs,
}

/// One row per distinct instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractDim {
    #[serde(flatten)]
    pub key: InstrumentKey,
    /// Maximum strike observed in ticks.
    pub strike: Option<f64>,
    /// Strike declared by the reference codes table.
    pub ref_strike: Option<f64>,
    pub lastday: Option<i64>,
    pub first_seen_ts: TimestampMs,
    pub last_seen_ts: TimestampMs,
}

impl ContractDim {
    /// Observed strike, falling back to the declared one.
    pub fn effective_strike(&self) -> Option<f64> {
        self.strike.or(self.ref_strike)
    }
}

/// Fixed-width OHLC bar for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    #[serde(flatten)]
    pub key: InstrumentKey,
    pub strike: Option<f64>,
    /// Bucket start timestamp.
    pub bar_ts: TimestampMs,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub tick_count: u32,
    /// Sum of the configured trade-count field.
    pub volume: i64,
    /// Open interest of the last tick in the bucket.
    pub oi_last: Option<f64>,
}

/// Engineered features for one instrument at one bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    #[serde(flatten)]
    pub key: InstrumentKey,
    pub strike: Option<f64>,
    pub bar_ts: TimestampMs,
    /// Values aligned with [`FeatureFrame::columns`].
    pub values: Vec<Option<f64>>,
}

/// Feature table: named columns plus rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureFrame {
    pub columns: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

impl FeatureFrame {
    /// Index of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Non-null values of one column, in row order.
    pub fn column_values(&self, name: &str) -> Vec<f64> {
        match self.column_index(name) {
            Some(idx) => self.rows.iter().filter_map(|r| r.values[idx]).collect(),
            None => Vec::new(),
        }
    }
}

/// Forward-looking targets for one instrument at one bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRow {
    #[serde(flatten)]
    pub key: InstrumentKey,
    pub strike: Option<f64>,
    pub bar_ts: TimestampMs,
    /// Forward log returns aligned with [`LabelFrame::horizons`].
    pub returns: Vec<Option<f64>>,
    /// Direction of each forward return.
    pub directions: Vec<Option<i8>>,
}

/// Label table: horizons plus rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelFrame {
    pub horizons: Vec<usize>,
    pub rows: Vec<LabelRow>,
}

impl LabelFrame {
    /// Return columns followed by direction columns.
    pub fn column_names(&self) -> Vec<String> {
        self.horizons
            .iter()
            .map(|h| format!("y_ret_{h}"))
            .chain(self.horizons.iter().map(|h| format!("y_dir_{h}")))
            .collect()
    }
}

/// Half-open time range `[start, end)`; `None` is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<TimestampMs>,
    pub end: Option<TimestampMs>,
}

impl TimeRange {
    pub fn new(start: Option<TimestampMs>, end: Option<TimestampMs>) -> Self {
        Self { start, end }
    }

    /// The unbounded range.
    pub fn all() -> Self {
        Self::default()
    }

    #[inline]
    pub fn contains(&self, ts_ms: TimestampMs) -> bool {
        self.start.map_or(true, |s| ts_ms >= s) && self.end.map_or(true, |e| ts_ms < e)
    }

    /// Widen the range outwards so it covers whole buckets.
    pub fn align_to_buckets(&self, bucket_seconds: u32) -> Self {
        let width = i64::from(bucket_seconds.max(1)) * 1_000;
        Self {
            start: self.start.map(|s| bucket_start(s, bucket_seconds)),
            end: self.end.map(|e| {
                let floor = bucket_start(e, bucket_seconds);
                if floor == e {
                    e
                } else {
                    floor + width
                }
            }),
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.start.map(format_ts).unwrap_or_else(|| "-inf".to_string());
        let end = self.end.map(format_ts).unwrap_or_else(|| "+inf".to_string());
        write!(f, "[{start}, {end})")
    }
}

/// Machine-readable completion record emitted once per stage invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: String,
    pub status: String,
    pub rows_read: u64,
    /// Rows written per destination table.
    pub rows_written: BTreeMap<String, u64>,
    pub range_start: Option<String>,
    pub range_end: Option<String>,
    /// Earliest and latest event time actually written.
    pub data_start: Option<String>,
    pub data_end: Option<String>,
    pub metrics: BTreeMap<String, f64>,
    pub duration_ms: u64,
    /// Stage-specific structured result, such as a drift report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<serde_json::Value>,
}

impl StageSummary {
    pub fn new(stage: impl Into<String>, range: TimeRange) -> Self {
        Self {
            stage: stage.into(),
            status: "ok".to_string(),
            rows_read: 0,
            rows_written: BTreeMap::new(),
            range_start: range.start.map(format_ts),
            range_end: range.end.map(format_ts),
            data_start: None,
            data_end: None,
            metrics: BTreeMap::new(),
            duration_ms: 0,
            report: None,
        }
    }

    /// Record rows written to a table.
    pub fn wrote(&mut self, table: impl Into<String>, rows: usize) {
        *self.rows_written.entry(table.into()).or_insert(0) += rows as u64;
    }

    /// Widen the observed data span with the given timestamps.
    pub fn observe_span(&mut self, timestamps: impl IntoIterator<Item = TimestampMs>) {
        let mut min: Option<TimestampMs> = None;
        let mut max: Option<TimestampMs> = None;
        for ts in timestamps {
            min = Some(min.map_or(ts, |m| m.min(ts)));
            max = Some(max.map_or(ts, |m| m.max(ts)));
        }
        if let (Some(lo), Some(hi)) = (min, max) {
            self.data_start = Some(format_ts(lo));
            self.data_end = Some(format_ts(hi));
        }
    }

    pub fn metric(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.insert(name.into(), value);
    }

    pub fn total_written(&self) -> u64 {
        self.rows_written.values().sum()
    }

    /// Fold a sub-stage summary into this one. Metrics are prefixed with the
    /// sub-stage name; the data span is the sub-stage's when it has one.
    pub fn absorb(&mut self, other: StageSummary) {
        self.rows_read += other.rows_read;
        for (table, rows) in other.rows_written {
            *self.rows_written.entry(table).or_insert(0) += rows;
        }
        for (name, value) in other.metrics {
            self.metrics.insert(format!("{}.{name}", other.stage), value);
        }
        if other.data_start.is_some() {
            self.data_start = other.data_start;
            self.data_end = other.data_end;
        }
        if other.status != "ok" {
            self.status = other.status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_start() {
        // 2024-01-01 00:01:30.500 -> 2024-01-01 00:01:00.000
        let ts = 1704067290500i64;
        assert_eq!(bucket_start(ts, 60), 1704067260000);
        assert_eq!(bucket_start(ts, 300), 1704067200000);
    }

    #[test]
    fn test_bucket_start_before_epoch() {
        assert_eq!(bucket_start(-1, 60), -60_000);
        assert_eq!(bucket_start(-60_000, 60), -60_000);
    }

    #[test]
    fn test_side_inference() {
        assert_eq!(Side::infer_from_path(Path::new("/data/tick_call_202512.xml")), Side::Call);
        assert_eq!(Side::infer_from_path(Path::new("TICK_PUT.xml")), Side::Put);
        assert_eq!(Side::infer_from_path(Path::new("codes.xml")), Side::Unknown);
    }

    #[test]
    fn test_side_parse() {
        assert_eq!("call".parse::<Side>().unwrap(), Side::Call);
        assert_eq!("PUT".parse::<Side>().unwrap(), Side::Put);
        assert!("straddle".parse::<Side>().is_err());
    }

    #[test]
    fn test_side_serde_names() {
        let json = serde_json::to_string(&Side::Unknown).unwrap();
        assert_eq!(json, "\"NA\"");
    }

    #[test]
    fn test_range_alignment() {
        let range = TimeRange::new(Some(61_000), Some(121_000));
        let aligned = range.align_to_buckets(60);
        assert_eq!(aligned.start, Some(60_000));
        assert_eq!(aligned.end, Some(180_000));

        let exact = TimeRange::new(Some(60_000), Some(120_000)).align_to_buckets(60);
        assert_eq!(exact, TimeRange::new(Some(60_000), Some(120_000)));
    }

    #[test]
    fn test_range_contains_half_open() {
        let range = TimeRange::new(Some(10), Some(20));
        assert!(range.contains(10));
        assert!(range.contains(19));
        assert!(!range.contains(20));
        assert!(TimeRange::all().contains(i64::MIN));
    }

    #[test]
    fn test_summary_span() {
        let mut summary = StageSummary::new("bars", TimeRange::all());
        summary.observe_span([120_000, 60_000, 180_000]);
        assert_eq!(summary.data_start.as_deref(), Some("1970-01-01T00:01:00.000Z"));
        assert_eq!(summary.data_end.as_deref(), Some("1970-01-01T00:03:00.000Z"));
        summary.wrote("a", 3);
        summary.wrote("a", 2);
        assert_eq!(summary.total_written(), 5);
    }

    #[test]
    fn test_summary_absorb() {
        let mut run = StageSummary::new("run", TimeRange::all());
        let mut bars = StageSummary::new("bars", TimeRange::all());
        bars.rows_read = 10;
        bars.wrote("gold", 4);
        bars.metric("skipped_ticks", 1.0);
        bars.observe_span([0]);
        run.absorb(bars);
        assert_eq!(run.rows_read, 10);
        assert_eq!(run.rows_written["gold"], 4);
        assert_eq!(run.metrics["bars.skipped_ticks"], 1.0);
        assert_eq!(run.data_start.as_deref(), Some("1970-01-01T00:00:00.000Z"));

        let json = serde_json::to_value(&run).unwrap();
        assert!(json.get("report").is_none());
    }

    #[test]
    fn test_label_column_names() {
        let frame = LabelFrame {
            horizons: vec![5, 30],
            rows: Vec::new(),
        };
        assert_eq!(frame.column_names(), vec!["y_ret_5", "y_ret_30", "y_dir_5", "y_dir_30"]);
    }
}
