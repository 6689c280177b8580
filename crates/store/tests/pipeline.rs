//! End-to-end pipeline runs against an on-disk catalog.

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tickhouse_core::{Config, Side, TimeRange};
use tickhouse_store::Pipeline;

/// 2025-12-01T10:00:00+09:00
const T0: i64 = 1_764_550_800_000;
const MINUTES: usize = 40;

fn tick_xml(code: &str) -> String {
    let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<DocumentElement>\n");
    for m in 0..MINUTES {
        for (sec, bump) in [(5, 0.0), (45, 0.02)] {
            let wobble = if m % 3 == 0 { 0.05 } else { 0.0 };
            let price = 1.0 + 0.01 * m as f64 + bump + wobble;
            body.push_str(&format!(
                "  <OPT_TICK><ymcode>202512</ymcode><code>{code}</code><strike>350.0</strike>\
                 <tdate>2025-12-01T10:{m:02}:{sec:02}+09:00</tdate><tcnt>1</tcnt>\
                 <c>{price}</c><oi>{}</oi></OPT_TICK>\n",
                1_000 + m
            ));
        }
    }
    body.push_str("</DocumentElement>\n");
    body
}

const CODES: &str = r#"<DocumentElement>
  <OPT_CODE><ymcode>202512</ymcode><code>B0125C</code><lastday>20251211</lastday></OPT_CODE>
</DocumentElement>"#;

fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

struct Fixture {
    dir: TempDir,
    call: PathBuf,
    put: PathBuf,
    codes: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let call = write(dir.path(), "tick_CALL_202512.xml", &tick_xml("B0125C"));
        let put = write(dir.path(), "tick_PUT_202512.xml", &tick_xml("B0125P"));
        let codes = write(dir.path(), "codes_CALL_202512.xml", CODES);
        Self { dir, call, put, codes }
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline::open(&self.dir.path().join("lakehouse.db"), Config::default()).unwrap()
    }
}

#[test]
fn test_full_run_is_idempotent() {
    let fx = Fixture::new();
    let mut p = fx.pipeline();
    p.ingest_ticks(&[fx.call.clone(), fx.put.clone()], None).unwrap();
    p.ingest_codes(&[fx.codes.clone()], None).unwrap();

    let summary = p.run(TimeRange::all()).unwrap();
    assert_eq!(summary.status, "ok");
    assert_eq!(summary.stage, "run");

    let all = TimeRange::all();
    assert_eq!(p.silver_ticks(&all).unwrap().len(), 2 * MINUTES * 2);
    let dims = p.contract_dims().unwrap();
    assert_eq!(dims.len(), 2);
    let call = dims.iter().find(|d| d.key.side == Side::Call).unwrap();
    assert_eq!(call.lastday, Some(20251211));
    let put = dims.iter().find(|d| d.key.side == Side::Put).unwrap();
    assert_eq!(put.lastday, None);

    let bars = p.bars(&all).unwrap();
    assert_eq!(bars.len(), 2 * MINUTES);
    assert_eq!(bars[0].bar_ts, T0);
    let features = p.features(&all).unwrap();
    let labels = p.labels(&all).unwrap();
    assert_eq!(features.rows.len(), bars.len());
    assert_eq!(labels.rows.len(), bars.len());

    // same inputs, same outputs
    p.run(TimeRange::all()).unwrap();
    assert_eq!(p.bars(&all).unwrap(), bars);
    assert_eq!(p.features(&all).unwrap(), features);
    assert_eq!(p.labels(&all).unwrap(), labels);

    // re-ingesting a file supersedes rows without duplicating them
    p.ingest_ticks(&[fx.call.clone()], None).unwrap();
    assert_eq!(p.bronze_ticks(&all).unwrap().len(), 3 * MINUTES * 2);
    p.run(TimeRange::all()).unwrap();
    assert_eq!(p.silver_ticks(&all).unwrap().len(), 2 * MINUTES * 2);
    assert_eq!(p.bars(&all).unwrap(), bars);
    assert_eq!(p.features(&all).unwrap(), features);
}

#[test]
fn test_ranged_rerun_only_touches_its_partition() {
    let fx = Fixture::new();
    let mut p = fx.pipeline();
    p.ingest_ticks(&[fx.call.clone()], None).unwrap();
    p.run(TimeRange::all()).unwrap();
    let all = TimeRange::all();
    let bars = p.bars(&all).unwrap();
    let features = p.features(&all).unwrap();

    // an unaligned window widens to whole minutes
    let window = TimeRange::new(Some(T0 + 10 * 60_000 + 30_000), Some(T0 + 20 * 60_000 + 1));
    let summary = p.build_bars(window).unwrap();
    assert_eq!(summary.total_written(), 11);
    p.derive_features(window).unwrap();

    assert_eq!(p.bars(&all).unwrap(), bars);
    assert_eq!(p.features(&all).unwrap(), features);
}

#[test]
fn test_bad_file_writes_nothing() {
    let fx = Fixture::new();
    let bad = write(fx.dir.path(), "tick_CALL_bad.xml", "<DocumentElement></DocumentElement>");
    let mut p = fx.pipeline();
    assert!(p.ingest_ticks(&[fx.call.clone(), bad], None).is_err());
    assert!(p.bronze_ticks(&TimeRange::all()).unwrap().is_empty());
}

#[test]
fn test_dataset_and_drift() {
    let fx = Fixture::new();
    let mut p = fx.pipeline();
    p.ingest_ticks(&[fx.call.clone()], None).unwrap();
    p.run(TimeRange::all()).unwrap();

    let out = fx.dir.path().join("train.csv");
    let summary = p.export_dataset(TimeRange::all(), "y_ret_5", &out).unwrap();
    assert_eq!(summary.total_written(), (MINUTES - 5) as u64);
    let text = std::fs::read_to_string(&out).unwrap();
    let header = text.lines().next().unwrap();
    assert!(header.starts_with("ymcode,side,code,bar_ts,ret_1,ret_5,mom_15"));
    assert!(header.ends_with(",y_ret_5"));
    assert_eq!(text.lines().count(), MINUTES - 5 + 1);

    let half = T0 + (MINUTES as i64 / 2) * 60_000;
    let (summary, report) = p
        .check_drift(TimeRange::new(None, Some(half)), TimeRange::new(Some(half), None))
        .unwrap();
    assert_eq!(summary.stage, "drift");
    assert!(summary.report.is_some());
    assert_eq!(report.feature_scores.len() + report.skipped.len(), 4);
}

#[test]
fn test_numeric_looking_codes_stay_verbatim() {
    let fx = Fixture::new();
    let body = "<DocumentElement>\
        <OPT_CODE><ymcode>202512</ymcode><code>1E5</code><lastday>20251211</lastday></OPT_CODE>\
        <OPT_CODE><ymcode>202512</ymcode><code>inf</code></OPT_CODE>\
        </DocumentElement>";
    let path = write(fx.dir.path(), "codes_PUT_202512.xml", body);
    let mut p = fx.pipeline();
    p.ingest_codes(&[path], None).unwrap();

    let codes = p.bronze_codes().unwrap();
    let names: Vec<&str> = codes.iter().map(|c| c.key.code.as_str()).collect();
    assert_eq!(names, vec!["1E5", "inf"]);
    assert_eq!(codes[0].lastday, Some(20251211));
}
