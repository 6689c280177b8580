//! Bronze to silver normalization.
//!
//! Deduplicates raw ticks on `(ymcode, side, code, ts_utc)` keeping the latest
//! ingest, standardizes column types, and derives the contract dimension.

use std::collections::BTreeMap;
use tickhouse_core::{CodeRow, ContractDim, InstrumentKey, Price, RawTick, SilverTick, TimestampMs};
use tracing::debug;

/// Uniqueness key of a tick.
type TickKey = (InstrumentKey, TimestampMs);

/// Statistics about one normalization pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizeStats {
    /// Raw rows examined.
    pub input_rows: u64,
    /// Rows surviving deduplication.
    pub output_rows: u64,
    /// Rows dropped as superseded duplicates.
    pub duplicates: u64,
}

/// Keep one tick per `(ymcode, side, code, ts_utc)`: the one with the
/// greatest `ingest_ts`. On equal `ingest_ts` the later row in input order
/// wins, so callers must pass bronze rows in append order.
///
/// Output is sorted by instrument, then event time.
pub fn dedup_ticks(ticks: &[RawTick]) -> (Vec<RawTick>, NormalizeStats) {
    let mut latest: BTreeMap<TickKey, &RawTick> = BTreeMap::new();
    for tick in ticks {
        let key = (tick.key.clone(), tick.ts_utc);
        let replace = latest
            .get(&key)
            .map_or(true, |kept| tick.ingest_ts >= kept.ingest_ts);
        if replace {
            latest.insert(key, tick);
        }
    }

    let survivors: Vec<RawTick> = latest.into_values().cloned().collect();
    let stats = NormalizeStats {
        input_rows: ticks.len() as u64,
        output_rows: survivors.len() as u64,
        duplicates: (ticks.len() - survivors.len()) as u64,
    };
    debug!(
        input = stats.input_rows,
        output = stats.output_rows,
        duplicates = stats.duplicates,
        "deduplicated ticks"
    );
    (survivors, stats)
}

/// Map a raw tick onto the silver column set.
pub fn standardize(tick: &RawTick) -> SilverTick {
    SilverTick {
        key: tick.key.clone(),
        strike: tick.strike,
        ts_utc: tick.ts_utc,
        price: tick.c,
        open: tick.o,
        high: tick.h,
        low: tick.l,
        oi: tick.oi,
        tcnt: tick.tcnt,
        ccnt: tick.ccnt,
        source_file: tick.source_file.clone(),
        ingest_ts: tick.ingest_ts,
    }
}

/// Deduplicate and standardize in one pass.
pub fn normalize_ticks(ticks: &[RawTick]) -> (Vec<SilverTick>, NormalizeStats) {
    let (survivors, stats) = dedup_ticks(ticks);
    (survivors.iter().map(standardize).collect(), stats)
}

/// Keep one code row per instrument: latest ingest, later input row on ties.
pub fn dedup_codes(codes: &[CodeRow]) -> BTreeMap<InstrumentKey, &CodeRow> {
    let mut latest: BTreeMap<InstrumentKey, &CodeRow> = BTreeMap::new();
    for code in codes {
        let replace = latest
            .get(&code.key)
            .map_or(true, |kept| code.ingest_ts >= kept.ingest_ts);
        if replace {
            latest.insert(code.key.clone(), code);
        }
    }
    latest
}

#[derive(Debug)]
struct DimInProgress {
    strike: Option<Price>,
    first_seen: TimestampMs,
    last_seen: TimestampMs,
}

/// One dimension row per instrument seen in `ticks`, enriched with the
/// reference strike and last trading day from `codes`.
///
/// Instruments present only in `codes` are not emitted.
pub fn derive_dimension(ticks: &[SilverTick], codes: &[CodeRow]) -> Vec<ContractDim> {
    let mut groups: BTreeMap<&InstrumentKey, DimInProgress> = BTreeMap::new();
    for tick in ticks {
        let strike = tick.strike.map(Price::from);
        groups
            .entry(&tick.key)
            .and_modify(|g| {
                g.strike = g.strike.max(strike);
                g.first_seen = g.first_seen.min(tick.ts_utc);
                g.last_seen = g.last_seen.max(tick.ts_utc);
            })
            .or_insert(DimInProgress {
                strike,
                first_seen: tick.ts_utc,
                last_seen: tick.ts_utc,
            });
    }

    let reference = dedup_codes(codes);
    groups
        .into_iter()
        .map(|(key, g)| {
            let code = reference.get(key);
            ContractDim {
                key: key.clone(),
                strike: g.strike.map(|s| s.into_inner()),
                ref_strike: code.and_then(|c| c.strike),
                lastday: code.and_then(|c| c.lastday),
                first_seen_ts: g.first_seen,
                last_seen_ts: g.last_seen,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickhouse_core::Side;

    fn key(code: &str) -> InstrumentKey {
        InstrumentKey::new("202512", Side::Call, code)
    }

    fn make_tick(code: &str, ts_utc: i64, price: f64, ingest_ts: i64, source: &str) -> RawTick {
        RawTick {
            key: key(code),
            strike: Some(350.0),
            idate: None,
            itime: None,
            tdate: None,
            ts_utc,
            tcnt: Some(1),
            c: Some(price),
            o: None,
            h: None,
            l: None,
            oi: Some(100.0),
            ccnt: None,
            source_file: source.to_string(),
            ingest_ts,
        }
    }

    fn make_code(code: &str, strike: Option<f64>, lastday: i64, ingest_ts: i64) -> CodeRow {
        CodeRow {
            key: key(code),
            lastday: Some(lastday),
            strike,
            source_file: "codes.xml".to_string(),
            ingest_ts,
        }
    }

    #[test]
    fn test_latest_ingest_wins() {
        let ticks = vec![
            make_tick("A", 1_000, 1.0, 200, "late.xml"),
            make_tick("A", 1_000, 2.0, 100, "early.xml"),
            make_tick("A", 2_000, 3.0, 100, "early.xml"),
        ];
        let (silver, stats) = normalize_ticks(&ticks);

        assert_eq!(silver.len(), 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(silver[0].ts_utc, 1_000);
        assert_eq!(silver[0].price, Some(1.0));
        assert_eq!(silver[0].source_file, "late.xml");
    }

    #[test]
    fn test_equal_ingest_later_row_wins() {
        let ticks = vec![
            make_tick("A", 1_000, 1.0, 100, "first.xml"),
            make_tick("A", 1_000, 2.0, 100, "second.xml"),
        ];
        let (silver, _) = normalize_ticks(&ticks);
        assert_eq!(silver.len(), 1);
        assert_eq!(silver[0].source_file, "second.xml");
    }

    #[test]
    fn test_distinct_sides_are_not_duplicates() {
        let mut put = make_tick("A", 1_000, 1.0, 100, "put.xml");
        put.key.side = Side::Put;
        let ticks = vec![make_tick("A", 1_000, 1.0, 100, "call.xml"), put];
        let (silver, stats) = normalize_ticks(&ticks);
        assert_eq!(silver.len(), 2);
        assert_eq!(stats.duplicates, 0);
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let ticks = vec![
            make_tick("B", 3_000, 1.0, 100, "x.xml"),
            make_tick("A", 1_000, 1.0, 200, "y.xml"),
            make_tick("A", 1_000, 2.0, 100, "x.xml"),
        ];
        let (once, _) = dedup_ticks(&ticks);
        let (twice, stats) = dedup_ticks(&once);
        assert_eq!(once, twice);
        assert_eq!(stats.duplicates, 0);
        // sorted by instrument then time
        assert_eq!(once[0].key.code, "A");
        assert_eq!(once[1].key.code, "B");
    }

    #[test]
    fn test_derive_dimension() {
        let mut ticks = vec![
            make_tick("A", 5_000, 1.0, 100, "x.xml"),
            make_tick("A", 1_000, 1.0, 100, "x.xml"),
            make_tick("B", 2_000, 1.0, 100, "x.xml"),
        ];
        ticks[1].strike = Some(352.5);
        ticks[2].strike = None;
        let (silver, _) = normalize_ticks(&ticks);
        let codes = vec![
            make_code("A", Some(350.0), 20251211, 100),
            make_code("B", Some(355.0), 20251210, 100),
            make_code("B", Some(357.5), 20251211, 200),
            make_code("Z", None, 20251211, 100),
        ];

        let dims = derive_dimension(&silver, &codes);
        assert_eq!(dims.len(), 2);

        let a = &dims[0];
        assert_eq!(a.key.code, "A");
        assert_eq!(a.strike, Some(352.5));
        assert_eq!(a.first_seen_ts, 1_000);
        assert_eq!(a.last_seen_ts, 5_000);
        assert_eq!(a.ref_strike, Some(350.0));

        let b = &dims[1];
        assert_eq!(b.strike, None);
        assert_eq!(b.ref_strike, Some(357.5));
        assert_eq!(b.lastday, Some(20251211));
        assert_eq!(b.effective_strike(), Some(357.5));
    }
}
