//! Fixed-width bar building from silver ticks.
//!
//! Builds per-instrument OHLC bars where open and close follow event time,
//! so the result does not depend on the order ticks are fed in.

use std::collections::BTreeMap;
use tickhouse_core::config::{BarConfig, VolumeField};
use tickhouse_core::{bucket_start, Bar, InstrumentKey, SilverTick, TimestampMs};
use tracing::debug;

/// Builder for fixed-width bars from silver ticks.
pub struct BarBuilder {
    /// Bars being built, keyed by instrument and bucket start.
    bars: BTreeMap<(InstrumentKey, TimestampMs), BarInProgress>,
    bucket_seconds: u32,
    volume_field: VolumeField,
    /// Ticks skipped because they carry no price.
    skipped: u64,
}

/// A bar that's currently being built.
#[derive(Debug, Clone)]
struct BarInProgress {
    strike: Option<f64>,
    /// (event time, price) of the earliest tick.
    open: (TimestampMs, f64),
    /// (event time, price) of the latest tick.
    close: (TimestampMs, f64),
    high: f64,
    low: f64,
    tick_count: u32,
    volume: i64,
    oi_last: Option<f64>,
}

impl BarInProgress {
    fn new(ts: TimestampMs, price: f64, strike: Option<f64>, volume: i64, oi: Option<f64>) -> Self {
        Self {
            strike,
            open: (ts, price),
            close: (ts, price),
            high: price,
            low: price,
            tick_count: 1,
            volume,
            oi_last: oi,
        }
    }

    fn add_tick(&mut self, ts: TimestampMs, price: f64, strike: Option<f64>, volume: i64, oi: Option<f64>) {
        if ts < self.open.0 {
            self.open = (ts, price);
        }
        if ts >= self.close.0 {
            self.close = (ts, price);
            self.oi_last = oi;
        }
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.strike = match (self.strike, strike) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        // counters come straight from the export and may be arbitrarily large
        self.tick_count = self.tick_count.saturating_add(1);
        self.volume = self.volume.saturating_add(volume);
    }

    fn to_bar(&self, key: &InstrumentKey, bar_ts: TimestampMs) -> Bar {
        Bar {
            key: key.clone(),
            strike: self.strike,
            bar_ts,
            open: self.open.1,
            high: self.high,
            low: self.low,
            close: self.close.1,
            tick_count: self.tick_count,
            volume: self.volume,
            oi_last: self.oi_last,
        }
    }
}

impl BarBuilder {
    /// Create a new bar builder.
    pub fn new(config: &BarConfig) -> Self {
        Self {
            bars: BTreeMap::new(),
            bucket_seconds: config.bucket_seconds,
            volume_field: config.volume_field,
            skipped: 0,
        }
    }

    /// Add a silver tick. Ticks without a price do not form bars.
    pub fn add_tick(&mut self, tick: &SilverTick) {
        let Some(price) = tick.price else {
            self.skipped += 1;
            return;
        };
        let volume = match self.volume_field {
            VolumeField::Tcnt => tick.tcnt,
            VolumeField::Ccnt => tick.ccnt,
        }
        .unwrap_or(0);
        let bar_ts = bucket_start(tick.ts_utc, self.bucket_seconds);

        self.bars
            .entry((tick.key.clone(), bar_ts))
            .and_modify(|bar| bar.add_tick(tick.ts_utc, price, tick.strike, volume, tick.oi))
            .or_insert_with(|| BarInProgress::new(tick.ts_utc, price, tick.strike, volume, tick.oi));
    }

    /// Add multiple silver ticks.
    pub fn add_ticks(&mut self, ticks: &[SilverTick]) {
        for tick in ticks {
            self.add_tick(tick);
        }
    }

    /// Get the number of bars currently being built.
    pub fn pending_bar_count(&self) -> usize {
        self.bars.len()
    }

    /// Ticks skipped for lack of a price.
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped
    }

    /// Emit all bars, ordered by instrument then bucket start.
    pub fn finish(self) -> Vec<Bar> {
        debug!(bars = self.bars.len(), skipped = self.skipped, "finished bars");
        self.bars
            .iter()
            .map(|((key, bar_ts), bar)| bar.to_bar(key, *bar_ts))
            .collect()
    }
}

/// Aggregate ticks into bars in one call.
pub fn build_bars(ticks: &[SilverTick], config: &BarConfig) -> Vec<Bar> {
    let mut builder = BarBuilder::new(config);
    builder.add_ticks(ticks);
    builder.finish()
}
