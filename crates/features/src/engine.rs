//! Feature computation engine.
//!
//! Turns gold bars into per-instrument, per-bar feature rows. Every value at
//! bar `i` reads only bars `0..=i` of the same instrument.

use crate::volatility::TrailingVolatility;
use std::collections::BTreeMap;
use tickhouse_core::config::FeatureConfig;
use tickhouse_core::{format_ts, Bar, Error, FeatureFrame, FeatureRow, InstrumentKey, Result};
use tracing::debug;

/// Bars of one instrument in strictly increasing `bar_ts` order.
pub type Series<'a> = (InstrumentKey, Vec<&'a Bar>);

/// Group bars by instrument and sort each group by bar timestamp.
///
/// Fails if an instrument has two bars with the same timestamp, since lag
/// and lead offsets would then be ambiguous.
pub fn instrument_series(bars: &[Bar]) -> Result<Vec<Series<'_>>> {
    let mut groups: BTreeMap<&InstrumentKey, Vec<&Bar>> = BTreeMap::new();
    for bar in bars {
        groups.entry(&bar.key).or_default().push(bar);
    }
    groups
        .into_iter()
        .map(|(key, mut series)| {
            series.sort_by_key(|b| b.bar_ts);
            if let Some(pair) = series.windows(2).find(|w| w[0].bar_ts == w[1].bar_ts) {
                return Err(Error::malformed(format!(
                    "duplicate bar for {key} at {}",
                    format_ts(pair[0].bar_ts)
                )));
            }
            Ok((key.clone(), series))
        })
        .collect()
}

/// `ln(now / then)` when defined.
#[inline]
pub fn log_return(now: f64, then: f64) -> Option<f64> {
    if then == 0.0 {
        return None;
    }
    let ratio = now / then;
    (ratio > 0.0 && ratio.is_finite()).then(|| ratio.ln())
}

/// Feature computation engine.
pub struct FeatureEngine {
    return_lags: Vec<usize>,
    momentum_lag: usize,
    volatility_windows: Vec<usize>,
    oi_change_lags: Vec<usize>,
}

impl FeatureEngine {
    /// Create a new feature engine from configuration.
    pub fn new(config: &FeatureConfig) -> Self {
        Self {
            return_lags: config.return_lags.clone(),
            momentum_lag: config.momentum_lag,
            volatility_windows: config.volatility_windows.clone(),
            oi_change_lags: config.oi_change_lags.clone(),
        }
    }

    /// Output column names, in value order.
    pub fn columns(&self) -> Vec<String> {
        let mut cols: Vec<String> = self.return_lags.iter().map(|k| format!("ret_{k}")).collect();
        cols.push(format!("mom_{}", self.momentum_lag));
        cols.extend(self.volatility_windows.iter().map(|w| format!("vol_{w}")));
        cols.extend(self.oi_change_lags.iter().map(|k| format!("oi_chg_{k}")));
        cols.push("range_1".to_string());
        cols.push("volume".to_string());
        cols.push("oi_last".to_string());
        cols
    }

    /// Compute features for every bar.
    pub fn derive(&self, bars: &[Bar]) -> Result<FeatureFrame> {
        let series = instrument_series(bars)?;
        let mut rows = Vec::with_capacity(bars.len());
        for (key, series) in &series {
            self.derive_series(key, series, &mut rows);
        }
        debug!(instruments = series.len(), rows = rows.len(), "derived features");
        Ok(FeatureFrame {
            columns: self.columns(),
            rows,
        })
    }

    fn derive_series(&self, key: &InstrumentKey, bars: &[&Bar], out: &mut Vec<FeatureRow>) {
        let close = |i: usize| bars[i].close;
        let lagged = |i: usize, k: usize| i.checked_sub(k);
        let width = self.columns().len();

        let mut vols: Vec<TrailingVolatility> = self
            .volatility_windows
            .iter()
            .map(|&w| TrailingVolatility::new(w))
            .collect();

        for (i, bar) in bars.iter().enumerate() {
            let mut values = Vec::with_capacity(width);

            for &k in &self.return_lags {
                values.push(lagged(i, k).and_then(|j| log_return(close(i), close(j))));
            }

            values.push(
                lagged(i, self.momentum_lag)
                    .filter(|&j| close(j) != 0.0)
                    .map(|j| close(i) / close(j) - 1.0),
            );

            // window covers [i-w, i-1]: read before pushing this bar's return
            for vol in &vols {
                values.push(vol.volatility());
            }
            let ret_1 = lagged(i, 1).and_then(|j| log_return(close(i), close(j)));
            for vol in &mut vols {
                vol.push(ret_1);
            }

            for &k in &self.oi_change_lags {
                values.push(
                    lagged(i, k).and_then(|j| match (bar.oi_last, bars[j].oi_last) {
                        (Some(now), Some(then)) => Some(now - then),
                        _ => None,
                    }),
                );
            }

            values.push((bar.close != 0.0).then(|| (bar.high - bar.low) / bar.close));
            values.push(Some(bar.volume as f64));
            values.push(bar.oi_last);

            out.push(FeatureRow {
                key: key.clone(),
                strike: bar.strike,
                bar_ts: bar.bar_ts,
                values,
            });
        }
    }
}
