//! Forward-looking labels.
//!
//! Labels at bar `i` read only bars strictly after `i`. Rows within `h` bars
//! of the end of a series have no `y_ret_h`; that is expected, not an error.

use crate::engine::{instrument_series, log_return};
use tickhouse_core::config::LabelConfig;
use tickhouse_core::{Bar, LabelFrame, LabelRow, Result};
use tracing::debug;

/// Map a forward return onto {+1, 0, -1}.
#[inline]
pub fn direction(ret: f64) -> i8 {
    if ret > 0.0 {
        1
    } else if ret < 0.0 {
        -1
    } else {
        0
    }
}

/// Derives forward returns and directions per instrument.
pub struct LabelDeriver {
    horizons: Vec<usize>,
}

impl LabelDeriver {
    pub fn new(config: &LabelConfig) -> Self {
        Self {
            horizons: config.horizons.clone(),
        }
    }

    pub fn derive(&self, bars: &[Bar]) -> Result<LabelFrame> {
        let series = instrument_series(bars)?;
        let mut rows = Vec::with_capacity(bars.len());

        for (key, series) in &series {
            for (i, bar) in series.iter().enumerate() {
                let returns: Vec<Option<f64>> = self
                    .horizons
                    .iter()
                    .map(|&h| {
                        series
                            .get(i + h)
                            .and_then(|ahead| log_return(ahead.close, bar.close))
                    })
                    .collect();
                let directions = returns.iter().map(|r| r.map(direction)).collect();
                rows.push(LabelRow {
                    key: key.clone(),
                    strike: bar.strike,
                    bar_ts: bar.bar_ts,
                    returns,
                    directions,
                });
            }
        }

        debug!(instruments = series.len(), rows = rows.len(), "derived labels");
        Ok(LabelFrame {
            horizons: self.horizons.clone(),
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tickhouse_core::{InstrumentKey, Side};

    fn make_bars(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                key: InstrumentKey::new("202512", Side::Put, "B0125P"),
                strike: None,
                bar_ts: i as i64 * 60_000,
                open: close,
                high: close,
                low: close,
                close,
                tick_count: 1,
                volume: 0,
                oi_last: None,
            })
            .collect()
    }

    #[test]
    fn test_forward_returns() {
        let bars = make_bars(&[100.0, 102.0, 101.0, 105.0, 103.0]);
        let labels = LabelDeriver::new(&LabelConfig { horizons: vec![4] })
            .derive(&bars)
            .unwrap();

        assert_relative_eq!(labels.rows[0].returns[0].unwrap(), (103.0f64 / 100.0).ln());
        assert_eq!(labels.rows[0].directions[0], Some(1));
        // nothing 4 bars ahead of the last row
        assert_eq!(labels.rows[4].returns[0], None);
        assert_eq!(labels.rows[4].directions[0], None);
        assert_eq!(labels.rows[1].returns[0], None);
    }

    #[test]
    fn test_trailing_rows_are_null() {
        let bars = make_bars(&[1.0; 10]);
        let labels = LabelDeriver::new(&LabelConfig { horizons: vec![3, 5] })
            .derive(&bars)
            .unwrap();
        let nulls_h3 = labels.rows.iter().filter(|r| r.returns[0].is_none()).count();
        let nulls_h5 = labels.rows.iter().filter(|r| r.returns[1].is_none()).count();
        assert_eq!(nulls_h3, 3);
        assert_eq!(nulls_h5, 5);
        // flat prices: zero return, zero direction
        assert_eq!(labels.rows[0].returns[0], Some(0.0));
        assert_eq!(labels.rows[0].directions[0], Some(0));
    }

    #[test]
    fn test_direction_mapping() {
        assert_eq!(direction(0.0), 0);
        assert_eq!(direction(-0.0), 0);
        assert_eq!(direction(1e-12), 1);
        assert_eq!(direction(-0.5), -1);
    }
}
