//! Feature drift monitoring.
//!
//! Scores each key feature with a population stability index (PSI) between a
//! baseline window and a current window of the gold feature table.

use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};
use std::collections::BTreeMap;
use tickhouse_core::config::DriftConfig;
use tickhouse_core::{Error, FeatureFrame, Result};
use tracing::{info, warn};

/// Proportion floor so empty bins do not blow up the log term.
const MIN_PROPORTION: f64 = 1e-6;

/// Drift result for the whole feature set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    /// Any feature at or above the warning threshold.
    pub warning: bool,
    /// Share of critical features reached the configured ratio.
    pub critical: bool,
    pub critical_ratio: f64,
    /// PSI per scored feature.
    pub feature_scores: BTreeMap<String, f64>,
    /// Features with too few observations on either side.
    pub skipped: Vec<String>,
}

/// Bin edges at baseline quantiles. Duplicate edges collapse.
fn quantile_edges(baseline: &[f64], bins: usize) -> Vec<f64> {
    let mut data = Data::new(baseline.to_vec());
    let mut edges: Vec<f64> = (1..bins)
        .map(|k| data.quantile(k as f64 / bins as f64))
        .collect();
    edges.dedup_by(|a, b| a == b);
    edges
}

fn proportions(values: &[f64], edges: &[f64]) -> Vec<f64> {
    let mut counts = vec![0usize; edges.len() + 1];
    for &v in values {
        counts[edges.partition_point(|&e| e <= v)] += 1;
    }
    counts
        .into_iter()
        .map(|c| (c as f64 / values.len() as f64).max(MIN_PROPORTION))
        .collect()
}

/// Population stability index of `current` against `baseline`.
///
/// `None` when either side has fewer than two observations.
pub fn psi(baseline: &[f64], current: &[f64], bins: usize) -> Option<f64> {
    if baseline.len() < 2 || current.len() < 2 {
        return None;
    }
    let edges = quantile_edges(baseline, bins.max(2));
    let expected = proportions(baseline, &edges);
    let actual = proportions(current, &edges);
    Some(
        expected
            .iter()
            .zip(&actual)
            .map(|(e, a)| (a - e) * (a / e).ln())
            .sum(),
    )
}

/// Compares feature distributions between two windows.
pub struct DriftMonitor {
    config: DriftConfig,
}

impl DriftMonitor {
    pub fn new(config: &DriftConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn evaluate(&self, baseline: &FeatureFrame, current: &FeatureFrame) -> Result<DriftReport> {
        let mut scores = BTreeMap::new();
        let mut skipped = Vec::new();

        for feature in &self.config.key_features {
            if baseline.column_index(feature).is_none() {
                return Err(Error::schema_mismatch("baseline features", feature));
            }
            if current.column_index(feature).is_none() {
                return Err(Error::schema_mismatch("current features", feature));
            }
            let b = baseline.column_values(feature);
            let c = current.column_values(feature);
            match psi(&b, &c, self.config.bins) {
                Some(score) => {
                    scores.insert(feature.clone(), score);
                }
                None => {
                    warn!(%feature, baseline = b.len(), current = c.len(), "too few observations for drift");
                    skipped.push(feature.clone());
                }
            }
        }

        let critical_count = scores.values().filter(|&&s| s >= self.config.psi_critical).count();
        let critical_ratio = critical_count as f64 / self.config.key_features.len().max(1) as f64;
        let report = DriftReport {
            warning: scores.values().any(|&s| s >= self.config.psi_warning),
            critical: critical_count > 0 && critical_ratio >= self.config.critical_feature_ratio,
            critical_ratio,
            feature_scores: scores,
            skipped,
        };
        info!(
            warning = report.warning,
            critical = report.critical,
            critical_ratio = report.critical_ratio,
            "drift evaluated"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickhouse_core::{FeatureRow, InstrumentKey, Side};

    fn frame(values: &[f64]) -> FeatureFrame {
        FeatureFrame {
            columns: vec!["ret_1".to_string()],
            rows: values
                .iter()
                .enumerate()
                .map(|(i, &v)| FeatureRow {
                    key: InstrumentKey::new("202512", Side::Call, "A"),
                    strike: None,
                    bar_ts: i as i64,
                    values: vec![Some(v)],
                })
                .collect(),
        }
    }

    fn config() -> DriftConfig {
        DriftConfig {
            key_features: vec!["ret_1".to_string()],
            ..DriftConfig::default()
        }
    }

    #[test]
    fn test_identical_distributions_have_zero_psi() {
        let values: Vec<f64> = (0..200).map(|i| i as f64).collect();
        let score = psi(&values, &values, 10).unwrap();
        assert!(score.abs() < 1e-12);
    }

    #[test]
    fn test_shifted_distribution_is_critical() {
        let baseline: Vec<f64> = (0..200).map(|i| i as f64).collect();
        let current: Vec<f64> = (0..200).map(|i| 500.0 + i as f64).collect();
        let report = DriftMonitor::new(&config())
            .evaluate(&frame(&baseline), &frame(&current))
            .unwrap();
        assert!(report.warning);
        assert!(report.critical);
        assert_eq!(report.critical_ratio, 1.0);
    }

    #[test]
    fn test_short_windows_are_skipped() {
        let report = DriftMonitor::new(&config())
            .evaluate(&frame(&[1.0]), &frame(&[1.0, 2.0]))
            .unwrap();
        assert_eq!(report.skipped, vec!["ret_1"]);
        assert!(!report.warning);
        assert!(!report.critical);
    }

    #[test]
    fn test_unknown_feature_is_schema_mismatch() {
        let mut cfg = config();
        cfg.key_features = vec!["vol_30".to_string()];
        let err = DriftMonitor::new(&cfg)
            .evaluate(&frame(&[1.0, 2.0]), &frame(&[1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
    }
}
