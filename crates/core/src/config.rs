//! Configuration structures for the tickhouse pipeline.

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration passed explicitly into every stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Table naming.
    pub tables: TableConfig,
    /// XML ingestion.
    pub ingest: IngestConfig,
    /// Bar aggregation.
    pub bars: BarConfig,
    /// Feature derivation.
    pub features: FeatureConfig,
    /// Label derivation.
    pub labels: LabelConfig,
    /// Retry policy for transient store errors.
    pub retry: RetryConfig,
    /// Drift monitoring.
    pub drift: DriftConfig,
}

impl Config {
    /// Load from a JSON file. Missing sections keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject parameter combinations no stage can run with.
    pub fn validate(&self) -> Result<()> {
        if self.tables.catalog.is_empty() || self.tables.namespace.is_empty() {
            return Err(Error::config("catalog and namespace must be non-empty"));
        }
        if self.bars.bucket_seconds == 0 {
            return Err(Error::config("bars.bucket_seconds must be positive"));
        }
        if !(-18..=18).contains(&self.ingest.exchange_utc_offset_hours) {
            return Err(Error::config("ingest.exchange_utc_offset_hours out of range"));
        }
        check_horizons("features.return_lags", &self.features.return_lags)?;
        check_horizons("features.oi_change_lags", &self.features.oi_change_lags)?;
        check_horizons("labels.horizons", &self.labels.horizons)?;
        if self.features.momentum_lag == 0 {
            return Err(Error::config("features.momentum_lag must be positive"));
        }
        if self.features.volatility_windows.iter().any(|&w| w < 2) {
            return Err(Error::config("features.volatility_windows entries must be >= 2"));
        }
        let d = &self.drift;
        if d.psi_warning < 0.0 || d.psi_critical < d.psi_warning {
            return Err(Error::config("drift thresholds must satisfy 0 <= warning <= critical"));
        }
        if !(0.0..=1.0).contains(&d.critical_feature_ratio) {
            return Err(Error::config("drift.critical_feature_ratio must be within [0, 1]"));
        }
        if d.bins < 2 {
            return Err(Error::config("drift.bins must be >= 2"));
        }
        Ok(())
    }
}

fn check_horizons(name: &str, horizons: &[usize]) -> Result<()> {
    if horizons.is_empty() {
        return Err(Error::config(format!("{name} must not be empty")));
    }
    if horizons.contains(&0) {
        return Err(Error::config(format!("{name} entries must be positive")));
    }
    let mut sorted = horizons.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() != horizons.len() {
        return Err(Error::config(format!("{name} contains duplicates")));
    }
    Ok(())
}

/// Table naming: `<catalog>.<namespace>.<layer>_<entity>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub catalog: String,
    pub namespace: String,
    pub bronze_ticks: String,
    pub bronze_codes: String,
    pub silver_ticks: String,
    pub silver_dim_contract: String,
    pub gold_bars: String,
    pub gold_features: String,
    pub gold_labels: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            catalog: "lakehouse".to_string(),
            namespace: "options".to_string(),
            bronze_ticks: "bronze_ticks".to_string(),
            bronze_codes: "bronze_codes".to_string(),
            silver_ticks: "silver_ticks".to_string(),
            silver_dim_contract: "silver_dim_contract".to_string(),
            gold_bars: "gold_bars_1m".to_string(),
            gold_features: "gold_features_1m".to_string(),
            gold_labels: "gold_labels_1m".to_string(),
        }
    }
}

impl TableConfig {
    /// Fully qualify a table name unless it already is.
    pub fn qualify(&self, table: &str) -> String {
        if table.contains('.') {
            table.to_string()
        } else {
            format!("{}.{}.{}", self.catalog, self.namespace, table)
        }
    }
}

/// XML ingestion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Offset applied to exchange-local timestamps without an explicit offset.
    pub exchange_utc_offset_hours: i32,
    /// Infer field types from each document instead of using the fixed
    /// tick/code layouts.
    pub infer_schema: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            // Asia/Seoul, no daylight saving.
            exchange_utc_offset_hours: 9,
            infer_schema: false,
        }
    }
}

/// Which tick counter feeds bar volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeField {
    Tcnt,
    Ccnt,
}

/// Bar aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BarConfig {
    /// Bucket width in seconds.
    pub bucket_seconds: u32,
    /// Counter summed into bar volume.
    pub volume_field: VolumeField,
}

impl Default for BarConfig {
    fn default() -> Self {
        Self {
            bucket_seconds: 60,
            volume_field: VolumeField::Tcnt,
        }
    }
}

/// Feature derivation configuration. All horizons are in bars.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Lags for `ret_k`.
    pub return_lags: Vec<usize>,
    /// Lag for `mom_m`.
    pub momentum_lag: usize,
    /// Trailing windows for `vol_w`.
    pub volatility_windows: Vec<usize>,
    /// Lags for `oi_chg_k`.
    pub oi_change_lags: Vec<usize>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            return_lags: vec![1, 5],
            momentum_lag: 15,
            volatility_windows: vec![30, 120],
            oi_change_lags: vec![5],
        }
    }
}

/// Label derivation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelConfig {
    /// Forward horizons for `y_ret_h` / `y_dir_h`.
    pub horizons: Vec<usize>,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            horizons: vec![5, 15, 30],
        }
    }
}

/// Retry configuration for transient store errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
            jitter_pct: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_pct,
        )
    }
}

/// Drift monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Feature columns to score.
    pub key_features: Vec<String>,
    /// Score at or above which a feature warns.
    pub psi_warning: f64,
    /// Score at or above which a feature is critical.
    pub psi_critical: f64,
    /// Share of critical features that makes the report critical.
    pub critical_feature_ratio: f64,
    /// Number of baseline quantile bins.
    pub bins: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            key_features: vec![
                "ret_1".to_string(),
                "ret_5".to_string(),
                "vol_30".to_string(),
                "oi_chg_5".to_string(),
            ],
            psi_warning: 0.1,
            psi_critical: 0.25,
            critical_feature_ratio: 0.3,
            bins: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bars.bucket_seconds, 60);
        assert_eq!(config.features.return_lags, vec![1, 5]);
        assert_eq!(config.labels.horizons, vec![5, 15, 30]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_qualify_table() {
        let tables = TableConfig::default();
        assert_eq!(tables.qualify("silver_ticks"), "lakehouse.options.silver_ticks");
        assert_eq!(tables.qualify("other.ns.t"), "other.ns.t");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"bars": {"bucket_seconds": 300, "volume_field": "ccnt"}}"#)
                .unwrap();
        assert_eq!(config.bars.bucket_seconds, 300);
        assert_eq!(config.bars.volume_field, VolumeField::Ccnt);
        assert_eq!(config.tables.catalog, "lakehouse");
        assert_eq!(config.features.momentum_lag, 15);
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        let mut config = Config::default();
        config.bars.bucket_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.labels.horizons = vec![5, 0];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.features.return_lags = vec![1, 1];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.drift.psi_critical = 0.05;
        assert!(config.validate().is_err());
    }
}
