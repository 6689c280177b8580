//! Supervised training matrix export.
//!
//! Joins feature rows with one label column on `(instrument, bar_ts)` and
//! drops rows whose label is unknown.

use std::collections::BTreeMap;
use std::io::Write;
use tickhouse_core::{format_ts, Error, FeatureFrame, InstrumentKey, LabelFrame, Result, TimestampMs};

/// Feature matrix plus one target column.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSet {
    pub feature_columns: Vec<String>,
    pub label_column: String,
    pub rows: Vec<TrainingRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRow {
    pub key: InstrumentKey,
    pub bar_ts: TimestampMs,
    pub features: Vec<Option<f64>>,
    pub label: f64,
}

impl TrainingSet {
    /// Join `features` with `label_column` (`y_ret_h` or `y_dir_h`) of `labels`.
    pub fn build(features: &FeatureFrame, labels: &LabelFrame, label_column: &str) -> Result<Self> {
        let columns = labels.column_names();
        let idx = columns
            .iter()
            .position(|c| c == label_column)
            .ok_or_else(|| Error::schema_mismatch("labels", label_column))?;
        let n = labels.horizons.len();

        let targets: BTreeMap<(&InstrumentKey, TimestampMs), f64> = labels
            .rows
            .iter()
            .filter_map(|row| {
                let value = if idx < n {
                    row.returns[idx]
                } else {
                    row.directions[idx - n].map(f64::from)
                };
                value.map(|v| ((&row.key, row.bar_ts), v))
            })
            .collect();

        let rows = features
            .rows
            .iter()
            .filter_map(|row| {
                targets.get(&(&row.key, row.bar_ts)).map(|&label| TrainingRow {
                    key: row.key.clone(),
                    bar_ts: row.bar_ts,
                    features: row.values.clone(),
                    label,
                })
            })
            .collect();

        Ok(Self {
            feature_columns: features.columns.clone(),
            label_column: label_column.to_string(),
            rows,
        })
    }

    /// Write as CSV with a header row. Null features are empty cells.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let mut out = csv::Writer::from_writer(writer);
        let mut header = vec!["ymcode".to_string(), "side".to_string(), "code".to_string(), "bar_ts".to_string()];
        header.extend(self.feature_columns.iter().cloned());
        header.push(self.label_column.clone());
        out.write_record(&header).map_err(std::io::Error::from)?;

        for row in &self.rows {
            let mut record = vec![
                row.key.ymcode.clone(),
                row.key.side.to_string(),
                row.key.code.clone(),
                format_ts(row.bar_ts),
            ];
            record.extend(row.features.iter().map(|v| v.map(|x| x.to_string()).unwrap_or_default()));
            record.push(row.label.to_string());
            out.write_record(&record).map_err(std::io::Error::from)?;
        }
        out.flush()?;
        Ok(self.rows.len())
    }
}
