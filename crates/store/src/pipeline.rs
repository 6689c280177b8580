//! Stage entry points.
//!
//! Every stage reads its inputs, computes its complete output in memory and
//! only then opens a single write transaction. Re-running a stage with the
//! same range and parameters reproduces the same rows.

use crate::catalog::{Catalog, TableWrite, WriteMode};
use crate::tables::{
    feature_row, feature_schema, feature_values, label_row, label_schema, label_values,
    stored_feature_columns, stored_label_horizons, TableRow, KEY_COLUMNS,
};
use chrono::Utc;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tickhouse_core::{
    Bar, CodeRow, Config, ContractDim, Error, FeatureFrame, LabelFrame, RawTick, Result, Side,
    SilverTick, StageSummary, TimeRange,
};
use tickhouse_features::{DriftMonitor, DriftReport, FeatureEngine, LabelDeriver, TrainingSet};
use tickhouse_ingestion::{derive_dimension, normalize_ticks, BarBuilder, RowSchema, XmlLoader};
use tracing::{info, warn};

fn ordered_by(time_column: &'static str) -> [&'static str; 4] {
    ["ymcode", "side", "code", time_column]
}

/// The lakehouse pipeline bound to one catalog and one configuration.
pub struct Pipeline {
    catalog: Catalog,
    config: Config,
}

impl Pipeline {
    pub fn new(catalog: Catalog, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { catalog, config })
    }

    /// Open an on-disk catalog with the configured retry policy.
    pub fn open(path: &Path, config: Config) -> Result<Self> {
        let catalog = Catalog::open(path, config.retry.policy())?;
        Self::new(catalog, config)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn table(&self, name: &str) -> String {
        self.config.tables.qualify(name)
    }

    fn read<T: TableRow>(&self, table: &str, range: &TimeRange, order_by: &[&str]) -> Result<Vec<T>> {
        self.catalog.query(table, &T::schema(), range, order_by, T::from_row)
    }

    /// Bronze ticks in append order.
    pub fn bronze_ticks(&self, range: &TimeRange) -> Result<Vec<RawTick>> {
        self.read(&self.table(&self.config.tables.bronze_ticks), range, &["rowid"])
    }

    /// Bronze code rows in append order.
    pub fn bronze_codes(&self) -> Result<Vec<CodeRow>> {
        self.read(&self.table(&self.config.tables.bronze_codes), &TimeRange::all(), &["rowid"])
    }

    pub fn silver_ticks(&self, range: &TimeRange) -> Result<Vec<SilverTick>> {
        self.read(&self.table(&self.config.tables.silver_ticks), range, &ordered_by("ts_utc"))
    }

    pub fn contract_dims(&self) -> Result<Vec<ContractDim>> {
        self.read(
            &self.table(&self.config.tables.silver_dim_contract),
            &TimeRange::all(),
            &KEY_COLUMNS,
        )
    }

    pub fn bars(&self, range: &TimeRange) -> Result<Vec<Bar>> {
        self.read(&self.table(&self.config.tables.gold_bars), range, &ordered_by("bar_ts"))
    }

    /// Stored feature rows in `range`, with whatever columns the table has.
    pub fn features(&self, range: &TimeRange) -> Result<FeatureFrame> {
        let table = self.table(&self.config.tables.gold_features);
        if !self.catalog.table_exists(&table)? {
            return Ok(FeatureFrame::default());
        }
        let columns = stored_feature_columns(&table, &self.catalog.table_columns(&table)?)?;
        let width = columns.len();
        let rows = self.catalog.query(
            &table,
            &feature_schema(&columns),
            range,
            &ordered_by("bar_ts"),
            |row| feature_row(row, width),
        )?;
        Ok(FeatureFrame { columns, rows })
    }

    /// Stored label rows in `range`.
    pub fn labels(&self, range: &TimeRange) -> Result<LabelFrame> {
        let table = self.table(&self.config.tables.gold_labels);
        if !self.catalog.table_exists(&table)? {
            return Ok(LabelFrame::default());
        }
        let horizons = stored_label_horizons(&table, &self.catalog.table_columns(&table)?)?;
        let n = horizons.len();
        let rows = self.catalog.query(
            &table,
            &label_schema(&horizons),
            range,
            &ordered_by("bar_ts"),
            |row| label_row(row, n),
        )?;
        Ok(LabelFrame { horizons, rows })
    }

    /// XML loader with `schema`, unless the configuration asks for inference.
    fn loader(&self, schema: RowSchema) -> Result<XmlLoader> {
        let loader = XmlLoader::new(&self.config.ingest)?;
        if self.config.ingest.infer_schema {
            Ok(loader)
        } else {
            Ok(loader.with_schema(schema))
        }
    }

    /// Append tick exports to bronze. All files are parsed before anything
    /// is written; one bad file fails the whole load.
    pub fn ingest_ticks(&mut self, paths: &[PathBuf], side: Option<Side>) -> Result<StageSummary> {
        let started = Instant::now();
        if paths.is_empty() {
            return Err(Error::config("no input files"));
        }
        let mut summary = StageSummary::new("ingest_ticks", TimeRange::all());
        let loader = self.loader(RowSchema::ticks())?;
        let ingest_ts = Utc::now().timestamp_millis();

        let mut ticks = Vec::new();
        for path in paths {
            let loaded = loader.load_ticks(path, side, ingest_ts)?;
            summary.metric(format!("rows.{}", loaded.meta.source_file), loaded.rows.len() as f64);
            ticks.extend(loaded.rows);
        }
        summary.rows_read = ticks.len() as u64;
        summary.observe_span(ticks.iter().map(|t| t.ts_utc));

        let table = self.table(&self.config.tables.bronze_ticks);
        let rows = ticks.iter().map(TableRow::to_values).collect();
        let written = self.catalog.append(&table, &RawTick::schema(), rows)?;
        summary.wrote(table.as_str(), written);
        summary.metric("files", paths.len() as f64);
        summary.duration_ms = started.elapsed().as_millis() as u64;

        info!(%table, files = paths.len(), rows = written, "ingested ticks");
        Ok(summary)
    }

    /// Append code exports to bronze.
    pub fn ingest_codes(&mut self, paths: &[PathBuf], side: Option<Side>) -> Result<StageSummary> {
        let started = Instant::now();
        if paths.is_empty() {
            return Err(Error::config("no input files"));
        }
        let mut summary = StageSummary::new("ingest_codes", TimeRange::all());
        let loader = self.loader(RowSchema::codes())?;
        let ingest_ts = Utc::now().timestamp_millis();

        let mut codes = Vec::new();
        for path in paths {
            codes.extend(loader.load_codes(path, side, ingest_ts)?.rows);
        }
        summary.rows_read = codes.len() as u64;

        let table = self.table(&self.config.tables.bronze_codes);
        let rows = codes.iter().map(TableRow::to_values).collect();
        let written = self.catalog.append(&table, &CodeRow::schema(), rows)?;
        summary.wrote(table.as_str(), written);
        summary.metric("files", paths.len() as f64);
        summary.duration_ms = started.elapsed().as_millis() as u64;

        info!(%table, files = paths.len(), rows = written, "ingested codes");
        Ok(summary)
    }

    /// Bronze to silver for `range`, then rebuild the contract dimension from
    /// all silver ticks.
    pub fn normalize(&mut self, range: TimeRange) -> Result<StageSummary> {
        let started = Instant::now();
        let mut summary = StageSummary::new("normalize", range);

        let bronze = self.bronze_ticks(&range)?;
        if bronze.is_empty() {
            warn!(%range, "no bronze ticks in range");
        }
        let (silver, stats) = normalize_ticks(&bronze);
        summary.rows_read = stats.input_rows;
        summary.metric("duplicates", stats.duplicates as f64);

        // dimension covers every silver tick, not only this range
        let mut all_silver: Vec<SilverTick> = if range.is_bounded() {
            self.silver_ticks(&TimeRange::all())?
                .into_iter()
                .filter(|t| !range.contains(t.ts_utc))
                .collect()
        } else {
            Vec::new()
        };
        all_silver.extend(silver.iter().cloned());
        let codes = self.bronze_codes()?;
        let dims = derive_dimension(&all_silver, &codes);

        let silver_table = self.table(&self.config.tables.silver_ticks);
        let dim_table = self.table(&self.config.tables.silver_dim_contract);
        let writes = [
            TableWrite::new(
                silver_table.as_str(),
                SilverTick::schema(),
                WriteMode::OverwriteRange(range),
                silver.iter().map(TableRow::to_values).collect(),
            ),
            TableWrite::new(
                dim_table.as_str(),
                ContractDim::schema(),
                WriteMode::OverwriteAll,
                dims.iter().map(TableRow::to_values).collect(),
            ),
        ];
        let counts = self.catalog.commit(&writes)?;

        summary.wrote(silver_table.as_str(), counts[0]);
        summary.wrote(dim_table.as_str(), counts[1]);
        summary.observe_span(silver.iter().map(|t| t.ts_utc));
        summary.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            %range,
            read = stats.input_rows,
            silver = counts[0],
            duplicates = stats.duplicates,
            contracts = counts[1],
            "normalized ticks"
        );
        Ok(summary)
    }

    /// Silver to gold bars. The range is widened to whole buckets.
    pub fn build_bars(&mut self, range: TimeRange) -> Result<StageSummary> {
        let started = Instant::now();
        let aligned = range.align_to_buckets(self.config.bars.bucket_seconds);
        let mut summary = StageSummary::new("bars", aligned);

        let ticks = self.silver_ticks(&aligned)?;
        summary.rows_read = ticks.len() as u64;

        let mut builder = BarBuilder::new(&self.config.bars);
        builder.add_ticks(&ticks);
        let skipped = builder.skipped_ticks();
        let bars = builder.finish();
        summary.metric("skipped_ticks", skipped as f64);

        let table = self.table(&self.config.tables.gold_bars);
        let written = self.catalog.overwrite_range(
            &table,
            &Bar::schema(),
            aligned,
            bars.iter().map(TableRow::to_values).collect(),
        )?;
        summary.wrote(table.as_str(), written);
        summary.observe_span(bars.iter().map(|b| b.bar_ts));
        summary.duration_ms = started.elapsed().as_millis() as u64;

        info!(range = %aligned, ticks = ticks.len(), bars = written, skipped, "built bars");
        Ok(summary)
    }

    /// Gold bars to features and labels.
    ///
    /// Lags and leads are computed over the full bar history so rows near
    /// the range edges see their true neighbours; only rows in the range are
    /// written.
    pub fn derive_features(&mut self, range: TimeRange) -> Result<StageSummary> {
        let started = Instant::now();
        let aligned = range.align_to_buckets(self.config.bars.bucket_seconds);
        let mut summary = StageSummary::new("features", aligned);

        let bars = self.bars(&TimeRange::all())?;
        summary.rows_read = bars.len() as u64;

        let mut features = FeatureEngine::new(&self.config.features).derive(&bars)?;
        let mut labels = LabelDeriver::new(&self.config.labels).derive(&bars)?;
        features.rows.retain(|r| aligned.contains(r.bar_ts));
        labels.rows.retain(|r| aligned.contains(r.bar_ts));

        let feature_table = self.table(&self.config.tables.gold_features);
        let label_table = self.table(&self.config.tables.gold_labels);
        let writes = [
            TableWrite::new(
                feature_table.as_str(),
                feature_schema(&features.columns),
                WriteMode::OverwriteRange(aligned),
                feature_values(&features),
            ),
            TableWrite::new(
                label_table.as_str(),
                label_schema(&labels.horizons),
                WriteMode::OverwriteRange(aligned),
                label_values(&labels),
            ),
        ];
        let counts = self.catalog.commit(&writes)?;

        summary.wrote(feature_table.as_str(), counts[0]);
        summary.wrote(label_table.as_str(), counts[1]);
        summary.observe_span(features.rows.iter().map(|r| r.bar_ts));
        let unlabeled = labels
            .rows
            .iter()
            .filter(|r| r.returns.iter().any(Option::is_none))
            .count();
        summary.metric("rows_with_null_label", unlabeled as f64);
        summary.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            range = %aligned,
            bars = bars.len(),
            features = counts[0],
            labels = counts[1],
            "derived features and labels"
        );
        Ok(summary)
    }

    /// Compare stored features in `current` against `baseline`.
    pub fn check_drift(&self, baseline: TimeRange, current: TimeRange) -> Result<(StageSummary, DriftReport)> {
        let started = Instant::now();
        let mut summary = StageSummary::new("drift", current);

        let base = self.features(&baseline)?;
        let cur = self.features(&current)?;
        summary.rows_read = (base.rows.len() + cur.rows.len()) as u64;

        let report = DriftMonitor::new(&self.config.drift).evaluate(&base, &cur)?;
        for (feature, score) in &report.feature_scores {
            summary.metric(format!("psi.{feature}"), *score);
        }
        summary.metric("critical_ratio", report.critical_ratio);
        summary.status = if report.critical {
            "critical"
        } else if report.warning {
            "warning"
        } else {
            "ok"
        }
        .to_string();
        summary.report = Some(serde_json::to_value(&report)?);
        summary.duration_ms = started.elapsed().as_millis() as u64;

        info!(%baseline, %current, status = %summary.status, "checked drift");
        Ok((summary, report))
    }

    /// Write a CSV training matrix of features plus one label column.
    pub fn export_dataset(&self, range: TimeRange, label_column: &str, out: &Path) -> Result<StageSummary> {
        let started = Instant::now();
        let mut summary = StageSummary::new("dataset", range);

        let features = self.features(&range)?;
        let labels = self.labels(&range)?;
        summary.rows_read = features.rows.len() as u64;

        let set = TrainingSet::build(&features, &labels, label_column)?;
        let written = set.write_csv(BufWriter::new(File::create(out)?))?;

        summary.wrote(out.display().to_string(), written);
        summary.metric("dropped_rows", (features.rows.len() - written) as f64);
        summary.observe_span(set.rows.iter().map(|r| r.bar_ts));
        summary.duration_ms = started.elapsed().as_millis() as u64;

        info!(path = %out.display(), label = label_column, rows = written, "exported dataset");
        Ok(summary)
    }

    /// Normalize, bars and features for one range, in dependency order.
    pub fn run(&mut self, range: TimeRange) -> Result<StageSummary> {
        let started = Instant::now();
        let mut summary = StageSummary::new("run", range);
        summary.absorb(self.normalize(range)?);
        summary.absorb(self.build_bars(range)?);
        summary.absorb(self.derive_features(range)?);
        summary.duration_ms = started.elapsed().as_millis() as u64;
        Ok(summary)
    }
}
