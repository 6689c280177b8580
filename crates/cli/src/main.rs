//! `tickhouse`: one subcommand per pipeline stage.
//!
//! Logs go to stderr; stdout carries exactly one JSON summary per run.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate};
use clap::{Args, Parser, Subcommand};
use tickhouse_core::config::VolumeField;
use tickhouse_core::{Config, Side, StageSummary, TimeRange, TimestampMs};
use tickhouse_store::Pipeline;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tickhouse", version, about = "Bronze/silver/gold option tick pipeline")]
struct Cli {
    /// Catalog database file
    #[arg(long, global = true, default_value = "lakehouse.db")]
    db: PathBuf,

    /// JSON configuration file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Catalog part of qualified table names
    #[arg(long, global = true)]
    catalog: Option<String>,

    /// Namespace part of qualified table names
    #[arg(long, global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append tick XML exports to the bronze tick table
    IngestTicks(IngestArgs),
    /// Append code XML exports to the bronze code table
    IngestCodes(IngestArgs),
    /// Deduplicate bronze ticks into silver and rebuild the contract dimension
    Normalize(RangeArgs),
    /// Aggregate silver ticks into fixed-width bars
    Bars(BarArgs),
    /// Derive features and labels from bars
    Features(FeatureArgs),
    /// Score feature drift between two time ranges
    Drift(DriftArgs),
    /// Export a CSV training matrix
    Dataset(DatasetArgs),
    /// Normalize, bars and features in order
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// XML files to load
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Side for every row (default: inferred from each file name)
    #[arg(long)]
    side: Option<Side>,

    /// Exchange offset for timestamps without one
    #[arg(long, allow_hyphen_values = true)]
    utc_offset_hours: Option<i32>,

    /// Infer field types from each file instead of the fixed layouts
    #[arg(long)]
    infer_schema: bool,
}

#[derive(Args, Debug, Clone, Copy)]
struct RangeArgs {
    /// Inclusive range start (RFC 3339 or YYYY-MM-DD, UTC)
    #[arg(long, value_parser = parse_ts)]
    start: Option<TimestampMs>,

    /// Exclusive range end (RFC 3339 or YYYY-MM-DD, UTC)
    #[arg(long, value_parser = parse_ts)]
    end: Option<TimestampMs>,
}

impl RangeArgs {
    fn range(&self) -> Result<TimeRange> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start >= end {
                bail!("--start must be before --end");
            }
        }
        Ok(TimeRange::new(self.start, self.end))
    }
}

#[derive(Args, Debug)]
struct BarArgs {
    #[command(flatten)]
    range: RangeArgs,

    /// Bar width in seconds
    #[arg(long)]
    bucket_seconds: Option<u32>,

    /// Counter summed into volume: tcnt or ccnt
    #[arg(long, value_parser = parse_volume_field)]
    volume_field: Option<VolumeField>,
}

#[derive(Args, Debug)]
struct FeatureArgs {
    #[command(flatten)]
    range: RangeArgs,

    /// Bar width used to align the range
    #[arg(long)]
    bucket_seconds: Option<u32>,

    /// Lags for ret_k, comma separated
    #[arg(long, value_delimiter = ',')]
    return_lags: Option<Vec<usize>>,

    #[arg(long)]
    momentum_lag: Option<usize>,

    /// Windows for vol_w, comma separated
    #[arg(long, value_delimiter = ',')]
    volatility_windows: Option<Vec<usize>>,

    /// Lags for oi_chg_k, comma separated
    #[arg(long, value_delimiter = ',')]
    oi_change_lags: Option<Vec<usize>>,

    /// Forward horizons for y_ret_h / y_dir_h, comma separated
    #[arg(long, value_delimiter = ',')]
    label_horizons: Option<Vec<usize>>,
}

#[derive(Args, Debug)]
struct DriftArgs {
    #[arg(long, value_parser = parse_ts)]
    baseline_start: Option<TimestampMs>,

    #[arg(long, value_parser = parse_ts)]
    baseline_end: TimestampMs,

    #[arg(long, value_parser = parse_ts)]
    current_start: TimestampMs,

    #[arg(long, value_parser = parse_ts)]
    current_end: Option<TimestampMs>,

    /// Features to score, comma separated
    #[arg(long, value_delimiter = ',')]
    features: Option<Vec<String>>,

    /// Exit non-zero when the report is critical
    #[arg(long)]
    fail_on_critical: bool,
}

#[derive(Args, Debug)]
struct DatasetArgs {
    #[command(flatten)]
    range: RangeArgs,

    /// Label column to train on
    #[arg(long, default_value = "y_ret_5")]
    label: String,

    /// Output CSV path
    #[arg(long, short = 'o')]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    range: RangeArgs,

    #[arg(long)]
    bucket_seconds: Option<u32>,
}

fn parse_ts(s: &str) -> std::result::Result<TimestampMs, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or_else(|| format!("`{s}` is neither RFC 3339 nor YYYY-MM-DD"))
}

fn parse_volume_field(s: &str) -> std::result::Result<VolumeField, String> {
    match s.to_ascii_lowercase().as_str() {
        "tcnt" => Ok(VolumeField::Tcnt),
        "ccnt" => Ok(VolumeField::Ccnt),
        other => Err(format!("unknown volume field `{other}` (expected tcnt or ccnt)")),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(catalog) = &cli.catalog {
        config.tables.catalog = catalog.clone();
    }
    if let Some(namespace) = &cli.namespace {
        config.tables.namespace = namespace.clone();
    }

    match &cli.command {
        Command::IngestTicks(args) | Command::IngestCodes(args) => {
            if let Some(hours) = args.utc_offset_hours {
                config.ingest.exchange_utc_offset_hours = hours;
            }
            if args.infer_schema {
                config.ingest.infer_schema = true;
            }
        }
        Command::Bars(args) => {
            if let Some(seconds) = args.bucket_seconds {
                config.bars.bucket_seconds = seconds;
            }
            if let Some(field) = args.volume_field {
                config.bars.volume_field = field;
            }
        }
        Command::Features(args) => {
            if let Some(seconds) = args.bucket_seconds {
                config.bars.bucket_seconds = seconds;
            }
            if let Some(lags) = &args.return_lags {
                config.features.return_lags = lags.clone();
            }
            if let Some(lag) = args.momentum_lag {
                config.features.momentum_lag = lag;
            }
            if let Some(windows) = &args.volatility_windows {
                config.features.volatility_windows = windows.clone();
            }
            if let Some(lags) = &args.oi_change_lags {
                config.features.oi_change_lags = lags.clone();
            }
            if let Some(horizons) = &args.label_horizons {
                config.labels.horizons = horizons.clone();
            }
        }
        Command::Drift(args) => {
            if let Some(features) = &args.features {
                config.drift.key_features = features.clone();
            }
        }
        Command::Run(args) => {
            if let Some(seconds) = args.bucket_seconds {
                config.bars.bucket_seconds = seconds;
            }
        }
        Command::Normalize(_) | Command::Dataset(_) => {}
    }
    Ok(config)
}

fn execute(cli: &Cli, pipeline: &mut Pipeline) -> Result<StageSummary> {
    let summary = match &cli.command {
        Command::IngestTicks(args) => pipeline
            .ingest_ticks(&args.files, args.side)
            .context("tick ingestion failed")?,
        Command::IngestCodes(args) => pipeline
            .ingest_codes(&args.files, args.side)
            .context("code ingestion failed")?,
        Command::Normalize(args) => pipeline
            .normalize(args.range()?)
            .context("normalize failed")?,
        Command::Bars(args) => pipeline
            .build_bars(args.range.range()?)
            .context("bar aggregation failed")?,
        Command::Features(args) => pipeline
            .derive_features(args.range.range()?)
            .context("feature derivation failed")?,
        Command::Drift(args) => {
            let baseline = TimeRange::new(args.baseline_start, Some(args.baseline_end));
            let current = TimeRange::new(Some(args.current_start), args.current_end);
            let (summary, report) = pipeline
                .check_drift(baseline, current)
                .context("drift check failed")?;
            if args.fail_on_critical && report.critical {
                println!("{}", serde_json::to_string(&summary)?);
                bail!("feature drift is critical (ratio {:.3})", report.critical_ratio);
            }
            summary
        }
        Command::Dataset(args) => pipeline
            .export_dataset(args.range.range()?, &args.label, &args.output)
            .context("dataset export failed")?,
        Command::Run(args) => pipeline
            .run(args.range.range()?)
            .context("pipeline run failed")?,
    };
    Ok(summary)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    debug!(db = %cli.db.display(), ?config, "starting");
    let mut pipeline = Pipeline::open(&cli.db, config)
        .with_context(|| format!("failed to open catalog {}", cli.db.display()))?;

    let summary = execute(&cli, &mut pipeline)?;
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ts() {
        assert_eq!(parse_ts("2025-12-01T10:01:13+09:00").unwrap(), 1_764_550_873_000);
        assert_eq!(parse_ts("1970-01-02").unwrap(), 86_400_000);
        assert!(parse_ts("yesterday").is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "tickhouse",
            "--namespace",
            "test",
            "features",
            "--return-lags",
            "1,2,3",
            "--label-horizons",
            "10",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.tables.namespace, "test");
        assert_eq!(config.features.return_lags, vec![1, 2, 3]);
        assert_eq!(config.labels.horizons, vec![10]);
        assert_eq!(config.bars.bucket_seconds, 60);
    }

    #[test]
    fn test_ingest_side_flag() {
        let cli = Cli::parse_from(["tickhouse", "ingest-ticks", "--side", "put", "a.xml", "b.xml"]);
        match cli.command {
            Command::IngestTicks(args) => {
                assert_eq!(args.side, Some(Side::Put));
                assert_eq!(args.files.len(), 2);
                assert!(!args.infer_schema);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_reversed_range_is_rejected() {
        let range = RangeArgs {
            start: Some(10),
            end: Some(5),
        };
        assert!(range.range().is_err());
    }
}
