//! Feature computation for the tickhouse pipeline.
//!
//! This crate handles:
//! - Per-instrument bar ordering
//! - Lagged returns, momentum, trailing volatility, OI change
//! - Forward-return and direction labels
//! - Training matrix export
//! - Feature drift scoring

pub mod dataset;
pub mod drift;
pub mod engine;
pub mod labels;
pub mod volatility;

pub use dataset::TrainingSet;
pub use drift::{DriftMonitor, DriftReport};
pub use engine::FeatureEngine;
pub use labels::LabelDeriver;
pub use volatility::TrailingVolatility;
