//! Data ingestion and normalization for the tickhouse pipeline.
//!
//! This crate handles:
//! - XML tick/code loading with row-tag detection
//! - Bronze to silver deduplication and contract dimension derivation
//! - Fixed-width bar building

pub mod bar_builder;
pub mod normalizer;
pub mod xml;

pub use bar_builder::{build_bars, BarBuilder};
pub use normalizer::{derive_dimension, normalize_ticks, NormalizeStats};
pub use xml::{LoadedFile, RowSchema, XmlLoader};
