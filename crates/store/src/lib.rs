//! Lakehouse tables and stage entry points for the tickhouse pipeline.
//!
//! This crate provides:
//! - A SQLite-backed catalog of bronze, silver and gold tables
//! - Transactional append and partition overwrite
//! - One entry point per pipeline stage, each returning a `StageSummary`

pub mod catalog;
pub mod pipeline;
pub mod tables;

pub use catalog::{Catalog, ColumnType, TableSchema, TableWrite, WriteMode};
pub use pipeline::Pipeline;
pub use tables::TableRow;
