//! Core types and configuration for the tickhouse pipeline.
//!
//! This crate provides shared types used across all other crates:
//! - Lakehouse row types (raw ticks, silver ticks, bars, features, labels)
//! - Configuration structures
//! - Common error types and the retry policy

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use retry::RetryPolicy;
pub use types::*;
