//! Error types for the tickhouse pipeline.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tickhouse pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input that cannot be turned into rows (empty document, bad timestamp).
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// An expected column is absent from a schema or table.
    #[error("Schema mismatch in {table}: missing column `{column}`")]
    SchemaMismatch { table: String, column: String },

    /// Infrastructure condition worth retrying (locked store, creation race).
    #[error("Transient error: {0}")]
    Transient(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a malformed input error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedInput(msg.into())
    }

    /// Create a schema mismatch error naming the offending column.
    pub fn schema_mismatch(table: impl Into<String>, column: impl Into<String>) -> Self {
        Error::SchemaMismatch {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Create a transient error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Error::Database(msg.into())
    }

    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mismatch_names_column() {
        let err = Error::schema_mismatch("lakehouse.options.bronze_ticks", "tdate");
        let msg = err.to_string();
        assert!(msg.contains("`tdate`"));
        assert!(msg.contains("bronze_ticks"));
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(Error::transient("database is locked").is_transient());
        assert!(!Error::malformed("no rows").is_transient());
        assert!(!Error::database("syntax error").is_transient());
    }
}
