//! Error types for microdata ingestion
//!
//! Every error carries a [`ErrorScope`] that tells the driver how far a
//! failure reaches: a single file, or the whole run. Record-level problems
//! are not errors at all; they surface as
//! [`Rejection`](crate::transform::Rejection) values.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// How far a failure propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Abort the current file, roll back its uncommitted chunks, continue
    File,
    /// Abort the run immediately
    Run,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Survey not found: {survey}")]
    SchemaNotFound { survey: String },

    #[error("No schema for level '{level}'")]
    LevelNotFound { level: String },

    #[error("Invalid schema for level '{level}': {reason}")]
    InvalidSchema { level: String, reason: String },

    #[error(
        "Column count mismatch in {path} at line {line}: expected {expected} fields, found {found}",
        path = .file.display()
    )]
    ColumnCountMismatch {
        file: PathBuf,
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("Transfer failed after {attempts} attempt(s): {reason}")]
    TransferFailure { attempts: u32, reason: String },

    #[error("Lost connection to the database: {0}")]
    ConnectivityLoss(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IngestError {
    /// Classify the error for the driver's abort policy.
    ///
    /// Schema and connectivity problems invalidate every partition; anything
    /// tied to reading or loading one file only costs that file.
    pub fn scope(&self) -> ErrorScope {
        match self {
            IngestError::ColumnCountMismatch { .. }
            | IngestError::TransferFailure { .. }
            | IngestError::Csv(_)
            | IngestError::Io(_) => ErrorScope::File,
            IngestError::SchemaNotFound { .. }
            | IngestError::LevelNotFound { .. }
            | IngestError::InvalidSchema { .. }
            | IngestError::ConnectivityLoss(_)
            | IngestError::Database(_)
            | IngestError::Snapshot(_)
            | IngestError::Config(_) => ErrorScope::Run,
        }
    }

    pub fn is_run_fatal(&self) -> bool {
        self.scope() == ErrorScope::Run
    }
}

impl From<microdata_common::CommonError> for IngestError {
    fn from(err: microdata_common::CommonError) -> Self {
        IngestError::Config(err.to_string())
    }
}
