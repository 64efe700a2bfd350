//! Error taxonomy for the ingestion pipeline.
//!
//! Every failure a run can report maps onto one [`IngestError`] variant. Run
//! level preconditions (`Configuration`) abort before any I/O; the data
//! quality variants reject a single batch; `SourceUnavailable` and
//! `MergeFailure` abort the current run or file only. Per-record problems are
//! not errors at all, see [`crate::identity::Diagnostic`].

use std::fmt;
use std::time::Duration;

use thiserror::Error;

// ---

/// Pipeline stage a failure or timeout is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Read,
    Normalize,
    Merge,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Read => "read",
            Stage::Normalize => "normalize",
            Stage::Merge => "merge",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Unrecognized schema: none of the identity columns found in [{}]", .columns.join(", "))]
    UnrecognizedSchema { columns: Vec<String> },

    #[error("Malformed timestamp in row {row}: {value:?}")]
    MalformedTimestamp { row: usize, value: String },

    #[error("Malformed value in row {row}, column {column}: {value:?}")]
    MalformedValue {
        row: usize,
        column: &'static str,
        value: String,
    },

    #[error("Merge failed: {0}")]
    MergeFailure(String),

    #[error("Timed out after {timeout:?} during {stage}")]
    Timeout { stage: Stage, timeout: Duration },

    #[error("Cancelled before {stage}")]
    Cancelled { stage: Stage },

    #[error("Archive error: {0}")]
    Archive(String),
}

impl IngestError {
    /// Short machine-friendly name of the failure kind, used in run reports.
    pub fn kind(&self) -> &'static str {
        // ---
        match self {
            IngestError::Configuration(_) => "ConfigurationError",
            IngestError::SourceUnavailable(_) => "SourceUnavailable",
            IngestError::UnrecognizedSchema { .. } => "UnrecognizedSchema",
            IngestError::MalformedTimestamp { .. } => "MalformedTimestamp",
            IngestError::MalformedValue { .. } => "MalformedValue",
            IngestError::MergeFailure(_) => "MergeFailure",
            IngestError::Timeout { .. } => "Timeout",
            IngestError::Cancelled { .. } => "Cancelled",
            IngestError::Archive(_) => "ArchiveError",
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::MergeFailure(err.to_string())
    }
}

impl From<csv::Error> for IngestError {
    fn from(err: csv::Error) -> Self {
        IngestError::Archive(err.to_string())
    }
}
