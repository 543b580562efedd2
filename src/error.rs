// ⚠️ Error taxonomy for the import pipeline
//
// Per-line errors (MalformedRecord, InvalidEncoding, FieldCoercionError) are recovered inside
// the step and only show up in counters. Everything else halts the step.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, ImportError>;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Source unavailable: {path:?}: {cause}")]
    SourceUnavailable { path: PathBuf, cause: String },

    #[error("Failed to read source at line {line_number}: {cause}")]
    SourceRead { line_number: u64, cause: String },

    #[error("Malformed record at line {line_number}: expected {expected_fields} fields, got {actual_fields}")]
    MalformedRecord {
        line_number: u64,
        expected_fields: usize,
        actual_fields: usize,
    },

    #[error("Field {field_index} at line {line_number} is not valid UTF-8")]
    InvalidEncoding { line_number: u64, field_index: usize },

    #[error("Cannot coerce field '{field_name}' at line {line_number}: {raw_value:?}")]
    FieldCoercionError {
        line_number: u64,
        field_name: String,
        raw_value: String,
    },

    #[error("Chunk of {chunk_size} records rolled back: {cause}")]
    SinkWriteError { cause: String, chunk_size: usize },

    #[error("Skip limit of {limit} exceeded at line {line_number}")]
    SkipLimitExceeded { limit: u64, line_number: u64 },

    #[error("Input ends after {available} data lines, before the restart offset {restart_offset}")]
    InputTruncated { restart_offset: u64, available: u64 },

    #[error("Chunk already holds {bound} records; flush before adding")]
    ChunkOverflow { bound: usize },

    #[error("Invalid field mapping: {0}")]
    InvalidMapping(String),

    #[error("Invalid insert template: {0}")]
    InvalidTemplate(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Run '{run_id}' of job '{job_name}' already exists")]
    DuplicateRun { job_name: String, run_id: String },

    #[error("Run '{run_id}' of job '{job_name}' cannot be restarted: status is {status}")]
    NotRestartable {
        job_name: String,
        run_id: String,
        status: String,
    },

    #[error("Run '{run_id}' of job '{job_name}' is still {status}; abandon it before restarting")]
    AlreadyRunning {
        job_name: String,
        run_id: String,
        status: String,
    },

    #[error("Run '{run_id}' of job '{job_name}' was launched with different parameters")]
    ParametersChanged { job_name: String, run_id: String },

    #[error("No run '{run_id}' recorded for job '{job_name}'")]
    UnknownRun { job_name: String, run_id: String },

    #[error("Job repository error: {0}")]
    Repository(String),
}

impl ImportError {
    /// Per-line errors the step skips instead of failing on
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            ImportError::MalformedRecord { .. }
                | ImportError::InvalidEncoding { .. }
                | ImportError::FieldCoercionError { .. }
        )
    }

    /// Source line the error refers to, if any
    pub fn line_number(&self) -> Option<u64> {
        match self {
            ImportError::MalformedRecord { line_number, .. }
            | ImportError::InvalidEncoding { line_number, .. }
            | ImportError::FieldCoercionError { line_number, .. }
            | ImportError::SourceRead { line_number, .. }
            | ImportError::SkipLimitExceeded { line_number, .. } => Some(*line_number),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for ImportError {
    fn from(err: rusqlite::Error) -> Self {
        ImportError::Repository(err.to_string())
    }
}
