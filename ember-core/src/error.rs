//! Error types for ember operations

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Storage engine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("SQLite error on {path}: {reason}")]
    Sqlite { path: String, reason: String },

    #[error("Connection pool for {path} unavailable: {reason}")]
    Pool { path: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Blocking storage task failed: {reason}")]
    BlockingTask { reason: String },

    #[error("{entity} not found: {key}")]
    NotFound { entity: String, key: String },

    #[error("Batch writer {writer} is shut down")]
    WriterClosed { writer: String },

    #[error("I/O error on {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Errors from the external archive tool and the hot/cold shard lifecycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("Failed to start archive tool {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Archive tool timed out after {timeout:?} on {path}")]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("Archive tool exited with code {code:?} on {path}: {stderr}")]
    ToolFailed {
        path: PathBuf,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Shard file {path} is still in use: {reason}")]
    FileBusy { path: PathBuf, reason: String },

    #[error("Archive I/O error on {path}: {reason}")]
    Io { path: PathBuf, reason: String },
}

/// Contract violations raised before any I/O happens.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Path traversal rejected: {path} is outside {base}")]
    PathTraversal { path: PathBuf, base: PathBuf },

    #[error("Range spans {span} periods, maximum is {max}")]
    SpanExceeded { span: u32, max: u32 },

    #[error("Invalid range: start {start} is after end {end}")]
    InvalidRange { start: String, end: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Telemetry initialization failed: {reason}")]
    TelemetryInit { reason: String },
}

/// Master error type for all ember errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmberError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl EmberError {
    /// Transient failures are retried on the next scheduled pass instead of
    /// being surfaced as contract violations.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EmberError::Archive(
                ArchiveError::Timeout { .. }
                    | ArchiveError::ToolFailed { .. }
                    | ArchiveError::FileBusy { .. }
            )
        )
    }
}

/// Result type alias for ember operations.
pub type EmberResult<T> = Result<T, EmberError>;

// =============================================================================
// TESTS
// =============================================================================
