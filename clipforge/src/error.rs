//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// Submission-time variants (`Validation`, `Capacity`, `Allowlist`) are returned
/// to the caller synchronously. Execution-time variants (`Compile`, `Render`,
/// `Timeout`, `Cancelled`) end up on the job record instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Capacity exceeded: {outstanding} of {max} jobs outstanding")]
    Capacity { outstanding: usize, max: usize },

    #[error("Callback destination rejected: {0}")]
    Allowlist(String),

    #[error("Compile failed: {0}")]
    Compile(String),

    #[error("Render failed: {0}")]
    Render(String),

    #[error("Render timed out after {0} ms")]
    Timeout(u64),

    #[error("Render cancelled")]
    Cancelled,

    #[error("Callback delivery failed: {0}")]
    Delivery(String),

    #[error("Sweep failed: {0}")]
    Sweep(String),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} {path}: {source}")]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn allowlist(msg: impl Into<String>) -> Self {
        Self::Allowlist(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn compile(msg: impl Into<String>) -> Self {
        Self::Compile(msg.into())
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether this error is rejected at submission and never produces a job.
    pub fn is_submission_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Capacity { .. } | Self::Allowlist(_)
        )
    }
}
