// ABOUTME: Custom error types for the importer
// ABOUTME: Provides context-specific error variants with actionable messages

use thiserror::Error;

use crate::import::ImportStatus;

#[derive(Debug, Error)]
pub enum ImporterError {
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Raised at a batch boundary once a cancel was requested. Never reported as a failure.
    #[error("Import cancelled")]
    Cancelled,

    #[error("Stopped on first error: {0}")]
    StopOnError(String),

    #[error("Fatal error, aborting import: {0}")]
    Fatal(String),

    #[error("Cannot {action} while import is {status}")]
    InvalidState {
        action: &'static str,
        status: ImportStatus,
    },

    #[error("Invalid import options: {0}")]
    InvalidOptions(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dump error: {0}")]
    Dump(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

pub type Result<T> = std::result::Result<T, ImporterError>;
