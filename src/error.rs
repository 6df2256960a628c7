// Shoebox Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShoeboxError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bad path or bad parameters; surfaces to the caller.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing row or table. Silent for self-heal probes, surfaced for
    /// operations.
    #[error("Not found: {0}")]
    NotFound(String),

    /// BUSY/LOCKED after the local retry budget is exhausted.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Query deadline or job deadline exceeded.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Missing table/column detected outside the migration path.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Unexpected worker exit or protocol error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Distributed KV unavailable. Callers degrade to local mode.
    #[error("External service error: {0}")]
    External(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("{0}")]
    Other(String),
}

impl ShoeboxError {
    /// True for driver-level BUSY/LOCKED results, which the retry wrapper
    /// absorbs before they become `Conflict`.
    pub fn is_busy(&self) -> bool {
        match self {
            ShoeboxError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            ShoeboxError::Conflict(_) => true,
            _ => false,
        }
    }

    /// True when a query was cut short by the interrupt watchdog.
    pub fn is_interrupted(&self) -> bool {
        match self {
            ShoeboxError::Database(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::OperationInterrupted
            }
            ShoeboxError::Timeout(_) => true,
            _ => false,
        }
    }
}

impl From<anyhow::Error> for ShoeboxError {
    fn from(err: anyhow::Error) -> Self {
        ShoeboxError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ShoeboxError>;
