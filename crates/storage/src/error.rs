//! Storage error types.

use chrono::{DateTime, Utc};
use gridpoint_common::{CellId, GridpointError};
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(
        "Commit for cell {cell_id} at {at} does not follow its current version from {effective_from}"
    )]
    NonMonotonicCommit {
        cell_id: CellId,
        at: DateTime<Utc>,
        effective_from: DateTime<Utc>,
    },

    #[error("Partition edge {requested} m differs from the catalog's {existing} m")]
    EdgeMismatch { existing: f64, requested: f64 },

    #[error("Square ({row}, {col}) appears twice in the partition")]
    DuplicateSquare { row: i64, col: i64 },

    #[error("Refresh run not found: {0}")]
    RunNotFound(i64),

    #[error("Refresh run {0} is already finished")]
    RunAlreadyFinished(i64),

    #[error("Invalid stored row: {0}")]
    InvalidRow(String),
}

impl From<StorageError> for GridpointError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RunNotFound(id) => GridpointError::RunNotFound(id),
            other => GridpointError::DatabaseError(other.to_string()),
        }
    }
}
