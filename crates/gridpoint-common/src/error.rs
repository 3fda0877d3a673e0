//! Error types for the gridpoint engine.

use thiserror::Error;

/// Result type alias using GridpointError.
pub type GridpointResult<T> = Result<T, GridpointError>;

/// Primary error type for gridpoint operations.
#[derive(Debug, Error)]
pub enum GridpointError {
    // === Input Errors ===
    #[error("Invalid coordinate: lat={lat}, lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error("Invalid office code: {0:?}. Expected three uppercase letters")]
    InvalidOfficeCode(String),

    #[error("Invalid grid index for {axis}: {value}")]
    InvalidGridIndex { axis: &'static str, value: i64 },

    #[error("Invalid gridpoint: {0}. Expected 'OFFICE/x,y'")]
    InvalidGridpoint(String),

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    // === Data Errors ===
    #[error("Cell not found: {0}")]
    CellNotFound(i64),

    #[error("Refresh run not found: {0}")]
    RunNotFound(i64),

    // === Storage Errors ===
    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // === Resolution Errors ===
    #[error("Resolution failed: {0}")]
    ResolutionError(String),

    // === Infrastructure Errors ===
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request timeout")]
    Timeout,
}

impl GridpointError {
    /// Get the HTTP status code for this error.
    pub fn http_status_code(&self) -> u16 {
        match self {
            GridpointError::InvalidCoordinate { .. }
            | GridpointError::InvalidOfficeCode(_)
            | GridpointError::InvalidGridIndex { .. }
            | GridpointError::InvalidGridpoint(_)
            | GridpointError::MissingParameter(_) => 400,

            GridpointError::CellNotFound(_) | GridpointError::RunNotFound(_) => 404,

            GridpointError::ResolutionError(_) => 502,
            GridpointError::ServiceUnavailable(_) => 503,
            GridpointError::Timeout => 504,

            _ => 500,
        }
    }

    /// Short machine-readable code used in JSON error bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            GridpointError::InvalidCoordinate { .. } => "invalid_coordinate",
            GridpointError::InvalidOfficeCode(_)
            | GridpointError::InvalidGridIndex { .. }
            | GridpointError::InvalidGridpoint(_) => "invalid_gridpoint",
            GridpointError::MissingParameter(_) => "missing_parameter",
            GridpointError::CellNotFound(_) => "cell_not_found",
            GridpointError::RunNotFound(_) => "run_not_found",
            GridpointError::ResolutionError(_) => "resolution_failed",
            GridpointError::Timeout => "timeout",
            _ => "internal_error",
        }
    }
}

// Conversion from common error types
impl From<std::io::Error> for GridpointError {
    fn from(err: std::io::Error) -> Self {
        GridpointError::InternalError(err.to_string())
    }
}

impl From<serde_json::Error> for GridpointError {
    fn from(err: serde_json::Error) -> Self {
        GridpointError::InternalError(format!("JSON error: {}", err))
    }
}
