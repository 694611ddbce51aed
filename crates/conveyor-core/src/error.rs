use thiserror::Error;

/// Application-wide error types for conveyor.
#[derive(Error, Debug)]
pub enum AppError {
    /// The server answered with a non-success status.
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// HTTP request failed before a status was received.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// A processing callback rejected the payload.
    #[error("Processing error: {0}")]
    ProcessingError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// An outcome was reported for a job the store never created.
    #[error("Job not found: stage '{stage}', url {url}")]
    NotFound { stage: String, url: String },

    /// Invalid stage or store configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Content cache backend failed.
    #[error("Cache error: {0}")]
    CacheError(String),
}

impl AppError {
    /// Shorthand for a processing failure raised from a stage callback.
    pub fn processing(message: impl Into<String>) -> Self {
        AppError::ProcessingError(message.into())
    }

    /// Returns true if this error should be recorded against the job as a
    /// retryable failure rather than stopping the stage.
    ///
    /// Transport and processing failures are recordable. Storage and
    /// configuration failures indicate a broken invariant and always
    /// propagate.
    pub fn is_recordable(&self) -> bool {
        match self {
            AppError::HttpStatus { .. }
            | AppError::HttpError(_)
            | AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::ProcessingError(_)
            | AppError::SerializationError(_) => true,
            AppError::NotFound { .. }
            | AppError::ConfigError(_)
            | AppError::DatabaseError(_)
            | AppError::CacheError(_) => false,
        }
    }

    /// Coarse category used in logs and reporter events.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::HttpStatus { .. }
            | AppError::HttpError(_)
            | AppError::NetworkError(_)
            | AppError::Timeout(_) => "transport",
            AppError::ProcessingError(_) | AppError::SerializationError(_) => "processing",
            AppError::NotFound { .. } | AppError::DatabaseError(_) | AppError::CacheError(_) => {
                "storage"
            }
            AppError::ConfigError(_) => "config",
        }
    }
}
