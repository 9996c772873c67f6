use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Transient infrastructure failure. Safe to retry with backoff;
    /// never masked as NotFound.
    #[error("Store unavailable: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Secret not found")]
    NotFound,

    #[error("Access denied")]
    AccessDenied,

    /// Master key missing/invalid or corrupted ciphertext. Treated as a
    /// security event by callers, not a retryable I/O error.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(#[from] crate::crypto::CryptoError),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Migration blocked: {0}")]
    MigrationBlocked(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::ValidationFailed(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
