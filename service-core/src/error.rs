use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Authorization expired for connection {connection_id}: {reason}")]
    AuthExpired { connection_id: Uuid, reason: String },

    #[error("Upstream unavailable: {message}")]
    UpstreamUnavailable {
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Malformed source record ({source_type}/{external_id}): {reason}")]
    MalformedSourceRecord {
        source_type: String,
        external_id: String,
        reason: String,
    },

    #[error("Invalid signature")]
    SignatureInvalid,

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    /// Transient failures that the next scheduled tick may clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::UpstreamUnavailable { .. })
    }

    /// Failures that must mark the owning connection and stop retries.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, AppError::AuthExpired { .. })
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}
