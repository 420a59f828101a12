use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("TRANSIENT_IO: {0}")]
    TransientIo(String),
    #[error("CONCURRENCY_CONFLICT: {0}")]
    ConcurrencyConflict(String),
    #[error("VALIDATION: {0}")]
    Validation(String),
    #[error("SCHEDULER_BUSY: {0}")]
    SchedulerBusy(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientIo(_) => "transient_io",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::Validation(_) => "validation",
            Self::SchedulerBusy(_) => "scheduler_busy",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal",
        }
    }

    /// Message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::TransientIo(message)
            | Self::ConcurrencyConflict(message)
            | Self::Validation(message)
            | Self::SchedulerBusy(message)
            | Self::NotFound(message)
            | Self::Internal(message) => message,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo(_) | Self::ConcurrencyConflict(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::TransientIo(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
