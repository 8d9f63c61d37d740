use thiserror::Error;

/// Wire-visible error taxonomy from §7. Every variant but `Internal` maps to
/// exactly one wire error code; the dispatcher uses [`BrokerError::code`] to
/// build the `Error` frame and [`BrokerError::is_fatal`] to decide whether the
/// connection survives.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("authentication failed")]
    AuthFailed,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("queue already exists: {0}")]
    QueueExists(String),
    #[error("queue is full: {0}")]
    QueueFull(String),
    #[error("rate limited")]
    RateLimited,
    #[error("operation timed out")]
    Timeout,
    #[error("internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BrokerError {
    /// The wire error code from §7.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::AuthFailed => "AUTH_FAILED",
            BrokerError::InvalidMessage(_) => "INVALID_MESSAGE",
            BrokerError::QueueNotFound(_) => "QUEUE_NOT_FOUND",
            BrokerError::QueueExists(_) => "QUEUE_EXISTS",
            BrokerError::QueueFull(_) => "QUEUE_FULL",
            BrokerError::RateLimited => "RATE_LIMITED",
            BrokerError::Timeout => "TIMEOUT",
            BrokerError::Internal(_) => "SERVER_ERROR",
        }
    }

    /// Per §7: protocol-level errors and internal faults are fatal for the
    /// connection; transient per-operation errors are not.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::AuthFailed | BrokerError::InvalidMessage(_) | BrokerError::Internal(_))
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
