use thiserror::Error;

/// Convenience type alias for Results with ForemanError
pub type Result<T> = std::result::Result<T, ForemanError>;

/// Main error type for Foreman Core
///
/// Every fault that can cross a component boundary is one of these
/// variants with a human-readable message. The dispatcher recovers most
/// of them locally and translates them into task-state transitions plus
/// bus events; nothing crosses the public surface as a panic.
#[derive(Error, Debug)]
pub enum ForemanError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connector busy: {0}")]
    Busy(String),

    #[error("Timeout: {message}")]
    Timeout { message: String },

    #[error("Connector spawn failed: {message}")]
    ConnectorSpawn { message: String },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Queue is full")]
    QueueFull,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Connector error: {message}")]
    Connector { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ForemanError {
    /// Whether the surrounding action should back off and retry instead
    /// of failing the task outright.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ForemanError::StorageUnavailable(_))
    }
}
