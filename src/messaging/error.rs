//! Error types for messaging operations

use crate::error::AppError;

/// Result type for messaging operations
pub type MessagingResult<T> = std::result::Result<T, MessagingError>;

/// Errors that can occur during messaging operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessagingError {
    /// Dial, channel open or exchange declaration failed
    #[error("Connection failed: {0}")]
    Connect(String),

    /// An option override could not be merged onto the defaults
    #[error("Configuration error: {0}")]
    Config(String),

    /// Queue declare, bind or consume-start failed
    #[error("Declaration failed: {0}")]
    Declare(String),

    /// A user handler returned an error or panicked
    #[error("Handler failed: {0}")]
    Handler(String),

    /// Publishing a message failed
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Acknowledging a single delivery failed
    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),

    /// The consumer has been shut down
    #[error("Consumer is shut down")]
    Shutdown,
}

impl MessagingError {
    /// Whether the failure comes from the transport and may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MessagingError::Connect(_)
                | MessagingError::Declare(_)
                | MessagingError::Publish(_)
                | MessagingError::Acknowledge(_)
        )
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            MessagingError::Connect(_) => "connect",
            MessagingError::Config(_) => "config",
            MessagingError::Declare(_) => "declare",
            MessagingError::Handler(_) => "handler",
            MessagingError::Publish(_) => "publish",
            MessagingError::Acknowledge(_) => "acknowledge",
            MessagingError::Shutdown => "shutdown",
        }
    }
}

impl From<lapin::Error> for MessagingError {
    fn from(err: lapin::Error) -> Self {
        MessagingError::Connect(err.to_string())
    }
}

impl From<MessagingError> for AppError {
    fn from(err: MessagingError) -> Self {
        match err {
            MessagingError::Config(msg) => AppError::Configuration(msg),
            MessagingError::Connect(msg) => AppError::Network(msg),
            _ => AppError::Messaging(err.to_string()),
        }
    }
}
