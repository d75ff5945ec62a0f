// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ channel closed: {0}")]
    ChannelClosed(String),

    #[error("Topology declaration error: {0}")]
    TopologyError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Message deserialization error: {0}")]
    DeserializationError(#[from] SerdeError),

    #[error("Subscriber failed on {event}: {reason}")]
    Subscriber { event: &'static str, reason: String },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Errors that recovery can do something about. Configuration and payload
    /// problems are never retried.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            RabbitMQError::Configuration(_) | RabbitMQError::DeserializationError(_)
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();

        if error_text.contains("connection") {
            RabbitMQError::ConnectionError(error_text)
        } else if error_text.contains("channel") {
            RabbitMQError::ChannelError(error_text)
        } else if error_text.contains("consume") {
            RabbitMQError::ConsumeError(error_text)
        } else if error_text.contains("ack") {
            RabbitMQError::AckError(error_text)
        } else {
            RabbitMQError::Unknown(error_text)
        }
    }
}
