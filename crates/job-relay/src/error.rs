//! Error types for broker, publish, retry and selection operations.

use thiserror::Error;

/// AMQP reply code for a mandatory message that matched no queue.
pub const NO_ROUTE: u16 = 312;

/// Errors raised by a broker connection or channel
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Channel '{label}' is closed")]
    ChannelClosed { label: String },

    #[error("Failed to declare {object} '{name}': {message}")]
    DeclareFailed {
        object: String,
        name: String,
        message: String,
    },

    #[error("Failed to bind queue '{queue}' to exchange '{exchange}': {message}")]
    BindFailed {
        queue: String,
        exchange: String,
        message: String,
    },

    #[error("Exchange not found: {exchange}")]
    ExchangeNotFound { exchange: String },

    #[error("Queue not found: {queue}")]
    QueueNotFound { queue: String },

    #[error("Publish to '{exchange}' with routing key '{routing_key}' failed: {message}")]
    PublishFailed {
        exchange: String,
        routing_key: String,
        message: String,
    },

    #[error("Broker rejected publish to '{exchange}' with routing key '{routing_key}'")]
    Nacked {
        exchange: String,
        routing_key: String,
    },

    #[error("Acknowledgement failed: {message}")]
    AckFailed { message: String },

    #[error("Consume from '{queue}' failed: {message}")]
    ConsumeFailed { queue: String, message: String },
}

impl BrokerError {
    /// Check if error is transient and the operation may succeed later
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } => true,
            Self::ChannelClosed { .. } => true,
            Self::DeclareFailed { .. } => false,
            Self::BindFailed { .. } => false,
            Self::ExchangeNotFound { .. } => false,
            Self::QueueNotFound { .. } => false,
            Self::PublishFailed { .. } => true,
            Self::Nacked { .. } => true,
            Self::AckFailed { .. } => true,
            Self::ConsumeFailed { .. } => true,
        }
    }
}

/// Errors surfaced by the reliable publisher
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Message returned ({reply_code} {reply_text}) by '{exchange}' for '{routing_key}'")]
    Returned {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },

    #[error("Cannot resolve destination queue of returned message: {message}")]
    UnresolvedDestination { message: String },

    #[error("Returned delayed message has no usable 'delay' header")]
    MissingDelay,

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid job: {0}")]
    InvalidJob(#[from] ValidationError),
}

impl PublishError {
    /// Check if error is transient and should be retried by the caller
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Broker(e) => e.is_transient(),
            Self::Returned { .. } => false,
            Self::UnresolvedDestination { .. } => false,
            Self::MissingDelay => false,
            Self::Serialization(_) => false,
            Self::InvalidJob(_) => false,
        }
    }
}

/// Errors raised while rescheduling a failed delivery
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Header '{header}' of delivery from queue '{queue}' is malformed")]
    MalformedHeader { header: String, queue: String },

    #[error("Redelivery publish failed: {0}")]
    Republish(#[from] PublishError),

    #[error("Acknowledging original delivery failed: {0}")]
    Ack(#[source] BrokerError),

    #[error("Compressing error details failed: {0}")]
    Compression(#[from] std::io::Error),
}

/// Errors raised when selecting consumers by queue pattern
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("No queues match patterns: {}", patterns.join(", "))]
    Unmatched { patterns: Vec<String> },

    #[error("Invalid queue pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Errors raised while starting job workers
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Consumer selection failed: {0}")]
    Selection(#[from] SelectionError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration loading failed: {0}")]
    Load(#[from] config::ConfigError),
}

/// Validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
