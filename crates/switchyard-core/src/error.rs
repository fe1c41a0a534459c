//! Error types for messaging operations.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for all messaging operations
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Middleware error: {0}")]
    Middleware(#[from] MiddlewareError),

    #[error("Message processing failed: {0}")]
    Processing(#[from] MessageProcessingError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Message {message_id} rejected by middleware '{middleware}' during {stage}")]
    Rejected {
        message_id: String,
        middleware: String,
        stage: String,
    },

    #[error("No producer available: {reason}")]
    NoProducer { reason: String },

    #[error("Operation '{operation}' not allowed while manager is {state}")]
    InvalidState { operation: String, state: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Exchange not found: {exchange_name}")]
    ExchangeNotFound { exchange_name: String },

    #[error("Consumer not found: {name}")]
    ConsumerNotFound { name: String },
}

impl MessagingError {
    /// Check if error is transient and the operation may succeed later
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Serialization(_) => false,
            Self::Routing(_) => false,
            Self::Middleware(e) => matches!(e, MiddlewareError::Timeout { .. }),
            Self::Processing(_) => true,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
            Self::Rejected { .. } => false,
            Self::NoProducer { .. } => true,
            Self::InvalidState { .. } => true,
            Self::QueueNotFound { .. } => false,
            Self::ExchangeNotFound { .. } => false,
            Self::ConsumerNotFound { .. } => false,
        }
    }
}

/// Backend connectivity failures
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Failed to connect to {backend}: {message}")]
    ConnectFailed { backend: String, message: String },

    #[error("Backend {backend} is not connected")]
    NotConnected { backend: String },

    #[error("Connection to {backend} lost: {message}")]
    Lost { backend: String, message: String },

    #[error("Connection attempt timed out after {duration:?}")]
    Timeout { duration: Duration },
}

/// Encoding or decoding failure, always tagged with the codec format
#[derive(Debug, Error)]
#[error("{format} serialization failed: {reason}")]
pub struct SerializationError {
    pub format: String,
    pub reason: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SerializationError {
    /// Create an error without an underlying cause
    pub fn new(format: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            reason: reason.into(),
            source: None,
        }
    }

    /// Create an error wrapping the root cause
    pub fn with_source<E>(format: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            format: format.into(),
            reason: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

/// Failures while resolving delivery targets
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("No routing rule matched message {message_id} (routing key: {routing_key:?})")]
    NoMatch {
        message_id: String,
        routing_key: Option<String>,
    },

    #[error("Routing engine not found: {name}")]
    UnknownEngine { name: String },

    #[error("Routing rule '{name}' already exists")]
    DuplicateRule { name: String },

    #[error("Routing rule not found: {name}")]
    RuleNotFound { name: String },

    #[error("Invalid pattern '{pattern}' in rule '{rule}': {message}")]
    InvalidPattern {
        rule: String,
        pattern: String,
        message: String,
    },

    #[error("Rule '{rule}' failed while matching: {message}")]
    MatcherFailed { rule: String, message: String },
}

/// Failure scoped to a single middleware invocation
#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("Middleware '{middleware}' failed: {message}")]
    Failed { middleware: String, message: String },

    #[error("Middleware '{middleware}' timed out after {duration:?}")]
    Timeout {
        middleware: String,
        duration: Duration,
    },

    #[error("Middleware '{middleware}' is already registered")]
    Duplicate { middleware: String },

    #[error("Middleware not found: {middleware}")]
    NotFound { middleware: String },
}

impl MiddlewareError {
    /// Convenience constructor used by middleware implementations
    pub fn failed(middleware: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            middleware: middleware.into(),
            message: message.into(),
        }
    }

    /// Name of the middleware the error is scoped to
    pub fn middleware(&self) -> &str {
        match self {
            Self::Failed { middleware, .. }
            | Self::Timeout { middleware, .. }
            | Self::Duplicate { middleware }
            | Self::NotFound { middleware } => middleware,
        }
    }
}

/// Error raised by a consumer handler.
///
/// `kind` classifies the failure and is what retry inclusion/exclusion lists match on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {reason}")]
pub struct MessageProcessingError {
    pub kind: String,
    pub reason: String,
}

impl MessageProcessingError {
    pub fn new(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("Unsupported backend {backend}: {message}")]
    UnsupportedBackend { backend: String, message: String },
}

/// Validation errors
#[derive(Debug, Error)]
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
