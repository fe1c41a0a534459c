//! Backend types, configuration and the transport contract.
//!
//! Every transport implements [`MessageBackend`]. The trait is sealed: the set of
//! transports is closed and resolved through [`create_backend`] from a [`BackendType`].

use crate::backends::InMemoryBackend;
use crate::error::{ConfigurationError, ConnectionError, MessagingError};
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default suffix appended to a queue name to form its dead letter queue
pub const DEFAULT_DLQ_SUFFIX: &str = ".dlq";

/// Name of the dead letter queue for `queue`
pub fn dlq_name(queue: &str, suffix: &str) -> String {
    format!("{}{}", queue, suffix)
}

/// Enumeration of supported transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    #[default]
    Memory,
    Amqp,
    RedisStreams,
}

impl BackendType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Amqp => "amqp",
            Self::RedisStreams => "redis_streams",
        }
    }

    /// Check if the transport natively orders deliveries by priority
    pub fn supports_priority(self) -> bool {
        match self {
            Self::Memory => true,
            Self::Amqp => true,
            Self::RedisStreams => false,
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for BackendType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "memory" | "in_memory" => Ok(Self::Memory),
            "amqp" | "rabbitmq" => Ok(Self::Amqp),
            "redis_streams" | "redis" => Ok(Self::RedisStreams),
            other => Err(ConfigurationError::UnsupportedBackend {
                backend: other.to_string(),
                message: "unknown backend type".to_string(),
            }),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for backend initialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub backend_type: BackendType,
    /// Broker connection URL (unused by the memory backend)
    pub url: Option<String>,
    pub dlq_suffix: String,
    pub connect_timeout_seconds: u64,
    pub memory: MemoryBackendConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: BackendType::Memory,
            url: None,
            dlq_suffix: DEFAULT_DLQ_SUFFIX.to_string(),
            connect_timeout_seconds: 10,
            memory: MemoryBackendConfig::default(),
        }
    }
}

/// In-memory backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryBackendConfig {
    /// Upper bound for queues without an explicit `max_length`
    pub max_queue_size: usize,
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
        }
    }
}

/// Exchange types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeType {
    #[default]
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl std::fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
            Self::Headers => "headers",
        };
        write!(f, "{}", name)
    }
}

/// Declarative queue definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub max_priority: Option<u8>,
    /// Lifetime of messages in this queue, in seconds since enqueue
    #[serde(default)]
    pub message_ttl: Option<u64>,
    #[serde(default)]
    pub dead_letter_exchange: Option<String>,
    #[serde(default)]
    pub dead_letter_routing_key: Option<String>,
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
}

fn default_true() -> bool {
    true
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            max_length: None,
            max_priority: None,
            message_ttl: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            arguments: HashMap::new(),
        }
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = Some(max_priority);
        self
    }

    pub fn with_message_ttl(mut self, seconds: u64) -> Self {
        self.message_ttl = Some(seconds);
        self
    }

    pub fn with_dead_letter_exchange(
        mut self,
        exchange: impl Into<String>,
        routing_key: Option<String>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = routing_key;
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

/// Declarative exchange definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    #[serde(default)]
    pub exchange_type: ExchangeType,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
}

impl ExchangeConfig {
    pub fn new(name: impl Into<String>, exchange_type: ExchangeType) -> Self {
        Self {
            name: name.into(),
            exchange_type,
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: HashMap::new(),
        }
    }
}

/// Binds a queue to an exchange.
///
/// `arguments` is read by headers exchanges: `x-match` (`all` or `any`, default `all`)
/// plus the header values to compare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    pub queue: String,
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
}

impl BindingConfig {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            arguments: HashMap::new(),
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

/// Snapshot of a declared queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: usize,
    pub unacked_count: usize,
    pub config: QueueConfig,
}

/// Snapshot of a declared exchange
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExchangeInfo {
    pub name: String,
    pub exchange_type: ExchangeType,
    pub binding_count: usize,
    pub config: ExchangeConfig,
}

// ============================================================================
// Backend Contract
// ============================================================================

mod sealed {
    pub trait Sealed {}

    impl Sealed for crate::backends::InMemoryBackend {}
}

/// Uniform transport contract.
///
/// Delivery operations (`publish`, `consume`, `ack`, `nack`, `send_to_dlq`) never
/// return errors: failures are logged and reported as `false` or `None`.
#[async_trait]
pub trait MessageBackend: sealed::Sealed + Send + Sync {
    /// Connect to the transport. Calling it while connected is a no-op.
    async fn connect(&self) -> Result<(), ConnectionError>;

    /// Disconnect from the transport. Calling it while disconnected is a no-op.
    async fn disconnect(&self) -> Result<(), ConnectionError>;

    fn is_connected(&self) -> bool;

    fn backend_type(&self) -> BackendType;

    /// Suffix used to name dead letter queues
    fn dlq_suffix(&self) -> &str;

    /// Declare a queue. Re-declaring an existing queue returns its current state.
    async fn create_queue(&self, config: QueueConfig) -> Result<QueueInfo, MessagingError>;

    /// Declare an exchange. Re-declaring an existing exchange returns its current state.
    async fn create_exchange(&self, config: ExchangeConfig)
        -> Result<ExchangeInfo, MessagingError>;

    async fn bind_queue(&self, binding: BindingConfig) -> Result<(), MessagingError>;

    /// Delete a queue and its bindings. Returns whether the queue existed.
    async fn delete_queue(&self, name: &str) -> Result<bool, MessagingError>;

    /// Drop every ready message. Returns how many were removed.
    async fn purge_queue(&self, name: &str) -> Result<usize, MessagingError>;

    /// Number of ready messages, `None` for unknown queues
    async fn queue_depth(&self, name: &str) -> Option<usize>;

    /// Publish via the message's exchange, or directly to the queue named by its
    /// routing key when no exchange is set
    async fn publish(&self, message: Message) -> bool;

    /// Enqueue on a named queue, bypassing exchanges. Used for retries and recovery.
    async fn publish_to_queue(&self, queue: &str, message: Message) -> bool;

    /// Wait up to `timeout` for the next message
    async fn consume(&self, queue: &str, timeout: Duration) -> Option<Message>;

    async fn ack(&self, message: &Message) -> bool;

    /// Reject a delivery. `requeue` puts it back, otherwise it is marked failed and dropped.
    async fn nack(&self, message: Message, requeue: bool) -> bool;

    /// Publish to `<original_queue><dlq_suffix>`
    async fn send_to_dlq(&self, message: Message) -> bool;
}

/// Create a backend for the configured transport
pub fn create_backend(config: &BackendConfig) -> Result<Arc<dyn MessageBackend>, ConfigurationError> {
    match config.backend_type {
        BackendType::Memory => Ok(Arc::new(InMemoryBackend::new(config.clone()))),
        BackendType::Amqp => Err(ConfigurationError::UnsupportedBackend {
            backend: BackendType::Amqp.to_string(),
            message: "AMQP transport is not compiled into this build".to_string(),
        }),
        BackendType::RedisStreams => Err(ConfigurationError::UnsupportedBackend {
            backend: BackendType::RedisStreams.to_string(),
            message: "Redis streams transport is not compiled into this build".to_string(),
        }),
    }
}

#[cfg(test)]
#[path = "backend_tests.rs"]
mod tests;
