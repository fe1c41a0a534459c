//! Message types for messaging operations including core domain identifiers.

use crate::error::{SerializationError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::HashMap;
use std::str::FromStr;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validate a queue or exchange name.
///
/// Names must be 1-255 characters of printable ASCII without whitespace.
pub fn validate_name(field: &str, name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if name.len() > 255 {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            message: "must be 1-255 characters".to_string(),
        });
    }

    if !name.chars().all(|c| c.is_ascii_graphic()) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            message: "only printable ASCII without whitespace allowed".to_string(),
        });
    }

    Ok(())
}

/// Unique identifier for messages within the messaging system
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Time elapsed since this timestamp (zero if it lies in the future)
    pub fn elapsed(&self) -> Duration {
        let elapsed = Utc::now() - self.0;
        if elapsed < Duration::zero() {
            Duration::zero()
        } else {
            elapsed
        }
    }

    /// RFC 3339 representation used in headers
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Priority and Status
// ============================================================================

/// Delivery priority. Serialized as its numeric value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessagePriority {
    Low = 1,
    #[default]
    Normal = 5,
    High = 10,
    Critical = 15,
}

impl MessagePriority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl From<MessagePriority> for u8 {
    fn from(priority: MessagePriority) -> Self {
        priority as u8
    }
}

impl TryFrom<u8> for MessagePriority {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Low),
            5 => Ok(Self::Normal),
            10 => Ok(Self::High),
            15 => Ok(Self::Critical),
            other => Err(ValidationError::OutOfRange {
                field: "priority".to_string(),
                message: format!("{} is not one of 1, 5, 10, 15", other),
            }),
        }
    }
}

/// Processing status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    DeadLetter,
}

impl MessageStatus {
    /// Completed and dead-lettered messages never change status again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter)
    }

    /// Check whether the status machine allows moving to `next`
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, DeadLetter)
                | (Failed, Retrying)
                | (Failed, DeadLetter)
                | (Retrying, Pending)
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::DeadLetter => "dead_letter",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Payload
// ============================================================================

/// Opaque message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Json(Value),
    Bytes(#[serde(with = "bytes_serde")] Bytes),
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

impl Payload {
    /// Name of the body type, used by middleware conditions
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Json(_) => "json",
            Self::Bytes(_) => "bytes",
        }
    }

    /// Default content type for this kind of body
    pub fn default_content_type(&self) -> &'static str {
        match self {
            Self::Text(_) => "text/plain",
            Self::Json(_) => "application/json",
            Self::Bytes(_) => "application/octet-stream",
        }
    }

    /// Stringified body, used by content routing
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Self::Text(text) => Cow::Borrowed(text.as_str()),
            Self::Json(Value::String(text)) => Cow::Borrowed(text.as_str()),
            Self::Json(value) => Cow::Owned(value.to_string()),
            Self::Bytes(bytes) => String::from_utf8_lossy(bytes),
        }
    }

    /// Raw bytes of the body
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Text(text) => Bytes::from(text.clone().into_bytes()),
            Self::Json(value) => Bytes::from(value.to_string().into_bytes()),
            Self::Bytes(bytes) => bytes.clone(),
        }
    }

    /// Size of the body in bytes
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Json(value) => value.to_string().len(),
            Self::Bytes(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// Metadata carried alongside the message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub message_id: MessageId,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub timestamp: Timestamp,
    pub content_type: String,
    #[serde(default)]
    pub priority: MessagePriority,
    /// Lifetime in seconds, relative to `timestamp`
    #[serde(default)]
    pub expiration: Option<u64>,
    #[serde(default)]
    pub routing_key: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub custom: HashMap<String, Value>,
}

fn default_max_retries() -> u32 {
    3
}

impl MessageHeaders {
    /// Create headers for a message with defaults
    pub fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            correlation_id: None,
            timestamp: Timestamp::now(),
            content_type: "application/json".to_string(),
            priority: MessagePriority::Normal,
            expiration: None,
            routing_key: None,
            exchange: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            custom: HashMap::new(),
        }
    }

    /// Check whether the message lifetime has elapsed
    pub fn is_expired(&self) -> bool {
        match self.expiration {
            Some(seconds) => {
                let expires_at = self.timestamp.as_datetime() + Duration::seconds(seconds as i64);
                Utc::now() > expires_at
            }
            None => false,
        }
    }

    /// Check whether retries remain
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Custom headers sorted by key, used for stable cache keys
    pub fn sorted_custom(&self) -> Vec<(&String, &Value)> {
        let mut entries: Vec<_> = self.custom.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// Convert to a JSON object
    pub fn to_map(&self) -> Result<Map<String, Value>, SerializationError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(SerializationError::new(
                "map",
                "headers did not serialize to an object",
            )),
            Err(e) => Err(SerializationError::with_source("map", e)),
        }
    }

    /// Rebuild headers from a JSON object
    pub fn from_map(map: Map<String, Value>) -> Result<Self, SerializationError> {
        serde_json::from_value(Value::Object(map))
            .map_err(|e| SerializationError::with_source("map", e))
    }
}

/// Transport bookkeeping attached by a backend when a message is consumed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: String,
    pub tag: u64,
}

/// A message travelling through the messaging system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    pub body: Payload,
    pub headers: MessageHeaders,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(skip)]
    delivery: Option<Delivery>,
}

impl Message {
    /// Create new message with body
    pub fn new(body: impl Into<Payload>) -> Self {
        let body = body.into();
        let id = MessageId::new();
        let mut headers = MessageHeaders::new(id.clone());
        headers.content_type = body.default_content_type().to_string();

        Self {
            id,
            body,
            headers,
            status: MessageStatus::Pending,
            delivery: None,
        }
    }

    /// Immutable message identifier
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Set the routing key
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.headers.routing_key = Some(routing_key.into());
        self
    }

    /// Set the target exchange
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.headers.exchange = Some(exchange.into());
        self
    }

    /// Set delivery priority
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.headers.priority = priority;
        self
    }

    /// Add correlation ID for tracking
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.headers.correlation_id = Some(correlation_id.into());
        self
    }

    /// Expire the message `seconds` after its timestamp
    pub fn with_expiration(mut self, seconds: u64) -> Self {
        self.headers.expiration = Some(seconds);
        self
    }

    /// Add a custom header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.custom.insert(key.into(), value.into());
        self
    }

    /// Override the retry limit
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.headers.max_retries = max_retries;
        self
    }

    /// Override the content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.headers.content_type = content_type.into();
        self
    }

    /// Look up a custom header
    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.custom.get(key)
    }

    pub fn is_expired(&self) -> bool {
        self.headers.is_expired()
    }

    pub fn can_retry(&self) -> bool {
        self.headers.can_retry()
    }

    pub fn mark_processing(&mut self) {
        self.status = MessageStatus::Processing;
    }

    pub fn mark_completed(&mut self) {
        self.status = MessageStatus::Completed;
    }

    /// Mark as failed. Always counts as one more attempt.
    pub fn mark_failed(&mut self) {
        self.status = MessageStatus::Failed;
        self.headers.retry_count = self.headers.retry_count.saturating_add(1);
    }

    pub fn mark_retrying(&mut self) {
        self.status = MessageStatus::Retrying;
    }

    pub fn mark_dead_letter(&mut self) {
        self.status = MessageStatus::DeadLetter;
    }

    /// Return to the queue-ready state after a retry or recovery
    pub fn reset_to_pending(&mut self) {
        self.status = MessageStatus::Pending;
    }

    /// Delivery record attached by the backend that handed out this message
    pub fn delivery(&self) -> Option<&Delivery> {
        self.delivery.as_ref()
    }

    pub(crate) fn set_delivery(&mut self, delivery: Delivery) {
        self.delivery = Some(delivery);
    }

    pub(crate) fn take_delivery(&mut self) -> Option<Delivery> {
        self.delivery.take()
    }

    /// Convert to the wire shape as a JSON object
    pub fn to_map(&self) -> Result<Map<String, Value>, SerializationError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(SerializationError::new(
                "map",
                "message did not serialize to an object",
            )),
            Err(e) => Err(SerializationError::with_source("map", e)),
        }
    }

    /// Rebuild a message from its wire shape
    pub fn from_map(map: Map<String, Value>) -> Result<Self, SerializationError> {
        let message: Message = serde_json::from_value(Value::Object(map))
            .map_err(|e| SerializationError::with_source("map", e))?;

        if message.id != message.headers.message_id {
            return Err(SerializationError::new(
                "map",
                format!(
                    "message id {} does not match header message_id {}",
                    message.id, message.headers.message_id
                ),
            ));
        }

        Ok(message)
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
