//! Message body serialization.
//!
//! A [`Codec`] pairs a [`MessageSerializer`] with an optional compression stage:
//! compression runs after encoding and before decoding. Two serializers ship with
//! the crate:
//!
//! - [`JsonSerializer`]: schema-free, the default for message bodies and wire shapes
//! - [`BlobSerializer`]: compact binary records restricted to a declared schema of
//!   primitive and date/time fields
//!
//! # Example
//!
//! ```rust
//! use switchyard_core::serialization::{CompressionType, SerializationFormat, SerializerFactory};
//! use serde_json::json;
//!
//! let codec = SerializerFactory::create(SerializationFormat::Json, CompressionType::Gzip).unwrap();
//! let bytes = codec.encode(&json!({"order": 42})).unwrap();
//! assert_eq!(codec.decode(&bytes).unwrap(), json!({"order": 42}));
//! assert_eq!(codec.content_type(), "application/json");
//! ```

use crate::error::SerializationError;
use crate::message::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

mod blob;
mod compression;
mod json;

pub use blob::{BlobField, BlobFieldType, BlobSchema, BlobSerializer};
pub use compression::{compress, decompress, CompressionType};
pub use json::JsonSerializer;

/// Known serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    #[default]
    Json,
    Blob,
}

impl SerializationFormat {
    pub fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Blob => "blob",
        }
    }

    /// Content type advertised on the wire
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Blob => "application/octet-stream",
        }
    }
}

impl FromStr for SerializationFormat {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "blob" => Ok(Self::Blob),
            other => Err(SerializationError::new(other, "unknown serialization format")),
        }
    }
}

/// Encodes and decodes message values to bytes
pub trait MessageSerializer: Send + Sync {
    /// Format implemented by this serializer
    fn format(&self) -> SerializationFormat;

    /// Content type advertised on the wire
    fn content_type(&self) -> &'static str {
        self.format().content_type()
    }

    /// Encode a value to bytes
    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerializationError>;

    /// Decode bytes back to a value
    fn decode(&self, data: &[u8]) -> Result<Value, SerializationError>;
}

/// A serializer composed with a compression stage
#[derive(Clone)]
pub struct Codec {
    serializer: Arc<dyn MessageSerializer>,
    compression: CompressionType,
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("format", &self.serializer.format())
            .field("compression", &self.compression)
            .finish()
    }
}

impl Codec {
    pub fn new(serializer: Arc<dyn MessageSerializer>, compression: CompressionType) -> Self {
        Self {
            serializer,
            compression,
        }
    }

    pub fn format(&self) -> SerializationFormat {
        self.serializer.format()
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    pub fn content_type(&self) -> &'static str {
        self.serializer.content_type()
    }

    /// Content encoding to advertise, if the codec compresses
    pub fn content_encoding(&self) -> Option<&'static str> {
        match self.compression {
            CompressionType::None => None,
            other => Some(other.name()),
        }
    }

    /// Encode then compress
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, SerializationError> {
        let encoded = self.serializer.encode(value)?;
        compress(&encoded, self.compression)
    }

    /// Decompress then decode
    pub fn decode(&self, data: &[u8]) -> Result<Value, SerializationError> {
        let decompressed = decompress(data, self.compression)?;
        self.serializer.decode(&decompressed)
    }
}

/// Encode a whole message (wire shape) with the given codec
pub fn encode_message(message: &Message, codec: &Codec) -> Result<Vec<u8>, SerializationError> {
    let map = message.to_map()?;
    codec.encode(&Value::Object(map))
}

/// Decode a message previously produced by [`encode_message`]
pub fn decode_message(data: &[u8], codec: &Codec) -> Result<Message, SerializationError> {
    match codec.decode(data)? {
        Value::Object(map) => Message::from_map(map),
        other => Err(SerializationError::new(
            codec.format().name(),
            format!("expected a message object, found {}", value_kind(&other)),
        )),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Pluggable, name-keyed set of serializers
pub struct SerializerRegistry {
    serializers: RwLock<HashMap<String, Arc<dyn MessageSerializer>>>,
}

impl SerializerRegistry {
    /// Registry pre-populated with the JSON serializer
    pub fn new() -> Self {
        let registry = Self {
            serializers: RwLock::new(HashMap::new()),
        };
        registry.register("json", Arc::new(JsonSerializer::new()));
        registry
    }

    /// Register (or replace) a serializer under `name`
    pub fn register(&self, name: impl Into<String>, serializer: Arc<dyn MessageSerializer>) {
        let mut serializers = self
            .serializers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        serializers.insert(name.into().to_ascii_lowercase(), serializer);
    }

    /// Look up a serializer by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn MessageSerializer>, SerializationError> {
        let serializers = self
            .serializers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        serializers
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| SerializationError::new(name, "no serializer registered"))
    }

    /// Build a codec from a registered serializer
    pub fn codec(
        &self,
        name: &str,
        compression: CompressionType,
    ) -> Result<Codec, SerializationError> {
        Ok(Codec::new(self.get(name)?, compression))
    }

    pub fn names(&self) -> Vec<String> {
        let serializers = self
            .serializers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<_> = serializers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory resolving codecs by format
pub struct SerializerFactory;

impl SerializerFactory {
    /// Create a codec for a schema-free format
    pub fn create(
        format: SerializationFormat,
        compression: CompressionType,
    ) -> Result<Codec, SerializationError> {
        match format {
            SerializationFormat::Json => {
                Ok(Codec::new(Arc::new(JsonSerializer::new()), compression))
            }
            SerializationFormat::Blob => Err(SerializationError::new(
                "blob",
                "blob codec requires an explicit schema; use SerializerFactory::create_blob",
            )),
        }
    }

    /// Create a codec by format name (`json`)
    pub fn from_name(name: &str, compression: CompressionType) -> Result<Codec, SerializationError> {
        Self::create(name.parse()?, compression)
    }

    /// Create a schema-restricted blob codec
    pub fn create_blob(schema: BlobSchema, compression: CompressionType) -> Codec {
        Codec::new(Arc::new(BlobSerializer::new(schema)), compression)
    }

    /// Wire content type for a format
    pub fn content_type(format: SerializationFormat) -> &'static str {
        format.content_type()
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
