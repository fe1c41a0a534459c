//! Schema-free JSON codec.

use super::{MessageSerializer, SerializationFormat};
use crate::error::SerializationError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// JSON serializer. Safe for untrusted input: decoding only ever produces JSON values.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer {
    pretty: bool,
}

impl JsonSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit indented JSON (debugging aid, larger payloads)
    pub fn pretty() -> Self {
        Self { pretty: true }
    }

    /// Encode any serde-serializable value
    pub fn encode_typed<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        let result = if self.pretty {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        };
        result.map_err(|e| SerializationError::with_source("json", e))
    }

    /// Decode into a concrete type
    pub fn decode_typed<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, SerializationError> {
        serde_json::from_slice(data).map_err(|e| SerializationError::with_source("json", e))
    }
}

impl MessageSerializer for JsonSerializer {
    fn format(&self) -> SerializationFormat {
        SerializationFormat::Json
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerializationError> {
        self.encode_typed(value)
    }

    fn decode(&self, data: &[u8]) -> Result<Value, SerializationError> {
        self.decode_typed(data)
    }
}
