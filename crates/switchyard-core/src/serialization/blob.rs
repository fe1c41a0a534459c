//! Schema-based opaque blob codec.
//!
//! Encodes a flat JSON object into a compact binary record whose layout is fixed by a
//! [`BlobSchema`]. Decoding only ever reconstructs values from a closed allow-list of
//! primitive and date/time types; any other type tag is rejected. There is deliberately
//! no way to reconstruct arbitrary structures from a blob.

use super::{MessageSerializer, SerializationFormat};
use crate::error::SerializationError;
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

const MAGIC: &[u8; 4] = b"SYB1";
const FORMAT: &str = "blob";

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_DATETIME: u8 = 0x05;
const TAG_DATE: u8 = 0x06;
const TAG_ABSENT: u8 = 0xFF;

/// Allowed field types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobFieldType {
    Null,
    Bool,
    Int,
    Float,
    String,
    /// RFC 3339 timestamp string
    DateTime,
    /// `YYYY-MM-DD` date string
    Date,
}

impl BlobFieldType {
    fn tag(self) -> u8 {
        match self {
            Self::Null => TAG_NULL,
            Self::Bool => TAG_BOOL,
            Self::Int => TAG_INT,
            Self::Float => TAG_FLOAT,
            Self::String => TAG_STRING,
            Self::DateTime => TAG_DATETIME,
            Self::Date => TAG_DATE,
        }
    }
}

/// One field of a blob schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobField {
    pub name: String,
    pub field_type: BlobFieldType,
    #[serde(default)]
    pub required: bool,
}

impl BlobField {
    pub fn required(name: impl Into<String>, field_type: BlobFieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: BlobFieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }
}

/// Explicit field definitions for a blob record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobSchema {
    pub name: String,
    pub fields: Vec<BlobField>,
}

impl BlobSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: BlobField) -> Self {
        self.fields.push(field);
        self
    }

    fn field(&self, name: &str) -> Option<&BlobField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Blob serializer bound to a single schema
#[derive(Debug, Clone)]
pub struct BlobSerializer {
    schema: BlobSchema,
}

impl BlobSerializer {
    pub fn new(schema: BlobSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &BlobSchema {
        &self.schema
    }

    fn error(&self, reason: impl Into<String>) -> SerializationError {
        SerializationError::new(
            FORMAT,
            format!("schema '{}': {}", self.schema.name, reason.into()),
        )
    }

    fn encode_field(
        &self,
        field: &BlobField,
        value: Option<&Value>,
        out: &mut Vec<u8>,
    ) -> Result<(), SerializationError> {
        let value = match value {
            None if field.required => {
                return Err(self.error(format!("required field '{}' is missing", field.name)))
            }
            None => {
                out.push(TAG_ABSENT);
                return Ok(());
            }
            Some(Value::Null) => {
                out.push(TAG_NULL);
                return Ok(());
            }
            Some(value) => value,
        };

        let mismatch = || {
            self.error(format!(
                "field '{}' expects {:?}, got {}",
                field.name, field.field_type, value
            ))
        };

        match field.field_type {
            BlobFieldType::Null => return Err(mismatch()),
            BlobFieldType::Bool => {
                let b = value.as_bool().ok_or_else(mismatch)?;
                out.push(TAG_BOOL);
                out.push(u8::from(b));
            }
            BlobFieldType::Int => {
                let n = value.as_i64().ok_or_else(mismatch)?;
                out.push(TAG_INT);
                out.extend_from_slice(&n.to_be_bytes());
            }
            BlobFieldType::Float => {
                let n = value.as_f64().ok_or_else(mismatch)?;
                out.push(TAG_FLOAT);
                out.extend_from_slice(&n.to_be_bytes());
            }
            BlobFieldType::String => {
                let s = value.as_str().ok_or_else(mismatch)?;
                out.push(TAG_STRING);
                write_str(s, out)?;
            }
            BlobFieldType::DateTime => {
                let s = value.as_str().ok_or_else(mismatch)?;
                DateTime::parse_from_rfc3339(s).map_err(|e| {
                    self.error(format!("field '{}' is not RFC 3339: {}", field.name, e))
                })?;
                out.push(TAG_DATETIME);
                write_str(s, out)?;
            }
            BlobFieldType::Date => {
                let s = value.as_str().ok_or_else(mismatch)?;
                NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
                    self.error(format!("field '{}' is not a date: {}", field.name, e))
                })?;
                out.push(TAG_DATE);
                write_str(s, out)?;
            }
        }
        Ok(())
    }

    fn decode_field(
        &self,
        field: &BlobField,
        reader: &mut Reader<'_>,
    ) -> Result<Option<Value>, SerializationError> {
        let tag = reader.u8().ok_or_else(|| self.error("truncated record"))?;

        if tag == TAG_ABSENT {
            if field.required {
                return Err(self.error(format!("required field '{}' is missing", field.name)));
            }
            return Ok(None);
        }
        if tag == TAG_NULL {
            return Ok(Some(Value::Null));
        }
        if !matches!(
            tag,
            TAG_BOOL | TAG_INT | TAG_FLOAT | TAG_STRING | TAG_DATETIME | TAG_DATE
        ) {
            return Err(self.error(format!(
                "type tag 0x{:02x} for field '{}' is not in the allow-list",
                tag, field.name
            )));
        }
        if tag != field.field_type.tag() {
            return Err(self.error(format!(
                "field '{}' declared {:?} but record holds tag 0x{:02x}",
                field.name, field.field_type, tag
            )));
        }

        let truncated = || self.error(format!("truncated value for field '{}'", field.name));
        let value = match tag {
            TAG_BOOL => Value::Bool(reader.u8().ok_or_else(truncated)? != 0),
            TAG_INT => {
                let bytes = reader.take(8).ok_or_else(truncated)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Value::Number(Number::from(i64::from_be_bytes(buf)))
            }
            TAG_FLOAT => {
                let bytes = reader.take(8).ok_or_else(truncated)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                let n = f64::from_be_bytes(buf);
                Number::from_f64(n)
                    .map(Value::Number)
                    .ok_or_else(|| self.error(format!("field '{}' is not finite", field.name)))?
            }
            _ => {
                let s = reader
                    .string()
                    .ok_or_else(truncated)?
                    .map_err(|e| SerializationError::with_source(FORMAT, e))?;
                if tag == TAG_DATETIME {
                    DateTime::parse_from_rfc3339(&s)
                        .map_err(|e| SerializationError::with_source(FORMAT, e))?;
                } else if tag == TAG_DATE {
                    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                        .map_err(|e| SerializationError::with_source(FORMAT, e))?;
                }
                Value::String(s)
            }
        };
        Ok(Some(value))
    }
}

impl MessageSerializer for BlobSerializer {
    fn format(&self) -> SerializationFormat {
        SerializationFormat::Blob
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerializationError> {
        let object = value
            .as_object()
            .ok_or_else(|| self.error("only flat objects can be encoded"))?;

        if let Some(unknown) = object.keys().find(|k| self.schema.field(k).is_none()) {
            return Err(self.error(format!("field '{}' is not declared", unknown)));
        }

        let field_count = u16::try_from(self.schema.fields.len())
            .map_err(|_| self.error("too many fields"))?;

        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&field_count.to_be_bytes());
        for field in &self.schema.fields {
            self.encode_field(field, object.get(&field.name), &mut out)?;
        }
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Value, SerializationError> {
        let mut reader = Reader::new(data);

        if reader.take(4) != Some(MAGIC.as_slice()) {
            return Err(self.error("missing blob header"));
        }

        let count = reader
            .take(2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
            .ok_or_else(|| self.error("truncated record"))?;
        if count != self.schema.fields.len() {
            return Err(self.error(format!(
                "record has {} fields, schema declares {}",
                count,
                self.schema.fields.len()
            )));
        }

        let mut object = Map::new();
        for field in &self.schema.fields {
            if let Some(value) = self.decode_field(field, &mut reader)? {
                object.insert(field.name.clone(), value);
            }
        }

        if !reader.is_empty() {
            return Err(self.error("trailing bytes after record"));
        }

        Ok(Value::Object(object))
    }
}

fn write_str(s: &str, out: &mut Vec<u8>) -> Result<(), SerializationError> {
    out.extend_from_slice(&length_prefix(s.len())?);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Big-endian u32 length; longer strings cannot be framed
fn length_prefix(len: usize) -> Result<[u8; 4], SerializationError> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| {
            SerializationError::new(
                FORMAT,
                format!("string of {} bytes exceeds the u32 length prefix", len),
            )
        })
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn string(&mut self) -> Option<Result<String, std::string::FromUtf8Error>> {
        let len = self.take(4)?;
        let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        let bytes = self.take(len)?;
        Some(String::from_utf8(bytes.to_vec()))
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }
}
