//! Built-in middleware.

use super::{Middleware, MiddlewareAction, MiddlewareConfig, MiddlewareContext, MiddlewareStage};
use crate::error::MiddlewareError;
use crate::message::{Message, Payload};
use crate::serialization::{compress, decompress, CompressionType};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn, Level};

#[cfg(test)]
#[path = "builtin_tests.rs"]
mod tests;

/// Header naming the algorithm a body was compressed with
pub const COMPRESSION_HEADER: &str = "x-compression";
/// Header preserving the body variant across compression
pub const ORIGINAL_BODY_TYPE_HEADER: &str = "x-original-body-type";
pub const ORIGINAL_CONTENT_TYPE_HEADER: &str = "x-original-content-type";

pub type MessagePredicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

// ============================================================================
// Validation
// ============================================================================

/// Rejects messages that fail any named predicate
pub struct ValidationMiddleware {
    config: MiddlewareConfig,
    rules: Vec<(String, MessagePredicate)>,
}

impl ValidationMiddleware {
    /// Runs before publish and before processing, priority 100
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(
            MiddlewareConfig::new(name)
                .with_priority(100)
                .with_stages([MiddlewareStage::PrePublish, MiddlewareStage::PreProcess]),
        )
    }

    pub fn with_config(config: MiddlewareConfig) -> Self {
        Self {
            config,
            rules: Vec::new(),
        }
    }

    pub fn with_rule<F>(mut self, rule: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.rules.push((rule.into(), Arc::new(predicate)));
        self
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn process(
        &self,
        message: &mut Message,
        context: &MiddlewareContext,
    ) -> Result<MiddlewareAction, MiddlewareError> {
        for (rule, predicate) in &self.rules {
            if !predicate(message) {
                debug!(
                    middleware = %self.config.name,
                    rule = %rule,
                    stage = %context.stage,
                    message_id = %message.id(),
                    "Validation failed"
                );
                return Ok(MiddlewareAction::Reject);
            }
        }
        Ok(MiddlewareAction::Continue)
    }
}

// ============================================================================
// Transformation
// ============================================================================

/// Applies a caller-supplied transformation. The message id cannot change.
pub struct TransformationMiddleware {
    config: MiddlewareConfig,
    transform: Arc<dyn Fn(&mut Message) -> Result<(), String> + Send + Sync>,
}

impl TransformationMiddleware {
    /// Runs before publish and before processing
    pub fn new<F>(name: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&mut Message) -> Result<(), String> + Send + Sync + 'static,
    {
        Self::with_config(
            MiddlewareConfig::new(name)
                .with_stages([MiddlewareStage::PrePublish, MiddlewareStage::PreProcess]),
            transform,
        )
    }

    pub fn with_config<F>(config: MiddlewareConfig, transform: F) -> Self
    where
        F: Fn(&mut Message) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            config,
            transform: Arc::new(transform),
        }
    }
}

#[async_trait]
impl Middleware for TransformationMiddleware {
    fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn process(
        &self,
        message: &mut Message,
        _context: &MiddlewareContext,
    ) -> Result<MiddlewareAction, MiddlewareError> {
        (self.transform)(message)
            .map_err(|reason| MiddlewareError::failed(&self.config.name, reason))?;
        Ok(MiddlewareAction::Continue)
    }
}

// ============================================================================
// Enrichment
// ============================================================================

type DynamicHeaders = Arc<dyn Fn(&Message) -> HashMap<String, Value> + Send + Sync>;

/// Adds custom headers. Headers already on the message are kept unless `overwrite` is set.
pub struct EnrichmentMiddleware {
    config: MiddlewareConfig,
    headers: HashMap<String, Value>,
    dynamic: Option<DynamicHeaders>,
    overwrite: bool,
}

impl EnrichmentMiddleware {
    /// Runs before publish
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(
            MiddlewareConfig::new(name).with_stages([MiddlewareStage::PrePublish]),
        )
    }

    pub fn with_config(config: MiddlewareConfig) -> Self {
        Self {
            config,
            headers: HashMap::new(),
            dynamic: None,
            overwrite: false,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Headers computed per message
    pub fn with_dynamic<F>(mut self, headers: F) -> Self
    where
        F: Fn(&Message) -> HashMap<String, Value> + Send + Sync + 'static,
    {
        self.dynamic = Some(Arc::new(headers));
        self
    }

    pub fn overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }

    fn apply(&self, message: &mut Message, key: &str, value: &Value) {
        if self.overwrite || !message.headers.custom.contains_key(key) {
            message.headers.custom.insert(key.to_string(), value.clone());
        }
    }
}

#[async_trait]
impl Middleware for EnrichmentMiddleware {
    fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn process(
        &self,
        message: &mut Message,
        _context: &MiddlewareContext,
    ) -> Result<MiddlewareAction, MiddlewareError> {
        for (key, value) in &self.headers {
            self.apply(message, key, value);
        }
        if let Some(dynamic) = &self.dynamic {
            for (key, value) in dynamic(message) {
                self.apply(message, &key, &value);
            }
        }
        Ok(MiddlewareAction::Continue)
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Rejects messages the predicate does not authenticate
pub struct AuthenticationMiddleware {
    config: MiddlewareConfig,
    authenticate: MessagePredicate,
}

impl AuthenticationMiddleware {
    /// Runs first (priority 1000) before publish and before processing
    pub fn new<F>(name: impl Into<String>, authenticate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Self::with_config(
            MiddlewareConfig::new(name)
                .with_priority(1000)
                .with_stages([MiddlewareStage::PrePublish, MiddlewareStage::PreProcess]),
            authenticate,
        )
    }

    pub fn with_config<F>(config: MiddlewareConfig, authenticate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Self {
            config,
            authenticate: Arc::new(authenticate),
        }
    }
}

#[async_trait]
impl Middleware for AuthenticationMiddleware {
    fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn process(
        &self,
        message: &mut Message,
        context: &MiddlewareContext,
    ) -> Result<MiddlewareAction, MiddlewareError> {
        if (self.authenticate)(message) {
            return Ok(MiddlewareAction::Continue);
        }
        warn!(
            middleware = %self.config.name,
            stage = %context.stage,
            message_id = %message.id(),
            "Message failed authentication"
        );
        Ok(MiddlewareAction::Reject)
    }
}

// ============================================================================
// Compression
// ============================================================================

/// Compresses bodies on outbound stages and restores them on inbound stages.
///
/// The compressed body is carried as bytes with [`COMPRESSION_HEADER`] set,
/// so the serialization codecs need no knowledge of it.
pub struct CompressionMiddleware {
    config: MiddlewareConfig,
    compression: CompressionType,
    min_size: usize,
}

impl CompressionMiddleware {
    /// Compresses before publish and decompresses before processing, last in the chain
    pub fn new(name: impl Into<String>, compression: CompressionType) -> Self {
        Self::with_config(
            MiddlewareConfig::new(name)
                .with_priority(-100)
                .with_stages([MiddlewareStage::PrePublish, MiddlewareStage::PreProcess]),
            compression,
        )
    }

    pub fn with_config(config: MiddlewareConfig, compression: CompressionType) -> Self {
        Self {
            config,
            compression,
            min_size: 0,
        }
    }

    /// Leave bodies smaller than `bytes` uncompressed
    pub fn with_min_size(mut self, bytes: usize) -> Self {
        self.min_size = bytes;
        self
    }

    fn compress_body(&self, message: &mut Message) -> Result<(), MiddlewareError> {
        if self.compression == CompressionType::None
            || message.header(COMPRESSION_HEADER).is_some()
            || message.body.len() < self.min_size
        {
            return Ok(());
        }

        let compressed = compress(&message.body.to_bytes(), self.compression)
            .map_err(|e| MiddlewareError::failed(&self.config.name, e.to_string()))?;

        let custom = &mut message.headers.custom;
        custom.insert(
            COMPRESSION_HEADER.to_string(),
            Value::from(self.compression.name()),
        );
        custom.insert(
            ORIGINAL_BODY_TYPE_HEADER.to_string(),
            Value::from(message.body.type_name()),
        );
        custom.insert(
            ORIGINAL_CONTENT_TYPE_HEADER.to_string(),
            Value::from(message.headers.content_type.as_str()),
        );
        message.headers.content_type = "application/octet-stream".to_string();
        message.body = Payload::Bytes(Bytes::from(compressed));
        Ok(())
    }

    fn decompress_body(&self, message: &mut Message) -> Result<(), MiddlewareError> {
        let algorithm = match message.header(COMPRESSION_HEADER).and_then(Value::as_str) {
            Some(name) => name.parse::<CompressionType>(),
            None => return Ok(()),
        };
        let failed = |reason: String| MiddlewareError::failed(&self.config.name, reason);

        let algorithm = algorithm.map_err(|e| failed(e.to_string()))?;
        let raw = decompress(&message.body.to_bytes(), algorithm)
            .map_err(|e| failed(e.to_string()))?;

        let body_type = message
            .header(ORIGINAL_BODY_TYPE_HEADER)
            .and_then(Value::as_str)
            .unwrap_or("bytes");
        let body = match body_type {
            "text" => Payload::Text(String::from_utf8(raw).map_err(|e| failed(e.to_string()))?),
            "json" => Payload::Json(
                serde_json::from_slice(&raw).map_err(|e| failed(e.to_string()))?,
            ),
            _ => Payload::Bytes(Bytes::from(raw)),
        };

        let custom = &mut message.headers.custom;
        custom.remove(COMPRESSION_HEADER);
        custom.remove(ORIGINAL_BODY_TYPE_HEADER);
        if let Some(Value::String(content_type)) = custom.remove(ORIGINAL_CONTENT_TYPE_HEADER) {
            message.headers.content_type = content_type;
        }
        message.body = body;
        Ok(())
    }
}

#[async_trait]
impl Middleware for CompressionMiddleware {
    fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn process(
        &self,
        message: &mut Message,
        context: &MiddlewareContext,
    ) -> Result<MiddlewareAction, MiddlewareError> {
        if context.stage.is_outbound() {
            self.compress_body(message)?;
        } else {
            self.decompress_body(message)?;
        }
        Ok(MiddlewareAction::Continue)
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Logs message flow through `tracing`
pub struct LoggingMiddleware {
    config: MiddlewareConfig,
    level: Level,
    include_body: bool,
}

impl LoggingMiddleware {
    /// Runs on every stage at `info`
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(
            MiddlewareConfig::new(name)
                .with_priority(500)
                .with_stages(MiddlewareStage::ALL),
        )
    }

    pub fn with_config(config: MiddlewareConfig) -> Self {
        Self {
            config,
            level: Level::INFO,
            include_body: false,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_body(mut self) -> Self {
        self.include_body = true;
        self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn process(
        &self,
        message: &mut Message,
        context: &MiddlewareContext,
    ) -> Result<MiddlewareAction, MiddlewareError> {
        let body = if self.include_body {
            message.body.as_text().into_owned()
        } else {
            String::new()
        };

        macro_rules! log_at {
            ($macro:ident) => {
                $macro!(
                    stage = %context.stage,
                    message_id = %message.id(),
                    routing_key = ?message.headers.routing_key,
                    queue = ?context.queue,
                    status = %message.status,
                    body = %body,
                    "Message flow"
                )
            };
        }

        if self.level == Level::ERROR {
            log_at!(error);
        } else if self.level == Level::WARN {
            log_at!(warn);
        } else if self.level == Level::INFO {
            log_at!(info);
        } else if self.level == Level::DEBUG {
            log_at!(debug);
        } else {
            log_at!(trace);
        }
        Ok(MiddlewareAction::Continue)
    }
}
