//! # Switchyard Core
//!
//! Broker-agnostic messaging: one API for publishing and consuming over
//! pluggable backends, with rule-based routing, retries and dead-lettering,
//! and a staged middleware pipeline.
//!
//! ## Module Organization
//!
//! - [`message`] - Messages, headers, payloads and lifecycle status
//! - [`backend`] - The backend contract, topology types and the backend factory
//! - [`backends`] - Backend implementations (in-memory)
//! - [`routing`] - Rule-based routing engines with result caching
//! - [`dlq`] - Retry policies, retry scheduling and dead letter queue handling
//! - [`middleware`] - Staged middleware chain and built-in middleware
//! - [`manager`] - The messaging manager, producers and consumers
//! - [`serialization`] - JSON and binary message serialization, compression
//! - [`monitoring`] - Metrics collection hooks
//! - [`config`] - Layered configuration loading
//! - [`error`] - Error types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use switchyard_core::backends::InMemoryBackend;
//! use switchyard_core::manager::{handler_fn, ConsumerConfig, MessagingManagerBuilder, PublishOptions};
//! use switchyard_core::middleware::RateLimitMiddleware;
//! use switchyard_core::routing::{RouterConfig, RoutingEngine, RoutingRule};
//! use switchyard_core::{Message, QueueConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), switchyard_core::MessagingError> {
//! let router = RoutingEngine::new("default", RouterConfig::default());
//! router.add_rule(RoutingRule::topic("orders", "orders.*").to_queue("orders"))?;
//!
//! let manager = MessagingManagerBuilder::new(Arc::new(InMemoryBackend::default()))
//!     .with_router(router)
//!     .with_middleware(Arc::new(RateLimitMiddleware::new(
//!         "rate-limit",
//!         100.0,
//!         Duration::from_secs(1),
//!     )))
//!     .build()?;
//! manager.start().await?;
//! manager.declare_queue(QueueConfig::new("orders")).await?;
//!
//! manager
//!     .consume(
//!         ConsumerConfig::new("orders-worker", "orders"),
//!         handler_fn(|message: Message| async move {
//!             tracing::info!(id = %message.id(), "order received");
//!             Ok(())
//!         }),
//!     )
//!     .await?;
//!
//! manager
//!     .publish(r#"{"order": 1}"#, "orders.created", PublishOptions::default())
//!     .await?;
//!
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod config;
pub mod dlq;
pub mod error;
pub mod manager;
pub mod message;
pub mod middleware;
pub mod monitoring;
pub mod routing;
pub mod serialization;

pub use backend::{
    create_backend, BackendConfig, BackendType, BindingConfig, ExchangeConfig, ExchangeType,
    MessageBackend, QueueConfig,
};
pub use config::{MessagingConfig, TopologyConfig};
pub use error::{
    ConfigurationError, ConnectionError, MessageProcessingError, MessagingError,
    MiddlewareError, RoutingError, SerializationError, ValidationError,
};
pub use manager::{
    handler_fn, ConsumerConfig, MessageHandler, MessagingManager, MessagingManagerBuilder,
    PublishOptions,
};
pub use message::{Message, MessageHeaders, MessageId, MessagePriority, MessageStatus, Payload, Timestamp};
