//! # Messaging Manager
//!
//! [`MessagingManager`] wires one backend, the routing engines, the DLQ
//! manager and the middleware chain together and owns the producer and
//! consumer registries.
//!
//! Managers are built explicitly through [`MessagingManagerBuilder`], either
//! from parts or from a [`MessagingConfig`], and then started:
//!
//! ```rust,no_run
//! use switchyard_core::backends::InMemoryBackend;
//! use switchyard_core::manager::{handler_fn, ConsumerConfig, MessagingManagerBuilder, PublishOptions};
//! use switchyard_core::Message;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), switchyard_core::MessagingError> {
//! let manager = MessagingManagerBuilder::new(Arc::new(InMemoryBackend::default())).build()?;
//! manager.start().await?;
//!
//! manager
//!     .consume(
//!         ConsumerConfig::new("orders-worker", "orders"),
//!         handler_fn(|message: Message| async move {
//!             println!("got {}", message.id());
//!             Ok(())
//!         }),
//!     )
//!     .await?;
//! manager.publish("order-1", "orders", PublishOptions::default()).await?;
//!
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::backend::{
    create_backend, dlq_name, BindingConfig, ExchangeConfig, ExchangeInfo, MessageBackend,
    QueueConfig, QueueInfo,
};
use crate::config::{MessagingConfig, TopologyConfig};
use crate::dlq::{
    AlertCallback, DlqConfig, DlqHandler, DlqManager, DlqPolicy, RecoveryOptions, RecoveryReport,
};
use crate::error::{ConfigurationError, MessagingError, MiddlewareError};
use crate::message::{validate_name, Message, MessageId, MessagePriority, Payload, Timestamp};
use crate::middleware::{
    ChainOutcome, Middleware, MiddlewareChain, MiddlewareDirection, MiddlewareStage,
};
use crate::monitoring::{MetricsCollector, NoOpMetricsCollector};
use crate::routing::{
    FallbackPolicy, RouterConfig, RouterRegistry, RoutingEngine, DEFAULT_ENGINE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub mod consumer;
pub mod health;
pub mod producer;

pub use consumer::{
    handler_fn, ConsumerConfig, ConsumerStats, DispatchOutcome, FnHandler, HandlerAdapter,
    MessageHandler,
};
pub use health::{HealthReport, HealthStatus, ManagerMetrics};
pub use producer::{DeliveryPlan, Producer, ProducerStats};

use consumer::{run_consumer, ConsumerCounters};
use health::HealthRecord;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

// ============================================================================
// State and Settings
// ============================================================================

/// Lifecycle of a [`MessagingManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Initializing,
    Running,
    Pausing,
    Paused,
    Stopping,
    Stopped,
    /// Start-up or shutdown failed
    Error,
}

impl ManagerState {
    pub fn can_transition_to(self, next: ManagerState) -> bool {
        use ManagerState::*;
        matches!(
            (self, next),
            (Initializing, Running)
                | (Initializing, Error)
                | (Initializing, Stopping)
                | (Running, Pausing)
                | (Running, Stopping)
                | (Pausing, Paused)
                | (Pausing, Stopping)
                | (Paused, Running)
                | (Paused, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Error)
                | (Error, Stopping)
        )
    }

    /// Publishing is possible while running or paused
    pub fn accepts_publishes(self) -> bool {
        matches!(self, Self::Running | Self::Pausing | Self::Paused)
    }
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub health_check_interval_seconds: u64,
    pub metrics_interval_seconds: u64,
    /// Default wait per consume call
    pub consumer_poll_timeout_ms: u64,
    /// Upper bound on waiting for each consumer or background task at shutdown
    pub shutdown_timeout_seconds: u64,
    pub default_producer: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval_seconds: 30,
            metrics_interval_seconds: 60,
            consumer_poll_timeout_ms: 1_000,
            shutdown_timeout_seconds: 30,
            default_producer: "default".to_string(),
        }
    }
}

impl ManagerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_seconds)
    }

    pub fn consumer_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_poll_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let positive = [
            ("manager.health_check_interval_seconds", self.health_check_interval_seconds),
            ("manager.metrics_interval_seconds", self.metrics_interval_seconds),
            ("manager.consumer_poll_timeout_ms", self.consumer_poll_timeout_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigurationError::Invalid {
                    message: format!("{} must be greater than zero", key),
                });
            }
        }
        if self.default_producer.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "manager.default_producer".to_string(),
            });
        }
        Ok(())
    }
}

/// Optional settings for [`MessagingManager::publish`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub exchange: Option<String>,
    pub headers: HashMap<String, Value>,
    pub priority: Option<MessagePriority>,
    pub correlation_id: Option<String>,
    /// Seconds
    pub expiration: Option<u64>,
    pub max_retries: Option<u32>,
    /// Producer name; the configured default producer when unset
    pub producer: Option<String>,
    /// Routing engine name; the default engine when unset
    pub router: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_expiration(mut self, seconds: u64) -> Self {
        self.expiration = Some(seconds);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_producer(mut self, producer: impl Into<String>) -> Self {
        self.producer = Some(producer.into());
        self
    }

    pub fn with_router(mut self, router: impl Into<String>) -> Self {
        self.router = Some(router.into());
        self
    }

    fn apply(&self, mut message: Message) -> Message {
        if let Some(exchange) = &self.exchange {
            message.headers.exchange = Some(exchange.clone());
        }
        if let Some(priority) = self.priority {
            message.headers.priority = priority;
        }
        if let Some(correlation_id) = &self.correlation_id {
            message.headers.correlation_id = Some(correlation_id.clone());
        }
        if let Some(expiration) = self.expiration {
            message.headers.expiration = Some(expiration);
        }
        if let Some(max_retries) = self.max_retries {
            message.headers.max_retries = max_retries;
        }
        message
            .headers
            .custom
            .extend(self.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        message
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`MessagingManager`] from explicit dependencies
pub struct MessagingManagerBuilder {
    backend: Arc<dyn MessageBackend>,
    config: ManagerConfig,
    default_router: Option<RoutingEngine>,
    routers: Vec<RoutingEngine>,
    dlq_config: DlqConfig,
    dlq_handler: Option<Arc<dyn DlqHandler>>,
    alert_callback: Option<AlertCallback>,
    chain: Option<Arc<MiddlewareChain>>,
    middleware: Vec<Arc<dyn Middleware>>,
    metrics: Arc<dyn MetricsCollector>,
    topology: TopologyConfig,
}

impl MessagingManagerBuilder {
    pub fn new(backend: Arc<dyn MessageBackend>) -> Self {
        Self {
            backend,
            config: ManagerConfig::default(),
            default_router: None,
            routers: Vec::new(),
            dlq_config: DlqConfig::default(),
            dlq_handler: None,
            alert_callback: None,
            chain: None,
            middleware: Vec::new(),
            metrics: Arc::new(NoOpMetricsCollector),
            topology: TopologyConfig::default(),
        }
    }

    /// Builder for a validated configuration, with the backend created by the factory
    pub fn from_config(config: &MessagingConfig) -> Result<Self, MessagingError> {
        config.validate()?;
        let backend = create_backend(&config.backend)?;

        let router = RoutingEngine::new(DEFAULT_ENGINE, config.routing.router.clone());
        for rule in &config.routing.rules {
            router.add_rule(rule.clone())?;
        }

        Ok(Self::new(backend)
            .with_settings(config.manager.clone())
            .with_router(router)
            .with_dlq_config(config.dlq.clone())
            .with_topology(config.topology.clone()))
    }

    pub fn with_settings(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// The default routing engine. It is registered as [`DEFAULT_ENGINE`] whatever its name.
    pub fn with_router(mut self, router: RoutingEngine) -> Self {
        self.default_router = Some(router);
        self
    }

    /// An additional engine, selected per publish with [`PublishOptions::with_router`]
    pub fn with_named_router(mut self, router: RoutingEngine) -> Self {
        self.routers.push(router);
        self
    }

    pub fn with_dlq_config(mut self, config: DlqConfig) -> Self {
        self.dlq_config = config;
        self
    }

    pub fn with_dlq_handler(mut self, handler: Arc<dyn DlqHandler>) -> Self {
        self.dlq_handler = Some(handler);
        self
    }

    pub fn with_dlq_alert<F>(mut self, callback: F) -> Self
    where
        F: Fn(&crate::dlq::DlqAlert) + Send + Sync + 'static,
    {
        self.alert_callback = Some(Arc::new(callback));
        self
    }

    /// Use an existing chain instead of a fresh one
    pub fn with_middleware_chain(mut self, chain: Arc<MiddlewareChain>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Queues, exchanges and bindings declared on start
    pub fn with_topology(mut self, topology: TopologyConfig) -> Self {
        self.topology = topology;
        self
    }

    /// Build the manager. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<MessagingManager, MessagingError> {
        self.config.validate()?;
        self.dlq_config.validate()?;
        if self.dlq_config.policy == DlqPolicy::CustomHandler && self.dlq_handler.is_none() {
            return Err(ConfigurationError::Missing {
                key: "dlq handler for the custom_handler policy".to_string(),
            }
            .into());
        }

        let routers = RouterRegistry::new(self.default_router.unwrap_or_else(|| {
            RoutingEngine::new(DEFAULT_ENGINE, RouterConfig::default())
        }));
        for router in self.routers {
            if router.name() == DEFAULT_ENGINE {
                return Err(ConfigurationError::Invalid {
                    message: format!("router name '{}' is reserved", DEFAULT_ENGINE),
                }
                .into());
            }
            routers.register(router);
        }

        let mut dlq = DlqManager::new(self.dlq_config, Arc::clone(&self.backend))
            .with_metrics(Arc::clone(&self.metrics));
        if let Some(handler) = self.dlq_handler {
            dlq = dlq.with_handler(handler);
        }
        if let Some(callback) = self.alert_callback {
            dlq = dlq.with_alert_callback(move |alert| callback(alert));
        }

        let chain = self.chain.unwrap_or_default();
        for middleware in self.middleware {
            chain.add(middleware)?;
        }

        let (shutdown_tx, _) = watch::channel(false);
        let (paused_tx, _) = watch::channel(false);

        Ok(MessagingManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                backend: self.backend,
                routers,
                dlq: Arc::new(dlq),
                middleware: chain,
                metrics: self.metrics,
                topology: self.topology,
                state: RwLock::new(ManagerState::Initializing),
                producers: RwLock::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
                queues: RwLock::new(HashMap::new()),
                exchanges: RwLock::new(HashMap::new()),
                bindings: RwLock::new(Vec::new()),
                health: Mutex::new(HealthRecord::default()),
                background: Mutex::new(Vec::new()),
                shutdown_tx,
                paused_tx,
                publish_rejections: AtomicU64::new(0),
                started_at: Mutex::new(None),
            }),
        })
    }
}

// ============================================================================
// Manager
// ============================================================================

struct ConsumerHandle {
    config: ConsumerConfig,
    counters: Arc<ConsumerCounters>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ManagerInner {
    config: ManagerConfig,
    backend: Arc<dyn MessageBackend>,
    routers: RouterRegistry,
    dlq: Arc<DlqManager>,
    middleware: Arc<MiddlewareChain>,
    metrics: Arc<dyn MetricsCollector>,
    topology: TopologyConfig,
    state: RwLock<ManagerState>,
    producers: RwLock<HashMap<String, Arc<Producer>>>,
    consumers: Mutex<HashMap<String, ConsumerHandle>>,
    queues: RwLock<HashMap<String, QueueConfig>>,
    exchanges: RwLock<HashMap<String, ExchangeConfig>>,
    bindings: RwLock<Vec<BindingConfig>>,
    health: Mutex<HealthRecord>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    paused_tx: watch::Sender<bool>,
    publish_rejections: AtomicU64,
    started_at: Mutex<Option<Instant>>,
}

/// Top-level messaging orchestrator. Clones share the same manager.
#[derive(Clone)]
pub struct MessagingManager {
    inner: Arc<ManagerInner>,
}

impl MessagingManager {
    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Connect the backend, declare the configured topology and start the
    /// background health and metrics loops.
    pub async fn start(&self) -> Result<(), MessagingError> {
        let state = self.state();
        if state != ManagerState::Initializing {
            return Err(MessagingError::InvalidState {
                operation: "start".to_string(),
                state: state.to_string(),
            });
        }

        info!(backend = %self.inner.backend.backend_type(), "Starting messaging manager");

        if let Err(e) = self.inner.backend.connect().await {
            error!(error = %e, "Backend connection failed during start-up");
            self.inner.force_state(ManagerState::Error);
            return Err(e.into());
        }

        if let Err(e) = self.declare_topology().await {
            error!(error = %e, "Topology declaration failed during start-up");
            self.inner.force_state(ManagerState::Error);
            return Err(e);
        }

        self.inner.producer(&self.inner.config.default_producer);
        self.spawn_background_tasks();
        *lock(&self.inner.started_at) = Some(Instant::now());

        self.inner
            .transition("start", &[ManagerState::Initializing], ManagerState::Running)?;
        info!("Messaging manager running");
        Ok(())
    }

    /// Suspend every consumer. Publishing keeps working.
    pub fn pause(&self) -> Result<(), MessagingError> {
        self.inner
            .transition("pause", &[ManagerState::Running], ManagerState::Pausing)?;
        self.inner.paused_tx.send_replace(true);
        self.inner
            .transition("pause", &[ManagerState::Pausing], ManagerState::Paused)?;
        info!("Messaging manager paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), MessagingError> {
        self.inner
            .transition("resume", &[ManagerState::Paused], ManagerState::Running)?;
        self.inner.paused_tx.send_replace(false);
        info!("Messaging manager resumed");
        Ok(())
    }

    /// Stop consumers, background tasks, producers, the DLQ manager and
    /// finally the backend, in that order. Stopping a stopped manager is a no-op.
    pub async fn shutdown(&self) -> Result<(), MessagingError> {
        if self.state() == ManagerState::Stopped {
            return Ok(());
        }
        self.inner.transition(
            "shutdown",
            &[
                ManagerState::Initializing,
                ManagerState::Running,
                ManagerState::Pausing,
                ManagerState::Paused,
                ManagerState::Error,
            ],
            ManagerState::Stopping,
        )?;
        info!("Shutting down messaging manager");

        let consumers: Vec<ConsumerHandle> = lock(&self.inner.consumers)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in &consumers {
            handle.stop.send_replace(true);
        }
        for handle in consumers {
            self.inner.join(&handle.config.name, handle.task).await;
        }

        self.inner.shutdown_tx.send_replace(true);
        let background: Vec<JoinHandle<()>> = lock(&self.inner.background).drain(..).collect();
        for task in background {
            self.inner.join("background", task).await;
        }

        for producer in read(&self.inner.producers).values() {
            producer.disconnect();
        }

        self.inner.dlq.shutdown().await;

        if let Err(e) = self.inner.backend.disconnect().await {
            error!(error = %e, "Backend disconnect failed during shutdown");
            self.inner.force_state(ManagerState::Error);
            return Err(e.into());
        }

        self.inner.force_state(ManagerState::Stopped);
        info!("Messaging manager stopped");
        Ok(())
    }

    pub fn state(&self) -> ManagerState {
        *read(&self.inner.state)
    }

    // ------------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------------

    pub async fn declare_queue(&self, config: QueueConfig) -> Result<QueueInfo, MessagingError> {
        let info = self.inner.backend.create_queue(config.clone()).await?;
        write(&self.inner.queues).insert(config.name.clone(), config);
        Ok(info)
    }

    pub async fn declare_exchange(
        &self,
        config: ExchangeConfig,
    ) -> Result<ExchangeInfo, MessagingError> {
        let info = self.inner.backend.create_exchange(config.clone()).await?;
        write(&self.inner.exchanges).insert(config.name.clone(), config);
        Ok(info)
    }

    pub async fn bind_queue(&self, binding: BindingConfig) -> Result<(), MessagingError> {
        self.inner.backend.bind_queue(binding.clone()).await?;
        let mut bindings = write(&self.inner.bindings);
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    /// Declared queue names, sorted
    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.inner.queues).keys().cloned().collect();
        names.sort();
        names
    }

    /// Declared exchange names, sorted
    pub fn exchanges(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.inner.exchanges).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn bindings(&self) -> Vec<BindingConfig> {
        read(&self.inner.bindings).clone()
    }

    async fn declare_topology(&self) -> Result<(), MessagingError> {
        let topology = &self.inner.topology;
        for exchange in &topology.exchanges {
            self.declare_exchange(exchange.clone()).await?;
        }
        for queue in &topology.queues {
            self.declare_queue(queue.clone()).await?;
        }
        for binding in &topology.bindings {
            self.bind_queue(binding.clone()).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    /// Build a message and publish it.
    ///
    /// Fails only when `pre_publish` middleware rejects or fails, when no
    /// producer is available, or when `options` names an unknown routing
    /// engine. Routing failures fall back to `routing_key`; backend failures
    /// are logged and counted.
    pub async fn publish(
        &self,
        body: impl Into<Payload>,
        routing_key: impl Into<String>,
        options: PublishOptions,
    ) -> Result<MessageId, MessagingError> {
        let message = options.apply(Message::new(body).with_routing_key(routing_key));
        self.publish_with(message, options.producer.as_deref(), options.router.as_deref())
            .await
    }

    /// Publish a prepared message through the default producer and router
    pub async fn publish_message(&self, message: Message) -> Result<MessageId, MessagingError> {
        self.publish_with(message, None, None).await
    }

    async fn publish_with(
        &self,
        mut message: Message,
        producer: Option<&str>,
        router: Option<&str>,
    ) -> Result<MessageId, MessagingError> {
        let started = Instant::now();
        let producer = self
            .inner
            .resolve_producer(producer.unwrap_or(&self.inner.config.default_producer))?;
        let engine = match router {
            Some(name) => self.inner.routers.get(name)?,
            None => self.inner.routers.default_engine()?,
        };

        let stage = MiddlewareStage::PrePublish;
        match self
            .inner
            .middleware
            .process(&mut message, stage, MiddlewareDirection::Outbound)
            .await
        {
            Ok(ChainOutcome::Rejected { middleware }) => {
                self.inner.publish_rejections.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .metrics
                    .record_middleware_rejection(&middleware, stage.as_str());
                return Err(MessagingError::Rejected {
                    message_id: message.id().to_string(),
                    middleware,
                    stage: stage.to_string(),
                });
            }
            Ok(_) => {}
            Err(e) => {
                self.inner
                    .metrics
                    .record_error("middleware", matches!(e, MiddlewareError::Timeout { .. }));
                return Err(e.into());
            }
        }

        let message_id = message.id().clone();
        let delivered = match self.inner.plan_delivery(&engine, &message) {
            Some(plan) => producer.send(message.clone(), &plan).await,
            None => false,
        };

        if delivered {
            if let Err(e) = self
                .inner
                .middleware
                .process(
                    &mut message,
                    MiddlewareStage::PostPublish,
                    MiddlewareDirection::Outbound,
                )
                .await
            {
                warn!(message_id = %message_id, error = %e, "post_publish middleware failed");
            }
            debug!(
                message_id = %message_id,
                producer = %producer.name(),
                "Message published"
            );
        } else {
            warn!(message_id = %message_id, "Message was not delivered to any target");
        }

        self.inner.metrics.record_publish(started.elapsed(), delivered);
        Ok(message_id)
    }

    // ------------------------------------------------------------------------
    // Consuming
    // ------------------------------------------------------------------------

    /// Start a consume loop for `config.queue` running `handler`
    pub async fn consume(
        &self,
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), MessagingError> {
        let state = self.state();
        if !state.accepts_publishes() {
            return Err(MessagingError::InvalidState {
                operation: "consume".to_string(),
                state: state.to_string(),
            });
        }
        validate_name("queue", &config.queue)?;

        if self.inner.backend.queue_depth(&config.queue).await.is_none() {
            info!(queue = %config.queue, "Declaring queue for new consumer");
            self.declare_queue(QueueConfig::new(config.queue.clone()))
                .await?;
        }

        let mut consumers = lock(&self.inner.consumers);
        if consumers.contains_key(&config.name) {
            return Err(ConfigurationError::Invalid {
                message: format!("consumer '{}' already exists", config.name),
            }
            .into());
        }

        let adapter = HandlerAdapter::new(
            handler,
            Arc::clone(&self.inner.backend),
            Arc::clone(&self.inner.middleware),
            Arc::clone(&self.inner.dlq),
            Arc::clone(&self.inner.metrics),
        );
        let counters = Arc::new(ConsumerCounters::default());
        let (stop, stop_rx) = watch::channel(false);
        let poll_timeout = config
            .poll_timeout
            .unwrap_or_else(|| self.inner.config.consumer_poll_timeout());

        let task = tokio::spawn(run_consumer(
            config.clone(),
            poll_timeout,
            adapter,
            Arc::clone(&counters),
            stop_rx,
            self.inner.paused_tx.subscribe(),
        ));

        info!(consumer = %config.name, queue = %config.queue, "Consumer registered");
        consumers.insert(
            config.name.clone(),
            ConsumerHandle {
                config,
                counters,
                stop,
                task,
            },
        );
        Ok(())
    }

    /// Stop one consumer, letting it finish the message in hand
    pub async fn stop_consumer(&self, name: &str) -> Result<(), MessagingError> {
        let handle = lock(&self.inner.consumers).remove(name).ok_or_else(|| {
            MessagingError::ConsumerNotFound {
                name: name.to_string(),
            }
        })?;
        handle.stop.send_replace(true);
        self.inner.join(name, handle.task).await;
        Ok(())
    }

    /// Registered consumer names, sorted
    pub fn consumers(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.consumers).keys().cloned().collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Arc<dyn MessageBackend> {
        &self.inner.backend
    }

    pub fn dlq(&self) -> &Arc<DlqManager> {
        &self.inner.dlq
    }

    pub fn middleware(&self) -> &Arc<MiddlewareChain> {
        &self.inner.middleware
    }

    pub fn router(&self, name: &str) -> Result<Arc<RoutingEngine>, MessagingError> {
        Ok(self.inner.routers.get(name)?)
    }

    pub fn default_router(&self) -> Result<Arc<RoutingEngine>, MessagingError> {
        Ok(self.inner.routers.default_engine()?)
    }

    /// Register or replace a named routing engine
    pub fn register_router(&self, router: RoutingEngine) -> Arc<RoutingEngine> {
        self.inner.routers.register(router)
    }

    /// Producer by name, created on first use
    pub fn producer(&self, name: &str) -> Result<Arc<Producer>, MessagingError> {
        self.inner.resolve_producer(name)
    }

    /// Move dead-lettered messages back to their queues
    pub async fn recover_dlq_messages(
        &self,
        dlq_queue: &str,
        options: RecoveryOptions,
    ) -> Result<RecoveryReport, MessagingError> {
        self.inner.dlq.recover_dlq_messages(dlq_queue, options).await
    }

    // ------------------------------------------------------------------------
    // Health and Metrics
    // ------------------------------------------------------------------------

    pub fn health_check(&self) -> HealthReport {
        let state = self.state();
        let backend_connected = self.inner.backend.is_connected();
        let dlq = self.inner.dlq.stats();
        let consumers: Vec<ConsumerStats> = self.inner.consumer_stats();
        let active_consumers = consumers.iter().filter(|c| c.running).count();
        let health = lock(&self.inner.health);

        let mut status = HealthStatus::Healthy;
        let mut issues = Vec::new();
        let mut degrade = |level: HealthStatus, issue: String| {
            if level == HealthStatus::Unhealthy || status == HealthStatus::Healthy {
                status = level;
            }
            issues.push(issue);
        };

        match state {
            ManagerState::Running => {}
            ManagerState::Pausing | ManagerState::Paused => {
                degrade(HealthStatus::Degraded, format!("manager is {}", state))
            }
            _ => degrade(HealthStatus::Unhealthy, format!("manager is {}", state)),
        }
        if !backend_connected {
            degrade(HealthStatus::Unhealthy, "backend is disconnected".to_string());
        }
        for consumer in consumers.iter().filter(|c| !c.running) {
            degrade(
                HealthStatus::Degraded,
                format!("consumer '{}' is not running", consumer.name),
            );
        }
        if let Some(threshold) = self.inner.dlq.config().alert_threshold {
            if dlq.current_dlq_size >= threshold {
                degrade(
                    HealthStatus::Degraded,
                    format!(
                        "dead letter queues hold {} messages (threshold {})",
                        dlq.current_dlq_size, threshold
                    ),
                );
            }
        }

        HealthReport {
            status,
            state,
            backend_type: self.inner.backend.backend_type(),
            backend_connected,
            consumers: consumers.len(),
            active_consumers,
            producers: read(&self.inner.producers).len(),
            pending_retries: dlq.pending_retries,
            dlq_size: dlq.current_dlq_size,
            reconnects: health.reconnects,
            last_background_check: health.last_check,
            issues,
            checked_at: Timestamp::now(),
        }
    }

    pub async fn metrics(&self) -> ManagerMetrics {
        let producers: Vec<ProducerStats> = {
            let producers = read(&self.inner.producers);
            let mut stats: Vec<ProducerStats> = producers.values().map(|p| p.stats()).collect();
            stats.sort_by(|a, b| a.name.cmp(&b.name));
            stats
        };
        let mut consumers = self.inner.consumer_stats();
        consumers.sort_by(|a, b| a.name.cmp(&b.name));

        let routing = self
            .inner
            .routers
            .names()
            .into_iter()
            .filter_map(|name| {
                let engine = self.inner.routers.get(&name).ok()?;
                Some((name, engine.stats()))
            })
            .collect();

        let uptime_seconds = lock(&self.inner.started_at)
            .map(|started| started.elapsed().as_secs())
            .unwrap_or(0);

        ManagerMetrics {
            state: self.state(),
            uptime_seconds,
            messages_published: producers.iter().map(|p| p.published).sum(),
            publish_failures: producers.iter().map(|p| p.failed).sum(),
            publish_rejections: self.inner.publish_rejections.load(Ordering::Relaxed),
            messages_processed: consumers.iter().map(|c| c.processed).sum(),
            processing_failures: consumers.iter().map(|c| c.failed).sum(),
            processing_rejections: consumers.iter().map(|c| c.rejected).sum(),
            queue_depths: self.inner.queue_depths().await,
            routing,
            dlq: self.inner.dlq.stats(),
            middleware: self.inner.middleware.stats(),
            producers,
            consumers,
        }
    }

    // ------------------------------------------------------------------------
    // Background Tasks
    // ------------------------------------------------------------------------

    fn spawn_background_tasks(&self) {
        let weak = Arc::downgrade(&self.inner);
        let health = tokio::spawn(background_loop(
            Weak::clone(&weak),
            self.inner.config.health_check_interval(),
            self.inner.shutdown_tx.subscribe(),
            Tick::Health,
        ));
        let metrics = tokio::spawn(background_loop(
            weak,
            self.inner.config.metrics_interval(),
            self.inner.shutdown_tx.subscribe(),
            Tick::Metrics,
        ));
        lock(&self.inner.background).extend([health, metrics]);
    }
}

#[derive(Debug, Clone, Copy)]
enum Tick {
    Health,
    Metrics,
}

/// Run `tick` every `period` until shutdown or until the manager is dropped
async fn background_loop(
    inner: Weak<ManagerInner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: Tick,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(task = ?tick, period_ms = period.as_millis() as u64, "Background task started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                match tick {
                    Tick::Health => inner.health_tick().await,
                    Tick::Metrics => inner.metrics_tick().await,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!(task = ?tick, "Background task stopped");
}

impl ManagerInner {
    fn transition(
        &self,
        operation: &str,
        from: &[ManagerState],
        to: ManagerState,
    ) -> Result<(), MessagingError> {
        let mut state = write(&self.state);
        if !from.contains(&*state) || !state.can_transition_to(to) {
            return Err(MessagingError::InvalidState {
                operation: operation.to_string(),
                state: state.to_string(),
            });
        }
        debug!(from = %*state, to = %to, "Manager state change");
        *state = to;
        Ok(())
    }

    /// Set the state without checking the state machine, for failure paths
    fn force_state(&self, to: ManagerState) {
        let mut state = write(&self.state);
        debug!(from = %*state, to = %to, "Manager state change");
        *state = to;
    }

    fn producer(&self, name: &str) -> Arc<Producer> {
        if let Some(producer) = read(&self.producers).get(name) {
            return Arc::clone(producer);
        }
        let mut producers = write(&self.producers);
        let producer = producers.entry(name.to_string()).or_insert_with(|| {
            debug!(producer = %name, "Creating producer");
            Arc::new(Producer::new(name, Arc::clone(&self.backend)))
        });
        Arc::clone(producer)
    }

    fn resolve_producer(&self, name: &str) -> Result<Arc<Producer>, MessagingError> {
        let state = *read(&self.state);
        if !state.accepts_publishes() {
            return Err(MessagingError::NoProducer {
                reason: format!("manager is {}", state),
            });
        }
        let producer = self.producer(name);
        if !producer.is_connected() {
            return Err(MessagingError::NoProducer {
                reason: format!("producer '{}' is disconnected", name),
            });
        }
        Ok(producer)
    }

    /// `None` when the message should be dropped
    fn plan_delivery(&self, engine: &RoutingEngine, message: &Message) -> Option<DeliveryPlan> {
        let started = Instant::now();
        match engine.route(message) {
            Ok(result) => {
                self.metrics.record_routing(
                    started.elapsed(),
                    result.queues.len() + result.exchanges.len(),
                    result.from_cache,
                );
                if !result.is_empty() {
                    return Some(DeliveryPlan::Targets(result));
                }
                if engine.config().fallback == FallbackPolicy::Drop {
                    return None;
                }
                // No rules and no default target: the message addresses itself
                Some(DeliveryPlan::Direct)
            }
            Err(e) => {
                self.metrics.record_error("routing", false);
                warn!(
                    engine = %engine.name(),
                    message_id = %message.id(),
                    routing_key = ?message.headers.routing_key,
                    error = %e,
                    "Routing failed; publishing with the supplied routing key"
                );
                Some(DeliveryPlan::Direct)
            }
        }
    }

    fn consumer_stats(&self) -> Vec<ConsumerStats> {
        lock(&self.consumers)
            .values()
            .map(|handle| handle.counters.snapshot(&handle.config))
            .collect()
    }

    /// Depth of every declared queue and of its dead letter queue, when present
    async fn queue_depths(&self) -> HashMap<String, usize> {
        let suffix = self.backend.dlq_suffix().to_string();
        let names: Vec<String> = read(&self.queues)
            .keys()
            .flat_map(|name| [name.clone(), dlq_name(name, &suffix)])
            .collect();

        let mut depths = HashMap::new();
        for name in names {
            if let Some(depth) = self.backend.queue_depth(&name).await {
                depths.insert(name, depth);
            }
        }
        depths
    }

    async fn health_tick(&self) {
        lock(&self.health).last_check = Some(Timestamp::now());
        if self.backend.is_connected() {
            return;
        }

        warn!(backend = %self.backend.backend_type(), "Backend disconnected; reconnecting");
        match self.backend.connect().await {
            Ok(()) => {
                lock(&self.health).reconnects += 1;
                info!(backend = %self.backend.backend_type(), "Backend reconnected");
            }
            Err(e) => {
                lock(&self.health).failed_reconnects += 1;
                self.metrics.record_error("connection", true);
                warn!(error = %e, "Backend reconnect failed");
            }
        }
    }

    async fn metrics_tick(&self) {
        let depths = self.queue_depths().await;
        for (queue, depth) in &depths {
            self.metrics.record_queue_depth(queue, *depth);
        }

        let ticks = {
            let mut health = lock(&self.health);
            health.metrics_ticks += 1;
            health.metrics_ticks
        };
        let dlq = self.dlq.stats();
        debug!(
            tick = ticks,
            queues = depths.len(),
            pending_retries = dlq.pending_retries,
            dlq_size = dlq.current_dlq_size,
            "Metrics collected"
        );
    }

    async fn join(&self, name: &str, mut task: JoinHandle<()>) {
        match tokio::time::timeout(self.config.shutdown_timeout(), &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = %name, error = %e, "Task ended abnormally"),
            Err(_) => {
                warn!(task = %name, "Task did not stop in time; aborting");
                task.abort();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
