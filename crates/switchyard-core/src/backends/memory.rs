//! In-memory backend for testing, development and single-process deployments.
//!
//! This backend provides a fully functional broker model:
//! - Direct, topic, fanout and headers exchanges with queue bindings
//! - Per-queue priority ordering, FIFO within a priority tier
//! - Queue length limits, queue TTL and per-message expiration
//! - Delivery tags for ack/nack bookkeeping
//! - Dead letter queues named `<queue><suffix>` or routed through a dead letter exchange
//!
//! Consumers blocked in [`MessageBackend::consume`] are woken through a
//! [`tokio::sync::Notify`] per queue.

use crate::backend::{
    dlq_name, BackendConfig, BackendType, BindingConfig, ExchangeConfig, ExchangeInfo,
    ExchangeType, MessageBackend, QueueConfig, QueueInfo,
};
use crate::dlq::headers::ORIGINAL_QUEUE;
use crate::error::{ConnectionError, MessagingError, ValidationError};
use crate::message::{validate_name, Delivery, Message, MessageId};
use crate::routing::matcher::{topic_to_regex, values_match};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message waiting in a queue
struct StoredMessage {
    priority: u8,
    sequence: u64,
    enqueued_at: Instant,
    message: Message,
}

impl PartialEq for StoredMessage {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for StoredMessage {}

impl PartialOrd for StoredMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StoredMessage {
    /// Max-heap order: higher priority first, then lower sequence (FIFO)
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Internal state for a single queue
struct MemoryQueue {
    config: QueueConfig,
    ready: BinaryHeap<StoredMessage>,
    /// Delivered but not yet acked, by delivery tag
    unacked: HashMap<u64, MessageId>,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    fn new(config: QueueConfig) -> Self {
        Self {
            config,
            ready: BinaryHeap::new(),
            unacked: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.config.name.clone(),
            message_count: self.ready.len(),
            unacked_count: self.unacked.len(),
            config: self.config.clone(),
        }
    }

    fn is_stale(&self, stored: &StoredMessage, now: Instant) -> bool {
        if stored.message.is_expired() {
            return true;
        }
        match self.config.message_ttl {
            Some(ttl) => now.duration_since(stored.enqueued_at) >= Duration::from_secs(ttl),
            None => false,
        }
    }

    /// Pop the next live message, discarding stale ones
    fn pop_ready(&mut self) -> Option<Message> {
        let now = Instant::now();
        while let Some(stored) = self.ready.pop() {
            if self.is_stale(&stored, now) {
                debug!(
                    queue = %self.config.name,
                    message_id = %stored.message.id(),
                    "Discarding expired message"
                );
                continue;
            }
            return Some(stored.message);
        }
        None
    }
}

struct Binding {
    queue: String,
    routing_key: String,
    arguments: HashMap<String, Value>,
    topic: Option<Regex>,
}

impl Binding {
    fn matches_headers(&self, headers: &HashMap<String, Value>) -> bool {
        let match_any = self
            .arguments
            .get("x-match")
            .and_then(Value::as_str)
            .is_some_and(|mode| mode.eq_ignore_ascii_case("any"));

        let mut conditions = self
            .arguments
            .iter()
            .filter(|(key, _)| !key.starts_with("x-"));

        let holds = |(key, expected): (&String, &Value)| {
            headers
                .get(key)
                .is_some_and(|actual| values_match(expected, actual))
        };

        if match_any {
            conditions.any(holds)
        } else {
            conditions.all(holds)
        }
    }
}

struct MemoryExchange {
    config: ExchangeConfig,
    bindings: Vec<Binding>,
}

impl MemoryExchange {
    fn info(&self) -> ExchangeInfo {
        ExchangeInfo {
            name: self.config.name.clone(),
            exchange_type: self.config.exchange_type,
            binding_count: self.bindings.len(),
            config: self.config.clone(),
        }
    }

    /// Queues bound to this exchange that accept the routing key and headers
    fn route(&self, routing_key: &str, headers: &HashMap<String, Value>) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            let matched = match self.config.exchange_type {
                ExchangeType::Direct => binding.routing_key == routing_key,
                ExchangeType::Fanout => true,
                ExchangeType::Topic => binding
                    .topic
                    .as_ref()
                    .is_some_and(|regex| regex.is_match(routing_key)),
                ExchangeType::Headers => binding.matches_headers(headers),
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }
}

/// Storage for all queues and exchanges
#[derive(Default)]
struct BackendState {
    queues: HashMap<String, MemoryQueue>,
    exchanges: HashMap<String, MemoryExchange>,
    next_sequence: u64,
    next_tag: u64,
}

impl BackendState {
    /// Declare `name` with default settings if it does not exist
    fn ensure_queue(&mut self, name: &str) {
        if !self.queues.contains_key(name) {
            debug!(queue = %name, "Auto-declaring queue");
            self.queues
                .insert(name.to_string(), MemoryQueue::new(QueueConfig::new(name)));
        }
    }

    fn enqueue(
        &mut self,
        queue_name: &str,
        mut message: Message,
        default_limit: usize,
    ) -> Result<(), String> {
        let sequence = self.next_sequence;
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| "queue does not exist".to_string())?;

        let limit = queue.config.max_length.unwrap_or(default_limit);
        if queue.ready.len() >= limit {
            return Err(format!("queue is full ({} messages)", limit));
        }

        let mut priority = message.headers.priority.value();
        if let Some(max) = queue.config.max_priority {
            priority = priority.min(max);
        }

        message.take_delivery();
        queue.ready.push(StoredMessage {
            priority,
            sequence,
            enqueued_at: Instant::now(),
            message,
        });
        queue.notify.notify_one();
        self.next_sequence += 1;
        Ok(())
    }

    /// Deliver one copy to each target. Returns how many copies were stored.
    fn deliver(&mut self, targets: &[String], message: &Message, default_limit: usize) -> usize {
        let mut delivered = 0;
        for queue in targets {
            match self.enqueue(queue, message.clone(), default_limit) {
                Ok(()) => delivered += 1,
                Err(reason) => warn!(
                    queue = %queue,
                    message_id = %message.id(),
                    reason = %reason,
                    "Message not enqueued"
                ),
            }
        }
        delivered
    }

    /// Remove a delivery tag from its queue's unacked set
    fn settle(&mut self, delivery: &Delivery) -> bool {
        self.queues
            .get_mut(&delivery.queue)
            .and_then(|queue| queue.unacked.remove(&delivery.tag))
            .is_some()
    }
}

// ============================================================================
// InMemoryBackend
// ============================================================================

/// In-process broker implementing [`MessageBackend`]
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use switchyard_core::backends::InMemoryBackend;
/// use switchyard_core::{Message, MessageBackend, QueueConfig};
///
/// # tokio_test::block_on(async {
/// let backend = InMemoryBackend::default();
/// backend.connect().await.unwrap();
/// backend.create_queue(QueueConfig::new("orders")).await.unwrap();
///
/// let published = backend
///     .publish(Message::new("order created").with_routing_key("orders"))
///     .await;
/// assert!(published);
///
/// let received = backend.consume("orders", Duration::from_millis(10)).await.unwrap();
/// assert_eq!(received.body.as_text(), "order created");
/// assert!(backend.ack(&received).await);
/// # });
/// ```
pub struct InMemoryBackend {
    config: BackendConfig,
    connected: AtomicBool,
    state: Mutex<BackendState>,
}

impl InMemoryBackend {
    /// Create new in-memory backend with configuration
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            connected: AtomicBool::new(false),
            state: Mutex::new(BackendState::default()),
        }
    }

    /// Drop the connection without a clean disconnect, as a broker outage would
    pub fn simulate_connection_loss(&self) {
        warn!("Simulating in-memory backend connection loss");
        self.connected.store(false, AtomicOrdering::SeqCst);
        self.wake_all();
    }

    /// Snapshot of every declared queue
    pub fn queues(&self) -> Vec<QueueInfo> {
        let state = self.state();
        let mut queues: Vec<_> = state.queues.values().map(MemoryQueue::info).collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        queues
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected {
                backend: BackendType::Memory.to_string(),
            })
        }
    }

    fn default_limit(&self) -> usize {
        self.config.memory.max_queue_size
    }

    fn wake_all(&self) {
        let state = self.state();
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(BackendConfig::default())
    }
}

#[async_trait]
impl MessageBackend for InMemoryBackend {
    async fn connect(&self) -> Result<(), ConnectionError> {
        if self.connected.swap(true, AtomicOrdering::SeqCst) {
            debug!("In-memory backend already connected");
        } else {
            info!("In-memory backend connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        if self.connected.swap(false, AtomicOrdering::SeqCst) {
            info!("In-memory backend disconnected");
            self.wake_all();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(AtomicOrdering::SeqCst)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }

    fn dlq_suffix(&self) -> &str {
        &self.config.dlq_suffix
    }

    async fn create_queue(&self, config: QueueConfig) -> Result<QueueInfo, MessagingError> {
        self.ensure_connected()?;
        validate_name("queue", &config.name)?;

        let mut state = self.state();
        if let Some(existing) = state.queues.get(&config.name) {
            debug!(queue = %config.name, "Queue already declared");
            return Ok(existing.info());
        }

        info!(
            queue = %config.name,
            max_length = ?config.max_length,
            message_ttl = ?config.message_ttl,
            "Queue declared"
        );
        let queue = MemoryQueue::new(config);
        let info = queue.info();
        state.queues.insert(info.name.clone(), queue);
        Ok(info)
    }

    async fn create_exchange(
        &self,
        config: ExchangeConfig,
    ) -> Result<ExchangeInfo, MessagingError> {
        self.ensure_connected()?;
        validate_name("exchange", &config.name)?;

        let mut state = self.state();
        if let Some(existing) = state.exchanges.get(&config.name) {
            if existing.config.exchange_type != config.exchange_type {
                return Err(ValidationError::InvalidFormat {
                    field: "exchange_type".to_string(),
                    message: format!(
                        "exchange '{}' already declared as {}",
                        config.name, existing.config.exchange_type
                    ),
                }
                .into());
            }
            return Ok(existing.info());
        }

        info!(
            exchange = %config.name,
            exchange_type = %config.exchange_type,
            "Exchange declared"
        );
        let exchange = MemoryExchange {
            config,
            bindings: Vec::new(),
        };
        let info = exchange.info();
        state.exchanges.insert(info.name.clone(), exchange);
        Ok(info)
    }

    async fn bind_queue(&self, binding: BindingConfig) -> Result<(), MessagingError> {
        self.ensure_connected()?;

        let mut state = self.state();
        if !state.queues.contains_key(&binding.queue) {
            return Err(MessagingError::QueueNotFound {
                queue_name: binding.queue,
            });
        }
        let exchange = state.exchanges.get_mut(&binding.exchange).ok_or_else(|| {
            MessagingError::ExchangeNotFound {
                exchange_name: binding.exchange.clone(),
            }
        })?;

        let already_bound = exchange.bindings.iter().any(|existing| {
            existing.queue == binding.queue
                && existing.routing_key == binding.routing_key
                && existing.arguments == binding.arguments
        });
        if already_bound {
            return Ok(());
        }

        let topic = match exchange.config.exchange_type {
            ExchangeType::Topic => Some(Regex::new(&topic_to_regex(&binding.routing_key)).map_err(
                |e| ValidationError::InvalidFormat {
                    field: "routing_key".to_string(),
                    message: e.to_string(),
                },
            )?),
            _ => None,
        };

        info!(
            queue = %binding.queue,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            "Queue bound"
        );
        exchange.bindings.push(Binding {
            queue: binding.queue,
            routing_key: binding.routing_key,
            arguments: binding.arguments,
            topic,
        });
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<bool, MessagingError> {
        self.ensure_connected()?;

        let mut state = self.state();
        let removed = state.queues.remove(name);
        for exchange in state.exchanges.values_mut() {
            exchange.bindings.retain(|binding| binding.queue != name);
        }

        match removed {
            Some(queue) => {
                info!(queue = %name, dropped = queue.ready.len(), "Queue deleted");
                queue.notify.notify_waiters();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge_queue(&self, name: &str) -> Result<usize, MessagingError> {
        self.ensure_connected()?;

        let mut state = self.state();
        let queue = state
            .queues
            .get_mut(name)
            .ok_or_else(|| MessagingError::QueueNotFound {
                queue_name: name.to_string(),
            })?;
        let purged = queue.ready.len();
        queue.ready.clear();
        info!(queue = %name, purged, "Queue purged");
        Ok(purged)
    }

    async fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state().queues.get(name).map(|queue| queue.ready.len())
    }

    async fn publish(&self, message: Message) -> bool {
        if !self.is_connected() {
            warn!(message_id = %message.id(), "Publish on disconnected backend");
            return false;
        }

        let default_limit = self.default_limit();
        let mut state = self.state();

        let exchange_name = message
            .headers
            .exchange
            .as_deref()
            .filter(|name| !name.is_empty());
        let routing_key = message.headers.routing_key.as_deref().unwrap_or("");

        let targets = match exchange_name {
            Some(exchange_name) => match state.exchanges.get(exchange_name) {
                Some(exchange) => exchange.route(routing_key, &message.headers.custom),
                None => {
                    warn!(
                        exchange = %exchange_name,
                        message_id = %message.id(),
                        "Publish to unknown exchange"
                    );
                    return false;
                }
            },
            None => {
                if let Err(e) = validate_name("routing_key", routing_key) {
                    warn!(
                        message_id = %message.id(),
                        error = %e,
                        "Direct publish needs a queue name as routing key"
                    );
                    return false;
                }
                state.ensure_queue(routing_key);
                vec![routing_key.to_string()]
            }
        };

        if targets.is_empty() {
            debug!(
                message_id = %message.id(),
                exchange = ?exchange_name,
                routing_key = %routing_key,
                "Message unroutable"
            );
            return false;
        }

        let delivered = state.deliver(&targets, &message, default_limit);
        debug!(
            message_id = %message.id(),
            delivered,
            targets = targets.len(),
            "Message published"
        );
        delivered > 0
    }

    async fn publish_to_queue(&self, queue: &str, message: Message) -> bool {
        if !self.is_connected() {
            warn!(message_id = %message.id(), queue = %queue, "Publish on disconnected backend");
            return false;
        }
        if let Err(e) = validate_name("queue", queue) {
            warn!(message_id = %message.id(), error = %e, "Invalid target queue");
            return false;
        }

        let default_limit = self.default_limit();
        let mut state = self.state();
        state.ensure_queue(queue);
        state.deliver(&[queue.to_string()], &message, default_limit) > 0
    }

    async fn consume(&self, queue_name: &str, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;

        loop {
            if !self.is_connected() {
                return None;
            }

            let notify = {
                let mut state = self.state();
                let BackendState {
                    queues, next_tag, ..
                } = &mut *state;

                let queue = match queues.get_mut(queue_name) {
                    Some(queue) => queue,
                    None => {
                        debug!(queue = %queue_name, "Consume from unknown queue");
                        return None;
                    }
                };

                if let Some(mut message) = queue.pop_ready() {
                    *next_tag += 1;
                    let tag = *next_tag;
                    queue.unacked.insert(tag, message.id().clone());
                    message.set_delivery(Delivery {
                        queue: queue_name.to_string(),
                        tag,
                    });
                    return Some(message);
                }

                Arc::clone(&queue.notify)
            };

            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    async fn ack(&self, message: &Message) -> bool {
        let delivery = match message.delivery() {
            Some(delivery) => delivery,
            None => {
                warn!(message_id = %message.id(), "Ack for message without delivery");
                return false;
            }
        };

        let settled = self.state().settle(delivery);
        if !settled {
            warn!(
                message_id = %message.id(),
                queue = %delivery.queue,
                tag = delivery.tag,
                "Ack for unknown delivery tag"
            );
        }
        settled
    }

    async fn nack(&self, mut message: Message, requeue: bool) -> bool {
        let delivery = match message.take_delivery() {
            Some(delivery) => delivery,
            None => {
                warn!(message_id = %message.id(), "Nack for message without delivery");
                return false;
            }
        };

        let default_limit = self.default_limit();
        let mut state = self.state();
        if !state.settle(&delivery) {
            warn!(
                message_id = %message.id(),
                queue = %delivery.queue,
                tag = delivery.tag,
                "Nack for unknown delivery tag"
            );
            return false;
        }

        if requeue {
            message.reset_to_pending();
            match state.enqueue(&delivery.queue, message, default_limit) {
                Ok(()) => true,
                Err(reason) => {
                    warn!(queue = %delivery.queue, reason = %reason, "Requeue failed");
                    false
                }
            }
        } else {
            message.mark_failed();
            debug!(
                message_id = %message.id(),
                queue = %delivery.queue,
                "Message rejected without requeue"
            );
            true
        }
    }

    async fn send_to_dlq(&self, mut message: Message) -> bool {
        if !self.is_connected() {
            warn!(message_id = %message.id(), "Dead-letter on disconnected backend");
            return false;
        }

        let original_queue = message
            .header(ORIGINAL_QUEUE)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| message.delivery().map(|d| d.queue.clone()))
            .or_else(|| message.headers.routing_key.clone());

        let original_queue = match original_queue {
            Some(queue) => queue,
            None => {
                warn!(message_id = %message.id(), "Cannot resolve original queue for dead-letter");
                return false;
            }
        };

        let default_limit = self.default_limit();
        let mut state = self.state();
        if let Some(delivery) = message.take_delivery() {
            state.settle(&delivery);
        }

        message
            .headers
            .custom
            .entry(ORIGINAL_QUEUE.to_string())
            .or_insert_with(|| Value::String(original_queue.clone()));
        message.mark_dead_letter();

        let dead_letter_exchange = state.queues.get(&original_queue).and_then(|queue| {
            queue.config.dead_letter_exchange.clone().map(|exchange| {
                let routing_key = queue
                    .config
                    .dead_letter_routing_key
                    .clone()
                    .or_else(|| message.headers.routing_key.clone())
                    .unwrap_or_default();
                (exchange, routing_key)
            })
        });

        let routed = dead_letter_exchange.and_then(|(exchange, routing_key)| {
            state
                .exchanges
                .get(&exchange)
                .map(|ex| ex.route(&routing_key, &message.headers.custom))
        });
        let targets = match routed {
            Some(targets) => targets,
            None => {
                let dlq = dlq_name(&original_queue, &self.config.dlq_suffix);
                state.ensure_queue(&dlq);
                vec![dlq]
            }
        };

        let delivered = state.deliver(&targets, &message, default_limit);
        if delivered > 0 {
            info!(
                message_id = %message.id(),
                original_queue = %original_queue,
                targets = ?targets,
                "Message dead-lettered"
            );
        }
        delivered > 0
    }
}
