//! Consumers: user handlers, the middleware/DLQ adapter around them, and the consume loop.

use crate::backend::MessageBackend;
use crate::dlq::{DlqManager, FailureOutcome};
use crate::error::MessageProcessingError;
use crate::message::Message;
use crate::middleware::{
    ChainOutcome, MiddlewareChain, MiddlewareContext, MiddlewareDirection, MiddlewareStage,
};
use crate::monitoring::MetricsCollector;
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Shortest wait between polls when the backend returns without a message
const MIN_IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// Business logic for consumed messages.
///
/// Handlers must be idempotent: a message can be delivered more than once
/// after a crash or a retry.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), MessageProcessingError>;
}

/// [`MessageHandler`] backed by an async closure receiving its own copy of the message
pub struct FnHandler<F, Fut> {
    handler: F,
    _future: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a handler
///
/// ```rust
/// use switchyard_core::manager::handler_fn;
/// use switchyard_core::{Message, MessageProcessingError};
///
/// let handler = handler_fn(|message: Message| async move {
///     if message.body.is_empty() {
///         return Err(MessageProcessingError::new("empty_body", "nothing to do"));
///     }
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(handler: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MessageProcessingError>> + Send + 'static,
{
    Arc::new(FnHandler {
        handler,
        _future: PhantomData,
    })
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), MessageProcessingError>> + Send,
{
    async fn handle(&self, message: &Message) -> Result<(), MessageProcessingError> {
        (self.handler)(message.clone()).await
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Consumer declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Unique among the manager's consumers
    pub name: String,
    pub queue: String,
    /// Wait per consume call; the manager default applies when unset
    pub poll_timeout: Option<Duration>,
}

impl ConsumerConfig {
    pub fn new(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            poll_timeout: None,
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }
}

/// Snapshot of a consumer's activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub name: String,
    pub queue: String,
    pub running: bool,
    pub processed: u64,
    pub failed: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ConsumerCounters {
    running: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl ConsumerCounters {
    pub(crate) fn snapshot(&self, config: &ConsumerConfig) -> ConsumerStats {
        ConsumerStats {
            name: config.name.clone(),
            queue: config.queue.clone(),
            running: self.running.load(Ordering::Acquire),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Completed => &self.processed,
            DispatchOutcome::Rejected { .. } => &self.rejected,
            DispatchOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Handler Adapter
// ============================================================================

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Handled and acknowledged
    Completed,
    /// A `pre_process` middleware rejected the message; it was discarded
    Rejected { middleware: String },
    /// The handler or a middleware failed; the DLQ manager took the message
    Failed(FailureOutcome),
}

/// Runs a handler inside the inbound middleware stages.
///
/// Handler failures never escape: they go through `on_error` middleware and
/// then to the DLQ manager.
pub struct HandlerAdapter {
    handler: Arc<dyn MessageHandler>,
    backend: Arc<dyn MessageBackend>,
    middleware: Arc<MiddlewareChain>,
    dlq: Arc<DlqManager>,
    metrics: Arc<dyn MetricsCollector>,
}

impl HandlerAdapter {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        backend: Arc<dyn MessageBackend>,
        middleware: Arc<MiddlewareChain>,
        dlq: Arc<DlqManager>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self {
            handler,
            backend,
            middleware,
            dlq,
            metrics,
        }
    }

    /// Process one message consumed from `queue`
    pub async fn dispatch(&self, mut message: Message, queue: &str) -> DispatchOutcome {
        let started = Instant::now();
        message.mark_processing();

        let outcome = match self.run(&mut message, queue).await {
            Ok(()) => {
                message.mark_completed();
                self.backend.ack(&message).await;
                self.dlq.record_success(&message);
                DispatchOutcome::Completed
            }
            Err(Failure::Rejected { middleware }) => {
                self.metrics
                    .record_middleware_rejection(&middleware, MiddlewareStage::PreProcess.as_str());
                self.backend.nack(message, false).await;
                DispatchOutcome::Rejected { middleware }
            }
            Err(Failure::Error(error)) => {
                let context = MiddlewareContext::new(
                    MiddlewareStage::OnError,
                    MiddlewareDirection::Inbound,
                )
                .with_queue(queue);
                if let Err(e) = self
                    .middleware
                    .process_with_context(&mut message, &context)
                    .await
                {
                    warn!(message_id = %message.id(), error = %e, "on_error middleware failed");
                }

                warn!(
                    message_id = %message.id(),
                    queue = %queue,
                    error = %error,
                    "Message processing failed"
                );
                DispatchOutcome::Failed(self.dlq.handle_failure(message, queue, &error).await)
            }
        };

        self.metrics.record_consume(
            queue,
            started.elapsed(),
            outcome == DispatchOutcome::Completed,
        );
        outcome
    }

    async fn run(&self, message: &mut Message, queue: &str) -> Result<(), Failure> {
        let context =
            MiddlewareContext::new(MiddlewareStage::PreProcess, MiddlewareDirection::Inbound)
                .with_queue(queue);
        match self.middleware.process_with_context(message, &context).await {
            Ok(ChainOutcome::Rejected { middleware }) => {
                return Err(Failure::Rejected { middleware })
            }
            Ok(_) => {}
            Err(e) => {
                return Err(Failure::Error(MessageProcessingError::new(
                    "middleware",
                    e.to_string(),
                )))
            }
        }

        self.handler.handle(message).await.map_err(Failure::Error)?;

        let context =
            MiddlewareContext::new(MiddlewareStage::PostProcess, MiddlewareDirection::Inbound)
                .with_queue(queue);
        if let Err(e) = self.middleware.process_with_context(message, &context).await {
            // The handler already ran; a retry would repeat its side effects
            warn!(message_id = %message.id(), error = %e, "post_process middleware failed");
        }
        Ok(())
    }
}

enum Failure {
    Rejected { middleware: String },
    Error(MessageProcessingError),
}

// ============================================================================
// Consume Loop
// ============================================================================

/// Poll `queue` until `stop` flips, pausing while `paused` is set.
///
/// A message already being handled when `stop` flips is finished first.
pub(crate) async fn run_consumer(
    config: ConsumerConfig,
    poll_timeout: Duration,
    adapter: HandlerAdapter,
    counters: Arc<ConsumerCounters>,
    mut stop: watch::Receiver<bool>,
    mut paused: watch::Receiver<bool>,
) {
    counters.running.store(true, Ordering::Release);
    info!(consumer = %config.name, queue = %config.queue, "Consumer started");

    loop {
        if *stop.borrow() {
            break;
        }

        if *paused.borrow() {
            let changed = tokio::select! {
                biased;
                changed = stop.changed() => changed,
                changed = paused.changed() => changed,
            };
            if changed.is_err() {
                break;
            }
            continue;
        }

        let poll_deadline = Instant::now() + poll_timeout.max(MIN_IDLE_BACKOFF);
        let consumed = tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            changed = paused.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            consumed = adapter.backend.consume(&config.queue, poll_timeout) => consumed,
        };

        match consumed {
            Some(message) => {
                debug!(consumer = %config.name, message_id = %message.id(), "Dispatching message");
                let outcome = adapter.dispatch(message, &config.queue).await;
                counters.record(&outcome);
            }
            // The backend gave up before the poll timeout (disconnected or
            // unknown queue): wait out the rest of the poll instead of spinning.
            None if Instant::now() < poll_deadline => {
                debug!(
                    consumer = %config.name,
                    queue = %config.queue,
                    connected = adapter.backend.is_connected(),
                    "Consume returned early, backing off"
                );
                tokio::select! {
                    biased;
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = paused.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(poll_deadline) => {}
                }
            }
            None => {}
        }
    }

    counters.running.store(false, Ordering::Release);
    info!(consumer = %config.name, "Consumer stopped");
}
