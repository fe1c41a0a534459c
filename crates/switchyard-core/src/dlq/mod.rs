//! # Dead Letter and Retry Management
//!
//! [`DlqManager`] decides what happens to a message whose handler failed:
//! schedule a retry with backoff, publish it to the dead letter queue with
//! audit headers, drop it, or hand it to a custom [`DlqHandler`].
//!
//! Dead-lettered messages land on `<original_queue><dlq_suffix>` (default
//! `.dlq`) and carry the `x-dlq-*` headers listed in [`headers`].
//! [`DlqManager::recover_dlq_messages`] strips those headers again and moves
//! messages back to their original queue.
//!
//! Failure tracking is per message id and is discarded once the message is
//! dead-lettered, dropped or succeeds.

use crate::backend::{dlq_name, MessageBackend};
use crate::error::{ConfigurationError, ConnectionError, MessageProcessingError, MessagingError};
use crate::message::{Message, MessageId, Timestamp};
use crate::monitoring::{MetricsCollector, NoOpMetricsCollector};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub mod retry;
pub mod scheduler;
pub mod stats;

pub use retry::{RetryConfig, RetryPolicy, RetryStrategy};
pub use scheduler::{RetryFallback, RetryScheduler};
pub use stats::DlqStats;

use stats::StatsTracker;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

/// Custom header keys written on dead-lettered messages
pub mod headers {
    /// Prefix shared by every DLQ-only header
    pub const PREFIX: &str = "x-dlq-";

    pub const ORIGINAL_QUEUE: &str = "x-dlq-original-queue";
    pub const FAILURE_COUNT: &str = "x-dlq-failure-count";
    pub const RETRY_ATTEMPTS: &str = "x-dlq-retry-attempts";
    pub const FIRST_FAILURE: &str = "x-dlq-first-failure";
    pub const LAST_FAILURE: &str = "x-dlq-last-failure";
    pub const FAILURE_REASONS: &str = "x-dlq-failure-reasons";
    pub const TIME_TO_DLQ_SECONDS: &str = "x-dlq-time-to-dlq-seconds";
    pub const TTL_SECONDS: &str = "x-dlq-ttl-seconds";

    pub fn is_dlq_header(key: &str) -> bool {
        key.starts_with(PREFIX)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// What to do with a failed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqPolicy {
    /// Retry while the policy allows, then dead-letter
    #[default]
    RetryThenDlq,
    ImmediateDlq,
    /// Discard the message
    Drop,
    /// Ask the configured [`DlqHandler`]; fall back to retry-then-DLQ if it declines
    CustomHandler,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub policy: DlqPolicy,
    pub retry: RetryConfig,

    /// Lifetime of dead-lettered messages, in seconds
    pub dlq_ttl_seconds: Option<u64>,

    /// Alert once the total size of known dead letter queues reaches this
    pub alert_threshold: Option<usize>,

    /// Upper bound on messages with open failure tracking
    pub max_tracked_messages: usize,
}

impl DlqConfig {
    /// Check retry bounds and tracking limits
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let retry = &self.retry;
        if retry.max_delay_ms < retry.initial_delay_ms {
            return Err(invalid("dlq.retry.max_delay_ms must not be below initial_delay_ms"));
        }
        // Custom falls back to exponential backoff without a delay function
        let uses_multiplier = matches!(
            retry.strategy,
            RetryStrategy::Exponential | RetryStrategy::Custom
        );
        if uses_multiplier
            && !(retry.backoff_multiplier.is_finite() && retry.backoff_multiplier >= 1.0)
        {
            return Err(invalid(
                "dlq.retry.backoff_multiplier must be a finite number of at least 1.0",
            ));
        }
        if self.max_tracked_messages == 0 {
            return Err(invalid("dlq.max_tracked_messages must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigurationError {
    ConfigurationError::Invalid {
        message: message.to_string(),
    }
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            policy: DlqPolicy::RetryThenDlq,
            retry: RetryConfig::default(),
            dlq_ttl_seconds: None,
            alert_threshold: None,
            max_tracked_messages: 10_000,
        }
    }
}

// ============================================================================
// Failure Tracking
// ============================================================================

/// One scheduled retry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAttempt {
    /// 1-based retry number
    pub attempt: u32,
    pub scheduled_at: Timestamp,
    pub delay_ms: u64,
    pub reason: String,
}

/// Failure history of one message
#[derive(Debug, Clone, Serialize)]
pub struct DlqMessage {
    pub message: Message,
    pub original_queue: String,
    pub failure_count: u32,
    pub retry_attempts: u32,
    pub first_failure_time: Timestamp,
    pub last_failure_time: Timestamp,
    pub failure_reasons: Vec<String>,
    pub retry_history: Vec<RetryAttempt>,
}

impl DlqMessage {
    fn new(message: Message, original_queue: &str, now: Timestamp) -> Self {
        // Seed from the message so a dropped tracking entry cannot reset the retry budget
        let retry_attempts = message.headers.retry_count.saturating_sub(1);
        Self {
            message,
            original_queue: original_queue.to_string(),
            failure_count: 0,
            retry_attempts,
            first_failure_time: now,
            last_failure_time: now,
            failure_reasons: Vec::new(),
            retry_history: Vec::new(),
        }
    }

    fn record_failure(&mut self, message: Message, reason: String, now: Timestamp) {
        self.message = message;
        self.failure_count += 1;
        self.last_failure_time = now;
        self.failure_reasons.push(reason);
    }

    /// Seconds between the first failure and now
    fn time_to_dlq(&self) -> Duration {
        self.first_failure_time.elapsed().to_std().unwrap_or_default()
    }

    /// Write the audit headers onto the wrapped message
    fn annotate(&mut self, ttl_seconds: Option<u64>) {
        let time_to_dlq = self.time_to_dlq().as_secs_f64();
        let reasons: Vec<Value> = self
            .failure_reasons
            .iter()
            .map(|reason| Value::String(reason.clone()))
            .collect();

        let custom = &mut self.message.headers.custom;
        custom.insert(
            headers::ORIGINAL_QUEUE.to_string(),
            Value::String(self.original_queue.clone()),
        );
        custom.insert(headers::FAILURE_COUNT.to_string(), self.failure_count.into());
        custom.insert(headers::RETRY_ATTEMPTS.to_string(), self.retry_attempts.into());
        custom.insert(
            headers::FIRST_FAILURE.to_string(),
            Value::String(self.first_failure_time.to_rfc3339()),
        );
        custom.insert(
            headers::LAST_FAILURE.to_string(),
            Value::String(self.last_failure_time.to_rfc3339()),
        );
        custom.insert(headers::FAILURE_REASONS.to_string(), Value::Array(reasons));
        custom.insert(headers::TIME_TO_DLQ_SECONDS.to_string(), time_to_dlq.into());

        if let Some(ttl) = ttl_seconds {
            custom.insert(headers::TTL_SECONDS.to_string(), ttl.into());
            // Expiration counts from the message timestamp
            let age = self.message.headers.timestamp.elapsed().num_seconds().max(0) as u64;
            self.message.headers.expiration = Some(age.saturating_add(ttl));
        }
    }
}

/// Result of [`DlqManager::handle_failure`]
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    RetryScheduled { attempt: u32, delay: Duration },
    DeadLettered { queue: String },
    Dropped,
    /// A custom handler took ownership of the failure
    Handled,
    /// The backend refused the dead-lettered message
    DeadLetterFailed,
}

/// Custom failure handling for [`DlqPolicy::CustomHandler`]
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Return `true` once the failure is fully handled
    async fn handle(&self, failure: &DlqMessage, error: &MessageProcessingError) -> bool;
}

/// Raised when dead letter queues grow past the configured threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqAlert {
    pub dlq_queue: String,
    pub current_dlq_size: usize,
    pub threshold: usize,
}

pub type AlertCallback = Arc<dyn Fn(&DlqAlert) + Send + Sync>;

pub type RecoveryFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

// ============================================================================
// Recovery
// ============================================================================

/// Options for [`DlqManager::recover_dlq_messages`]
#[derive(Clone)]
pub struct RecoveryOptions {
    /// Queue to republish to. Defaults to each message's original queue.
    pub target_queue: Option<String>,
    pub max_messages: Option<usize>,
    /// Only matching messages are recovered; the rest go back to the DLQ
    pub filter: Option<RecoveryFilter>,
    /// Wait per consume call
    pub poll_timeout: Duration,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            target_queue: None,
            max_messages: None,
            filter: None,
            poll_timeout: Duration::from_millis(100),
        }
    }
}

impl std::fmt::Debug for RecoveryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryOptions")
            .field("target_queue", &self.target_queue)
            .field("max_messages", &self.max_messages)
            .field("has_filter", &self.filter.is_some())
            .field("poll_timeout", &self.poll_timeout)
            .finish()
    }
}

impl RecoveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target_queue(mut self, queue: impl Into<String>) -> Self {
        self.target_queue = Some(queue.into());
        self
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = Some(max_messages);
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub recovered: usize,
    /// Rejected by the filter and returned to the DLQ
    pub skipped: usize,
    /// Could not be republished and were returned to the DLQ
    pub failed: usize,
}

// ============================================================================
// DlqManager
// ============================================================================

/// Dead-letter state shared with the retry scheduler
struct DlqCore {
    config: DlqConfig,
    backend: Arc<dyn MessageBackend>,
    tracked: Mutex<HashMap<MessageId, DlqMessage>>,
    stats: Mutex<StatsTracker>,
    alert: RwLock<Option<AlertCallback>>,
    metrics: RwLock<Arc<dyn MetricsCollector>>,
}

impl DlqCore {
    async fn dead_letter(&self, mut failure: DlqMessage) -> FailureOutcome {
        let time_to_dlq = failure.time_to_dlq();
        failure.annotate(self.config.dlq_ttl_seconds);
        failure.message.take_delivery();

        let DlqMessage {
            message,
            original_queue,
            retry_attempts,
            failure_count,
            ..
        } = failure;
        let message_id = message.id().clone();
        let dlq_queue = dlq_name(&original_queue, self.backend.dlq_suffix());
        self.untrack(&message_id);

        if !self.backend.send_to_dlq(message).await {
            error!(
                message_id = %message_id,
                queue = %original_queue,
                "Backend refused dead-lettered message"
            );
            self.metrics().record_error("dead_letter", true);
            return FailureOutcome::DeadLetterFailed;
        }

        self.stats_tracker()
            .record_dead_letter(retry_attempts, time_to_dlq);
        self.metrics().record_dead_letter(&original_queue);
        warn!(
            message_id = %message_id,
            queue = %original_queue,
            dlq_queue = %dlq_queue,
            failure_count,
            retry_attempts,
            "Message dead-lettered"
        );

        self.refresh_dlq_size(&dlq_queue).await;
        FailureOutcome::DeadLettered { queue: dlq_queue }
    }

    async fn refresh_dlq_size(&self, dlq_queue: &str) {
        let depth = self.backend.queue_depth(dlq_queue).await.unwrap_or(0);
        self.metrics().record_queue_depth(dlq_queue, depth);

        let total = {
            let mut stats = self.stats_tracker();
            stats.set_dlq_size(dlq_queue, depth);
            stats.current_dlq_size()
        };

        let alert = self
            .alert
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let (Some(threshold), Some(alert)) = (self.config.alert_threshold, alert) {
            if total >= threshold {
                warn!(dlq_queue = %dlq_queue, total, threshold, "DLQ size threshold reached");
                alert(&DlqAlert {
                    dlq_queue: dlq_queue.to_string(),
                    current_dlq_size: total,
                    threshold,
                });
            }
        }
    }

    fn evict_if_full(&self, tracked: &mut HashMap<MessageId, DlqMessage>) {
        if tracked.len() < self.config.max_tracked_messages.max(1) {
            return;
        }
        let oldest = tracked
            .iter()
            .min_by_key(|(_, entry)| entry.last_failure_time)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            warn!(message_id = %id, "Failure tracking full, evicting oldest entry");
            tracked.remove(&id);
        }
    }

    fn untrack(&self, message_id: &MessageId) -> Option<DlqMessage> {
        self.tracked_messages().remove(message_id)
    }

    fn metrics(&self) -> Arc<dyn MetricsCollector> {
        self.metrics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn tracked_messages(&self) -> MutexGuard<'_, HashMap<MessageId, DlqMessage>> {
        self.tracked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stats_tracker(&self) -> MutexGuard<'_, StatsTracker> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RetryFallback for DlqCore {
    async fn retry_failed(&self, message: Message, queue: String) {
        let now = Timestamp::now();
        let reason = format!("retry publish to '{}' refused", queue);
        let failure = {
            let mut tracked = self.tracked_messages();
            match tracked.get_mut(message.id()) {
                Some(entry) => {
                    entry.message = message;
                    entry.last_failure_time = now;
                    entry.failure_reasons.push(reason);
                    entry.clone()
                }
                None => {
                    let mut entry = DlqMessage::new(message, &queue, now);
                    entry.failure_reasons.push(reason);
                    entry
                }
            }
        };
        self.dead_letter(failure).await;
    }
}

/// Retry and dead-letter coordinator for one backend
pub struct DlqManager {
    core: Arc<DlqCore>,
    retry_policy: RetryPolicy,
    scheduler: RetryScheduler,
    handler: Option<Arc<dyn DlqHandler>>,
}

impl DlqManager {
    /// Create a manager and start its retry scheduler. Must be called inside a tokio runtime.
    pub fn new(config: DlqConfig, backend: Arc<dyn MessageBackend>) -> Self {
        let retry_policy = RetryPolicy::new(config.retry.clone());
        let core = Arc::new(DlqCore {
            config,
            backend: Arc::clone(&backend),
            tracked: Mutex::new(HashMap::new()),
            stats: Mutex::new(StatsTracker::default()),
            alert: RwLock::new(None),
            metrics: RwLock::new(Arc::new(NoOpMetricsCollector)),
        });
        let scheduler = RetryScheduler::with_fallback(backend, core.clone());

        Self {
            core,
            retry_policy,
            scheduler,
            handler: None,
        }
    }

    /// Delay function for [`RetryStrategy::Custom`]
    pub fn with_custom_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.retry_policy = self.retry_policy.with_custom_delay(delay);
        self
    }

    /// Extra predicate a failure must pass to be retried
    pub fn with_retry_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Message, &MessageProcessingError) -> bool + Send + Sync + 'static,
    {
        self.retry_policy = self.retry_policy.with_filter(filter);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn DlqHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_alert_callback<F>(self, callback: F) -> Self
    where
        F: Fn(&DlqAlert) + Send + Sync + 'static,
    {
        *self
            .core
            .alert
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(callback));
        self
    }

    pub fn with_metrics(self, metrics: Arc<dyn MetricsCollector>) -> Self {
        *self
            .core
            .metrics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = metrics;
        self
    }

    pub fn config(&self) -> &DlqConfig {
        &self.core.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Failure history of a message that has not reached an outcome yet
    pub fn tracked(&self, message_id: &MessageId) -> Option<DlqMessage> {
        self.core.tracked_messages().get(message_id).cloned()
    }

    /// Take ownership of a failed message consumed from `queue`.
    ///
    /// Any pending delivery is acknowledged first; from here on the message
    /// lives in the retry schedule, the dead letter queue, or nowhere.
    pub async fn handle_failure(
        &self,
        mut message: Message,
        queue: &str,
        error: &MessageProcessingError,
    ) -> FailureOutcome {
        if message.delivery().is_some() {
            self.core.backend.ack(&message).await;
            message.take_delivery();
        }

        message.mark_failed();
        let now = Timestamp::now();
        self.core.stats_tracker().record_failure();

        let failure = {
            let mut tracked = self.core.tracked_messages();
            if !tracked.contains_key(message.id()) {
                self.core.evict_if_full(&mut tracked);
            }
            let entry = tracked
                .entry(message.id().clone())
                .or_insert_with(|| DlqMessage::new(message.clone(), queue, now));
            entry.record_failure(message, error.to_string(), now);
            entry.clone()
        };

        debug!(
            message_id = %failure.message.id(),
            queue = %failure.original_queue,
            failure_count = failure.failure_count,
            error_kind = %error.kind,
            "Handling message failure"
        );

        match self.core.config.policy {
            DlqPolicy::Drop => self.drop_message(failure),
            DlqPolicy::ImmediateDlq => self.core.dead_letter(failure).await,
            DlqPolicy::CustomHandler => {
                match &self.handler {
                    Some(handler) => {
                        if handler.handle(&failure, error).await {
                            self.core.untrack(failure.message.id());
                            info!(message_id = %failure.message.id(), "Failure handled by custom handler");
                            return FailureOutcome::Handled;
                        }
                        debug!(message_id = %failure.message.id(), "Custom handler declined failure");
                    }
                    None => warn!("Custom DLQ policy configured without a handler"),
                }
                self.retry_or_dead_letter(failure, error).await
            }
            DlqPolicy::RetryThenDlq => self.retry_or_dead_letter(failure, error).await,
        }
    }

    /// Close tracking for a message that was processed successfully
    pub fn record_success(&self, message: &Message) {
        if let Some(entry) = self.core.untrack(message.id()) {
            self.core.stats_tracker().record_success(entry.retry_attempts);
            if entry.retry_attempts > 0 {
                info!(
                    message_id = %message.id(),
                    retry_attempts = entry.retry_attempts,
                    "Message succeeded after retry"
                );
            }
        }
    }

    /// Move messages from `dlq_queue` back to their original (or a given) queue.
    ///
    /// Every `x-dlq-*` header is removed and the status reset to pending.
    /// Messages rejected by the filter are returned to the DLQ.
    pub async fn recover_dlq_messages(
        &self,
        dlq_queue: &str,
        options: RecoveryOptions,
    ) -> Result<RecoveryReport, MessagingError> {
        if !self.core.backend.is_connected() {
            return Err(ConnectionError::NotConnected {
                backend: self.core.backend.backend_type().to_string(),
            }
            .into());
        }

        let depth = self.core.backend.queue_depth(dlq_queue).await.ok_or_else(|| {
            MessagingError::QueueNotFound {
                queue_name: dlq_queue.to_string(),
            }
        })?;
        let limit = options.max_messages.unwrap_or(usize::MAX);

        let mut report = RecoveryReport::default();
        let mut returned = Vec::new();

        // Bounded by the starting depth so returned messages are not seen twice
        for _ in 0..depth {
            if report.recovered >= limit {
                break;
            }
            let message = match self.core.backend.consume(dlq_queue, options.poll_timeout).await {
                Some(message) => message,
                None => break,
            };

            if let Some(filter) = &options.filter {
                if !filter(&message) {
                    report.skipped += 1;
                    returned.push(message);
                    continue;
                }
            }

            let target = options
                .target_queue
                .clone()
                .or_else(|| original_queue_of(&message))
                .unwrap_or_else(|| strip_dlq_suffix(dlq_queue, self.core.backend.dlq_suffix()));

            let mut restored = message.clone();
            restored.take_delivery();
            clear_dlq_metadata(&mut restored);

            if self.core.backend.publish_to_queue(&target, restored).await {
                self.core.backend.ack(&message).await;
                report.recovered += 1;
                debug!(message_id = %message.id(), target = %target, "Message recovered");
            } else {
                warn!(message_id = %message.id(), target = %target, "Recovery publish failed");
                report.failed += 1;
                returned.push(message);
            }
        }

        for message in returned {
            if !self.core.backend.nack(message, true).await {
                error!(dlq_queue = %dlq_queue, "Failed to return message to DLQ");
            }
        }

        self.core.stats_tracker().record_recovered(report.recovered);
        self.core.refresh_dlq_size(dlq_queue).await;

        info!(
            dlq_queue = %dlq_queue,
            recovered = report.recovered,
            skipped = report.skipped,
            failed = report.failed,
            "DLQ recovery finished"
        );
        Ok(report)
    }

    /// Cancel a pending retry. The message keeps its failure tracking.
    pub fn cancel_retry(&self, message_id: &MessageId) -> bool {
        self.scheduler.cancel(message_id)
    }

    pub fn cancel_all_retries(&self) -> usize {
        self.scheduler.cancel_all()
    }

    pub fn pending_retries(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn stats(&self) -> DlqStats {
        let pending = self.scheduler.pending();
        let tracked = self.core.tracked_messages().len();
        self.core.stats_tracker().snapshot(pending, tracked)
    }

    /// Cancel every pending retry and stop the scheduler task
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        let abandoned = self.core.tracked_messages().len();
        info!(abandoned_tracking = abandoned, "DLQ manager shut down");
    }

    async fn retry_or_dead_letter(
        &self,
        failure: DlqMessage,
        error: &MessageProcessingError,
    ) -> FailureOutcome {
        if !self
            .retry_policy
            .should_retry(failure.retry_attempts, &failure.message, error)
        {
            return self.core.dead_letter(failure).await;
        }
        let attempt = failure.retry_attempts + 1;
        let delay = self.retry_policy.calculate_delay(failure.retry_attempts);
        let mut message = failure.message;
        message.mark_retrying();

        {
            let mut tracked = self.core.tracked_messages();
            if let Some(entry) = tracked.get_mut(message.id()) {
                entry.retry_attempts = attempt;
                entry.message.mark_retrying();
                entry.retry_history.push(RetryAttempt {
                    attempt,
                    scheduled_at: Timestamp::now(),
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    reason: error.to_string(),
                });
            }
        }

        let message_id = message.id().clone();
        if !self
            .scheduler
            .schedule(message.clone(), failure.original_queue.clone(), delay)
        {
            warn!(message_id = %message_id, "Retry scheduler stopped, dead-lettering");
            return self.core.dead_letter(DlqMessage { message, ..failure }).await;
        }
        self.core.stats_tracker().record_retry();
        self.core.metrics().record_retry(&failure.original_queue, attempt);

        info!(
            message_id = %message_id,
            queue = %failure.original_queue,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
        FailureOutcome::RetryScheduled { attempt, delay }
    }

    fn drop_message(&self, failure: DlqMessage) -> FailureOutcome {
        self.core.untrack(failure.message.id());
        self.core.stats_tracker().record_drop(failure.retry_attempts);
        warn!(
            message_id = %failure.message.id(),
            queue = %failure.original_queue,
            "Failed message dropped"
        );
        FailureOutcome::Dropped
    }
}

fn original_queue_of(message: &Message) -> Option<String> {
    message
        .header(headers::ORIGINAL_QUEUE)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn strip_dlq_suffix(dlq_queue: &str, suffix: &str) -> String {
    dlq_queue
        .strip_suffix(suffix)
        .filter(|name| !name.is_empty())
        .unwrap_or(dlq_queue)
        .to_string()
}

/// Remove DLQ-only state so the message can be processed afresh
fn clear_dlq_metadata(message: &mut Message) {
    if message.headers.custom.contains_key(headers::TTL_SECONDS) {
        message.headers.expiration = None;
    }
    message
        .headers
        .custom
        .retain(|key, _| !headers::is_dlq_header(key));
    message.headers.retry_count = 0;
    message.reset_to_pending();
}
