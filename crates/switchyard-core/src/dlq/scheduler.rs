//! Single-task retry scheduler.
//!
//! Pending retries live in a deadline-ordered map. One background task sleeps
//! until the earliest deadline, removes the entry under the lock and only then
//! publishes it, so an entry that was cancelled is never published.
//!
//! A retry the backend refuses goes to the [`RetryFallback`] when one is set,
//! otherwise straight to the backend's dead letter queue.

use crate::backend::MessageBackend;
use crate::message::{Message, MessageId};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;

type ScheduleKey = (Instant, u64);

/// Receives retries whose republish was refused by the backend
#[async_trait]
pub trait RetryFallback: Send + Sync {
    async fn retry_failed(&self, message: Message, queue: String);
}

struct ScheduledRetry {
    message: Message,
    queue: String,
}

#[derive(Default)]
struct SchedulerState {
    entries: BTreeMap<ScheduleKey, ScheduledRetry>,
    index: HashMap<MessageId, ScheduleKey>,
    next_sequence: u64,
    closed: bool,
    published: u64,
}

impl SchedulerState {
    fn remove(&mut self, id: &MessageId) -> Option<ScheduledRetry> {
        let key = self.index.remove(id)?;
        self.entries.remove(&key)
    }

    /// Remove the earliest entry if its deadline has passed, else report the deadline
    fn pop_due(&mut self, now: Instant) -> Result<Option<ScheduledRetry>, Option<Instant>> {
        let key = match self.entries.keys().next() {
            Some(key) => *key,
            None => return Err(None),
        };
        if key.0 > now {
            return Err(Some(key.0));
        }

        let entry = self.entries.remove(&key);
        if let Some(entry) = &entry {
            self.index.remove(entry.message.id());
        }
        Ok(entry)
    }
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    notify: Notify,
    backend: Arc<dyn MessageBackend>,
    fallback: Option<Arc<dyn RetryFallback>>,
}

impl SchedulerInner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run(self: Arc<Self>) {
        debug!("Retry scheduler started");
        loop {
            let next = {
                let mut state = self.state();
                if state.closed {
                    break;
                }
                state.pop_due(Instant::now())
            };

            match next {
                Ok(Some(entry)) => self.fire(entry).await,
                Ok(None) => {}
                Err(Some(deadline)) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                Err(None) => self.notify.notified().await,
            }
        }
        debug!("Retry scheduler stopped");
    }

    async fn fire(&self, entry: ScheduledRetry) {
        let ScheduledRetry { mut message, queue } = entry;
        let message_id = message.id().clone();
        message.reset_to_pending();

        if self.backend.publish_to_queue(&queue, message.clone()).await {
            self.state().published += 1;
            debug!(message_id = %message_id, queue = %queue, "Retry published");
            return;
        }

        warn!(
            message_id = %message_id,
            queue = %queue,
            "Retry publish failed, dead-lettering message"
        );
        match &self.fallback {
            Some(fallback) => fallback.retry_failed(message, queue).await,
            None => {
                if !self.backend.send_to_dlq(message).await {
                    error!(message_id = %message_id, queue = %queue, "Retry message lost");
                }
            }
        }
    }
}

/// Delay queue that republishes failed messages onto their original queue
pub struct RetryScheduler {
    inner: Arc<SchedulerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RetryScheduler {
    /// Spawn the scheduler task. Must be called inside a tokio runtime.
    pub fn start(backend: Arc<dyn MessageBackend>) -> Self {
        Self::spawn(backend, None)
    }

    /// Like [`RetryScheduler::start`], handing refused retries to `fallback`
    pub fn with_fallback(backend: Arc<dyn MessageBackend>, fallback: Arc<dyn RetryFallback>) -> Self {
        Self::spawn(backend, Some(fallback))
    }

    fn spawn(backend: Arc<dyn MessageBackend>, fallback: Option<Arc<dyn RetryFallback>>) -> Self {
        let inner = Arc::new(SchedulerInner {
            state: Mutex::new(SchedulerState::default()),
            notify: Notify::new(),
            backend,
            fallback,
        });
        let task = tokio::spawn(Arc::clone(&inner).run());

        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    /// Schedule `message` for `queue` after `delay`, replacing any pending retry
    /// for the same message. Returns false once the scheduler is shut down.
    pub fn schedule(&self, message: Message, queue: impl Into<String>, delay: Duration) -> bool {
        let queue = queue.into();
        let mut state = self.inner.state();
        if state.closed {
            warn!(message_id = %message.id(), "Retry scheduled after shutdown");
            return false;
        }

        if state.remove(message.id()).is_some() {
            debug!(message_id = %message.id(), "Replacing pending retry");
        }

        let key = (Instant::now() + delay, state.next_sequence);
        state.next_sequence += 1;
        state.index.insert(message.id().clone(), key);
        state.entries.insert(key, ScheduledRetry { message, queue });
        drop(state);

        self.inner.notify.notify_one();
        true
    }

    /// Cancel one pending retry. Returns whether it was still pending.
    pub fn cancel(&self, message_id: &MessageId) -> bool {
        let removed = self.inner.state().remove(message_id).is_some();
        if removed {
            debug!(message_id = %message_id, "Retry cancelled");
            self.inner.notify.notify_one();
        }
        removed
    }

    /// Cancel every pending retry. Returns how many were dropped.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.inner.state();
        let cancelled = state.entries.len();
        state.entries.clear();
        state.index.clear();
        drop(state);

        if cancelled > 0 {
            info!(cancelled, "Pending retries cancelled");
            self.inner.notify.notify_one();
        }
        cancelled
    }

    pub fn is_scheduled(&self, message_id: &MessageId) -> bool {
        self.inner.state().index.contains_key(message_id)
    }

    pub fn pending(&self) -> usize {
        self.inner.state().entries.len()
    }

    /// Retries handed to the backend successfully
    pub fn published(&self) -> u64 {
        self.inner.state().published
    }

    pub fn is_running(&self) -> bool {
        !self.inner.state().closed
    }

    /// Cancel everything and wait for the scheduler task to finish
    pub async fn shutdown(&self) {
        let cancelled = {
            let mut state = self.inner.state();
            state.closed = true;
            let cancelled = state.entries.len();
            state.entries.clear();
            state.index.clear();
            cancelled
        };
        self.inner.notify.notify_one();

        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Retry scheduler task failed");
            }
        }
        info!(cancelled, "Retry scheduler shut down");
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.inner.state().closed = true;
        self.inner.notify.notify_one();
    }
}
