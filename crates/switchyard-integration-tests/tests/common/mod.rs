//! Common test utilities for Switchyard integration tests
//!
//! This module provides:
//! - A recording message handler with scripted failures
//! - Builders for managers over the in-memory backend
//! - Polling helpers for asynchronous assertions

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use switchyard_core::backends::InMemoryBackend;
use switchyard_core::manager::{ManagerConfig, MessageHandler, MessagingManager, MessagingManagerBuilder};
use switchyard_core::{Message, MessageBackend, MessageProcessingError};
use tokio::time::{sleep, Duration};

// ============================================================================
// Recording Handler
// ============================================================================

/// Handler that records every message and fails the first `failures` calls
#[derive(Clone)]
#[allow(dead_code)]
pub struct RecordingHandler {
    received: Arc<Mutex<Vec<Message>>>,
    calls: Arc<AtomicUsize>,
    failures: usize,
    error_kind: String,
}

#[allow(dead_code)]
impl RecordingHandler {
    pub fn new() -> Self {
        Self::failing(0)
    }

    /// Fail the first `failures` calls, then succeed
    pub fn failing(failures: usize) -> Self {
        Self {
            received: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            failures,
            error_kind: "downstream".to_string(),
        }
    }

    /// Fail every call
    pub fn always_failing() -> Self {
        Self::failing(usize::MAX)
    }

    pub fn with_error_kind(mut self, kind: &str) -> Self {
        self.error_kind = kind.to_string();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages handled successfully
    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    pub fn as_handler(&self) -> Arc<dyn MessageHandler> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &Message) -> Result<(), MessageProcessingError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(MessageProcessingError::new(
                self.error_kind.clone(),
                format!("scripted failure {}", call + 1),
            ));
        }
        self.received.lock().unwrap().push(message.clone());
        Ok(())
    }
}

// ============================================================================
// Manager Fixtures
// ============================================================================

/// Settings with short intervals for tests
#[allow(dead_code)]
pub fn test_settings() -> ManagerConfig {
    ManagerConfig {
        health_check_interval_seconds: 1,
        metrics_interval_seconds: 1,
        consumer_poll_timeout_ms: 50,
        shutdown_timeout_seconds: 5,
        ..ManagerConfig::default()
    }
}

/// A fresh in-memory backend and a builder over it
#[allow(dead_code)]
pub fn test_builder() -> (Arc<InMemoryBackend>, MessagingManagerBuilder) {
    let backend = Arc::new(InMemoryBackend::default());
    let builder = MessagingManagerBuilder::new(backend.clone()).with_settings(test_settings());
    (backend, builder)
}

/// Build and start a manager
#[allow(dead_code)]
pub async fn start(builder: MessagingManagerBuilder) -> MessagingManager {
    let manager = builder.build().expect("manager should build");
    manager.start().await.expect("manager should start");
    manager
}

// ============================================================================
// Polling Helpers
// ============================================================================

/// Poll `condition` every 10ms, panicking after roughly five seconds
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(description: &str, condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", description);
}

/// Wait until `queue` holds exactly `expected` ready messages
#[allow(dead_code)]
pub async fn wait_for_depth(backend: &InMemoryBackend, queue: &str, expected: usize) {
    for _ in 0..500 {
        if backend.queue_depth(queue).await == Some(expected) {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "queue {} never reached depth {} (is {:?})",
        queue,
        expected,
        backend.queue_depth(queue).await
    );
}
