//! Metrics collection seam.
//!
//! The core records what happens to messages through [`MetricsCollector`]; an
//! embedding application supplies an implementation that exports them (for
//! example to Prometheus).
//!
//! Recording is best-effort: implementations must never fail or block
//! messaging operations.
//!
//! # Examples
//!
//! ```rust
//! use switchyard_core::monitoring::{InMemoryMetricsCollector, MetricsCollector};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let collector = Arc::new(InMemoryMetricsCollector::new());
//! let metrics: Arc<dyn MetricsCollector> = collector.clone();
//!
//! metrics.record_publish(Duration::from_millis(3), true);
//! metrics.record_dead_letter("orders");
//!
//! let snapshot = collector.snapshot();
//! assert_eq!(snapshot.published, 1);
//! assert_eq!(snapshot.dead_lettered.get("orders"), Some(&1));
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[cfg(test)]
#[path = "monitoring_tests.rs"]
mod tests;

/// Metrics collector for messaging operations.
///
/// All methods take `&self` so a collector can be shared as
/// `Arc<dyn MetricsCollector>` across tasks.
pub trait MetricsCollector: Send + Sync {
    /// Record a publish attempt.
    ///
    /// - `duration`: Time spent in middleware, routing and the backend
    /// - `success`: Whether the backend accepted the message
    fn record_publish(&self, duration: Duration, success: bool);

    /// Record one handled delivery.
    ///
    /// - `queue`: Queue the message was consumed from
    /// - `duration`: Handler time including middleware
    /// - `success`: Whether the handler succeeded
    fn record_consume(&self, queue: &str, duration: Duration, success: bool);

    /// Record a routing decision.
    fn record_routing(&self, duration: Duration, target_count: usize, cache_hit: bool);

    /// Record a scheduled retry. `attempt` is 1-based.
    fn record_retry(&self, queue: &str, attempt: u32);

    fn record_dead_letter(&self, queue: &str);

    /// Gauge of ready messages in a queue
    fn record_queue_depth(&self, queue: &str, depth: usize);

    fn record_middleware_rejection(&self, middleware: &str, stage: &str);

    /// Record an error occurrence by category (e.g. "connection", "routing")
    fn record_error(&self, category: &str, is_transient: bool);
}

/// Collector that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetricsCollector;

impl MetricsCollector for NoOpMetricsCollector {
    fn record_publish(&self, _duration: Duration, _success: bool) {}

    fn record_consume(&self, _queue: &str, _duration: Duration, _success: bool) {}

    fn record_routing(&self, _duration: Duration, _target_count: usize, _cache_hit: bool) {}

    fn record_retry(&self, _queue: &str, _attempt: u32) {}

    fn record_dead_letter(&self, _queue: &str) {}

    fn record_queue_depth(&self, _queue: &str, _depth: usize) {}

    fn record_middleware_rejection(&self, _middleware: &str, _stage: &str) {}

    fn record_error(&self, _category: &str, _is_transient: bool) {}
}

/// Counters captured by [`InMemoryMetricsCollector`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub publish_failures: u64,
    pub consumed: u64,
    pub consume_failures: u64,
    pub routed: u64,
    pub routing_cache_hits: u64,
    pub retries: HashMap<String, u64>,
    pub dead_lettered: HashMap<String, u64>,
    pub queue_depths: HashMap<String, usize>,
    pub middleware_rejections: HashMap<String, u64>,
    pub errors: HashMap<String, u64>,
    pub transient_errors: u64,
    /// Total publish time in seconds, for averaging
    pub publish_seconds: f64,
    pub consume_seconds: f64,
}

/// Collector that keeps counters in memory, for tests and the periodic metrics tick
#[derive(Debug, Default)]
pub struct InMemoryMetricsCollector {
    snapshot: Mutex<MetricsSnapshot>,
}

impl InMemoryMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().clone()
    }

    pub fn reset(&self) {
        *self.lock() = MetricsSnapshot::default();
    }

    fn lock(&self) -> MutexGuard<'_, MetricsSnapshot> {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MetricsCollector for InMemoryMetricsCollector {
    fn record_publish(&self, duration: Duration, success: bool) {
        let mut snapshot = self.lock();
        if success {
            snapshot.published += 1;
        } else {
            snapshot.publish_failures += 1;
        }
        snapshot.publish_seconds += duration.as_secs_f64();
    }

    fn record_consume(&self, _queue: &str, duration: Duration, success: bool) {
        let mut snapshot = self.lock();
        if success {
            snapshot.consumed += 1;
        } else {
            snapshot.consume_failures += 1;
        }
        snapshot.consume_seconds += duration.as_secs_f64();
    }

    fn record_routing(&self, _duration: Duration, _target_count: usize, cache_hit: bool) {
        let mut snapshot = self.lock();
        snapshot.routed += 1;
        if cache_hit {
            snapshot.routing_cache_hits += 1;
        }
    }

    fn record_retry(&self, queue: &str, _attempt: u32) {
        *self.lock().retries.entry(queue.to_string()).or_default() += 1;
    }

    fn record_dead_letter(&self, queue: &str) {
        *self.lock().dead_lettered.entry(queue.to_string()).or_default() += 1;
    }

    fn record_queue_depth(&self, queue: &str, depth: usize) {
        self.lock().queue_depths.insert(queue.to_string(), depth);
    }

    fn record_middleware_rejection(&self, middleware: &str, stage: &str) {
        *self
            .lock()
            .middleware_rejections
            .entry(format!("{}:{}", middleware, stage))
            .or_default() += 1;
    }

    fn record_error(&self, category: &str, is_transient: bool) {
        let mut snapshot = self.lock();
        *snapshot.errors.entry(category.to_string()).or_default() += 1;
        if is_transient {
            snapshot.transient_errors += 1;
        }
    }
}
