//! Incremental DLQ statistics.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Window for the rolling throughput figure
pub const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// Read-only snapshot of DLQ activity
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DlqStats {
    /// Failures reported to the manager
    pub total_failed: u64,
    /// Retries scheduled
    pub total_retried: u64,
    pub total_dead_lettered: u64,
    pub total_dropped: u64,
    pub total_recovered: u64,
    /// Messages that succeeded after at least one retry
    pub retry_successes: u64,
    /// Mean retries over messages that reached an outcome
    pub average_retry_attempts: f64,
    pub max_retry_attempts: u32,
    /// Share of retried messages that eventually succeeded
    pub retry_success_rate: f64,
    pub average_time_to_dlq_seconds: f64,
    /// Failures handled in the last 60 seconds
    pub throughput_last_minute: usize,
    /// Ready messages across known dead letter queues
    pub current_dlq_size: usize,
    pub pending_retries: usize,
    pub tracked_messages: usize,
}

/// Mutable accumulator behind [`DlqStats`]
#[derive(Debug, Default)]
pub(crate) struct StatsTracker {
    total_failed: u64,
    total_retried: u64,
    total_dead_lettered: u64,
    total_dropped: u64,
    total_recovered: u64,
    retry_successes: u64,
    /// Retried messages that reached any outcome
    retried_outcomes: u64,
    outcomes: u64,
    retry_attempts_sum: u64,
    max_retry_attempts: u32,
    time_to_dlq_sum: f64,
    recent_failures: VecDeque<Instant>,
    dlq_sizes: HashMap<String, usize>,
}

impl StatsTracker {
    pub(crate) fn record_failure(&mut self) {
        self.total_failed += 1;
        let now = Instant::now();
        self.recent_failures.push_back(now);
        self.prune(now);
    }

    pub(crate) fn record_retry(&mut self) {
        self.total_retried += 1;
    }

    pub(crate) fn record_dead_letter(&mut self, retry_attempts: u32, time_to_dlq: Duration) {
        self.total_dead_lettered += 1;
        self.time_to_dlq_sum += time_to_dlq.as_secs_f64();
        self.record_outcome(retry_attempts);
    }

    pub(crate) fn record_drop(&mut self, retry_attempts: u32) {
        self.total_dropped += 1;
        self.record_outcome(retry_attempts);
    }

    pub(crate) fn record_success(&mut self, retry_attempts: u32) {
        if retry_attempts > 0 {
            self.retry_successes += 1;
        }
        self.record_outcome(retry_attempts);
    }

    pub(crate) fn record_recovered(&mut self, count: usize) {
        self.total_recovered += count as u64;
    }

    pub(crate) fn set_dlq_size(&mut self, queue: &str, size: usize) {
        self.dlq_sizes.insert(queue.to_string(), size);
    }

    pub(crate) fn current_dlq_size(&self) -> usize {
        self.dlq_sizes.values().sum()
    }

    fn record_outcome(&mut self, retry_attempts: u32) {
        self.outcomes += 1;
        if retry_attempts > 0 {
            self.retried_outcomes += 1;
        }
        self.retry_attempts_sum += u64::from(retry_attempts);
        self.max_retry_attempts = self.max_retry_attempts.max(retry_attempts);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.recent_failures.front() {
            if now.duration_since(*front) > THROUGHPUT_WINDOW {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
    }

    pub(crate) fn snapshot(&mut self, pending_retries: usize, tracked_messages: usize) -> DlqStats {
        self.prune(Instant::now());

        let ratio = |numerator: f64, denominator: u64| {
            if denominator == 0 {
                0.0
            } else {
                numerator / denominator as f64
            }
        };

        DlqStats {
            total_failed: self.total_failed,
            total_retried: self.total_retried,
            total_dead_lettered: self.total_dead_lettered,
            total_dropped: self.total_dropped,
            total_recovered: self.total_recovered,
            retry_successes: self.retry_successes,
            average_retry_attempts: ratio(self.retry_attempts_sum as f64, self.outcomes),
            max_retry_attempts: self.max_retry_attempts,
            retry_success_rate: ratio(self.retry_successes as f64, self.retried_outcomes),
            average_time_to_dlq_seconds: ratio(self.time_to_dlq_sum, self.total_dead_lettered),
            throughput_last_minute: self.recent_failures.len(),
            current_dlq_size: self.current_dlq_size(),
            pending_retries,
            tracked_messages,
        }
    }
}
