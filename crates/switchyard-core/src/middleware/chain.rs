//! Ordered middleware execution with per-middleware statistics.

use super::{Middleware, MiddlewareAction, MiddlewareContext, MiddlewareDirection, MiddlewareStage};
use crate::error::MiddlewareError;
use crate::message::Message;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "chain_tests.rs"]
mod tests;

/// How a chain run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Every applicable middleware continued
    Completed,
    /// A middleware asked to skip the rest of the chain
    Stopped { middleware: String },
    /// A middleware rejected the message
    Rejected { middleware: String },
}

impl ChainOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

#[derive(Debug, Default)]
struct StatsCell {
    executions: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    rejections: AtomicU64,
    total_nanos: AtomicU64,
}

impl StatsCell {
    fn record(&self, elapsed: Duration) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}

/// Snapshot of one middleware's activity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MiddlewareStats {
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    pub executions: u64,
    /// Failures and timeouts
    pub errors: u64,
    pub timeouts: u64,
    pub rejections: u64,
    pub average_latency: Duration,
}

#[derive(Clone)]
struct ChainEntry {
    middleware: Arc<dyn Middleware>,
    enabled: Arc<AtomicBool>,
    stats: Arc<StatsCell>,
    /// Insertion order, breaks priority ties
    sequence: u64,
}

impl ChainEntry {
    fn snapshot(&self) -> MiddlewareStats {
        let executions = self.stats.executions.load(Ordering::Relaxed);
        let total = self.stats.total_nanos.load(Ordering::Relaxed);
        let average_latency = if executions == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(total / executions)
        };

        MiddlewareStats {
            name: self.middleware.name().to_string(),
            enabled: self.enabled.load(Ordering::Relaxed),
            priority: self.middleware.config().priority,
            executions,
            errors: self.stats.errors.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            rejections: self.stats.rejections.load(Ordering::Relaxed),
            average_latency,
        }
    }
}

#[derive(Default)]
struct ChainState {
    entries: Vec<ChainEntry>,
    next_sequence: u64,
}

/// Middleware registry and executor.
///
/// Middleware run by descending priority, ties in registration order. The
/// registry lock is released before any middleware runs.
#[derive(Default)]
pub struct MiddlewareChain {
    state: RwLock<ChainState>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a middleware. Names must be unique.
    pub fn add(&self, middleware: Arc<dyn Middleware>) -> Result<(), MiddlewareError> {
        let mut state = self.write();
        let name = middleware.name().to_string();
        if state
            .entries
            .iter()
            .any(|entry| entry.middleware.name() == name)
        {
            return Err(MiddlewareError::Duplicate { middleware: name });
        }

        let enabled = middleware.config().enabled;
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.entries.push(ChainEntry {
            middleware,
            enabled: Arc::new(AtomicBool::new(enabled)),
            stats: Arc::new(StatsCell::default()),
            sequence,
        });
        state.entries.sort_by(|a, b| {
            b.middleware
                .config()
                .priority
                .cmp(&a.middleware.config().priority)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });

        debug!(middleware = %name, "Middleware registered");
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<(), MiddlewareError> {
        let mut state = self.write();
        let before = state.entries.len();
        state.entries.retain(|entry| entry.middleware.name() != name);
        if state.entries.len() == before {
            return Err(MiddlewareError::NotFound {
                middleware: name.to_string(),
            });
        }
        debug!(middleware = %name, "Middleware removed");
        Ok(())
    }

    pub fn enable(&self, name: &str) -> Result<(), MiddlewareError> {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> Result<(), MiddlewareError> {
        self.set_enabled(name, false)
    }

    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.read()
            .entries
            .iter()
            .find(|entry| entry.middleware.name() == name)
            .map(|entry| entry.enabled.load(Ordering::Relaxed))
    }

    /// Names in execution order
    pub fn names(&self) -> Vec<String> {
        self.read()
            .entries
            .iter()
            .map(|entry| entry.middleware.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statistics for every registered middleware, in execution order
    pub fn stats(&self) -> Vec<MiddlewareStats> {
        self.read().entries.iter().map(ChainEntry::snapshot).collect()
    }

    pub fn stats_for(&self, name: &str) -> Option<MiddlewareStats> {
        self.read()
            .entries
            .iter()
            .find(|entry| entry.middleware.name() == name)
            .map(ChainEntry::snapshot)
    }

    /// Run the chain for one stage and direction
    pub async fn process(
        &self,
        message: &mut Message,
        stage: MiddlewareStage,
        direction: MiddlewareDirection,
    ) -> Result<ChainOutcome, MiddlewareError> {
        self.process_with_context(message, &MiddlewareContext::new(stage, direction))
            .await
    }

    /// Run the chain with a caller-built context
    pub async fn process_with_context(
        &self,
        message: &mut Message,
        context: &MiddlewareContext,
    ) -> Result<ChainOutcome, MiddlewareError> {
        let entries: Vec<ChainEntry> = self.read().entries.clone();

        for entry in entries {
            if !entry.enabled.load(Ordering::Relaxed) {
                continue;
            }
            let config = entry.middleware.config();
            if !config.applies_to(message, context.stage, context.direction) {
                continue;
            }

            let name = config.name.as_str();
            let started = Instant::now();
            let result = match config.timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, entry.middleware.process(message, context))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => {
                            entry.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                            Err(MiddlewareError::Timeout {
                                middleware: name.to_string(),
                                duration: limit,
                            })
                        }
                    }
                }
                None => entry.middleware.process(message, context).await,
            };
            entry.stats.record(started.elapsed());

            match result {
                Ok(MiddlewareAction::Continue) => {}
                Ok(MiddlewareAction::Reject) => {
                    entry.stats.rejections.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        middleware = %name,
                        stage = %context.stage,
                        message_id = %message.id(),
                        "Message rejected by middleware"
                    );
                    return Ok(ChainOutcome::Rejected {
                        middleware: name.to_string(),
                    });
                }
                Ok(MiddlewareAction::SkipRemaining) => {
                    return Ok(ChainOutcome::Stopped {
                        middleware: name.to_string(),
                    });
                }
                Err(e) => {
                    entry.stats.errors.fetch_add(1, Ordering::Relaxed);
                    if config.continue_on_error {
                        warn!(
                            middleware = %name,
                            stage = %context.stage,
                            error = %e,
                            "Middleware failed, continuing"
                        );
                        continue;
                    }
                    warn!(
                        middleware = %name,
                        stage = %context.stage,
                        error = %e,
                        "Middleware failed, halting chain"
                    );
                    return Err(e);
                }
            }
        }

        Ok(ChainOutcome::Completed)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), MiddlewareError> {
        let state = self.read();
        let entry = state
            .entries
            .iter()
            .find(|entry| entry.middleware.name() == name)
            .ok_or_else(|| MiddlewareError::NotFound {
                middleware: name.to_string(),
            })?;
        entry.enabled.store(enabled, Ordering::Relaxed);
        debug!(middleware = %name, enabled, "Middleware toggled");
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, ChainState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ChainState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
