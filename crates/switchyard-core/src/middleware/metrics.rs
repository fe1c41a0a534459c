//! Per-stage message counts and processing-time samples.

use super::{Middleware, MiddlewareAction, MiddlewareConfig, MiddlewareContext, MiddlewareStage};
use crate::error::MiddlewareError;
use crate::message::{Message, MessageId};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Default number of processing-time samples kept
pub const DEFAULT_MAX_SAMPLES: usize = 1000;

/// Snapshot of what a [`MetricsMiddleware`] has observed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageMetrics {
    pub stage_counts: BTreeMap<MiddlewareStage, u64>,
    /// Samples currently in the rolling window
    pub samples: usize,
    pub average_processing_time: Duration,
    pub max_processing_time: Duration,
    /// Messages seen at `pre_process` that have not reached `post_process` or `on_error`
    pub in_flight: usize,
}

impl StageMetrics {
    pub fn count(&self, stage: MiddlewareStage) -> u64 {
        self.stage_counts.get(&stage).copied().unwrap_or(0)
    }
}

#[derive(Default)]
struct MetricsState {
    stage_counts: BTreeMap<MiddlewareStage, u64>,
    started: HashMap<MessageId, Instant>,
    samples: VecDeque<Duration>,
}

/// Counts messages per stage and samples the time between `pre_process`
/// and `post_process`.
///
/// Start times are held per message id; the table is capped at the sample
/// limit, so untracked messages just go unsampled.
pub struct MetricsMiddleware {
    config: MiddlewareConfig,
    max_samples: usize,
    state: Mutex<MetricsState>,
}

impl MetricsMiddleware {
    /// Runs on every stage with the highest priority so timings include the rest of the chain
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(
            MiddlewareConfig::new(name)
                .with_priority(i32::MAX)
                .with_stages(MiddlewareStage::ALL),
        )
    }

    pub fn with_config(config: MiddlewareConfig) -> Self {
        Self {
            config,
            max_samples: DEFAULT_MAX_SAMPLES,
            state: Mutex::new(MetricsState::default()),
        }
    }

    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples.max(1);
        self
    }

    pub fn snapshot(&self) -> StageMetrics {
        let state = self.state();
        let total: Duration = state.samples.iter().sum();
        let average_processing_time = if state.samples.is_empty() {
            Duration::ZERO
        } else {
            total / state.samples.len() as u32
        };

        StageMetrics {
            stage_counts: state.stage_counts.clone(),
            samples: state.samples.len(),
            average_processing_time,
            max_processing_time: state.samples.iter().max().copied().unwrap_or_default(),
            in_flight: state.started.len(),
        }
    }

    pub fn reset(&self) {
        *self.state() = MetricsState::default();
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn process(
        &self,
        message: &mut Message,
        context: &MiddlewareContext,
    ) -> Result<MiddlewareAction, MiddlewareError> {
        let now = Instant::now();
        let mut state = self.state();
        *state.stage_counts.entry(context.stage).or_default() += 1;

        match context.stage {
            MiddlewareStage::PreProcess => {
                if state.started.len() < self.max_samples {
                    state.started.insert(message.id().clone(), now);
                }
            }
            MiddlewareStage::PostProcess => {
                if let Some(started) = state.started.remove(message.id()) {
                    if state.samples.len() >= self.max_samples {
                        state.samples.pop_front();
                    }
                    state.samples.push_back(now.duration_since(started));
                }
            }
            MiddlewareStage::OnError => {
                state.started.remove(message.id());
            }
            _ => {}
        }

        Ok(MiddlewareAction::Continue)
    }
}
