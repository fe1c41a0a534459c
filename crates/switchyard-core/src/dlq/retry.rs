//! # Retry Policy
//!
//! Delay calculation and retry eligibility for failed messages.
//!
//! Five strategies are supported: immediate, fixed, linear, exponential
//! (capped at `max_delay`) and a caller-supplied delay function. Jitter adds
//! ±10% uniform noise to the computed delay.

use crate::error::MessageProcessingError;
use crate::message::Message;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Jitter range applied when `jitter` is enabled
pub const JITTER_FRACTION: f64 = 0.10;

/// Caller-supplied delay for the `custom` strategy, by 0-based attempt
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Extra retry predicate evaluated after the limit and kind lists
pub type RetryFilter = Arc<dyn Fn(&Message, &MessageProcessingError) -> bool + Send + Sync>;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Immediate,
    Fixed,
    Linear,
    #[default]
    Exponential,
    Custom,
}

/// Declarative retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries for any message
    pub max_attempts: u32,

    pub strategy: RetryStrategy,

    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,

    /// Cap for computed delays, in milliseconds
    pub max_delay_ms: u64,

    /// Exponential growth factor
    pub backoff_multiplier: f64,

    pub jitter: bool,

    /// Failure kinds eligible for retry. Empty means every kind.
    pub retry_on: Vec<String>,

    /// Failure kinds that go straight to the dead letter queue
    pub no_retry_on: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 300_000,
            backoff_multiplier: 2.0,
            jitter: true,
            retry_on: Vec::new(),
            no_retry_on: Vec::new(),
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Retry settings plus the function-valued hooks that cannot be configured declaratively
///
/// # Examples
///
/// ```rust
/// use switchyard_core::dlq::retry::{RetryConfig, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(RetryConfig::default()).without_jitter();
///
/// // 1s, 2s, 4s ...
/// assert_eq!(policy.calculate_delay(0), Duration::from_secs(1));
/// assert_eq!(policy.calculate_delay(2), Duration::from_secs(4));
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    custom_delay: Option<DelayFn>,
    filter: Option<RetryFilter>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("has_custom_delay", &self.custom_delay.is_some())
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            custom_delay: None,
            filter: None,
        }
    }

    /// Disable jitter, giving deterministic delays
    pub fn without_jitter(mut self) -> Self {
        self.config.jitter = false;
        self
    }

    /// Delay function used by [`RetryStrategy::Custom`]
    pub fn with_custom_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.custom_delay = Some(Arc::new(delay));
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Message, &MessageProcessingError) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retry limit for one message: the lower of the policy and message limits
    pub fn max_attempts_for(&self, message: &Message) -> u32 {
        self.config.max_attempts.min(message.headers.max_retries)
    }

    /// Calculate the delay before retry `attempt` (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_delay().as_secs_f64();
        let base_secs = match self.config.strategy {
            RetryStrategy::Immediate => 0.0,
            RetryStrategy::Fixed => initial,
            RetryStrategy::Linear => initial * f64::from(attempt.saturating_add(1)),
            RetryStrategy::Exponential => self.exponential_secs(attempt),
            RetryStrategy::Custom => match &self.custom_delay {
                Some(delay) => delay(attempt).as_secs_f64(),
                None => {
                    warn!(attempt, "Custom retry strategy without a delay function, using exponential");
                    self.exponential_secs(attempt)
                }
            },
        };

        let max_delay = self.config.max_delay();
        let capped_secs = if base_secs.is_finite() {
            base_secs.clamp(0.0, max_delay.as_secs_f64())
        } else {
            warn!(attempt, "Retry delay is not finite, using the maximum delay");
            max_delay.as_secs_f64()
        };

        let final_secs = if self.config.jitter && capped_secs > 0.0 {
            Self::add_jitter(capped_secs)
        } else {
            capped_secs
        };

        Duration::try_from_secs_f64(final_secs).unwrap_or(max_delay)
    }

    /// Whether a message that has been retried `attempts` times should be retried again
    pub fn should_retry(
        &self,
        attempts: u32,
        message: &Message,
        error: &MessageProcessingError,
    ) -> bool {
        if attempts >= self.max_attempts_for(message) {
            return false;
        }

        if self.config.no_retry_on.iter().any(|kind| kind == &error.kind) {
            return false;
        }

        if !self.config.retry_on.is_empty()
            && !self.config.retry_on.iter().any(|kind| kind == &error.kind)
        {
            return false;
        }

        match &self.filter {
            Some(filter) => filter(message, error),
            None => true,
        }
    }

    fn exponential_secs(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        self.config.initial_delay().as_secs_f64() * self.config.backoff_multiplier.powi(exponent)
    }

    /// Applies uniform noise in `[delay * 0.9, delay * 1.1]`
    fn add_jitter(delay_secs: f64) -> f64 {
        let mut rng = rand::thread_rng();
        let jitter_range = delay_secs * JITTER_FRACTION;
        let jitter = rng.gen_range(-jitter_range..=jitter_range);
        (delay_secs + jitter).max(0.0)
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
