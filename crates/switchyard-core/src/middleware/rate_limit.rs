//! Sliding-window rate limiting.

use super::{Middleware, MiddlewareAction, MiddlewareConfig, MiddlewareContext, MiddlewareStage};
use crate::error::MiddlewareError;
use crate::message::Message;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Rejects a message once the count accepted within the last `window` has
/// reached `rate * window`. A fractional threshold rounds up, so 1.5/s over
/// one second admits two messages.
///
/// The window holds at most [`RateLimitMiddleware::limit`] timestamps.
///
/// # Examples
///
/// ```rust
/// use switchyard_core::middleware::RateLimitMiddleware;
/// use std::time::Duration;
///
/// // 10 messages per second over a 2 second window: 20 allowed
/// let limiter = RateLimitMiddleware::new("limit", 10.0, Duration::from_secs(2));
/// assert_eq!(limiter.limit(), 20);
/// ```
pub struct RateLimitMiddleware {
    config: MiddlewareConfig,
    threshold: f64,
    window: Duration,
    accepted: Mutex<VecDeque<Instant>>,
}

impl RateLimitMiddleware {
    /// Runs before publish, priority 900
    pub fn new(name: impl Into<String>, rate_per_second: f64, window: Duration) -> Self {
        Self::with_config(
            MiddlewareConfig::new(name)
                .with_priority(900)
                .with_stages([MiddlewareStage::PrePublish]),
            rate_per_second,
            window,
        )
    }

    pub fn with_config(config: MiddlewareConfig, rate_per_second: f64, window: Duration) -> Self {
        let threshold = rate_per_second.max(0.0) * window.as_secs_f64();
        let capacity = (threshold.ceil() as usize).min(4096);
        Self {
            config,
            threshold,
            window,
            accepted: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Messages allowed per window
    pub fn limit(&self) -> usize {
        self.threshold.ceil() as usize
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Messages accepted within the current window
    pub fn current_count(&self) -> usize {
        let mut accepted = self.accepted();
        Self::prune(&mut accepted, Instant::now(), self.window);
        accepted.len()
    }

    /// Record one message if the window has room
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut accepted = self.accepted();
        Self::prune(&mut accepted, now, self.window);
        if accepted.len() as f64 >= self.threshold {
            return false;
        }
        accepted.push_back(now);
        true
    }

    fn prune(accepted: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = accepted.front() {
            if now.duration_since(*front) >= window {
                accepted.pop_front();
            } else {
                break;
            }
        }
    }

    fn accepted(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.accepted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    async fn process(
        &self,
        message: &mut Message,
        context: &MiddlewareContext,
    ) -> Result<MiddlewareAction, MiddlewareError> {
        if self.try_acquire() {
            return Ok(MiddlewareAction::Continue);
        }
        warn!(
            middleware = %self.config.name,
            stage = %context.stage,
            message_id = %message.id(),
            limit = self.limit(),
            window_ms = self.window.as_millis() as u64,
            "Rate limit exceeded"
        );
        Ok(MiddlewareAction::Reject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::MiddlewareDirection;

    fn context() -> MiddlewareContext {
        MiddlewareContext::new(MiddlewareStage::PrePublish, MiddlewareDirection::Outbound)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_past_rate_times_window() {
        let limiter = RateLimitMiddleware::new("limit", 2.0, Duration::from_secs(1));
        let mut message = Message::new("x");

        assert_eq!(
            limiter.process(&mut message, &context()).await.unwrap(),
            MiddlewareAction::Continue
        );
        assert_eq!(
            limiter.process(&mut message, &context()).await.unwrap(),
            MiddlewareAction::Continue
        );
        assert_eq!(
            limiter.process(&mut message, &context()).await.unwrap(),
            MiddlewareAction::Reject
        );
        assert_eq!(limiter.current_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = RateLimitMiddleware::new("limit", 1.0, Duration::from_secs(2));
        assert_eq!(limiter.limit(), 2);

        assert!(limiter.try_acquire());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        // First timestamp leaves the window
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.current_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_threshold_rounds_up() {
        let limiter = RateLimitMiddleware::new("limit", 1.5, Duration::from_secs(1));
        assert_eq!(limiter.limit(), 2);

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        let tenth = RateLimitMiddleware::new("limit", 0.1, Duration::from_secs(1));
        assert!(tenth.try_acquire());
        assert!(!tenth.try_acquire());
    }

    #[test]
    fn test_zero_rate_rejects_everything() {
        let limiter = RateLimitMiddleware::new("limit", 0.0, Duration::from_secs(1));
        assert_eq!(limiter.limit(), 0);
        assert!(!limiter.try_acquire());
    }
}
