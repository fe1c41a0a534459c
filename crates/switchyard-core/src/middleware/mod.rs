//! # Middleware
//!
//! Staged, prioritized hooks around message processing.
//!
//! Each [`Middleware`] declares in its [`MiddlewareConfig`] which of the twelve
//! [`MiddlewareStage`]s it runs in, for which [`MiddlewareDirection`], and under
//! which conditions. [`MiddlewareChain`] runs the applicable middleware in
//! descending priority order, timing each call and keeping per-middleware
//! statistics.

use crate::error::MiddlewareError;
use crate::message::{Message, MessagePriority};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub mod builtin;
pub mod chain;
pub mod metrics;
pub mod rate_limit;

pub use builtin::{
    AuthenticationMiddleware, CompressionMiddleware, EnrichmentMiddleware, LoggingMiddleware,
    TransformationMiddleware, ValidationMiddleware,
};
pub use chain::{ChainOutcome, MiddlewareChain, MiddlewareStats};
pub use metrics::{MetricsMiddleware, StageMetrics};
pub use rate_limit::RateLimitMiddleware;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

// ============================================================================
// Stages and Directions
// ============================================================================

/// Point in the message lifecycle where middleware runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewareStage {
    PreDeserialize,
    PostDeserialize,
    PreRoute,
    PostRoute,
    PreProcess,
    PostProcess,
    PreSerialize,
    PostSerialize,
    PrePublish,
    PostPublish,
    OnError,
    OnRetry,
}

impl MiddlewareStage {
    pub const ALL: [MiddlewareStage; 12] = [
        Self::PreDeserialize,
        Self::PostDeserialize,
        Self::PreRoute,
        Self::PostRoute,
        Self::PreProcess,
        Self::PostProcess,
        Self::PreSerialize,
        Self::PostSerialize,
        Self::PrePublish,
        Self::PostPublish,
        Self::OnError,
        Self::OnRetry,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreDeserialize => "pre_deserialize",
            Self::PostDeserialize => "post_deserialize",
            Self::PreRoute => "pre_route",
            Self::PostRoute => "post_route",
            Self::PreProcess => "pre_process",
            Self::PostProcess => "post_process",
            Self::PreSerialize => "pre_serialize",
            Self::PostSerialize => "post_serialize",
            Self::PrePublish => "pre_publish",
            Self::PostPublish => "post_publish",
            Self::OnError => "on_error",
            Self::OnRetry => "on_retry",
        }
    }

    /// Stages that see the message on its way to the broker
    pub fn is_outbound(self) -> bool {
        matches!(
            self,
            Self::PreRoute
                | Self::PostRoute
                | Self::PreSerialize
                | Self::PostSerialize
                | Self::PrePublish
                | Self::PostPublish
        )
    }
}

impl std::fmt::Display for MiddlewareStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message flow a middleware participates in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewareDirection {
    /// Consumed messages
    Inbound,
    /// Published messages
    Outbound,
    #[default]
    Bidirectional,
}

impl MiddlewareDirection {
    /// Whether middleware declared for `self` runs for a call made in `call`
    pub fn accepts(self, call: MiddlewareDirection) -> bool {
        self == Self::Bidirectional || call == Self::Bidirectional || self == call
    }
}

// ============================================================================
// Conditions
// ============================================================================

/// Predicate on a message used to apply or skip middleware
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewareCondition {
    RoutingKey(String),
    Exchange(String),
    MinPriority(MessagePriority),
    Header { key: String, value: Value },
    /// Body variant name: `text`, `json` or `bytes`
    BodyType(String),
}

impl MiddlewareCondition {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Self::RoutingKey(key) => message.headers.routing_key.as_deref() == Some(key.as_str()),
            Self::Exchange(exchange) => {
                message.headers.exchange.as_deref() == Some(exchange.as_str())
            }
            Self::MinPriority(priority) => message.headers.priority.value() >= priority.value(),
            Self::Header { key, value } => message.header(key) == Some(value),
            Self::BodyType(name) => message.body.type_name() == name,
        }
    }
}

// ============================================================================
// Configuration and Contract
// ============================================================================

/// Declared behaviour of one middleware
#[derive(Debug, Clone, PartialEq)]
pub struct MiddlewareConfig {
    pub name: String,
    pub enabled: bool,
    /// Higher runs first
    pub priority: i32,
    pub stages: Vec<MiddlewareStage>,
    pub direction: MiddlewareDirection,
    pub timeout: Option<Duration>,
    /// Keep running the chain when this middleware fails or times out
    pub continue_on_error: bool,
    /// All must hold for the middleware to run
    pub apply_if: Vec<MiddlewareCondition>,
    /// Any holding skips the middleware
    pub skip_if: Vec<MiddlewareCondition>,
}

impl MiddlewareConfig {
    /// Enabled, priority 0, no stages
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            priority: 0,
            stages: Vec::new(),
            direction: MiddlewareDirection::Bidirectional,
            timeout: None,
            continue_on_error: false,
            apply_if: Vec::new(),
            skip_if: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_stages(mut self, stages: impl IntoIterator<Item = MiddlewareStage>) -> Self {
        self.stages = stages.into_iter().collect();
        self
    }

    pub fn with_direction(mut self, direction: MiddlewareDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn apply_if(mut self, condition: MiddlewareCondition) -> Self {
        self.apply_if.push(condition);
        self
    }

    pub fn skip_if(mut self, condition: MiddlewareCondition) -> Self {
        self.skip_if.push(condition);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Stage, direction and condition check. The enabled flag is tracked by the chain.
    pub fn applies_to(
        &self,
        message: &Message,
        stage: MiddlewareStage,
        direction: MiddlewareDirection,
    ) -> bool {
        self.stages.contains(&stage)
            && self.direction.accepts(direction)
            && self.apply_if.iter().all(|condition| condition.matches(message))
            && !self.skip_if.iter().any(|condition| condition.matches(message))
    }
}

/// What the chain does after a middleware returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareAction {
    Continue,
    /// Halt the chain and report the message as rejected
    Reject,
    /// Halt the chain without rejecting the message
    SkipRemaining,
}

/// Call-site information handed to each middleware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareContext {
    pub stage: MiddlewareStage,
    pub direction: MiddlewareDirection,
    /// Queue the message was consumed from, for inbound calls
    pub queue: Option<String>,
}

impl MiddlewareContext {
    pub fn new(stage: MiddlewareStage, direction: MiddlewareDirection) -> Self {
        Self {
            stage,
            direction,
            queue: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

/// A message processing hook
#[async_trait]
pub trait Middleware: Send + Sync {
    fn config(&self) -> &MiddlewareConfig;

    fn name(&self) -> &str {
        &self.config().name
    }

    /// Inspect or modify the message
    async fn process(
        &self,
        message: &mut Message,
        context: &MiddlewareContext,
    ) -> Result<MiddlewareAction, MiddlewareError>;
}
