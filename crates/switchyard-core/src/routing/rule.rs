//! Routing rule definitions.

use super::matcher::{MatchType, PatternMatcher};
use crate::message::{Message, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Predicate evaluated before a rule's matcher
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// User routing function returning target queues. An empty list means "no match".
pub type CustomRouter = Arc<dyn Fn(&Message) -> Result<Vec<String>, String> + Send + Sync>;

/// Kind of matcher a rule applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingType {
    /// Pattern against the routing key, per `match_type`
    #[default]
    Direct,
    /// AMQP topic pattern against the routing key
    Topic,
    /// Always matches
    Fanout,
    /// All header conditions must hold
    Headers,
    /// Conditions against the stringified body
    Content,
    /// Delegates to a [`CustomRouter`]
    Custom,
}

/// Condition on the stringified message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum ContentCondition {
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    Regex(String),
}

/// Match statistics shared by every clone of a rule
#[derive(Debug, Default)]
pub struct RuleStats {
    match_count: AtomicU64,
    last_match: Mutex<Option<Timestamp>>,
}

impl RuleStats {
    pub(crate) fn record_match(&self) {
        self.match_count.fetch_add(1, Ordering::Relaxed);
        let mut last = self
            .last_match
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Some(Timestamp::now());
    }

    pub fn match_count(&self) -> u64 {
        self.match_count.load(Ordering::Relaxed)
    }

    pub fn last_match(&self) -> Option<Timestamp> {
        *self
            .last_match
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A prioritized routing rule.
///
/// Rules are evaluated by descending `priority`, ties broken by ascending `name`.
/// Function-valued fields (`filter`, `custom_router`) cannot be declared in
/// configuration and are attached with the builder methods.
#[derive(Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub routing_type: RoutingType,
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub match_type: MatchType,
    #[serde(default)]
    pub target_queues: Vec<String>,
    #[serde(default)]
    pub target_exchanges: Vec<String>,
    #[serde(default)]
    pub header_conditions: HashMap<String, Value>,
    #[serde(default)]
    pub content_conditions: Vec<ContentCondition>,
    #[serde(skip)]
    pub filter: Option<MessageFilter>,
    #[serde(skip)]
    pub custom_router: Option<CustomRouter>,
    #[serde(skip)]
    stats: Arc<RuleStats>,
}

fn default_enabled() -> bool {
    true
}

impl std::fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingRule")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("routing_type", &self.routing_type)
            .field("pattern", &self.pattern)
            .field("match_type", &self.match_type)
            .field("target_queues", &self.target_queues)
            .field("target_exchanges", &self.target_exchanges)
            .field("header_conditions", &self.header_conditions)
            .field("content_conditions", &self.content_conditions)
            .field("has_filter", &self.filter.is_some())
            .field("has_custom_router", &self.custom_router.is_some())
            .field("match_count", &self.stats.match_count())
            .finish()
    }
}

impl RoutingRule {
    /// Create an enabled rule with no targets
    pub fn new(name: impl Into<String>, routing_type: RoutingType) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            enabled: true,
            routing_type,
            pattern: String::new(),
            match_type: MatchType::Exact,
            target_queues: Vec::new(),
            target_exchanges: Vec::new(),
            header_conditions: HashMap::new(),
            content_conditions: Vec::new(),
            filter: None,
            custom_router: None,
            stats: Arc::new(RuleStats::default()),
        }
    }

    /// Routing-key rule compared exactly
    pub fn direct(name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self::new(name, RoutingType::Direct).with_pattern(routing_key)
    }

    /// Routing-key rule with AMQP topic wildcards
    pub fn topic(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(name, RoutingType::Topic).with_pattern(pattern)
    }

    pub fn fanout(name: impl Into<String>) -> Self {
        Self::new(name, RoutingType::Fanout)
    }

    pub fn headers(name: impl Into<String>) -> Self {
        Self::new(name, RoutingType::Headers)
    }

    pub fn content(name: impl Into<String>) -> Self {
        Self::new(name, RoutingType::Content)
    }

    pub fn custom<F>(name: impl Into<String>, router: F) -> Self
    where
        F: Fn(&Message) -> Result<Vec<String>, String> + Send + Sync + 'static,
    {
        let mut rule = Self::new(name, RoutingType::Custom);
        rule.custom_router = Some(Arc::new(router));
        rule
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    pub fn with_match_type(mut self, match_type: MatchType) -> Self {
        self.match_type = match_type;
        self
    }

    pub fn to_queue(mut self, queue: impl Into<String>) -> Self {
        self.target_queues.push(queue.into());
        self
    }

    pub fn to_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.target_exchanges.push(exchange.into());
        self
    }

    pub fn with_header_condition(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.header_conditions.insert(key.into(), value.into());
        self
    }

    pub fn with_content_condition(mut self, condition: ContentCondition) -> Self {
        self.content_conditions.push(condition);
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Statistics shared with every clone of this rule
    pub fn stats(&self) -> &RuleStats {
        &self.stats
    }

    pub(crate) fn stats_handle(&self) -> Arc<RuleStats> {
        Arc::clone(&self.stats)
    }

    /// Whether the outcome depends on anything other than the cache key fields
    pub fn depends_on_body(&self) -> bool {
        self.filter.is_some()
            || matches!(self.routing_type, RoutingType::Content | RoutingType::Custom)
    }

    /// Compile the rule's patterns once
    pub(crate) fn compile(&self) -> CompiledPatterns {
        let pattern = match self.routing_type {
            RoutingType::Direct => Some(PatternMatcher::new(&self.pattern, self.match_type)),
            RoutingType::Topic => Some(PatternMatcher::topic(&self.pattern)),
            RoutingType::Content if !self.pattern.is_empty() => {
                Some(PatternMatcher::new(&self.pattern, self.match_type))
            }
            _ => None,
        };

        let content = self
            .content_conditions
            .iter()
            .map(|condition| match condition {
                ContentCondition::Regex(pattern) => {
                    Some(PatternMatcher::new(pattern, MatchType::Regex))
                }
                _ => None,
            })
            .collect();

        CompiledPatterns { pattern, content }
    }
}

/// Pre-compiled matchers for one rule
#[derive(Debug, Clone)]
pub(crate) struct CompiledPatterns {
    pub(crate) pattern: Option<PatternMatcher>,
    /// Parallel to `content_conditions`; `Some` for regex conditions
    pub(crate) content: Vec<Option<PatternMatcher>>,
}
