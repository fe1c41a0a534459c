//! Rule-based routing engine.
//!
//! A [`RoutingEngine`] resolves a message to target queues and exchanges by
//! evaluating its [`RoutingRule`]s in order of descending priority (ties broken by
//! name). Results are cached by routing key, exchange and custom headers whenever no
//! enabled rule inspects the message body.
//!
//! # Example
//!
//! ```rust
//! use switchyard_core::routing::{RouterConfig, RoutingEngine, RoutingRule};
//! use switchyard_core::Message;
//!
//! let engine = RoutingEngine::new("default", RouterConfig::default());
//! engine
//!     .add_rule(RoutingRule::topic("eu-orders", "orders.eu.#").to_queue("eu-orders"))
//!     .unwrap();
//!
//! let message = Message::new("x").with_routing_key("orders.eu.created");
//! let result = engine.route(&message).unwrap();
//! assert_eq!(result.queues, vec!["eu-orders".to_string()]);
//! ```

use crate::error::RoutingError;
use crate::message::{Message, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, warn};

mod cache;
pub mod matcher;
mod rule;

pub use cache::{CacheKey, RoutingCache};
pub use matcher::{MatchType, PatternMatcher};
pub use rule::{ContentCondition, CustomRouter, MessageFilter, RoutingRule, RoutingType, RuleStats};

use matcher::values_match;
use rule::CompiledPatterns;

/// Name of the engine every manager registers by default
pub const DEFAULT_ENGINE: &str = "default";

// ============================================================================
// Configuration and Results
// ============================================================================

/// What to do when no rule matches or a matcher fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Route to `default_queue` / `default_exchange`
    #[default]
    DefaultTarget,
    /// Return an empty result
    Drop,
    /// Fail with a [`RoutingError`]
    Error,
}

/// Routing engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub allow_multiple_targets: bool,
    pub stop_on_first_match: bool,
    pub fallback: FallbackPolicy,
    pub default_queue: Option<String>,
    pub default_exchange: Option<String>,
    pub enable_cache: bool,
    pub cache_ttl_seconds: u64,
    pub cache_max_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            allow_multiple_targets: true,
            stop_on_first_match: false,
            fallback: FallbackPolicy::DefaultTarget,
            default_queue: None,
            default_exchange: None,
            enable_cache: true,
            cache_ttl_seconds: 300,
            cache_max_size: 1000,
        }
    }
}

/// Delivery targets resolved for a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutingResult {
    pub queues: Vec<String>,
    pub exchanges: Vec<String>,
    pub matched_rules: Vec<String>,
    pub fallback_used: bool,
    pub from_cache: bool,
}

impl RoutingResult {
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty() && self.exchanges.is_empty()
    }

    fn push_unique(targets: &mut Vec<String>, candidates: &[String]) {
        for candidate in candidates {
            if !targets.contains(candidate) {
                targets.push(candidate.clone());
            }
        }
    }
}

/// Per-rule statistics snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleMatchStats {
    pub match_count: u64,
    pub last_match: Option<Timestamp>,
}

/// Engine statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoutingStats {
    pub total_routed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fallbacks: u64,
    pub errors: u64,
    pub cache_size: usize,
    pub rules: HashMap<String, RuleMatchStats>,
}

#[derive(Default)]
struct Counters {
    total_routed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    fallbacks: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct ActiveRule {
    rule: RoutingRule,
    patterns: CompiledPatterns,
}

// ============================================================================
// Routing Engine
// ============================================================================

/// Rule-based router with caching and statistics
pub struct RoutingEngine {
    name: String,
    config: RouterConfig,
    rules: RwLock<Vec<ActiveRule>>,
    cache: RoutingCache,
    counters: Counters,
    /// Statistics of removed rules are kept so snapshots stay monotonic
    retired: RwLock<HashMap<String, Arc<RuleStats>>>,
}

impl RoutingEngine {
    pub fn new(name: impl Into<String>, config: RouterConfig) -> Self {
        let cache = RoutingCache::new(
            config.cache_max_size,
            Duration::from_secs(config.cache_ttl_seconds),
        );
        Self {
            name: name.into(),
            config,
            rules: RwLock::new(Vec::new()),
            cache,
            counters: Counters::default(),
            retired: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Rule management
    // ------------------------------------------------------------------------

    /// Add a rule. Names must be unique within the engine.
    pub fn add_rule(&self, rule: RoutingRule) -> Result<(), RoutingError> {
        if rule.routing_type == RoutingType::Custom && rule.custom_router.is_none() {
            return Err(RoutingError::InvalidPattern {
                rule: rule.name,
                pattern: String::new(),
                message: "custom rules need a router function".to_string(),
            });
        }

        let patterns = rule.compile();
        if let Some(PatternMatcher::Invalid { pattern, message }) = &patterns.pattern {
            warn!(
                engine = %self.name,
                rule = %rule.name,
                pattern = %pattern,
                error = %message,
                "Rule pattern does not compile; matching it will trigger the fallback"
            );
        }

        let mut rules = self.write_rules();
        if rules.iter().any(|active| active.rule.name == rule.name) {
            return Err(RoutingError::DuplicateRule { name: rule.name });
        }

        debug!(
            engine = %self.name,
            rule = %rule.name,
            priority = rule.priority,
            routing_type = ?rule.routing_type,
            "Routing rule added"
        );
        rules.push(ActiveRule { rule, patterns });
        Self::sort(&mut rules);
        drop(rules);
        self.cache.clear();
        Ok(())
    }

    /// Remove a rule by name
    pub fn remove_rule(&self, name: &str) -> Result<RoutingRule, RoutingError> {
        let mut rules = self.write_rules();
        let index = rules
            .iter()
            .position(|active| active.rule.name == name)
            .ok_or_else(|| RoutingError::RuleNotFound {
                name: name.to_string(),
            })?;
        let removed = rules.remove(index).rule;
        drop(rules);

        self.retired
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(removed.name.clone(), removed.stats_handle());
        self.cache.clear();
        debug!(engine = %self.name, rule = %name, "Routing rule removed");
        Ok(removed)
    }

    /// Replace the rule with the same name
    pub fn update_rule(&self, rule: RoutingRule) -> Result<(), RoutingError> {
        let patterns = rule.compile();
        let mut rules = self.write_rules();
        let slot = rules
            .iter_mut()
            .find(|active| active.rule.name == rule.name)
            .ok_or_else(|| RoutingError::RuleNotFound {
                name: rule.name.clone(),
            })?;
        *slot = ActiveRule { rule, patterns };
        Self::sort(&mut rules);
        drop(rules);
        self.cache.clear();
        Ok(())
    }

    pub fn enable_rule(&self, name: &str) -> Result<(), RoutingError> {
        self.set_enabled(name, true)
    }

    pub fn disable_rule(&self, name: &str) -> Result<(), RoutingError> {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), RoutingError> {
        let mut rules = self.write_rules();
        let active = rules
            .iter_mut()
            .find(|active| active.rule.name == name)
            .ok_or_else(|| RoutingError::RuleNotFound {
                name: name.to_string(),
            })?;
        active.rule.enabled = enabled;
        drop(rules);
        self.cache.clear();
        Ok(())
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> Vec<RoutingRule> {
        self.read_rules()
            .iter()
            .map(|active| active.rule.clone())
            .collect()
    }

    pub fn rule(&self, name: &str) -> Option<RoutingRule> {
        self.read_rules()
            .iter()
            .find(|active| active.rule.name == name)
            .map(|active| active.rule.clone())
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    fn sort(rules: &mut [ActiveRule]) {
        rules.sort_by(|a, b| {
            b.rule
                .priority
                .cmp(&a.rule.priority)
                .then_with(|| a.rule.name.cmp(&b.rule.name))
        });
    }

    fn read_rules(&self) -> RwLockReadGuard<'_, Vec<ActiveRule>> {
        self.rules.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_rules(&self) -> RwLockWriteGuard<'_, Vec<ActiveRule>> {
        self.rules
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    /// Resolve delivery targets for a message
    pub fn route(&self, message: &Message) -> Result<RoutingResult, RoutingError> {
        Counters::bump(&self.counters.total_routed);

        let rules = self.read_rules();
        let cacheable = self.config.enable_cache
            && !rules
                .iter()
                .any(|active| active.rule.enabled && active.rule.depends_on_body());
        let cache_key = cacheable.then(|| RoutingCache::key_for(message));

        if let Some(key) = &cache_key {
            if let Some(mut cached) = self.cache.get(key) {
                Counters::bump(&self.counters.cache_hits);
                for active in rules.iter() {
                    if cached.matched_rules.contains(&active.rule.name) {
                        active.rule.stats().record_match();
                    }
                }
                cached.from_cache = true;
                return Ok(cached);
            }
            Counters::bump(&self.counters.cache_misses);
        }

        let mut result = RoutingResult::default();
        for active in rules.iter().filter(|active| active.rule.enabled) {
            let rule = &active.rule;
            if let Some(filter) = &rule.filter {
                if !filter(message) {
                    continue;
                }
            }

            let matched = match Self::evaluate(active, message) {
                Ok(matched) => matched,
                Err(reason) => {
                    Counters::bump(&self.counters.errors);
                    warn!(
                        engine = %self.name,
                        rule = %rule.name,
                        message_id = %message.id(),
                        error = %reason,
                        "Routing rule failed; applying fallback"
                    );
                    return self.fallback(
                        message,
                        RoutingError::MatcherFailed {
                            rule: rule.name.clone(),
                            message: reason,
                        },
                    );
                }
            };

            let Some(targets) = matched else { continue };
            rule.stats().record_match();

            let contributes = self.config.allow_multiple_targets || result.matched_rules.is_empty();
            if contributes {
                RoutingResult::push_unique(&mut result.queues, &targets.queues);
                RoutingResult::push_unique(&mut result.exchanges, &targets.exchanges);
            }
            result.matched_rules.push(rule.name.clone());

            if self.config.stop_on_first_match {
                break;
            }
        }
        drop(rules);

        if result.matched_rules.is_empty() {
            return self.fallback(
                message,
                RoutingError::NoMatch {
                    message_id: message.id().to_string(),
                    routing_key: message.headers.routing_key.clone(),
                },
            );
        }

        if let Some(key) = cache_key {
            self.cache.insert(key, result.clone());
        }
        Ok(result)
    }

    /// Apply the fallback policy for a message that could not be routed
    fn fallback(
        &self,
        message: &Message,
        error: RoutingError,
    ) -> Result<RoutingResult, RoutingError> {
        Counters::bump(&self.counters.fallbacks);
        match self.config.fallback {
            FallbackPolicy::DefaultTarget => {
                let result = RoutingResult {
                    queues: self.config.default_queue.iter().cloned().collect(),
                    exchanges: self.config.default_exchange.iter().cloned().collect(),
                    fallback_used: true,
                    ..RoutingResult::default()
                };
                if result.is_empty() {
                    warn!(
                        engine = %self.name,
                        message_id = %message.id(),
                        "No default target configured; message not routed"
                    );
                }
                Ok(result)
            }
            FallbackPolicy::Drop => {
                warn!(
                    engine = %self.name,
                    message_id = %message.id(),
                    reason = %error,
                    "Dropping unroutable message"
                );
                Ok(RoutingResult {
                    fallback_used: true,
                    ..RoutingResult::default()
                })
            }
            FallbackPolicy::Error => Err(error),
        }
    }

    /// `Ok(Some(targets))` when the rule matches
    fn evaluate(active: &ActiveRule, message: &Message) -> Result<Option<Targets>, String> {
        let rule = &active.rule;
        let static_targets = || Targets {
            queues: rule.target_queues.clone(),
            exchanges: rule.target_exchanges.clone(),
        };

        let matched = match rule.routing_type {
            RoutingType::Direct | RoutingType::Topic => match &message.headers.routing_key {
                Some(key) => match &active.patterns.pattern {
                    Some(pattern) => pattern.matches(key)?,
                    None => false,
                },
                None => false,
            },
            RoutingType::Fanout => true,
            RoutingType::Headers => rule.header_conditions.iter().all(|(key, expected)| {
                message
                    .header(key)
                    .is_some_and(|actual| values_match(expected, actual))
            }),
            RoutingType::Content => Self::content_matches(active, message)?,
            RoutingType::Custom => {
                let router = rule
                    .custom_router
                    .as_ref()
                    .ok_or_else(|| "custom rule has no router function".to_string())?;
                let queues = router(message)?;
                if queues.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(Targets {
                    queues,
                    exchanges: rule.target_exchanges.clone(),
                }));
            }
        };

        Ok(matched.then(static_targets))
    }

    fn content_matches(active: &ActiveRule, message: &Message) -> Result<bool, String> {
        let rule = &active.rule;
        let body = message.body.as_text();

        if let Some(pattern) = &active.patterns.pattern {
            let matched = match pattern {
                // Exact content patterns are substring tests
                PatternMatcher::Exact(needle) => body.contains(needle.as_str()),
                other => other.matches(&body)?,
            };
            if !matched {
                return Ok(false);
            }
        }

        for (condition, compiled) in rule.content_conditions.iter().zip(&active.patterns.content) {
            let holds = match (condition, compiled) {
                (ContentCondition::Contains(needle), _) => body.contains(needle.as_str()),
                (ContentCondition::StartsWith(prefix), _) => body.starts_with(prefix.as_str()),
                (ContentCondition::EndsWith(suffix), _) => body.ends_with(suffix.as_str()),
                (ContentCondition::Regex(_), Some(regex)) => regex.matches(&body)?,
                (ContentCondition::Regex(pattern), None) => {
                    return Err(format!("regex condition '{}' was not compiled", pattern))
                }
            };
            if !holds {
                return Ok(false);
            }
        }

        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------------

    /// Snapshot of engine statistics
    pub fn stats(&self) -> RoutingStats {
        let mut rules: HashMap<String, RuleMatchStats> = self
            .retired
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(name, stats)| (name.clone(), snapshot(stats)))
            .collect();

        for active in self.read_rules().iter() {
            rules.insert(active.rule.name.clone(), snapshot(active.rule.stats()));
        }

        RoutingStats {
            total_routed: self.counters.total_routed.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            cache_size: self.cache.len(),
            rules,
        }
    }
}

struct Targets {
    queues: Vec<String>,
    exchanges: Vec<String>,
}

fn snapshot(stats: &RuleStats) -> RuleMatchStats {
    RuleMatchStats {
        match_count: stats.match_count(),
        last_match: stats.last_match(),
    }
}

// ============================================================================
// Engine Registry
// ============================================================================

/// Named routing engines
pub struct RouterRegistry {
    engines: RwLock<HashMap<String, Arc<RoutingEngine>>>,
}

impl RouterRegistry {
    /// Registry holding a single default engine
    pub fn new(default_engine: RoutingEngine) -> Self {
        let mut engines = HashMap::new();
        engines.insert(DEFAULT_ENGINE.to_string(), Arc::new(default_engine));
        Self {
            engines: RwLock::new(engines),
        }
    }

    /// Register an engine under its own name, replacing any previous one
    pub fn register(&self, engine: RoutingEngine) -> Arc<RoutingEngine> {
        let engine = Arc::new(engine);
        self.engines
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(engine.name().to_string(), Arc::clone(&engine));
        engine
    }

    pub fn get(&self, name: &str) -> Result<Arc<RoutingEngine>, RoutingError> {
        self.engines
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| RoutingError::UnknownEngine {
                name: name.to_string(),
            })
    }

    pub fn default_engine(&self) -> Result<Arc<RoutingEngine>, RoutingError> {
        self.get(DEFAULT_ENGINE)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .engines
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for RouterRegistry {
    fn default() -> Self {
        Self::new(RoutingEngine::new(DEFAULT_ENGINE, RouterConfig::default()))
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
