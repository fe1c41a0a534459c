//! Tests for the routing engine and registry.

use super::*;
use serde_json::json;

fn engine(config: RouterConfig) -> RoutingEngine {
    RoutingEngine::new("test", config)
}

fn keyed(routing_key: &str) -> Message {
    Message::new("body").with_routing_key(routing_key)
}

// ============================================================================
// Rule Ordering and Management
// ============================================================================

#[test]
fn test_rules_sorted_by_priority_then_name() {
    let engine = engine(RouterConfig::default());
    engine.add_rule(RoutingRule::fanout("b-low").with_priority(1)).unwrap();
    engine.add_rule(RoutingRule::fanout("z-high").with_priority(10)).unwrap();
    engine.add_rule(RoutingRule::fanout("a-low").with_priority(1)).unwrap();

    let names: Vec<_> = engine.rules().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["z-high", "a-low", "b-low"]);
}

#[test]
fn test_duplicate_and_missing_rules() {
    let engine = engine(RouterConfig::default());
    engine.add_rule(RoutingRule::fanout("all")).unwrap();

    assert!(matches!(
        engine.add_rule(RoutingRule::fanout("all")),
        Err(RoutingError::DuplicateRule { .. })
    ));
    assert!(matches!(
        engine.remove_rule("nope"),
        Err(RoutingError::RuleNotFound { .. })
    ));
    assert!(matches!(
        engine.enable_rule("nope"),
        Err(RoutingError::RuleNotFound { .. })
    ));
    assert!(matches!(
        engine.update_rule(RoutingRule::fanout("nope")),
        Err(RoutingError::RuleNotFound { .. })
    ));
}

#[test]
fn test_custom_rule_requires_router() {
    let engine = engine(RouterConfig::default());
    let result = engine.add_rule(RoutingRule::new("bare", RoutingType::Custom));
    assert!(matches!(result, Err(RoutingError::InvalidPattern { .. })));
}

// ============================================================================
// Matchers
// ============================================================================

#[test]
fn test_direct_rule_match_types() {
    let engine = engine(RouterConfig {
        fallback: FallbackPolicy::Drop,
        ..RouterConfig::default()
    });
    engine
        .add_rule(RoutingRule::direct("exact", "orders.create").to_queue("exact"))
        .unwrap();
    engine
        .add_rule(
            RoutingRule::direct("glob", "payments.*")
                .with_match_type(MatchType::Wildcard)
                .to_queue("glob"),
        )
        .unwrap();
    engine
        .add_rule(
            RoutingRule::direct("regex", r"^audit\.\d+$")
                .with_match_type(MatchType::Regex)
                .to_queue("regex"),
        )
        .unwrap();

    assert_eq!(engine.route(&keyed("orders.create")).unwrap().queues, vec!["exact"]);
    assert_eq!(engine.route(&keyed("payments.refund")).unwrap().queues, vec!["glob"]);
    assert_eq!(engine.route(&keyed("audit.42")).unwrap().queues, vec!["regex"]);
    assert!(engine.route(&keyed("audit.x")).unwrap().is_empty());
}

#[test]
fn test_topic_rules() {
    let engine = engine(RouterConfig {
        fallback: FallbackPolicy::Drop,
        ..RouterConfig::default()
    });
    engine
        .add_rule(RoutingRule::topic("created", "orders.*.created").to_queue("created"))
        .unwrap();
    engine
        .add_rule(RoutingRule::topic("all-orders", "orders.#").to_queue("all"))
        .unwrap();

    let one_region = engine.route(&keyed("orders.eu.created")).unwrap();
    assert_eq!(one_region.queues, vec!["all", "created"]);

    let nested = engine.route(&keyed("orders.eu.west.created")).unwrap();
    assert_eq!(nested.queues, vec!["all"]);
}

#[test]
fn test_headers_rule_with_coercion() {
    let engine = engine(RouterConfig {
        fallback: FallbackPolicy::Drop,
        ..RouterConfig::default()
    });
    engine
        .add_rule(
            RoutingRule::headers("vip-eu")
                .with_header_condition("region", "eu")
                .with_header_condition("tier", 1)
                .to_queue("vip"),
        )
        .unwrap();

    let matching = Message::new("x")
        .with_header("region", "eu")
        .with_header("tier", "1");
    assert_eq!(engine.route(&matching).unwrap().queues, vec!["vip"]);

    let partial = Message::new("x").with_header("region", "eu");
    assert!(engine.route(&partial).unwrap().is_empty());
}

#[test]
fn test_content_rule_conditions() {
    let engine = engine(RouterConfig {
        fallback: FallbackPolicy::Drop,
        ..RouterConfig::default()
    });
    engine
        .add_rule(
            RoutingRule::content("urgent")
                .with_content_condition(ContentCondition::StartsWith("URGENT".to_string()))
                .with_content_condition(ContentCondition::Regex(r"#\d+".to_string()))
                .to_queue("urgent"),
        )
        .unwrap();
    engine
        .add_rule(
            RoutingRule::content("json-refund")
                .with_pattern("refund")
                .to_queue("refunds"),
        )
        .unwrap();

    let urgent = Message::new("URGENT: ticket #42");
    assert_eq!(engine.route(&urgent).unwrap().queues, vec!["urgent"]);

    let not_numbered = Message::new("URGENT: ticket");
    assert!(engine.route(&not_numbered).unwrap().is_empty());

    let refund = Message::new(json!({"type": "refund", "amount": 3}));
    assert_eq!(engine.route(&refund).unwrap().queues, vec!["refunds"]);
}

#[test]
fn test_custom_rule_returns_targets() {
    let engine = engine(RouterConfig {
        fallback: FallbackPolicy::Drop,
        ..RouterConfig::default()
    });
    engine
        .add_rule(RoutingRule::custom("shard", |message| {
            match message.header("shard").and_then(|v| v.as_u64()) {
                Some(shard) => Ok(vec![format!("shard-{}", shard)]),
                None => Ok(Vec::new()),
            }
        }))
        .unwrap();

    let sharded = Message::new("x").with_header("shard", 3);
    assert_eq!(engine.route(&sharded).unwrap().queues, vec!["shard-3"]);
    assert!(engine.route(&Message::new("x")).unwrap().is_empty());
}

#[test]
fn test_filter_runs_before_matcher() {
    let engine = engine(RouterConfig {
        fallback: FallbackPolicy::Drop,
        ..RouterConfig::default()
    });
    engine
        .add_rule(
            RoutingRule::fanout("big-only")
                .with_filter(|message| message.body.len() > 5)
                .to_queue("big"),
        )
        .unwrap();

    assert!(engine.route(&Message::new("tiny")).unwrap().is_empty());
    assert_eq!(
        engine.route(&Message::new("much larger")).unwrap().queues,
        vec!["big"]
    );
}

#[test]
fn test_disabled_rules_are_skipped() {
    let engine = engine(RouterConfig {
        fallback: FallbackPolicy::Drop,
        ..RouterConfig::default()
    });
    engine
        .add_rule(RoutingRule::fanout("off").disabled().to_queue("off"))
        .unwrap();
    assert!(engine.route(&keyed("k")).unwrap().is_empty());

    engine.enable_rule("off").unwrap();
    assert_eq!(engine.route(&keyed("k")).unwrap().queues, vec!["off"]);
}

// ============================================================================
// Target Selection
// ============================================================================

fn overlapping(config: RouterConfig) -> RoutingEngine {
    let engine = engine(config);
    engine
        .add_rule(
            RoutingRule::fanout("first")
                .with_priority(10)
                .to_queue("a")
                .to_queue("b"),
        )
        .unwrap();
    engine
        .add_rule(
            RoutingRule::fanout("second")
                .with_priority(5)
                .to_queue("b")
                .to_queue("c")
                .to_exchange("audit"),
        )
        .unwrap();
    engine
}

#[test]
fn test_multiple_targets_union_in_first_seen_order() {
    let engine = overlapping(RouterConfig::default());
    let result = engine.route(&keyed("k")).unwrap();

    assert_eq!(result.queues, vec!["a", "b", "c"]);
    assert_eq!(result.exchanges, vec!["audit"]);
    assert_eq!(result.matched_rules, vec!["first", "second"]);
}

#[test]
fn test_single_target_mode_uses_first_match_only() {
    let engine = overlapping(RouterConfig {
        allow_multiple_targets: false,
        ..RouterConfig::default()
    });
    let result = engine.route(&keyed("k")).unwrap();

    assert_eq!(result.queues, vec!["a", "b"]);
    assert!(result.exchanges.is_empty());
    assert_eq!(result.matched_rules.len(), 2, "later matches still counted");
}

#[test]
fn test_stop_on_first_match() {
    let engine = overlapping(RouterConfig {
        stop_on_first_match: true,
        ..RouterConfig::default()
    });
    let result = engine.route(&keyed("k")).unwrap();

    assert_eq!(result.matched_rules, vec!["first"]);
    assert_eq!(engine.stats().rules["second"].match_count, 0);
}

// ============================================================================
// Fallback
// ============================================================================

#[test]
fn test_fallback_policies() {
    let default_target = engine(RouterConfig {
        default_queue: Some("unrouted".to_string()),
        ..RouterConfig::default()
    });
    let result = default_target.route(&keyed("k")).unwrap();
    assert!(result.fallback_used);
    assert_eq!(result.queues, vec!["unrouted"]);

    let drop = engine(RouterConfig {
        fallback: FallbackPolicy::Drop,
        ..RouterConfig::default()
    });
    let result = drop.route(&keyed("k")).unwrap();
    assert!(result.fallback_used);
    assert!(result.is_empty());

    let error = engine(RouterConfig {
        fallback: FallbackPolicy::Error,
        ..RouterConfig::default()
    });
    assert!(matches!(
        error.route(&keyed("k")),
        Err(RoutingError::NoMatch { .. })
    ));
    assert_eq!(error.stats().fallbacks, 1);
}

#[test]
fn test_matcher_errors_apply_fallback() {
    let engine = engine(RouterConfig {
        default_queue: Some("unrouted".to_string()),
        ..RouterConfig::default()
    });
    engine
        .add_rule(
            RoutingRule::direct("broken", "orders.(")
                .with_match_type(MatchType::Regex)
                .to_queue("never"),
        )
        .unwrap();

    let result = engine.route(&keyed("orders.create")).unwrap();
    assert!(result.fallback_used);
    assert_eq!(result.queues, vec!["unrouted"]);
    assert_eq!(engine.stats().errors, 1);

    let strict = RoutingEngine::new(
        "strict",
        RouterConfig {
            fallback: FallbackPolicy::Error,
            ..RouterConfig::default()
        },
    );
    strict
        .add_rule(RoutingRule::custom("failing", |_| Err("shard map offline".to_string())))
        .unwrap();
    assert!(matches!(
        strict.route(&keyed("k")),
        Err(RoutingError::MatcherFailed { .. })
    ));
}

// ============================================================================
// Caching and Statistics
// ============================================================================

#[test]
fn test_results_are_cached_and_invalidated_on_rule_change() {
    let engine = engine(RouterConfig::default());
    engine
        .add_rule(RoutingRule::direct("create", "orders.create").to_queue("v1"))
        .unwrap();

    let first = engine.route(&keyed("orders.create")).unwrap();
    assert!(!first.from_cache);
    let second = engine.route(&keyed("orders.create")).unwrap();
    assert!(second.from_cache);
    assert_eq!(engine.cache_size(), 1);

    engine
        .update_rule(RoutingRule::direct("create", "orders.create").to_queue("v2"))
        .unwrap();
    assert_eq!(engine.cache_size(), 0);

    let third = engine.route(&keyed("orders.create")).unwrap();
    assert!(!third.from_cache);
    assert_eq!(third.queues, vec!["v2"]);

    engine.disable_rule("create").unwrap();
    assert_eq!(engine.cache_size(), 0);

    let stats = engine.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 2);
}

#[test]
fn test_cached_result_is_not_shared_by_lookalike_messages() {
    let engine = engine(RouterConfig::default());
    engine
        .add_rule(RoutingRule::direct("pipe", "a|b").to_queue("pipe"))
        .unwrap();

    let first = engine.route(&keyed("a|b")).unwrap();
    assert_eq!(first.queues, vec!["pipe"]);

    let lookalike = Message::new("body").with_routing_key("a").with_exchange("b|");
    let second = engine.route(&lookalike).unwrap();

    assert!(!second.from_cache);
    assert!(second.fallback_used);
    assert!(second.queues.is_empty());
}

#[test]
fn test_cache_hits_count_as_rule_matches() {
    let engine = engine(RouterConfig::default());
    engine
        .add_rule(RoutingRule::direct("create", "orders.create").to_queue("q"))
        .unwrap();

    for _ in 0..3 {
        engine.route(&keyed("orders.create")).unwrap();
    }

    let stats = engine.stats();
    assert_eq!(stats.cache_hits, 2);
    assert_eq!(stats.rules["create"].match_count, 3);
}

#[test]
fn test_body_dependent_rules_bypass_cache() {
    let engine = engine(RouterConfig::default());
    engine
        .add_rule(
            RoutingRule::content("refunds")
                .with_pattern("refund")
                .to_queue("refunds"),
        )
        .unwrap();

    engine.route(&Message::new("refund").with_routing_key("k")).unwrap();
    let second = engine
        .route(&Message::new("something else").with_routing_key("k"))
        .unwrap();

    assert!(!second.from_cache);
    assert!(second.fallback_used);
    assert_eq!(engine.cache_size(), 0);
}

#[test]
fn test_statistics_track_matches() {
    let engine = engine(RouterConfig::default());
    engine
        .add_rule(RoutingRule::direct("create", "orders.create").to_queue("q"))
        .unwrap();

    engine.route(&keyed("orders.create")).unwrap();
    engine.route(&keyed("orders.update")).unwrap();

    let stats = engine.stats();
    assert_eq!(stats.total_routed, 2);
    assert_eq!(stats.fallbacks, 1);
    assert_eq!(stats.rules["create"].match_count, 1);
    assert!(stats.rules["create"].last_match.is_some());

    let removed = engine.remove_rule("create").unwrap();
    assert_eq!(removed.stats().match_count(), 1);
    assert_eq!(engine.stats().rules["create"].match_count, 1);
}

#[test]
fn test_rules_deserialize_from_configuration() {
    let rule: RoutingRule = serde_json::from_value(json!({
        "name": "eu",
        "priority": 5,
        "routing_type": "topic",
        "pattern": "orders.eu.#",
        "target_queues": ["eu-orders"]
    }))
    .unwrap();

    assert!(rule.enabled);
    assert_eq!(rule.routing_type, RoutingType::Topic);

    let engine = engine(RouterConfig::default());
    engine.add_rule(rule).unwrap();
    assert_eq!(
        engine.route(&keyed("orders.eu.created")).unwrap().queues,
        vec!["eu-orders"]
    );
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn test_registry_lookup() {
    let registry = RouterRegistry::default();
    assert_eq!(registry.default_engine().unwrap().name(), DEFAULT_ENGINE);

    registry.register(RoutingEngine::new("audit", RouterConfig::default()));
    assert_eq!(registry.names(), vec!["audit", "default"]);
    assert!(registry.get("audit").is_ok());
    assert!(matches!(
        registry.get("billing"),
        Err(RoutingError::UnknownEngine { .. })
    ));
}
