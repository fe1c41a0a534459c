//! Integration tests for routing through the manager
//!
//! These tests verify rule evaluation, fallback behaviour, exchange delivery
//! and configuration-driven routers against the in-memory backend.

mod common;

use common::{start, test_builder, wait_until, RecordingHandler};
use serde_json::json;
use std::io::Write;
use switchyard_core::config::MessagingConfig;
use switchyard_core::manager::{ConsumerConfig, MessagingManagerBuilder, PublishOptions};
use switchyard_core::monitoring::InMemoryMetricsCollector;
use switchyard_core::routing::{
    ContentCondition, FallbackPolicy, RouterConfig, RoutingEngine, RoutingRule,
};
use switchyard_core::{BindingConfig, ExchangeConfig, ExchangeType, MessageBackend, QueueConfig};

fn engine(config: RouterConfig, rules: Vec<RoutingRule>) -> RoutingEngine {
    let engine = RoutingEngine::new("default", config);
    for rule in rules {
        engine.add_rule(rule).unwrap();
    }
    engine
}

/// Verify that topic, header and content rules each select their queues
#[tokio::test]
async fn test_rules_select_targets() {
    // Arrange
    let (backend, builder) = test_builder();
    let router = engine(
        RouterConfig::default(),
        vec![
            RoutingRule::topic("orders", "orders.*").to_queue("orders"),
            RoutingRule::headers("vip")
                .with_header_condition("tier", "gold")
                .to_queue("vip"),
            RoutingRule::content("refunds")
                .with_content_condition(ContentCondition::Contains("refund".to_string()))
                .to_queue("refunds"),
        ],
    );
    let manager = start(builder.with_router(router)).await;
    for queue in ["orders", "vip", "refunds"] {
        manager.declare_queue(QueueConfig::new(queue)).await.unwrap();
    }

    // Act
    manager
        .publish("new order", "orders.created", PublishOptions::default())
        .await
        .unwrap();
    manager
        .publish(
            "refund requested",
            "orders.refunded",
            PublishOptions::new().with_header("tier", "gold"),
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(backend.queue_depth("orders").await, Some(2));
    assert_eq!(backend.queue_depth("vip").await, Some(1));
    assert_eq!(backend.queue_depth("refunds").await, Some(1));

    let stats = manager.default_router().unwrap().stats();
    assert_eq!(stats.total_routed, 2);

    manager.shutdown().await.unwrap();
}

/// Verify that unmatched messages go to the configured default queue
#[tokio::test]
async fn test_default_target_fallback() {
    // Arrange
    let (backend, builder) = test_builder();
    let router = engine(
        RouterConfig {
            default_queue: Some("unrouted".to_string()),
            ..RouterConfig::default()
        },
        vec![RoutingRule::direct("orders", "orders").to_queue("orders")],
    );
    let manager = start(builder.with_router(router)).await;

    // Act
    manager
        .publish("x", "invoices", PublishOptions::default())
        .await
        .unwrap();

    // Assert
    assert_eq!(backend.queue_depth("unrouted").await, Some(1));
    assert_eq!(backend.queue_depth("invoices").await, None);

    manager.shutdown().await.unwrap();
}

/// Verify that a failing custom router falls back to the routing key
#[tokio::test]
async fn test_failing_custom_router_uses_routing_key() {
    // Arrange
    let (backend, builder) = test_builder();
    let metrics = std::sync::Arc::new(InMemoryMetricsCollector::new());
    let router = engine(
        RouterConfig {
            fallback: FallbackPolicy::Error,
            ..RouterConfig::default()
        },
        vec![RoutingRule::custom("broken", |_| Err("lookup failed".to_string()))],
    );
    let manager = start(builder.with_router(router).with_metrics(metrics.clone())).await;

    // Act
    manager
        .publish("x", "inbox", PublishOptions::default())
        .await
        .unwrap();

    // Assert
    assert_eq!(backend.queue_depth("inbox").await, Some(1));
    assert_eq!(metrics.snapshot().errors.get("routing"), Some(&1));

    manager.shutdown().await.unwrap();
}

/// Verify that exchange targets fan out through bindings
#[tokio::test]
async fn test_exchange_targets_use_bindings() {
    // Arrange
    let (backend, builder) = test_builder();
    let router = engine(
        RouterConfig::default(),
        vec![RoutingRule::topic("events", "#").to_exchange("broadcast")],
    );
    let manager = start(builder.with_router(router)).await;
    manager
        .declare_exchange(ExchangeConfig::new("broadcast", ExchangeType::Fanout))
        .await
        .unwrap();
    for queue in ["mail", "sms"] {
        manager.declare_queue(QueueConfig::new(queue)).await.unwrap();
        manager
            .bind_queue(BindingConfig::new(queue, "broadcast", ""))
            .await
            .unwrap();
    }

    // Act
    manager
        .publish("hello", "user.signup", PublishOptions::default())
        .await
        .unwrap();

    // Assert
    assert_eq!(backend.queue_depth("mail").await, Some(1));
    assert_eq!(backend.queue_depth("sms").await, Some(1));

    manager.shutdown().await.unwrap();
}

/// Verify that repeated routing is served from the cache
#[tokio::test]
async fn test_routing_cache_hits() {
    // Arrange
    let (_backend, builder) = test_builder();
    let router = engine(
        RouterConfig::default(),
        vec![RoutingRule::direct("orders", "orders").to_queue("orders")],
    );
    let manager = start(builder.with_router(router)).await;

    // Act
    for _ in 0..3 {
        manager
            .publish("x", "orders", PublishOptions::default())
            .await
            .unwrap();
    }

    // Assert
    let stats = manager.default_router().unwrap().stats();
    assert_eq!(stats.total_routed, 3);
    assert_eq!(stats.cache_hits, 2);

    manager.shutdown().await.unwrap();
}

/// Verify a manager assembled entirely from a configuration file
#[tokio::test(start_paused = true)]
async fn test_configuration_file_drives_routing_and_topology() {
    // Arrange
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    write!(
        file,
        r#"
[manager]
health_check_interval_seconds = 1
metrics_interval_seconds = 1
consumer_poll_timeout_ms = 50

[[routing.rules]]
name = "payments"
routing_type = "topic"
pattern = "payments.#"
target_queues = ["payments"]

[[topology.queues]]
name = "payments"
max_priority = 10
"#
    )
    .unwrap();
    let config = MessagingConfig::load(Some(file.path())).unwrap();
    let manager = MessagingManagerBuilder::from_config(&config)
        .unwrap()
        .build()
        .unwrap();
    manager.start().await.unwrap();
    let handler = RecordingHandler::new();
    manager
        .consume(ConsumerConfig::new("payments-worker", "payments"), handler.as_handler())
        .await
        .unwrap();

    // Act
    manager
        .publish(json!({"amount": 10}), "payments.card.captured", PublishOptions::default())
        .await
        .unwrap();

    // Assert
    wait_until("payment handled", || handler.received().len() == 1).await;
    assert_eq!(
        handler.received()[0].headers.routing_key.as_deref(),
        Some("payments.card.captured")
    );
    assert_eq!(manager.queues(), vec!["payments".to_string()]);

    manager.shutdown().await.unwrap();
}
