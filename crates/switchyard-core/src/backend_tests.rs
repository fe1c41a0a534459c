//! Tests for backend types and the backend factory.

use super::*;
use serde_json::json;

#[test]
fn test_backend_type_parsing() {
    assert_eq!("memory".parse::<BackendType>().unwrap(), BackendType::Memory);
    assert_eq!("in-memory".parse::<BackendType>().unwrap(), BackendType::Memory);
    assert_eq!("RabbitMQ".parse::<BackendType>().unwrap(), BackendType::Amqp);
    assert_eq!(
        "redis_streams".parse::<BackendType>().unwrap(),
        BackendType::RedisStreams
    );
    assert!("kafka".parse::<BackendType>().is_err());
}

#[test]
fn test_backend_type_serializes_snake_case() {
    assert_eq!(
        serde_json::to_value(BackendType::RedisStreams).unwrap(),
        json!("redis_streams")
    );
    assert_eq!(BackendType::Amqp.to_string(), "amqp");
}

#[test]
fn test_backend_config_defaults() {
    let config = BackendConfig::default();
    assert_eq!(config.backend_type, BackendType::Memory);
    assert_eq!(config.dlq_suffix, ".dlq");
    assert_eq!(config.memory.max_queue_size, 10_000);
    assert!(config.url.is_none());
}

#[test]
fn test_dlq_name() {
    assert_eq!(dlq_name("orders", DEFAULT_DLQ_SUFFIX), "orders.dlq");
    assert_eq!(dlq_name("orders", "-dead"), "orders-dead");
}

#[test]
fn test_queue_config_builder() {
    let config = QueueConfig::new("orders")
        .with_max_length(10)
        .with_max_priority(10)
        .with_message_ttl(60)
        .with_dead_letter_exchange("dlx", Some("orders.dead".to_string()))
        .with_argument("x-custom", 1);

    assert!(config.durable);
    assert_eq!(config.max_length, Some(10));
    assert_eq!(config.max_priority, Some(10));
    assert_eq!(config.message_ttl, Some(60));
    assert_eq!(config.dead_letter_exchange.as_deref(), Some("dlx"));
    assert_eq!(config.dead_letter_routing_key.as_deref(), Some("orders.dead"));
    assert_eq!(config.arguments["x-custom"], json!(1));
}

#[test]
fn test_queue_config_deserializes_with_defaults() {
    let config: QueueConfig = serde_json::from_value(json!({"name": "orders"})).unwrap();
    assert_eq!(config, QueueConfig::new("orders"));

    let exchange: ExchangeConfig =
        serde_json::from_value(json!({"name": "events", "exchange_type": "topic"})).unwrap();
    assert_eq!(exchange.exchange_type, ExchangeType::Topic);
    assert!(exchange.durable);
}

#[test]
fn test_factory_creates_memory_backend() {
    let backend = create_backend(&BackendConfig::default()).unwrap();
    assert_eq!(backend.backend_type(), BackendType::Memory);
    assert_eq!(backend.dlq_suffix(), ".dlq");
    assert!(!backend.is_connected());
}

#[test]
fn test_factory_fails_fast_for_transports_not_compiled_in() {
    for backend_type in [BackendType::Amqp, BackendType::RedisStreams] {
        let config = BackendConfig {
            backend_type,
            ..BackendConfig::default()
        };
        match create_backend(&config) {
            Err(ConfigurationError::UnsupportedBackend { backend, .. }) => {
                assert_eq!(backend, backend_type.to_string())
            }
            other => panic!("expected unsupported backend error, got {:?}", other.is_ok()),
        }
    }
}
