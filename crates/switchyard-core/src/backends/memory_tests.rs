//! Tests for the in-memory backend.

use super::*;
use crate::backend::BackendConfig;
use crate::message::{MessagePriority, MessageStatus};
use chrono::Utc;
use serde_json::json;

const SHORT: Duration = Duration::from_millis(10);

async fn connected_backend() -> InMemoryBackend {
    let backend = InMemoryBackend::default();
    backend.connect().await.unwrap();
    backend
}

async fn declare_queues(backend: &InMemoryBackend, names: &[&str]) {
    for name in names {
        backend.create_queue(QueueConfig::new(*name)).await.unwrap();
    }
}

fn text_of(message: &Message) -> String {
    message.body.as_text().into_owned()
}

// ============================================================================
// Connection Lifecycle
// ============================================================================

mod connection {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_disconnect_are_idempotent() {
        let backend = InMemoryBackend::default();
        assert!(!backend.is_connected());

        backend.connect().await.unwrap();
        backend.connect().await.unwrap();
        assert!(backend.is_connected());

        backend.disconnect().await.unwrap();
        backend.disconnect().await.unwrap();
        assert!(!backend.is_connected());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let backend = InMemoryBackend::default();

        let result = backend.create_queue(QueueConfig::new("orders")).await;
        assert!(matches!(result, Err(MessagingError::Connection(_))));

        assert!(!backend.publish(Message::new("x").with_routing_key("orders")).await);
        assert!(backend.consume("orders", SHORT).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_wakes_blocked_consumers() {
        let backend = Arc::new(connected_backend().await);
        declare_queues(&backend, &["orders"]).await;

        let consumer = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.consume("orders", Duration::from_secs(3600)).await })
        };
        tokio::task::yield_now().await;

        backend.disconnect().await.unwrap();
        assert!(consumer.await.unwrap().is_none());
    }
}

// ============================================================================
// Topology
// ============================================================================

mod topology {
    use super::*;

    #[tokio::test]
    async fn test_queue_declaration_is_idempotent() {
        let backend = connected_backend().await;
        let first = backend
            .create_queue(QueueConfig::new("orders").with_max_length(5))
            .await
            .unwrap();
        let second = backend.create_queue(QueueConfig::new("orders")).await.unwrap();

        assert_eq!(first.config.max_length, Some(5));
        assert_eq!(second.config.max_length, Some(5), "first declaration wins");
        assert_eq!(backend.queues().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_names_are_rejected() {
        let backend = connected_backend().await;
        let result = backend.create_queue(QueueConfig::new("bad name")).await;
        assert!(matches!(result, Err(MessagingError::Validation(_))));

        let result = backend
            .create_exchange(ExchangeConfig::new("", ExchangeType::Direct))
            .await;
        assert!(matches!(result, Err(MessagingError::Validation(_))));
    }

    #[tokio::test]
    async fn test_exchange_redeclared_with_other_type_fails() {
        let backend = connected_backend().await;
        backend
            .create_exchange(ExchangeConfig::new("events", ExchangeType::Topic))
            .await
            .unwrap();

        let result = backend
            .create_exchange(ExchangeConfig::new("events", ExchangeType::Fanout))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_binding_requires_existing_queue_and_exchange() {
        let backend = connected_backend().await;
        declare_queues(&backend, &["orders"]).await;

        let result = backend
            .bind_queue(BindingConfig::new("orders", "missing", "k"))
            .await;
        assert!(matches!(result, Err(MessagingError::ExchangeNotFound { .. })));

        backend
            .create_exchange(ExchangeConfig::new("events", ExchangeType::Direct))
            .await
            .unwrap();
        let result = backend
            .bind_queue(BindingConfig::new("missing", "events", "k"))
            .await;
        assert!(matches!(result, Err(MessagingError::QueueNotFound { .. })));
    }

    #[tokio::test]
    async fn test_purge_delete_and_depth() {
        let backend = connected_backend().await;
        for i in 0..3 {
            assert!(backend.publish(Message::new(format!("m{}", i)).with_routing_key("work")).await);
        }

        assert_eq!(backend.queue_depth("work").await, Some(3));
        assert_eq!(backend.purge_queue("work").await.unwrap(), 3);
        assert_eq!(backend.queue_depth("work").await, Some(0));

        assert!(backend.delete_queue("work").await.unwrap());
        assert!(!backend.delete_queue("work").await.unwrap());
        assert_eq!(backend.queue_depth("work").await, None);
        assert!(backend.purge_queue("work").await.is_err());
    }
}

// ============================================================================
// Exchange Routing
// ============================================================================

mod routing {
    use super::*;

    #[tokio::test]
    async fn test_direct_exchange_routes_by_exact_key() {
        let backend = connected_backend().await;
        declare_queues(&backend, &["creates", "updates"]).await;
        backend
            .create_exchange(ExchangeConfig::new("orders", ExchangeType::Direct))
            .await
            .unwrap();
        backend
            .bind_queue(BindingConfig::new("creates", "orders", "orders.create"))
            .await
            .unwrap();
        backend
            .bind_queue(BindingConfig::new("updates", "orders", "orders.update"))
            .await
            .unwrap();

        let message = Message::new("new order")
            .with_exchange("orders")
            .with_routing_key("orders.create");
        assert!(backend.publish(message).await);

        assert_eq!(backend.queue_depth("creates").await, Some(1));
        assert_eq!(backend.queue_depth("updates").await, Some(0));
        assert!(backend.consume("updates", SHORT).await.is_none());
    }

    #[tokio::test]
    async fn test_fanout_delivers_independent_copies() {
        let backend = connected_backend().await;
        declare_queues(&backend, &["a", "b", "c"]).await;
        backend
            .create_exchange(ExchangeConfig::new("broadcast", ExchangeType::Fanout))
            .await
            .unwrap();
        for queue in ["a", "b", "c"] {
            backend
                .bind_queue(BindingConfig::new(queue, "broadcast", ""))
                .await
                .unwrap();
        }

        assert!(backend.publish(Message::new("hello").with_exchange("broadcast")).await);

        let from_a = backend.consume("a", SHORT).await.unwrap();
        assert_eq!(text_of(&from_a), "hello");
        assert!(backend.consume("a", SHORT).await.is_none(), "exactly one copy in A");
        assert_eq!(backend.queue_depth("b").await, Some(1));
        assert_eq!(backend.queue_depth("c").await, Some(1));
    }

    #[tokio::test]
    async fn test_topic_exchange_wildcards() {
        let backend = connected_backend().await;
        declare_queues(&backend, &["created", "everything"]).await;
        backend
            .create_exchange(ExchangeConfig::new("events", ExchangeType::Topic))
            .await
            .unwrap();
        backend
            .bind_queue(BindingConfig::new("created", "events", "orders.*.created"))
            .await
            .unwrap();
        backend
            .bind_queue(BindingConfig::new("everything", "events", "orders.#"))
            .await
            .unwrap();

        for key in ["orders.eu.created", "orders.eu.west.created"] {
            backend
                .publish(Message::new(key).with_exchange("events").with_routing_key(key))
                .await;
        }

        assert_eq!(backend.queue_depth("created").await, Some(1));
        assert_eq!(backend.queue_depth("everything").await, Some(2));
        let only = backend.consume("created", SHORT).await.unwrap();
        assert_eq!(text_of(&only), "orders.eu.created");
    }

    #[tokio::test]
    async fn test_headers_exchange_all_and_any() {
        let backend = connected_backend().await;
        declare_queues(&backend, &["all-match", "any-match"]).await;
        backend
            .create_exchange(ExchangeConfig::new("by-headers", ExchangeType::Headers))
            .await
            .unwrap();
        backend
            .bind_queue(
                BindingConfig::new("all-match", "by-headers", "")
                    .with_argument("x-match", "all")
                    .with_argument("region", "eu")
                    .with_argument("tier", 1),
            )
            .await
            .unwrap();
        backend
            .bind_queue(
                BindingConfig::new("any-match", "by-headers", "")
                    .with_argument("x-match", "any")
                    .with_argument("region", "eu")
                    .with_argument("tier", 1),
            )
            .await
            .unwrap();

        let partial = Message::new("partial")
            .with_exchange("by-headers")
            .with_header("region", "eu");
        assert!(backend.publish(partial).await);

        let full = Message::new("full")
            .with_exchange("by-headers")
            .with_header("region", "eu")
            .with_header("tier", "1");
        assert!(backend.publish(full).await);

        assert_eq!(backend.queue_depth("all-match").await, Some(1));
        assert_eq!(backend.queue_depth("any-match").await, Some(2));
    }

    #[tokio::test]
    async fn test_unroutable_and_unknown_exchange_report_false() {
        let backend = connected_backend().await;
        backend
            .create_exchange(ExchangeConfig::new("empty", ExchangeType::Fanout))
            .await
            .unwrap();

        assert!(!backend.publish(Message::new("x").with_exchange("empty")).await);
        assert!(!backend.publish(Message::new("x").with_exchange("missing")).await);
        assert!(!backend.publish(Message::new("no routing key")).await);
    }

    #[tokio::test]
    async fn test_direct_publish_auto_declares_queue() {
        let backend = connected_backend().await;
        assert!(backend.publish(Message::new("x").with_routing_key("jobs")).await);
        assert_eq!(backend.queue_depth("jobs").await, Some(1));
    }

    #[tokio::test]
    async fn test_publish_to_queue_ignores_exchange() {
        let backend = connected_backend().await;
        let message = Message::new("retry")
            .with_exchange("missing-exchange")
            .with_routing_key("orders.create");

        assert!(backend.publish_to_queue("orders", message).await);
        assert_eq!(backend.queue_depth("orders").await, Some(1));

        let delivered = backend.consume("orders", SHORT).await.unwrap();
        assert_eq!(delivered.headers.routing_key.as_deref(), Some("orders.create"));
        assert!(!backend.publish_to_queue("bad name", Message::new("x")).await);
    }
}

// ============================================================================
// Delivery Semantics
// ============================================================================

mod delivery {
    use super::*;

    #[tokio::test]
    async fn test_priority_then_fifo_within_tier() {
        let backend = connected_backend().await;
        let publish = |body: &'static str, priority| {
            Message::new(body)
                .with_routing_key("work")
                .with_priority(priority)
        };

        for message in [
            publish("normal-1", MessagePriority::Normal),
            publish("low-1", MessagePriority::Low),
            publish("critical-1", MessagePriority::Critical),
            publish("normal-2", MessagePriority::Normal),
            publish("critical-2", MessagePriority::Critical),
            publish("normal-3", MessagePriority::Normal),
        ] {
            assert!(backend.publish(message).await);
        }

        let mut order = Vec::new();
        while let Some(message) = backend.consume("work", SHORT).await {
            backend.ack(&message).await;
            order.push(text_of(&message));
        }

        assert_eq!(
            order,
            vec![
                "critical-1",
                "critical-2",
                "normal-1",
                "normal-2",
                "normal-3",
                "low-1"
            ]
        );
    }

    #[tokio::test]
    async fn test_max_priority_caps_ordering() {
        let backend = connected_backend().await;
        backend
            .create_queue(QueueConfig::new("capped").with_max_priority(5))
            .await
            .unwrap();

        backend
            .publish(Message::new("first").with_routing_key("capped"))
            .await;
        backend
            .publish(
                Message::new("second")
                    .with_routing_key("capped")
                    .with_priority(MessagePriority::Critical),
            )
            .await;

        let first = backend.consume("capped", SHORT).await.unwrap();
        assert_eq!(text_of(&first), "first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_times_out_on_empty_queue() {
        let backend = connected_backend().await;
        declare_queues(&backend, &["idle"]).await;

        let started = Instant::now();
        assert!(backend.consume("idle", Duration::from_secs(5)).await.is_none());
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(backend.consume("never-declared", SHORT).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_wakes_on_publish() {
        let backend = Arc::new(connected_backend().await);
        declare_queues(&backend, &["orders"]).await;

        let consumer = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.consume("orders", Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(backend.publish(Message::new("late").with_routing_key("orders")).await);

        let message = consumer.await.unwrap().unwrap();
        assert_eq!(text_of(&message), "late");
        assert_eq!(message.delivery().map(|d| d.queue.as_str()), Some("orders"));
    }

    #[tokio::test]
    async fn test_ack_settles_delivery_once() {
        let backend = connected_backend().await;
        backend.publish(Message::new("x").with_routing_key("q")).await;

        let message = backend.consume("q", SHORT).await.unwrap();
        assert_eq!(backend.queues()[0].unacked_count, 1);
        assert!(backend.ack(&message).await);
        assert!(!backend.ack(&message).await, "second ack has no delivery to settle");
        assert!(!backend.ack(&Message::new("never delivered")).await);
        assert_eq!(backend.queues()[0].unacked_count, 0);
    }

    #[tokio::test]
    async fn test_nack_with_requeue_redelivers() {
        let backend = connected_backend().await;
        backend.publish(Message::new("retry me").with_routing_key("q")).await;

        let mut message = backend.consume("q", SHORT).await.unwrap();
        message.mark_processing();
        let id = message.id().clone();
        assert!(backend.nack(message, true).await);

        let again = backend.consume("q", SHORT).await.unwrap();
        assert_eq!(again.id(), &id);
        assert_eq!(again.status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_drops() {
        let backend = connected_backend().await;
        backend.publish(Message::new("drop me").with_routing_key("q")).await;

        let message = backend.consume("q", SHORT).await.unwrap();
        assert!(backend.nack(message, false).await);
        assert!(backend.consume("q", SHORT).await.is_none());
        assert!(!backend.nack(Message::new("unknown"), true).await);
    }

    #[tokio::test]
    async fn test_max_length_rejects_overflow() {
        let backend = connected_backend().await;
        backend
            .create_queue(QueueConfig::new("small").with_max_length(2))
            .await
            .unwrap();

        assert!(backend.publish(Message::new("1").with_routing_key("small")).await);
        assert!(backend.publish(Message::new("2").with_routing_key("small")).await);
        assert!(!backend.publish(Message::new("3").with_routing_key("small")).await);
        assert_eq!(backend.queue_depth("small").await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_ttl_discards_stale_messages() {
        let backend = connected_backend().await;
        backend
            .create_queue(QueueConfig::new("short-lived").with_message_ttl(10))
            .await
            .unwrap();

        backend
            .publish(Message::new("old").with_routing_key("short-lived"))
            .await;
        tokio::time::advance(Duration::from_secs(11)).await;
        backend
            .publish(Message::new("fresh").with_routing_key("short-lived"))
            .await;

        let message = backend.consume("short-lived", SHORT).await.unwrap();
        assert_eq!(text_of(&message), "fresh");
        assert!(backend.consume("short-lived", SHORT).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_messages_are_not_delivered() {
        let backend = connected_backend().await;
        let mut expired = Message::new("expired")
            .with_routing_key("q")
            .with_expiration(1);
        expired.headers.timestamp =
            crate::message::Timestamp::from_datetime(Utc::now() - chrono::Duration::seconds(5));

        backend.publish(expired).await;
        backend.publish(Message::new("live").with_routing_key("q")).await;

        let message = backend.consume("q", SHORT).await.unwrap();
        assert_eq!(text_of(&message), "live");
    }
}

// ============================================================================
// Dead Lettering
// ============================================================================

mod dead_letter {
    use super::*;

    #[tokio::test]
    async fn test_send_to_dlq_uses_suffix_naming() {
        let backend = connected_backend().await;
        backend.publish(Message::new("poison").with_routing_key("orders")).await;

        let message = backend.consume("orders", SHORT).await.unwrap();
        assert!(backend.send_to_dlq(message).await);

        let dead = backend.consume("orders.dlq", SHORT).await.unwrap();
        assert_eq!(dead.status, MessageStatus::DeadLetter);
        assert_eq!(dead.header(ORIGINAL_QUEUE), Some(&json!("orders")));
        assert_eq!(backend.queues()[0].unacked_count, 0, "delivery settled");
    }

    #[tokio::test]
    async fn test_send_to_dlq_honours_custom_suffix() {
        let backend = InMemoryBackend::new(BackendConfig {
            dlq_suffix: "-dead".to_string(),
            ..BackendConfig::default()
        });
        backend.connect().await.unwrap();

        assert!(backend.send_to_dlq(Message::new("x").with_routing_key("jobs")).await);
        assert_eq!(backend.queue_depth("jobs-dead").await, Some(1));
    }

    #[tokio::test]
    async fn test_dead_letter_exchange_takes_precedence() {
        let backend = connected_backend().await;
        backend
            .create_queue(
                QueueConfig::new("orders")
                    .with_dead_letter_exchange("dlx", Some("orders.failed".to_string())),
            )
            .await
            .unwrap();
        declare_queues(&backend, &["failures"]).await;
        backend
            .create_exchange(ExchangeConfig::new("dlx", ExchangeType::Direct))
            .await
            .unwrap();
        backend
            .bind_queue(BindingConfig::new("failures", "dlx", "orders.failed"))
            .await
            .unwrap();

        backend.publish(Message::new("x").with_routing_key("orders")).await;
        let message = backend.consume("orders", SHORT).await.unwrap();
        assert!(backend.send_to_dlq(message).await);

        assert_eq!(backend.queue_depth("failures").await, Some(1));
        assert_eq!(backend.queue_depth("orders.dlq").await, None);
    }

    #[tokio::test]
    async fn test_send_to_dlq_needs_an_origin() {
        let backend = connected_backend().await;
        assert!(!backend.send_to_dlq(Message::new("orphan")).await);
    }
}
