//! Tests for the DLQ manager.

use super::*;
use crate::backend::QueueConfig;
use crate::backends::InMemoryBackend;
use crate::message::MessageStatus;
use std::sync::atomic::{AtomicUsize, Ordering};

const WAIT: Duration = Duration::from_secs(30);
const SHORT: Duration = Duration::from_millis(10);

async fn connected_backend() -> Arc<InMemoryBackend> {
    let backend = Arc::new(InMemoryBackend::default());
    backend.connect().await.unwrap();
    backend
}

fn config(policy: DlqPolicy) -> DlqConfig {
    DlqConfig {
        policy,
        retry: RetryConfig {
            strategy: RetryStrategy::Fixed,
            initial_delay_ms: 1_000,
            jitter: false,
            ..RetryConfig::default()
        },
        ..DlqConfig::default()
    }
}

fn failure(kind: &str) -> MessageProcessingError {
    MessageProcessingError::new(kind, "boom")
}

/// Publish a message to `queue` and take it back as a delivery
async fn deliver(backend: &InMemoryBackend, queue: &str, message: Message) -> Message {
    assert!(backend.publish(message.with_routing_key(queue)).await);
    backend.consume(queue, SHORT).await.unwrap()
}

fn header_u64(message: &Message, key: &str) -> Option<u64> {
    message.header(key).and_then(Value::as_u64)
}

// ============================================================================
// Retry Then DLQ
// ============================================================================

mod retry_then_dlq {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_two_retries_then_dead_letter() {
        let backend = connected_backend().await;
        let manager = DlqManager::new(config(DlqPolicy::RetryThenDlq), backend.clone());

        let message = Message::new("order-1").with_max_retries(2);
        let id = message.id().clone();
        assert!(backend.publish(message.with_routing_key("orders")).await);

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            // Paused time advances to the scheduled retry while we wait
            let delivered = backend.consume("orders", WAIT).await.unwrap();
            assert_eq!(delivered.id(), &id);
            assert_eq!(delivered.status, MessageStatus::Pending);
            outcomes.push(
                manager
                    .handle_failure(delivered, "orders", &failure("timeout"))
                    .await,
            );
        }

        assert_eq!(
            outcomes[0],
            FailureOutcome::RetryScheduled {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert!(matches!(
            outcomes[1],
            FailureOutcome::RetryScheduled { attempt: 2, .. }
        ));
        assert_eq!(
            outcomes[2],
            FailureOutcome::DeadLettered {
                queue: "orders.dlq".to_string()
            }
        );

        let dead = backend.consume("orders.dlq", SHORT).await.unwrap();
        assert_eq!(dead.id(), &id);
        assert_eq!(dead.status, MessageStatus::DeadLetter);
        assert_eq!(dead.headers.retry_count, 3);
        assert_eq!(header_u64(&dead, headers::FAILURE_COUNT), Some(3));
        assert_eq!(header_u64(&dead, headers::RETRY_ATTEMPTS), Some(2));
        assert_eq!(
            dead.header(headers::ORIGINAL_QUEUE),
            Some(&Value::String("orders".to_string()))
        );
        assert_eq!(
            dead.header(headers::FAILURE_REASONS)
                .and_then(Value::as_array)
                .map(Vec::len),
            Some(3)
        );
        assert!(dead.header(headers::FIRST_FAILURE).is_some());
        assert!(dead.header(headers::LAST_FAILURE).is_some());
        assert!(dead.header(headers::TIME_TO_DLQ_SECONDS).is_some());
        assert!(dead.header(headers::TTL_SECONDS).is_none());

        let stats = manager.stats();
        assert_eq!(stats.total_failed, 3);
        assert_eq!(stats.total_retried, 2);
        assert_eq!(stats.total_dead_lettered, 1);
        assert_eq!(stats.max_retry_attempts, 2);
        // Sampled when the message was dead-lettered
        assert_eq!(stats.current_dlq_size, 1);
        assert_eq!(stats.tracked_messages, 0);
        assert!(manager.tracked(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_settles_the_delivery() {
        let backend = connected_backend().await;
        let manager = DlqManager::new(config(DlqPolicy::RetryThenDlq), backend.clone());

        let delivered = deliver(&backend, "orders", Message::new("x")).await;
        manager
            .handle_failure(delivered, "orders", &failure("timeout"))
            .await;

        let orders = backend
            .queues()
            .into_iter()
            .find(|queue| queue.name == "orders")
            .unwrap();
        assert_eq!(orders.unacked_count, 0);
        assert_eq!(manager.pending_retries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_records_retry_history() {
        let backend = connected_backend().await;
        let manager = DlqManager::new(config(DlqPolicy::RetryThenDlq), backend.clone());

        let delivered = deliver(&backend, "orders", Message::new("x")).await;
        let id = delivered.id().clone();
        manager
            .handle_failure(delivered, "orders", &failure("timeout"))
            .await;

        let tracked = manager.tracked(&id).unwrap();
        assert_eq!(tracked.original_queue, "orders");
        assert_eq!(tracked.failure_count, 1);
        assert_eq!(tracked.retry_attempts, 1);
        assert_eq!(tracked.retry_history.len(), 1);
        assert_eq!(tracked.retry_history[0].attempt, 1);
        assert_eq!(tracked.retry_history[0].delay_ms, 1_000);
        assert_eq!(tracked.message.status, MessageStatus::Retrying);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excluded_kind_goes_straight_to_dlq() {
        let backend = connected_backend().await;
        let mut settings = config(DlqPolicy::RetryThenDlq);
        settings.retry.no_retry_on = vec!["validation".to_string()];
        let manager = DlqManager::new(settings, backend.clone());

        let delivered = deliver(&backend, "orders", Message::new("x")).await;
        let outcome = manager
            .handle_failure(delivered, "orders", &failure("validation"))
            .await;

        assert!(matches!(outcome, FailureOutcome::DeadLettered { .. }));
        let dead = backend.consume("orders.dlq", SHORT).await.unwrap();
        assert_eq!(header_u64(&dead, headers::RETRY_ATTEMPTS), Some(0));
        assert_eq!(manager.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_filter_can_veto() {
        let backend = connected_backend().await;
        let manager = DlqManager::new(config(DlqPolicy::RetryThenDlq), backend.clone())
            .with_retry_filter(|message, _| message.header("no-retry").is_none());

        let delivered = deliver(&backend, "orders", Message::new("x").with_header("no-retry", true)).await;
        let outcome = manager
            .handle_failure(delivered, "orders", &failure("timeout"))
            .await;
        assert!(matches!(outcome, FailureOutcome::DeadLettered { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_delay_function() {
        let backend = connected_backend().await;
        let mut settings = config(DlqPolicy::RetryThenDlq);
        settings.retry.strategy = RetryStrategy::Custom;
        let manager = DlqManager::new(settings, backend.clone())
            .with_custom_delay(|attempt| Duration::from_millis(100 * u64::from(attempt + 1)));

        let delivered = deliver(&backend, "orders", Message::new("x")).await;
        let outcome = manager
            .handle_failure(delivered, "orders", &failure("timeout"))
            .await;
        assert_eq!(
            outcome,
            FailureOutcome::RetryScheduled {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_retry_is_dead_lettered_with_audit_headers() {
        let backend = connected_backend().await;
        backend
            .create_queue(QueueConfig::new("orders").with_max_length(1))
            .await
            .unwrap();
        let manager = DlqManager::new(config(DlqPolicy::RetryThenDlq), backend.clone());

        let delivered = deliver(&backend, "orders", Message::new("x")).await;
        let id = delivered.id().clone();
        manager
            .handle_failure(delivered, "orders", &failure("timeout"))
            .await;

        // Fill the queue so the retry cannot be republished
        assert!(backend.publish(Message::new("y").with_routing_key("orders")).await);
        tokio::time::sleep(Duration::from_secs(2)).await;
        let dead = backend.consume("orders.dlq", SHORT).await.unwrap();

        assert_eq!(dead.id(), &id);
        assert_eq!(
            dead.header(headers::ORIGINAL_QUEUE),
            Some(&Value::String("orders".to_string()))
        );
        assert_eq!(header_u64(&dead, headers::RETRY_ATTEMPTS), Some(1));
        assert_eq!(
            dead.header(headers::FAILURE_REASONS)
                .and_then(Value::as_array)
                .map(Vec::len),
            Some(2)
        );

        let stats = manager.stats();
        assert_eq!(stats.total_dead_lettered, 1);
        assert_eq!(stats.current_dlq_size, 1);
        assert_eq!(stats.tracked_messages, 0);
        assert!(manager.tracked(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry_feeds_success_rate() {
        let backend = connected_backend().await;
        let manager = DlqManager::new(config(DlqPolicy::RetryThenDlq), backend.clone());

        let delivered = deliver(&backend, "orders", Message::new("x")).await;
        manager
            .handle_failure(delivered, "orders", &failure("timeout"))
            .await;

        let retried = backend.consume("orders", WAIT).await.unwrap();
        backend.ack(&retried).await;
        manager.record_success(&retried);

        let stats = manager.stats();
        assert_eq!(stats.retry_successes, 1);
        assert_eq!(stats.retry_success_rate, 1.0);
        assert_eq!(stats.tracked_messages, 0);

        // Success for an untracked message changes nothing
        manager.record_success(&Message::new("never failed"));
        assert_eq!(manager.stats().retry_successes, 1);
    }
}

// ============================================================================
// Other Policies
// ============================================================================

mod policies {
    use super::*;

    struct CountingHandler {
        accept: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DlqHandler for CountingHandler {
        async fn handle(&self, failure: &DlqMessage, _error: &MessageProcessingError) -> bool {
            assert_eq!(failure.failure_count, 1);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.accept
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_dlq() {
        let backend = connected_backend().await;
        let manager = DlqManager::new(config(DlqPolicy::ImmediateDlq), backend.clone());

        let delivered = deliver(&backend, "orders", Message::new("x")).await;
        let outcome = manager
            .handle_failure(delivered, "orders", &failure("timeout"))
            .await;

        assert_eq!(
            outcome,
            FailureOutcome::DeadLettered {
                queue: "orders.dlq".to_string()
            }
        );
        assert_eq!(backend.queue_depth("orders.dlq").await, Some(1));
        assert_eq!(manager.stats().current_dlq_size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_discards_message() {
        let backend = connected_backend().await;
        let manager = DlqManager::new(config(DlqPolicy::Drop), backend.clone());

        let delivered = deliver(&backend, "orders", Message::new("x")).await;
        let outcome = manager
            .handle_failure(delivered, "orders", &failure("timeout"))
            .await;

        assert_eq!(outcome, FailureOutcome::Dropped);
        assert_eq!(backend.queue_depth("orders.dlq").await, None);
        assert_eq!(backend.queue_depth("orders").await, Some(0));
        assert_eq!(manager.stats().total_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_handler_accepts() {
        let backend = connected_backend().await;
        let handler = Arc::new(CountingHandler {
            accept: true,
            calls: AtomicUsize::new(0),
        });
        let manager = DlqManager::new(config(DlqPolicy::CustomHandler), backend.clone())
            .with_handler(handler.clone());

        let delivered = deliver(&backend, "orders", Message::new("x")).await;
        let outcome = manager
            .handle_failure(delivered, "orders", &failure("timeout"))
            .await;

        assert_eq!(outcome, FailureOutcome::Handled);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.pending_retries(), 0);
        assert_eq!(manager.stats().tracked_messages, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_handler_declines_to_default_path() {
        let backend = connected_backend().await;
        let handler = Arc::new(CountingHandler {
            accept: false,
            calls: AtomicUsize::new(0),
        });
        let manager = DlqManager::new(config(DlqPolicy::CustomHandler), backend.clone())
            .with_handler(handler.clone());

        let delivered = deliver(&backend, "orders", Message::new("x")).await;
        let outcome = manager
            .handle_failure(delivered, "orders", &failure("timeout"))
            .await;

        assert!(matches!(outcome, FailureOutcome::RetryScheduled { .. }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_sets_expiration() {
        let backend = connected_backend().await;
        let mut settings = config(DlqPolicy::ImmediateDlq);
        settings.dlq_ttl_seconds = Some(3_600);
        let manager = DlqManager::new(settings, backend.clone());

        let delivered = deliver(&backend, "orders", Message::new("x")).await;
        manager
            .handle_failure(delivered, "orders", &failure("timeout"))
            .await;

        let dead = backend.consume("orders.dlq", SHORT).await.unwrap();
        assert_eq!(header_u64(&dead, headers::TTL_SECONDS), Some(3_600));
        let expiration = dead.headers.expiration.unwrap();
        assert!((3_600..3_610).contains(&expiration));
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_fires_at_threshold() {
        let backend = connected_backend().await;
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let sink = alerts.clone();

        let mut settings = config(DlqPolicy::ImmediateDlq);
        settings.alert_threshold = Some(2);
        let manager = DlqManager::new(settings, backend.clone())
            .with_alert_callback(move |alert| sink.lock().unwrap().push(alert.clone()));

        for body in ["a", "b", "c"] {
            let delivered = deliver(&backend, "orders", Message::new(body)).await;
            manager
                .handle_failure(delivered, "orders", &failure("timeout"))
                .await;
        }

        let alerts = alerts.lock().unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].dlq_queue, "orders.dlq");
        assert_eq!(alerts[0].current_dlq_size, 2);
        assert_eq!(alerts[1].current_dlq_size, 3);
        assert_eq!(alerts[1].threshold, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_retries() {
        let backend = connected_backend().await;
        let manager = DlqManager::new(config(DlqPolicy::RetryThenDlq), backend.clone());

        for body in ["a", "b"] {
            let delivered = deliver(&backend, "orders", Message::new(body)).await;
            manager
                .handle_failure(delivered, "orders", &failure("timeout"))
                .await;
        }
        assert_eq!(manager.pending_retries(), 2);

        manager.shutdown().await;
        assert_eq!(manager.pending_retries(), 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.queue_depth("orders").await, Some(0));

        // With the scheduler gone, further failures are dead-lettered
        let delivered = deliver(&backend, "orders", Message::new("c")).await;
        let outcome = manager
            .handle_failure(delivered, "orders", &failure("timeout"))
            .await;
        assert!(matches!(outcome, FailureOutcome::DeadLettered { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_retry_keeps_message_unpublished() {
        let backend = connected_backend().await;
        let manager = DlqManager::new(config(DlqPolicy::RetryThenDlq), backend.clone());

        let delivered = deliver(&backend, "orders", Message::new("x")).await;
        let id = delivered.id().clone();
        manager
            .handle_failure(delivered, "orders", &failure("timeout"))
            .await;

        assert!(manager.cancel_retry(&id));
        assert_eq!(manager.cancel_all_retries(), 0);
        assert!(backend.consume("orders", WAIT).await.is_none());
    }
}

// ============================================================================
// Recovery
// ============================================================================

mod recovery {
    use super::*;

    async fn dead_letter_many(
        backend: &Arc<InMemoryBackend>,
        manager: &DlqManager,
        bodies: &[&str],
    ) {
        for body in bodies {
            let message = Message::new(*body).with_header("tenant", *body);
            let delivered = deliver(backend, "orders", message).await;
            manager
                .handle_failure(delivered, "orders", &failure("timeout"))
                .await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_respects_max_messages() {
        let backend = connected_backend().await;
        let manager = DlqManager::new(config(DlqPolicy::ImmediateDlq), backend.clone());
        dead_letter_many(&backend, &manager, &["a", "b", "c", "d", "e", "f", "g"]).await;
        assert_eq!(backend.queue_depth("orders.dlq").await, Some(7));

        let report = manager
            .recover_dlq_messages("orders.dlq", RecoveryOptions::new().with_max_messages(5))
            .await
            .unwrap();

        assert_eq!(report.recovered, 5);
        assert_eq!(report.skipped, 0);
        assert_eq!(backend.queue_depth("orders").await, Some(5));
        assert_eq!(backend.queue_depth("orders.dlq").await, Some(2));

        for _ in 0..5 {
            let recovered = backend.consume("orders", SHORT).await.unwrap();
            assert_eq!(recovered.status, MessageStatus::Pending);
            assert_eq!(recovered.headers.retry_count, 0);
            assert!(recovered
                .headers
                .custom
                .keys()
                .all(|key| !headers::is_dlq_header(key)));
            assert!(recovered.header("tenant").is_some());
        }

        let stats = manager.stats();
        assert_eq!(stats.total_recovered, 5);
        assert_eq!(stats.current_dlq_size, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_returns_other_messages_to_dlq() {
        let backend = connected_backend().await;
        let manager = DlqManager::new(config(DlqPolicy::ImmediateDlq), backend.clone());
        dead_letter_many(&backend, &manager, &["a", "b", "a"]).await;

        let options = RecoveryOptions::new()
            .with_filter(|message| message.header("tenant") == Some(&Value::from("a")));
        let report = manager
            .recover_dlq_messages("orders.dlq", options)
            .await
            .unwrap();

        assert_eq!(report.recovered, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(backend.queue_depth("orders").await, Some(2));
        assert_eq!(backend.queue_depth("orders.dlq").await, Some(1));

        let remaining = backend.consume("orders.dlq", SHORT).await.unwrap();
        assert_eq!(remaining.header("tenant"), Some(&Value::from("b")));
        assert!(remaining.header(headers::ORIGINAL_QUEUE).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_target_queue() {
        let backend = connected_backend().await;
        let manager = DlqManager::new(config(DlqPolicy::ImmediateDlq), backend.clone());
        dead_letter_many(&backend, &manager, &["a"]).await;

        let report = manager
            .recover_dlq_messages(
                "orders.dlq",
                RecoveryOptions::new().with_target_queue("orders-replay"),
            )
            .await
            .unwrap();

        assert_eq!(report.recovered, 1);
        assert_eq!(backend.queue_depth("orders-replay").await, Some(1));
        assert_eq!(backend.queue_depth("orders").await, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiration_is_cleared() {
        let backend = connected_backend().await;
        let mut settings = config(DlqPolicy::ImmediateDlq);
        settings.dlq_ttl_seconds = Some(60);
        let manager = DlqManager::new(settings, backend.clone());
        dead_letter_many(&backend, &manager, &["a"]).await;

        manager
            .recover_dlq_messages("orders.dlq", RecoveryOptions::new())
            .await
            .unwrap();

        let recovered = backend.consume("orders", SHORT).await.unwrap();
        assert_eq!(recovered.headers.expiration, None);
    }

    #[tokio::test]
    async fn test_unknown_dlq_is_an_error() {
        let backend = connected_backend().await;
        let manager = DlqManager::new(DlqConfig::default(), backend.clone());

        let result = manager
            .recover_dlq_messages("missing.dlq", RecoveryOptions::new())
            .await;
        assert!(matches!(
            result,
            Err(MessagingError::QueueNotFound { ref queue_name }) if queue_name == "missing.dlq"
        ));
    }

    #[test]
    fn test_strip_dlq_suffix() {
        assert_eq!(strip_dlq_suffix("orders.dlq", ".dlq"), "orders");
        assert_eq!(strip_dlq_suffix("orders", ".dlq"), "orders");
        assert_eq!(strip_dlq_suffix(".dlq", ".dlq"), ".dlq");
    }
}
