//! Tests for error types.

use super::*;

#[test]
fn test_error_transience() {
    assert!(MessagingError::from(ConnectionError::NotConnected {
        backend: "memory".to_string(),
    })
    .is_transient());

    assert!(!MessagingError::from(SerializationError::new("json", "bad input")).is_transient());

    assert!(!MessagingError::from(RoutingError::NoMatch {
        message_id: "m-1".to_string(),
        routing_key: Some("orders.create".to_string()),
    })
    .is_transient());

    assert!(MessagingError::from(MiddlewareError::Timeout {
        middleware: "slow".to_string(),
        duration: Duration::from_millis(10),
    })
    .is_transient());

    assert!(!MessagingError::from(MiddlewareError::failed("auth", "denied")).is_transient());
}

#[test]
fn test_serialization_error_carries_format_and_cause() {
    let cause = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let error = SerializationError::with_source("json", cause);

    assert_eq!(error.format, "json");
    assert!(error.to_string().starts_with("json serialization failed"));
    assert!(std::error::Error::source(&error).is_some());
}

#[test]
fn test_middleware_error_names_middleware() {
    let error = MiddlewareError::Timeout {
        middleware: "rate-limit".to_string(),
        duration: Duration::from_secs(1),
    };
    assert_eq!(error.middleware(), "rate-limit");
}

#[test]
fn test_processing_error_display() {
    let error = MessageProcessingError::new("TimeoutError", "downstream took too long");
    assert_eq!(error.to_string(), "TimeoutError: downstream took too long");
}
