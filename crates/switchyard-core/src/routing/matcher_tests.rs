//! Tests for pattern translation and header coercion.

use super::*;
use serde_json::json;

fn topic(pattern: &str, key: &str) -> bool {
    PatternMatcher::topic(pattern).matches(key).unwrap()
}

#[test]
fn test_topic_star_matches_exactly_one_word() {
    assert!(topic("orders.*.created", "orders.eu.created"));
    assert!(!topic("orders.*.created", "orders.eu.west.created"));
    assert!(!topic("orders.*.created", "orders.created"));
}

#[test]
fn test_topic_hash_matches_zero_or_more_words() {
    assert!(topic("orders.#", "orders.eu.created"));
    assert!(topic("orders.#", "orders.eu.west.created"));
    assert!(topic("orders.#", "orders"));
    assert!(!topic("orders.#", "payments.eu"));

    assert!(topic("#.created", "created"));
    assert!(topic("#.created", "orders.eu.created"));
    assert!(!topic("#.created", "orders.created.late"));

    assert!(topic("orders.#.created", "orders.created"));
    assert!(topic("orders.#.created", "orders.eu.west.created"));

    assert!(topic("#", "anything.at.all"));
    assert!(topic("#.#", "a.b"));
}

#[test]
fn test_topic_literals_are_escaped() {
    assert!(!topic("a+b.c", "aab.c"));
    assert!(topic("a+b.c", "a+b.c"));
}

#[test]
fn test_glob_patterns() {
    let matcher = PatternMatcher::new("orders.*", MatchType::Wildcard);
    assert!(matcher.matches("orders.create").unwrap());
    assert!(matcher.matches("orders.eu.create").unwrap());
    assert!(!matcher.matches("payments.create").unwrap());

    let single = PatternMatcher::new("v?", MatchType::Wildcard);
    assert!(single.matches("v1").unwrap());
    assert!(!single.matches("v10").unwrap());

    let class = PatternMatcher::new("region-[ab]", MatchType::Wildcard);
    assert!(class.matches("region-a").unwrap());
    assert!(!class.matches("region-c").unwrap());

    let negated = PatternMatcher::new("region-[!ab]", MatchType::Wildcard);
    assert!(negated.matches("region-c").unwrap());
}

#[test]
fn test_exact_and_regex_matching() {
    let exact = PatternMatcher::new("orders.create", MatchType::Exact);
    assert!(exact.matches("orders.create").unwrap());
    assert!(!exact.matches("orders.create.v2").unwrap());

    let regex = PatternMatcher::new(r"^orders\.(create|update)$", MatchType::Regex);
    assert!(regex.matches("orders.update").unwrap());
    assert!(!regex.matches("orders.delete").unwrap());
}

#[test]
fn test_invalid_regex_is_reported_at_match_time() {
    let matcher = PatternMatcher::new("orders.(", MatchType::Regex);
    assert!(!matcher.is_valid());
    let error = matcher.matches("orders.create").unwrap_err();
    assert!(error.contains("orders.("));
}

#[test]
fn test_values_match_coerces_numbers_and_strings() {
    assert!(values_match(&json!("eu"), &json!("eu")));
    assert!(values_match(&json!(5), &json!("5")));
    assert!(values_match(&json!("5"), &json!(5.0)));
    assert!(values_match(&json!(true), &json!("true")));
    assert!(!values_match(&json!("eu"), &json!("us")));
    assert!(!values_match(&json!(5), &json!(6)));
    assert!(!values_match(&json!({"a": 1}), &json!("a")));
}
