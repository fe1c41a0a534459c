//! Pattern matching primitives shared by the routing engine and exchange bindings.
//!
//! Routing keys are dot-separated words (`orders.eu.created`). Topic patterns support
//! two wildcards:
//! - `*` matches exactly one word
//! - `#` matches zero or more words
//!
//! Topic and glob patterns are translated into anchored regular expressions once and
//! matched with the `regex` crate afterwards.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a rule pattern is compared with its input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    #[default]
    Exact,
    /// Shell-style glob (`*`, `?`, `[abc]`)
    Wildcard,
    Regex,
}

/// Translate an AMQP topic pattern into an anchored regex
pub fn topic_to_regex(pattern: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in pattern.split('.') {
        // "#.#" is equivalent to "#"
        if segment == "#" && segments.last() == Some(&"#") {
            continue;
        }
        segments.push(segment);
    }

    if segments == ["#"] {
        return "^.*$".to_string();
    }

    let mut regex = String::from("^");
    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "#" if i == 0 => regex.push_str(r"(?:[^.]+\.)*"),
            "#" => regex.push_str(r"(?:\.[^.]+)*"),
            word => {
                let follows_leading_hash = i == 1 && segments[0] == "#";
                if i > 0 && !follows_leading_hash {
                    regex.push_str(r"\.");
                }
                if word == "*" {
                    regex.push_str(r"[^.]+");
                } else {
                    regex.push_str(&regex::escape(word));
                }
            }
        }
    }
    regex.push('$');
    regex
}

/// Translate a shell-style glob into an anchored regex
pub fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '[' => match chars[i + 1..].iter().position(|&c| c == ']') {
                Some(offset) if offset > 0 => {
                    let class: String = chars[i + 1..i + 1 + offset].iter().collect();
                    regex.push('[');
                    match class.strip_prefix('!') {
                        Some(negated) => {
                            regex.push('^');
                            regex.push_str(&class_escape(negated));
                        }
                        None => regex.push_str(&class_escape(&class)),
                    }
                    regex.push(']');
                    i += offset + 1;
                }
                _ => regex.push_str(r"\["),
            },
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    regex.push('$');
    regex
}

fn class_escape(class: &str) -> String {
    class.replace('\\', r"\\").replace('[', r"\[")
}

/// A compiled pattern. Compilation failures are kept and reported at match time.
#[derive(Debug, Clone)]
pub enum PatternMatcher {
    Exact(String),
    Regex(Regex),
    Invalid { pattern: String, message: String },
}

impl PatternMatcher {
    /// Compile `pattern` according to `match_type`
    pub fn new(pattern: &str, match_type: MatchType) -> Self {
        match match_type {
            MatchType::Exact => Self::Exact(pattern.to_string()),
            MatchType::Wildcard => Self::compile(pattern, &glob_to_regex(pattern)),
            MatchType::Regex => Self::compile(pattern, pattern),
        }
    }

    /// Compile an AMQP topic pattern
    pub fn topic(pattern: &str) -> Self {
        Self::compile(pattern, &topic_to_regex(pattern))
    }

    fn compile(pattern: &str, regex: &str) -> Self {
        match Regex::new(regex) {
            Ok(regex) => Self::Regex(regex),
            Err(e) => Self::Invalid {
                pattern: pattern.to_string(),
                message: e.to_string(),
            },
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Invalid { .. })
    }

    /// Match `input`, or report why the pattern cannot be evaluated
    pub fn matches(&self, input: &str) -> Result<bool, String> {
        match self {
            Self::Exact(expected) => Ok(expected == input),
            Self::Regex(regex) => Ok(regex.is_match(input)),
            Self::Invalid { pattern, message } => {
                Err(format!("pattern '{}' does not compile: {}", pattern, message))
            }
        }
    }
}

/// Header equality with numeric/string coercion: `5`, `5.0` and `"5"` are all equal.
pub fn values_match(expected: &Value, actual: &Value) -> bool {
    if expected == actual {
        return true;
    }

    if let (Some(a), Some(b)) = (as_f64(expected), as_f64(actual)) {
        return a == b;
    }

    match (scalar_text(expected), scalar_text(actual)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        _ => None,
    }
}

#[cfg(test)]
#[path = "matcher_tests.rs"]
mod tests;
