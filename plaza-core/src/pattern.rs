//! Capability patterns and the matcher.
//!
//! A capability pattern describes which envelopes a participant may send.
//! Evaluation is pure and deterministic given (pattern, candidate): no
//! clocks, no state, no I/O. Caching lives gateway-side, not here.
//!
//! Fragment grammar for strings, applied to kinds and string payload
//! fields alike:
//! - literal: exact match
//! - `*`: exactly one segment (segments split on `.` and `/`)
//! - `**`: zero or more segments, backtracking on later mismatch
//! - `!inner`: negation — matches when `inner` does not
//! - `/re/`: regex match
//! - a `*` inside a segment globs within that segment (`delete_*`)
//!
//! Arrays are alternatives at any position. Object payload patterns are
//! open-world: specified keys must match, unspecified keys are ignored.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One capability rule: a kind pattern plus an optional payload pattern.
/// No payload clause means the kind match alone authorizes (broad grant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityPattern {
    pub kind: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
}

impl CapabilityPattern {
    /// Broad grant for a kind pattern.
    pub fn for_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: JsonValue::String(kind.into()),
            payload: None,
        }
    }

    /// Kind pattern constrained by a payload pattern.
    pub fn with_payload(kind: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            kind: JsonValue::String(kind.into()),
            payload: Some(payload),
        }
    }

    /// Does this pattern authorize an envelope of `kind` with `payload`?
    ///
    /// The kind is tested first so payload trees are only walked for
    /// envelopes that already pass the cheap check.
    pub fn matches(&self, kind: &str, payload: &JsonValue) -> bool {
        if !kind_matches(&self.kind, kind) {
            return false;
        }
        match &self.payload {
            None => true,
            Some(pattern) => value_matches(pattern, payload),
        }
    }

    /// A bare `**` kind with no payload clause matches everything. Callers
    /// log these distinctly when loading or granting them.
    pub fn is_superuser(&self) -> bool {
        self.payload.is_none() && matches!(&self.kind, JsonValue::String(s) if s == "**")
    }
}

/// First-match-wins over a capability set. Returns the index of the first
/// matching pattern for explainability; `None` denies. An empty set denies
/// everything.
pub fn first_match(
    patterns: &[CapabilityPattern],
    kind: &str,
    payload: &JsonValue,
) -> Option<usize> {
    patterns.iter().position(|p| p.matches(kind, payload))
}

fn kind_matches(pattern: &JsonValue, kind: &str) -> bool {
    match pattern {
        JsonValue::String(s) => string_pattern_matches(s, kind),
        JsonValue::Array(alternatives) => alternatives.iter().any(|a| kind_matches(a, kind)),
        _ => false,
    }
}

/// Recursive payload-tree walk.
fn value_matches(pattern: &JsonValue, candidate: &JsonValue) -> bool {
    match pattern {
        JsonValue::Object(fields) => fields.iter().all(|(key, sub)| {
            candidate
                .get(key)
                .is_some_and(|value| value_matches(sub, value))
        }),
        JsonValue::Array(alternatives) => alternatives.iter().any(|a| value_matches(a, candidate)),
        JsonValue::String(s) => candidate
            .as_str()
            .is_some_and(|value| string_pattern_matches(s, value)),
        // Numeric and boolean literals require exact equality; null matches null.
        _ => pattern == candidate,
    }
}

fn string_pattern_matches(pattern: &str, value: &str) -> bool {
    if let Some(inner) = pattern.strip_prefix('!') {
        return !string_pattern_matches(inner, value);
    }
    if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        let body = &pattern[1..pattern.len() - 1];
        return Regex::new(body).map(|re| re.is_match(value)).unwrap_or(false);
    }
    glob_match(pattern, value)
}

fn split_segments(s: &str) -> Vec<&str> {
    s.split(['.', '/']).collect()
}

fn glob_match(pattern: &str, value: &str) -> bool {
    segments_match(&split_segments(pattern), &split_segments(value))
}

fn segments_match(pattern: &[&str], value: &[&str]) -> bool {
    match pattern.first() {
        None => value.is_empty(),
        Some(&"**") => {
            // Greedy with backtracking: try consuming any number of segments.
            (0..=value.len()).any(|taken| segments_match(&pattern[1..], &value[taken..]))
        }
        Some(segment) => match value.first() {
            Some(candidate) if segment_glob(segment, candidate) => {
                segments_match(&pattern[1..], &value[1..])
            }
            _ => false,
        },
    }
}

/// Glob within a single segment: `*` matches any run of characters.
fn segment_glob(pattern: &str, value: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == value,
        Some((prefix, rest)) => {
            let Some(tail) = value.strip_prefix(prefix) else {
                return false;
            };
            if rest.is_empty() {
                return true;
            }
            tail.char_indices()
                .map(|(i, _)| i)
                .chain(std::iter::once(tail.len()))
                .any(|i| segment_glob(rest, &tail[i..]))
        }
    }
}
