//! Structured-or-heuristic parsing of model output.
//!
//! Every stage that asks a model for JSON gets back a [`ParseOutcome`]: the
//! same canonical value either way, tagged with the path that produced it.
//! Downstream code calls [`ParseOutcome::into_inner`] and never branches on
//! the tag; it exists for logging and tests.

use serde_json::{Map, Value};

/// Result of interpreting a model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    /// The response was a JSON object and fields were read from it.
    Structured(T),
    /// The response was free text and fields were derived heuristically.
    Heuristic(T),
}

impl<T> ParseOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            ParseOutcome::Structured(v) | ParseOutcome::Heuristic(v) => v,
        }
    }

    pub fn get(&self) -> &T {
        match self {
            ParseOutcome::Structured(v) | ParseOutcome::Heuristic(v) => v,
        }
    }

    pub fn is_heuristic(&self) -> bool {
        matches!(self, ParseOutcome::Heuristic(_))
    }

    /// Transform the payload, keeping the tag.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ParseOutcome<U> {
        match self {
            ParseOutcome::Structured(v) => ParseOutcome::Structured(f(v)),
            ParseOutcome::Heuristic(v) => ParseOutcome::Heuristic(f(v)),
        }
    }
}

/// Parse `text` as a JSON object. Arrays, scalars, and invalid JSON all
/// return `None` so the caller takes its heuristic path.
pub fn json_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    }
}

/// Read a string field; non-string values are rendered as text, missing or
/// `null` fields yield `None`.
pub(crate) fn text_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(v) => Some(crate::canvas::value_to_text(v)),
    }
}

/// Read a list of strings. A bare string becomes a one-element list;
/// non-string items are rendered as text; `null` items are dropped.
pub(crate) fn text_list(obj: &Map<String, Value>, key: &str) -> Vec<String> {
    match obj.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter(|v| !v.is_null())
            .map(crate::canvas::value_to_text)
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}
