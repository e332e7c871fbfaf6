//! The canvas: a multi-resolution, question-specific view of a document.
//!
//! A [`Canvas`] is built by the [`TextEncoder`](crate::encoder::TextEncoder)
//! one chunk at a time, then handed to the controller and reasoner as an
//! immutable snapshot. All list fields only ever grow during encoding.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A named thing extracted from the document.
///
/// Keys beyond `name`/`type`/`description` are kept in `extra` so a cached
/// canvas round-trips exactly.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Entity {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub name: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_empty")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub description: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            description: description.into(),
            extra: Map::new(),
        }
    }

    /// Lenient conversion from model output. Objects keep their keys (non-string
    /// values of the three known keys are stringified); any other non-null
    /// value becomes the entity name as text. Only `null` yields `None`.
    pub fn from_model_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(obj) => {
                let mut entity = Entity::default();
                for (key, val) in obj {
                    match key.as_str() {
                        "name" => entity.name = value_to_text(val),
                        "type" => entity.kind = value_to_text(val),
                        "description" => entity.description = value_to_text(val),
                        _ => {
                            entity.extra.insert(key.clone(), val.clone());
                        }
                    }
                }
                Some(entity)
            }
            Value::Null => None,
            other => Some(Entity::new(value_to_text(other), "", "")),
        }
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{} ({}): {}", self.name, self.kind, self.description),
        }
    }
}

/// Render a JSON value as plain text: strings verbatim, `null` as empty,
/// everything else as compact JSON.
pub(crate) fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Compressed representation of a document with respect to a question.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Canvas {
    /// Chunks in document order, as split by the encoder.
    #[serde(default)]
    pub raw_chunks: Vec<String>,
    /// One summary per processed chunk (empty summaries are skipped).
    #[serde(default)]
    pub summaries: Vec<String>,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub quotes: Vec<String>,
    /// Newline-joined notes accumulated across chunks.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub notes_for_reasoner: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl Canvas {
    /// A fresh canvas holding only the raw chunks.
    pub fn with_chunks(raw_chunks: Vec<String>) -> Self {
        Self {
            raw_chunks,
            ..Default::default()
        }
    }

    /// Serialize to a JSON document with the six canvas fields.
    pub fn to_value(&self) -> Result<Value, String> {
        serde_json::to_value(self).map_err(|e| format!("failed to serialize canvas: {e}"))
    }

    /// Rebuild a canvas from its JSON document. Missing fields default to
    /// empty; a `null` notes field reads as empty.
    pub fn from_value(value: Value) -> Result<Self, String> {
        serde_json::from_value(value).map_err(|e| format!("failed to parse canvas: {e}"))
    }

    /// Append a note, newline-joined with earlier notes. Empty notes are
    /// ignored.
    pub fn push_note(&mut self, note: &str) {
        if note.is_empty() {
            return;
        }
        let combined = format!("{}\n{note}", self.notes_for_reasoner);
        self.notes_for_reasoner = combined.trim().to_string();
    }
}
