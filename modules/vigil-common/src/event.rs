//! The event model.
//!
//! Events are string-keyed maps of JSON-shaped values. They flow through
//! pipeline channels by value and are immutable once emitted downstream:
//! rulesets that "modify" an event produce a new map.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EventError;

/// Annotation key outputs add to carry the emitting endpoint's PNS.
pub const PNS_KEY: &str = "_vigil_pns";

/// Annotation key outputs add to carry the emission timestamp (RFC 3339).
pub const EMITTED_AT_KEY: &str = "_vigil_emitted_at";

/// A single pipeline event: a string-keyed map of dynamically-typed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Map<String, Value>);

impl Event {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Parse one NDJSON line. The top-level value must be an object.
    pub fn from_json_line(line: &str) -> Result<Self, EventError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| EventError::Malformed(e.to_string()))?;
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(EventError::Malformed(format!(
                "expected a JSON object, got {}",
                type_name(&other)
            ))),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Raw field lookup. Dotted keys resolve into nested maps:
    /// `get("a.b")` looks up `b` inside the map at `a`.
    pub fn get(&self, field: &str) -> Option<&Value> {
        match self.0.get(field) {
            Some(v) => Some(v),
            None if field.contains('.') => {
                let mut parts = field.split('.');
                let mut current = self.0.get(parts.next()?)?;
                for part in parts {
                    current = current.as_object()?.get(part)?;
                }
                Some(current)
            }
            None => None,
        }
    }

    /// String view of a field. Scalars are rendered; maps and sequences are
    /// not (they fail with `WrongType`).
    pub fn get_str(&self, field: &str) -> Result<String, EventError> {
        let value = self.get(field).ok_or_else(|| EventError::FieldMissing {
            field: field.to_string(),
        })?;
        match value {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Null => Ok(String::new()),
            _ => Err(EventError::WrongType {
                field: field.to_string(),
                expected: "scalar",
            }),
        }
    }

    pub fn get_i64(&self, field: &str) -> Result<i64, EventError> {
        let value = self.get(field).ok_or_else(|| EventError::FieldMissing {
            field: field.to_string(),
        })?;
        match value {
            Value::Number(n) => n.as_i64().ok_or(EventError::WrongType {
                field: field.to_string(),
                expected: "integer",
            }),
            Value::String(s) => s.parse().map_err(|_| EventError::WrongType {
                field: field.to_string(),
                expected: "integer",
            }),
            _ => Err(EventError::WrongType {
                field: field.to_string(),
                expected: "integer",
            }),
        }
    }

    pub fn get_f64(&self, field: &str) -> Result<f64, EventError> {
        let value = self.get(field).ok_or_else(|| EventError::FieldMissing {
            field: field.to_string(),
        })?;
        match value {
            Value::Number(n) => n.as_f64().ok_or(EventError::WrongType {
                field: field.to_string(),
                expected: "number",
            }),
            Value::String(s) => s.parse().map_err(|_| EventError::WrongType {
                field: field.to_string(),
                expected: "number",
            }),
            _ => Err(EventError::WrongType {
                field: field.to_string(),
                expected: "number",
            }),
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn to_json_line(&self) -> String {
        // A map of JSON values always serializes.
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }
}

impl From<Map<String, Value>> for Event {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Event {
        Event::from_json_line(
            r#"{"exe":"/bin/sh","pid":42,"score":1.5,"meta":{"src_ip":"10.0.0.1"}}"#,
        )
        .unwrap()
    }

    #[test]
    fn scalar_accessors() {
        let ev = sample();
        assert_eq!(ev.get_str("exe").unwrap(), "/bin/sh");
        assert_eq!(ev.get_i64("pid").unwrap(), 42);
        assert_eq!(ev.get_f64("score").unwrap(), 1.5);
        // Numbers render as strings too
        assert_eq!(ev.get_str("pid").unwrap(), "42");
    }

    #[test]
    fn dotted_path_resolves_nested_maps() {
        let ev = sample();
        assert_eq!(ev.get_str("meta.src_ip").unwrap(), "10.0.0.1");
        assert!(ev.get("meta.missing").is_none());
    }

    #[test]
    fn missing_and_wrong_type_are_structured() {
        let ev = sample();
        assert!(matches!(
            ev.get_str("nope"),
            Err(EventError::FieldMissing { .. })
        ));
        assert!(matches!(
            ev.get_str("meta"),
            Err(EventError::WrongType { .. })
        ));
    }

    #[test]
    fn rejects_non_object_lines() {
        assert!(Event::from_json_line("[1,2,3]").is_err());
        assert!(Event::from_json_line("not json").is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let ev = sample();
        let again = Event::from_json_line(&ev.to_json_line()).unwrap();
        assert_eq!(ev, again);
    }

    #[test]
    fn dotted_key_at_top_level_wins_over_path() {
        let mut ev = Event::new();
        ev.insert("a.b", json!("flat"));
        assert_eq!(ev.get_str("a.b").unwrap(), "flat");
    }
}
