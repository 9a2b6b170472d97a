//! Snapshot payload returned by the run-state endpoint used for polling.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::RunStatus;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub values: Option<Value>,
    #[serde(default)]
    pub run_id: Option<String>,
}

impl RunSnapshot {
    /// Parse a response body; `None` means the backend sent nothing usable.
    pub fn from_body(body: &str) -> Option<Self> {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(obj)) => {
                serde_json::from_value::<Self>(Value::Object(obj)).ok().filter(|s| !s.is_empty())
            }
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && is_blank(self.output.as_ref())
            && is_blank(self.values.as_ref())
    }

    pub fn run_status(&self) -> Option<RunStatus> {
        self.status.as_deref().map(RunStatus::from_wire)
    }

    /// Size of the output payload in characters (serialized length for non-strings).
    pub fn output_len(&self) -> usize {
        match &self.output {
            None | Some(Value::Null) => 0,
            Some(Value::String(text)) => text.chars().count(),
            Some(other) => other.to_string().chars().count(),
        }
    }

    /// Values to reconcile: the `values` object plus `output` when present.
    pub fn to_values(&self) -> Option<Map<String, Value>> {
        let mut values = match &self.values {
            Some(Value::Object(obj)) => obj.clone(),
            _ => Map::new(),
        };
        if let Some(output) = self.output.as_ref().filter(|o| !o.is_null()) {
            values.insert("output".to_owned(), output.clone());
        }
        (!values.is_empty()).then_some(values)
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => text.is_empty(),
        Some(Value::Object(obj)) => obj.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_bodies_are_not_snapshots() {
        assert!(RunSnapshot::from_body("").is_none());
        assert!(RunSnapshot::from_body("null").is_none());
        assert!(RunSnapshot::from_body("{}").is_none());
        assert!(RunSnapshot::from_body("not json").is_none());
    }

    #[test]
    fn snapshot_exposes_status_and_values() {
        let snapshot = RunSnapshot::from_body(concat!(
            r#"{"status":"completed","output":"done","#,
            r#""values":{"architecture":{"nodes":2}},"run_id":"r1"}"#,
        ))
        .unwrap();
        assert_eq!(snapshot.run_status(), Some(RunStatus::Completed));
        assert_eq!(snapshot.output_len(), 4);
        let values = snapshot.to_values().unwrap();
        assert_eq!(values["output"], json!("done"));
        assert_eq!(values["architecture"], json!({"nodes": 2}));
    }
}
