//! Event normalizer: heterogeneous wire payloads → [`NormalizedEvent`].
//!
//! Normalization is a dispatch table keyed by the wire event name. Each rule
//! is a pure function; names without a rule fall through to the catch-all,
//! which yields [`NormalizedEvent::Raw`]. Nothing here returns an error: a
//! payload that does not match its rule's expected shape also degrades to
//! `Raw`, so an upstream schema change never tears down the stream.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde_json::{Map, Value};

use crate::event::{NormalizedEvent, RunStatus};

/// A single normalizing rule: `(event_name, payload) -> event`.
pub type NormalizeFn = fn(&str, Value) -> NormalizedEvent;

/// Event name used for duplex frames that carry no usable `type`.
pub const UNTYPED_FRAME: &str = "frame";

static DEFAULT_NORMALIZER: LazyLock<Normalizer> = LazyLock::new(Normalizer::with_default_rules);

/// Normalize one named event with the default rule set.
pub fn normalize(event_name: &str, raw_payload: &str) -> NormalizedEvent {
    DEFAULT_NORMALIZER.normalize(event_name, raw_payload)
}

/// Normalize one duplex frame (`{"type": ..., "data"?: ...}`) with the default rule set.
pub fn normalize_frame(text: &str) -> NormalizedEvent {
    DEFAULT_NORMALIZER.normalize_frame(text)
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    rules: HashMap<String, NormalizeFn>,
}

impl Normalizer {
    /// A normalizer with no rules: every event becomes `Raw`.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Rules for both the duplex frame kinds and the named stream events.
    pub fn with_default_rules() -> Self {
        let mut normalizer = Self::empty();
        normalizer
            // duplex frame kinds
            .register("message-delta", message_delta)
            .register("message-completed", message_completed)
            .register("values-updated", values_updated)
            .register("node-started", node_started)
            .register("node-completed", node_completed)
            .register("run-completed", run_completed)
            .register("interrupt", interrupt)
            .register("error", transport_error)
            // stream event names
            .register("messages.delta", message_delta)
            .register("messages.completed", message_completed)
            .register("node.started", node_started)
            .register("node.completed", node_completed)
            .register("values.updated", values_updated)
            .register("values", values_updated)
            .register("run.completed", run_completed);
        normalizer
    }

    pub fn register(&mut self, event_name: impl Into<String>, rule: NormalizeFn) -> &mut Self {
        self.rules.insert(event_name.into(), rule);
        self
    }

    pub fn is_registered(&self, event_name: &str) -> bool {
        self.rules.contains_key(event_name)
    }

    pub fn registered_names(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    /// Parse `raw_payload` as JSON (falling back to the raw text) and dispatch it.
    pub fn normalize(&self, event_name: &str, raw_payload: &str) -> NormalizedEvent {
        let payload = serde_json::from_str::<Value>(raw_payload)
            .unwrap_or_else(|_| Value::String(raw_payload.to_owned()));
        self.normalize_value(event_name, payload)
    }

    pub fn normalize_value(&self, event_name: &str, payload: Value) -> NormalizedEvent {
        match self.rules.get(event_name) {
            Some(rule) => rule(event_name, payload),
            None => raw(event_name, payload),
        }
    }

    /// Duplex frames carry their kind in `type`; the payload is `data` when
    /// present, otherwise the remaining fields of the frame.
    pub fn normalize_frame(&self, text: &str) -> NormalizedEvent {
        let frame = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(frame)) => frame,
            Ok(other) => return raw(UNTYPED_FRAME, other),
            Err(_) => return raw(UNTYPED_FRAME, Value::String(text.to_owned())),
        };

        let Some(kind) = frame.get("type").and_then(Value::as_str).map(str::to_owned) else {
            return raw(UNTYPED_FRAME, Value::Object(frame));
        };

        let mut frame = frame;
        frame.remove("type");
        let payload = match frame.remove("data") {
            Some(data) => data,
            None => Value::Object(frame),
        };
        self.normalize_value(&kind, payload)
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

fn raw(event_name: &str, data: Value) -> NormalizedEvent {
    NormalizedEvent::Raw {
        event: event_name.to_owned(),
        data,
    }
}

fn message_delta(event_name: &str, payload: Value) -> NormalizedEvent {
    let payload = match payload {
        Value::String(text) => return NormalizedEvent::MessageDelta { text },
        other => other,
    };
    match payload.get("text").and_then(Value::as_str) {
        Some(text) => NormalizedEvent::MessageDelta {
            text: text.to_owned(),
        },
        None => raw(event_name, payload),
    }
}

fn message_completed(_event_name: &str, _payload: Value) -> NormalizedEvent {
    NormalizedEvent::MessageCompleted
}

fn node_name(payload: &Value) -> Option<String> {
    if let Some(node) = payload.as_str() {
        return Some(node.to_owned());
    }
    ["node", "name"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::to_owned)
}

fn node_started(event_name: &str, payload: Value) -> NormalizedEvent {
    match node_name(&payload) {
        Some(node) => NormalizedEvent::NodeStarted { node },
        None => raw(event_name, payload),
    }
}

fn node_completed(event_name: &str, payload: Value) -> NormalizedEvent {
    let Some(node) = node_name(&payload) else {
        return raw(event_name, payload);
    };
    let tokens = payload.get("tokens").and_then(|tokens| {
        tokens
            .as_u64()
            .or_else(|| tokens.get("total_tokens").and_then(Value::as_u64))
    });
    let tokens = tokens.or_else(|| {
        payload
            .get("usage")
            .and_then(|usage| usage.get("total_tokens"))
            .and_then(Value::as_u64)
    });
    NormalizedEvent::NodeCompleted { node, tokens }
}

fn values_updated(event_name: &str, payload: Value) -> NormalizedEvent {
    let mut obj = match payload {
        Value::Object(obj) => obj,
        other => return raw(event_name, other),
    };
    // One level of unwrapping only; a nested `values.values` stays as data.
    let values: Map<String, Value> = match obj.remove("values") {
        Some(Value::Object(inner)) => inner,
        Some(other) => {
            obj.insert("values".to_owned(), other);
            obj
        }
        None => obj,
    };
    NormalizedEvent::ValuesUpdated { values }
}

fn run_completed(event_name: &str, payload: Value) -> NormalizedEvent {
    let status = match &payload {
        Value::String(status) => Some(RunStatus::from_wire(status)),
        Value::Null => Some(RunStatus::Completed),
        Value::Object(obj) => Some(
            obj.get("status")
                .and_then(Value::as_str)
                .map_or(RunStatus::Completed, RunStatus::from_wire),
        ),
        _ => None,
    };
    match status {
        Some(status) => NormalizedEvent::RunCompleted { status },
        None => raw(event_name, payload),
    }
}

fn transport_error(_event_name: &str, payload: Value) -> NormalizedEvent {
    let message = match &payload {
        Value::String(message) => message.clone(),
        Value::Object(obj) => ["message", "error", "detail"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .map_or_else(|| payload.to_string(), str::to_owned),
        Value::Null => "unknown error".to_owned(),
        other => other.to_string(),
    };
    NormalizedEvent::TransportError { message }
}

fn interrupt(_event_name: &str, payload: Value) -> NormalizedEvent {
    // Some backends send a list of pending interrupts; the first one is live.
    let payload = match payload {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };

    let id = ["id", "interrupt_id"].iter().find_map(|key| {
        payload.get(*key).and_then(|id| match id {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        })
    });

    let payload = match payload {
        Value::Object(mut obj) if obj.contains_key("value") => {
            obj.remove("value").unwrap_or(Value::Null)
        }
        other => other,
    };

    NormalizedEvent::Interrupt { id, payload }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delta_accepts_bare_string_and_text_object() {
        assert_eq!(
            normalize("messages.delta", r#""Hel""#),
            NormalizedEvent::MessageDelta { text: "Hel".into() }
        );
        assert_eq!(
            normalize("messages.delta", r#"{"text":"lo"}"#),
            NormalizedEvent::MessageDelta { text: "lo".into() }
        );
    }

    #[test]
    fn unparsable_payload_is_kept_as_raw_text() {
        // Not JSON at all: the text itself is the delta.
        assert_eq!(
            normalize("messages.delta", "plain words"),
            NormalizedEvent::MessageDelta {
                text: "plain words".into()
            }
        );
        assert_eq!(
            normalize("mystery", "{not json"),
            NormalizedEvent::Raw {
                event: "mystery".into(),
                data: Value::String("{not json".into())
            }
        );
    }

    #[test]
    fn unrecognized_delta_shape_degrades_to_raw() {
        let event = normalize("messages.delta", r#"{"content": 12}"#);
        assert!(matches!(
            event,
            NormalizedEvent::Raw { ref event, .. } if event == "messages.delta"
        ));
        let event = normalize("messages.delta", "42");
        assert!(matches!(event, NormalizedEvent::Raw { .. }));
    }

    #[test]
    fn node_identifier_prefers_node_over_name() {
        assert_eq!(
            normalize("node.started", r#"{"node":"planner","name":"ignored"}"#),
            NormalizedEvent::NodeStarted {
                node: "planner".into()
            }
        );
        assert_eq!(
            normalize("node.started", r#"{"name":"critic"}"#),
            NormalizedEvent::NodeStarted {
                node: "critic".into()
            }
        );
        assert!(matches!(
            normalize("node.started", r#"{"id":3}"#),
            NormalizedEvent::Raw { .. }
        ));
    }

    #[test]
    fn node_completed_reads_token_counts() {
        assert_eq!(
            normalize("node.completed", r#"{"node":"writer","tokens":120}"#),
            NormalizedEvent::NodeCompleted {
                node: "writer".into(),
                tokens: Some(120)
            }
        );
        assert_eq!(
            normalize(
                "node.completed",
                r#"{"name":"writer","usage":{"total_tokens":7}}"#
            ),
            NormalizedEvent::NodeCompleted {
                node: "writer".into(),
                tokens: Some(7)
            }
        );
    }

    #[test]
    fn values_unwrap_exactly_one_level() {
        let bare = normalize("values", r#"{"output":"x"}"#);
        let wrapped = normalize("values.updated", r#"{"values":{"output":"x"}}"#);
        assert_eq!(bare, wrapped);

        let nested = normalize("values", r#"{"values":{"values":{"deep":1}}}"#);
        let NormalizedEvent::ValuesUpdated { values } = nested else {
            panic!("expected values");
        };
        assert_eq!(values["values"], json!({"deep": 1}));
    }

    #[test]
    fn run_completed_defaults_to_completed() {
        assert_eq!(
            normalize("run.completed", "{}"),
            NormalizedEvent::RunCompleted {
                status: RunStatus::Completed
            }
        );
        assert_eq!(
            normalize("run.completed", r#"{"status":"failed"}"#),
            NormalizedEvent::RunCompleted {
                status: RunStatus::Failed
            }
        );
    }

    #[test]
    fn frames_use_data_or_remaining_fields() {
        assert_eq!(
            normalize_frame(r#"{"type":"message-delta","data":"Hel"}"#),
            NormalizedEvent::MessageDelta { text: "Hel".into() }
        );
        assert_eq!(
            normalize_frame(r#"{"type":"message-delta","text":"lo"}"#),
            NormalizedEvent::MessageDelta { text: "lo".into() }
        );
        assert_eq!(
            normalize_frame(r#"{"type":"error","message":"thread not found"}"#),
            NormalizedEvent::TransportError {
                message: "thread not found".into()
            }
        );
    }

    #[test]
    fn malformed_frames_never_fail() {
        assert!(matches!(
            normalize_frame("garbage"),
            NormalizedEvent::Raw { ref event, .. } if event == UNTYPED_FRAME
        ));
        assert!(matches!(
            normalize_frame(r#"{"kind":"x"}"#),
            NormalizedEvent::Raw { ref event, .. } if event == UNTYPED_FRAME
        ));
        assert!(matches!(
            normalize_frame(r#"{"type":"ping"}"#),
            NormalizedEvent::Raw { ref event, .. } if event == "ping"
        ));
    }

    #[test]
    fn interrupt_reads_id_and_value() {
        let event = normalize(
            "interrupt",
            r#"[{"id":"int-1","value":{"question":"Budget?","missing_fields":["budget"]}}]"#,
        );
        assert_eq!(
            event,
            NormalizedEvent::Interrupt {
                id: Some("int-1".into()),
                payload: json!({"question": "Budget?", "missing_fields": ["budget"]})
            }
        );
    }

    #[test]
    fn custom_registry_overrides_and_catch_all() {
        let mut normalizer = Normalizer::empty();
        normalizer.register("tick", |_, _| NormalizedEvent::MessageCompleted);
        assert!(normalizer.is_registered("tick"));
        assert_eq!(
            normalizer.normalize("tick", "{}"),
            NormalizedEvent::MessageCompleted
        );
        assert!(matches!(
            normalizer.normalize("messages.delta", r#""x""#),
            NormalizedEvent::Raw { .. }
        ));
    }
}
