//! Client-side projection of a run.
//!
//! State fields merge key by key (last write wins), so replaying a snapshot
//! is harmless. Node status only moves forward. Delta text is the one
//! append-only field; it is cleared whenever the transport changes.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use runlink_protocol::{ClarifierRequest, NormalizedEvent, RunStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Per-node lifecycle, ordered `Idle < Running < Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Idle,
    Running,
    Done,
}

/// A clarifying question the run is paused on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInterrupt {
    pub id: Option<String>,
    pub question: String,
    pub fields: Vec<String>,
    pub payload: Value,
}

/// What applying one event changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Delta(String),
    /// A text turn ended; `true` when a message was appended.
    TurnCompleted(bool),
    Values(Map<String, Value>),
    Node { node: String, status: NodeStatus },
    Interrupt(PendingInterrupt),
    Completed(RunStatus),
    /// Nothing to report (stale node transition, raw or error events).
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciledViewState {
    pub values: Map<String, Value>,
    pub text_buffer: String,
    pub messages: Vec<Value>,
    pub nodes: IndexMap<String, NodeStatus>,
    pub interrupt: Option<PendingInterrupt>,
    pub status: Option<RunStatus>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl ReconciledViewState {
    pub fn apply(&mut self, event: &NormalizedEvent) -> Applied {
        self.apply_at(event, Utc::now())
    }

    pub fn apply_at(&mut self, event: &NormalizedEvent, at: DateTime<Utc>) -> Applied {
        let applied = match event {
            NormalizedEvent::MessageDelta { text } => {
                self.text_buffer.push_str(text);
                Applied::Delta(text.clone())
            }
            NormalizedEvent::MessageCompleted => Applied::TurnCompleted(self.flush_message()),
            NormalizedEvent::NodeStarted { node } => self.advance(node, NodeStatus::Running),
            NormalizedEvent::NodeCompleted { node, .. } => self.advance(node, NodeStatus::Done),
            NormalizedEvent::ValuesUpdated { values } => {
                self.merge_values(values);
                Applied::Values(values.clone())
            }
            NormalizedEvent::Interrupt { id, payload } => {
                let request = ClarifierRequest::from_payload(payload);
                let pending = PendingInterrupt {
                    id: id.clone(),
                    question: request.question,
                    fields: request.fields,
                    payload: payload.clone(),
                };
                self.interrupt = Some(pending.clone());
                Applied::Interrupt(pending)
            }
            NormalizedEvent::RunCompleted { status } => {
                self.status = Some(status.clone());
                Applied::Completed(status.clone())
            }
            NormalizedEvent::TransportError { .. } | NormalizedEvent::Raw { .. } => {
                return Applied::Unchanged;
            }
        };
        self.last_event_at = Some(at);
        applied
    }

    /// Key-wise merge. A `messages` array replaces the message list; an empty
    /// `missing_fields` list answers the pending interrupt.
    pub fn merge_values(&mut self, values: &Map<String, Value>) {
        for (key, value) in values {
            self.values.insert(key.clone(), value.clone());
        }
        if let Some(Value::Array(messages)) = values.get("messages") {
            self.messages = messages.clone();
        }
        if let Some(Value::Array(missing)) = values.get("missing_fields")
            && missing.is_empty()
        {
            self.interrupt = None;
        }
    }

    pub fn node_status(&self, node: &str) -> NodeStatus {
        self.nodes.get(node).copied().unwrap_or_default()
    }

    /// Drop partial delta text, e.g. across a transport switch.
    pub fn reset_text_buffer(&mut self) {
        self.text_buffer.clear();
    }

    fn advance(&mut self, node: &str, status: NodeStatus) -> Applied {
        let current = self.nodes.entry(node.to_owned()).or_default();
        if status <= *current {
            return Applied::Unchanged;
        }
        *current = status;
        Applied::Node {
            node: node.to_owned(),
            status,
        }
    }

    fn flush_message(&mut self) -> bool {
        if self.text_buffer.is_empty() {
            return false;
        }
        let content = std::mem::take(&mut self.text_buffer);
        self.messages
            .push(json!({"role": "assistant", "content": content}));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn values(value: Value) -> NormalizedEvent {
        match value {
            Value::Object(values) => NormalizedEvent::ValuesUpdated { values },
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn replaying_values_is_idempotent() {
        let update = values(json!({
            "architecture": {"tiers": 3},
            "messages": [{"role": "user", "content": "design a cdn"}]
        }));

        let mut once = ReconciledViewState::default();
        once.apply_at(&update, at());
        let mut twice = ReconciledViewState::default();
        twice.apply_at(&update, at());
        twice.apply_at(&update, at());

        assert_eq!(once, twice);
        assert_eq!(twice.messages.len(), 1);
    }

    #[test]
    fn partial_values_only_overwrite_present_keys() {
        let mut view = ReconciledViewState::default();
        view.apply_at(&values(json!({"a": 1, "b": 2})), at());
        view.apply_at(&values(json!({"b": 3})), at());
        assert_eq!(view.values["a"], 1);
        assert_eq!(view.values["b"], 3);
    }

    #[test]
    fn node_status_never_regresses() {
        let mut view = ReconciledViewState::default();
        let started = NormalizedEvent::NodeStarted { node: "planner".into() };
        let completed = NormalizedEvent::NodeCompleted {
            node: "planner".into(),
            tokens: Some(10),
        };

        assert_eq!(
            view.apply_at(&completed, at()),
            Applied::Node { node: "planner".into(), status: NodeStatus::Done }
        );
        assert_eq!(view.apply_at(&started, at()), Applied::Unchanged);
        assert_eq!(view.node_status("planner"), NodeStatus::Done);
        assert_eq!(view.node_status("unknown"), NodeStatus::Idle);
    }

    #[test]
    fn completed_turn_appends_buffered_text() {
        let mut view = ReconciledViewState::default();
        for text in ["Hel", "lo"] {
            view.apply_at(&NormalizedEvent::MessageDelta { text: text.into() }, at());
        }
        assert_eq!(
            view.apply_at(&NormalizedEvent::MessageCompleted, at()),
            Applied::TurnCompleted(true)
        );
        assert_eq!(view.messages, vec![json!({"role": "assistant", "content": "Hello"})]);
        assert!(view.text_buffer.is_empty());
        assert_eq!(
            view.apply_at(&NormalizedEvent::MessageCompleted, at()),
            Applied::TurnCompleted(false)
        );
        assert_eq!(view.messages.len(), 1);
    }

    #[test]
    fn empty_missing_fields_clears_interrupt() {
        let mut view = ReconciledViewState::default();
        view.apply_at(
            &NormalizedEvent::Interrupt {
                id: Some("i-1".into()),
                payload: json!({"question": "Budget?", "missing_fields": ["budget"]}),
            },
            at(),
        );
        let pending = view.interrupt.clone().unwrap();
        assert_eq!(pending.question, "Budget?");
        assert_eq!(pending.fields, vec!["budget"]);

        view.apply_at(&values(json!({"architecture": {}})), at());
        assert!(view.interrupt.is_some());
        view.apply_at(&values(json!({"missing_fields": []})), at());
        assert!(view.interrupt.is_none());
    }

    #[test]
    fn raw_and_error_events_leave_view_untouched() {
        let mut view = ReconciledViewState::default();
        let raw = NormalizedEvent::Raw {
            event: "custom".into(),
            data: Value::Null,
        };
        assert_eq!(view.apply_at(&raw, at()), Applied::Unchanged);
        assert_eq!(view, ReconciledViewState::default());
    }
}
