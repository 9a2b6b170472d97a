//! Canonical run events.
//!
//! Every transport (duplex socket, server-sent stream, snapshot polling)
//! produces [`NormalizedEvent`]s. The set is closed; anything the normalizer
//! cannot place lands in [`NormalizedEvent::Raw`] instead of failing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Discriminated union of everything a run stream can tell the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    /// Incremental assistant text.
    MessageDelta { text: String },
    /// End of a text turn.
    MessageCompleted,
    NodeStarted {
        node: String,
    },
    NodeCompleted {
        node: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<u64>,
    },
    /// Full or partial snapshot of shared run state.
    ValuesUpdated { values: Map<String, Value> },
    /// The run is paused awaiting human input.
    Interrupt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        payload: Value,
    },
    RunCompleted { status: RunStatus },
    /// Failure the server reported in an `error` event; not a run outcome.
    TransportError { message: String },
    /// Unrecognized event name or payload shape.
    Raw { event: String, data: Value },
}

impl NormalizedEvent {
    /// Terminal events end the observable lifecycle of a run's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted { .. } | Self::TransportError { .. })
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageCompleted => "message_completed",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeCompleted { .. } => "node_completed",
            Self::ValuesUpdated { .. } => "values_updated",
            Self::Interrupt { .. } => "interrupt",
            Self::RunCompleted { .. } => "run_completed",
            Self::TransportError { .. } => "transport_error",
            Self::Raw { .. } => "raw",
        }
    }
}

/// Terminal run status reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
    Interrupted,
    Other(String),
}

impl RunStatus {
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "completed" | "complete" | "success" | "succeeded" | "done" => Self::Completed,
            "failed" | "failure" | "error" => Self::Failed,
            "cancelled" | "canceled" => Self::Cancelled,
            "interrupted" => Self::Interrupted,
            other => Self::Other(other.to_owned()),
        }
    }

    /// Whether a polled snapshot with this status ends polling.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Interrupted => f.write_str("interrupted"),
            Self::Other(status) => f.write_str(status),
        }
    }
}

/// The clarifying question carried by an interrupt payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClarifierRequest {
    pub question: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

impl ClarifierRequest {
    /// Extract the question and requested fields from an interrupt payload.
    ///
    /// Accepts `question|message|prompt` for the text and
    /// `missing_fields|fields` for the field list; a bare string payload is
    /// the question itself.
    pub fn from_payload(payload: &Value) -> Self {
        if let Some(question) = payload.as_str() {
            return Self {
                question: question.to_owned(),
                fields: Vec::new(),
            };
        }

        let question = ["question", "message", "prompt"]
            .iter()
            .find_map(|key| payload.get(*key).and_then(Value::as_str))
            .unwrap_or_default()
            .to_owned();

        let fields = ["missing_fields", "fields"]
            .iter()
            .find_map(|key| payload.get(*key).and_then(Value::as_array))
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(name) => Some(name.clone()),
                        Value::Object(obj) => obj
                            .get("name")
                            .and_then(Value::as_str)
                            .map(str::to_owned),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self { question, fields }
    }
}
