//! What the mock backend answers, request by request.
//!
//! Each endpoint has its own list of scripts. Request `n` plays entry `n`;
//! once the list is exhausted the last entry repeats.

use std::time::Duration;

use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq)]
pub enum SocketScript {
    /// Refuse the upgrade with this HTTP status.
    Reject { status: u16 },
    /// Upgrade, send `frames` as JSON text, then finish per `end`.
    Accept { frames: Vec<Value>, end: SocketEnd },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketEnd {
    /// Keep the socket open and read client frames until it closes.
    Hold,
    Close { code: u16, reason: String },
    /// Drop the connection without a close frame.
    Drop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamScript {
    Reject { status: u16 },
    Events { events: Vec<StreamEvent>, end: StreamEnd },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    Hold,
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    /// SSE `event:` field; `None` sends an unnamed (`message`) event.
    pub name: Option<String>,
    /// Sent verbatim when a string, as JSON otherwise.
    pub data: Value,
}

impl StreamEvent {
    pub fn named(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: Some(name.into()),
            data,
        }
    }

    pub fn unnamed(data: Value) -> Self {
        Self { name: None, data }
    }

    pub(crate) fn data_text(&self) -> String {
        match &self.data {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollScript {
    /// 200 with this JSON body.
    Snapshot(Value),
    /// 200 with an empty body.
    Empty,
    /// Bare status code.
    Status(u16),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockScript {
    pub sockets: Vec<SocketScript>,
    pub streams: Vec<StreamScript>,
    pub polls: Vec<PollScript>,
    /// Pause between scripted frames/events.
    pub frame_delay: Duration,
}

impl MockScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn socket(mut self, script: SocketScript) -> Self {
        self.sockets.push(script);
        self
    }

    pub fn stream(mut self, script: StreamScript) -> Self {
        self.streams.push(script);
        self
    }

    pub fn poll(mut self, script: PollScript) -> Self {
        self.polls.push(script);
        self
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    pub(crate) fn socket_at(&self, index: usize) -> SocketScript {
        pick(&self.sockets, index).unwrap_or(SocketScript::Reject { status: 503 })
    }

    pub(crate) fn stream_at(&self, index: usize) -> StreamScript {
        pick(&self.streams, index).unwrap_or(StreamScript::Reject { status: 503 })
    }

    pub(crate) fn poll_at(&self, index: usize) -> PollScript {
        pick(&self.polls, index).unwrap_or(PollScript::Empty)
    }
}

fn pick<T: Clone>(scripts: &[T], index: usize) -> Option<T> {
    scripts.get(index).or_else(|| scripts.last()).cloned()
}

/// A short happy-path run on every endpoint, for local development.
pub fn demo_script() -> MockScript {
    let steps = [
        ("node-started", "node.started", json!({"node": "planner"})),
        ("message-delta", "messages.delta", json!({"text": "Sketching "})),
        ("message-delta", "messages.delta", json!({"text": "a three-tier "})),
        ("message-delta", "messages.delta", json!({"text": "architecture."})),
        (
            "node-completed",
            "node.completed",
            json!({"node": "planner", "tokens": {"total_tokens": 812}}),
        ),
        (
            "interrupt",
            "interrupt",
            json!({
                "id": "clarify-1",
                "value": {
                    "question": "Expected peak requests per second?",
                    "missing_fields": ["peak_rps"]
                }
            }),
        ),
        ("values-updated", "values.updated", json!({"values": {"missing_fields": []}})),
        ("node-started", "node.started", json!({"node": "architect"})),
        (
            "values-updated",
            "values.updated",
            json!({"values": {"architecture": {"tiers": ["edge", "api", "storage"]}}}),
        ),
        ("node-completed", "node.completed", json!({"node": "architect"})),
        ("message-completed", "messages.completed", json!({})),
        ("run-completed", "run.completed", json!({"status": "completed"})),
    ];

    let frames = steps
        .iter()
        .map(|(kind, _, data)| json!({"type": kind, "data": data}))
        .collect();
    let events = steps
        .iter()
        .map(|(_, name, data)| StreamEvent::named(*name, data.clone()))
        .collect();

    MockScript::new()
        .socket(SocketScript::Accept {
            frames,
            end: SocketEnd::Hold,
        })
        .stream(StreamScript::Events {
            events,
            end: StreamEnd::Hold,
        })
        .poll(PollScript::Snapshot(json!({
            "status": "completed",
            "output": "Sketching a three-tier architecture.",
            "values": {"architecture": {"tiers": ["edge", "api", "storage"]}}
        })))
        .with_frame_delay(Duration::from_millis(250))
}
