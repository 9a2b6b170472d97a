//! The session state machine.
//!
//! [`SessionCore`] is a pure reducer: it takes one transport report and
//! returns the effects the controller must carry out. All decisions live here
//! (which reports are stale, when to fall back to polling, when the run is
//! gone for good), which keeps them testable without any network.

use std::time::Duration;

use runlink_protocol::{NormalizedEvent, RunIdentity, RunStatus};
use runlink_transport::{
    ConnectionState, FailureClass, SinkMessage, TransportFailure, TransportKind, TransportSignal,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::reconcile::{Applied, NodeStatus, ReconciledViewState};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionPhase {
    #[default]
    Idle,
    Streaming(TransportKind),
    Polling,
    Completed(RunStatus),
    Failed,
    Stopped,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed | Self::Stopped)
    }

    /// The transport whose reports are currently accepted.
    pub fn live_transport(&self) -> Option<TransportKind> {
        match self {
            Self::Streaming(kind) => Some(*kind),
            Self::Polling => Some(TransportKind::Polling),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionIndicator {
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Polling,
}

/// One handler callback to run.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Delta(String),
    ValuesUpdated(Map<String, Value>),
    NodeStatus { node: String, status: NodeStatus },
    Interrupt {
        question: String,
        fields: Vec<String>,
        id: Option<String>,
    },
    Completed(RunStatus),
    Error(String),
    Connection(ConnectionIndicator),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Notify(Notification),
    /// Stop the streaming transport and start polling with the same identity.
    FallBackToPolling,
    /// Stop every transport and release the run's connection resources.
    Teardown,
    /// Forget the live run entirely.
    ResetSession,
}

#[derive(Debug, Default)]
pub struct SessionCore {
    generation: u64,
    identity: Option<RunIdentity>,
    phase: SessionPhase,
    view: ReconciledViewState,
}

impl SessionCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `identity` the live run, discarding everything from the previous
    /// one. Returns the new generation.
    pub fn begin(&mut self, identity: RunIdentity, kind: TransportKind) -> u64 {
        self.generation += 1;
        self.identity = Some(identity);
        self.view = ReconciledViewState::default();
        self.phase = match kind {
            TransportKind::Polling => SessionPhase::Polling,
            streaming => SessionPhase::Streaming(streaming),
        };
        self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.clone()
    }

    pub fn identity(&self) -> Option<&RunIdentity> {
        self.identity.as_ref()
    }

    pub fn view(&self) -> &ReconciledViewState {
        &self.view
    }

    /// Move to `Stopped`. Returns `false` if already stopped.
    pub fn stop(&mut self) -> bool {
        if self.phase == SessionPhase::Stopped {
            return false;
        }
        self.phase = SessionPhase::Stopped;
        true
    }

    pub fn handle(&mut self, message: SinkMessage) -> Vec<Effect> {
        if message.generation != self.generation {
            debug!(
                generation = message.generation,
                live = self.generation,
                "dropping report from previous run"
            );
            return Vec::new();
        }
        if self.phase.is_terminal() {
            return Vec::new();
        }
        if self.phase.live_transport() != Some(message.kind) {
            debug!(transport = %message.kind, "dropping report from inactive transport");
            return Vec::new();
        }

        match message.signal {
            TransportSignal::State(state) => self.on_state(message.kind, state),
            TransportSignal::Event(event) => self.on_event(message.kind, event),
            TransportSignal::Failed(TransportFailure { class, message: text }) => {
                self.on_failure(message.kind, class, text)
            }
        }
    }

    fn on_state(&mut self, kind: TransportKind, state: ConnectionState) -> Vec<Effect> {
        if !kind.is_streaming() {
            return Vec::new();
        }
        let indicator = match state {
            ConnectionState::Connecting { attempt: 0 } => ConnectionIndicator::Connecting,
            ConnectionState::Open => ConnectionIndicator::Connected,
            ConnectionState::Reconnecting { attempt, delay } => {
                ConnectionIndicator::Reconnecting { attempt, delay }
            }
            _ => return Vec::new(),
        };
        vec![Effect::Notify(Notification::Connection(indicator))]
    }

    fn on_event(&mut self, kind: TransportKind, event: NormalizedEvent) -> Vec<Effect> {
        match event {
            // an `error` frame carries the server's own words
            NormalizedEvent::TransportError { message } => {
                self.on_failure(kind, FailureClass::classify(&message), message)
            }
            NormalizedEvent::RunCompleted { status } => {
                self.view.apply(&NormalizedEvent::RunCompleted {
                    status: status.clone(),
                });
                info!(%status, transport = %kind, "run completed");
                self.phase = SessionPhase::Completed(status.clone());
                vec![
                    Effect::Teardown,
                    Effect::Notify(Notification::Completed(status)),
                ]
            }
            NormalizedEvent::Raw { event, .. } => {
                debug!(%event, "unrecognized event");
                Vec::new()
            }
            other => match self.view.apply(&other) {
                Applied::Delta(text) => vec![Effect::Notify(Notification::Delta(text))],
                Applied::Values(values) => {
                    vec![Effect::Notify(Notification::ValuesUpdated(values))]
                }
                Applied::Node { node, status } => {
                    vec![Effect::Notify(Notification::NodeStatus { node, status })]
                }
                Applied::Interrupt(pending) => vec![Effect::Notify(Notification::Interrupt {
                    question: pending.question,
                    fields: pending.fields,
                    id: pending.id,
                })],
                Applied::TurnCompleted(_) | Applied::Completed(_) | Applied::Unchanged => {
                    Vec::new()
                }
            },
        }
    }

    fn on_failure(
        &mut self,
        kind: TransportKind,
        class: FailureClass,
        message: String,
    ) -> Vec<Effect> {
        if class.is_session_fatal() {
            warn!(transport = %kind, %message, "run is no longer available");
            self.phase = SessionPhase::Failed;
            self.identity = None;
            self.view = ReconciledViewState::default();
            return vec![
                Effect::Teardown,
                Effect::ResetSession,
                Effect::Notify(Notification::Error(format!(
                    "Run is no longer available: {message}. Please start a new run."
                ))),
            ];
        }

        if kind.is_streaming() {
            info!(transport = %kind, %message, "streaming failed, falling back to polling");
            self.phase = SessionPhase::Polling;
            self.view.reset_text_buffer();
            return vec![
                Effect::FallBackToPolling,
                Effect::Notify(Notification::Connection(ConnectionIndicator::Polling)),
            ];
        }

        warn!(%message, "polling failed");
        self.phase = SessionPhase::Failed;
        vec![Effect::Teardown, Effect::Notify(Notification::Error(message))]
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(generation: u64, kind: TransportKind, event: NormalizedEvent) -> SinkMessage {
        SinkMessage {
            generation,
            kind,
            signal: TransportSignal::Event(event),
        }
    }

    fn failed(generation: u64, kind: TransportKind, failure: TransportFailure) -> SinkMessage {
        SinkMessage {
            generation,
            kind,
            signal: TransportSignal::Failed(failure),
        }
    }

    fn delta(text: &str) -> NormalizedEvent {
        NormalizedEvent::MessageDelta { text: text.into() }
    }

    fn started(kind: TransportKind) -> (SessionCore, u64) {
        let mut core = SessionCore::new();
        let generation = core.begin(RunIdentity::new("t1", "r1"), kind);
        (core, generation)
    }

    #[test]
    fn fresh_core_is_idle_and_drops_everything() {
        let mut core = SessionCore::new();
        assert_eq!(core.phase(), SessionPhase::Idle);
        assert!(core.handle(message(0, TransportKind::Duplex, delta("x"))).is_empty());
    }

    #[test]
    fn transient_stream_failure_falls_back_and_mutes_stream() {
        let (mut core, generation) = started(TransportKind::Duplex);
        core.handle(message(generation, TransportKind::Duplex, delta("par")));
        assert_eq!(core.view().text_buffer, "par");

        let effects = core.handle(failed(
            generation,
            TransportKind::Duplex,
            TransportFailure::transient("gave up after 3 reconnect attempts: connection reset"),
        ));
        assert_eq!(
            effects,
            vec![
                Effect::FallBackToPolling,
                Effect::Notify(Notification::Connection(ConnectionIndicator::Polling)),
            ]
        );
        assert_eq!(core.phase(), SessionPhase::Polling);
        assert!(core.view().text_buffer.is_empty());

        // late streamed events are not applied once polling owns the run
        let late = message(generation, TransportKind::Duplex, delta("late"));
        assert!(core.handle(late).is_empty());
        assert!(core.view().text_buffer.is_empty());

        let polled = core.handle(message(
            generation,
            TransportKind::Polling,
            NormalizedEvent::ValuesUpdated {
                values: json!({"output": "ok"}).as_object().cloned().unwrap(),
            },
        ));
        assert_eq!(polled.len(), 1);
    }

    #[test]
    fn reports_from_previous_run_are_dropped() {
        let (mut core, old) = started(TransportKind::Stream);
        let new = core.begin(RunIdentity::new("t1", "r2"), TransportKind::Stream);
        assert_ne!(old, new);
        assert!(core.handle(message(old, TransportKind::Stream, delta("stale"))).is_empty());
        assert_eq!(
            core.handle(message(new, TransportKind::Stream, delta("fresh"))),
            vec![Effect::Notify(Notification::Delta("fresh".into()))]
        );
    }

    #[test]
    fn transient_failure_is_not_reread_from_its_text() {
        let (mut core, generation) = started(TransportKind::Stream);
        let effects = core.handle(failed(
            generation,
            TransportKind::Stream,
            TransportFailure::transient(
                "gave up after 1 reconnect attempts: error sending request for url \
                 (http://127.0.0.1:1/threads/401/runs/404/stream)",
            ),
        ));
        assert_eq!(effects[0], Effect::FallBackToPolling);
        assert_eq!(core.phase(), SessionPhase::Polling);
        assert_eq!(core.identity(), Some(&RunIdentity::new("t1", "r1")));
    }

    #[test]
    fn session_fatal_failure_resets_without_fallback() {
        let (mut core, generation) = started(TransportKind::Duplex);
        let effects = core.handle(failed(
            generation,
            TransportKind::Duplex,
            TransportFailure::new(FailureClass::SessionFatal, "thread not found (code 4404)"),
        ));
        assert!(!effects.contains(&Effect::FallBackToPolling));
        assert!(effects.contains(&Effect::ResetSession));
        assert!(effects.iter().any(|effect| matches!(
            effect,
            Effect::Notify(Notification::Error(text)) if text.contains("thread not found")
        )));
        assert_eq!(core.identity(), None);
        assert_eq!(core.phase(), SessionPhase::Failed);
    }

    #[test]
    fn polling_failure_is_surfaced() {
        let (mut core, generation) = started(TransportKind::Polling);
        let effects = core.handle(failed(
            generation,
            TransportKind::Polling,
            TransportFailure::transient(
                "run failed to start: no response after 4 consecutive polls",
            ),
        ));
        assert_eq!(
            effects,
            vec![
                Effect::Teardown,
                Effect::Notify(Notification::Error(
                    "run failed to start: no response after 4 consecutive polls".into()
                )),
            ]
        );
    }

    #[test]
    fn server_error_frame_is_classified_by_its_text() {
        let (mut core, generation) = started(TransportKind::Duplex);
        let effects = core.handle(message(
            generation,
            TransportKind::Duplex,
            NormalizedEvent::TransportError {
                message: "thread not found".into(),
            },
        ));
        assert!(effects.contains(&Effect::ResetSession));
        assert_eq!(core.identity(), None);
    }

    #[test]
    fn completion_is_terminal() {
        let (mut core, generation) = started(TransportKind::Stream);
        let effects = core.handle(message(
            generation,
            TransportKind::Stream,
            NormalizedEvent::RunCompleted {
                status: RunStatus::Completed,
            },
        ));
        assert_eq!(
            effects,
            vec![
                Effect::Teardown,
                Effect::Notify(Notification::Completed(RunStatus::Completed)),
            ]
        );
        assert_eq!(core.phase(), SessionPhase::Completed(RunStatus::Completed));
        assert!(core.handle(message(generation, TransportKind::Stream, delta("x"))).is_empty());
        assert!(core.stop());
        assert!(!core.stop());
    }

    #[test]
    fn connection_states_become_indicators() {
        let (mut core, generation) = started(TransportKind::Stream);
        let state = |state| SinkMessage {
            generation,
            kind: TransportKind::Stream,
            signal: TransportSignal::State(state),
        };
        assert_eq!(
            core.handle(state(ConnectionState::Connecting { attempt: 0 })),
            vec![Effect::Notify(Notification::Connection(ConnectionIndicator::Connecting))]
        );
        assert!(core.handle(state(ConnectionState::Connecting { attempt: 2 })).is_empty());
        assert_eq!(
            core.handle(state(ConnectionState::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(400)
            })),
            vec![Effect::Notify(Notification::Connection(ConnectionIndicator::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(400)
            }))]
        );
    }
}
