//! The channel every transport reports through.
//!
//! A sink is stamped with the run generation and the transport kind that
//! owns it. The receiving side uses both stamps to drop reports from a run
//! that is no longer live, or from a transport that has been replaced.

use std::fmt;
use std::time::Duration;

use runlink_protocol::NormalizedEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::failure::FailureClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Bidirectional WebSocket channel.
    Duplex,
    /// Server-sent event stream.
    Stream,
    /// Periodic snapshot fetch.
    Polling,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Duplex => "duplex",
            Self::Stream => "stream",
            Self::Polling => "polling",
        }
    }

    pub fn is_streaming(self) -> bool {
        matches!(self, Self::Duplex | Self::Stream)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one logical connection.
///
/// `Idle → Connecting → Open → (Closing | Closed)`; a transient close goes
/// through `Reconnecting` back to `Connecting`, an exhausted or permanent
/// one ends in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting {
        attempt: u32,
    },
    Open,
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// A transport stopped for good. The class travels with the message so the
/// session never has to guess it back from the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub class: FailureClass,
    pub message: String,
}

impl TransportFailure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Transient, message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Event(NormalizedEvent),
    State(ConnectionState),
    Failed(TransportFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkMessage {
    pub generation: u64,
    pub kind: TransportKind,
    pub signal: TransportSignal,
}

#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    kind: TransportKind,
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl EventSink {
    pub fn new(
        generation: u64,
        kind: TransportKind,
        tx: mpsc::UnboundedSender<SinkMessage>,
    ) -> Self {
        Self { generation, kind, tx }
    }

    /// A sink together with its receiving end.
    pub fn channel(
        generation: u64,
        kind: TransportKind,
    ) -> (Self, mpsc::UnboundedReceiver<SinkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(generation, kind, tx), rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Same run and receiver, reported under another transport kind.
    pub fn for_kind(&self, kind: TransportKind) -> Self {
        Self {
            generation: self.generation,
            kind,
            tx: self.tx.clone(),
        }
    }

    /// Returns `false` once the receiver is gone.
    pub fn event(&self, event: NormalizedEvent) -> bool {
        self.send(TransportSignal::Event(event))
    }

    pub fn state(&self, state: ConnectionState) -> bool {
        self.send(TransportSignal::State(state))
    }

    pub fn failure(&self, failure: TransportFailure) -> bool {
        self.send(TransportSignal::Failed(failure))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, signal: TransportSignal) -> bool {
        self.tx
            .send(SinkMessage {
                generation: self.generation,
                kind: self.kind,
                signal,
            })
            .is_ok()
    }
}
