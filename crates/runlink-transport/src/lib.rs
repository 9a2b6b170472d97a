//! # runlink-transport — Delivery channels for a run
//!
//! Three interchangeable ways of receiving a run's events, all reporting
//! through one [`EventSink`]:
//!
//! - a duplex WebSocket channel ([`DuplexManager`]),
//! - a server-sent event stream ([`StreamManager`]),
//! - snapshot polling as the last resort ([`PollingFallback`]).
//!
//! The two streaming managers share the pure [`BackoffPolicy`] and close
//! classification, so their retry behaviour cannot drift apart.
//!
//! ## Module Overview
//!
//! - [`backoff`] — BackoffPolicy, CloseReason, the reconnect bookkeeping
//! - [`failure`] — Session-fatal vs transient classification of failures
//! - [`sink`] — EventSink, SinkMessage, TransportFailure, ConnectionState, TransportKind
//! - [`control`] — Per-connection stop flag, shutdown signal and task handle
//! - [`duplex`] — WebSocket manager
//! - [`stream`] — SSE manager
//! - [`polling`] — Snapshot polling with circuit breaker and wall-clock ceiling
//! - [`millis`] — serde helpers for durations written as milliseconds

pub mod backoff;
pub mod control;
pub mod duplex;
pub mod failure;
pub mod millis;
pub mod polling;
pub mod sink;
pub mod stream;

use std::time::Duration;

use runlink_protocol::{LinkError, LinkResult};
use serde::{Deserialize, Serialize};

pub use backoff::{BackoffPolicy, CloseReason};
pub use control::{ConnectionControl, ConnectionHandle};
pub use duplex::DuplexManager;
pub use failure::FailureClass;
pub use polling::{PollingConfig, PollingFallback};
pub use sink::{
    ConnectionState, EventSink, SinkMessage, TransportFailure, TransportKind, TransportSignal,
};
pub use stream::StreamManager;

/// Settings shared by the two streaming managers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// HTTP client used for the stream and snapshot endpoints.
pub fn http_client(connect_timeout: Duration) -> LinkResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|error| LinkError::Transport(format!("failed to build http client: {error}")))
}
