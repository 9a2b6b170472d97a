//! Duplex (WebSocket) transport.
//!
//! One manager owns at most one physical channel. The connection loop runs in
//! a single task: open, forward every inbound frame through the normalizer,
//! and on an unexpected close consult the [`Reconnect`] bookkeeping. A
//! terminal frame (`run-completed`, `error`) stops the loop and closes the
//! channel without waiting for the server.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use runlink_protocol::{
    Endpoints, LinkError, LinkResult, NormalizedEvent, Normalizer, RunIdentity,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use url::Url;

use crate::TransportConfig;
use crate::backoff::{Attempt, CloseReason, Next, Reconnect};
use crate::control::{ConnectionControl, ConnectionHandle};
use crate::sink::{ConnectionState, EventSink, TransportFailure};

const PING: &str = "ping";
const PONG_FRAME: &str = r#"{"type":"pong"}"#;

#[derive(Debug)]
pub struct DuplexManager {
    config: TransportConfig,
    normalizer: Arc<Normalizer>,
    slot: Mutex<Slot>,
}

#[derive(Debug, Default)]
struct Slot {
    active: Option<ActiveChannel>,
    settled: ConnectionState,
}

#[derive(Debug)]
struct ActiveChannel {
    handle: ConnectionHandle,
    outbound: mpsc::UnboundedSender<String>,
}

impl DuplexManager {
    pub fn new(config: TransportConfig) -> Self {
        Self::with_normalizer(config, Arc::new(Normalizer::with_default_rules()))
    }

    pub fn with_normalizer(config: TransportConfig, normalizer: Arc<Normalizer>) -> Self {
        Self {
            config,
            normalizer,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Open the run's channel, tearing down any channel this manager already owns.
    #[instrument(
        skip_all,
        fields(thread_id = %identity.thread_id, run_id = %identity.run_id, transport = "duplex")
    )]
    pub fn connect(
        &self,
        endpoints: &Endpoints,
        identity: &RunIdentity,
        credential: &str,
        sink: EventSink,
    ) -> LinkResult<()> {
        let url = endpoints.duplex(identity, credential)?;

        let mut slot = self.slot.lock();
        if let Some(previous) = slot.active.take() {
            debug!("replacing existing duplex channel");
            previous.handle.shutdown();
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let control = ConnectionControl::new();
        let span = info_span!(
            "duplex_channel",
            thread_id = %identity.thread_id,
            run_id = %identity.run_id
        );
        let task = run_channel(ChannelTask {
            url,
            config: self.config.clone(),
            normalizer: Arc::clone(&self.normalizer),
            sink,
            control: control.clone(),
            outbound: outbound_rx,
        });
        slot.active = Some(ActiveChannel {
            handle: ConnectionHandle::spawn(control, task.instrument(span)),
            outbound,
        });
        slot.settled = ConnectionState::Idle;
        Ok(())
    }

    /// Stop the channel. Safe to call repeatedly and before any connect.
    pub fn disconnect(&self) {
        let mut slot = self.slot.lock();
        if let Some(active) = slot.active.take() {
            active.handle.shutdown();
            slot.settled = ConnectionState::Closed;
            info!(transport = "duplex", "duplex channel disconnected");
        }
    }

    /// Send a JSON frame on the open channel.
    pub fn send(&self, frame: &Value) -> LinkResult<()> {
        let slot = self.slot.lock();
        let active = slot.active.as_ref().ok_or(LinkError::NotConnected)?;
        if !active.handle.control().state().is_open() {
            return Err(LinkError::NotConnected);
        }
        let text = serde_json::to_string(frame)?;
        active
            .outbound
            .send(text)
            .map_err(|_| LinkError::NotConnected)
    }

    pub fn state(&self) -> ConnectionState {
        let slot = self.slot.lock();
        match &slot.active {
            Some(active) => active.handle.control().state(),
            None => slot.settled.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.slot
            .lock()
            .active
            .as_ref()
            .is_some_and(|active| !active.handle.is_finished())
    }
}

impl Drop for DuplexManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct ChannelTask {
    url: Url,
    config: TransportConfig,
    normalizer: Arc<Normalizer>,
    sink: EventSink,
    control: ConnectionControl,
    outbound: mpsc::UnboundedReceiver<String>,
}

async fn run_channel(mut task: ChannelTask) {
    let mut reconnect = Reconnect::new(task.config.backoff.clone());
    loop {
        task.control.report(
            &task.sink,
            ConnectionState::Connecting {
                attempt: reconnect.attempt(),
            },
        );
        let outcome = open_once(&mut task).await;
        if task.control.is_stopped() {
            task.control.set_state(ConnectionState::Closed);
            break;
        }

        match reconnect.after(&outcome) {
            Next::Done => {
                task.control.report(&task.sink, ConnectionState::Closed);
                break;
            }
            Next::GiveUp { message, class } => {
                warn!(attempt = reconnect.attempt(), ?class, %message, "duplex channel giving up");
                task.control.report(&task.sink, ConnectionState::Failed);
                task.control
                    .fail(&task.sink, TransportFailure::new(class, message));
                break;
            }
            Next::Retry { attempt, delay } => {
                info!(
                    attempt,
                    ?delay,
                    reason = outcome.reason.description(),
                    "duplex channel reconnecting"
                );
                task.control
                    .report(&task.sink, ConnectionState::Reconnecting { attempt, delay });
                if !task.control.sleep(delay).await {
                    task.control.set_state(ConnectionState::Closed);
                    break;
                }
            }
        }
    }
}

async fn open_once(task: &mut ChannelTask) -> Attempt {
    let timeout = task.config.connect_timeout;
    let connecting = tokio::time::timeout(timeout, connect_async(task.url.as_str()));
    let connected = tokio::select! {
        connected = connecting => connected,
        () = task.control.stopped() => return Attempt::never_opened(CloseReason::Intentional),
    };

    let socket = match connected {
        Err(_) => {
            return Attempt::never_opened(CloseReason::Transient(format!(
                "connect timed out after {}ms",
                timeout.as_millis()
            )));
        }
        Ok(Err(tungstenite::Error::Http(response))) => {
            let status = response.status();
            return Attempt::never_opened(CloseReason::from_http_status(
                status.as_u16(),
                status.canonical_reason(),
            ));
        }
        Ok(Err(error)) => {
            return Attempt::never_opened(CloseReason::Transient(error.to_string()));
        }
        Ok(Ok((socket, _response))) => socket,
    };

    debug!(path = task.url.path(), "duplex channel open");
    task.control.report(&task.sink, ConnectionState::Open);
    let (mut write, mut read) = socket.split();

    let reason = loop {
        tokio::select! {
            () = task.control.stopped() => {
                let _ = write.send(Message::Close(None)).await;
                break CloseReason::Intentional;
            }
            Some(text) = task.outbound.recv() => {
                if let Err(error) = write.send(Message::Text(text.into())).await {
                    break CloseReason::Transient(format!("send failed: {error}"));
                }
            }
            frame = read.next() => match frame {
                None => break CloseReason::Transient("connection dropped".to_owned()),
                Some(Err(error)) => break CloseReason::Transient(error.to_string()),
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => CloseReason::from_close_frame(
                            u16::from(frame.code),
                            frame.reason.as_str(),
                        ),
                        None => CloseReason::Transient("closed without a close frame".to_owned()),
                    };
                }
                Some(Ok(Message::Text(text))) => {
                    let event = task.normalizer.normalize_frame(text.as_str());
                    if matches!(&event, NormalizedEvent::Raw { event, .. } if event == PING) {
                        if let Err(error) = write.send(Message::Text(PONG_FRAME.into())).await {
                            break CloseReason::Transient(format!("send failed: {error}"));
                        }
                    } else {
                        let terminal = event.is_terminal();
                        debug!(kind = event.kind(), "duplex frame");
                        task.control.emit(&task.sink, event);
                        if terminal {
                            task.control.request_stop();
                            task.control.report(&task.sink, ConnectionState::Closing);
                            let _ = write.send(Message::Close(None)).await;
                            break CloseReason::Intentional;
                        }
                    }
                }
                Some(Ok(_)) => {}
            },
        }
    };

    Attempt::after_open(reason)
}
