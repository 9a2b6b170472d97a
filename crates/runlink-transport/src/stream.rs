//! Unidirectional (server-sent events) transport.
//!
//! Same contract as the duplex manager minus `send`. Every named event on the
//! stream is dispatched through the normalizer registry; names without a rule
//! arrive as `Raw`. The SSE client's own retry is disabled so the shared
//! backoff policy is the only reconnect loop.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::ACCEPT;
use reqwest_eventsource::{Event, EventSource, retry};
use runlink_protocol::{DEFAULT_STREAM_MODE, Endpoints, LinkResult, Normalizer, RunIdentity};
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use url::Url;

use crate::TransportConfig;
use crate::backoff::{Attempt, CloseReason, Next, Reconnect};
use crate::control::{ConnectionControl, ConnectionHandle};
use crate::sink::{ConnectionState, EventSink, TransportFailure};

#[derive(Debug)]
pub struct StreamManager {
    client: reqwest::Client,
    config: TransportConfig,
    stream_mode: String,
    normalizer: Arc<Normalizer>,
    slot: Mutex<Slot>,
}

#[derive(Debug, Default)]
struct Slot {
    active: Option<ConnectionHandle>,
    settled: ConnectionState,
}

impl StreamManager {
    pub fn new(client: reqwest::Client, config: TransportConfig) -> Self {
        Self {
            client,
            config,
            stream_mode: DEFAULT_STREAM_MODE.to_owned(),
            normalizer: Arc::new(Normalizer::with_default_rules()),
            slot: Mutex::new(Slot::default()),
        }
    }

    pub fn with_stream_mode(mut self, stream_mode: impl Into<String>) -> Self {
        self.stream_mode = stream_mode.into();
        self
    }

    pub fn with_normalizer(mut self, normalizer: Arc<Normalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    #[instrument(
        skip_all,
        fields(thread_id = %identity.thread_id, run_id = %identity.run_id, transport = "stream")
    )]
    pub fn connect(
        &self,
        endpoints: &Endpoints,
        identity: &RunIdentity,
        credential: &str,
        sink: EventSink,
    ) -> LinkResult<()> {
        let url = endpoints.stream(identity, &self.stream_mode)?;

        let mut slot = self.slot.lock();
        if let Some(previous) = slot.active.take() {
            debug!("replacing existing event stream");
            previous.shutdown();
        }

        let control = ConnectionControl::new();
        let span = info_span!(
            "event_stream",
            thread_id = %identity.thread_id,
            run_id = %identity.run_id
        );
        let task = run_stream(StreamTask {
            client: self.client.clone(),
            url,
            credential: credential.to_owned(),
            config: self.config.clone(),
            normalizer: Arc::clone(&self.normalizer),
            sink,
            control: control.clone(),
        });
        slot.active = Some(ConnectionHandle::spawn(control, task.instrument(span)));
        slot.settled = ConnectionState::Idle;
        Ok(())
    }

    pub fn disconnect(&self) {
        let mut slot = self.slot.lock();
        if let Some(active) = slot.active.take() {
            active.shutdown();
            slot.settled = ConnectionState::Closed;
            info!(transport = "stream", "event stream disconnected");
        }
    }

    pub fn state(&self) -> ConnectionState {
        let slot = self.slot.lock();
        match &slot.active {
            Some(active) => active.control().state(),
            None => slot.settled.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.slot
            .lock()
            .active
            .as_ref()
            .is_some_and(|active| !active.is_finished())
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct StreamTask {
    client: reqwest::Client,
    url: Url,
    credential: String,
    config: TransportConfig,
    normalizer: Arc<Normalizer>,
    sink: EventSink,
    control: ConnectionControl,
}

async fn run_stream(task: StreamTask) {
    let mut reconnect = Reconnect::new(task.config.backoff.clone());
    loop {
        task.control.report(
            &task.sink,
            ConnectionState::Connecting {
                attempt: reconnect.attempt(),
            },
        );
        let outcome = open_once(&task).await;
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
                warn!(attempt = reconnect.attempt(), ?class, %message, "event stream giving up");
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
                    "event stream reconnecting"
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

enum Step {
    Item(Result<Event, reqwest_eventsource::Error>),
    Ended,
    TimedOut,
}

async fn next_step(source: &mut EventSource, limit: Option<Duration>) -> Step {
    let item = match limit {
        Some(limit) => match tokio::time::timeout(limit, source.next()).await {
            Ok(item) => item,
            Err(_) => return Step::TimedOut,
        },
        None => source.next().await,
    };
    match item {
        Some(item) => Step::Item(item),
        None => Step::Ended,
    }
}

async fn open_once(task: &StreamTask) -> Attempt {
    let request = task
        .client
        .get(task.url.clone())
        .bearer_auth(&task.credential)
        .header(ACCEPT, "text/event-stream");
    let mut source = match EventSource::new(request) {
        Ok(source) => source,
        Err(error) => return Attempt::never_opened(CloseReason::Transient(error.to_string())),
    };
    source.set_retry_policy(Box::new(retry::Never));

    let mut opened = false;
    let reason = loop {
        // the connect timeout only bounds the wait for the stream to open
        let limit = (!opened).then_some(task.config.connect_timeout);
        let step = tokio::select! {
            step = next_step(&mut source, limit) => step,
            () = task.control.stopped() => break CloseReason::Intentional,
        };

        match step {
            Step::Item(Ok(Event::Open)) => {
                opened = true;
                debug!(path = task.url.path(), "event stream open");
                task.control.report(&task.sink, ConnectionState::Open);
            }
            Step::Item(Ok(Event::Message(message))) => {
                let event = task.normalizer.normalize(&message.event, &message.data);
                let terminal = event.is_terminal();
                debug!(name = %message.event, kind = event.kind(), "stream event");
                task.control.emit(&task.sink, event);
                if terminal {
                    task.control.request_stop();
                    break CloseReason::Intentional;
                }
            }
            Step::Item(Err(reqwest_eventsource::Error::InvalidStatusCode(status, _))) => {
                break CloseReason::from_http_status(status.as_u16(), status.canonical_reason());
            }
            Step::Item(Err(reqwest_eventsource::Error::StreamEnded)) | Step::Ended => {
                break CloseReason::Transient("stream ended before the run completed".to_owned());
            }
            Step::Item(Err(error)) => break CloseReason::Transient(error.to_string()),
            Step::TimedOut => {
                break CloseReason::Transient(format!(
                    "connect timed out after {}ms",
                    task.config.connect_timeout.as_millis()
                ));
            }
        }
    };
    source.close();

    if opened {
        Attempt::after_open(reason)
    } else {
        Attempt::never_opened(reason)
    }
}
