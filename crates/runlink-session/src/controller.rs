//! The per-run session controller.
//!
//! Owns the three transport managers and guarantees that at most one of them
//! feeds the view at a time. Transport reports flow through a single pump
//! task into [`SessionCore`]; the effects it returns are executed here,
//! outside the core lock.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use runlink_protocol::{Endpoints, LinkError, LinkResult, RunIdentity};
use runlink_transport::{
    DuplexManager, EventSink, PollingFallback, SinkMessage, StreamManager, TransportKind,
    http_client,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, instrument};

use crate::config::SessionConfig;
use crate::handlers::{HandlerSlot, RunHandlers};
use crate::machine::{ConnectionIndicator, Effect, Notification, SessionCore, SessionPhase};
use crate::reconcile::ReconciledViewState;

/// A request to attach to one run.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRun {
    pub identity: RunIdentity,
    pub credential: String,
    /// Overrides the configured preferred transport.
    pub transport: Option<TransportKind>,
}

impl StartRun {
    pub fn new(identity: RunIdentity, credential: impl Into<String>) -> Self {
        Self {
            identity,
            credential: credential.into(),
            transport: None,
        }
    }

    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.transport = Some(kind);
        self
    }
}

struct LiveRun {
    identity: RunIdentity,
    credential: String,
    sink: EventSink,
    pump: JoinHandle<()>,
}

impl LiveRun {
    fn belongs_to(&self, generation: u64) -> bool {
        self.sink.generation() == generation
    }
}

struct Inner {
    endpoints: Endpoints,
    duplex: DuplexManager,
    stream: StreamManager,
    polling: PollingFallback,
    core: Mutex<SessionCore>,
    handlers: HandlerSlot,
    live: Mutex<Option<LiveRun>>,
}

/// Attaches a UI to a single run. Must be used inside a Tokio runtime.
///
/// Dropping the controller stops every transport.
pub struct RunSessionController {
    config: SessionConfig,
    inner: Arc<Inner>,
}

impl RunSessionController {
    pub fn new(config: SessionConfig) -> LinkResult<Self> {
        config.validate()?;
        let endpoints = Endpoints::parse(&config.base_url)?;
        let client = http_client(config.connect_timeout)?;
        let transport = config.transport_config();
        let inner = Inner {
            endpoints,
            duplex: DuplexManager::new(transport.clone()),
            stream: StreamManager::new(client.clone(), transport)
                .with_stream_mode(config.stream_mode.clone()),
            polling: PollingFallback::new(client, config.polling.clone()),
            core: Mutex::new(SessionCore::new()),
            handlers: HandlerSlot::new(),
            live: Mutex::new(None),
        };
        Ok(Self {
            config,
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Replace the callbacks. The next notification goes to `handlers`.
    pub fn set_handlers(&self, handlers: Arc<dyn RunHandlers>) {
        self.inner.handlers.replace(handlers);
    }

    /// Attach to a run, tearing down whatever run was live before.
    #[instrument(
        skip_all,
        fields(thread_id = %run.identity.thread_id, run_id = %run.identity.run_id)
    )]
    pub fn start(&self, run: StartRun) -> LinkResult<()> {
        if run.credential.is_empty() {
            return Err(LinkError::Config("credential must not be empty".to_owned()));
        }
        let inner = &self.inner;
        let kind = self.config.resolve_transport(run.transport);

        // held until the new run is installed, so an effect from the previous
        // run cannot interleave with the swap
        let mut live = inner.live.lock();
        inner.stop_transports();
        if let Some(previous) = live.take() {
            previous.pump.abort();
        }

        let generation = inner.core.lock().begin(run.identity.clone(), kind);
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(generation, kind, tx);
        let span = info_span!(
            "run_session",
            thread_id = %run.identity.thread_id,
            run_id = %run.identity.run_id,
            generation
        );
        let pump = tokio::spawn(run_pump(Arc::downgrade(inner), rx).instrument(span));

        let connected = match kind {
            TransportKind::Duplex => {
                inner
                    .duplex
                    .connect(&inner.endpoints, &run.identity, &run.credential, sink.clone())
            }
            TransportKind::Stream => {
                inner
                    .stream
                    .connect(&inner.endpoints, &run.identity, &run.credential, sink.clone())
            }
            TransportKind::Polling => inner
                .polling
                .start(&inner.endpoints, &run.identity, &run.credential, sink.clone())
                .map(|_| ()),
        };
        if let Err(error) = connected {
            error!(%error, transport = %kind, "failed to start transport");
            pump.abort();
            inner.stop_transports();
            inner.core.lock().stop();
            return Err(error);
        }

        *live = Some(LiveRun {
            identity: run.identity,
            credential: run.credential,
            sink,
            pump,
        });
        drop(live);

        if kind == TransportKind::Polling {
            inner
                .handlers
                .notify(&Notification::Connection(ConnectionIndicator::Polling));
        }
        info!(transport = %kind, generation, "run session started");
        Ok(())
    }

    /// Stop every transport and mute the current run. Safe to call repeatedly
    /// and before any start.
    pub fn stop(&self) {
        let first = self.inner.core.lock().stop();
        self.inner.teardown();
        if first {
            info!("run session stopped");
        }
    }

    /// Send a frame on the duplex channel of the live run.
    pub fn send(&self, frame: &Value) -> LinkResult<()> {
        if self.phase() != SessionPhase::Streaming(TransportKind::Duplex) {
            return Err(LinkError::NotConnected);
        }
        self.inner.duplex.send(frame)
    }

    pub fn view(&self) -> ReconciledViewState {
        self.inner.core.lock().view().clone()
    }

    pub fn identity(&self) -> Option<RunIdentity> {
        self.inner.core.lock().identity().cloned()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.core.lock().phase()
    }
}

impl Drop for RunSessionController {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RunSessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunSessionController")
            .field("base_url", &self.config.base_url)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

async fn run_pump(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<SinkMessage>) {
    while let Some(message) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch(message);
    }
    debug!("session pump finished");
}

impl Inner {
    fn dispatch(&self, message: SinkMessage) {
        let generation = message.generation;
        let effects = self.core.lock().handle(message);
        for effect in effects {
            // a start() racing this dispatch owns the handlers from here on
            if self.core.lock().generation() != generation {
                break;
            }
            self.execute(generation, effect);
        }
    }

    /// Transport effects only touch the live run if it is still `generation`;
    /// the check and the action happen under one `live` lock.
    fn execute(&self, generation: u64, effect: Effect) {
        match effect {
            Effect::Notify(notification) => self.handlers.notify(&notification),
            Effect::Teardown | Effect::ResetSession => self.release(generation),
            Effect::FallBackToPolling => self.fall_back_to_polling(generation),
        }
    }

    /// Stop the transports of a finished run and drop its resources. The pump
    /// is the caller; dropping its handle detaches it, and it exits once the
    /// last sink is gone.
    fn release(&self, generation: u64) {
        let mut live = self.live.lock();
        if !live.as_ref().is_some_and(|run| run.belongs_to(generation)) {
            return;
        }
        self.stop_transports();
        live.take();
        debug!(generation, "run released");
    }

    fn fall_back_to_polling(&self, generation: u64) {
        let started = {
            let live = self.live.lock();
            let Some(run) = live.as_ref().filter(|run| run.belongs_to(generation)) else {
                debug!(generation, "run replaced before polling fallback");
                return;
            };
            self.duplex.disconnect();
            self.stream.disconnect();
            self.polling.start(
                &self.endpoints,
                &run.identity,
                &run.credential,
                run.sink.for_kind(TransportKind::Polling),
            )
        };
        if let Err(error) = started {
            error!(%error, "failed to start polling fallback");
            self.handlers
                .notify(&Notification::Error(format!("polling could not start: {error}")));
        }
    }

    fn stop_transports(&self) {
        self.duplex.disconnect();
        self.stream.disconnect();
        self.polling.stop();
    }

    fn teardown(&self) {
        let mut live = self.live.lock();
        self.stop_transports();
        if let Some(run) = live.take() {
            run.pump.abort();
        }
    }
}
