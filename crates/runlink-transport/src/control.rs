//! Stop flag, shutdown signal and task ownership for one physical connection.
//!
//! Teardown order matters: the stop flag is set first, then the shutdown
//! signal wakes the connection task, then the task is aborted. A task that
//! observes its channel closing checks the flag before deciding to reconnect,
//! so a deliberate close is never mistaken for a dropped connection.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use runlink_protocol::NormalizedEvent;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::sink::{ConnectionState, EventSink, TransportFailure};

#[derive(Debug, Clone)]
pub struct ConnectionControl {
    inner: Arc<ControlInner>,
}

#[derive(Debug)]
struct ControlInner {
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
    state: Mutex<ConnectionState>,
}

impl Default for ConnectionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionControl {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ControlInner {
                stopped: AtomicBool::new(false),
                shutdown,
                state: Mutex::new(ConnectionState::Idle),
            }),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Set the stop flag, then wake the task. Returns `false` if already stopped.
    pub fn request_stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.shutdown.send_replace(true);
        true
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        // the sender lives as long as `self`, so this only returns on stop
        let _ = shutdown.wait_for(|stop| *stop).await;
    }

    /// Sleep for `delay`; `false` if a stop arrived first.
    pub async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => !self.is_stopped(),
            () = self.stopped() => false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().clone()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.inner.state.lock() = state;
    }

    /// Record `state` and report it, unless the connection was stopped.
    pub fn report(&self, sink: &EventSink, state: ConnectionState) {
        self.set_state(state.clone());
        if !self.is_stopped() {
            sink.state(state);
        }
    }

    /// Forward `event` unless the connection was stopped; late arrivals are dropped.
    pub fn emit(&self, sink: &EventSink, event: NormalizedEvent) -> bool {
        if self.is_stopped() {
            return false;
        }
        sink.event(event)
    }

    /// Report that the connection ended for good, unless it was stopped.
    pub fn fail(&self, sink: &EventSink, failure: TransportFailure) -> bool {
        if self.is_stopped() {
            return false;
        }
        sink.failure(failure)
    }
}

/// A spawned connection task and its control. Dropping the handle tears the
/// connection down.
#[derive(Debug)]
pub struct ConnectionHandle {
    control: ConnectionControl,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn spawn<F>(control: ConnectionControl, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            task: tokio::spawn(task),
            control,
        }
    }

    pub fn control(&self) -> &ConnectionControl {
        &self.control
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop flag, shutdown signal, abort. Returns `false` when already shut down.
    pub fn shutdown(&self) -> bool {
        let first = self.control.request_stop();
        self.task.abort();
        if first {
            self.control.set_state(ConnectionState::Closed);
        }
        first
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
