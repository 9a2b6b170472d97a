//! UI-facing callbacks.

use std::sync::Arc;

use parking_lot::Mutex;
use runlink_protocol::RunStatus;
use serde_json::{Map, Value};

use crate::machine::{ConnectionIndicator, Notification};
use crate::reconcile::NodeStatus;

/// Callbacks a rendering layer implements. Every method defaults to a no-op.
///
/// Callbacks are invoked from the session's event pump, one at a time and in
/// arrival order, never while an internal lock is held.
pub trait RunHandlers: Send + Sync {
    fn on_delta(&self, _text: &str) {}

    fn on_values_updated(&self, _values: &Map<String, Value>) {}

    fn on_node_status(&self, _node: &str, _status: NodeStatus) {}

    fn on_interrupt(&self, _question: &str, _fields: &[String], _interrupt_id: Option<&str>) {}

    fn on_completed(&self, _status: &RunStatus) {}

    fn on_error(&self, _message: &str) {}

    /// Non-blocking connection indicator (connecting, reconnecting, polling).
    fn on_connection(&self, _indicator: &ConnectionIndicator) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandlers;

impl RunHandlers for NoopHandlers {}

impl Notification {
    pub fn deliver(&self, handlers: &dyn RunHandlers) {
        match self {
            Self::Delta(text) => handlers.on_delta(text),
            Self::ValuesUpdated(values) => handlers.on_values_updated(values),
            Self::NodeStatus { node, status } => handlers.on_node_status(node, *status),
            Self::Interrupt {
                question,
                fields,
                id,
            } => handlers.on_interrupt(question, fields, id.as_deref()),
            Self::Completed(status) => handlers.on_completed(status),
            Self::Error(message) => handlers.on_error(message),
            Self::Connection(indicator) => handlers.on_connection(indicator),
        }
    }
}

/// The single, swappable handler set. Readers take the current set for each
/// notification, so a replacement is seen by the very next event.
pub(crate) struct HandlerSlot {
    current: Mutex<Arc<dyn RunHandlers>>,
}

impl HandlerSlot {
    pub(crate) fn new() -> Self {
        Self {
            current: Mutex::new(Arc::new(NoopHandlers)),
        }
    }

    pub(crate) fn replace(&self, handlers: Arc<dyn RunHandlers>) {
        *self.current.lock() = handlers;
    }

    pub(crate) fn notify(&self, notification: &Notification) {
        let handlers = Arc::clone(&self.current.lock());
        notification.deliver(handlers.as_ref());
    }
}

impl std::fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSlot").finish_non_exhaustive()
    }
}
