//! # runlink-session — Following one run from a UI
//!
//! [`RunSessionController`] attaches to a single agent run, keeps exactly one
//! transport live, degrades from streaming to snapshot polling when the
//! stream cannot be kept up, and folds everything it receives into a
//! [`ReconciledViewState`] the UI renders from.
//!
//! ## Module Overview
//!
//! - [`controller`] — RunSessionController, StartRun
//! - [`machine`] — SessionCore reducer, SessionPhase, connection indicators
//! - [`reconcile`] — ReconciledViewState and its merge rules
//! - [`handlers`] — RunHandlers callbacks
//! - [`config`] — SessionConfig

pub mod config;
pub mod controller;
pub mod handlers;
pub mod machine;
pub mod reconcile;

pub use config::SessionConfig;
pub use controller::{RunSessionController, StartRun};
pub use handlers::{NoopHandlers, RunHandlers};
pub use machine::{ConnectionIndicator, Effect, Notification, SessionCore, SessionPhase};
pub use reconcile::{Applied, NodeStatus, PendingInterrupt, ReconciledViewState};
