//! # runlink-protocol — Run event contract
//!
//! Shared types for following a long-running agent run from a client: the
//! identity of the run, the canonical event taxonomy every transport produces,
//! and the normalizer that maps heterogeneous wire payloads onto it.
//!
//! It is intentionally dependency-light (no tokio, no HTTP client) so the
//! transports, the session controller and test backends can all share it.
//!
//! ## Module Overview
//!
//! - [`ids`] — Typed ID wrappers (ThreadId, RunId) and [`RunIdentity`]
//! - [`event`] — NormalizedEvent (closed set + `Raw` fallback), RunStatus, clarifier payloads
//! - [`normalize`] — Registry-based, total event normalizer
//! - [`snapshot`] — Polling snapshot wire type
//! - [`endpoint`] — Endpoint construction for the three backend surfaces
//! - [`error`] — LinkError, LinkResult

pub mod endpoint;
pub mod error;
pub mod event;
pub mod ids;
pub mod normalize;
pub mod snapshot;

pub use endpoint::{DEFAULT_STREAM_MODE, Endpoints};
pub use error::{LinkError, LinkResult};
pub use event::{ClarifierRequest, NormalizedEvent, RunStatus};
pub use ids::{RunId, RunIdentity, ThreadId};
pub use normalize::{Normalizer, normalize, normalize_frame};
pub use snapshot::RunSnapshot;
