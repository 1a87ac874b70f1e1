//! # permwatch-core
//!
//! Infers, after the fact, *how* a runtime permission decision came
//! about, by reconciling two independent observation channels: the
//! imperative request/response API and the declarative
//! status-observation API. Either channel may be unavailable, and
//! external state changes may race with in-flight requests; the
//! watchers tolerate every interleaving via pending-count and
//! deferred-state buffering.
//!
//! ## Design Principles
//!
//! - **Synchronous**: no async runtime. Suspension points are modeled
//!   as [`coordinator::Command`] values the embedding executes;
//!   results come back through explicit delivery methods.
//! - **Not thread-safe**: one logical thread, in the manner of the
//!   event loop the engine was designed for. Embeddings provide their
//!   own synchronization if they need it.
//! - **No faults**: denial, dismissal, and unavailability are
//!   first-class classified outcomes, never `Err`s. The engine never
//!   raises to its caller.
//! - **Seams over globals**: the clock and the reporter are traits;
//!   every watcher is an explicit value, so independent pages and
//!   tests run in isolation.

pub mod callback;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod reporter;
pub mod status;
pub mod timing;

pub use callback::CallbackWatcher;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use coordinator::{Command, RequestCoordinator};
pub use reporter::{LogReporter, RecordingReporter, Reporter};
pub use status::{QueryPurpose, StatusWatcher};
pub use timing::{classify, ResponseSpeed, DEFAULT_THRESHOLD};

// Boundary types come from the protocol crate; re-export the ones the
// engine API surfaces so embeddings need only one import path.
pub use permwatch_protocol::{
    Capabilities, Capability, ErrorCode, Outcome, PermissionState, Report, Source,
};
