//! Coordinator-side verifier stack.
//!
//! Three long-lived loops cooperate over one shared [`SwarmState`]: the
//! TCP registration server ([`registry`]), the UDP heartbeat verifier
//! ([`heartbeat`]), and the liveness sweeper ([`sweeper`]).
//! [`service::run_coordinator`] wires them together.

/// Write-through state cache and per-node transition logic.
pub mod cache;
/// UDP heartbeat verification pipeline.
pub mod heartbeat;
/// TCP anchor registration server.
pub mod registry;
/// Runtime assembly and configuration.
pub mod service;
/// Dead-node sweeper and notification sink.
pub mod sweeper;

pub use cache::{BeatCommit, NodeState, SwarmState, SKIP_WINDOW};
pub use heartbeat::{run_heartbeat_listener, verify_datagram, DropKind, Verdict};
pub use registry::run_registry;
pub use service::{run_coordinator, CoordError, CoordinatorConfig};
pub use sweeper::run_sweeper;
