#![deny(missing_docs)]

//! # swarm_pulse
//!
//! **swarm_pulse** is the liveness-attestation core of a swarm-coordination
//! system.  Every member node of a swarm commits to a one-way hash chain
//! (a Winternitz-style one-time construction), registers the chain tip --
//! the *anchor* -- with the Coordinator, and then proves it is still alive
//! by periodically revealing successive pre-images of that chain over UDP.
//! The Coordinator verifies each reveal against the anchor, rejects replays
//! and oversized forward skips, marks silent nodes DEAD, and keeps node
//! state durable across restarts.
//!
//! ## Components
//!
//! * **Hash chain** ([`chain`]): chain generation from an OS CSPRNG seed,
//!   iterated SHA-256, constant-time digest comparison, and crash-safe
//!   artifact persistence.
//! * **Wire codec** ([`proto`]): the heartbeat datagram and TCP
//!   registration formats shared by both endpoints.
//! * **Emitter** ([`emitter`]): the node-side lifecycle -- bootstrap a
//!   chain, register its anchor over TCP, then emit one beat per interval
//!   until the chain is spent.
//! * **Verifier** ([`verifier`]): the Coordinator-side runtime -- TCP
//!   registration server, UDP heartbeat verifier with a bounded
//!   forward-skip window, and the liveness sweeper that transitions
//!   silent nodes to DEAD.
//! * **Store** ([`store`]): the persistence capability over the
//!   `node_keys` and `heartbeat_state` tables, with a durable
//!   file-backed implementation and an in-memory one for tests.
//!
//! ## Usage
//!
//! ```rust
//! use swarm_pulse::chain::{iterate_hash, HashChain};
//!
//! // A node generates a chain of 100 beats; the anchor is public.
//! let chain = HashChain::generate(100).unwrap();
//! let anchor = *chain.anchor();
//!
//! // The i-th beat reveals x_{N-i}; the Coordinator checks H^i(w) == anchor.
//! let w = chain.reveal(3).unwrap();
//! assert_eq!(iterate_hash(w, 3), anchor);
//! ```
//!
//! The `sentinel` binary wires these pieces into a runnable Coordinator
//! (`sentinel coordinate`) and node emitter (`sentinel emit`).

pub mod chain;
mod clock;
pub mod emitter;
pub mod metrics;
pub mod proto;
pub mod store;
pub mod verifier;

pub use chain::{compute_tag, digests_equal, iterate_hash, ChainDigest, ChainError, HashChain};
pub use emitter::{run_emitter, EmitterConfig, EmitterError, EmitterOutcome};
pub use metrics::Metrics;
pub use proto::{FrameError, HeartbeatFrame};
pub use store::{
    AnchorRecord, FileStore, HeartbeatRecord, MemoryStore, NodeStatus, StateStore, StoreError,
};
pub use verifier::{
    run_coordinator, CoordError, CoordinatorConfig, DropKind, SwarmState, Verdict,
};
