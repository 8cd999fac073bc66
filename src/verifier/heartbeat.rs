//! UDP heartbeat verifier.
//!
//! Every datagram is processed independently: parse, authenticate against
//! the registered anchor, then enforce the freshness policy and commit
//! under the per-node serialization of [`SwarmState`].  Nothing is ever
//! reflected back on the wire; each verdict ends in one structured log
//! line and one counter increment.
//!
//! Verification order is parse, tag, chain, freshness.  The two hash
//! checks run outside the state lock (iterating `H^i` is the expensive
//! step); the commit re-validates the anchor under the lock so a
//! re-registration that lands mid-verification cannot smuggle an
//! old-chain beat onto the new chain.

use crate::chain::{compute_tag, digests_equal, iterate_hash, MAX_CHAIN_LENGTH};
use crate::clock::epoch_now;
use crate::metrics::Metrics;
use crate::proto::HeartbeatFrame;
use crate::verifier::cache::{BeatCommit, SwarmState};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Why a datagram was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropKind {
    /// Split failure, bad field count, or non-numeric field.
    Malformed,
    /// No anchor registered for the claimed node.
    UnknownNode,
    /// `H(payload || w)` did not match the received tag.
    AuthMismatch,
    /// `H^i(w)` did not reach the registered anchor.
    ChainMismatch,
    /// `i` at or below the committed index.
    ReplayOrReorder,
    /// `i` beyond the tolerated skip window.
    SkipTooLarge,
    /// The store rejected the commit; state unchanged.
    StoreUnavailable,
}

impl DropKind {
    /// Log token for the drop reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "MALFORMED",
            Self::UnknownNode => "UNKNOWN_NODE",
            Self::AuthMismatch => "AUTH_MISMATCH",
            Self::ChainMismatch => "CHAIN_MISMATCH",
            Self::ReplayOrReorder => "REPLAY_OR_REORDER",
            Self::SkipTooLarge => "SKIP_TOO_LARGE",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
        }
    }
}

impl std::fmt::Display for DropKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of processing one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The beat committed.
    Accepted {
        /// Node that advanced.
        node_id: String,
        /// Index it advanced to.
        index: u64,
    },
    /// The datagram was discarded.
    Dropped(DropKind),
}

/// Runs the full verification pipeline over one datagram.
pub fn verify_datagram(buf: &[u8], state: &SwarmState, now: f64) -> Verdict {
    let frame = match HeartbeatFrame::decode(buf) {
        Ok(frame) => frame,
        Err(_) => return Verdict::Dropped(DropKind::Malformed),
    };
    let anchor = match state.anchor_of(&frame.node_id) {
        Ok(Some(anchor)) => anchor,
        Ok(None) => return Verdict::Dropped(DropKind::UnknownNode),
        Err(_) => return Verdict::Dropped(DropKind::StoreUnavailable),
    };
    let expected_tag = compute_tag(&frame.payload, &frame.w);
    if !digests_equal(&expected_tag, &frame.tag) {
        return Verdict::Dropped(DropKind::AuthMismatch);
    }
    // Chains are capped at MAX_CHAIN_LENGTH beats, so a larger index can
    // never belong to a registered chain; refuse before iterating.
    if frame.index > MAX_CHAIN_LENGTH as u64 {
        return Verdict::Dropped(DropKind::SkipTooLarge);
    }
    let reached = iterate_hash(&frame.w, frame.index as usize);
    if !digests_equal(&reached, &anchor) {
        return Verdict::Dropped(DropKind::ChainMismatch);
    }
    match state.commit_beat(&frame.node_id, &anchor, frame.index, now) {
        BeatCommit::Committed => Verdict::Accepted {
            node_id: frame.node_id,
            index: frame.index,
        },
        BeatCommit::ReplayOrReorder => Verdict::Dropped(DropKind::ReplayOrReorder),
        BeatCommit::SkipTooLarge => Verdict::Dropped(DropKind::SkipTooLarge),
        BeatCommit::AnchorChanged => Verdict::Dropped(DropKind::ChainMismatch),
        BeatCommit::UnknownNode => Verdict::Dropped(DropKind::UnknownNode),
        BeatCommit::StoreUnavailable => Verdict::Dropped(DropKind::StoreUnavailable),
    }
}

/// Logs a verdict and bumps its counter.
pub(crate) fn record_verdict(verdict: &Verdict, metrics: &Metrics) {
    match verdict {
        Verdict::Accepted { node_id, index } => {
            metrics.inc_beats_accepted();
            println!("PULSE|mod=HB|evt=ACCEPT|node={node_id}|i={index}");
        }
        Verdict::Dropped(kind) => {
            match kind {
                DropKind::Malformed => metrics.inc_beats_malformed(),
                DropKind::UnknownNode => metrics.inc_beats_unknown_node(),
                DropKind::AuthMismatch => metrics.inc_beats_auth_mismatch(),
                DropKind::ChainMismatch => metrics.inc_beats_chain_mismatch(),
                DropKind::ReplayOrReorder => metrics.inc_beats_replay(),
                DropKind::SkipTooLarge => metrics.inc_beats_skip(),
                DropKind::StoreUnavailable => metrics.inc_store_errors(),
            }
            eprintln!("PULSE|mod=HB|evt=DROP|reason={kind}");
        }
    }
}

/// Receive loop: one short-lived task per datagram until shutdown flips.
pub async fn run_heartbeat_listener(
    socket: UdpSocket,
    state: Arc<SwarmState>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, _peer) = match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        eprintln!("PULSE|mod=HB|evt=RECV_ERROR|err={err}");
                        continue;
                    }
                };
                let datagram = buf[..len].to_vec();
                let state = state.clone();
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    let verdict = verify_datagram(&datagram, &state, epoch_now());
                    record_verdict(&verdict, &metrics);
                });
            }
        }
    }
}
