//! Write-through state cache over the persistence adapter.
//!
//! The cache is the only shared mutable structure in the verifier.  One
//! lock serializes all per-node transitions, which keeps `(last_i,
//! last_ts)` totally ordered per node and lets the sweeper read `last_ts`
//! under the same lock a beat commit takes -- a node that has just
//! committed ALIVE cannot race into DEAD on the same tick.  The store is
//! written first on every transition; cache state mutates only after the
//! store call returns, so a crash cannot leave the cache ahead of durable
//! state.

use crate::chain::{digests_equal, ChainDigest};
use crate::store::{NodeStatus, StateStore, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Cached per-node verifier state.
#[derive(Debug, Clone, Copy)]
pub struct NodeState {
    /// Registered chain tip.
    pub anchor: ChainDigest,
    /// Highest accepted beat index.
    pub last_i: u64,
    /// Epoch seconds of the last accepted beat, `0.0` before the first.
    pub last_ts: f64,
    /// Current lifecycle status.
    pub status: NodeStatus,
}

/// Outcome of a beat commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatCommit {
    /// State advanced to the new index.
    Committed,
    /// `i` was at or below the committed index.
    ReplayOrReorder,
    /// `i` jumped past the tolerated skip window.
    SkipTooLarge,
    /// The registered anchor changed between verification and commit.
    AnchorChanged,
    /// No anchor is registered for the node.
    UnknownNode,
    /// The store rejected the write; cache untouched.
    StoreUnavailable,
}

/// Maximum tolerated forward jump in `i` per accepted beat.
///
/// `Δ = 1` is the normal case, `Δ = 2` tolerates exactly one lost
/// datagram; anything larger is rejected so a suppressed beat cannot be
/// substituted with a replay.
pub const SKIP_WINDOW: u64 = 2;

/// Result of one sweeper pass.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Nodes transitioned to DEAD this pass.
    pub dead: Vec<String>,
    /// Nodes whose DEAD transition could not be persisted (retried next
    /// tick).
    pub store_errors: usize,
}

/// Shared verifier state: cache plus the durable store behind it.
pub struct SwarmState {
    nodes: Mutex<HashMap<String, NodeState>>,
    store: Arc<dyn StateStore>,
}

impl SwarmState {
    /// Creates an empty cache over `store`.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Warms the cache with a full store scan; returns the node count.
    pub fn preload(&self) -> Result<usize, StoreError> {
        let rows = self.store.scan_all()?;
        let mut nodes = self.nodes.lock().expect("state lock poisoned");
        nodes.clear();
        for row in rows {
            let state = match row.heartbeat {
                Some(hb) => NodeState {
                    anchor: row.anchor.anchor,
                    last_i: hb.last_i,
                    last_ts: hb.last_ts,
                    status: hb.status,
                },
                None => NodeState {
                    anchor: row.anchor.anchor,
                    last_i: 0,
                    last_ts: 0.0,
                    status: NodeStatus::Registered,
                },
            };
            nodes.insert(row.anchor.node_id, state);
        }
        Ok(nodes.len())
    }

    /// Registers (or re-registers) a node: overwrites the anchor and
    /// resets heartbeat progress to `last_i = 0, REGISTERED`.
    ///
    /// This is the only path that rewinds `last_i`; it represents a new
    /// chain identity.
    pub fn register(&self, node_id: &str, anchor: &ChainDigest, now: f64) -> Result<(), StoreError> {
        let mut nodes = self.nodes.lock().expect("state lock poisoned");
        self.store.upsert_anchor(node_id, anchor, now)?;
        self.store
            .upsert_hb(node_id, 0, 0.0, NodeStatus::Registered, now)?;
        nodes.insert(
            node_id.to_string(),
            NodeState {
                anchor: *anchor,
                last_i: 0,
                last_ts: 0.0,
                status: NodeStatus::Registered,
            },
        );
        Ok(())
    }

    /// Returns the registered anchor for `node_id`, consulting the store
    /// on a cache miss and hydrating the cache from what it finds.
    pub fn anchor_of(&self, node_id: &str) -> Result<Option<ChainDigest>, StoreError> {
        let mut nodes = self.nodes.lock().expect("state lock poisoned");
        if let Some(state) = nodes.get(node_id) {
            return Ok(Some(state.anchor));
        }
        let Some(record) = self.store.get_anchor(node_id)? else {
            return Ok(None);
        };
        let hb = self.store.get_hb(node_id)?;
        let state = NodeState {
            anchor: record.anchor,
            last_i: hb.as_ref().map(|h| h.last_i).unwrap_or(0),
            last_ts: hb.as_ref().map(|h| h.last_ts).unwrap_or(0.0),
            status: hb.map(|h| h.status).unwrap_or(NodeStatus::Registered),
        };
        nodes.insert(node_id.to_string(), state);
        Ok(Some(state.anchor))
    }

    /// Attempts to commit beat `i`, enforcing the freshness policy.
    ///
    /// `verified_anchor` is the anchor the datagram's pre-image was
    /// hash-verified against outside this lock; if the node re-registered
    /// in between, the anchors no longer match and the beat is refused.
    pub fn commit_beat(
        &self,
        node_id: &str,
        verified_anchor: &ChainDigest,
        i: u64,
        now: f64,
    ) -> BeatCommit {
        let mut nodes = self.nodes.lock().expect("state lock poisoned");
        let state = match nodes.get_mut(node_id) {
            Some(state) => state,
            None => return BeatCommit::UnknownNode,
        };
        if !digests_equal(&state.anchor, verified_anchor) {
            return BeatCommit::AnchorChanged;
        }
        if i <= state.last_i {
            return BeatCommit::ReplayOrReorder;
        }
        if i > state.last_i + SKIP_WINDOW {
            return BeatCommit::SkipTooLarge;
        }
        if self
            .store
            .upsert_hb(node_id, i, now, NodeStatus::Alive, now)
            .is_err()
        {
            return BeatCommit::StoreUnavailable;
        }
        state.last_i = i;
        state.last_ts = now;
        state.status = NodeStatus::Alive;
        BeatCommit::Committed
    }

    /// Marks nodes silent past `dead_timeout` as DEAD.
    ///
    /// Nodes with no accepted beat yet (`last_ts == 0`) are left alone;
    /// they only become sweepable once they have been heard at least once.
    pub fn sweep(&self, now: f64, dead_timeout: f64) -> SweepOutcome {
        let mut nodes = self.nodes.lock().expect("state lock poisoned");
        let mut outcome = SweepOutcome::default();
        for (node_id, state) in nodes.iter_mut() {
            if state.status == NodeStatus::Dead || state.last_ts <= 0.0 {
                continue;
            }
            if now - state.last_ts <= dead_timeout {
                continue;
            }
            if self
                .store
                .upsert_hb(node_id, state.last_i, state.last_ts, NodeStatus::Dead, now)
                .is_err()
            {
                outcome.store_errors += 1;
                continue;
            }
            state.status = NodeStatus::Dead;
            outcome.dead.push(node_id.clone());
        }
        outcome.dead.sort();
        outcome
    }

    /// Snapshot of one node's cached state.
    pub fn get(&self, node_id: &str) -> Option<NodeState> {
        self.nodes
            .lock()
            .expect("state lock poisoned")
            .get(node_id)
            .copied()
    }

    /// Number of cached nodes.
    pub fn len(&self) -> usize {
        self.nodes.lock().expect("state lock poisoned").len()
    }

    /// True when no nodes are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn state_with_node(anchor: ChainDigest) -> (Arc<MemoryStore>, SwarmState) {
        let store = Arc::new(MemoryStore::new());
        let state = SwarmState::new(store.clone());
        state.register("SN000001", &anchor, 10.0).unwrap();
        (store, state)
    }

    #[test]
    fn register_initializes_and_rewinds() {
        let (store, state) = state_with_node([1u8; 32]);
        let snap = state.get("SN000001").unwrap();
        assert_eq!(snap.last_i, 0);
        assert_eq!(snap.status, NodeStatus::Registered);

        assert_eq!(
            state.commit_beat("SN000001", &[1u8; 32], 1, 11.0),
            BeatCommit::Committed
        );
        // Re-registration with a new chain rewinds last_i.
        state.register("SN000001", &[2u8; 32], 20.0).unwrap();
        let snap = state.get("SN000001").unwrap();
        assert_eq!(snap.last_i, 0);
        assert_eq!(snap.status, NodeStatus::Registered);
        let hb = store.get_hb("SN000001").unwrap().unwrap();
        assert_eq!(hb.last_i, 0);
        assert_eq!(hb.status, NodeStatus::Registered);
    }

    #[test]
    fn skip_window_policy() {
        let (_, state) = state_with_node([1u8; 32]);
        let anchor = [1u8; 32];
        assert_eq!(
            state.commit_beat("SN000001", &anchor, 1, 11.0),
            BeatCommit::Committed
        );
        assert_eq!(
            state.commit_beat("SN000001", &anchor, 1, 12.0),
            BeatCommit::ReplayOrReorder
        );
        assert_eq!(
            state.commit_beat("SN000001", &anchor, 3, 13.0),
            BeatCommit::Committed
        );
        assert_eq!(
            state.commit_beat("SN000001", &anchor, 6, 14.0),
            BeatCommit::SkipTooLarge
        );
        let snap = state.get("SN000001").unwrap();
        assert_eq!(snap.last_i, 3);
    }

    #[test]
    fn anchor_change_refuses_commit() {
        let (_, state) = state_with_node([1u8; 32]);
        assert_eq!(
            state.commit_beat("SN000001", &[9u8; 32], 1, 11.0),
            BeatCommit::AnchorChanged
        );
    }

    #[test]
    fn store_failure_leaves_cache_untouched() {
        let (store, state) = state_with_node([1u8; 32]);
        store.set_fail_writes(true);
        assert_eq!(
            state.commit_beat("SN000001", &[1u8; 32], 1, 11.0),
            BeatCommit::StoreUnavailable
        );
        let snap = state.get("SN000001").unwrap();
        assert_eq!(snap.last_i, 0);
        assert_eq!(snap.status, NodeStatus::Registered);
    }

    #[test]
    fn sweep_marks_silent_nodes_once() {
        let (store, state) = state_with_node([1u8; 32]);
        assert_eq!(
            state.commit_beat("SN000001", &[1u8; 32], 1, 100.0),
            BeatCommit::Committed
        );

        // Within the window: untouched.
        let outcome = state.sweep(106.0, 7.0);
        assert!(outcome.dead.is_empty());

        let outcome = state.sweep(108.0, 7.0);
        assert_eq!(outcome.dead, vec!["SN000001".to_string()]);
        assert_eq!(
            store.get_hb("SN000001").unwrap().unwrap().status,
            NodeStatus::Dead
        );

        // Already DEAD: not reported again.
        let outcome = state.sweep(120.0, 7.0);
        assert!(outcome.dead.is_empty());
    }

    #[test]
    fn sweep_ignores_never_heard_nodes() {
        let (_, state) = state_with_node([1u8; 32]);
        let outcome = state.sweep(1_000.0, 7.0);
        assert!(outcome.dead.is_empty());
        assert_eq!(
            state.get("SN000001").unwrap().status,
            NodeStatus::Registered
        );
    }

    #[test]
    fn preload_warms_from_store() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_anchor("SN1", &[3u8; 32], 1.0).unwrap();
        store
            .upsert_hb("SN1", 5, 2.0, NodeStatus::Alive, 2.0)
            .unwrap();
        store.upsert_anchor("SN2", &[4u8; 32], 1.0).unwrap();

        let state = SwarmState::new(store);
        assert_eq!(state.preload().unwrap(), 2);
        let sn1 = state.get("SN1").unwrap();
        assert_eq!(sn1.last_i, 5);
        assert_eq!(sn1.status, NodeStatus::Alive);
        let sn2 = state.get("SN2").unwrap();
        assert_eq!(sn2.last_i, 0);
        assert_eq!(sn2.status, NodeStatus::Registered);
    }

    #[test]
    fn cache_miss_falls_back_to_store() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_anchor("SN1", &[3u8; 32], 1.0).unwrap();
        store
            .upsert_hb("SN1", 2, 5.0, NodeStatus::Alive, 5.0)
            .unwrap();
        let state = SwarmState::new(store);
        assert_eq!(state.anchor_of("SN1").unwrap(), Some([3u8; 32]));
        assert_eq!(state.get("SN1").unwrap().last_i, 2);
        assert_eq!(state.anchor_of("ghost").unwrap(), None);
    }
}
