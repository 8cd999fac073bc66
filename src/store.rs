//! Persistence capability over the `node_keys` and `heartbeat_state`
//! tables.
//!
//! The Coordinator is the single writer per node; the store only promises
//! read-your-own-writes and per-row atomicity.  [`FileStore`] is the
//! durable implementation -- two JSON tables under a directory, each
//! rewritten through a temp-file-then-rename so a crash can never leave a
//! half-written table.  [`MemoryStore`] backs tests.

use crate::chain::{write_atomic, ChainDigest, DIGEST_WIDTH};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Lifecycle state of a node as tracked by the Coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    /// Anchor registered, no beat accepted yet.
    Registered,
    /// At least one beat accepted and not timed out since.
    Alive,
    /// Silent past the dead timeout.
    Dead,
}

impl NodeStatus {
    /// Table representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "REGISTERED",
            Self::Alive => "ALIVE",
            Self::Dead => "DEAD",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row of the `node_keys` table.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorRecord {
    /// Node identifier, primary key.
    pub node_id: String,
    /// Registered chain tip.
    pub anchor: ChainDigest,
    /// Epoch seconds at registration.
    pub created_at: f64,
}

/// Row of the `heartbeat_state` table.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatRecord {
    /// Node identifier, primary key.
    pub node_id: String,
    /// Highest accepted beat index.
    pub last_i: u64,
    /// Epoch seconds of the last accepted beat, `0.0` before the first.
    pub last_ts: f64,
    /// Current lifecycle status.
    pub status: NodeStatus,
    /// Epoch seconds of the last row write.
    pub updated_at: f64,
}

/// Both rows known for one node, as returned by a startup scan.
#[derive(Debug, Clone)]
pub struct NodeRow {
    /// The registered anchor.
    pub anchor: AnchorRecord,
    /// Heartbeat progress, absent if never initialized.
    pub heartbeat: Option<HeartbeatRecord>,
}

/// Errors surfaced by store implementations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Filesystem interaction failure.
    #[error("store I/O error: {0}")]
    Io(String),
    /// Serialization or table decoding failure.
    #[error("store codec error: {0}")]
    Codec(String),
}

/// Capability the verifier stack persists through.
pub trait StateStore: Send + Sync {
    /// Inserts or overwrites the anchor row for `node_id`.
    fn upsert_anchor(
        &self,
        node_id: &str,
        anchor: &ChainDigest,
        created_at: f64,
    ) -> Result<(), StoreError>;

    /// Point lookup on `node_keys`.
    fn get_anchor(&self, node_id: &str) -> Result<Option<AnchorRecord>, StoreError>;

    /// Inserts or overwrites the heartbeat row for `node_id`.
    fn upsert_hb(
        &self,
        node_id: &str,
        last_i: u64,
        last_ts: f64,
        status: NodeStatus,
        updated_at: f64,
    ) -> Result<(), StoreError>;

    /// Point lookup on `heartbeat_state`.
    fn get_hb(&self, node_id: &str) -> Result<Option<HeartbeatRecord>, StoreError>;

    /// Full scan joining both tables, used once at startup to warm the
    /// cache.
    fn scan_all(&self) -> Result<Vec<NodeRow>, StoreError>;
}

// Serialized row shapes; anchors travel as hex text in the tables.

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnchorRow {
    node_id: String,
    anchor: String,
    created_at: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeartbeatRow {
    node_id: String,
    last_i: u64,
    last_ts: f64,
    status: NodeStatus,
    updated_at: f64,
}

impl AnchorRow {
    fn decode(&self) -> Result<AnchorRecord, StoreError> {
        let bytes = hex::decode(&self.anchor).map_err(|err| StoreError::Codec(err.to_string()))?;
        if bytes.len() != DIGEST_WIDTH {
            return Err(StoreError::Codec(format!(
                "anchor for {} decodes to {} bytes",
                self.node_id,
                bytes.len()
            )));
        }
        let mut anchor = [0u8; DIGEST_WIDTH];
        anchor.copy_from_slice(&bytes);
        Ok(AnchorRecord {
            node_id: self.node_id.clone(),
            anchor,
            created_at: self.created_at,
        })
    }
}

impl From<&HeartbeatRow> for HeartbeatRecord {
    fn from(row: &HeartbeatRow) -> Self {
        Self {
            node_id: row.node_id.clone(),
            last_i: row.last_i,
            last_ts: row.last_ts,
            status: row.status,
            updated_at: row.updated_at,
        }
    }
}

/// File name of the serialized `node_keys` table.
const NODE_KEYS_FILE: &str = "node_keys.json";
/// File name of the serialized `heartbeat_state` table.
const HEARTBEAT_STATE_FILE: &str = "heartbeat_state.json";

#[derive(Default)]
struct FileTables {
    node_keys: HashMap<String, AnchorRow>,
    heartbeat_state: HashMap<String, HeartbeatRow>,
}

/// Durable store keeping both tables as JSON files under one directory.
pub struct FileStore {
    dir: PathBuf,
    tables: Mutex<FileTables>,
}

impl FileStore {
    /// Opens (or initializes) a store directory, loading any existing
    /// tables.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|err| StoreError::Io(err.to_string()))?;
        let node_keys = load_table(&dir.join(NODE_KEYS_FILE))?;
        let heartbeat_state = load_table(&dir.join(HEARTBEAT_STATE_FILE))?;
        Ok(Self {
            dir,
            tables: Mutex::new(FileTables {
                node_keys,
                heartbeat_state,
            }),
        })
    }

    fn persist_node_keys(&self, tables: &FileTables) -> Result<(), StoreError> {
        persist_table(&self.dir.join(NODE_KEYS_FILE), &tables.node_keys)
    }

    fn persist_heartbeat_state(&self, tables: &FileTables) -> Result<(), StoreError> {
        persist_table(&self.dir.join(HEARTBEAT_STATE_FILE), &tables.heartbeat_state)
    }
}

fn load_table<T: for<'de> Deserialize<'de>>(
    path: &Path,
) -> Result<HashMap<String, T>, StoreError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let bytes = fs::read(path).map_err(|err| StoreError::Io(err.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|err| StoreError::Codec(err.to_string()))
}

fn persist_table<T: Serialize>(path: &Path, table: &HashMap<String, T>) -> Result<(), StoreError> {
    let data =
        serde_json::to_vec_pretty(table).map_err(|err| StoreError::Codec(err.to_string()))?;
    write_atomic(path, &data).map_err(|err| StoreError::Io(err.to_string()))
}

impl StateStore for FileStore {
    fn upsert_anchor(
        &self,
        node_id: &str,
        anchor: &ChainDigest,
        created_at: f64,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        tables.node_keys.insert(
            node_id.to_string(),
            AnchorRow {
                node_id: node_id.to_string(),
                anchor: hex::encode(anchor),
                created_at,
            },
        );
        self.persist_node_keys(&tables)
    }

    fn get_anchor(&self, node_id: &str) -> Result<Option<AnchorRecord>, StoreError> {
        let tables = self.tables.lock().expect("store lock poisoned");
        tables.node_keys.get(node_id).map(AnchorRow::decode).transpose()
    }

    fn upsert_hb(
        &self,
        node_id: &str,
        last_i: u64,
        last_ts: f64,
        status: NodeStatus,
        updated_at: f64,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        tables.heartbeat_state.insert(
            node_id.to_string(),
            HeartbeatRow {
                node_id: node_id.to_string(),
                last_i,
                last_ts,
                status,
                updated_at,
            },
        );
        self.persist_heartbeat_state(&tables)
    }

    fn get_hb(&self, node_id: &str) -> Result<Option<HeartbeatRecord>, StoreError> {
        let tables = self.tables.lock().expect("store lock poisoned");
        Ok(tables.heartbeat_state.get(node_id).map(HeartbeatRecord::from))
    }

    fn scan_all(&self) -> Result<Vec<NodeRow>, StoreError> {
        let tables = self.tables.lock().expect("store lock poisoned");
        let mut rows = Vec::with_capacity(tables.node_keys.len());
        for row in tables.node_keys.values() {
            rows.push(NodeRow {
                anchor: row.decode()?,
                heartbeat: tables
                    .heartbeat_state
                    .get(&row.node_id)
                    .map(HeartbeatRecord::from),
            });
        }
        Ok(rows)
    }
}

#[derive(Default)]
struct MemoryTables {
    node_keys: HashMap<String, AnchorRecord>,
    heartbeat_state: HashMap<String, HeartbeatRecord>,
}

/// In-memory store used by tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: when set, every upsert fails with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl StateStore for MemoryStore {
    fn upsert_anchor(
        &self,
        node_id: &str,
        anchor: &ChainDigest,
        created_at: f64,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.lock().expect("store lock poisoned");
        tables.node_keys.insert(
            node_id.to_string(),
            AnchorRecord {
                node_id: node_id.to_string(),
                anchor: *anchor,
                created_at,
            },
        );
        Ok(())
    }

    fn get_anchor(&self, node_id: &str) -> Result<Option<AnchorRecord>, StoreError> {
        let tables = self.tables.lock().expect("store lock poisoned");
        Ok(tables.node_keys.get(node_id).cloned())
    }

    fn upsert_hb(
        &self,
        node_id: &str,
        last_i: u64,
        last_ts: f64,
        status: NodeStatus,
        updated_at: f64,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.lock().expect("store lock poisoned");
        tables.heartbeat_state.insert(
            node_id.to_string(),
            HeartbeatRecord {
                node_id: node_id.to_string(),
                last_i,
                last_ts,
                status,
                updated_at,
            },
        );
        Ok(())
    }

    fn get_hb(&self, node_id: &str) -> Result<Option<HeartbeatRecord>, StoreError> {
        let tables = self.tables.lock().expect("store lock poisoned");
        Ok(tables.heartbeat_state.get(node_id).cloned())
    }

    fn scan_all(&self) -> Result<Vec<NodeRow>, StoreError> {
        let tables = self.tables.lock().expect("store lock poisoned");
        Ok(tables
            .node_keys
            .values()
            .map(|anchor| NodeRow {
                anchor: anchor.clone(),
                heartbeat: tables.heartbeat_state.get(&anchor.node_id).cloned(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("swarm_pulse_{tag}_{nanos}"))
    }

    #[test]
    fn file_store_round_trips_and_survives_reopen() {
        let dir = temp_dir("store");
        let anchor = [9u8; DIGEST_WIDTH];
        {
            let store = FileStore::open(&dir).unwrap();
            store.upsert_anchor("SN000001", &anchor, 100.0).unwrap();
            store
                .upsert_hb("SN000001", 3, 105.0, NodeStatus::Alive, 105.0)
                .unwrap();
        }
        let store = FileStore::open(&dir).unwrap();
        let key = store.get_anchor("SN000001").unwrap().unwrap();
        assert_eq!(key.anchor, anchor);
        let hb = store.get_hb("SN000001").unwrap().unwrap();
        assert_eq!(hb.last_i, 3);
        assert_eq!(hb.status, NodeStatus::Alive);

        let rows = store.scan_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].heartbeat.as_ref().unwrap().last_i, 3);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn reregistration_overwrites_anchor() {
        let store = MemoryStore::new();
        store.upsert_anchor("SN1", &[1u8; DIGEST_WIDTH], 1.0).unwrap();
        store.upsert_anchor("SN1", &[2u8; DIGEST_WIDTH], 2.0).unwrap();
        let rec = store.get_anchor("SN1").unwrap().unwrap();
        assert_eq!(rec.anchor, [2u8; DIGEST_WIDTH]);
        assert_eq!(rec.created_at, 2.0);
    }

    #[test]
    fn missing_rows_read_as_none() {
        let store = MemoryStore::new();
        assert!(store.get_anchor("ghost").unwrap().is_none());
        assert!(store.get_hb("ghost").unwrap().is_none());
        assert!(store.scan_all().unwrap().is_empty());
    }

    #[test]
    fn injected_write_failure_surfaces() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store
            .upsert_hb("SN1", 1, 1.0, NodeStatus::Alive, 1.0)
            .is_err());
        store.set_fail_writes(false);
        assert!(store
            .upsert_hb("SN1", 1, 1.0, NodeStatus::Alive, 1.0)
            .is_ok());
    }

    #[test]
    fn status_text_matches_table_contract() {
        assert_eq!(NodeStatus::Registered.as_str(), "REGISTERED");
        assert_eq!(
            serde_json::to_string(&NodeStatus::Dead).unwrap(),
            "\"DEAD\""
        );
        let parsed: NodeStatus = serde_json::from_str("\"ALIVE\"").unwrap();
        assert_eq!(parsed, NodeStatus::Alive);
    }
}
