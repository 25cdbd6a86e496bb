//! Replicated key-value state machine.
//!
//! Committed commands from the Raft log are applied here, in commit order, on
//! every node. Nothing else mutates the map, so replicas that applied the same
//! log prefix hold identical state.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use thiserror::Error;

use crate::command::{Command, Op};

/// Leading bytes of every snapshot produced by [`KvStateMachine`].
const SNAPSHOT_MAGIC: [u8; 4] = *b"KVSN";
/// Current snapshot layout: magic, big-endian u16 version, bincode map.
const SNAPSHOT_VERSION: u16 = 1;
const SNAPSHOT_HEADER_LEN: usize = SNAPSHOT_MAGIC.len() + 2;

#[derive(Debug, Error)]
pub enum FsmError {
    #[error("malformed command: {0}")]
    MalformedCommand(#[source] bincode::Error),
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
    #[error("unsupported snapshot version {0}")]
    UnsupportedSnapshotVersion(u16),
}

/// What the consensus engine needs from the application it replicates.
///
/// The engine calls `apply` sequentially in commit order. An error from any
/// method means this replica can no longer be trusted to match its peers.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, command: &[u8]) -> Result<(), FsmError>;

    /// Returns a self-contained copy of the state as of the call.
    fn snapshot(&self) -> Result<Vec<u8>, FsmError>;

    /// Replaces the whole state with the snapshot contents.
    fn restore(&self, snapshot: &[u8]) -> Result<(), FsmError>;
}

/// Key-value map guarded by a reader-writer lock.
///
/// Reads run concurrently with each other and never observe a half-applied
/// command, because every mutation happens under the write guard.
#[derive(Debug, Default)]
pub struct KvStateMachine {
    data: RwLock<HashMap<String, String>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local read; reflects whatever this replica has applied so far.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ordered copy of the map, used for status output and comparisons.
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn apply_command(&self, command: Command) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        match command.op {
            Op::Set => {
                data.insert(command.key, command.value);
            }
            Op::Delete => {
                data.remove(&command.key);
            }
        }
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&self, command: &[u8]) -> Result<(), FsmError> {
        let command = Command::decode(command)?;
        self.apply_command(command);
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, FsmError> {
        // Copy under the read guard, serialize after releasing it.
        let copy = self.entries();
        encode_snapshot(&copy)
    }

    fn restore(&self, snapshot: &[u8]) -> Result<(), FsmError> {
        let restored = decode_snapshot(snapshot)?;
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        *data = restored.into_iter().collect();
        Ok(())
    }
}

fn encode_snapshot(entries: &BTreeMap<String, String>) -> Result<Vec<u8>, FsmError> {
    let body =
        bincode::serialize(entries).map_err(|err| FsmError::MalformedSnapshot(err.to_string()))?;
    let mut out = Vec::with_capacity(SNAPSHOT_HEADER_LEN + body.len());
    out.extend_from_slice(&SNAPSHOT_MAGIC);
    out.extend_from_slice(&SNAPSHOT_VERSION.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode_snapshot(bytes: &[u8]) -> Result<BTreeMap<String, String>, FsmError> {
    if bytes.len() < SNAPSHOT_HEADER_LEN {
        return Err(FsmError::MalformedSnapshot(format!(
            "snapshot is {} bytes, shorter than its header",
            bytes.len()
        )));
    }
    let (header, body) = bytes.split_at(SNAPSHOT_HEADER_LEN);
    if header[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
        return Err(FsmError::MalformedSnapshot("bad magic".to_string()));
    }
    let version = u16::from_be_bytes([header[4], header[5]]);
    if version != SNAPSHOT_VERSION {
        return Err(FsmError::UnsupportedSnapshotVersion(version));
    }
    bincode::deserialize(body).map_err(|err| FsmError::MalformedSnapshot(err.to_string()))
}
