//! Raft log storage.
//!
//! [`RaftStorage`] is what `RawNode` reads from. Entries, hard state and conf
//! state live in tikv/raft's `MemStorage`; this wrapper adds two things it
//! lacks:
//!
//! - a snapshot that carries real state machine contents (MemStorage only
//!   hands out empty ones), so a new or lagging peer can be caught up
//! - an optional [`Journal`] that mirrors every mutation to disk

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::{GetEntriesContext, MemStorage};
use raft::{RaftState, Storage, StorageError};

use super::journal::Journal;

/// Clonable handle; every clone shares the same log.
#[derive(Clone)]
pub struct RaftStorage {
    mem: MemStorage,
    inner: Arc<Mutex<StorageInner>>,
}

struct StorageInner {
    /// Most recent snapshot, served to peers that fell behind the log start.
    latest: Snapshot,
    journal: Option<Journal>,
}

impl RaftStorage {
    pub fn in_memory() -> Self {
        Self {
            mem: MemStorage::new(),
            inner: Arc::new(Mutex::new(StorageInner {
                latest: Snapshot::default(),
                journal: None,
            })),
        }
    }

    /// Opens the journal under `dir` and rebuilds the log from it.
    pub fn open_durable(dir: &Path) -> io::Result<Self> {
        let mem = MemStorage::new();
        let (journal, latest) = Journal::open(dir, &mem)?;
        Ok(Self {
            mem,
            inner: Arc::new(Mutex::new(StorageInner {
                latest,
                journal: Some(journal),
            })),
        })
    }

    fn inner(&self) -> MutexGuard<'_, StorageInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True once this node has any Raft state: a bootstrap snapshot, a
    /// snapshot received from a leader, log entries or a persisted term.
    pub fn is_initialized(&self) -> raft::Result<bool> {
        let state = self.mem.initial_state()?;
        Ok(!state.conf_state.voters.is_empty()
            || state.hard_state.term > 0
            || self.mem.last_index()? > 0)
    }

    /// Installs the first snapshot of a brand-new cluster.
    pub fn bootstrap(&self, snapshot: Snapshot) -> Result<(), super::EngineError> {
        self.apply_snapshot(snapshot)?;
        self.sync()?;
        Ok(())
    }

    pub fn append(&self, entries: &[Entry]) -> Result<(), super::EngineError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.mem.wl().append(entries)?;
        if let Some(journal) = self.inner().journal.as_mut() {
            journal.append_entries(entries)?;
        }
        Ok(())
    }

    pub fn set_hard_state(&self, hard_state: &HardState) -> io::Result<()> {
        self.mem.wl().set_hardstate(hard_state.clone());
        if let Some(journal) = self.inner().journal.as_mut() {
            journal.write_hard_state(hard_state)?;
        }
        Ok(())
    }

    pub fn set_commit(&self, commit: u64) -> io::Result<()> {
        let hard_state = {
            let mut core = self.mem.wl();
            core.mut_hard_state().set_commit(commit);
            core.hard_state().clone()
        };
        if let Some(journal) = self.inner().journal.as_mut() {
            journal.write_hard_state(&hard_state)?;
        }
        Ok(())
    }

    pub fn set_conf_state(&self, conf_state: &ConfState) -> io::Result<()> {
        self.mem.wl().set_conf_state(conf_state.clone());
        if let Some(journal) = self.inner().journal.as_mut() {
            journal.write_conf_state(conf_state)?;
        }
        Ok(())
    }

    /// Replaces the log with `snapshot`, as when a leader sends one.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Result<(), super::EngineError> {
        self.mem.wl().apply_snapshot(snapshot.clone())?;
        let mut inner = self.inner();
        if let Some(journal) = inner.journal.as_mut() {
            journal.write_snapshot(&snapshot)?;
        }
        inner.latest = snapshot;
        Ok(())
    }

    /// Makes `snapshot` the one served to peers without touching the log.
    pub fn set_latest_snapshot(&self, snapshot: Snapshot) {
        self.inner().latest = snapshot;
    }

    /// Makes `snapshot` the served snapshot and discards log entries before its
    /// index. The journal is rewritten to match.
    pub fn compact(&self, snapshot: Snapshot) -> Result<(), super::EngineError> {
        let index = snapshot.get_metadata().index;
        self.mem.wl().compact(index)?;

        let mut inner = self.inner();
        if let Some(journal) = inner.journal.as_mut() {
            let state = self.mem.initial_state()?;
            let last = self.mem.last_index()?;
            let tail = if last > index {
                self.mem
                    .entries(index + 1, last + 1, None, GetEntriesContext::empty(false))?
            } else {
                Vec::new()
            };
            journal.rewrite(&snapshot, &state.hard_state, &state.conf_state, &tail)?;
        }
        inner.latest = snapshot;
        Ok(())
    }

    /// Flushes the journal to disk. A no-op for in-memory storage.
    pub fn sync(&self) -> io::Result<()> {
        match self.inner().journal.as_mut() {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    pub fn latest_snapshot(&self) -> Snapshot {
        self.inner().latest.clone()
    }

    pub fn conf_state(&self) -> raft::Result<ConfState> {
        Ok(self.mem.initial_state()?.conf_state)
    }
}

impl Storage for RaftStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let latest = self.inner().latest.clone();
        if latest.get_metadata().index < request_index || latest.get_metadata().index == 0 {
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_at(index: u64, term: u64, voters: Vec<u64>, data: &[u8]) -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.data = data.to_vec().into();
        let meta = snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        meta.set_conf_state(ConfState::from((voters, vec![])));
        snapshot
    }

    fn entry(index: u64, term: u64) -> Entry {
        let mut entry = Entry::default();
        entry.index = index;
        entry.term = term;
        entry
    }

    #[test]
    fn fresh_storage_is_uninitialized() {
        let storage = RaftStorage::in_memory();
        assert!(!storage.is_initialized().unwrap());
        assert!(matches!(
            storage.snapshot(0, 2),
            Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable))
        ));
    }

    #[test]
    fn bootstrap_serves_snapshot_with_voters() {
        let storage = RaftStorage::in_memory();
        storage
            .bootstrap(snapshot_at(1, 1, vec![9], b"fsm"))
            .unwrap();
        assert!(storage.is_initialized().unwrap());

        let served = storage.snapshot(0, 2).unwrap();
        assert_eq!(served.get_metadata().index, 1);
        assert_eq!(served.get_metadata().get_conf_state().voters, vec![9]);
        assert_eq!(&served.data[..], b"fsm");
    }

    #[test]
    fn stale_snapshot_is_temporarily_unavailable() {
        let storage = RaftStorage::in_memory();
        storage.bootstrap(snapshot_at(1, 1, vec![9], b"")).unwrap();
        assert!(matches!(
            storage.snapshot(5, 2),
            Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable))
        ));
    }

    #[test]
    fn compact_drops_prefix_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = RaftStorage::open_durable(dir.path()).unwrap();
            storage.bootstrap(snapshot_at(1, 1, vec![9], b"")).unwrap();
            storage
                .append(&[entry(2, 1), entry(3, 1), entry(4, 1), entry(5, 1)])
                .unwrap();
            storage.set_commit(5).unwrap();
            storage.compact(snapshot_at(4, 1, vec![9], b"at-4")).unwrap();
            assert_eq!(storage.first_index().unwrap(), 4);
            storage.sync().unwrap();
        }

        let reopened = RaftStorage::open_durable(dir.path()).unwrap();
        assert!(reopened.is_initialized().unwrap());
        assert_eq!(reopened.last_index().unwrap(), 5);
        assert_eq!(reopened.term(4).unwrap(), 1);
        assert_eq!(&reopened.latest_snapshot().data[..], b"at-4");
        assert_eq!(reopened.initial_state().unwrap().hard_state.commit, 5);
    }

    #[test]
    fn corrupt_journal_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = RaftStorage::open_durable(dir.path()).unwrap();
            storage.bootstrap(snapshot_at(1, 1, vec![9], b"fsm")).unwrap();
            storage.append(&[entry(2, 1), entry(3, 1)]).unwrap();
            storage.sync().unwrap();
        }
        let path = dir.path().join("raft.journal");
        let mut bytes = std::fs::read(&path).unwrap();
        let at = bytes.windows(3).position(|window| window == b"fsm").unwrap();
        bytes[at] = b'F';
        std::fs::write(&path, &bytes).unwrap();

        let err = RaftStorage::open_durable(dir.path()).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
