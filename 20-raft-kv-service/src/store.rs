//! Store orchestration: the only way into the replicated key-value state.
//!
//! The store owns the state machine and the consensus engine handle. Reads go
//! straight to the local state machine; every mutation becomes a [`Command`]
//! that is replicated first and applied by the engine, never written locally.
//!
//! Lifecycle: `Uninitialized → Opening → Ready → Closed`. Only `Ready` serves
//! requests, and a failed open goes straight to `Closed`.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::command::Command;
use crate::engine::{ConsensusEngine, EngineConfig, EngineError, EngineStatus, Member, RaftEngine};
use crate::fsm::KvStateMachine;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the Raft journal. Created on open.
    pub raft_dir: PathBuf,
    /// Address the Raft transport binds and advertises.
    pub raft_addr: String,
    pub in_memory: bool,
    /// How long `set`/`delete`/`join` wait for the engine to confirm.
    pub apply_timeout: Duration,
    pub snapshot_threshold: u64,
}

impl StoreConfig {
    pub fn new(raft_dir: impl Into<PathBuf>, raft_addr: impl Into<String>) -> Self {
        Self {
            raft_dir: raft_dir.into(),
            raft_addr: raft_addr.into(),
            in_memory: false,
            apply_timeout: Duration::from_secs(10),
            snapshot_threshold: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Uninitialized,
    Opening,
    Ready,
    Closed,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreState::Uninitialized => "uninitialized",
            StoreState::Opening => "opening",
            StoreState::Ready => "ready",
            StoreState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage fault: {0}")]
    StorageFault(String),
    #[error("not the leader (leader: {})", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("replication not confirmed within {0:?}")]
    ReplicationTimeout(Duration),
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("store not ready: {0}")]
    NotReady(String),
    #[error("node halted: {0}")]
    Halted(String),
}

pub struct Store {
    config: StoreConfig,
    fsm: Arc<KvStateMachine>,
    state: RwLock<StoreState>,
    engine: RwLock<Option<Arc<dyn ConsensusEngine>>>,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            fsm: Arc::new(KvStateMachine::new()),
            state: RwLock::new(StoreState::Uninitialized),
            engine: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The state machine the engine applies into. Exposed so alternative
    /// engines can be wired to the same state.
    pub fn fsm(&self) -> Arc<KvStateMachine> {
        self.fsm.clone()
    }

    pub fn state(&self) -> StoreState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: StoreState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn begin_open(&self) -> Result<(), StoreError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != StoreState::Uninitialized {
            return Err(StoreError::NotReady(format!("cannot open a store that is {state}")));
        }
        *state = StoreState::Opening;
        Ok(())
    }

    /// Prepares the storage directory and starts the Raft engine.
    ///
    /// With `bootstrap` the node forms a single-member cluster unless its
    /// journal already holds Raft state; without it the node waits to be
    /// added by an existing leader.
    pub async fn open(&self, bootstrap: bool, node_id: &str) -> Result<(), StoreError> {
        self.begin_open()?;

        if let Err(err) = std::fs::create_dir_all(&self.config.raft_dir) {
            self.set_state(StoreState::Closed);
            return Err(StoreError::StorageFault(format!(
                "cannot create {}: {err}",
                self.config.raft_dir.display()
            )));
        }

        let config = EngineConfig {
            local: Member::new(node_id, self.config.raft_addr.clone()),
            dir: self.config.raft_dir.clone(),
            in_memory: self.config.in_memory,
            bootstrap,
            snapshot_threshold: self.config.snapshot_threshold,
        };
        match RaftEngine::start(config, self.fsm.clone()).await {
            Ok(engine) => {
                self.install(Arc::new(engine));
                info!(node = node_id, bootstrap, in_memory = self.config.in_memory, "store opened");
                Ok(())
            }
            Err(err) => {
                self.set_state(StoreState::Closed);
                Err(StoreError::StorageFault(err.to_string()))
            }
        }
    }

    /// Opens the store on an already running engine that applies into
    /// [`Store::fsm`].
    pub fn open_with_engine(&self, engine: Arc<dyn ConsensusEngine>) -> Result<(), StoreError> {
        self.begin_open()?;
        self.install(engine);
        Ok(())
    }

    fn install(&self, engine: Arc<dyn ConsensusEngine>) {
        *self.engine.write().unwrap_or_else(PoisonError::into_inner) = Some(engine);
        self.set_state(StoreState::Ready);
    }

    fn engine(&self) -> Result<Arc<dyn ConsensusEngine>, StoreError> {
        let state = self.state();
        if state != StoreState::Ready {
            return Err(StoreError::NotReady(format!("store is {state}")));
        }
        let engine = self
            .engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| StoreError::NotReady("no consensus engine".to_string()))?;
        if let Some(reason) = engine.status().halted {
            return Err(StoreError::Halted(reason));
        }
        Ok(engine)
    }

    /// Local, possibly stale read.
    pub fn get(&self, key: &str) -> Result<String, StoreError> {
        self.engine()?;
        self.fsm
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.submit(Command::set(key, value)).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.submit(Command::delete(key)).await
    }

    async fn submit(&self, command: Command) -> Result<(), StoreError> {
        let engine = self.engine()?;
        let bytes = command
            .encode()
            .map_err(|err| StoreError::MalformedInput(err.to_string()))?;
        self.confirm(engine.as_ref(), engine.apply(bytes)).await
    }

    /// Waits for an engine call under the apply timeout and translates its error.
    async fn confirm(
        &self,
        engine: &dyn ConsensusEngine,
        call: impl std::future::Future<Output = Result<(), EngineError>>,
    ) -> Result<(), StoreError> {
        match timeout(self.config.apply_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(translate(engine, err)),
            Err(_) => Err(StoreError::ReplicationTimeout(self.config.apply_timeout)),
        }
    }

    /// Adds `node_id` at `raft_addr` as a voter. Leader only.
    ///
    /// Re-joining with the same ID and address is a no-op. If either the ID or
    /// the address is already taken by a different member, that stale member is
    /// removed first.
    pub async fn join(&self, node_id: &str, raft_addr: &str) -> Result<(), StoreError> {
        let engine = self.engine()?;
        if !engine.is_leader() {
            return Err(StoreError::NotLeader {
                leader: engine.leader_addr(),
            });
        }

        let members = engine.members();
        if members
            .iter()
            .any(|m| m.node_id == node_id && m.raft_addr == raft_addr)
        {
            info!(node = node_id, addr = raft_addr, "already a member, ignoring join");
            return Ok(());
        }

        for stale in members
            .iter()
            .filter(|m| m.node_id == node_id || m.raft_addr == raft_addr)
        {
            if stale == engine.local() {
                return Err(StoreError::MalformedInput(format!(
                    "{} at {} is this node",
                    stale.node_id, stale.raft_addr
                )));
            }
            warn!(node = %stale.node_id, addr = %stale.raft_addr, "removing stale member before join");
            self.confirm(engine.as_ref(), engine.remove_server(&stale.node_id))
                .await?;
        }

        self.confirm(
            engine.as_ref(),
            engine.add_voter(Member::new(node_id, raft_addr)),
        )
        .await?;
        info!(node = node_id, addr = raft_addr, "node joined");
        Ok(())
    }

    /// Raft address of the current leader, `None` while unknown.
    pub fn leader(&self) -> Option<String> {
        self.engine().ok().and_then(|engine| engine.leader_addr())
    }

    pub fn is_leader(&self) -> bool {
        self.engine().map(|engine| engine.is_leader()).unwrap_or(false)
    }

    pub fn members(&self) -> Vec<Member> {
        self.engine()
            .map(|engine| engine.members())
            .unwrap_or_default()
    }

    pub fn status(&self) -> Option<EngineStatus> {
        self.engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|engine| engine.status())
    }

    /// Resolves with the reason once the engine halts on divergence. Returns
    /// `None` when the engine stops normally or was never started.
    pub async fn halted(&self) -> Option<String> {
        let engine = self
            .engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match engine {
            Some(engine) => engine.halted().await,
            None => None,
        }
    }

    /// Stops the engine and flushes its journal.
    pub async fn close(&self) {
        self.set_state(StoreState::Closed);
        let engine = self
            .engine
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(engine) = engine {
            engine.shutdown().await;
            info!(node = %engine.local().node_id, "store closed");
        }
    }
}

fn translate(engine: &dyn ConsensusEngine, err: EngineError) -> StoreError {
    match err {
        EngineError::NotLeader { leader } => StoreError::NotLeader { leader },
        EngineError::LeadershipLost => StoreError::NotLeader {
            leader: engine.leader_addr(),
        },
        EngineError::Raft(raft::Error::ProposalDropped) => StoreError::NotLeader {
            leader: engine.leader_addr(),
        },
        EngineError::MembershipChangePending => {
            StoreError::NotReady("a membership change is in progress".to_string())
        }
        EngineError::UnknownMember(id) => StoreError::MalformedInput(format!("unknown member {id}")),
        EngineError::Stopped => match engine.status().halted {
            Some(reason) => StoreError::Halted(reason),
            None => StoreError::NotReady("consensus engine stopped".to_string()),
        },
        EngineError::Storage(err) => StoreError::StorageFault(err.to_string()),
        EngineError::Bind { .. } => StoreError::StorageFault(err.to_string()),
        err @ (EngineError::Raft(_) | EngineError::MalformedEntry { .. } | EngineError::Diverged(_)) => {
            StoreError::Halted(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopbackEngine;

    fn ready_store(leader: bool) -> (Store, Arc<LoopbackEngine>) {
        let store = Store::new(StoreConfig::new("unused", "127.0.0.1:12000"));
        let engine = Arc::new(LoopbackEngine::new(
            Member::new("local", "127.0.0.1:12000"),
            store.fsm(),
        ));
        if leader {
            engine.become_leader();
        } else {
            engine.follow(Some("127.0.0.1:12999"));
        }
        store.open_with_engine(engine.clone()).unwrap();
        (store, engine)
    }

    #[tokio::test]
    async fn requests_before_open_are_not_ready() {
        let store = Store::new(StoreConfig::new("unused", "127.0.0.1:12000"));
        assert_eq!(store.state(), StoreState::Uninitialized);
        assert!(matches!(store.get("a"), Err(StoreError::NotReady(_))));
        assert!(matches!(store.set("a", "1").await, Err(StoreError::NotReady(_))));
        assert_eq!(store.leader(), None);
    }

    #[tokio::test]
    async fn read_after_write_on_leader() {
        let (store, _engine) = ready_store(true);
        store.set("a", "1").await.unwrap();
        assert_eq!(store.get("a").unwrap(), "1");
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let (store, _engine) = ready_store(true);
        store.set("a", "1").await.unwrap();
        store.delete("a").await.unwrap();
        assert!(matches!(store.get("a"), Err(StoreError::NotFound(k)) if k == "a"));
    }

    #[tokio::test]
    async fn follower_write_reports_leader_and_leaves_state_alone() {
        let (store, _engine) = ready_store(false);
        let err = store.set("a", "1").await.unwrap_err();
        assert!(matches!(err, StoreError::NotLeader { leader: Some(ref l) } if l == "127.0.0.1:12999"));
        assert!(store.fsm().is_empty());
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let (store, engine) = ready_store(true);
        store.join("b", "127.0.0.1:12001").await.unwrap();
        store.join("b", "127.0.0.1:12001").await.unwrap();
        assert_eq!(engine.voter_additions(), 1);
        assert_eq!(
            store.members(),
            vec![
                Member::new("b", "127.0.0.1:12001"),
                Member::new("local", "127.0.0.1:12000"),
            ]
        );
    }

    #[tokio::test]
    async fn join_with_new_address_replaces_member() {
        let (store, engine) = ready_store(true);
        store.join("b", "127.0.0.1:12001").await.unwrap();
        store.join("b", "127.0.0.1:12002").await.unwrap();
        assert_eq!(engine.removals(), vec!["b".to_string()]);
        assert!(store.members().contains(&Member::new("b", "127.0.0.1:12002")));
        assert!(!store.members().contains(&Member::new("b", "127.0.0.1:12001")));
    }

    #[tokio::test]
    async fn join_claiming_local_address_is_rejected() {
        let (store, _engine) = ready_store(true);
        let err = store.join("impostor", "127.0.0.1:12000").await.unwrap_err();
        assert!(matches!(err, StoreError::MalformedInput(_)));
    }

    #[tokio::test]
    async fn join_on_follower_is_not_leader() {
        let (store, engine) = ready_store(false);
        let err = store.join("b", "127.0.0.1:12001").await.unwrap_err();
        assert!(matches!(err, StoreError::NotLeader { .. }));
        assert_eq!(engine.voter_additions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_commit_times_out() {
        let (store, engine) = ready_store(true);
        engine.stall_applies();
        let err = store.set("a", "1").await.unwrap_err();
        assert!(matches!(err, StoreError::ReplicationTimeout(d) if d == Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn halted_engine_refuses_requests() {
        let (store, engine) = ready_store(true);
        engine.halt("state machine diverged");
        assert!(matches!(store.get("a"), Err(StoreError::Halted(_))));
        assert_eq!(store.halted().await.as_deref(), Some("state machine diverged"));
    }

    #[tokio::test]
    async fn uncreatable_directory_is_storage_fault() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = Store::new(StoreConfig::new(file.path().join("raft"), "127.0.0.1:0"));
        let err = store.open(true, "a").await.unwrap_err();
        assert!(matches!(err, StoreError::StorageFault(_)));
        assert_eq!(store.state(), StoreState::Closed);
    }

    #[tokio::test]
    async fn open_bootstraps_real_engine() {
        let dir = tempfile::tempdir().unwrap();
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap().to_string();
        drop(probe);

        let mut config = StoreConfig::new(dir.path(), addr.clone());
        config.in_memory = true;
        let store = Store::new(config);
        store.open(true, "a").await.unwrap();
        assert_eq!(store.state(), StoreState::Ready);

        for _ in 0..100 {
            if store.is_leader() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(store.leader(), Some(addr));
        store.set("x", "1").await.unwrap();
        assert_eq!(store.get("x").unwrap(), "1");

        assert!(matches!(store.open(true, "a").await, Err(StoreError::NotReady(_))));
        store.close().await;
        assert_eq!(store.state(), StoreState::Closed);
    }
}
