//! Consensus engine capability and its tikv/raft implementation.
//!
//! The rest of the crate only talks to [`ConsensusEngine`]: submit a command,
//! change membership, ask who leads. Everything Raft-specific lives below this
//! module:
//!
//! - [`node`]: synchronous Raft core wrapping `raft::RawNode`
//! - [`storage`]: `raft::Storage` that serves snapshots carrying FSM state
//! - [`journal`]: durable write-ahead journal for the Raft log
//! - [`transport`]: length-prefixed TCP transport between peers
//! - [`runtime`]: async worker that drives the core and answers requests

use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsm::FsmError;

pub mod journal;
pub mod node;
pub mod runtime;
pub mod storage;
pub mod transport;

pub use runtime::{EngineConfig, RaftEngine};

/// A voting member: caller-assigned node ID plus the address its Raft transport listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Member {
    pub node_id: String,
    pub raft_addr: String,
}

impl Member {
    pub fn new(node_id: impl Into<String>, raft_addr: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            raft_addr: raft_addr.into(),
        }
    }

    pub fn raft_id(&self) -> u64 {
        raft_id(&self.node_id)
    }
}

/// Maps a node ID onto the numeric ID tikv/raft works with.
///
/// Every replica must derive the same number for the same name, so this uses a
/// content hash rather than `std`'s randomly seeded hasher. Zero is reserved by
/// raft for "no node".
pub fn raft_id(node_id: &str) -> u64 {
    let hash = blake3::hash(node_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    match u64::from_be_bytes(prefix) {
        0 => 1,
        id => id,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

impl From<raft::StateRole> for Role {
    fn from(role: raft::StateRole) -> Self {
        match role {
            raft::StateRole::Follower => Role::Follower,
            raft::StateRole::PreCandidate => Role::PreCandidate,
            raft::StateRole::Candidate => Role::Candidate,
            raft::StateRole::Leader => Role::Leader,
        }
    }
}

/// Point-in-time view of the engine, published after every worker iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub node_id: String,
    pub role: Role,
    pub term: u64,
    /// Raft address of the current leader, `None` while an election is running.
    pub leader_addr: Option<String>,
    pub members: Vec<Member>,
    pub applied: u64,
    /// Set once the state machine diverged and the engine stopped applying.
    pub halted: Option<String>,
}

impl EngineStatus {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            role: Role::Follower,
            term: 0,
            leader_addr: None,
            members: Vec::new(),
            applied: 0,
            halted: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not the leader (leader: {})", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },
    #[error("leadership changed before the proposal was confirmed")]
    LeadershipLost,
    #[error("consensus engine stopped")]
    Stopped,
    #[error("unknown member {0}")]
    UnknownMember(String),
    #[error("another membership change is still being applied")]
    MembershipChangePending,
    #[error("raft: {0}")]
    Raft(#[from] raft::Error),
    #[error("raft storage: {0}")]
    Storage(#[from] io::Error),
    #[error("failed to bind raft transport on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed log entry at index {index}: {reason}")]
    MalformedEntry { index: u64, reason: String },
    #[error("state machine diverged: {0}")]
    Diverged(#[from] FsmError),
}

/// Capability the store consumes. Implementations own leader election, the
/// replicated log and snapshot storage.
#[async_trait]
pub trait ConsensusEngine: Send + Sync {
    fn local(&self) -> &Member;

    fn status(&self) -> EngineStatus;

    fn is_leader(&self) -> bool {
        self.status().role == Role::Leader
    }

    fn leader_addr(&self) -> Option<String> {
        self.status().leader_addr
    }

    fn members(&self) -> Vec<Member> {
        self.status().members
    }

    /// Replicates `command` and resolves once it has been applied locally.
    async fn apply(&self, command: Vec<u8>) -> Result<(), EngineError>;

    /// Adds `member` as a voter. Resolves once the change is applied.
    async fn add_voter(&self, member: Member) -> Result<(), EngineError>;

    async fn remove_server(&self, node_id: &str) -> Result<(), EngineError>;

    /// Resolves with the reason when the engine halts on divergence, or `None`
    /// when it stops normally.
    async fn halted(&self) -> Option<String>;

    /// Stops background tasks and flushes durable state.
    async fn shutdown(&self);
}
