//! Single-process stand-in for the consensus engine, used by unit tests.
//!
//! Commands are applied to the state machine immediately when this node is
//! marked leader. Leadership, halting and stalls are flipped by the test.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::engine::{ConsensusEngine, EngineError, EngineStatus, Member, Role};
use crate::fsm::StateMachine;

pub struct LoopbackEngine {
    local: Member,
    fsm: Arc<dyn StateMachine>,
    state: Mutex<LoopbackState>,
    halt_tx: watch::Sender<Option<String>>,
}

#[derive(Default)]
struct LoopbackState {
    leader: bool,
    leader_addr: Option<String>,
    members: Vec<Member>,
    voter_additions: usize,
    removals: Vec<String>,
    stalled: bool,
    /// Number of upcoming `add_voter` calls that fail with `NotLeader`.
    failing_joins: usize,
}

impl LoopbackEngine {
    pub fn new(local: Member, fsm: Arc<dyn StateMachine>) -> Self {
        let (halt_tx, _) = watch::channel(None);
        Self {
            state: Mutex::new(LoopbackState {
                members: vec![local.clone()],
                ..Default::default()
            }),
            local,
            fsm,
            halt_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn become_leader(&self) {
        let mut state = self.lock();
        state.leader = true;
        state.leader_addr = Some(self.local.raft_addr.clone());
    }

    pub fn follow(&self, leader_addr: Option<&str>) {
        let mut state = self.lock();
        state.leader = false;
        state.leader_addr = leader_addr.map(str::to_string);
    }

    pub fn stall_applies(&self) {
        self.lock().stalled = true;
    }

    pub fn fail_next_joins(&self, count: usize) {
        self.lock().failing_joins = count;
    }

    pub fn halt(&self, reason: &str) {
        self.halt_tx.send_replace(Some(reason.to_string()));
    }

    pub fn voter_additions(&self) -> usize {
        self.lock().voter_additions
    }

    pub fn removals(&self) -> Vec<String> {
        self.lock().removals.clone()
    }

    fn not_leader(&self) -> EngineError {
        EngineError::NotLeader {
            leader: self.lock().leader_addr.clone(),
        }
    }
}

#[async_trait]
impl ConsensusEngine for LoopbackEngine {
    fn local(&self) -> &Member {
        &self.local
    }

    fn status(&self) -> EngineStatus {
        let state = self.lock();
        let mut members = state.members.clone();
        members.sort();
        EngineStatus {
            node_id: self.local.node_id.clone(),
            role: if state.leader { Role::Leader } else { Role::Follower },
            term: 1,
            leader_addr: state.leader_addr.clone(),
            members,
            applied: 0,
            halted: self.halt_tx.borrow().clone(),
        }
    }

    async fn apply(&self, command: Vec<u8>) -> Result<(), EngineError> {
        let (leader, stalled) = {
            let state = self.lock();
            (state.leader, state.stalled)
        };
        if !leader {
            return Err(self.not_leader());
        }
        if stalled {
            std::future::pending::<()>().await;
        }
        self.fsm.apply(&command)?;
        Ok(())
    }

    async fn add_voter(&self, member: Member) -> Result<(), EngineError> {
        let mut state = self.lock();
        if !state.leader {
            return Err(EngineError::NotLeader {
                leader: state.leader_addr.clone(),
            });
        }
        if state.failing_joins > 0 {
            state.failing_joins -= 1;
            return Err(EngineError::NotLeader { leader: None });
        }
        state.voter_additions += 1;
        state.members.push(member);
        Ok(())
    }

    async fn remove_server(&self, node_id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        let before = state.members.len();
        state.members.retain(|m| m.node_id != node_id);
        if state.members.len() == before {
            return Err(EngineError::UnknownMember(node_id.to_string()));
        }
        state.removals.push(node_id.to_string());
        Ok(())
    }

    async fn halted(&self) -> Option<String> {
        let mut rx = self.halt_tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return Some(reason);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn shutdown(&self) {
        self.follow(None);
    }
}
