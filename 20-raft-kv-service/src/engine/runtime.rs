//! Async worker that owns the [`RaftNode`] and the public [`RaftEngine`] handle.
//!
//! The worker is the only task that touches Raft state. It waits on three
//! sources at once and handles whichever fires first:
//!
//! 1. **Requests** (propose, membership changes) from [`RaftEngine`]
//! 2. **Peer messages** from the transport
//! 3. **Ticks** every 100ms to drive election and heartbeat timeouts
//!
//! After each event it drains every ready round, ships outbound messages,
//! resolves waiting proposers, and publishes a fresh [`EngineStatus`] on a
//! watch channel that the handle reads without a round trip.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use raft::StateRole;
use raft::prelude::Message;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::node::{MembershipChange, NodeOptions, ProposalId, RaftNode};
use super::storage::RaftStorage;
use super::transport::{Inbound, Transport};
use super::{ConsensusEngine, EngineError, EngineStatus, Member};
use crate::fsm::StateMachine;

/// Raft logical clock interval: heartbeat every 3 ticks, election after 10.
const TICK_INTERVAL: Duration = Duration::from_millis(100);
const REQUEST_QUEUE_CAPACITY: usize = 256;
const INBOUND_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub local: Member,
    /// Directory for the Raft journal. Ignored when `in_memory` is set.
    pub dir: PathBuf,
    pub in_memory: bool,
    pub bootstrap: bool,
    pub snapshot_threshold: u64,
}

type Reply = oneshot::Sender<Result<(), EngineError>>;

enum Request {
    Propose { data: Vec<u8>, respond_to: Reply },
    AddVoter { member: Member, respond_to: Reply },
    RemoveServer { node_id: String, respond_to: Reply },
}

/// Handle to a running engine. Cheap to share behind an `Arc`.
pub struct RaftEngine {
    local: Member,
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<EngineStatus>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl RaftEngine {
    /// Opens storage, binds the transport and spawns the worker.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - the journal cannot be opened or replayed
    /// - the state machine rejects the stored snapshot
    /// - the transport cannot bind `config.local.raft_addr`
    pub async fn start(config: EngineConfig, fsm: Arc<dyn StateMachine>) -> Result<Self, EngineError> {
        let storage = if config.in_memory {
            RaftStorage::in_memory()
        } else {
            RaftStorage::open_durable(&config.dir)?
        };

        let mut node = RaftNode::new(
            NodeOptions {
                local: config.local.clone(),
                bootstrap: config.bootstrap,
                snapshot_threshold: config.snapshot_threshold,
            },
            storage,
            fsm,
        )?;

        let shutdown_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let transport = Transport::bind(
            &config.local.raft_addr,
            inbound_tx,
            shutdown_token.clone(),
            task_tracker.clone(),
        )
        .await?;

        // A sole voter need not wait out an election timeout.
        let sole_voter = node.members().as_slice() == std::slice::from_ref(&config.local);
        if config.bootstrap && sole_voter {
            node.campaign()?;
        }

        let (status_tx, status_rx) = watch::channel(node.status());
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);

        let worker = Worker {
            last_role: node.role(),
            node,
            transport,
            requests: request_rx,
            inbound: inbound_rx,
            status: status_tx,
            pending: HashMap::new(),
            nonce: rand::random(),
            seq: 0,
            halted: None,
            shutdown_token: shutdown_token.clone(),
        };
        task_tracker.spawn(worker.run());

        info!(
            node = %config.local.node_id,
            raft_addr = %config.local.raft_addr,
            in_memory = config.in_memory,
            "raft engine started"
        );

        Ok(Self {
            local: config.local,
            requests: request_tx,
            status: status_rx,
            shutdown_token,
            task_tracker,
        })
    }

    async fn request(&self, build: impl FnOnce(Reply) -> Request) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }
}

#[async_trait]
impl ConsensusEngine for RaftEngine {
    fn local(&self) -> &Member {
        &self.local
    }

    fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    async fn apply(&self, command: Vec<u8>) -> Result<(), EngineError> {
        self.request(|respond_to| Request::Propose {
            data: command,
            respond_to,
        })
        .await
    }

    async fn add_voter(&self, member: Member) -> Result<(), EngineError> {
        self.request(|respond_to| Request::AddVoter { member, respond_to })
            .await
    }

    async fn remove_server(&self, node_id: &str) -> Result<(), EngineError> {
        let node_id = node_id.to_string();
        self.request(|respond_to| Request::RemoveServer {
            node_id,
            respond_to,
        })
        .await
    }

    async fn halted(&self) -> Option<String> {
        let mut status = self.status.clone();
        loop {
            if let Some(reason) = status.borrow_and_update().halted.clone() {
                return Some(reason);
            }
            if status.changed().await.is_err() {
                return status.borrow().halted.clone();
            }
        }
    }

    async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
    }
}

struct Worker {
    node: RaftNode,
    transport: Transport,
    requests: mpsc::Receiver<Request>,
    inbound: mpsc::Receiver<Inbound>,
    status: watch::Sender<EngineStatus>,
    /// Proposers waiting for their entry to apply.
    pending: HashMap<ProposalId, Reply>,
    nonce: u64,
    seq: u64,
    last_role: StateRole,
    halted: Option<String>,
    shutdown_token: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let result = tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                Some(request) = self.requests.recv() => {
                    self.handle_request(request);
                    Ok(())
                }
                Some(inbound) = self.inbound.recv() => {
                    self.step(inbound);
                    Ok(())
                }
                _ = ticker.tick() => {
                    self.node.tick();
                    Ok(())
                }
            };

            if let Err(err) = result.and_then(|()| self.process_ready()) {
                self.halt(err);
                break;
            }
            self.publish_status();
        }

        self.fail_pending(|| EngineError::Stopped);
        if let Err(err) = self.node.flush() {
            warn!(error = %err, "failed to flush raft journal on shutdown");
        }
        debug!(node = %self.node.local().node_id, "raft worker stopped");
    }

    fn next_proposal(&mut self) -> ProposalId {
        self.seq += 1;
        ProposalId {
            node: self.node.id(),
            nonce: self.nonce,
            seq: self.seq,
        }
    }

    fn handle_request(&mut self, request: Request) {
        self.pending.retain(|_, reply| !reply.is_closed());

        let proposal = self.next_proposal();
        let (result, respond_to) = match request {
            Request::Propose { data, respond_to } => (self.node.propose(proposal, data), respond_to),
            Request::AddVoter { member, respond_to } => (
                self.node
                    .propose_membership(proposal, MembershipChange::Add(member)),
                respond_to,
            ),
            Request::RemoveServer {
                node_id,
                respond_to,
            } => {
                let result = match self.node.member(&node_id).cloned() {
                    Some(member) => self
                        .node
                        .propose_membership(proposal, MembershipChange::Remove(member)),
                    None => Err(EngineError::UnknownMember(node_id)),
                };
                (result, respond_to)
            }
        };

        match result {
            Ok(()) => {
                self.pending.insert(proposal, respond_to);
            }
            Err(err) => {
                let _ = respond_to.send(Err(err));
            }
        }
    }

    fn step(&mut self, inbound: Inbound) {
        let from = inbound.message.from;
        if let Err(err) = self.node.step(&inbound.from_addr, inbound.message) {
            debug!(from, from_addr = %inbound.from_addr, error = %err, "ignored raft message");
        }
    }

    /// Drains every ready round. An error is fatal for this replica.
    fn process_ready(&mut self) -> Result<(), EngineError> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch(msg);
            }
            for report in bundle.applied {
                if let Some(reply) = report.proposal.and_then(|id| self.pending.remove(&id)) {
                    let _ = reply.send(Ok(()));
                }
            }
        }
        let node = &self.node;
        self.transport.retain_peers(|addr| node.is_peer_addr(addr));

        let role = self.node.role();
        if role != self.last_role {
            info!(
                node = %self.node.local().node_id,
                from = ?self.last_role,
                to = ?role,
                term = self.node.term(),
                leader = self.node.leader_addr().as_deref().unwrap_or("none"),
                "raft role changed"
            );
            if self.last_role == StateRole::Leader {
                self.fail_pending(|| EngineError::LeadershipLost);
            }
            self.last_role = role;
        }
        Ok(())
    }

    fn dispatch(&mut self, msg: Message) {
        let to = msg.to;
        match self.node.peer_addr(to) {
            Some(addr) => {
                let addr = addr.to_string();
                self.transport.send(&addr, msg);
            }
            None => warn!(to, "no address for raft peer, dropping message"),
        }
    }

    fn fail_pending(&mut self, err: impl Fn() -> EngineError) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(err()));
        }
    }

    fn halt(&mut self, err: EngineError) {
        error!(node = %self.node.local().node_id, error = %err, "raft engine halted");
        self.halted = Some(err.to_string());
        self.publish_status();
        self.fail_pending(|| EngineError::Stopped);
        self.shutdown_token.cancel();
    }

    fn publish_status(&self) {
        let mut status = self.node.status();
        status.halted = self.halted.clone();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::fsm::KvStateMachine;

    fn free_addr() -> String {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().to_string()
    }

    async fn start(node_id: &str, bootstrap: bool) -> (RaftEngine, Arc<KvStateMachine>) {
        let fsm = Arc::new(KvStateMachine::new());
        let engine = RaftEngine::start(
            EngineConfig {
                local: Member::new(node_id, free_addr()),
                dir: PathBuf::new(),
                in_memory: true,
                bootstrap,
                snapshot_threshold: 1024,
            },
            fsm.clone(),
        )
        .await
        .unwrap();
        (engine, fsm)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn bootstrapped_engine_leads_and_applies() {
        let (engine, fsm) = start("solo", true).await;
        wait_for(|| engine.is_leader()).await;

        engine
            .apply(Command::set("x", "1").encode().unwrap())
            .await
            .unwrap();
        assert_eq!(fsm.get("x").as_deref(), Some("1"));
        assert_eq!(engine.leader_addr(), Some(engine.local().raft_addr.clone()));

        engine.shutdown().await;
        assert_eq!(engine.halted().await, None);
    }

    #[tokio::test]
    async fn unbootstrapped_engine_rejects_writes() {
        let (engine, _fsm) = start("lonely", false).await;
        let err = engine
            .apply(Command::set("x", "1").encode().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotLeader { leader: None }));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn added_voter_replicates_over_tcp() {
        let (leader, leader_fsm) = start("a", true).await;
        wait_for(|| leader.is_leader()).await;
        leader
            .apply(Command::set("early", "yes").encode().unwrap())
            .await
            .unwrap();

        let (follower, follower_fsm) = start("b", false).await;
        leader.add_voter(follower.local().clone()).await.unwrap();
        leader
            .apply(Command::set("late", "yes").encode().unwrap())
            .await
            .unwrap();

        wait_for(|| follower_fsm.get("late").is_some()).await;
        assert_eq!(follower_fsm.entries(), leader_fsm.entries());
        wait_for(|| follower.leader_addr() == Some(leader.local().raft_addr.clone())).await;
        assert_eq!(follower.members().len(), 2);

        follower.shutdown().await;
        leader.shutdown().await;
    }

    #[tokio::test]
    async fn removing_unknown_member_fails() {
        let (engine, _fsm) = start("solo", true).await;
        wait_for(|| engine.is_leader()).await;
        let err = engine.remove_server("ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownMember(id) if id == "ghost"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn durable_engine_recovers_state_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let addr = free_addr();
        let config = EngineConfig {
            local: Member::new("durable", addr),
            dir: dir.path().to_path_buf(),
            in_memory: false,
            bootstrap: true,
            snapshot_threshold: 3,
        };

        {
            let engine = RaftEngine::start(config.clone(), Arc::new(KvStateMachine::new()))
                .await
                .unwrap();
            wait_for(|| engine.is_leader()).await;
            for i in 0..8 {
                engine
                    .apply(Command::set(format!("k{i}"), i.to_string()).encode().unwrap())
                    .await
                    .unwrap();
            }
            engine.shutdown().await;
        }

        let fsm = Arc::new(KvStateMachine::new());
        let engine = RaftEngine::start(config, fsm.clone()).await.unwrap();
        wait_for(|| fsm.len() == 8).await;
        assert_eq!(fsm.get("k7").as_deref(), Some("7"));
        wait_for(|| engine.is_leader()).await;
        engine.shutdown().await;
    }
}
