//! Synchronous Raft core.
//!
//! [`RaftNode`] wraps tikv/raft's `RawNode` together with the state machine it
//! replicates. It does no I/O beyond the storage it was given: the caller feeds
//! it ticks, proposals and peer messages, then calls [`RaftNode::poll_ready`]
//! and ships the returned messages. Keeping it synchronous lets the unit tests
//! below drive whole clusters deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, ConfState, Config, Entry, EntryType, Message, RawNode, Snapshot,
};
use raft::{StateRole, Storage};
use serde::{Deserialize, Serialize};
use slog::{Logger, o};
use tracing::{debug, info};

use super::storage::RaftStorage;
use super::{EngineError, EngineStatus, Member};
use crate::fsm::StateMachine;

/// tikv/raft insists on an slog logger; everything worth reporting is logged
/// through `tracing` by this module instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Identifies one proposal so the proposer can tell when *its* entry applied.
///
/// Carried in the entry context. `nonce` is drawn fresh every time the process
/// starts, so sequence numbers reused after a restart never match entries from
/// the previous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProposalId {
    pub node: u64,
    pub nonce: u64,
    pub seq: u64,
}

impl ProposalId {
    const ENCODED_LEN: usize = 24;

    pub fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.node.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out
    }

    /// `None` for entries without a proposal context, such as a new leader's
    /// empty entry.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let word = |i: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            u64::from_be_bytes(buf)
        };
        Some(Self {
            node: word(0),
            nonce: word(1),
            seq: word(2),
        })
    }
}

/// Payload of every snapshot this engine produces: the member list (so a
/// restored node can address its peers) plus the state machine's own bytes.
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotData {
    pub members: Vec<Member>,
    pub state: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Add(Member),
    Remove(Member),
}

impl MembershipChange {
    fn member(&self) -> &Member {
        match self {
            MembershipChange::Add(member) | MembershipChange::Remove(member) => member,
        }
    }
}

/// One committed entry that has been applied locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub index: u64,
    pub term: u64,
    pub proposal: Option<ProposalId>,
}

/// Output of one [`RaftNode::poll_ready`] round: messages to ship to peers and
/// the entries applied while handling it.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
}

pub struct NodeOptions {
    pub local: Member,
    pub bootstrap: bool,
    /// Applied entries between snapshots before the log is compacted.
    pub snapshot_threshold: u64,
}

pub struct RaftNode {
    id: u64,
    local: Member,
    raw: RawNode<RaftStorage>,
    storage: RaftStorage,
    fsm: Arc<dyn StateMachine>,
    /// Voting members by raft ID, as of the last applied entry or snapshot.
    members: BTreeMap<u64, Member>,
    /// Addresses of peers heard from that are not (yet) known members.
    learned: HashMap<u64, String>,
    snapshot_threshold: u64,
    applied: u64,
    membership_changed: bool,
}

impl RaftNode {
    /// Builds the node on top of `storage`, bootstrapping a one-member cluster
    /// when asked to and the storage holds no prior Raft state.
    ///
    /// # Raft timing configuration
    ///
    /// - `election_tick: 10`: Elections triggered after ~1 second of no leader heartbeats
    /// - `heartbeat_tick: 3`: Leader sends heartbeats every ~300ms
    /// - Assumes each `tick()` call happens every 100ms (set by runtime)
    pub fn new(
        options: NodeOptions,
        storage: RaftStorage,
        fsm: Arc<dyn StateMachine>,
    ) -> Result<Self, EngineError> {
        let id = options.local.raft_id();

        if options.bootstrap {
            if storage.is_initialized()? {
                info!(node = %options.local.node_id, "existing raft state found, skipping bootstrap");
            } else {
                let snapshot = build_snapshot(
                    1,
                    1,
                    ConfState::from((vec![id], vec![])),
                    vec![options.local.clone()],
                    fsm.as_ref(),
                )?;
                storage.bootstrap(snapshot)?;
                info!(node = %options.local.node_id, raft_id = id, "bootstrapped single-node cluster");
            }
        }

        let latest = storage.latest_snapshot();
        let mut members = BTreeMap::new();
        if latest.get_metadata().index > 0 {
            let data = decode_snapshot_data(&latest)?;
            fsm.restore(&data.state)?;
            members = data.members.into_iter().map(|m| (m.raft_id(), m)).collect();
        }
        let applied = latest.get_metadata().index;

        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            applied,
            pre_vote: true,
            check_quorum: true,
            ..Default::default()
        };
        let raw = RawNode::new(&cfg, storage.clone(), &silent_logger())?;

        Ok(Self {
            id,
            local: options.local,
            raw,
            storage,
            fsm,
            members,
            learned: HashMap::new(),
            snapshot_threshold: options.snapshot_threshold.max(1),
            applied,
            membership_changed: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local(&self) -> &Member {
        &self.local
    }

    pub fn tick(&mut self) {
        self.raw.tick();
    }

    pub fn campaign(&mut self) -> Result<(), EngineError> {
        self.raw.campaign()?;
        Ok(())
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    pub fn is_leader(&self) -> bool {
        self.role() == StateRole::Leader
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    /// Raft address of the current leader, if one is known.
    pub fn leader_addr(&self) -> Option<String> {
        match self.raw.raft.leader_id {
            raft::INVALID_ID => None,
            leader if leader == self.id => Some(self.local.raft_addr.clone()),
            leader => self.peer_addr(leader).map(str::to_string),
        }
    }

    pub fn peer_addr(&self, id: u64) -> Option<&str> {
        self.members
            .get(&id)
            .map(|member| member.raft_addr.as_str())
            .or_else(|| self.learned.get(&id).map(String::as_str))
    }

    /// True if `addr` is where a member, or a peer heard from before it was
    /// added, listens.
    pub fn is_peer_addr(&self, addr: &str) -> bool {
        self.members.values().any(|member| member.raft_addr == addr)
            || self.learned.values().any(|learned| learned == addr)
    }

    pub fn member(&self, node_id: &str) -> Option<&Member> {
        self.members.values().find(|member| member.node_id == node_id)
    }

    pub fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.members.values().cloned().collect();
        members.sort();
        members
    }

    /// Forces buffered journal records to disk.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.storage.sync()?;
        Ok(())
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            node_id: self.local.node_id.clone(),
            role: self.role().into(),
            term: self.term(),
            leader_addr: self.leader_addr(),
            members: self.members(),
            applied: self.applied,
            halted: None,
        }
    }

    fn ensure_leader(&self) -> Result<(), EngineError> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(EngineError::NotLeader {
                leader: self.leader_addr(),
            })
        }
    }

    /// Appends `data` to the leader's log. Success means "in the log", not
    /// "committed"; watch [`ApplyReport::proposal`] for that.
    pub fn propose(&mut self, proposal: ProposalId, data: Vec<u8>) -> Result<(), EngineError> {
        self.ensure_leader()?;
        self.raw.propose(proposal.to_bytes(), data)?;
        Ok(())
    }

    /// Proposes a single-step membership change. Only one may be in flight.
    pub fn propose_membership(
        &mut self,
        proposal: ProposalId,
        change: MembershipChange,
    ) -> Result<(), EngineError> {
        self.ensure_leader()?;
        if self.raw.raft.pending_conf_index > self.raw.raft.raft_log.applied {
            return Err(EngineError::MembershipChangePending);
        }

        let member = change.member();
        let mut cc = ConfChange::default();
        cc.node_id = member.raft_id();
        cc.set_change_type(match change {
            MembershipChange::Add(_) => ConfChangeType::AddNode,
            MembershipChange::Remove(_) => ConfChangeType::RemoveNode,
        });
        cc.context = bincode::serialize(member)
            .map_err(|err| EngineError::MalformedEntry {
                index: 0,
                reason: err.to_string(),
            })?
            .into();
        self.raw.propose_conf_change(proposal.to_bytes(), cc)?;
        Ok(())
    }

    /// Feeds a message received from the peer listening on `from_addr`.
    pub fn step(&mut self, from_addr: &str, msg: Message) -> Result<(), EngineError> {
        if msg.from != raft::INVALID_ID && !self.members.contains_key(&msg.from) {
            self.learned.insert(msg.from, from_addr.to_string());
        }
        self.raw.step(msg)?;
        Ok(())
    }

    /// Processes one ready round, returning `None` when Raft has nothing to do.
    ///
    /// Order follows tikv/raft's contract: send leader messages, install any
    /// snapshot, apply committed entries, persist entries and hard state, send
    /// persisted messages, then the light ready.
    ///
    /// An error here means either the log could not be persisted or the state
    /// machine rejected a committed entry. Both leave this replica unusable.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>, EngineError> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut messages = ready.take_messages();
        let mut applied = Vec::new();
        let mut wrote = false;

        if !ready.snapshot().is_empty() {
            self.install_snapshot(ready.snapshot().clone())?;
            wrote = true;
        }

        self.apply_entries(ready.take_committed_entries(), &mut applied)?;

        if !ready.entries().is_empty() {
            self.storage.append(ready.entries())?;
            wrote = true;
        }
        if let Some(hard_state) = ready.hs() {
            self.storage.set_hard_state(hard_state)?;
            wrote = true;
        }
        if wrote {
            self.storage.sync()?;
        }
        messages.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);
        if let Some(commit) = light_ready.commit_index() {
            self.storage.set_commit(commit)?;
        }
        messages.extend(light_ready.take_messages());
        self.apply_entries(light_ready.take_committed_entries(), &mut applied)?;
        self.raw.advance_apply();

        self.maybe_snapshot()?;

        Ok(Some(ReadyBundle { messages, applied }))
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(), EngineError> {
        let index = snapshot.get_metadata().index;
        let data = decode_snapshot_data(&snapshot)?;
        self.storage.apply_snapshot(snapshot)?;
        self.fsm.restore(&data.state)?;
        self.members = data.members.into_iter().map(|m| (m.raft_id(), m)).collect();
        for id in self.members.keys() {
            self.learned.remove(id);
        }
        self.applied = index;
        info!(node = %self.local.node_id, index, "installed snapshot from leader");
        Ok(())
    }

    fn apply_entries(
        &mut self,
        entries: Vec<Entry>,
        applied: &mut Vec<ApplyReport>,
    ) -> Result<(), EngineError> {
        for entry in entries {
            match entry.entry_type() {
                EntryType::EntryNormal => {
                    if !entry.data.is_empty() {
                        self.fsm.apply(&entry.data)?;
                    }
                }
                EntryType::EntryConfChange => self.apply_conf_change(&entry)?,
                EntryType::EntryConfChangeV2 => {
                    return Err(EngineError::MalformedEntry {
                        index: entry.index,
                        reason: "joint consensus changes are not used".to_string(),
                    });
                }
            }
            self.applied = entry.index;
            applied.push(ApplyReport {
                index: entry.index,
                term: entry.term,
                proposal: ProposalId::from_bytes(&entry.context),
            });
        }
        Ok(())
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<(), EngineError> {
        let malformed = |reason: String| EngineError::MalformedEntry {
            index: entry.index,
            reason,
        };
        let cc = ConfChange::decode(&entry.data[..]).map_err(|err| malformed(err.to_string()))?;
        let member: Member =
            bincode::deserialize(&cc.context[..]).map_err(|err| malformed(err.to_string()))?;

        let conf_state = self.raw.apply_conf_change(&cc)?;
        self.storage.set_conf_state(&conf_state)?;

        match cc.change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                info!(node = %self.local.node_id, member = %member.node_id, addr = %member.raft_addr, "member added");
                self.learned.remove(&cc.node_id);
                self.members.insert(cc.node_id, member);
            }
            ConfChangeType::RemoveNode => {
                info!(node = %self.local.node_id, member = %member.node_id, "member removed");
                self.members.remove(&cc.node_id);
                self.learned.remove(&cc.node_id);
            }
        }
        self.membership_changed = true;
        Ok(())
    }

    /// Refreshes the served snapshot after a membership change, and compacts
    /// the log once enough entries have been applied since the last one.
    ///
    /// Raft only sends a snapshot to a peer included in its conf state, so a
    /// node that was just added must be offered one taken after its addition.
    fn maybe_snapshot(&mut self) -> Result<(), EngineError> {
        let latest_index = self.storage.latest_snapshot().get_metadata().index;
        let compaction_due = self.applied.saturating_sub(latest_index) >= self.snapshot_threshold;
        let refresh = std::mem::take(&mut self.membership_changed);
        if self.applied <= latest_index || !(compaction_due || refresh) {
            return Ok(());
        }

        let snapshot = build_snapshot(
            self.applied,
            self.storage.term(self.applied)?,
            self.storage.conf_state()?,
            self.members(),
            self.fsm.as_ref(),
        )?;
        if compaction_due {
            self.storage.compact(snapshot)?;
            debug!(node = %self.local.node_id, index = self.applied, "log compacted");
        } else {
            self.storage.set_latest_snapshot(snapshot);
        }
        Ok(())
    }
}

fn build_snapshot(
    index: u64,
    term: u64,
    conf_state: ConfState,
    members: Vec<Member>,
    fsm: &dyn StateMachine,
) -> Result<Snapshot, EngineError> {
    let data = SnapshotData {
        members,
        state: fsm.snapshot()?,
    };
    let bytes = bincode::serialize(&data).map_err(|err| EngineError::MalformedEntry {
        index,
        reason: err.to_string(),
    })?;

    let mut snapshot = Snapshot::default();
    snapshot.data = bytes.into();
    let meta = snapshot.mut_metadata();
    meta.index = index;
    meta.term = term;
    meta.set_conf_state(conf_state);
    Ok(snapshot)
}

fn decode_snapshot_data(snapshot: &Snapshot) -> Result<SnapshotData, EngineError> {
    bincode::deserialize(&snapshot.data[..]).map_err(|err| EngineError::MalformedEntry {
        index: snapshot.get_metadata().index,
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::fsm::KvStateMachine;

    /// Routes messages between in-process nodes, no sockets involved.
    struct TestCluster {
        nodes: BTreeMap<u64, (RaftNode, Arc<KvStateMachine>)>,
        seq: u64,
    }

    impl TestCluster {
        fn bootstrap(node_id: &str, snapshot_threshold: u64) -> Self {
            let mut cluster = Self {
                nodes: BTreeMap::new(),
                seq: 0,
            };
            let id = cluster.spawn(node_id, true, snapshot_threshold);
            cluster.node_mut(id).campaign().unwrap();
            cluster.deliver();
            assert!(cluster.node(id).is_leader());
            cluster
        }

        fn spawn(&mut self, node_id: &str, bootstrap: bool, snapshot_threshold: u64) -> u64 {
            let fsm = Arc::new(KvStateMachine::new());
            let local = member(node_id);
            let node = RaftNode::new(
                NodeOptions {
                    local,
                    bootstrap,
                    snapshot_threshold,
                },
                RaftStorage::in_memory(),
                fsm.clone(),
            )
            .unwrap();
            let id = node.id();
            self.nodes.insert(id, (node, fsm));
            id
        }

        fn node(&self, id: u64) -> &RaftNode {
            &self.nodes.get(&id).expect("node not found").0
        }

        fn node_mut(&mut self, id: u64) -> &mut RaftNode {
            &mut self.nodes.get_mut(&id).expect("node not found").0
        }

        fn fsm(&self, id: u64) -> &KvStateMachine {
            &self.nodes.get(&id).expect("node not found").1
        }

        fn next_proposal(&mut self, node: u64) -> ProposalId {
            self.seq += 1;
            ProposalId {
                node,
                nonce: 7,
                seq: self.seq,
            }
        }

        /// Pumps ready rounds until no messages are in flight. Returns the
        /// applied reports per node.
        fn deliver(&mut self) -> HashMap<u64, Vec<ApplyReport>> {
            let mut applied: HashMap<u64, Vec<ApplyReport>> = HashMap::new();
            loop {
                let mut outbound = Vec::new();
                for (id, (node, _)) in self.nodes.iter_mut() {
                    while let Some(bundle) = node.poll_ready().unwrap() {
                        applied.entry(*id).or_default().extend(bundle.applied);
                        let from_addr = node.local().raft_addr.clone();
                        outbound.extend(bundle.messages.into_iter().map(|m| (from_addr.clone(), m)));
                    }
                }
                if outbound.is_empty() {
                    return applied;
                }
                for (from_addr, msg) in outbound {
                    if let Some((node, _)) = self.nodes.get_mut(&msg.to) {
                        let _ = node.step(&from_addr, msg);
                    }
                }
            }
        }

        fn tick_all(&mut self) {
            for (node, _) in self.nodes.values_mut() {
                node.tick();
            }
        }

        fn stabilize(&mut self, rounds: usize) {
            for _ in 0..rounds {
                self.tick_all();
                self.deliver();
            }
        }

        fn set(&mut self, leader: u64, key: &str, value: &str) -> ProposalId {
            let proposal = self.next_proposal(leader);
            let data = Command::set(key, value).encode().unwrap();
            self.node_mut(leader).propose(proposal, data).unwrap();
            proposal
        }

        fn add(&mut self, leader: u64, node_id: &str) -> u64 {
            let id = self.spawn(node_id, false, 1024);
            let proposal = self.next_proposal(leader);
            self.node_mut(leader)
                .propose_membership(proposal, MembershipChange::Add(member(node_id)))
                .unwrap();
            self.deliver();
            self.stabilize(5);
            id
        }
    }

    fn member(node_id: &str) -> Member {
        Member::new(node_id, format!("{node_id}.raft:12000"))
    }

    #[test]
    fn bootstrap_elects_single_leader() {
        let cluster = TestCluster::bootstrap("a", 1024);
        let a = raft_id_of("a");
        let status = cluster.node(a).status();
        assert_eq!(status.members, vec![member("a")]);
        assert_eq!(status.leader_addr.as_deref(), Some("a.raft:12000"));
        assert!(status.term >= 1);
    }

    #[test]
    fn proposal_reports_its_id_when_applied() {
        let mut cluster = TestCluster::bootstrap("a", 1024);
        let a = raft_id_of("a");
        let before = cluster.node(a).status().applied;
        let proposal = cluster.set(a, "x", "1");
        let applied = cluster.deliver();

        let reports = applied.get(&a).expect("leader applied entries");
        let report = reports
            .iter()
            .find(|r| r.proposal == Some(proposal))
            .expect("proposal applied");
        assert_eq!(cluster.fsm(a).get("x").as_deref(), Some("1"));
        assert_eq!(cluster.node(a).status().applied, report.index);
        assert!(report.index > before);
    }

    #[test]
    fn added_member_catches_up_and_replicates() {
        let mut cluster = TestCluster::bootstrap("a", 1024);
        let a = raft_id_of("a");
        cluster.set(a, "before", "join");
        cluster.deliver();

        let b = cluster.add(a, "b");
        assert_eq!(cluster.fsm(b).get("before").as_deref(), Some("join"));
        assert_eq!(cluster.node(b).members(), vec![member("a"), member("b")]);
        assert_eq!(cluster.node(b).leader_addr().as_deref(), Some("a.raft:12000"));

        cluster.set(a, "after", "join");
        cluster.deliver();
        assert_eq!(cluster.fsm(b).get("after").as_deref(), Some("join"));
        assert_eq!(cluster.fsm(a).entries(), cluster.fsm(b).entries());
    }

    #[test]
    fn follower_rejects_proposals_with_leader_hint() {
        let mut cluster = TestCluster::bootstrap("a", 1024);
        let a = raft_id_of("a");
        let b = cluster.add(a, "b");

        let proposal = cluster.next_proposal(b);
        let err = cluster
            .node_mut(b)
            .propose(proposal, Command::set("k", "v").encode().unwrap())
            .unwrap_err();
        match err {
            EngineError::NotLeader { leader } => assert_eq!(leader.as_deref(), Some("a.raft:12000")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn compacted_log_is_served_as_snapshot() {
        let mut cluster = TestCluster::bootstrap("a", 4);
        let a = raft_id_of("a");
        for i in 0..12 {
            cluster.set(a, &format!("k{i}"), &i.to_string());
            cluster.deliver();
        }
        assert!(cluster.node(a).storage.first_index().unwrap() > 2);

        let c = cluster.add(a, "c");
        assert_eq!(cluster.fsm(c).len(), 12);
        assert_eq!(cluster.fsm(c).get("k11").as_deref(), Some("11"));
    }

    #[test]
    fn removed_member_leaves_member_list() {
        let mut cluster = TestCluster::bootstrap("a", 1024);
        let a = raft_id_of("a");
        cluster.add(a, "b");

        let proposal = cluster.next_proposal(a);
        cluster
            .node_mut(a)
            .propose_membership(proposal, MembershipChange::Remove(member("b")))
            .unwrap();
        cluster.deliver();
        assert_eq!(cluster.node(a).members(), vec![member("a")]);
        assert!(!cluster.node(a).is_peer_addr("b.raft:12000"));
        assert!(cluster.node(a).is_peer_addr("a.raft:12000"));
    }

    #[test]
    fn one_membership_change_at_a_time() {
        let mut cluster = TestCluster::bootstrap("a", 1024);
        let a = raft_id_of("a");
        cluster.spawn("b", false, 1024);

        let first = cluster.next_proposal(a);
        cluster
            .node_mut(a)
            .propose_membership(first, MembershipChange::Add(member("b")))
            .unwrap();
        let second = cluster.next_proposal(a);
        let err = cluster
            .node_mut(a)
            .propose_membership(second, MembershipChange::Add(member("c")))
            .unwrap_err();
        assert!(matches!(err, EngineError::MembershipChangePending));
    }

    #[test]
    fn proposal_id_survives_entry_context() {
        let id = ProposalId {
            node: 1,
            nonce: u64::MAX,
            seq: 42,
        };
        assert_eq!(ProposalId::from_bytes(&id.to_bytes()), Some(id));
        assert_eq!(ProposalId::from_bytes(&[]), None);
    }

    fn raft_id_of(node_id: &str) -> u64 {
        member(node_id).raft_id()
    }
}
