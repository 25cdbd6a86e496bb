//! Turns discovered peers into cluster members.
//!
//! Discovery reports peers to every node, but only the leader can add them.
//! The reconciler owns a bounded queue of announcements and calls `join` for
//! each peer that is neither this node nor an existing member. A failed join
//! (usually "not the leader") is put back and the loop sleeps for a fixed
//! backoff, so membership still converges once a leader exists, without a
//! follower spinning on rejections.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::ClientDirectory;
use crate::discovery::PeerAnnouncement;
use crate::store::{Store, StoreError};

pub const QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);
/// How long a discovery producer may block on a full queue.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// The slice of the store the reconciler needs.
#[async_trait]
pub trait Membership: Send + Sync {
    /// Whether `raft_addr` already belongs to a voting member.
    fn is_member(&self, raft_addr: &str) -> bool;

    async fn join(&self, node_id: &str, raft_addr: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl Membership for Store {
    fn is_member(&self, raft_addr: &str) -> bool {
        self.members().iter().any(|m| m.raft_addr == raft_addr)
    }

    async fn join(&self, node_id: &str, raft_addr: &str) -> Result<(), StoreError> {
        Store::join(self, node_id, raft_addr).await
    }
}

/// Producer half, handed to the discovery transport.
#[derive(Clone)]
pub struct AnnouncementSender {
    tx: mpsc::Sender<PeerAnnouncement>,
}

impl AnnouncementSender {
    /// Queues `announcement`, waiting briefly if the reconciler is behind.
    /// Returns `false` if it was dropped.
    pub async fn send(&self, announcement: PeerAnnouncement) -> bool {
        match self.tx.send_timeout(announcement, SEND_TIMEOUT).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(announcement)) => {
                warn!(peer = %announcement.id, "reconciler queue full, dropping announcement");
                false
            }
            Err(SendTimeoutError::Closed(_)) => false,
        }
    }
}

pub struct Reconciler {
    membership: Arc<dyn Membership>,
    directory: Arc<ClientDirectory>,
    local_raft_addr: String,
    rx: mpsc::Receiver<PeerAnnouncement>,
    /// Announcements taken off the queue and not yet resolved, at most one
    /// per Raft address.
    pending: VecDeque<PeerAnnouncement>,
    backoff: Duration,
}

impl Reconciler {
    pub fn new(
        membership: Arc<dyn Membership>,
        directory: Arc<ClientDirectory>,
        local_raft_addr: impl Into<String>,
        backoff: Duration,
    ) -> (AnnouncementSender, Self) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let reconciler = Self {
            membership,
            directory,
            local_raft_addr: local_raft_addr.into(),
            rx,
            pending: VecDeque::new(),
            backoff,
        };
        (AnnouncementSender { tx }, reconciler)
    }

    /// Runs until `shutdown_token` is cancelled or every sender is dropped.
    pub async fn run(mut self, shutdown_token: CancellationToken) {
        loop {
            self.absorb_queued();
            let next = match self.pending.pop_front() {
                Some(next) => next,
                None => tokio::select! {
                    _ = shutdown_token.cancelled() => break,
                    received = self.rx.recv() => match received {
                        Some(announcement) => announcement,
                        None => break,
                    },
                },
            };

            if let Err(failed) = self.reconcile(next).await {
                self.enqueue(failed);
                tokio::select! {
                    _ = shutdown_token.cancelled() => break,
                    _ = tokio::time::sleep(self.backoff) => {}
                }
            }
        }

        // Refuse new announcements and release anything already queued so no
        // producer stays blocked on us.
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        debug!("reconciler stopped");
    }

    fn absorb_queued(&mut self) {
        while let Ok(announcement) = self.rx.try_recv() {
            self.enqueue(announcement);
        }
    }

    /// Adds to `pending`, replacing an older entry for the same Raft address.
    fn enqueue(&mut self, announcement: PeerAnnouncement) {
        match self
            .pending
            .iter_mut()
            .find(|queued| queued.raft_addr == announcement.raft_addr)
        {
            Some(queued) => *queued = announcement,
            None => self.pending.push_back(announcement),
        }
    }

    async fn reconcile(&self, peer: PeerAnnouncement) -> Result<(), PeerAnnouncement> {
        if peer.raft_addr == self.local_raft_addr {
            debug!(peer = %peer.id, "ignoring own announcement");
            return Ok(());
        }
        if self.membership.is_member(&peer.raft_addr) {
            debug!(peer = %peer.id, raft_addr = %peer.raft_addr, "peer already a member");
            self.directory.record(&peer.raft_addr, &peer.http_addr);
            return Ok(());
        }

        match self.membership.join(&peer.id, &peer.raft_addr).await {
            Ok(()) => {
                self.directory.record(&peer.raft_addr, &peer.http_addr);
                info!(peer = %peer.id, raft_addr = %peer.raft_addr, http_addr = %peer.http_addr, "peer joined cluster");
                Ok(())
            }
            Err(err) => {
                warn!(
                    peer = %peer.id,
                    error = %err,
                    retry_in = ?self.backoff,
                    "join failed, will retry"
                );
                Err(peer)
            }
        }
    }
}
