//! TCP transport between Raft peers.
//!
//! # Protocol
//!
//! Each frame is length-prefixed:
//! - 4 bytes: frame length (big-endian u32)
//! - N bytes: bincode [`WireEnvelope`] holding the sender's Raft address and
//!   the protobuf-encoded `raft::prelude::Message`
//!
//! The sender address travels with every frame so a node that has not yet
//! learned a peer's address (a new member hearing from the leader for the
//! first time) can still answer it.
//!
//! Outbound traffic goes through one queue per peer address, drained by a task
//! that keeps a persistent connection and reconnects on failure. Raft tolerates
//! message loss, so a full queue or an unreachable peer drops messages instead
//! of blocking the worker. A queue is dropped once its address stops being a
//! peer, which ends that peer's connection task.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use prost::Message as ProstMessage;
use raft::prelude::Message;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use super::EngineError;

/// Largest frame accepted from a peer; snapshots are the big ones.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const PEER_QUEUE_CAPACITY: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// After a failed connect, messages to that peer are dropped for this long.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    from_addr: String,
    message: Vec<u8>,
}

/// A message received from a peer, tagged with the address it listens on.
#[derive(Debug)]
pub struct Inbound {
    pub from_addr: String,
    pub message: Message,
}

pub struct Transport {
    local_addr: String,
    peers: HashMap<String, mpsc::Sender<Message>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Transport {
    /// Binds the listener and starts accepting peer connections. Every decoded
    /// message is pushed into `inbound`.
    pub async fn bind(
        local_addr: &str,
        inbound: mpsc::Sender<Inbound>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Result<Self, EngineError> {
        let listener = TcpListener::bind(local_addr)
            .await
            .map_err(|source| EngineError::Bind {
                addr: local_addr.to_string(),
                source,
            })?;
        debug!(addr = %local_addr, "raft transport listening");

        tracker.spawn(accept_loop(
            listener,
            inbound,
            cancel.clone(),
            tracker.clone(),
        ));

        Ok(Self {
            local_addr: local_addr.to_string(),
            peers: HashMap::new(),
            cancel,
            tracker,
        })
    }

    /// Queues `msg` for the peer at `addr`. Never blocks.
    pub fn send(&mut self, addr: &str, msg: Message) {
        let queue = self
            .peers
            .entry(addr.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
                self.tracker.spawn(peer_loop(
                    self.local_addr.clone(),
                    addr.to_string(),
                    rx,
                    self.cancel.clone(),
                ));
                tx
            });
        if let Err(err) = queue.try_send(msg) {
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    trace!(peer = %addr, "peer queue full, dropping raft message");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    self.peers.remove(addr);
                }
            }
        }
    }

    /// Drops the queue of every peer address `keep` rejects.
    pub fn retain_peers(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.peers.retain(|addr, _| {
            let kept = keep(addr);
            if !kept {
                debug!(peer = %addr, "closing raft connection to former peer");
            }
            kept
        });
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    trace!(%remote, "accepted raft connection");
                    tracker.spawn(read_loop(stream, inbound.clone(), cancel.clone()));
                }
                Err(err) => warn!(error = %err, "raft accept failed"),
            },
        }
    }
}

async fn read_loop(mut stream: TcpStream, inbound: mpsc::Sender<Inbound>, cancel: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = read_frame(&mut stream) => frame,
        };
        let envelope = match frame {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return,
            Err(err) => {
                debug!(error = %err, "dropping raft connection");
                return;
            }
        };
        let message = match Message::decode(&envelope.message[..]) {
            Ok(message) => message,
            Err(err) => {
                warn!(from = %envelope.from_addr, error = %err, "undecodable raft message");
                return;
            }
        };
        let inbound_msg = Inbound {
            from_addr: envelope.from_addr,
            message,
        };
        if inbound.send(inbound_msg).await.is_err() {
            return;
        }
    }
}

async fn peer_loop(
    local_addr: String,
    peer_addr: String,
    mut queue: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    let mut stream: Option<TcpStream> = None;
    let mut retry_at = Instant::now();

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = queue.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };

        if stream.is_none() {
            if Instant::now() < retry_at {
                continue;
            }
            match timeout(CONNECT_TIMEOUT, TcpStream::connect(&peer_addr)).await {
                Ok(Ok(connected)) => {
                    let _ = connected.set_nodelay(true);
                    debug!(peer = %peer_addr, "connected to raft peer");
                    stream = Some(connected);
                }
                Ok(Err(err)) => {
                    debug!(peer = %peer_addr, error = %err, "raft peer unreachable");
                    retry_at = Instant::now() + RECONNECT_BACKOFF;
                    continue;
                }
                Err(_) => {
                    debug!(peer = %peer_addr, "raft peer connect timed out");
                    retry_at = Instant::now() + RECONNECT_BACKOFF;
                    continue;
                }
            }
        }

        if let Some(conn) = stream.as_mut() {
            if let Err(err) = write_frame(conn, &local_addr, &msg).await {
                debug!(peer = %peer_addr, error = %err, "raft send failed, reconnecting");
                stream = None;
            }
        }
    }
}

async fn write_frame(stream: &mut TcpStream, from_addr: &str, msg: &Message) -> io::Result<()> {
    let envelope = WireEnvelope {
        from_addr: from_addr.to_string(),
        message: msg.encode_to_vec(),
    };
    let data = bincode::serialize(&envelope)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    if data.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("raft frame of {} bytes exceeds limit", data.len()),
        ));
    }
    let len = data.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&data).await?;
    Ok(())
}

/// `Ok(None)` on a clean close between frames.
async fn read_frame(stream: &mut TcpStream) -> io::Result<Option<WireEnvelope>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("raft frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    bincode::deserialize(&buf)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}
