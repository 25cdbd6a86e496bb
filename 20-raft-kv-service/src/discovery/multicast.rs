//! UDP multicast advertise/browse transport.
//!
//! Each node periodically sends one datagram to the multicast group:
//!
//! ```text
//! <service name>\n<instance name>\n<txt attribute>
//! ```
//!
//! and listens on the same group. Datagrams for another service, from its own
//! instance, or without our TXT prefix are ignored. Everything else is decoded
//! into a [`PeerAnnouncement`] and pushed into the reconciler queue.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DEFAULT_SERVICE_NAME, DiscoveryError, PeerAnnouncement, decode_txt, encode_txt};
use crate::reconciler::AnnouncementSender;

pub const DEFAULT_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(239, 255, 77, 12), 5354);
const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub service: String,
    /// Instance name advertised for this node; its own datagrams are skipped.
    pub instance: String,
    pub group: SocketAddrV4,
    pub announce_interval: Duration,
}

impl DiscoveryConfig {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            service: DEFAULT_SERVICE_NAME.to_string(),
            instance: instance.into(),
            group: DEFAULT_GROUP,
            announce_interval: Duration::from_secs(1),
        }
    }
}

/// A datagram as seen on the wire, before the TXT attribute is decoded.
#[derive(Debug, PartialEq, Eq)]
pub struct ServiceRecord<'a> {
    pub service: &'a str,
    pub instance: &'a str,
    pub txt: &'a str,
}

impl<'a> ServiceRecord<'a> {
    pub fn parse(datagram: &'a str) -> Option<Self> {
        let mut parts = datagram.splitn(3, '\n');
        Some(Self {
            service: parts.next()?,
            instance: parts.next()?,
            txt: parts.next()?,
        })
    }
}

pub fn encode_datagram(config: &DiscoveryConfig, local: &PeerAnnouncement) -> Result<String, DiscoveryError> {
    Ok(format!(
        "{}\n{}\n{}",
        config.service,
        config.instance,
        encode_txt(local)?
    ))
}

/// Decodes a datagram addressed to `config.service` from another instance.
pub fn accept_datagram(
    config: &DiscoveryConfig,
    datagram: &str,
) -> Result<Option<PeerAnnouncement>, DiscoveryError> {
    match ServiceRecord::parse(datagram) {
        Some(record) if record.service == config.service && record.instance != config.instance => {
            decode_txt(record.txt)
        }
        _ => Ok(None),
    }
}

fn bind_group(group: SocketAddrV4) -> Result<UdpSocket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port())).into())?;
    socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Advertises `local` and feeds discovered peers to `sink` until cancelled.
pub async fn run(
    config: DiscoveryConfig,
    local: PeerAnnouncement,
    sink: AnnouncementSender,
    shutdown_token: CancellationToken,
) -> Result<(), DiscoveryError> {
    let socket = bind_group(config.group)?;
    let datagram = encode_datagram(&config, &local)?;
    let mut ticker = tokio::time::interval(config.announce_interval);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    info!(service = %config.service, instance = %config.instance, group = %config.group, "discovery started");

    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = socket.send_to(datagram.as_bytes(), config.group).await {
                    warn!(error = %err, "failed to send discovery announcement");
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(error = %err, "discovery receive failed");
                        continue;
                    }
                };
                let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                    debug!(%from, "ignoring non-utf8 discovery datagram");
                    continue;
                };
                match accept_datagram(&config, text) {
                    Ok(Some(peer)) => {
                        debug!(peer = %peer.id, %from, "peer observed");
                        sink.send(peer).await;
                    }
                    Ok(None) => {}
                    Err(err) => warn!(%from, error = %err, "malformed discovery announcement"),
                }
            }
        }
    }

    if let Err(err) = socket.leave_multicast_v4(*config.group.ip(), Ipv4Addr::UNSPECIFIED) {
        debug!(error = %err, "failed to leave multicast group");
    }
    debug!("discovery stopped");
    Ok(())
}
