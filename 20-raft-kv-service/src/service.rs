//! Runs the HTTP API, the reconciler and (optionally) discovery around an
//! opened [`Store`], under one cancellation token and task tracker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::directory::ClientDirectory;
use crate::discovery::PeerAnnouncement;
use crate::discovery::multicast::{self, DiscoveryConfig};
use crate::reconciler::{AnnouncementSender, DEFAULT_BACKOFF, Reconciler};
use crate::router::{JoinRequest, RequestRouter};
use crate::store::Store;

const JOIN_ATTEMPTS: usize = 5;
const JOIN_RETRY_DELAY: Duration = Duration::from_secs(1);
const JOIN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub node_id: String,
    /// HTTP bind address. Port 0 picks a free port, which is then advertised.
    pub http_addr: String,
    pub raft_addr: String,
    pub join_backoff: Duration,
    /// `None` disables discovery; peers then only arrive through `/join`.
    pub discovery: Option<DiscoveryConfig>,
}

impl ServiceConfig {
    pub fn new(
        node_id: impl Into<String>,
        http_addr: impl Into<String>,
        raft_addr: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            http_addr: http_addr.into(),
            raft_addr: raft_addr.into(),
            join_backoff: DEFAULT_BACKOFF,
            discovery: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to bind http listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("join via {addr} failed: {reason}")]
    Join { addr: String, reason: String },
}

pub struct Service {
    store: Arc<Store>,
    directory: Arc<ClientDirectory>,
    local: PeerAnnouncement,
    announcements: AnnouncementSender,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl Service {
    /// Binds the HTTP listener and spawns the background tasks.
    pub async fn start(config: ServiceConfig, store: Arc<Store>) -> Result<Self, ServiceError> {
        let bind_err = |source| ServiceError::Bind {
            addr: config.http_addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&config.http_addr)
            .await
            .map_err(bind_err)?;
        let bound = listener.local_addr().map_err(bind_err)?;
        let http_addr = match config.http_addr.parse::<SocketAddr>() {
            Ok(addr) if addr.port() == 0 => bound.to_string(),
            _ => config.http_addr.clone(),
        };
        let local = PeerAnnouncement {
            id: config.node_id.clone(),
            raft_addr: config.raft_addr.clone(),
            http_addr,
        };

        let directory = Arc::new(ClientDirectory::new());
        let router = RequestRouter::new(store.clone(), directory.clone(), local.clone())?;
        let shutdown_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        let token = shutdown_token.clone();
        let app = router.routes();
        task_tracker.spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(err) = served {
                warn!(error = %err, "http server exited with error");
            }
        });

        let (announcements, reconciler) = Reconciler::new(
            store.clone(),
            directory.clone(),
            config.raft_addr.clone(),
            config.join_backoff,
        );
        task_tracker.spawn(reconciler.run(shutdown_token.clone()));

        if let Some(discovery) = config.discovery {
            let sink = announcements.clone();
            let token = shutdown_token.clone();
            let announced = local.clone();
            task_tracker.spawn(async move {
                if let Err(err) = multicast::run(discovery, announced, sink, token).await {
                    warn!(error = %err, "discovery stopped, peers must join explicitly");
                }
            });
        }

        info!(node = %local.id, http = %local.http_addr, raft = %local.raft_addr, "service started");
        Ok(Self {
            store,
            directory,
            local,
            announcements,
            shutdown_token,
            task_tracker,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<ClientDirectory> {
        &self.directory
    }

    /// This node's registration, as advertised and returned from `/join`.
    pub fn local(&self) -> &PeerAnnouncement {
        &self.local
    }

    /// Queue feeding the reconciler, shared with the discovery transport.
    pub fn announcements(&self) -> AnnouncementSender {
        self.announcements.clone()
    }

    /// Asks the cluster behind `join_addr` (an HTTP address) to add this node,
    /// then records the answering leader so writes can be forwarded to it.
    pub async fn join_existing(&self, join_addr: &str) -> Result<PeerAnnouncement, ServiceError> {
        let client = reqwest::Client::builder().timeout(JOIN_TIMEOUT).build()?;
        let request = JoinRequest {
            id: self.local.id.clone(),
            addr: self.local.raft_addr.clone(),
            http_addr: Some(self.local.http_addr.clone()),
        };
        let url = format!("http://{join_addr}/join");

        let mut last_error = String::new();
        for attempt in 1..=JOIN_ATTEMPTS {
            match post_join(&client, &url, &request).await {
                Ok(leader) => {
                    self.directory.record(&leader.raft_addr, &leader.http_addr);
                    info!(leader = %leader.id, via = join_addr, "joined cluster");
                    return Ok(leader);
                }
                Err(reason) => {
                    warn!(via = join_addr, attempt, error = %reason, "join attempt failed");
                    last_error = reason;
                }
            }
            if attempt < JOIN_ATTEMPTS {
                tokio::time::sleep(JOIN_RETRY_DELAY).await;
            }
        }
        Err(ServiceError::Join {
            addr: join_addr.to_string(),
            reason: last_error,
        })
    }

    /// Cancels every background task, waits for them, then closes the store.
    pub async fn stop(self) {
        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        self.store.close().await;
        info!(node = %self.local.id, "service stopped");
    }
}

async fn post_join(
    client: &reqwest::Client,
    url: &str,
    request: &JoinRequest,
) -> Result<PeerAnnouncement, String> {
    let response = client
        .post(url)
        .json(request)
        .send()
        .await
        .map_err(|err| err.to_string())?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("{status}: {body}"));
    }
    response
        .json::<PeerAnnouncement>()
        .await
        .map_err(|err| err.to_string())
}
