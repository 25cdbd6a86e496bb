//! Leader-aware HTTP front end.
//!
//! Reads are answered locally. Writes, deletes and joins are applied here when
//! this node leads; otherwise the original request is forwarded to the
//! leader's HTTP address (looked up in the [`ClientDirectory`]) and the
//! leader's status and body are relayed back unchanged.
//!
//! Routes:
//! - `GET /key/:key` → `{"<key>": "<value>"}`
//! - `POST /key` with `{"k1": "v1", ...}`
//! - `DELETE /key/:key`
//! - `POST /join` with `{"id", "addr", "http_addr"?}` → the leader's registration
//! - `GET /status`

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::directory::ClientDirectory;
use crate::discovery::PeerAnnouncement;
use crate::engine::{Member, Role};
use crate::store::{Store, StoreError};

/// Marks a request that a peer already forwarded once.
pub const FORWARDED_HEADER: &str = "x-raft-kv-forwarded";
const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("malformed request body: {0}")]
    BadBody(String),
    #[error("leader unknown, election in progress")]
    LeaderUnknown,
    #[error("no client address known for leader {0}")]
    LeaderUnresolved(String),
    #[error("not the leader and the request was already forwarded once")]
    ForwardLoop,
}

impl RouteError {
    fn leadership_moved(&self) -> bool {
        matches!(self, RouteError::Store(StoreError::NotLeader { .. }))
    }

    /// A request this node could not route is 503. Anything the store
    /// rejected, including timeouts and a halted node, is 400.
    fn status(&self) -> StatusCode {
        match self {
            RouteError::Store(StoreError::TransportFailure(_))
            | RouteError::LeaderUnknown
            | RouteError::LeaderUnresolved(_)
            | RouteError::ForwardLoop => StatusCode::SERVICE_UNAVAILABLE,
            RouteError::Store(_) | RouteError::BadBody(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        } else {
            debug!(error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Body of `POST /join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: String,
    pub addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_addr: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusBody {
    pub node_id: String,
    pub raft_addr: String,
    pub http_addr: String,
    pub role: Option<Role>,
    pub term: u64,
    pub leader: Option<String>,
    pub members: Vec<Member>,
    pub directory: BTreeMap<String, String>,
    pub applied: u64,
    pub halted: Option<String>,
}

#[derive(Clone)]
pub struct RequestRouter {
    store: Arc<Store>,
    directory: Arc<ClientDirectory>,
    local: Arc<PeerAnnouncement>,
    client: reqwest::Client,
}

impl RequestRouter {
    pub fn new(
        store: Arc<Store>,
        directory: Arc<ClientDirectory>,
        local: PeerAnnouncement,
    ) -> Result<Self, reqwest::Error> {
        directory.record(&local.raft_addr, &local.http_addr);
        let client = reqwest::Client::builder().timeout(FORWARD_TIMEOUT).build()?;
        Ok(Self {
            store,
            directory,
            local: Arc::new(local),
            client,
        })
    }

    pub fn routes(self) -> Router {
        Router::new()
            .route("/key", post(set_keys))
            .route("/key/:key", get(get_key).delete(delete_key))
            .route("/join", post(join))
            .route("/status", get(status))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    async fn apply_pairs(&self, body: &[u8]) -> Result<(), RouteError> {
        let pairs: HashMap<String, String> =
            serde_json::from_slice(body).map_err(|err| RouteError::BadBody(err.to_string()))?;
        for (key, value) in &pairs {
            self.store.set(key, value).await?;
        }
        Ok(())
    }

    async fn apply_join(&self, body: &[u8]) -> Result<Response, RouteError> {
        let request: JoinRequest =
            serde_json::from_slice(body).map_err(|err| RouteError::BadBody(err.to_string()))?;
        self.store.join(&request.id, &request.addr).await?;
        if let Some(http_addr) = &request.http_addr {
            self.directory.record(&request.addr, http_addr);
        }
        info!(node = %request.id, addr = %request.addr, "join accepted");
        Ok(Json(self.local.as_ref().clone()).into_response())
    }

    /// Relays the request to the leader's HTTP address.
    ///
    /// Fails without sending anything when the leader is unknown or has no
    /// known HTTP address, or when the request already came from a peer.
    async fn forward(
        &self,
        headers: &HeaderMap,
        method: Method,
        segments: &[&str],
        body: Bytes,
    ) -> Result<Response, RouteError> {
        if headers.contains_key(FORWARDED_HEADER) {
            return Err(RouteError::ForwardLoop);
        }
        let leader = match self.store.leader() {
            Some(leader) if leader != self.local.raft_addr => leader,
            _ => return Err(RouteError::LeaderUnknown),
        };
        let target = self
            .directory
            .resolve(&leader)
            .ok_or_else(|| RouteError::LeaderUnresolved(leader.clone()))?;

        let forward_err = |reason: String| {
            RouteError::Store(StoreError::TransportFailure(format!(
                "forwarding to {target} failed: {reason}"
            )))
        };
        let mut url = reqwest::Url::parse(&format!("http://{target}/"))
            .map_err(|err| forward_err(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| forward_err("address cannot carry a path".to_string()))?
            .clear()
            .extend(segments);

        debug!(%url, %method, "forwarding to leader");
        let response = self
            .client
            .request(method, url)
            .header(FORWARDED_HEADER, self.local.id.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| forward_err(err.to_string()))?;

        let status = response.status();
        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| forward_err(err.to_string()))?;

        let mut relayed = (status, bytes).into_response();
        if let Some(content_type) = content_type {
            relayed.headers_mut().insert(CONTENT_TYPE, content_type);
        } else {
            relayed.headers_mut().remove(CONTENT_TYPE);
        }
        Ok(relayed)
    }
}

async fn get_key(
    State(router): State<RequestRouter>,
    Path(key): Path<String>,
) -> Result<Json<BTreeMap<String, String>>, RouteError> {
    let value = router.store.get(&key)?;
    Ok(Json(BTreeMap::from([(key, value)])))
}

// Write handlers apply locally when leader. A `NotLeader` from the store means
// leadership moved after the check, so the request is forwarded instead.

async fn set_keys(
    State(router): State<RequestRouter>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RouteError> {
    if router.store.is_leader() {
        match router.apply_pairs(&body).await {
            Err(err) if err.leadership_moved() => {}
            other => return other.map(|()| StatusCode::OK.into_response()),
        }
    }
    router.forward(&headers, Method::POST, &["key"], body).await
}

async fn delete_key(
    State(router): State<RequestRouter>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, RouteError> {
    if router.store.is_leader() {
        match router.store.delete(&key).await {
            Err(StoreError::NotLeader { .. }) => {}
            Ok(()) => return Ok(StatusCode::OK.into_response()),
            Err(err) => return Err(err.into()),
        }
    }
    router
        .forward(&headers, Method::DELETE, &["key", key.as_str()], Bytes::new())
        .await
}

async fn join(
    State(router): State<RequestRouter>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RouteError> {
    if router.store.is_leader() {
        match router.apply_join(&body).await {
            Err(err) if err.leadership_moved() => {}
            other => return other,
        }
    }
    let response = router
        .forward(&headers, Method::POST, &["join"], body.clone())
        .await?;
    // The leader accepted it; remember the joiner's HTTP address here too.
    if response.status().is_success() {
        if let Ok(JoinRequest {
            addr,
            http_addr: Some(http_addr),
            ..
        }) = serde_json::from_slice(&body)
        {
            router.directory.record(&addr, &http_addr);
        }
    }
    Ok(response)
}

async fn status(State(router): State<RequestRouter>) -> Json<StatusBody> {
    let engine = router.store.status();
    Json(StatusBody {
        node_id: router.local.id.clone(),
        raft_addr: router.local.raft_addr.clone(),
        http_addr: router.local.http_addr.clone(),
        role: engine.as_ref().map(|s| s.role),
        term: engine.as_ref().map_or(0, |s| s.term),
        leader: engine.as_ref().and_then(|s| s.leader_addr.clone()),
        members: engine.as_ref().map(|s| s.members.clone()).unwrap_or_default(),
        directory: router.directory.entries(),
        applied: engine.as_ref().map_or(0, |s| s.applied),
        halted: engine.and_then(|s| s.halted),
    })
}
