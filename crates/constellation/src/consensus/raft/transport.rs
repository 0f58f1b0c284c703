//! HTTP transport for consensus traffic.
//!
//! Every RPC is a JSON `POST` to one of the [`raft_paths`] on the peer's
//! advertised address.

use async_trait::async_trait;
use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use constellation_common::constants::raft_paths;
use constellation_common::{ConstellationError, Result};

use super::RaftHandle;
use super::rpc::*;

#[derive(Debug, Error)]
enum TransportError {
    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),

    #[error("request to {addr} failed: {source}")]
    Request { addr: String, source: reqwest::Error },

    #[error("{addr} answered {status}")]
    Status { addr: String, status: reqwest::StatusCode },
}

impl From<TransportError> for ConstellationError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Request { ref source, .. } if source.is_timeout() => {
                ConstellationError::Timeout(e.to_string())
            }
            TransportError::Status { status, .. } if status == reqwest::StatusCode::SERVICE_UNAVAILABLE => {
                ConstellationError::Shutdown
            }
            other => ConstellationError::Network(other.to_string()),
        }
    }
}

/// Outbound RPCs over HTTP
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(rpc_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(rpc_timeout.min(Duration::from_secs(2)))
            .timeout(rpc_timeout)
            .build()
            .map_err(TransportError::Client)?;
        Ok(Self { client })
    }

    async fn post<Req, Resp>(&self, addr: &str, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("http://{addr}{path}");
        let request_failed = |source| TransportError::Request {
            addr: addr.to_string(),
            source,
        };

        let response = self.client.post(&url).json(body).send().await.map_err(request_failed)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                addr: addr.to_string(),
                status,
            }
            .into());
        }
        Ok(response.json().await.map_err(request_failed)?)
    }
}

#[async_trait]
impl RaftRpc for HttpTransport {
    async fn request_vote(&self, target: &str, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.post(target, raft_paths::REQUEST_VOTE, &req).await
    }

    async fn append_entries(&self, target: &str, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.post(target, raft_paths::APPEND_ENTRIES, &req).await
    }

    async fn install_snapshot(&self, target: &str, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        self.post(target, raft_paths::INSTALL_SNAPSHOT, &req).await
    }

    async fn join(&self, target: &str, req: JoinRequest) -> Result<JoinResponse> {
        self.post(target, raft_paths::JOIN, &req).await
    }
}

/// Inbound consensus endpoints backed by a local node
pub fn raft_router<O: Send + 'static>(handle: RaftHandle<O>) -> Router {
    Router::new()
        .route(raft_paths::REQUEST_VOTE, post(request_vote::<O>))
        .route(raft_paths::APPEND_ENTRIES, post(append_entries::<O>))
        .route(raft_paths::INSTALL_SNAPSHOT, post(install_snapshot::<O>))
        .route(raft_paths::JOIN, post(join::<O>))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/// Serve `router` until `shutdown` fires
pub async fn serve(listener: TcpListener, router: Router, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
}

fn unavailable(e: ConstellationError) -> StatusCode {
    tracing::debug!(error = %e, "Consensus node unavailable for rpc");
    StatusCode::SERVICE_UNAVAILABLE
}

async fn request_vote<O: Send + 'static>(
    State(handle): State<RaftHandle<O>>,
    Json(req): Json<RequestVoteRequest>,
) -> std::result::Result<Json<RequestVoteResponse>, StatusCode> {
    handle.request_vote(req).await.map(Json).map_err(unavailable)
}

async fn append_entries<O: Send + 'static>(
    State(handle): State<RaftHandle<O>>,
    Json(req): Json<AppendEntriesRequest>,
) -> std::result::Result<Json<AppendEntriesResponse>, StatusCode> {
    handle.append_entries(req).await.map(Json).map_err(unavailable)
}

async fn install_snapshot<O: Send + 'static>(
    State(handle): State<RaftHandle<O>>,
    Json(req): Json<InstallSnapshotRequest>,
) -> std::result::Result<Json<InstallSnapshotResponse>, StatusCode> {
    handle.install_snapshot(req).await.map(Json).map_err(unavailable)
}

async fn join<O: Send + 'static>(
    State(handle): State<RaftHandle<O>>,
    Json(req): Json<JoinRequest>,
) -> Json<JoinResponse> {
    Json(handle.handle_join(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::raft::{LogIndex, MemStorage, RaftConfig, RaftNode, StateMachine, Voters};
    use axum::body::Body;
    use axum::http::Request;
    use parking_lot::RwLock;
    use std::sync::Arc;
    use tower::ServiceExt;

    #[derive(Default)]
    struct Counter(u64);

    impl StateMachine for Counter {
        type Output = u64;

        fn apply(&mut self, _index: LogIndex, _command: &[u8]) -> u64 {
            self.0 += 1;
            self.0
        }

        fn snapshot(&self) -> Result<Vec<u8>> {
            Ok(serde_json::to_vec(&self.0)?)
        }

        fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
            self.0 = serde_json::from_slice(snapshot)?;
            Ok(())
        }
    }

    async fn serve_node(id: &str) -> (RaftHandle<u64>, String, broadcast::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let config = RaftConfig {
            node_id: id.to_string(),
            advertise_addr: addr.clone(),
            election_timeout_min: Duration::from_millis(200),
            election_timeout_max: Duration::from_millis(400),
            heartbeat_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let transport = Arc::new(HttpTransport::new(config.rpc_timeout).unwrap());
        let handle = RaftNode::spawn(
            config,
            Arc::new(MemStorage::new()),
            transport,
            Arc::new(RwLock::new(Counter::default())),
        )
        .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(serve(listener, raft_router(handle.clone()), shutdown_rx));
        (handle, addr, shutdown_tx)
    }

    #[tokio::test]
    async fn test_vote_endpoint_roundtrip() {
        let (handle, _, _shutdown) = serve_node("solo").await;
        let router = raft_router(handle);

        let req = RequestVoteRequest {
            term: 3,
            candidate_id: "other".into(),
            last_log_index: 0,
            last_log_term: 0,
        };
        let response = router
            .oneshot(
                Request::post(raft_paths::REQUEST_VOTE)
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&req).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let vote: RequestVoteResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(vote, RequestVoteResponse { term: 3, vote_granted: true });
    }

    #[tokio::test]
    async fn test_malformed_body_rejected() {
        let (handle, _, _shutdown) = serve_node("solo").await;
        let response = raft_router(handle)
            .oneshot(
                Request::post(raft_paths::APPEND_ENTRIES)
                    .header("content-type", "application/json")
                    .body(Body::from("{\"term\":\"soon\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_two_nodes_join_over_http() {
        let (first, first_addr, _s1) = serve_node("first").await;
        let (second, second_addr, _s2) = serve_node("second").await;

        first
            .bootstrap(Voters::from([("first".to_string(), first_addr.clone())]))
            .await
            .unwrap();
        assert!(first.wait_for_leader(Duration::from_secs(3)).await.is_some());

        let client = HttpTransport::new(Duration::from_secs(2)).unwrap();
        let resp = client
            .join(
                &first_addr,
                JoinRequest {
                    node_id: "second".into(),
                    addr: second_addr,
                },
            )
            .await
            .unwrap();
        assert!(resp.accepted, "join refused: {:?}", resp.error);

        let applied = first.propose(b"tick".to_vec(), Duration::from_secs(3)).await.unwrap();
        assert_eq!(applied, 1);
        let status = second.wait_for_leader(Duration::from_secs(3)).await.unwrap();
        assert_eq!(status.leader_addr.as_deref(), Some(first_addr.as_str()));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_network_error() {
        let client = HttpTransport::new(Duration::from_millis(300)).unwrap();
        let err = client
            .join(
                "127.0.0.1:1",
                JoinRequest {
                    node_id: "x".into(),
                    addr: "127.0.0.1:2".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
