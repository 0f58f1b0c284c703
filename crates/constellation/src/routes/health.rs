//! Health check endpoints.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use constellation_common::LeaseType;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    node: String,
}

/// Basic health check (is the agent running?)
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        node: state.node_name().to_string(),
    })
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    leader: String,
    is_leader: bool,
    members: usize,
    leases: Vec<LeaseType>,
}

/// Readiness check: a consensus leader is known
pub async fn ready_check(State(state): State<AppState>) -> Result<Json<ReadyResponse>, StatusCode> {
    let Some(leader) = state.consensus.leader_id() else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let leases = LeaseType::ALL
        .into_iter()
        .filter(|t| state.consensus.has_lease(*t))
        .collect();

    Ok(Json(ReadyResponse {
        status: "ready",
        leader,
        is_leader: state.consensus.is_leader(),
        members: state.cluster.members().len(),
        leases,
    }))
}

#[cfg(test)]
mod tests {
    use crate::cluster::{Cluster, GossipConfig};
    use crate::config::AppConfig;
    use crate::consensus::LeaseManager;
    use crate::consensus::manager::tests::{launch, single_leader, test_config};
    use crate::consensus::raft::rpc::testing::LocalNetwork;
    use crate::consensus::ConsensusManager;
    use crate::routes::create_router;
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app_state(consensus: Arc<ConsensusManager>) -> AppState {
        let cluster = Cluster::start(GossipConfig {
            node_name: consensus.node_name().to_string(),
            bind_addr: "127.0.0.1".into(),
            bind_port: 0,
            ..Default::default()
        })
        .await
        .unwrap();
        let leases = LeaseManager::start(consensus.clone(), Duration::from_secs(60));
        AppState::new(AppConfig::default(), Arc::new(cluster), consensus, leases)
    }

    async fn get(state: AppState, path: &str) -> (StatusCode, serde_json::Value) {
        let response = create_router(state)
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_reports_node() {
        let state = app_state(single_leader("node-1").await).await;
        let (status, body) = get(state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["node"], "node-1");
    }

    #[tokio::test]
    async fn test_ready_with_leader() {
        let consensus = single_leader("node-1").await;
        let state = app_state(consensus.clone()).await;
        state.leases.acquire_dns_writer_lease().await.unwrap();

        let (status, body) = get(state, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["leader"], "node-1");
        assert_eq!(body["is_leader"], true);
        assert_eq!(body["members"], 1);
        assert_eq!(body["leases"], serde_json::json!(["dns_writer"]));
    }

    #[tokio::test]
    async fn test_not_ready_without_leader() {
        let network = LocalNetwork::new();
        let consensus = launch(&network, test_config("lonely"));
        let (status, _) = get(app_state(consensus).await, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
