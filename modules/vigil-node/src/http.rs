//! Read-only status listener. The full admin surface lives elsewhere;
//! this exposes just enough to see a node's health from the outside.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use vigil_cluster::{ClusterState, NodeTable, Role};

#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<ClusterState>,
    pub nodes: Arc<NodeTable>,
}

pub fn router(cluster: Arc<ClusterState>, nodes: Arc<NodeTable>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/cluster/status", get(cluster_status))
        .route("/projects", get(projects))
        .with_state(AppState { cluster, nodes })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn cluster_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let role = match state.cluster.role() {
        Role::Leader => "leader",
        Role::Follower => "follower",
    };
    Json(json!({
        "node_id": state.cluster.node_id,
        "role": role,
        "version": state.cluster.version_string(),
        "current": state.cluster.current_version(),
        "apply_failures": state.cluster.apply_failures(),
        "online_nodes": state.nodes.online_count(),
        "nodes": state.nodes.snapshot(),
    }))
}

async fn projects(State(state): State<AppState>) -> Json<serde_json::Value> {
    let runtime = state.cluster.runtime();
    let snapshots = runtime.snapshots();
    let stats = runtime.stats().await;
    Json(json!({
        "projects": snapshots,
        "runtime": stats,
    }))
}
