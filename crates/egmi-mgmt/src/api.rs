//! Admin REST API.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{MgmtError, MgmtResult};
use crate::reconcile::ManagementService;

#[derive(Debug, Clone, Deserialize)]
pub struct NameRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub last_line: usize,
}

pub fn router(service: Arc<ManagementService>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/get-status", get(status_handler))
        .route("/get-master", get(master_handler))
        .route("/get-messages", get(messages_handler))
        .route("/action/add-node", post(add_node_handler))
        .route("/action/add-volume", post(add_volume_handler))
        .route("/action/start-volume", post(start_volume_handler))
        .route("/action/stop-volume", post(stop_volume_handler))
        .route("/action/delete-volume", post(delete_volume_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serves the API on `addr` until `cancel` fires.
pub async fn serve(service: Arc<ManagementService>, addr: SocketAddr, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Admin API listening on {}", addr);

    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

fn ko(e: &MgmtError) -> Value {
    json!({ "status": "KO", "error": e.to_string() })
}

fn action_reply(action: &str, result: MgmtResult<()>) -> Json<Value> {
    match result {
        Ok(()) => Json(json!({ "status": "OK" })),
        Err(e) => {
            warn!("{} failed: {}", action, e);
            Json(ko(&e))
        }
    }
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}

async fn status_handler(State(service): State<Arc<ManagementService>>) -> Json<Value> {
    match service.get_system_status() {
        Ok(status) => match serde_json::to_value(status.as_ref()) {
            Ok(value) => Json(value),
            Err(e) => Json(json!({ "status": "KO", "error": e.to_string() })),
        },
        Err(MgmtError::Initializing) => Json(json!({ "clear": "init", "processingPending": false })),
        Err(e) => Json(ko(&e)),
    }
}

async fn master_handler(State(service): State<Arc<ManagementService>>) -> Json<Value> {
    let master = service.master_hostname();
    Json(json!({
        "status": "OK",
        "master": service.is_master(),
        "master_url": service.config().master_url(&master),
    }))
}

async fn messages_handler(
    State(service): State<Arc<ManagementService>>,
    Query(query): Query<MessagesQuery>,
) -> Json<Value> {
    let (lines, last_line) = service.messages().lines_since(query.last_line);
    Json(json!({ "status": "OK", "lines": lines, "last_line": last_line }))
}

async fn add_node_handler(
    State(service): State<Arc<ManagementService>>,
    Json(req): Json<NameRequest>,
) -> Json<Value> {
    action_reply("add-node", service.add_node(&req.name).await)
}

async fn add_volume_handler(
    State(service): State<Arc<ManagementService>>,
    Json(req): Json<NameRequest>,
) -> Json<Value> {
    action_reply("add-volume", service.add_volume(&req.name).await)
}

async fn start_volume_handler(
    State(service): State<Arc<ManagementService>>,
    Json(req): Json<NameRequest>,
) -> Json<Value> {
    action_reply("start-volume", service.start_volume(&req.name).await)
}

async fn stop_volume_handler(
    State(service): State<Arc<ManagementService>>,
    Json(req): Json<NameRequest>,
) -> Json<Value> {
    action_reply("stop-volume", service.stop_volume(&req.name).await)
}

async fn delete_volume_handler(
    State(service): State<Arc<ManagementService>>,
    Json(req): Json<NameRequest>,
) -> Json<Value> {
    action_reply("delete-volume", service.delete_volume(&req.name).await)
}
