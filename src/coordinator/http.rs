//! HTTP API of a coordinator node
//!
//! Start/forget/query for both workloads, a current-op listing, replica
//! admin endpoints, health and Prometheus metrics. Errors are returned as
//! `{error, code, retryable}` with a status derived from the error kind.

use crate::common::metrics::write_prometheus;
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::Error;
use crate::coordinator::replica::ReplicaNode;
use crate::coordinator::service::Coordinator;
use crate::workloads::{
    validate_tenant_id, ChangeStreamStateRequest, ChangeStreamStateWorkload,
    MigrationRecipientWorkload, RecipientSyncRequest,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared node state for HTTP handlers.
#[derive(Clone)]
pub struct NodeState {
    pub node: Arc<ReplicaNode>,
    pub migrations: Arc<Coordinator<MigrationRecipientWorkload>>,
    pub change_streams: Arc<Coordinator<ChangeStreamStateWorkload>>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
            "retryable": self.is_retryable(),
        }));
        (status, body).into_response()
    }
}

pub fn create_router(state: NodeState) -> Router {
    Router::new()
        .route("/migrations", post(recipient_sync_data))
        .route("/migrations/:id", get(get_migration))
        .route("/migrations/:id/forget", post(forget_migration))
        .route(
            "/tenants/:tenant/change-streams",
            get(get_change_stream_state).put(set_change_stream_state),
        )
        .route("/admin/current-op", get(current_op))
        .route("/admin/step-up", post(step_up))
        .route("/admin/step-down", post(step_down))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(axum::middleware::from_fn(request_tracing_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

/// Start or rejoin a migration; returns once the recipient is consistent
async fn recipient_sync_data(
    State(state): State<NodeState>,
    Json(request): Json<RecipientSyncRequest>,
) -> Result<impl IntoResponse, Error> {
    let report = state.migrations.start(request).await?;
    Ok(Json(report))
}

async fn get_migration(
    State(state): State<NodeState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.migrations.query(&id)?))
}

async fn forget_migration(
    State(state): State<NodeState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.migrations.forget(&id).await?;
    Ok(Json(json!({ "status": "forgotten", "instanceID": id })))
}

#[derive(Debug, Deserialize)]
struct SetChangeStreamBody {
    enabled: bool,
}

async fn set_change_stream_state(
    State(state): State<NodeState>,
    Path(tenant): Path<String>,
    Json(body): Json<SetChangeStreamBody>,
) -> Result<impl IntoResponse, Error> {
    let report = state
        .change_streams
        .start(ChangeStreamStateRequest {
            tenant_id: tenant,
            enabled: body.enabled,
        })
        .await?;
    Ok(Json(report))
}

async fn get_change_stream_state(
    State(state): State<NodeState>,
    Path(tenant): Path<String>,
) -> Result<impl IntoResponse, Error> {
    validate_tenant_id(&tenant)?;
    let enabled = state.change_streams.workload().change_stream_state(&tenant);
    Ok(Json(json!({ "tenantId": tenant, "enabled": enabled })))
}

/// Every operation this node is driving right now
async fn current_op(State(state): State<NodeState>) -> impl IntoResponse {
    let mut inprog = state.migrations.current_op();
    inprog.extend(state.change_streams.current_op());
    Json(json!({ "inprog": inprog }))
}

async fn step_up(State(state): State<NodeState>) -> impl IntoResponse {
    let term = state.node.step_up();
    Json(json!({ "role": state.node.role(), "term": term }))
}

async fn step_down(State(state): State<NodeState>) -> impl IntoResponse {
    state.node.step_down(None);
    Json(json!({ "role": state.node.role(), "term": state.node.term() }))
}

async fn health(State(state): State<NodeState>) -> impl IntoResponse {
    let replica = state.node.state();
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "node_id": state.node.node_id(),
            "role": replica.role,
            "term": replica.term,
            "primary": replica.primary,
            "in_flight": state.migrations.metrics().in_flight.get()
                + state.change_streams.metrics().in_flight.get(),
            "version": crate::VERSION,
        })),
    )
}

/// Prometheus text exposition
async fn metrics(State(state): State<NodeState>) -> impl IntoResponse {
    let replica = state.node.state();
    let mut out = String::new();
    out += "# HELP minicoord_replica_term Current replica set term\n";
    out += "# TYPE minicoord_replica_term gauge\n";
    out += &format!("minicoord_replica_term {}\n", replica.term);
    out += "# HELP minicoord_is_primary Whether this node is primary\n";
    out += "# TYPE minicoord_is_primary gauge\n";
    out += &format!(
        "minicoord_is_primary {}\n",
        u8::from(state.node.is_primary())
    );
    out += "# HELP minicoord_uptime_seconds Seconds since the node started\n";
    out += "# TYPE minicoord_uptime_seconds gauge\n";
    out += &format!(
        "minicoord_uptime_seconds {}\n",
        state.migrations.metrics().uptime_seconds()
    );
    write_prometheus(
        &mut out,
        &[
            state.migrations.metrics().as_ref(),
            state.change_streams.metrics().as_ref(),
        ],
    );

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        out,
    )
}
