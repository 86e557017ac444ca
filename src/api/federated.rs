// REST surface for federated sessions.
use crate::api::errors::{bad_request, internal_error, not_found};
use crate::state::AppState;
use crate::storage::FederatedTarget;
use axum::extract::{Path as AxumPath, State};
use axum::response::Response;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/federated-sessions",
            get(list_federated_sessions).post(create_federated_session),
        )
        .route(
            "/api/federated-sessions/{id}",
            get(get_federated_session).delete(delete_federated_session),
        )
}

#[derive(Debug, Deserialize)]
struct CreateFederatedRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    gateways: Vec<FederatedTarget>,
}

async fn create_federated_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateFederatedRequest>,
) -> Result<Json<Value>, Response> {
    let targets = payload
        .gateways
        .into_iter()
        .filter(|target| {
            !target.gateway_id.trim().is_empty() && !target.session_key.trim().is_empty()
        })
        .collect::<Vec<_>>();
    if targets.is_empty() {
        return Err(bad_request("at least one gateway target is required"));
    }
    let record = state
        .storage
        .create_federated_session(payload.title.as_deref(), &targets)
        .map_err(internal_error)?;
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

async fn list_federated_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, Response> {
    let records = state
        .storage
        .list_federated_sessions()
        .map_err(internal_error)?;
    Ok(Json(serde_json::to_value(records).unwrap_or(Value::Null)))
}

async fn get_federated_session(
    State(state): State<Arc<AppState>>,
    AxumPath(federated_id): AxumPath<String>,
) -> Result<Json<Value>, Response> {
    let record = state
        .storage
        .get_federated_session(&federated_id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("federated session not found"))?;
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

async fn delete_federated_session(
    State(state): State<Arc<AppState>>,
    AxumPath(federated_id): AxumPath<String>,
) -> Result<Json<Value>, Response> {
    let deleted = state
        .storage
        .delete_federated_session(&federated_id)
        .map_err(internal_error)?;
    if !deleted {
        return Err(not_found("federated session not found"));
    }
    Ok(Json(json!({ "ok": true })))
}
