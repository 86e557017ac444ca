// REST surface for gateway configs, chat sessions and message history.
use crate::api::errors::{bad_request, internal_error, not_found};
use crate::state::AppState;
use axum::extract::{Path as AxumPath, Query, State};
use axum::response::Response;
use axum::{
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/gateways", get(list_gateways).post(add_gateway))
        .route("/api/gateways/{id}", delete(delete_gateway))
        .route("/api/gateways/{id}/status", get(gateway_status))
        .route(
            "/api/gateways/{id}/sessions",
            get(list_sessions).post(create_session),
        )
        .route(
            "/api/gateways/{id}/sessions/{key}",
            get(get_session).delete(delete_session),
        )
        .route(
            "/api/gateways/{id}/sessions/{key}/messages",
            get(list_messages),
        )
}

#[derive(Debug, Deserialize)]
struct AddGatewayRequest {
    id: String,
    name: String,
    url: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    session_key: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    before: Option<i64>,
}

async fn list_gateways(State(state): State<Arc<AppState>>) -> Result<Json<Value>, Response> {
    let stored = state.storage.list_gateways().map_err(internal_error)?;
    let mut records = Vec::with_capacity(stored.len());
    for record in stored {
        let connected = state
            .gateways
            .get(&record.id)
            .await
            .map(|connection| connection.is_connected())
            .unwrap_or(false);
        records.push(json!({
            "id": record.id,
            "name": record.name,
            "url": record.url,
            "connected": connected,
            "createdAt": record.created_at,
        }));
    }
    Ok(Json(Value::Array(records)))
}

async fn add_gateway(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AddGatewayRequest>,
) -> Result<Json<Value>, Response> {
    let gateway_id = payload.id.trim().to_string();
    let name = payload.name.trim().to_string();
    let url = payload.url.trim().to_string();
    if gateway_id.is_empty() || name.is_empty() || url.is_empty() {
        return Err(bad_request("id, name and url are required"));
    }
    let parsed = url::Url::parse(&url).map_err(|_| bad_request("invalid gateway url"))?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(bad_request("gateway url must be ws:// or wss://"));
    }
    let record = state
        .gateways
        .register(
            &gateway_id,
            &name,
            &url,
            payload.token.as_deref().map(str::trim).filter(|value| !value.is_empty()),
            payload
                .password
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty()),
        )
        .await
        .map_err(|err| {
            if err.downcast_ref::<crate::storage::AlreadyExists>().is_some() {
                bad_request("gateway already exists")
            } else {
                internal_error(err)
            }
        })?;
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

async fn delete_gateway(
    State(state): State<Arc<AppState>>,
    AxumPath(gateway_id): AxumPath<String>,
) -> Result<Json<Value>, Response> {
    let deleted = state
        .gateways
        .unregister(&gateway_id)
        .await
        .map_err(internal_error)?;
    if !deleted {
        return Err(not_found("gateway not found"));
    }
    Ok(Json(json!({ "ok": true })))
}

async fn gateway_status(
    State(state): State<Arc<AppState>>,
    AxumPath(gateway_id): AxumPath<String>,
) -> Result<Json<Value>, Response> {
    let status = state
        .gateways
        .status(&gateway_id)
        .await
        .ok_or_else(|| not_found("gateway not found"))?;
    Ok(Json(serde_json::to_value(status).unwrap_or(Value::Null)))
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    AxumPath(gateway_id): AxumPath<String>,
) -> Result<Json<Value>, Response> {
    require_gateway(&state, &gateway_id)?;
    let sessions = state
        .storage
        .list_sessions(&gateway_id)
        .map_err(internal_error)?;
    Ok(Json(serde_json::to_value(sessions).unwrap_or(Value::Null)))
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    AxumPath(gateway_id): AxumPath<String>,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<Json<Value>, Response> {
    require_gateway(&state, &gateway_id)?;
    let session_key = payload
        .session_key
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("sess_{}", Uuid::new_v4().simple()));
    let session = state
        .storage
        .upsert_session(
            &gateway_id,
            &session_key,
            payload.agent_id.as_deref(),
            payload.model.as_deref(),
            payload.title.as_deref(),
        )
        .map_err(internal_error)?;
    Ok(Json(serde_json::to_value(session).unwrap_or(Value::Null)))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    AxumPath((gateway_id, session_key)): AxumPath<(String, String)>,
) -> Result<Json<Value>, Response> {
    require_gateway(&state, &gateway_id)?;
    let session = state
        .storage
        .get_session(&gateway_id, &session_key)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("session not found"))?;
    Ok(Json(serde_json::to_value(session).unwrap_or(Value::Null)))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    AxumPath((gateway_id, session_key)): AxumPath<(String, String)>,
) -> Result<Json<Value>, Response> {
    require_gateway(&state, &gateway_id)?;
    let deleted = state
        .storage
        .delete_session(&gateway_id, &session_key)
        .map_err(internal_error)?;
    if !deleted {
        return Err(not_found("session not found"));
    }
    Ok(Json(json!({ "ok": true })))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    AxumPath((gateway_id, session_key)): AxumPath<(String, String)>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Value>, Response> {
    require_gateway(&state, &gateway_id)?;
    if state
        .storage
        .get_session(&gateway_id, &session_key)
        .map_err(internal_error)?
        .is_none()
    {
        return Err(not_found("session not found"));
    }
    let messages = state
        .storage
        .list_messages(&gateway_id, &session_key, query.limit, query.before)
        .map_err(internal_error)?;
    Ok(Json(serde_json::to_value(messages).unwrap_or(Value::Null)))
}

fn require_gateway(state: &Arc<AppState>, gateway_id: &str) -> Result<(), Response> {
    match state.storage.get_gateway(gateway_id) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(not_found("gateway not found")),
        Err(err) => Err(internal_error(err)),
    }
}
