// Downstream chat endpoint for a single gateway. Forwards user turns
// upstream, streams deltas/finals back and persists the durable halves of
// the transcript.
use crate::filter::strip_thinking_tags;
use crate::gateway::{GatewayConnection, EVENT_CHAT};
use crate::state::AppState;
use crate::storage::{ContentBlock, MessageRole};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, State};
use axum::response::Response;
use axum::{routing::get, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

pub const DOWNSTREAM_QUEUE_SIZE: usize = 64;
/// Clients ping roughly every 30s; three missed windows closes the socket.
pub const IDLE_TIMEOUT_MS: u64 = 90_000;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/{gateway_id}", get(chat_ws))
}

#[derive(Debug, Deserialize)]
struct ClientEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, alias = "sessionKey")]
    session_key: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default, alias = "advancedReasoning")]
    advanced_reasoning: Option<bool>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn chat_ws(
    State(state): State<Arc<AppState>>,
    AxumPath(gateway_id): AxumPath<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state, gateway_id))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>, gateway_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let Some(connection) = state.gateways.get(&gateway_id).await else {
        let _ = ws_sender
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "unknown gateway".into(),
            })))
            .await;
        return;
    };

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(DOWNSTREAM_QUEUE_SIZE);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    // The proxy side is ready even while the upstream is still backing off;
    // the snapshot reflects the last successful handshake.
    let snapshot = connection.snapshot();
    let _ = send_json(
        &out_tx,
        json!({
            "type": "connected",
            "agents": snapshot.agents,
            "models": snapshot.models,
            "defaultModel": snapshot.default_model,
        }),
    )
    .await;

    let active_sessions: Arc<parking_lot::Mutex<HashSet<String>>> =
        Arc::new(parking_lot::Mutex::new(HashSet::new()));
    let forwarder = tokio::spawn(forward_chat_events(
        connection.clone(),
        state.clone(),
        gateway_id.clone(),
        active_sessions.clone(),
        out_tx.clone(),
    ));

    loop {
        let next = match timeout(Duration::from_millis(IDLE_TIMEOUT_MS), ws_receiver.next()).await
        {
            Ok(frame) => frame,
            Err(_) => {
                debug!(gateway = %gateway_id, "downstream idle, closing");
                let _ = out_tx.send(Message::Close(None)).await;
                break;
            }
        };
        let Some(Ok(message)) = next else {
            break;
        };
        match message {
            Message::Text(text) => {
                let envelope: ClientEnvelope = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(err) => {
                        let _ = send_json(
                            &out_tx,
                            json!({ "type": "error", "error": format!("invalid payload: {err}") }),
                        )
                        .await;
                        continue;
                    }
                };
                match envelope.kind.trim().to_ascii_lowercase().as_str() {
                    "ping" => {
                        let _ = send_json(&out_tx, json!({ "type": "pong" })).await;
                    }
                    "chat" => {
                        let Some((session_key, message)) = envelope
                            .session_key
                            .as_deref()
                            .map(str::trim)
                            .filter(|value| !value.is_empty())
                            .zip(envelope.message.as_deref())
                        else {
                            let _ = send_json(
                                &out_tx,
                                json!({ "type": "error", "error": "sessionKey and message required" }),
                            )
                            .await;
                            continue;
                        };
                        active_sessions.lock().insert(session_key.to_string());
                        if let Err(err) = state.storage.append_message(
                            &gateway_id,
                            session_key,
                            MessageRole::User,
                            &[ContentBlock::text(message)],
                            None,
                        ) {
                            warn!(gateway = %gateway_id, error = %err, "user message persist failed");
                        }
                        let connection = connection.clone();
                        let out_tx = out_tx.clone();
                        let session_key = session_key.to_string();
                        let message = message.to_string();
                        let advanced_reasoning = envelope.advanced_reasoning;
                        tokio::spawn(async move {
                            if let Err(err) = connection
                                .send_chat(&session_key, &message, advanced_reasoning)
                                .await
                            {
                                let _ = send_json(
                                    &out_tx,
                                    json!({
                                        "type": "stream",
                                        "state": "error",
                                        "sessionKey": session_key,
                                        "error": err.to_string(),
                                    }),
                                )
                                .await;
                            }
                        });
                    }
                    "abort" => {
                        let Some(session_key) = clean(envelope.session_key.as_deref()) else {
                            continue;
                        };
                        let connection = connection.clone();
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = connection.abort(&session_key).await {
                                let _ = send_json(
                                    &out_tx,
                                    json!({
                                        "type": "stream",
                                        "state": "error",
                                        "sessionKey": session_key,
                                        "error": err.to_string(),
                                    }),
                                )
                                .await;
                            }
                        });
                    }
                    "set_reasoning" => {
                        let Some(session_key) = clean(envelope.session_key.as_deref()) else {
                            continue;
                        };
                        let enabled = envelope.enabled.unwrap_or(false);
                        let connection = connection.clone();
                        // No downstream echo for reasoning toggles.
                        tokio::spawn(async move {
                            if let Err(err) = connection.set_reasoning(&session_key, enabled).await
                            {
                                debug!(error = %err, "set_reasoning failed");
                            }
                        });
                    }
                    "history" => {
                        let Some(session_key) = clean(envelope.session_key.as_deref()) else {
                            continue;
                        };
                        let messages = state
                            .storage
                            .list_messages(&gateway_id, &session_key, envelope.limit, None)
                            .unwrap_or_default();
                        let _ = send_json(
                            &out_tx,
                            json!({
                                "type": "history",
                                "sessionKey": session_key,
                                "messages": messages,
                            }),
                        )
                        .await;
                    }
                    other => {
                        let _ = send_json(
                            &out_tx,
                            json!({ "type": "error", "error": format!("unsupported type: {other}") }),
                        )
                        .await;
                    }
                }
            }
            Message::Ping(data) => {
                let _ = out_tx.send(Message::Pong(data)).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    forwarder.abort();
    drop(out_tx);
    let _ = writer.await;
}

/// Pumps upstream chat events to the downstream socket. Events for session
/// keys this client never used are dropped; finals are filtered and
/// persisted before emission.
async fn forward_chat_events(
    connection: Arc<GatewayConnection>,
    state: Arc<AppState>,
    gateway_id: String,
    active_sessions: Arc<parking_lot::Mutex<HashSet<String>>>,
    out_tx: mpsc::Sender<Message>,
) {
    let mut events = connection.subscribe_named(EVENT_CHAT);
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(gateway = %gateway_id, skipped, "chat event stream lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        let Some(payload) = event.chat_payload() else {
            continue;
        };
        let Some(session_key) = payload.session_key.clone() else {
            continue;
        };
        if !active_sessions.lock().contains(&session_key) {
            continue;
        }
        let frame = match payload.state.as_deref() {
            Some("delta") => json!({
                "type": "stream",
                "state": "delta",
                "sessionKey": session_key,
                "text": payload.text.clone().unwrap_or_default(),
            }),
            Some("final") => {
                let text = strip_thinking_tags(&payload.text.clone().unwrap_or_default());
                if let Err(err) = state.storage.append_message(
                    &gateway_id,
                    &session_key,
                    MessageRole::Assistant,
                    &[ContentBlock::text(text.clone())],
                    None,
                ) {
                    warn!(gateway = %gateway_id, error = %err, "assistant message persist failed");
                }
                json!({
                    "type": "stream",
                    "state": "final",
                    "sessionKey": session_key,
                    "text": text,
                })
            }
            Some("error") => json!({
                "type": "stream",
                "state": "error",
                "sessionKey": session_key,
                "error": payload.error_message(),
            }),
            _ => continue,
        };
        if send_json(&out_tx, frame).await.is_err() {
            break;
        }
    }
}

async fn send_json(out_tx: &mpsc::Sender<Message>, value: Value) -> Result<(), ()> {
    out_tx
        .send(Message::Text(value.to_string().into()))
        .await
        .map_err(|_| ())
}

fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
