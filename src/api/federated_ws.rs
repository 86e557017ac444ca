// Downstream endpoint that fans one user turn out across several gateways
// and interleaves the tagged response streams on a single socket.
use crate::api::chat_ws::{DOWNSTREAM_QUEUE_SIZE, IDLE_TIMEOUT_MS};
use crate::filter::strip_thinking_tags;
use crate::gateway::{GatewayConnection, EVENT_CHAT, EVENT_CONNECTED};
use crate::state::AppState;
use crate::storage::{ContentBlock, FederatedTarget, MessageRole};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::{routing::get, Router};
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/federated", get(federated_ws))
}

#[derive(Debug, Deserialize)]
struct FederatedEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    targets: Vec<FederatedTarget>,
    /// Advisory only; `targets` stays the source of truth either way.
    #[serde(default)]
    #[allow(dead_code)]
    broadcast: Option<bool>,
    #[serde(default, alias = "federatedId")]
    federated_id: Option<String>,
}

/// Session keys this socket has fanned out to, per gateway, plus the
/// per-turn completion bookkeeping.
#[derive(Default)]
struct FanoutState {
    targets: HashSet<(String, String)>,
    awaiting_final: HashSet<(String, String)>,
}

type SharedFanout = Arc<parking_lot::Mutex<FanoutState>>;

async fn federated_ws(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(DOWNSTREAM_QUEUE_SIZE);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let _ = send_json(&out_tx, json!({ "type": "connected", "federated": true })).await;

    let fanout: SharedFanout = Arc::new(parking_lot::Mutex::new(FanoutState::default()));
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        let next = match timeout(Duration::from_millis(IDLE_TIMEOUT_MS), ws_receiver.next()).await
        {
            Ok(frame) => frame,
            Err(_) => {
                debug!("federated downstream idle, closing");
                let _ = out_tx.send(Message::Close(None)).await;
                break;
            }
        };
        let Some(Ok(message)) = next else {
            break;
        };
        match message {
            Message::Text(text) => {
                let envelope: FederatedEnvelope = match serde_json::from_str(&text) {
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
                        let Some(message) = envelope.message else {
                            let _ = send_json(
                                &out_tx,
                                json!({ "type": "error", "error": "message required" }),
                            )
                            .await;
                            continue;
                        };
                        let targets = normalize_targets(envelope.targets);
                        if targets.is_empty() {
                            let _ = send_json(
                                &out_tx,
                                json!({ "type": "error", "error": "targets required" }),
                            )
                            .await;
                            continue;
                        }
                        if let Some(federated_id) = envelope.federated_id.as_deref() {
                            if let Err(err) = state.storage.touch_federated_session(federated_id) {
                                debug!(error = %err, "federated session touch failed");
                            }
                        }
                        dispatch_turn(
                            &state,
                            &fanout,
                            &mut forwarders,
                            &out_tx,
                            targets,
                            &message,
                        )
                        .await;
                    }
                    "abort" => {
                        let targets = normalize_targets(envelope.targets);
                        let mut aborts = Vec::new();
                        for target in targets {
                            if let Some(connection) = state.gateways.get(&target.gateway_id).await
                            {
                                aborts.push(async move {
                                    let _ = connection.abort(&target.session_key).await;
                                });
                            }
                        }
                        tokio::spawn(async move {
                            join_all(aborts).await;
                        });
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

    for (_, forwarder) in forwarders {
        forwarder.abort();
    }
    drop(out_tx);
    let _ = writer.await;
}

/// Fans one user turn out to every target. Missing gateways produce a tagged
/// error and never block the rest; each reachable target gets the user
/// message persisted exactly once.
async fn dispatch_turn(
    state: &Arc<AppState>,
    fanout: &SharedFanout,
    forwarders: &mut HashMap<String, JoinHandle<()>>,
    out_tx: &mpsc::Sender<Message>,
    targets: Vec<FederatedTarget>,
    message: &str,
) {
    let mut sends = Vec::new();
    for target in targets {
        let Some(connection) = state.gateways.get(&target.gateway_id).await else {
            let _ = send_json(
                out_tx,
                json!({
                    "type": "stream",
                    "state": "error",
                    "error": "gateway not registered",
                    "source": { "gateway_id": target.gateway_id, "agent_name": "?" },
                }),
            )
            .await;
            continue;
        };
        if !forwarders.contains_key(&target.gateway_id) {
            let handle = tokio::spawn(forward_source_events(
                connection.clone(),
                state.clone(),
                fanout.clone(),
                out_tx.clone(),
            ));
            forwarders.insert(target.gateway_id.clone(), handle);
        }
        {
            let mut guard = fanout.lock();
            let pair = (target.gateway_id.clone(), target.session_key.clone());
            guard.targets.insert(pair.clone());
            guard.awaiting_final.insert(pair);
        }
        if let Err(err) = state.storage.append_message(
            &target.gateway_id,
            &target.session_key,
            MessageRole::User,
            &[ContentBlock::text(message)],
            None,
        ) {
            warn!(gateway = %target.gateway_id, error = %err, "user message persist failed");
        }
        let out_tx = out_tx.clone();
        let fanout = fanout.clone();
        let message = message.to_string();
        sends.push(async move {
            if let Err(err) = connection.send_chat(&target.session_key, &message, None).await {
                fanout
                    .lock()
                    .awaiting_final
                    .remove(&(target.gateway_id.clone(), target.session_key.clone()));
                let agent_name = connection
                    .snapshot()
                    .default_agent_id()
                    .unwrap_or_else(|| "?".to_string());
                let _ = send_json(
                    &out_tx,
                    json!({
                        "type": "stream",
                        "state": "error",
                        "error": err.to_string(),
                        "source": { "gateway_id": target.gateway_id, "agent_name": agent_name },
                    }),
                )
                .await;
            }
        });
    }
    tokio::spawn(async move {
        join_all(sends).await;
    });
}

/// Re-emits one gateway's chat events with a source tag, and announces
/// upstream recoveries.
async fn forward_source_events(
    connection: Arc<GatewayConnection>,
    state: Arc<AppState>,
    fanout: SharedFanout,
    out_tx: mpsc::Sender<Message>,
) {
    let gateway_id = connection.gateway_id().to_string();
    let mut events = connection.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(gateway = %gateway_id, skipped, "federated event stream lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        if event.event == EVENT_CONNECTED {
            let frame = json!({ "type": "reconnected", "gateway_id": gateway_id });
            if send_json(&out_tx, frame).await.is_err() {
                break;
            }
            continue;
        }
        if event.event != EVENT_CHAT {
            continue;
        }
        let Some(payload) = event.chat_payload() else {
            continue;
        };
        let Some(session_key) = payload.session_key.clone() else {
            continue;
        };
        let pair = (gateway_id.clone(), session_key.clone());
        if !fanout.lock().targets.contains(&pair) {
            continue;
        }
        let agent_name = payload
            .agent_name
            .clone()
            .or_else(|| connection.snapshot().default_agent_id())
            .unwrap_or_else(|| "?".to_string());
        let source = json!({ "gateway_id": gateway_id, "agent_name": agent_name });
        let frame = match payload.state.as_deref() {
            Some("delta") => json!({
                "type": "stream",
                "state": "delta",
                "text": payload.text.clone().unwrap_or_default(),
                "source": source,
            }),
            Some("final") => {
                fanout.lock().awaiting_final.remove(&pair);
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
                    "text": text,
                    "source": source,
                })
            }
            Some("error") => {
                fanout.lock().awaiting_final.remove(&pair);
                json!({
                    "type": "stream",
                    "state": "error",
                    "error": payload.error_message(),
                    "source": source,
                })
            }
            _ => continue,
        };
        if send_json(&out_tx, frame).await.is_err() {
            break;
        }
    }
}

fn normalize_targets(targets: Vec<FederatedTarget>) -> Vec<FederatedTarget> {
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|target| {
            !target.gateway_id.trim().is_empty() && !target.session_key.trim().is_empty()
        })
        .filter(|target| seen.insert((target.gateway_id.clone(), target.session_key.clone())))
        .collect()
}

async fn send_json(out_tx: &mpsc::Sender<Message>, value: Value) -> Result<(), ()> {
    out_tx
        .send(Message::Text(value.to_string().into()))
        .await
        .map_err(|_| ())
}
