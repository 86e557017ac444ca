// One authenticated upstream socket per configured gateway. Owns the
// challenge/connect handshake, request correlation, event fan-out and the
// reconnect ladder.
use crate::gateway::{
    backoff_delay_ms, build_connect_params, build_request_frame, ChatEventPayload,
    ConnectionState, GatewaySnapshot, UpstreamError, UpstreamFrame, CHALLENGE_TIMEOUT_MS,
    DIAL_TIMEOUT_MS, EVENT_CONNECTED, EVENT_CONNECT_CHALLENGE, EVENT_DISCONNECTED,
    EVENT_RECONNECT_FAILED, RECONNECT_MAX_ATTEMPTS, REQUEST_TIMEOUT_MS,
};
use crate::storage::GatewayAuthRecord;
use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const OUTBOUND_QUEUE_SIZE: usize = 64;

/// Typed failure for upstream requests, surfaced to routers and REST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    NotConnected,
    Timeout,
    ConnectionLost,
    Upstream(String),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "gateway not connected"),
            Self::Timeout => write!(f, "request timed out"),
            Self::ConnectionLost => write!(f, "gateway connection lost"),
            Self::Upstream(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for RequestError {}

#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub event: String,
    pub payload: Value,
}

impl GatewayEvent {
    pub fn chat_payload(&self) -> Option<ChatEventPayload> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

type PendingSlot = oneshot::Sender<std::result::Result<Value, RequestError>>;

pub struct GatewayConnection {
    gateway_id: String,
    url: String,
    auth: GatewayAuthRecord,
    instance_id: String,
    state: parking_lot::RwLock<ConnectionState>,
    connected: AtomicBool,
    reconnect_enabled: AtomicBool,
    running: AtomicBool,
    attempts: AtomicU32,
    request_seq: AtomicU64,
    out_tx: parking_lot::Mutex<Option<mpsc::Sender<Message>>>,
    pending: Mutex<HashMap<String, PendingSlot>>,
    snapshot: parking_lot::RwLock<GatewaySnapshot>,
    events_tx: broadcast::Sender<GatewayEvent>,
    named_tx: parking_lot::Mutex<HashMap<String, broadcast::Sender<GatewayEvent>>>,
    reasoning_prefs: parking_lot::Mutex<HashMap<String, bool>>,
}

impl GatewayConnection {
    pub fn new(gateway_id: String, url: String, auth: GatewayAuthRecord) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            gateway_id,
            url,
            auth,
            instance_id: format!("hub_{}", Uuid::new_v4().simple()),
            state: parking_lot::RwLock::new(ConnectionState::Idle),
            connected: AtomicBool::new(false),
            reconnect_enabled: AtomicBool::new(true),
            running: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            request_seq: AtomicU64::new(0),
            out_tx: parking_lot::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            snapshot: parking_lot::RwLock::new(GatewaySnapshot::default()),
            events_tx,
            named_tx: parking_lot::Mutex::new(HashMap::new()),
            reasoning_prefs: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        self.snapshot.read().clone()
    }

    /// All upstream events plus the synthetic lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events_tx.subscribe()
    }

    /// Events of a single name (`chat`, `connected`, ...).
    pub fn subscribe_named(&self, event: &str) -> broadcast::Receiver<GatewayEvent> {
        let mut named = self.named_tx.lock();
        named
            .entry(event.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Starts the connect loop; a no-op when it is already running.
    pub fn start(self: Arc<Self>) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tokio::spawn(async move {
            self.run_loop().await;
        });
    }

    /// Explicit reconnect out of `Terminal`: resets the attempt counter and
    /// dials again.
    pub fn reconnect(self: Arc<Self>) {
        self.attempts.store(0, Ordering::SeqCst);
        self.reconnect_enabled.store(true, Ordering::SeqCst);
        self.start();
    }

    /// Disables reconnect, closes the socket and fails everything pending.
    pub async fn stop(&self) {
        self.reconnect_enabled.store(false, Ordering::SeqCst);
        let sender = self.out_tx.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(Message::Close(None)).await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.fail_pending(RequestError::ConnectionLost).await;
        self.set_state(ConnectionState::Terminal);
    }

    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout_ms: u64,
    ) -> std::result::Result<Value, RequestError> {
        if !self.is_connected() {
            return Err(RequestError::NotConnected);
        }
        let sender = self
            .out_tx
            .lock()
            .clone()
            .ok_or(RequestError::NotConnected)?;
        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);
        let frame = build_request_frame(&request_id, method, params);
        if sender
            .send(Message::Text(frame.to_string().into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&request_id);
            return Err(RequestError::NotConnected);
        }
        match timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::ConnectionLost),
            Err(_) => {
                // Late responses for this id are discarded by the reader.
                self.pending.lock().await.remove(&request_id);
                Err(RequestError::Timeout)
            }
        }
    }

    pub async fn send_chat(
        &self,
        session_key: &str,
        message: &str,
        advanced_reasoning: Option<bool>,
    ) -> std::result::Result<Value, RequestError> {
        let mut params = json!({
            "sessionKey": session_key,
            "message": message,
        });
        if let Some(enabled) = advanced_reasoning {
            params["advancedReasoning"] = Value::Bool(enabled);
        }
        self.request("chat.send", params, REQUEST_TIMEOUT_MS).await
    }

    pub async fn abort(&self, session_key: &str) -> std::result::Result<Value, RequestError> {
        self.request(
            "chat.abort",
            json!({ "sessionKey": session_key }),
            REQUEST_TIMEOUT_MS,
        )
        .await
    }

    /// Remembers the preference so it can be replayed after a reconnect
    /// handshake, then forwards it upstream.
    pub async fn set_reasoning(
        &self,
        session_key: &str,
        enabled: bool,
    ) -> std::result::Result<Value, RequestError> {
        self.reasoning_prefs
            .lock()
            .insert(session_key.to_string(), enabled);
        self.request(
            "chat.set_reasoning",
            json!({ "sessionKey": session_key, "enabled": enabled }),
            REQUEST_TIMEOUT_MS,
        )
        .await
    }

    fn next_request_id(&self) -> String {
        let seq = self.request_seq.fetch_add(1, Ordering::SeqCst);
        format!("req_{}_{}", seq, Utc::now().timestamp_millis())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn dispatch_event(&self, event: &str, payload: Value) {
        let message = GatewayEvent {
            event: event.to_string(),
            payload,
        };
        let _ = self.events_tx.send(message.clone());
        if let Some(sender) = self.named_tx.lock().get(event) {
            let _ = sender.send(message);
        }
    }

    async fn fail_pending(&self, error: RequestError) {
        let slots = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, slot)| slot).collect::<Vec<_>>()
        };
        for slot in slots {
            let _ = slot.send(Err(error.clone()));
        }
    }

    async fn complete_pending(
        &self,
        request_id: &str,
        ok: Option<bool>,
        payload: Option<Value>,
        error: Option<UpstreamError>,
    ) {
        let slot = self.pending.lock().await.remove(request_id);
        let Some(slot) = slot else {
            debug!(gateway = %self.gateway_id, request_id, "discarding late response");
            return;
        };
        let result = if ok == Some(true) {
            Ok(payload.unwrap_or(Value::Null))
        } else {
            let message = error
                .map(|err| err.message())
                .unwrap_or_else(|| "request failed".to_string());
            Err(RequestError::Upstream(message))
        };
        let _ = slot.send(result);
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if !self.reconnect_enabled.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Terminal);
                break;
            }
            self.set_state(ConnectionState::Dialing);
            let outcome = self.run_once().await;
            let was_connected = self.connected.swap(false, Ordering::SeqCst);
            self.fail_pending(RequestError::ConnectionLost).await;
            if was_connected {
                self.dispatch_event(
                    EVENT_DISCONNECTED,
                    json!({ "gatewayId": self.gateway_id }),
                );
            }
            if let Err(err) = &outcome {
                debug!(gateway = %self.gateway_id, error = %err, "upstream session ended");
            }
            if !self.reconnect_enabled.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Terminal);
                break;
            }
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt >= RECONNECT_MAX_ATTEMPTS {
                warn!(gateway = %self.gateway_id, "reconnect attempts exhausted");
                self.set_state(ConnectionState::Terminal);
                self.dispatch_event(
                    EVENT_RECONNECT_FAILED,
                    json!({ "gatewayId": self.gateway_id }),
                );
                break;
            }
            self.set_state(ConnectionState::Backoff);
            tokio::time::sleep(Duration::from_millis(backoff_delay_ms(attempt))).await;
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run_once(&self) -> Result<()> {
        let dial = timeout(
            Duration::from_millis(DIAL_TIMEOUT_MS),
            connect_async(self.url.as_str()),
        )
        .await;
        let (socket, _) = match dial {
            Ok(Ok(parts)) => parts,
            Ok(Err(err)) => return Err(anyhow!("dial failed: {err}")),
            Err(_) => return Err(anyhow!("dial timeout")),
        };
        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_SIZE);
        *self.out_tx.lock() = Some(out_tx.clone());
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        self.set_state(ConnectionState::AwaitingChallenge);
        let handshake_deadline =
            Instant::now() + Duration::from_millis(CHALLENGE_TIMEOUT_MS);
        let mut handshake_id: Option<String> = None;

        let outcome = loop {
            let next = if self.is_connected() {
                stream.next().await
            } else {
                match timeout_at(handshake_deadline, stream.next()).await {
                    Ok(frame) => frame,
                    Err(_) => break Err(anyhow!("handshake timeout")),
                }
            };
            let Some(frame) = next else {
                break Ok(());
            };
            let message = match frame {
                Ok(message) => message,
                Err(err) => break Err(anyhow!("socket error: {err}")),
            };
            match message {
                Message::Text(text) => {
                    let frame: UpstreamFrame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(err) => {
                            debug!(gateway = %self.gateway_id, error = %err, "unparseable frame");
                            continue;
                        }
                    };
                    match frame.kind.as_str() {
                        "event" => {
                            let event = frame.event.unwrap_or_default();
                            if event == EVENT_CONNECT_CHALLENGE && !self.is_connected() {
                                if handshake_id.is_some() {
                                    continue;
                                }
                                self.set_state(ConnectionState::Authenticating);
                                let request_id = self.next_request_id();
                                let params = build_connect_params(
                                    self.auth.token.as_deref(),
                                    self.auth.password.as_deref(),
                                    &self.instance_id,
                                );
                                let connect =
                                    build_request_frame(&request_id, "connect", params);
                                if out_tx
                                    .send(Message::Text(connect.to_string().into()))
                                    .await
                                    .is_err()
                                {
                                    break Err(anyhow!("socket closed during handshake"));
                                }
                                handshake_id = Some(request_id);
                            } else {
                                self.dispatch_event(&event, frame.payload.unwrap_or(Value::Null));
                            }
                        }
                        "res" => {
                            let request_id = frame.id.clone().unwrap_or_default();
                            if !self.is_connected()
                                && handshake_id.as_deref() == Some(request_id.as_str())
                            {
                                handshake_id = None;
                                if frame.ok == Some(true) {
                                    let payload = frame.payload.unwrap_or(Value::Null);
                                    *self.snapshot.write() =
                                        GatewaySnapshot::from_connect_payload(&payload);
                                    self.connected.store(true, Ordering::SeqCst);
                                    self.attempts.store(0, Ordering::SeqCst);
                                    self.set_state(ConnectionState::Connected);
                                    info!(gateway = %self.gateway_id, "gateway connected");
                                    self.dispatch_event(
                                        EVENT_CONNECTED,
                                        json!({ "gatewayId": self.gateway_id }),
                                    );
                                    self.replay_reasoning_prefs(&out_tx).await;
                                } else {
                                    let detail = frame
                                        .error
                                        .map(|err| err.message())
                                        .unwrap_or_else(|| "connect rejected".to_string());
                                    break Err(anyhow!("connect rejected: {detail}"));
                                }
                            } else {
                                self.complete_pending(
                                    &request_id,
                                    frame.ok,
                                    frame.payload,
                                    frame.error,
                                )
                                .await;
                            }
                        }
                        other => {
                            debug!(gateway = %self.gateway_id, kind = other, "ignoring frame");
                        }
                    }
                }
                Message::Ping(data) => {
                    let _ = out_tx.send(Message::Pong(data)).await;
                }
                Message::Close(_) => break Ok(()),
                _ => {}
            }
        };

        *self.out_tx.lock() = None;
        drop(out_tx);
        let _ = writer.await;
        outcome
    }

    /// Re-applies cached `chat.set_reasoning` values after a handshake; the
    /// upstream is not assumed to remember them across connections.
    async fn replay_reasoning_prefs(&self, out_tx: &mpsc::Sender<Message>) {
        let prefs = self
            .reasoning_prefs
            .lock()
            .iter()
            .map(|(key, enabled)| (key.clone(), *enabled))
            .collect::<Vec<_>>();
        for (session_key, enabled) in prefs {
            let frame = build_request_frame(
                &self.next_request_id(),
                "chat.set_reasoning",
                json!({ "sessionKey": session_key, "enabled": enabled }),
            );
            let _ = out_tx.send(Message::Text(frame.to_string().into())).await;
        }
    }
}
