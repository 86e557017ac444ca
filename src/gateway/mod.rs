// Upstream gateway protocol: frame shapes, connect parameters and the
// metadata snapshot cached after a successful handshake.

mod connection;
mod manager;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

pub use connection::{GatewayConnection, GatewayEvent, RequestError};
pub use manager::{seed_default_gateway, GatewayManager, GatewayStatus};

pub const PROTOCOL_MIN_VERSION: i32 = 3;
pub const PROTOCOL_MAX_VERSION: i32 = 3;
pub const DIAL_TIMEOUT_MS: u64 = 15_000;
pub const CHALLENGE_TIMEOUT_MS: u64 = 15_000;
pub const REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const RECONNECT_MAX_ATTEMPTS: u32 = 10;

pub const EVENT_CHAT: &str = "chat";
pub const EVENT_CONNECT_CHALLENGE: &str = "connect.challenge";
pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_DISCONNECTED: &str = "disconnected";
pub const EVENT_RECONNECT_FAILED: &str = "reconnect_failed";

/// One JSON object per websocket text frame; `type` discriminates
/// request/response/event.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub error: Option<UpstreamError>,
    #[serde(default)]
    pub event: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamError {
    #[serde(default)]
    pub message: Option<String>,
}

impl UpstreamError {
    pub fn message(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| "upstream error".to_string())
    }
}

/// Chat stream event payload. Field names follow the wire protocol's
/// camelCase with snake_case tolerated.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatEventPayload {
    #[serde(default, alias = "sessionKey", alias = "session_key")]
    pub session_key: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, alias = "errorMessage", alias = "error_message")]
    pub error: Option<Value>,
    #[serde(default, alias = "agentName", alias = "agent_name")]
    pub agent_name: Option<String>,
}

impl ChatEventPayload {
    pub fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Object(map)) => map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream error")
                .to_string(),
            Some(other) => other.to_string(),
            None => "upstream error".to_string(),
        }
    }
}

/// Snapshot cached from the `connect` response payload and surfaced to
/// downstream clients. Agents and models stay opaque JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySnapshot {
    #[serde(default)]
    pub agents: Vec<Value>,
    #[serde(default)]
    pub models: Vec<Value>,
    #[serde(default)]
    pub default_model: Option<String>,
}

impl GatewaySnapshot {
    pub fn from_connect_payload(payload: &Value) -> Self {
        payload
            .get("snapshot")
            .and_then(|snapshot| serde_json::from_value(snapshot.clone()).ok())
            .unwrap_or_default()
    }

    /// The first agent id in the snapshot, used as the fallback source tag
    /// for federated streams.
    pub fn default_agent_id(&self) -> Option<String> {
        self.agents
            .first()
            .and_then(|agent| agent.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Dialing,
    AwaitingChallenge,
    Authenticating,
    Connected,
    Backoff,
    Terminal,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Dialing => "dialing",
            Self::AwaitingChallenge => "awaiting_challenge",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
            Self::Terminal => "terminal",
        };
        write!(f, "{label}")
    }
}

pub fn build_request_frame(id: &str, method: &str, params: Value) -> Value {
    json!({
        "type": "req",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn build_connect_params(
    token: Option<&str>,
    password: Option<&str>,
    instance_id: &str,
) -> Value {
    let auth = match (token, password) {
        (None, None) => Value::Null,
        (token, password) => json!({ "token": token, "password": password }),
    };
    json!({
        "auth": auth,
        "role": "operator",
        "scopes": [
            "operator.read",
            "operator.write",
            "operator.admin",
            "operator.approvals",
            "operator.pairing",
        ],
        "permissions": {
            "operator.admin": true,
            "operator.approvals": true,
            "operator.pairing": true,
        },
        "client": {
            "id": "chathub",
            "version": env!("CARGO_PKG_VERSION"),
            "platform": "web",
            "mode": "webchat",
            "instanceId": instance_id,
        },
        "minProtocol": PROTOCOL_MIN_VERSION,
        "maxProtocol": PROTOCOL_MAX_VERSION,
    })
}

/// Backoff ladder: `min(base * 2^attempt, max)` for the attempt about to be
/// scheduled (zero-based).
pub fn backoff_delay_ms(attempt: u32) -> u64 {
    let shifted = RECONNECT_BASE_DELAY_MS.checked_shl(attempt).unwrap_or(u64::MAX);
    shifted.min(RECONNECT_MAX_DELAY_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder_doubles_and_caps() {
        assert_eq!(backoff_delay_ms(0), 1_000);
        assert_eq!(backoff_delay_ms(1), 2_000);
        assert_eq!(backoff_delay_ms(2), 4_000);
        assert_eq!(backoff_delay_ms(4), 16_000);
        assert_eq!(backoff_delay_ms(5), 30_000);
        assert_eq!(backoff_delay_ms(40), 30_000);
    }

    #[test]
    fn connect_params_carry_protocol_range_and_scopes() {
        let params = build_connect_params(Some("tok"), None, "inst-1");
        assert_eq!(params["minProtocol"], 3);
        assert_eq!(params["maxProtocol"], 3);
        assert_eq!(params["role"], "operator");
        assert_eq!(params["auth"]["token"], "tok");
        assert_eq!(params["client"]["mode"], "webchat");
        assert!(params["scopes"]
            .as_array()
            .expect("scopes array")
            .iter()
            .any(|scope| scope == "operator.admin"));
    }

    #[test]
    fn connect_params_tolerate_missing_auth() {
        let params = build_connect_params(None, None, "inst-1");
        assert!(params["auth"].is_null());
    }

    #[test]
    fn frame_parses_response_and_event_shapes() {
        let response: UpstreamFrame = serde_json::from_str(
            r#"{"type":"res","id":"r1","ok":true,"payload":{"protocol":3}}"#,
        )
        .expect("parse response");
        assert_eq!(response.kind, "res");
        assert_eq!(response.id.as_deref(), Some("r1"));
        assert_eq!(response.ok, Some(true));

        let event: UpstreamFrame = serde_json::from_str(
            r#"{"type":"event","event":"chat","payload":{"sessionKey":"s1","state":"delta","text":"He"}}"#,
        )
        .expect("parse event");
        assert_eq!(event.event.as_deref(), Some("chat"));
        let payload: ChatEventPayload =
            serde_json::from_value(event.payload.expect("payload")).expect("chat payload");
        assert_eq!(payload.session_key.as_deref(), Some("s1"));
        assert_eq!(payload.state.as_deref(), Some("delta"));
        assert_eq!(payload.text.as_deref(), Some("He"));
    }

    #[test]
    fn snapshot_extracts_defaults_from_connect_payload() {
        let payload = serde_json::json!({
            "protocol": 3,
            "snapshot": {
                "agents": [{"id": "a1", "name": "Agent One"}],
                "models": [{"id": "m1"}],
                "defaultModel": "m1",
                "sessionDefaults": {}
            }
        });
        let snapshot = GatewaySnapshot::from_connect_payload(&payload);
        assert_eq!(snapshot.default_model.as_deref(), Some("m1"));
        assert_eq!(snapshot.default_agent_id().as_deref(), Some("a1"));
        assert_eq!(snapshot.models.len(), 1);
    }

    #[test]
    fn chat_error_message_handles_string_and_object() {
        let from_string: ChatEventPayload =
            serde_json::from_str(r#"{"state":"error","error":"boom"}"#).expect("parse");
        assert_eq!(from_string.error_message(), "boom");
        let from_object: ChatEventPayload =
            serde_json::from_str(r#"{"state":"error","error":{"message":"bad"}}"#).expect("parse");
        assert_eq!(from_object.error_message(), "bad");
    }
}
