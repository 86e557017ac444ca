// Storage module: embedded relational persistence for gateways, chat
// sessions, message history and federated sessions.

mod sqlite;

use crate::config::StorageConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use sqlite::SqliteStorage;

/// Duplicate-key marker carried inside `anyhow::Error` so the REST boundary
/// can map it to a 400 without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyExists;

impl fmt::Display for AlreadyExists {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record already exists")
    }
}

impl std::error::Error for AlreadyExists {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Message content is an ordered list of typed blocks, serialized to JSON
/// text in the store so richer block types can be added without migrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
}

impl ContentBlock {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text { text: value.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRecord {
    pub id: String,
    pub name: String,
    pub url: String,
    pub created_at: f64,
}

#[derive(Debug, Clone, Default)]
pub struct GatewayAuthRecord {
    pub token: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: i64,
    pub gateway_id: String,
    pub session_key: String,
    pub title: Option<String>,
    pub agent_id: Option<String>,
    pub model: Option<String>,
    pub created_at: f64,
    pub last_activity: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: i64,
    pub session_id: i64,
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
    pub upstream_ts: Option<f64>,
    pub created_at: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedTarget {
    pub gateway_id: String,
    pub session_key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedSessionRecord {
    pub id: String,
    pub title: Option<String>,
    pub targets: Vec<FederatedTarget>,
    pub created_at: f64,
    pub last_activity: f64,
}

pub const MESSAGE_LIMIT_DEFAULT: i64 = 50;
pub const MESSAGE_LIMIT_MAX: i64 = 500;

/// Storage backend abstraction. The embedded store serializes writes; all
/// methods are synchronous and cheap enough to call from request handlers.
pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    fn list_gateways(&self) -> Result<Vec<GatewayRecord>>;
    fn get_gateway(&self, gateway_id: &str) -> Result<Option<GatewayRecord>>;
    fn get_gateway_auth(&self, gateway_id: &str) -> Result<Option<GatewayAuthRecord>>;
    fn add_gateway(
        &self,
        gateway_id: &str,
        name: &str,
        url: &str,
        token: Option<&str>,
        password: Option<&str>,
    ) -> Result<GatewayRecord>;
    /// Removes the gateway row and cascades to its sessions and messages.
    fn delete_gateway(&self, gateway_id: &str) -> Result<bool>;

    fn list_sessions(&self, gateway_id: &str) -> Result<Vec<SessionRecord>>;
    fn get_session(&self, gateway_id: &str, session_key: &str) -> Result<Option<SessionRecord>>;
    fn upsert_session(
        &self,
        gateway_id: &str,
        session_key: &str,
        agent_id: Option<&str>,
        model: Option<&str>,
        title: Option<&str>,
    ) -> Result<SessionRecord>;
    fn delete_session(&self, gateway_id: &str, session_key: &str) -> Result<bool>;

    fn append_message(
        &self,
        gateway_id: &str,
        session_key: &str,
        role: MessageRole,
        content: &[ContentBlock],
        upstream_ts: Option<f64>,
    ) -> Result<MessageRecord>;
    fn list_messages(
        &self,
        gateway_id: &str,
        session_key: &str,
        limit: Option<i64>,
        before_id: Option<i64>,
    ) -> Result<Vec<MessageRecord>>;

    fn create_federated_session(
        &self,
        title: Option<&str>,
        targets: &[FederatedTarget],
    ) -> Result<FederatedSessionRecord>;
    fn list_federated_sessions(&self) -> Result<Vec<FederatedSessionRecord>>;
    fn get_federated_session(&self, federated_id: &str) -> Result<Option<FederatedSessionRecord>>;
    fn touch_federated_session(&self, federated_id: &str) -> Result<()>;
    fn delete_federated_session(&self, federated_id: &str) -> Result<bool>;
}

pub fn build_storage(config: &StorageConfig) -> Arc<dyn StorageBackend> {
    Arc::new(SqliteStorage::new(config.db_path.clone()))
}

pub fn clamp_message_limit(limit: Option<i64>) -> i64 {
    limit
        .unwrap_or(MESSAGE_LIMIT_DEFAULT)
        .clamp(0, MESSAGE_LIMIT_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_limit_defaults_and_clamps() {
        assert_eq!(clamp_message_limit(None), MESSAGE_LIMIT_DEFAULT);
        assert_eq!(clamp_message_limit(Some(0)), 0);
        assert_eq!(clamp_message_limit(Some(120)), 120);
        assert_eq!(clamp_message_limit(Some(9999)), MESSAGE_LIMIT_MAX);
        assert_eq!(clamp_message_limit(Some(-5)), 0);
    }

    #[test]
    fn content_blocks_serialize_as_typed_array() {
        let blocks = vec![ContentBlock::text("hello")];
        let json = serde_json::to_string(&blocks).expect("serialize blocks");
        assert_eq!(json, r#"[{"type":"text","text":"hello"}]"#);
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in [MessageRole::User, MessageRole::Assistant, MessageRole::System] {
            assert_eq!(MessageRole::from_str(role.as_str()), Some(role));
        }
        assert_eq!(MessageRole::from_str("tool"), None);
    }
}
