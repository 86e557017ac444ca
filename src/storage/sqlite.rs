// SQLite storage implementation. One connection per call, WAL journaling,
// writes serialized by the engine with a bounded busy-retry ladder on top.
use crate::storage::{
    AlreadyExists, ContentBlock, FederatedSessionRecord, FederatedTarget, GatewayAuthRecord,
    GatewayRecord, MessageRecord, MessageRole, SessionRecord, StorageBackend,
    MESSAGE_LIMIT_MAX,
};
use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

const BUSY_TIMEOUT_MS: u64 = 250;
const BUSY_RETRY_LIMIT: u32 = 5;

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/chathub.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(conn)
    }

    fn now_ts() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }

    fn blocks_to_json(blocks: &[ContentBlock]) -> String {
        serde_json::to_string(blocks).unwrap_or_else(|_| "[]".to_string())
    }

    fn blocks_from_json(text: &str) -> Vec<ContentBlock> {
        match serde_json::from_str::<Vec<ContentBlock>>(text) {
            Ok(blocks) => blocks,
            Err(_) => vec![ContentBlock::text(text)],
        }
    }

    fn targets_to_json(targets: &[FederatedTarget]) -> String {
        serde_json::to_string(targets).unwrap_or_else(|_| "[]".to_string())
    }

    fn targets_from_json(text: &str) -> Vec<FederatedTarget> {
        serde_json::from_str::<Vec<FederatedTarget>>(text).unwrap_or_default()
    }

    fn session_id(
        conn: &Connection,
        gateway_id: &str,
        session_key: &str,
    ) -> Result<Option<i64>> {
        let id = conn
            .query_row(
                "SELECT id FROM sessions WHERE gateway_id = ? AND session_key = ?",
                params![gateway_id, session_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn is_duplicate(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(inner.code, ErrorCode::ConstraintViolation)
    )
}

/// Retries a write closure on transient busy/locked errors with a short
/// growing delay; persistent failures surface to the caller.
fn retry_busy<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> rusqlite::Result<T> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Err(err) if is_busy(&err) && attempt < BUSY_RETRY_LIMIT => {
                attempt += 1;
                let jitter = (Uuid::new_v4().as_u128() % 8) as u64;
                std::thread::sleep(Duration::from_millis(10 * attempt as u64 + jitter));
            }
            other => return other,
        }
    }
}

fn map_gateway_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GatewayRecord> {
    Ok(GatewayRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn map_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        gateway_id: row.get(1)?,
        session_key: row.get(2)?,
        title: row.get(3)?,
        agent_id: row.get(4)?,
        model: row.get(5)?,
        created_at: row.get(6)?,
        last_activity: row.get(7)?,
    })
}

const SESSION_COLUMNS: &str =
    "id, gateway_id, session_key, title, agent_id, model, created_at, last_activity";

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS gateways (
              gateway_id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              url TEXT NOT NULL,
              token TEXT,
              password TEXT,
              created_at REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sessions (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              gateway_id TEXT NOT NULL,
              session_key TEXT NOT NULL,
              title TEXT,
              agent_id TEXT,
              model TEXT,
              created_at REAL NOT NULL,
              last_activity REAL NOT NULL,
              UNIQUE (gateway_id, session_key)
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_gateway_activity
              ON sessions (gateway_id, last_activity);
            CREATE TABLE IF NOT EXISTS messages (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id INTEGER NOT NULL,
              role TEXT NOT NULL,
              content TEXT NOT NULL,
              upstream_ts REAL,
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session_created
              ON messages (session_id, created_at);
            CREATE TABLE IF NOT EXISTS federated_sessions (
              federated_id TEXT PRIMARY KEY,
              title TEXT,
              targets TEXT NOT NULL,
              created_at REAL NOT NULL,
              last_activity REAL NOT NULL
            );
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn list_gateways(&self) -> Result<Vec<GatewayRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut statement = conn.prepare(
            "SELECT gateway_id, name, url, created_at FROM gateways ORDER BY created_at",
        )?;
        let rows = statement
            .query_map([], map_gateway_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn get_gateway(&self, gateway_id: &str) -> Result<Option<GatewayRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT gateway_id, name, url, created_at FROM gateways WHERE gateway_id = ?",
                params![gateway_id],
                map_gateway_row,
            )
            .optional()?;
        Ok(record)
    }

    fn get_gateway_auth(&self, gateway_id: &str) -> Result<Option<GatewayAuthRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT token, password FROM gateways WHERE gateway_id = ?",
                params![gateway_id],
                |row| {
                    Ok(GatewayAuthRecord {
                        token: row.get(0)?,
                        password: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn add_gateway(
        &self,
        gateway_id: &str,
        name: &str,
        url: &str,
        token: Option<&str>,
        password: Option<&str>,
    ) -> Result<GatewayRecord> {
        self.ensure_initialized()?;
        let gateway_id = gateway_id.trim();
        if gateway_id.is_empty() {
            return Err(anyhow!("gateway id required"));
        }
        let now = Self::now_ts();
        let conn = self.open()?;
        let inserted = retry_busy(|| {
            conn.execute(
                "INSERT INTO gateways (gateway_id, name, url, token, password, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![gateway_id, name, url, token, password, now],
            )
        });
        match inserted {
            Ok(_) => Ok(GatewayRecord {
                id: gateway_id.to_string(),
                name: name.to_string(),
                url: url.to_string(),
                created_at: now,
            }),
            Err(err) if is_duplicate(&err) => Err(anyhow::Error::new(AlreadyExists)),
            Err(err) => Err(err.into()),
        }
    }

    fn delete_gateway(&self, gateway_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let affected = retry_busy(|| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM messages WHERE session_id IN \
                 (SELECT id FROM sessions WHERE gateway_id = ?)",
                params![gateway_id],
            )?;
            tx.execute("DELETE FROM sessions WHERE gateway_id = ?", params![gateway_id])?;
            let affected =
                tx.execute("DELETE FROM gateways WHERE gateway_id = ?", params![gateway_id])?;
            tx.commit()?;
            Ok(affected)
        })?;
        Ok(affected > 0)
    }

    fn list_sessions(&self, gateway_id: &str) -> Result<Vec<SessionRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE gateway_id = ? \
             ORDER BY last_activity DESC"
        ))?;
        let rows = statement
            .query_map(params![gateway_id], map_session_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn get_session(&self, gateway_id: &str, session_key: &str) -> Result<Option<SessionRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions \
                     WHERE gateway_id = ? AND session_key = ?"
                ),
                params![gateway_id, session_key],
                map_session_row,
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_session(
        &self,
        gateway_id: &str,
        session_key: &str,
        agent_id: Option<&str>,
        model: Option<&str>,
        title: Option<&str>,
    ) -> Result<SessionRecord> {
        self.ensure_initialized()?;
        let now = Self::now_ts();
        let conn = self.open()?;
        retry_busy(|| {
            conn.execute(
                "INSERT INTO sessions \
                 (gateway_id, session_key, title, agent_id, model, created_at, last_activity) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(gateway_id, session_key) DO UPDATE SET \
                   last_activity = excluded.last_activity, \
                   title = COALESCE(excluded.title, sessions.title), \
                   agent_id = COALESCE(excluded.agent_id, sessions.agent_id), \
                   model = COALESCE(excluded.model, sessions.model)",
                params![gateway_id, session_key, title, agent_id, model, now, now],
            )
        })?;
        self.get_session(gateway_id, session_key)?
            .ok_or_else(|| anyhow!("session upsert lost: {gateway_id}/{session_key}"))
    }

    fn delete_session(&self, gateway_id: &str, session_key: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let deleted = retry_busy(|| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let session_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM sessions WHERE gateway_id = ? AND session_key = ?",
                    params![gateway_id, session_key],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(session_id) = session_id else {
                tx.commit()?;
                return Ok(false);
            };
            tx.execute("DELETE FROM messages WHERE session_id = ?", params![session_id])?;
            tx.execute("DELETE FROM sessions WHERE id = ?", params![session_id])?;
            tx.commit()?;
            Ok(true)
        })?;
        Ok(deleted)
    }

    fn append_message(
        &self,
        gateway_id: &str,
        session_key: &str,
        role: MessageRole,
        content: &[ContentBlock],
        upstream_ts: Option<f64>,
    ) -> Result<MessageRecord> {
        self.ensure_initialized()?;
        let now = Self::now_ts();
        let content_json = Self::blocks_to_json(content);
        let mut conn = self.open()?;
        let record = retry_busy(|| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO sessions \
                 (gateway_id, session_key, created_at, last_activity) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(gateway_id, session_key) DO UPDATE SET \
                   last_activity = excluded.last_activity",
                params![gateway_id, session_key, now, now],
            )?;
            let session_id: i64 = tx.query_row(
                "SELECT id FROM sessions WHERE gateway_id = ? AND session_key = ?",
                params![gateway_id, session_key],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO messages (session_id, role, content, upstream_ts, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
                params![session_id, role.as_str(), content_json, upstream_ts, now],
            )?;
            let message_id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(MessageRecord {
                id: message_id,
                session_id,
                role,
                content: content.to_vec(),
                upstream_ts,
                created_at: now,
            })
        })?;
        Ok(record)
    }

    fn list_messages(
        &self,
        gateway_id: &str,
        session_key: &str,
        limit: Option<i64>,
        before_id: Option<i64>,
    ) -> Result<Vec<MessageRecord>> {
        self.ensure_initialized()?;
        let limit = crate::storage::clamp_message_limit(limit);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let Some(session_id) = Self::session_id(&conn, gateway_id, session_key)? else {
            return Ok(Vec::new());
        };
        let before_id = before_id.unwrap_or(i64::MAX);
        let mut statement = conn.prepare(
            "SELECT id, role, content, upstream_ts, created_at FROM messages \
             WHERE session_id = ? AND id < ? ORDER BY id DESC LIMIT ?",
        )?;
        let mut rows = statement
            .query_map(params![session_id, before_id, limit.min(MESSAGE_LIMIT_MAX)], |row| {
                let role_text: String = row.get(1)?;
                let content_text: String = row.get(2)?;
                Ok(MessageRecord {
                    id: row.get(0)?,
                    session_id,
                    role: MessageRole::from_str(&role_text).unwrap_or(MessageRole::System),
                    content: Self::blocks_from_json(&content_text),
                    upstream_ts: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.reverse();
        Ok(rows)
    }

    fn create_federated_session(
        &self,
        title: Option<&str>,
        targets: &[FederatedTarget],
    ) -> Result<FederatedSessionRecord> {
        self.ensure_initialized()?;
        let federated_id = format!("fed_{}", Uuid::new_v4().simple());
        let now = Self::now_ts();
        let targets_json = Self::targets_to_json(targets);
        let conn = self.open()?;
        retry_busy(|| {
            conn.execute(
                "INSERT INTO federated_sessions \
                 (federated_id, title, targets, created_at, last_activity) \
                 VALUES (?, ?, ?, ?, ?)",
                params![federated_id, title, targets_json, now, now],
            )
        })?;
        Ok(FederatedSessionRecord {
            id: federated_id,
            title: title.map(str::to_string),
            targets: targets.to_vec(),
            created_at: now,
            last_activity: now,
        })
    }

    fn list_federated_sessions(&self) -> Result<Vec<FederatedSessionRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut statement = conn.prepare(
            "SELECT federated_id, title, targets, created_at, last_activity \
             FROM federated_sessions ORDER BY last_activity DESC",
        )?;
        let rows = statement
            .query_map([], |row| {
                let targets_text: String = row.get(2)?;
                Ok(FederatedSessionRecord {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    targets: Self::targets_from_json(&targets_text),
                    created_at: row.get(3)?,
                    last_activity: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn get_federated_session(&self, federated_id: &str) -> Result<Option<FederatedSessionRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT federated_id, title, targets, created_at, last_activity \
                 FROM federated_sessions WHERE federated_id = ?",
                params![federated_id],
                |row| {
                    let targets_text: String = row.get(2)?;
                    Ok(FederatedSessionRecord {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        targets: Self::targets_from_json(&targets_text),
                        created_at: row.get(3)?,
                        last_activity: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn touch_federated_session(&self, federated_id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let now = Self::now_ts();
        let conn = self.open()?;
        retry_busy(|| {
            conn.execute(
                "UPDATE federated_sessions SET last_activity = ? WHERE federated_id = ?",
                params![now, federated_id],
            )
        })?;
        Ok(())
    }

    fn delete_federated_session(&self, federated_id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = retry_busy(|| {
            conn.execute(
                "DELETE FROM federated_sessions WHERE federated_id = ?",
                params![federated_id],
            )
        })?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::clamp_message_limit;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> SqliteStorage {
        let path = dir.path().join("test.db");
        SqliteStorage::new(path.to_string_lossy().to_string())
    }

    #[test]
    fn add_gateway_lists_and_rejects_duplicates() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir);
        store
            .add_gateway("g1", "First", "ws://one", Some("SECRET"), None)
            .expect("add gateway");

        let listed = store.list_gateways().expect("list gateways");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "g1");
        assert_eq!(listed[0].url, "ws://one");

        let err = store
            .add_gateway("g1", "Again", "ws://two", None, None)
            .expect_err("duplicate must fail");
        assert!(err.downcast_ref::<AlreadyExists>().is_some());
        assert_eq!(store.list_gateways().expect("list again").len(), 1);
    }

    #[test]
    fn gateway_auth_is_only_reachable_explicitly() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir);
        store
            .add_gateway("g1", "First", "ws://one", Some("token-1"), Some("pw-1"))
            .expect("add gateway");
        let auth = store
            .get_gateway_auth("g1")
            .expect("auth query")
            .expect("auth present");
        assert_eq!(auth.token.as_deref(), Some("token-1"));
        assert_eq!(auth.password.as_deref(), Some("pw-1"));
        assert!(store.get_gateway_auth("missing").expect("auth query").is_none());
    }

    #[test]
    fn append_message_auto_creates_session_and_bumps_activity() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir);
        let message = store
            .append_message("g1", "s1", MessageRole::User, &[ContentBlock::text("Hi")], None)
            .expect("append message");

        let session = store
            .get_session("g1", "s1")
            .expect("get session")
            .expect("session auto-created");
        assert_eq!(session.id, message.session_id);
        assert!(session.last_activity >= message.created_at);

        std::thread::sleep(Duration::from_millis(20));
        let second = store
            .append_message(
                "g1",
                "s1",
                MessageRole::Assistant,
                &[ContentBlock::text("Hello")],
                Some(123.0),
            )
            .expect("append second");
        let session = store
            .get_session("g1", "s1")
            .expect("get session")
            .expect("session still present");
        assert!(session.last_activity >= second.created_at);
    }

    #[test]
    fn list_messages_is_chronological_and_respects_cursor() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir);
        let mut ids = Vec::new();
        for index in 0..5 {
            let message = store
                .append_message(
                    "g1",
                    "s1",
                    MessageRole::User,
                    &[ContentBlock::text(format!("m{index}"))],
                    None,
                )
                .expect("append");
            ids.push(message.id);
        }

        let all = store
            .list_messages("g1", "s1", Some(50), None)
            .expect("list all");
        assert_eq!(all.len(), 5);
        for window in all.windows(2) {
            assert!(window[0].created_at <= window[1].created_at);
            assert!(window[0].id < window[1].id);
        }

        let page = store
            .list_messages("g1", "s1", Some(2), Some(ids[4]))
            .expect("list page");
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[2]);
        assert_eq!(page[1].id, ids[3]);

        assert!(store
            .list_messages("g1", "s1", Some(0), None)
            .expect("limit zero")
            .is_empty());
        assert_eq!(clamp_message_limit(Some(1000)), MESSAGE_LIMIT_MAX);
    }

    #[test]
    fn delete_gateway_cascades_to_sessions_and_messages() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir);
        store
            .add_gateway("g1", "First", "ws://one", None, None)
            .expect("add gateway");
        store
            .append_message("g1", "s1", MessageRole::User, &[ContentBlock::text("a")], None)
            .expect("append");
        store
            .append_message("g1", "s2", MessageRole::User, &[ContentBlock::text("b")], None)
            .expect("append");

        assert!(store.delete_gateway("g1").expect("delete gateway"));
        assert!(store.list_sessions("g1").expect("list sessions").is_empty());
        assert!(store
            .list_messages("g1", "s1", Some(50), None)
            .expect("list messages")
            .is_empty());
        assert!(store
            .list_messages("g1", "s2", Some(50), None)
            .expect("list messages")
            .is_empty());
        assert!(!store.delete_gateway("g1").expect("second delete"));
    }

    #[test]
    fn upsert_session_touches_without_clearing_fields() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir);
        let first = store
            .upsert_session("g1", "s1", Some("a1"), Some("m1"), Some("Title"))
            .expect("insert session");
        assert_eq!(first.agent_id.as_deref(), Some("a1"));

        std::thread::sleep(Duration::from_millis(20));
        let touched = store
            .upsert_session("g1", "s1", None, None, None)
            .expect("touch session");
        assert_eq!(touched.agent_id.as_deref(), Some("a1"));
        assert_eq!(touched.model.as_deref(), Some("m1"));
        assert_eq!(touched.title.as_deref(), Some("Title"));
        assert!(touched.last_activity > first.last_activity);
        assert_eq!(touched.created_at, first.created_at);

        let sessions = store.list_sessions("g1").expect("list sessions");
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn delete_session_removes_only_that_session() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir);
        store
            .append_message("g1", "s1", MessageRole::User, &[ContentBlock::text("a")], None)
            .expect("append");
        store
            .append_message("g1", "s2", MessageRole::User, &[ContentBlock::text("b")], None)
            .expect("append");

        assert!(store.delete_session("g1", "s1").expect("delete session"));
        assert!(store.get_session("g1", "s1").expect("get").is_none());
        assert!(store.get_session("g1", "s2").expect("get").is_some());
        assert!(!store.delete_session("g1", "s1").expect("delete again"));
    }

    #[test]
    fn federated_sessions_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir);
        let targets = vec![
            FederatedTarget {
                gateway_id: "g1".to_string(),
                session_key: "s1".to_string(),
            },
            FederatedTarget {
                gateway_id: "g2".to_string(),
                session_key: "s2".to_string(),
            },
        ];
        let created = store
            .create_federated_session(Some("Pair"), &targets)
            .expect("create federated");
        assert!(created.id.starts_with("fed_"));

        let fetched = store
            .get_federated_session(&created.id)
            .expect("get federated")
            .expect("federated present");
        assert_eq!(fetched.targets, targets);
        assert_eq!(fetched.title.as_deref(), Some("Pair"));

        assert_eq!(store.list_federated_sessions().expect("list").len(), 1);
        assert!(store
            .delete_federated_session(&created.id)
            .expect("delete federated"));
        assert!(store
            .get_federated_session(&created.id)
            .expect("get after delete")
            .is_none());
    }
}
