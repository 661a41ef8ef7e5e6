//! SQLite-backed message log.
//!
//! The database is opened lazily on first use and reopened after a failure
//! that makes it unreachable, so a store whose file lives on storage that
//! comes and goes recovers on its own. All SQLite calls run on the blocking
//! pool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use agentmesh_protocol::{codec, AgentId, MessageEnvelope};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};

use crate::store::{MessageAnalytics, MessageStore};
use crate::StorageError;

const SCHEMA: &str = "BEGIN;
CREATE TABLE IF NOT EXISTS messages(
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    source TEXT NOT NULL,
    target TEXT,
    timestamp_ms INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    body BLOB NOT NULL,
    stored_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_messages_source ON messages(source);
CREATE INDEX IF NOT EXISTS idx_messages_target ON messages(target);
COMMIT;";

type SharedConnection = Arc<Mutex<Option<Connection>>>;

#[derive(Debug)]
pub struct SqliteStore {
    path: PathBuf,
    conn: SharedConnection,
    name: &'static str,
}

impl SqliteStore {
    /// A store at `path`. Nothing is opened until the first call.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            conn: Arc::new(Mutex::new(None)),
            name: "sqlite",
        }
    }

    /// Open (creating parent directories) and initialise the schema now.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, StorageError> {
        let store = Self::new(path);
        if let Some(parent) = store.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Unavailable(format!("create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = open_connection(&store.path)?;
        if let Ok(mut slot) = store.conn.lock() {
            *slot = Some(conn);
        }
        Ok(store)
    }

    /// Name reported in logs and health checks.
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || with_connection(&conn, &path, op)).await?
    }
}

fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .map_err(|e| StorageError::Unavailable(format!("open {}: {e}", path.display())))?;
    conn.execute_batch(SCHEMA)?;
    tracing::debug!(path = %path.display(), "Opened message store");
    Ok(conn)
}

fn with_connection<T>(
    shared: &Mutex<Option<Connection>>,
    path: &Path,
    op: impl FnOnce(&Connection) -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    let mut slot = shared
        .lock()
        .map_err(|_| StorageError::Backend("connection lock poisoned".into()))?;
    if slot.is_none() {
        *slot = Some(open_connection(path)?);
    }
    let Some(conn) = slot.as_ref() else {
        return Err(StorageError::Unavailable("no connection".into()));
    };
    let result = op(conn);
    if matches!(&result, Err(e) if e.is_unavailable()) {
        // Reopen on the next call.
        *slot = None;
    }
    result
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn put(&self, envelope: &MessageEnvelope) -> Result<bool, StorageError> {
        let body = codec::encode(envelope)?;
        let id = envelope.id.clone();
        let kind = envelope.kind.as_str().to_string();
        let source = envelope.source.as_str().to_string();
        let target = envelope.target.as_ref().map(|t| t.as_str().to_string());
        let timestamp_ms = to_millis(envelope.timestamp);
        let priority = i64::from(envelope.priority);
        let stored_at_ms = to_millis(Utc::now());

        self.run(move |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO messages(id, kind, source, target, timestamp_ms, priority, body, stored_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![id, kind, source, target, timestamp_ms, priority, body, stored_at_ms],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn recent(
        &self,
        limit: usize,
        agent: Option<&AgentId>,
    ) -> Result<Vec<MessageEnvelope>, StorageError> {
        let agent = agent.map(|a| a.as_str().to_string());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let bodies = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT body FROM messages
                     WHERE ?1 IS NULL OR source = ?1 OR target = ?1
                     ORDER BY timestamp_ms DESC, rowid DESC
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![agent, limit], |row| row.get::<_, Vec<u8>>(0))?;
                let mut bodies = Vec::new();
                for row in rows {
                    bodies.push(row?);
                }
                Ok(bodies)
            })
            .await?;

        let mut envelopes = Vec::with_capacity(bodies.len());
        for body in bodies {
            match codec::decode(&body) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable stored message"),
            }
        }
        Ok(envelopes)
    }

    async fn analytics(&self, since: DateTime<Utc>) -> Result<MessageAnalytics, StorageError> {
        let since_ms = to_millis(since);
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT kind, COUNT(*) FROM messages WHERE timestamp_ms >= ?1 GROUP BY kind",
            )?;
            let rows = stmt.query_map(params![since_ms], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut message_counts = BTreeMap::new();
            let mut total_messages = 0u64;
            for row in rows {
                let (kind, count) = row?;
                let count = u64::try_from(count).unwrap_or(0);
                total_messages += count;
                message_counts.insert(kind, count);
            }
            let active_senders: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT source) FROM messages WHERE timestamp_ms >= ?1",
                params![since_ms],
                |row| row.get(0),
            )?;
            Ok(MessageAnalytics {
                message_counts,
                total_messages,
                active_senders: u64::try_from(active_senders).unwrap_or(0),
            })
        })
        .await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
