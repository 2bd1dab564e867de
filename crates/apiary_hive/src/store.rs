//! Message log storage — the only durable state a hive carries.
//!
//! The log is append-only and substitutable behind [`MessageBackend`]:
//! [`MemoryBackend`] for tests and single-process deployments,
//! [`SqliteBackend`] for anything that must survive a restart. Both live
//! behind [`MessageStore`], which owns the append contract: uid dedup and
//! gap-free id allocation, atomic because the store is only ever driven by
//! its hive's single actor task.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::info;

use apiary_core::protocol;

use crate::message::{HiveMessage, MessageCandidate, MessageSource};

/// A backend fault. Surfaces to clients as a storage error (HTTP 500), the
/// one failure class that is the server's fault rather than the caller's.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database failure: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Storage contract for one server's message logs, keyed by hive.
///
/// Implementations only store and read; the dedup-then-allocate append
/// sequence lives in [`MessageStore`] so both backends share it verbatim.
pub trait MessageBackend: Send {
    fn insert(&mut self, message: &HiveMessage) -> Result<(), StoreError>;
    fn contains_uid(&self, hive_id: &str, uid: &str) -> Result<bool, StoreError>;
    /// Highest allocated id in the hive's log, 0 when empty.
    fn max_id(&self, hive_id: &str) -> Result<i64, StoreError>;
    fn read_since(
        &self,
        hive_id: &str,
        since_id: i64,
        limit: usize,
    ) -> Result<Vec<HiveMessage>, StoreError>;
    fn read_since_time(
        &self,
        hive_id: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<HiveMessage>, StoreError>;
    fn count(&self, hive_id: &str) -> Result<usize, StoreError>;
}

// ---------------------------------------------------------------------------
// Message store
// ---------------------------------------------------------------------------

/// The append-only log API the hive actor drives.
pub struct MessageStore {
    backend: Box<dyn MessageBackend>,
}

impl MessageStore {
    pub fn new(backend: Box<dyn MessageBackend>) -> Self {
        Self { backend }
    }

    /// Appends a candidate unless its uid is already present in the hive.
    /// Returns the stored record, or `None` for "already present" — which is
    /// the expected outcome for gossip repeats, never an error.
    pub fn append(&mut self, candidate: MessageCandidate) -> Result<Option<HiveMessage>, StoreError> {
        if self.backend.contains_uid(&candidate.hive_id, &candidate.uid)? {
            return Ok(None);
        }
        let id = self.backend.max_id(&candidate.hive_id)? + 1;
        let message = candidate.into_message(id);
        self.backend.insert(&message)?;
        Ok(Some(message))
    }

    /// Records with `id > since_id`, oldest first, capped at the hard read
    /// ceiling regardless of what the caller asks for.
    pub fn read_since(
        &self,
        hive_id: &str,
        since_id: i64,
        limit: usize,
    ) -> Result<Vec<HiveMessage>, StoreError> {
        self.backend
            .read_since(hive_id, since_id, limit.min(protocol::READ_LIMIT_CAP))
    }

    /// Records with `created_at_ms > since_ms`, ordered by creation time then
    /// id. Gossip peers synchronize on this because their local ids differ.
    pub fn read_since_time(
        &self,
        hive_id: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<HiveMessage>, StoreError> {
        self.backend
            .read_since_time(hive_id, since_ms, limit.min(protocol::READ_LIMIT_CAP))
    }

    pub fn count(&self, hive_id: &str) -> Result<usize, StoreError> {
        self.backend.count(hive_id)
    }
}

// ---------------------------------------------------------------------------
// Memory backend
// ---------------------------------------------------------------------------

/// In-memory log, one ordered vector per hive. Insertion order equals id
/// order because ids are allocated by the single-writer append path.
#[derive(Default)]
pub struct MemoryBackend {
    logs: HashMap<String, Vec<HiveMessage>>,
    uids: HashMap<String, HashSet<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageBackend for MemoryBackend {
    fn insert(&mut self, message: &HiveMessage) -> Result<(), StoreError> {
        self.uids
            .entry(message.hive_id.clone())
            .or_default()
            .insert(message.uid.clone());
        self.logs
            .entry(message.hive_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    fn contains_uid(&self, hive_id: &str, uid: &str) -> Result<bool, StoreError> {
        Ok(self
            .uids
            .get(hive_id)
            .is_some_and(|set| set.contains(uid)))
    }

    fn max_id(&self, hive_id: &str) -> Result<i64, StoreError> {
        Ok(self
            .logs
            .get(hive_id)
            .and_then(|log| log.last())
            .map_or(0, |m| m.id))
    }

    fn read_since(
        &self,
        hive_id: &str,
        since_id: i64,
        limit: usize,
    ) -> Result<Vec<HiveMessage>, StoreError> {
        Ok(self
            .logs
            .get(hive_id)
            .map(|log| {
                log.iter()
                    .filter(|m| m.id > since_id)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn read_since_time(
        &self,
        hive_id: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<HiveMessage>, StoreError> {
        let mut matched: Vec<HiveMessage> = self
            .logs
            .get(hive_id)
            .map(|log| {
                log.iter()
                    .filter(|m| m.created_at_ms > since_ms)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matched.sort_by_key(|m| (m.created_at_ms, m.id));
        matched.truncate(limit);
        Ok(matched)
    }

    fn count(&self, hive_id: &str) -> Result<usize, StoreError> {
        Ok(self.logs.get(hive_id).map_or(0, Vec::len))
    }
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

/// Durable log on SQLite with WAL. The `UNIQUE(hive_id, uid)` index backs
/// the dedup invariant at the storage level as well; the actor's
/// serialization already prevents the race it would otherwise catch.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Opens (or creates) the log database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        // Every hive actor holds its own connection to the shared file;
        // wait out a writer instead of surfacing SQLITE_BUSY.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let backend = Self { conn };
        backend.init_schema()?;
        info!("message log opened at {}", path.display());
        Ok(backend)
    }

    /// Opens an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let backend = Self { conn };
        backend.init_schema()?;
        Ok(backend)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                hive_id       TEXT NOT NULL,
                id            INTEGER NOT NULL,
                uid           TEXT NOT NULL,
                ts            TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                agent_id      TEXT NOT NULL,
                content       TEXT NOT NULL,
                channel       TEXT NOT NULL,
                source        TEXT NOT NULL,
                PRIMARY KEY (hive_id, id),
                UNIQUE (hive_id, uid)
            );

            CREATE INDEX IF NOT EXISTS idx_messages_created
                ON messages(hive_id, created_at_ms);
            ",
        )?;
        Ok(())
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HiveMessage> {
        let source: String = row.get(8)?;
        Ok(HiveMessage {
            hive_id: row.get(0)?,
            id: row.get(1)?,
            uid: row.get(2)?,
            ts: row.get(3)?,
            created_at_ms: row.get(4)?,
            agent_id: row.get(5)?,
            content: row.get(6)?,
            channel: row.get(7)?,
            source: MessageSource::parse(&source).unwrap_or(MessageSource::Gossip),
        })
    }

    fn query(
        &self,
        sql: &str,
        hive_id: &str,
        since: i64,
        limit: usize,
    ) -> Result<Vec<HiveMessage>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![hive_id, since, limit as i64], Self::map_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

impl MessageBackend for SqliteBackend {
    fn insert(&mut self, message: &HiveMessage) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO messages
                 (hive_id, id, uid, ts, created_at_ms, agent_id, content, channel, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.hive_id,
                message.id,
                message.uid,
                message.ts,
                message.created_at_ms,
                message.agent_id,
                message.content,
                message.channel,
                message.source.as_str(),
            ],
        )?;
        Ok(())
    }

    fn contains_uid(&self, hive_id: &str, uid: &str) -> Result<bool, StoreError> {
        let found: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE hive_id = ?1 AND uid = ?2",
            params![hive_id, uid],
            |row| row.get(0),
        )?;
        Ok(found > 0)
    }

    fn max_id(&self, hive_id: &str) -> Result<i64, StoreError> {
        let max: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM messages WHERE hive_id = ?1",
            params![hive_id],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    fn read_since(
        &self,
        hive_id: &str,
        since_id: i64,
        limit: usize,
    ) -> Result<Vec<HiveMessage>, StoreError> {
        self.query(
            "SELECT hive_id, id, uid, ts, created_at_ms, agent_id, content, channel, source
             FROM messages
             WHERE hive_id = ?1 AND id > ?2
             ORDER BY id ASC
             LIMIT ?3",
            hive_id,
            since_id,
            limit,
        )
    }

    fn read_since_time(
        &self,
        hive_id: &str,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<HiveMessage>, StoreError> {
        self.query(
            "SELECT hive_id, id, uid, ts, created_at_ms, agent_id, content, channel, source
             FROM messages
             WHERE hive_id = ?1 AND created_at_ms > ?2
             ORDER BY created_at_ms ASC, id ASC
             LIMIT ?3",
            hive_id,
            since_ms,
            limit,
        )
    }

    fn count(&self, hive_id: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE hive_id = ?1",
            params![hive_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
