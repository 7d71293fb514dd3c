//! Durable local history cache.
//!
//! A key-value interface keyed by chat id, deliberately decoupled from the
//! session store contract. The controller snapshots transcripts here
//! best-effort; cache failures are logged and never surfaced.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::ChatError;

/// Key-value transcript cache.
pub trait HistoryCache: Send + Sync {
    /// The cached transcript for a chat, if any.
    fn get(&self, chat_id: &str) -> Result<Option<String>, ChatError>;

    /// Store (or overwrite) the transcript for a chat.
    fn set(&self, chat_id: &str, transcript: &str) -> Result<(), ChatError>;

    /// Drop the cached transcript for a chat.
    fn remove(&self, chat_id: &str) -> Result<(), ChatError>;
}

/// SQLite-backed history cache.
///
/// Uses WAL mode. The connection is wrapped in a Mutex since rusqlite
/// Connection is not Sync.
pub struct SqliteHistoryCache {
    conn: Mutex<Connection>,
}

impl SqliteHistoryCache {
    /// Open (or create) a cache database at the given path.
    pub fn new(path: &Path) -> Result<Self, ChatError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ChatError::Cache(e.to_string()))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| ChatError::Cache(format!("Failed to open cache: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| ChatError::Cache(format!("Failed to set pragmas: {}", e)))?;

        info!("History cache opened at {}", path.display());

        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    /// Open an in-memory cache (for testing).
    pub fn in_memory() -> Result<Self, ChatError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ChatError::Cache(format!("Failed to open in-memory cache: {}", e)))?;
        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    fn init_schema(&self) -> Result<(), ChatError> {
        self.with_conn(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS transcripts (
                     chat_id    TEXT PRIMARY KEY,
                     transcript TEXT NOT NULL,
                     updated_at INTEGER NOT NULL
                 )",
                [],
            )
            .map_err(|e| ChatError::Cache(e.to_string()))?;
            Ok(())
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, ChatError>
    where
        F: FnOnce(&Connection) -> Result<T, ChatError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ChatError::Cache(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }
}

impl HistoryCache for SqliteHistoryCache {
    fn get(&self, chat_id: &str) -> Result<Option<String>, ChatError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT transcript FROM transcripts WHERE chat_id = ?1",
                rusqlite::params![chat_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| ChatError::Cache(e.to_string()))
        })
    }

    fn set(&self, chat_id: &str, transcript: &str) -> Result<(), ChatError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO transcripts (chat_id, transcript, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(chat_id) DO UPDATE SET
                     transcript = excluded.transcript,
                     updated_at = excluded.updated_at",
                rusqlite::params![chat_id, transcript, Utc::now().timestamp()],
            )
            .map_err(|e| ChatError::Cache(e.to_string()))?;
            Ok(())
        })
    }

    fn remove(&self, chat_id: &str) -> Result<(), ChatError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM transcripts WHERE chat_id = ?1",
                rusqlite::params![chat_id],
            )
            .map_err(|e| ChatError::Cache(e.to_string()))?;
            Ok(())
        })
    }
}
