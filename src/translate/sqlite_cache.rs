//! Persistent segment cache backed by SQLite.
//! One table shared by all backends, partitioned by namespace. No TTL: entries
//! only go stale through key changes.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::cache::{CacheError, SegmentCache};

pub struct SqliteSegmentCache {
    conn: Mutex<Connection>,
    namespace: String,
}

impl SqliteSegmentCache {
    /// Open (or create) the cache database at `db_path`.
    pub fn open(db_path: &Path, namespace: &str) -> Result<Self, CacheError> {
        let conn = Connection::open(db_path)
            .map_err(|e| CacheError::Storage(format!("failed to open SQLite cache: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| CacheError::Storage(format!("PRAGMA failed: {e}")))?;

        let cache = Self::with_connection(conn, namespace)?;
        info!(path = %db_path.display(), namespace, "segment cache opened");
        Ok(cache)
    }

    pub fn open_in_memory(namespace: &str) -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CacheError::Storage(format!("failed to open in-memory cache: {e}")))?;
        Self::with_connection(conn, namespace)
    }

    fn with_connection(conn: Connection, namespace: &str) -> Result<Self, CacheError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS segment_cache (
                namespace TEXT NOT NULL,
                cache_key TEXT NOT NULL,
                lines TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, cache_key)
            );",
        )
        .map_err(|e| CacheError::Storage(format!("create table failed: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            namespace: namespace.to_string(),
        })
    }

    pub fn entry_count(&self) -> Result<usize, CacheError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM segment_cache WHERE namespace = ?1",
            params![self.namespace],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .map_err(|e| CacheError::Storage(e.to_string()))
    }
}

impl SegmentCache for SqliteSegmentCache {
    fn get(&self, key: &str) -> Result<Option<Vec<String>>, CacheError> {
        let raw: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT lines FROM segment_cache WHERE namespace = ?1 AND cache_key = ?2",
                params![self.namespace, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| CacheError::Storage(e.to_string()))?
        };

        match raw {
            Some(raw) => {
                let lines = serde_json::from_str(&raw)
                    .map_err(|e| CacheError::Corrupt(format!("{key}: {e}")))?;
                debug!(namespace = %self.namespace, "segment cache hit");
                Ok(Some(lines))
            }
            None => Ok(None),
        }
    }

    fn save(&self, key: &str, lines: &[String]) -> Result<(), CacheError> {
        let payload =
            serde_json::to_string(lines).map_err(|e| CacheError::Storage(e.to_string()))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO segment_cache (namespace, cache_key, lines, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![self.namespace, key, payload, now_unix()],
        )
        .map_err(|e| CacheError::Storage(format!("insert failed: {e}")))?;
        Ok(())
    }
}

/// Current time as Unix timestamp (seconds).
fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
