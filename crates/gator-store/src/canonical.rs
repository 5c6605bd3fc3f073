use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use gator::{CanonicalError, CanonicalStore, Fingerprint, Payload, RecordKey};
use rusqlite::{ErrorCode, OptionalExtension};
use tracing::debug;

use crate::schema;

/// A document as persisted in the canonical store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub key: RecordKey,
    pub payload: Payload,
    pub fingerprint: Fingerprint,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub updated_at: i64,
}

/// A SQLite-backed canonical document store.
pub struct SqliteCanonicalStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteCanonicalStore {
    /// Open a store backed by a file on disk, creating it if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Database(format!("{}: {e}", parent.display())))?;
        }

        let conn =
            rusqlite::Connection::open(path).map_err(|e| StoreError::Database(e.to_string()))?;

        let mut store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&mut self) -> Result<(), StoreError> {
        let conn = self
            .conn
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        schema::migrations()
            .to_latest(conn)
            .map_err(|e| StoreError::Migration(e.to_string()))
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read a full document back.
    pub fn document(&self, key: &RecordKey) -> Result<Option<StoredDocument>, CanonicalError> {
        let row = self
            .conn()
            .query_row(
                "SELECT payload, fingerprint, created_at, updated_at
                 FROM documents
                 WHERE key = ?1",
                [key.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| classify(key, e))?;

        let Some((payload, fingerprint, created_at, updated_at)) = row else {
            return Ok(None);
        };
        let payload = serde_json::from_str(&payload)
            .map_err(|e| CanonicalError::Other(format!("corrupt payload for {key}: {e}")))?;

        Ok(Some(StoredDocument {
            key: key.clone(),
            payload,
            fingerprint: Fingerprint::from_stored(fingerprint),
            created_at,
            updated_at,
        }))
    }

    /// Number of stored documents.
    pub fn count(&self) -> Result<usize, CanonicalError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .map_err(unavailable_or_other)?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl CanonicalStore for SqliteCanonicalStore {
    async fn upsert(
        &self,
        key: &RecordKey,
        payload: &Payload,
        fingerprint: &Fingerprint,
    ) -> Result<(), CanonicalError> {
        let payload_json =
            serde_json::to_string(payload).map_err(|e| CanonicalError::Rejected {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        let now = now_millis();

        self.conn()
            .execute(
                "INSERT INTO documents (key, payload, fingerprint, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT (key) DO UPDATE SET
                    payload = excluded.payload,
                    fingerprint = excluded.fingerprint,
                    updated_at = excluded.updated_at",
                rusqlite::params![key.as_str(), payload_json, fingerprint.as_str(), now],
            )
            .map_err(|e| classify(key, e))?;

        debug!(%key, "upserted document");
        Ok(())
    }

    async fn get_fingerprint(&self, key: &RecordKey) -> Result<Option<Fingerprint>, CanonicalError> {
        self.conn()
            .query_row(
                "SELECT fingerprint FROM documents WHERE key = ?1",
                [key.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map(|fingerprint| fingerprint.map(Fingerprint::from_stored))
            .map_err(|e| classify(key, e))
    }

    async fn keys(&self) -> Result<Vec<RecordKey>, CanonicalError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT key FROM documents ORDER BY key")
            .map_err(unavailable_or_other)?;

        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(unavailable_or_other)?
            .map(|key| key.map(RecordKey::new).map_err(unavailable_or_other))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), CanonicalError> {
        self.conn()
            .execute("DELETE FROM documents WHERE key = ?1", [key.as_str()])
            .map_err(|e| classify(key, e))?;
        Ok(())
    }
}

/// Errors opening or migrating the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("migration error: {0}")]
    Migration(String),
}

/// Whether a SQLite failure means the database as a whole is unusable,
/// as opposed to one statement being refused.
fn is_connection_failure(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::DiskFull
                | ErrorCode::ReadOnly
                | ErrorCode::OutOfMemory
        )
    )
}

fn classify(key: &RecordKey, e: rusqlite::Error) -> CanonicalError {
    if is_connection_failure(&e) {
        CanonicalError::Unavailable(e.to_string())
    } else {
        CanonicalError::Rejected {
            key: key.clone(),
            reason: e.to_string(),
        }
    }
}

fn unavailable_or_other(e: rusqlite::Error) -> CanonicalError {
    if is_connection_failure(&e) {
        CanonicalError::Unavailable(e.to_string())
    } else {
        CanonicalError::Other(e.to_string())
    }
}

fn now_millis() -> i64 {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    i64::try_from(millis).unwrap_or(i64::MAX)
}
