//! Durable client-side store
//!
//! One CBOR-encoded [`ThreadRecord`] per row, keyed by thread id, so each
//! thread is read and written independently of every other thread.

use super::state::ThreadRecord;
use crate::{now_millis, Error, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sync_threads (
    thread_id TEXT PRIMARY KEY,
    record BLOB NOT NULL,
    updated_at INTEGER NOT NULL
);
";

/// SQLite-backed store of thread records
#[derive(Clone)]
pub struct SyncStore {
    conn: Arc<Mutex<Connection>>,
}

impl SyncStore {
    /// Open (or create) a store file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("Failed to open sync store: {}", e)))?;
        Self::from_connection(conn)
    }

    /// Create an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory sync store: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("Sync store mutex poisoned".to_string()))
    }

    /// Record for a thread; an empty record if none was saved
    pub fn load(&self, thread_id: &str) -> Result<ThreadRecord> {
        let conn = self.lock()?;
        Ok(read_record(&conn, thread_id)?.unwrap_or_else(|| ThreadRecord::new(thread_id)))
    }

    /// Whether a record exists for a thread
    pub fn contains(&self, thread_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        Ok(read_record(&conn, thread_id)?.is_some())
    }

    /// Persist a record, replacing the previous one
    pub fn save(&self, record: &ThreadRecord) -> Result<()> {
        let conn = self.lock()?;
        write_record(&conn, record)
    }

    /// Read-modify-write one record atomically
    pub fn update<T, F>(&self, thread_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut ThreadRecord) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut record = read_record(&tx, thread_id)?.unwrap_or_else(|| ThreadRecord::new(thread_id));
        let out = f(&mut record)?;
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(out)
    }

    /// Delete one thread's record; other threads are untouched
    pub fn clear(&self, thread_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM sync_threads WHERE thread_id = ?1", params![thread_id])?;
        debug!("Cleared sync record for thread {}", thread_id);
        Ok(rows > 0)
    }

    /// Threads with a stored record
    pub fn thread_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT thread_id FROM sync_threads ORDER BY thread_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}

fn read_record(conn: &Connection, thread_id: &str) -> Result<Option<ThreadRecord>> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT record FROM sync_threads WHERE thread_id = ?1",
            params![thread_id],
            |row| row.get(0),
        )
        .optional()?;

    blob.map(|bytes| {
        serde_cbor::from_slice(&bytes)
            .map_err(|e| Error::CborSerialization(format!("Failed to deserialize thread record: {}", e)))
    })
    .transpose()
}

fn write_record(conn: &Connection, record: &ThreadRecord) -> Result<()> {
    let cbor = serde_cbor::to_vec(record)
        .map_err(|e| Error::CborSerialization(format!("Failed to serialize thread record: {}", e)))?;
    conn.execute(
        "INSERT INTO sync_threads (thread_id, record, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(thread_id) DO UPDATE SET record = excluded.record, updated_at = excluded.updated_at",
        params![record.thread_id(), cbor, now_millis()],
    )?;
    Ok(())
}
