//! SQLite-based storage backend
//!
//! A single connection guarded by a mutex. Every write goes through an
//! immediate transaction, which is the serialization point for per-thread
//! message ordering.

use crate::{retry::RetryPolicy, Error, Result};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS threads (
    id TEXT PRIMARY KEY,
    initiator_id TEXT NOT NULL,
    counterparty_id TEXT NOT NULL,
    participant_low TEXT NOT NULL,
    participant_high TEXT NOT NULL,
    origin_ref TEXT,
    status INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    last_activity_at INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_threads_active_pair
    ON threads(participant_low, participant_high) WHERE status = 0;

CREATE INDEX IF NOT EXISTS idx_threads_initiator ON threads(initiator_id);
CREATE INDEX IF NOT EXISTS idx_threads_counterparty ON threads(counterparty_id);

CREATE TABLE IF NOT EXISTS thread_keys (
    thread_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    wrapped_key BLOB NOT NULL,
    nonce BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (thread_id, version)
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    sender_id TEXT NOT NULL,
    sender_role INTEGER NOT NULL,
    content_type INTEGER NOT NULL,
    key_version INTEGER NOT NULL,
    nonce BLOB NOT NULL,
    content BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    status INTEGER NOT NULL,
    client_ref TEXT,
    FOREIGN KEY (thread_id) REFERENCES threads(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_thread_seq ON messages(thread_id, seq);
CREATE INDEX IF NOT EXISTS idx_messages_thread_created ON messages(thread_id, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_client_ref
    ON messages(thread_id, sender_id, client_ref) WHERE client_ref IS NOT NULL;

CREATE TABLE IF NOT EXISTS attachments (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    byte_size INTEGER NOT NULL,
    storage_url TEXT NOT NULL,
    thumbnail_url TEXT,
    FOREIGN KEY (message_id) REFERENCES messages(id)
);

CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);

CREATE TABLE IF NOT EXISTS message_deletions (
    message_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    deleted_at INTEGER NOT NULL,
    PRIMARY KEY (message_id, user_id)
);

CREATE TABLE IF NOT EXISTS read_receipts (
    message_id TEXT NOT NULL,
    reader_id TEXT NOT NULL,
    read_at INTEGER NOT NULL,
    PRIMARY KEY (message_id, reader_id)
);

CREATE TABLE IF NOT EXISTS connection_state (
    user_id TEXT PRIMARY KEY,
    online INTEGER NOT NULL,
    last_seen INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    recipient_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    delivered_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_notifications_pending ON notifications(recipient_id, delivered_at);
";

/// Cloneable handle to the server data store
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl Database {
    /// Open (or create) a database file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;
        Self::from_connection(conn)
    }

    /// Create an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        debug!("Database schema initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retry: RetryPolicy::default(),
        })
    }

    /// Replace the retry policy used for transient storage failures
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run a read or single-statement operation
    pub fn with_conn<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Connection) -> Result<T>,
    {
        self.retry.run_blocking(|| {
            let guard = self
                .conn
                .lock()
                .map_err(|_| Error::Storage("Database mutex poisoned".to_string()))?;
            f(&guard).map_err(classify)
        })
    }

    /// Run an operation inside an immediate (write-locking) transaction
    pub fn transaction<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Transaction<'_>) -> Result<T>,
    {
        self.retry.run_blocking(|| {
            let mut guard = self
                .conn
                .lock()
                .map_err(|_| Error::Storage("Database mutex poisoned".to_string()))?;
            let tx = guard
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| classify(e.into()))?;
            let out = f(&tx).map_err(classify)?;
            tx.commit().map_err(|e| classify(e.into()))?;
            Ok(out)
        })
    }
}

/// Map SQLite busy/locked failures to `Transient`
fn classify(err: Error) -> Error {
    match err {
        Error::Database(rusqlite::Error::SqliteFailure(e, msg))
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            Error::Transient(msg.unwrap_or_else(|| "database busy".to_string()))
        }
        other => other,
    }
}

/// Whether an error is a uniqueness constraint violation
pub fn is_unique_violation(err: &Error) -> bool {
    matches!(
        err,
        Error::Database(rusqlite::Error::SqliteFailure(e, _))
            if e.code == ErrorCode::ConstraintViolation
    )
}
