//! Thread management module
//!
//! Owns thread identity, participant pairing and activity metadata. Every
//! read or write on a thread goes through [`ThreadManager::authorize`].

use crate::{
    now_millis,
    storage::{
        database::is_unique_violation,
        thread::{unordered_pair, validate_id},
        Database, ParticipantRole, Thread, ThreadMetadata, ThreadStatus,
    },
    Error, Result,
};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Thread manager backed by the server data store
#[derive(Clone)]
pub struct ThreadManager {
    db: Database,
}

impl ThreadManager {
    /// Create a thread manager
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Return the active thread for the unordered pair, creating it if needed
    ///
    /// Concurrent first-contact requests for the same pair resolve to the
    /// same thread: the loser of the insert race re-reads the winner's row.
    pub fn create_or_get_thread(
        &self,
        initiator_id: &str,
        counterparty_id: &str,
        metadata: ThreadMetadata,
    ) -> Result<Thread> {
        validate_id("initiator id", initiator_id)?;
        validate_id("counterparty id", counterparty_id)?;
        if initiator_id == counterparty_id {
            return Err(Error::Validation(
                "a thread needs two distinct participants".to_string(),
            ));
        }

        let (low, high) = unordered_pair(initiator_id, counterparty_id);

        let created = self.db.transaction(|tx| {
            if let Some(existing) = find_active_pair(tx, low, high)? {
                return Ok(existing);
            }

            let now = now_millis();
            let thread = Thread {
                id: Uuid::new_v4().to_string(),
                initiator_id: initiator_id.to_string(),
                counterparty_id: counterparty_id.to_string(),
                origin_ref: metadata.origin_ref.clone(),
                status: ThreadStatus::Active,
                created_at: now,
                last_activity_at: now,
            };

            tx.execute(
                "INSERT INTO threads (id, initiator_id, counterparty_id, participant_low, participant_high,
                                      origin_ref, status, created_at, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    thread.id,
                    thread.initiator_id,
                    thread.counterparty_id,
                    low,
                    high,
                    thread.origin_ref,
                    thread.status.as_i64(),
                    thread.created_at,
                    thread.last_activity_at,
                ],
            )?;
            info!("Created thread {}", thread.id);
            Ok(thread)
        });

        match created {
            Ok(thread) => Ok(thread),
            Err(e) if is_unique_violation(&e) => {
                debug!("Pair uniqueness race resolved by re-reading existing thread");
                self.db
                    .with_conn(|conn| find_active_pair(conn, low, high))?
                    .ok_or_else(|| Error::Conflict("thread pair race could not be resolved".to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Load a thread without an authorization check
    pub(crate) fn load(&self, thread_id: &str) -> Result<Thread> {
        validate_id("thread id", thread_id)?;
        self.db
            .with_conn(|conn| load_thread(conn, thread_id))?
            .ok_or_else(|| Error::NotFound(format!("thread {}", thread_id)))
    }

    /// Load a thread and check that `user_id` participates in it
    pub fn authorize(&self, thread_id: &str, user_id: &str) -> Result<(Thread, ParticipantRole)> {
        let thread = self.load(thread_id)?;
        match thread.role_of(user_id) {
            Some(role) => Ok((thread, role)),
            None => {
                warn!(target: "audit", "Forbidden access to thread {} by {}", thread_id, user_id);
                Err(Error::Forbidden(format!(
                    "user {} is not a participant of thread {}",
                    user_id, thread_id
                )))
            }
        }
    }

    /// Get a thread on behalf of a participant
    pub fn get_thread(&self, thread_id: &str, caller_id: &str) -> Result<Thread> {
        self.authorize(thread_id, caller_id).map(|(thread, _)| thread)
    }

    /// All threads where the user participates, most recent activity first
    pub fn list_threads(&self, user_id: &str) -> Result<Vec<Thread>> {
        validate_id("user id", user_id)?;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM threads
                 WHERE initiator_id = ?1 OR counterparty_id = ?1
                 ORDER BY last_activity_at DESC, id ASC",
                Thread::COLUMNS
            ))?;
            let threads = stmt
                .query_map(params![user_id], Thread::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(threads)
        })
    }

    /// Active threads for a user (the rooms a session joins)
    pub fn active_thread_ids(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .list_threads(user_id)?
            .into_iter()
            .filter(Thread::is_active)
            .map(|thread| thread.id)
            .collect())
    }

    /// Move last-activity forward; never moves it backwards
    pub fn touch_activity(&self, thread_id: &str, timestamp: i64) -> Result<()> {
        let updated = self.db.with_conn(|conn| touch_activity_in(conn, thread_id, timestamp))?;
        if !updated {
            self.load(thread_id)?;
        }
        Ok(())
    }

    /// Archive a thread on behalf of a participant (idempotent)
    pub fn archive(&self, thread_id: &str, caller_id: &str) -> Result<Thread> {
        let (mut thread, _) = self.authorize(thread_id, caller_id)?;
        if thread.status == ThreadStatus::Archived {
            return Ok(thread);
        }

        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE threads SET status = ?2 WHERE id = ?1",
                params![thread_id, ThreadStatus::Archived.as_i64()],
            )?;
            Ok(())
        })?;

        info!("Archived thread {}", thread_id);
        thread.status = ThreadStatus::Archived;
        Ok(thread)
    }
}

fn find_active_pair(conn: &rusqlite::Connection, low: &str, high: &str) -> Result<Option<Thread>> {
    let thread = conn
        .query_row(
            &format!(
                "SELECT {} FROM threads
                 WHERE participant_low = ?1 AND participant_high = ?2 AND status = ?3",
                Thread::COLUMNS
            ),
            params![low, high, ThreadStatus::Active.as_i64()],
            Thread::from_row,
        )
        .optional()?;
    Ok(thread)
}

pub(crate) fn load_thread(conn: &rusqlite::Connection, thread_id: &str) -> Result<Option<Thread>> {
    let thread = conn
        .query_row(
            &format!("SELECT {} FROM threads WHERE id = ?1", Thread::COLUMNS),
            params![thread_id],
            Thread::from_row,
        )
        .optional()?;
    Ok(thread)
}

/// Advance last-activity inside an existing transaction
pub(crate) fn touch_activity_in(conn: &rusqlite::Connection, thread_id: &str, timestamp: i64) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE threads SET last_activity_at = MAX(last_activity_at, ?2) WHERE id = ?1",
        params![thread_id, timestamp],
    )?;
    Ok(rows > 0)
}
