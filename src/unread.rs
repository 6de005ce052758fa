//! Unread counters and offline notifications
//!
//! [`UnreadTracker`] keeps a total and per-thread unread counter for every
//! viewing user. Counters are backed by the set of unread message ids, so
//! replaying the same increment or read twice never drifts from the store.
//! [`NotificationQueue`] persists "you have a new message" records for
//! recipients that were offline at delivery time; it stores identifiers
//! only, never content.

use crate::{now_millis, storage::Database, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

/// Unread counters of one user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadSnapshot {
    /// Sum over all threads
    pub total: u64,
    /// Per-thread counters; zero entries are omitted
    pub threads: HashMap<String, u64>,
}

impl UnreadSnapshot {
    /// Counter for one thread
    pub fn thread(&self, thread_id: &str) -> u64 {
        self.threads.get(thread_id).copied().unwrap_or(0)
    }
}

/// Authoritative unread state the tracker re-reads from
pub trait UnreadSource {
    /// Unread message ids per thread for a user
    fn unread_ids(&self, user_id: &str) -> Result<HashMap<String, Vec<String>>>;

    /// Whether one message is still unread for a user
    fn is_unread(&self, message_id: &str, user_id: &str) -> Result<bool>;
}

#[derive(Debug, Default)]
struct UserUnread {
    threads: HashMap<String, HashSet<String>>,
}

impl UserUnread {
    fn from_ids(unread: HashMap<String, Vec<String>>) -> Self {
        let threads = unread
            .into_iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(thread_id, ids)| (thread_id, ids.into_iter().collect()))
            .collect();
        Self { threads }
    }

    fn snapshot(&self) -> UnreadSnapshot {
        let threads: HashMap<String, u64> = self
            .threads
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(thread_id, ids)| (thread_id.clone(), ids.len() as u64))
            .collect();
        UnreadSnapshot {
            total: threads.values().sum(),
            threads,
        }
    }

    fn insert(&mut self, thread_id: &str, message_id: &str) {
        self.threads
            .entry(thread_id.to_string())
            .or_default()
            .insert(message_id.to_string());
    }
}

/// In-memory unread counters keyed by viewing user
///
/// A user is tracked once seeded. Reads and increments for users that were
/// never seeded are ignored; the next seed picks their state up from the
/// store instead.
#[derive(Clone, Default)]
pub struct UnreadTracker {
    users: Arc<Mutex<HashMap<String, UserUnread>>>,
}

impl UnreadTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UserUnread>> {
        // Counters hold no invariants a panic could break halfway
        self.users.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace a user's counters with unread message ids loaded from the store
    pub fn seed(&self, user_id: &str, unread: HashMap<String, Vec<String>>) -> UnreadSnapshot {
        let counters = UserUnread::from_ids(unread);
        let snapshot = counters.snapshot();
        self.lock().insert(user_id.to_string(), counters);
        debug!("Seeded unread counters for {} (total {})", user_id, snapshot.total);
        snapshot
    }

    /// Re-seed a user from the store while holding the counters
    ///
    /// Holding the lock across the read keeps a concurrent increment or read
    /// from landing between the load and the replace.
    pub fn seed_from<S: UnreadSource + ?Sized>(&self, user_id: &str, source: &S) -> Result<UnreadSnapshot> {
        let mut users = self.lock();
        let counters = UserUnread::from_ids(source.unread_ids(user_id)?);
        let snapshot = counters.snapshot();
        users.insert(user_id.to_string(), counters);
        debug!("Seeded unread counters for {} (total {})", user_id, snapshot.total);
        Ok(snapshot)
    }

    /// One more unread message in a thread; counting the same message twice is a no-op
    ///
    /// Returns `None` for a user that was never seeded.
    pub fn increment(&self, user_id: &str, thread_id: &str, message_id: &str) -> Option<UnreadSnapshot> {
        let mut users = self.lock();
        let counters = users.get_mut(user_id)?;
        counters.insert(thread_id, message_id);
        Some(counters.snapshot())
    }

    /// Count a delivered message, checking the store under the counters' lock
    ///
    /// An untracked user is seeded instead; a message read before this runs
    /// is not counted.
    pub fn increment_from<S: UnreadSource + ?Sized>(
        &self,
        user_id: &str,
        thread_id: &str,
        message_id: &str,
        source: &S,
    ) -> Result<UnreadSnapshot> {
        let mut users = self.lock();
        match users.get_mut(user_id) {
            Some(counters) => {
                if source.is_unread(message_id, user_id)? {
                    counters.insert(thread_id, message_id);
                }
                Ok(counters.snapshot())
            }
            None => {
                let counters = UserUnread::from_ids(source.unread_ids(user_id)?);
                let snapshot = counters.snapshot();
                users.insert(user_id.to_string(), counters);
                Ok(snapshot)
            }
        }
    }

    /// Subtract read messages from a thread, never going below zero
    ///
    /// Messages that were not counted are skipped. Returns `None` for a user
    /// that was never seeded.
    pub fn decrement(&self, user_id: &str, thread_id: &str, message_ids: &[String]) -> Option<UnreadSnapshot> {
        let mut users = self.lock();
        let counters = users.get_mut(user_id)?;
        if let Some(unread) = counters.threads.get_mut(thread_id) {
            for message_id in message_ids {
                unread.remove(message_id);
            }
            if unread.is_empty() {
                counters.threads.remove(thread_id);
            }
        }
        Some(counters.snapshot())
    }

    /// Zero a thread's counter and subtract its prior value from the total
    pub fn mark_thread_read(&self, user_id: &str, thread_id: &str) -> Option<UnreadSnapshot> {
        let mut users = self.lock();
        let counters = users.get_mut(user_id)?;
        counters.threads.remove(thread_id);
        Some(counters.snapshot())
    }

    /// Current counters of a user
    pub fn counts(&self, user_id: &str) -> UnreadSnapshot {
        self.lock().get(user_id).map(UserUnread::snapshot).unwrap_or_default()
    }

    /// Whether counters were seeded for a user
    pub fn is_tracked(&self, user_id: &str) -> bool {
        self.lock().contains_key(user_id)
    }
}

/// A queued offline notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification ID
    pub id: String,
    /// Offline recipient
    pub recipient_id: String,
    /// Thread of the message
    pub thread_id: String,
    /// Message to catch up on
    pub message_id: String,
    /// Queue time (Unix milliseconds)
    pub created_at: i64,
    /// Flush time, `None` while pending
    pub delivered_at: Option<i64>,
}

/// Durable queue of notifications for offline recipients
#[derive(Clone)]
pub struct NotificationQueue {
    db: Database,
}

impl NotificationQueue {
    /// Create a queue backed by the server data store
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Queue a notification for an offline recipient
    pub fn enqueue(&self, recipient_id: &str, thread_id: &str, message_id: &str) -> Result<Notification> {
        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            recipient_id: recipient_id.to_string(),
            thread_id: thread_id.to_string(),
            message_id: message_id.to_string(),
            created_at: now_millis(),
            delivered_at: None,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications (id, recipient_id, thread_id, message_id, created_at, delivered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                params![
                    notification.id,
                    notification.recipient_id,
                    notification.thread_id,
                    notification.message_id,
                    notification.created_at,
                ],
            )?;
            Ok(())
        })?;

        debug!("Queued notification for {} (message {})", recipient_id, message_id);
        Ok(notification)
    }

    /// Notifications not yet flushed, oldest first
    pub fn pending(&self, recipient_id: &str) -> Result<Vec<Notification>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, recipient_id, thread_id, message_id, created_at, delivered_at
                 FROM notifications WHERE recipient_id = ?1 AND delivered_at IS NULL
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            let pending = stmt
                .query_map(params![recipient_id], |row| {
                    Ok(Notification {
                        id: row.get(0)?,
                        recipient_id: row.get(1)?,
                        thread_id: row.get(2)?,
                        message_id: row.get(3)?,
                        created_at: row.get(4)?,
                        delivered_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(pending)
        })
    }

    /// Mark every pending notification delivered and return them
    pub fn flush(&self, recipient_id: &str) -> Result<Vec<Notification>> {
        let mut pending = self.pending(recipient_id)?;
        if pending.is_empty() {
            return Ok(pending);
        }

        let now = now_millis();
        let ids: Vec<String> = pending.iter().map(|n| n.id.clone()).collect();
        self.db.transaction(|tx| {
            for id in &ids {
                tx.execute(
                    "UPDATE notifications SET delivered_at = ?2 WHERE id = ?1 AND delivered_at IS NULL",
                    params![id, now],
                )?;
            }
            Ok(())
        })?;

        for notification in &mut pending {
            notification.delivered_at = Some(now);
        }
        info!("Flushed {} notifications for {}", pending.len(), recipient_id);
        Ok(pending)
    }
}
