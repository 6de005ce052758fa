//! Presence persistence

use crate::{now_millis, storage::ConnectionState, storage::Database, Result};
use rusqlite::{params, OptionalExtension};

/// Reads and writes `connection_state` rows
#[derive(Clone)]
pub struct PresenceStore {
    db: Database,
}

impl PresenceStore {
    /// Create a store backed by the server data store
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record an online/offline transition
    pub fn set(&self, user_id: &str, online: bool) -> Result<ConnectionState> {
        let state = ConnectionState {
            user_id: user_id.to_string(),
            online,
            last_seen: now_millis(),
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO connection_state (user_id, online, last_seen) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET online = excluded.online, last_seen = excluded.last_seen",
                params![state.user_id, state.online, state.last_seen],
            )?;
            Ok(())
        })?;
        Ok(state)
    }

    /// Current state of a user; users that never connected are offline
    pub fn get(&self, user_id: &str) -> Result<ConnectionState> {
        let state = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT user_id, online, last_seen FROM connection_state WHERE user_id = ?1",
                    params![user_id],
                    |row| {
                        Ok(ConnectionState {
                            user_id: row.get(0)?,
                            online: row.get(1)?,
                            last_seen: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })?;
        Ok(state.unwrap_or_else(|| ConnectionState::unknown(user_id)))
    }

    /// Mark every user offline; run at startup since no session survives a restart
    pub fn reset_all(&self) -> Result<usize> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE connection_state SET online = 0 WHERE online = 1",
                [],
            )?)
        })
    }
}
