//! Thread model and participant roles

use crate::{Error, Result};
use rusqlite::{types::Type, Row};
use serde::{Deserialize, Serialize};

/// Role of a participant within a thread
///
/// Roles are symmetric in capability; the tag only records who opened the
/// thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    /// Participant who opened the thread
    Initiator,
    /// The other participant
    Counterparty,
}

impl ParticipantRole {
    pub(crate) fn as_i64(self) -> i64 {
        match self {
            ParticipantRole::Initiator => 0,
            ParticipantRole::Counterparty => 1,
        }
    }

    pub(crate) fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(ParticipantRole::Initiator),
            1 => Some(ParticipantRole::Counterparty),
            _ => None,
        }
    }

    /// The opposite role
    pub fn other(self) -> Self {
        match self {
            ParticipantRole::Initiator => ParticipantRole::Counterparty,
            ParticipantRole::Counterparty => ParticipantRole::Initiator,
        }
    }
}

/// Thread lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    /// Open for new messages
    Active,
    /// Hidden from the active set; never deleted
    Archived,
}

impl ThreadStatus {
    pub(crate) fn as_i64(self) -> i64 {
        match self {
            ThreadStatus::Active => 0,
            ThreadStatus::Archived => 1,
        }
    }

    pub(crate) fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(ThreadStatus::Active),
            1 => Some(ThreadStatus::Archived),
            _ => None,
        }
    }
}

/// Optional data supplied when a thread is opened
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMetadata {
    /// Link to an external originating record (e.g. a lead)
    #[serde(default)]
    pub origin_ref: Option<String>,
}

/// A conversation between exactly two participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    /// Thread ID
    pub id: String,
    /// Participant who opened the thread
    pub initiator_id: String,
    /// The other participant
    pub counterparty_id: String,
    /// Link to an external originating record
    pub origin_ref: Option<String>,
    /// Lifecycle status
    pub status: ThreadStatus,
    /// Creation time (Unix milliseconds)
    pub created_at: i64,
    /// Time of the latest message (Unix milliseconds)
    pub last_activity_at: i64,
}

impl Thread {
    /// Role of `user_id` in this thread, if they participate
    pub fn role_of(&self, user_id: &str) -> Option<ParticipantRole> {
        if self.initiator_id == user_id {
            Some(ParticipantRole::Initiator)
        } else if self.counterparty_id == user_id {
            Some(ParticipantRole::Counterparty)
        } else {
            None
        }
    }

    /// Whether `user_id` participates in this thread
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.role_of(user_id).is_some()
    }

    /// User id holding the given role
    pub fn participant(&self, role: ParticipantRole) -> &str {
        match role {
            ParticipantRole::Initiator => &self.initiator_id,
            ParticipantRole::Counterparty => &self.counterparty_id,
        }
    }

    /// The other participant, seen from `user_id`
    pub fn other_participant(&self, user_id: &str) -> Option<&str> {
        self.role_of(user_id).map(|role| self.participant(role.other()))
    }

    /// Whether the thread is active
    pub fn is_active(&self) -> bool {
        self.status == ThreadStatus::Active
    }

    pub(crate) const COLUMNS: &'static str =
        "id, initiator_id, counterparty_id, origin_ref, status, created_at, last_activity_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: i64 = row.get(4)?;
        Ok(Thread {
            id: row.get(0)?,
            initiator_id: row.get(1)?,
            counterparty_id: row.get(2)?,
            origin_ref: row.get(3)?,
            status: ThreadStatus::from_i64(status).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(4, Type::Integer, "unknown thread status".into())
            })?,
            created_at: row.get(5)?,
            last_activity_at: row.get(6)?,
        })
    }
}

/// Order a participant pair so that (a, b) and (b, a) map to the same key
pub fn unordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Reject empty or whitespace-only identifiers
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", kind)));
    }
    if id.len() > 128 {
        return Err(Error::Validation(format!("{} is too long", kind)));
    }
    Ok(())
}
