//! Client-local per-thread state
//!
//! One [`ThreadRecord`] per thread holds the sync cursor, the outbound queue
//! and the cache of server-confirmed messages. Queued entries and confirmed
//! messages are separate collections; [`ThreadRecord::merge`] is the only
//! place where a pending id is exchanged for its canonical message.

use crate::{
    now_millis,
    storage::{ContentType, DeliveryStatus, Message, NewAttachment},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-thread view state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSyncState {
    /// Thread ID
    pub thread_id: String,
    /// Last message the user has seen
    pub last_read_message_id: Option<String>,
    /// Scroll offset of the message list
    pub scroll_position: Option<i64>,
    /// Unread messages as last reported
    pub unread_count: u64,
    /// Newest server creation time merged so far (Unix milliseconds)
    pub last_sync_timestamp: i64,
}

/// Partial update of a [`ConversationSyncState`]; `None` fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePatch {
    /// New last-read message
    pub last_read_message_id: Option<String>,
    /// New scroll offset
    pub scroll_position: Option<i64>,
    /// New unread count
    pub unread_count: Option<u64>,
}

impl StatePatch {
    fn apply(self, state: &mut ConversationSyncState) {
        if let Some(id) = self.last_read_message_id {
            state.last_read_message_id = Some(id);
        }
        if let Some(position) = self.scroll_position {
            state.scroll_position = Some(position);
        }
        if let Some(count) = self.unread_count {
            state.unread_count = count;
        }
    }
}

/// Delivery state of a queued entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for the next drain
    Pending,
    /// Needs a user decision (retry or discard)
    Failed {
        /// Last failure
        reason: String,
        /// Whether retrying may succeed
        retryable: bool,
    },
}

/// Outbound message waiting for server confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOutboundMessage {
    /// Locally generated id, sent as the client reference
    pub pending_id: String,
    /// Target thread
    pub thread_id: String,
    /// Plaintext content
    pub content: String,
    /// Kind of content
    pub content_type: ContentType,
    /// Attachment metadata
    #[serde(default)]
    pub attachments: Vec<NewAttachment>,
    /// Enqueue time (Unix milliseconds)
    pub created_at: i64,
    /// Send attempts so far
    pub attempts: u32,
    /// Last failure message
    pub last_error: Option<String>,
    /// Current state
    pub status: QueueStatus,
}

impl QueuedOutboundMessage {
    /// Whether the next drain should send this entry
    pub fn is_pending(&self) -> bool {
        self.status == QueueStatus::Pending
    }
}

/// What a merge changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Messages not cached before
    pub added: usize,
    /// Queue entries resolved to canonical messages, as (pending id, message id)
    pub confirmed: Vec<(String, String)>,
}

/// An entry of the local timeline shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEntry {
    /// Server-confirmed message
    Confirmed(Message),
    /// Local entry still pending or failed
    Queued(QueuedOutboundMessage),
}

/// Durable record for one thread
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRecord {
    /// View state
    pub state: ConversationSyncState,
    /// Outbound FIFO queue
    pub queue: Vec<QueuedOutboundMessage>,
    /// Server-confirmed messages, in display order
    pub messages: Vec<Message>,
    /// Pending id -> canonical message id
    pub confirmed: HashMap<String, String>,
}

impl ThreadRecord {
    /// Empty record for a thread
    pub fn new(thread_id: &str) -> Self {
        Self {
            state: ConversationSyncState {
                thread_id: thread_id.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Thread ID
    pub fn thread_id(&self) -> &str {
        &self.state.thread_id
    }

    /// Append a new pending entry
    pub fn enqueue(
        &mut self,
        pending_id: String,
        content: String,
        content_type: ContentType,
        attachments: Vec<NewAttachment>,
    ) -> &QueuedOutboundMessage {
        let thread_id = self.state.thread_id.clone();
        self.queue.push(QueuedOutboundMessage {
            pending_id,
            thread_id,
            content,
            content_type,
            attachments,
            created_at: now_millis(),
            attempts: 0,
            last_error: None,
            status: QueueStatus::Pending,
        });
        &self.queue[self.queue.len() - 1]
    }

    /// First entry the drain should send
    pub fn next_pending(&self) -> Option<&QueuedOutboundMessage> {
        self.queue.iter().find(|entry| entry.is_pending())
    }

    /// Mutable access to a queue entry
    pub fn entry_mut(&mut self, pending_id: &str) -> Option<&mut QueuedOutboundMessage> {
        self.queue.iter_mut().find(|entry| entry.pending_id == pending_id)
    }

    /// Remove a queue entry
    pub fn remove_entry(&mut self, pending_id: &str) -> Option<QueuedOutboundMessage> {
        let index = self.queue.iter().position(|entry| entry.pending_id == pending_id)?;
        Some(self.queue.remove(index))
    }

    /// Incorporate server-confirmed messages
    ///
    /// Known ids are updated in place (status never moves backwards). A
    /// message whose client reference matches a queue entry removes that
    /// entry. `last_sync_timestamp` only moves forward.
    pub fn merge(&mut self, batch: Vec<Message>) -> MergeReport {
        let mut report = MergeReport::default();

        for message in batch {
            if let Some(client_ref) = &message.client_ref {
                if self.remove_entry(client_ref).is_some() {
                    self.confirmed.insert(client_ref.clone(), message.id.clone());
                    report.confirmed.push((client_ref.clone(), message.id.clone()));
                }
            }

            if message.created_at > self.state.last_sync_timestamp {
                self.state.last_sync_timestamp = message.created_at;
            }

            match self.messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => {
                    let status = existing.status.advance(message.status);
                    *existing = message;
                    existing.status = status;
                }
                None => {
                    self.messages.push(message);
                    report.added += 1;
                }
            }
        }

        self.messages.sort_by_key(Message::order_key);
        report
    }

    /// Advance a cached message's delivery status
    pub fn advance_status(&mut self, message_id: &str, status: DeliveryStatus) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) if message.status < status => {
                message.status = status;
                true
            }
            _ => false,
        }
    }

    /// Id of the newest confirmed message
    pub fn last_message_id(&self) -> Option<&str> {
        self.messages.last().map(|m| m.id.as_str())
    }

    /// Last message of the gap-free prefix of the cache (by thread sequence)
    ///
    /// Messages merged from live broadcasts can arrive ahead of ones missed
    /// while offline; fetching after this cursor fills those gaps.
    pub fn catch_up_cursor(&self) -> Option<&str> {
        let mut cursor: Option<&Message> = None;
        for message in &self.messages {
            let expected = cursor.map(|c| c.seq + 1).unwrap_or(1);
            if message.seq != expected {
                break;
            }
            cursor = Some(message);
        }
        cursor.map(|m| m.id.as_str())
    }

    /// Apply a partial state update
    pub fn apply(&mut self, patch: StatePatch) {
        patch.apply(&mut self.state);
    }

    /// Confirmed messages followed by local entries in enqueue order
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        self.messages
            .iter()
            .cloned()
            .map(TimelineEntry::Confirmed)
            .chain(self.queue.iter().cloned().map(TimelineEntry::Queued))
            .collect()
    }
}
