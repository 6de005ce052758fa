//! Message service module
//!
//! Validates, encrypts, persists, paginates and searches messages, and
//! tracks read/delivery state. Every operation authorizes the caller against
//! the [`ThreadManager`] first. Content is decrypted only when building the
//! [`Message`] handed back to an authorized caller.

use crate::{
    crypto::{Ciphertext, EncryptedEnvelope, EncryptionService},
    now_millis,
    storage::{
        thread::validate_id, Attachment, ContentType, Database, DeliveryStatus, Message, NewAttachment,
        ParticipantRole, ReadReceipt, Thread, ThreadMetadata,
    },
    thread_manager::{touch_activity_in, ThreadManager},
    unread::UnreadSource,
    Error, Result,
};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use uuid::Uuid;

/// Default number of messages per page
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Characters kept in a thread-list preview
const PREVIEW_CHARS: usize = 80;

/// Size limits applied by the message service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLimits {
    /// Page size used when the caller gives none
    pub default_page_size: usize,
    /// Largest page a caller may request
    pub max_page_size: usize,
    /// Maximum content length in bytes
    pub max_content_len: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: 200,
            max_content_len: 16 * 1024,
        }
    }
}

/// Content submitted by a sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Message body (plaintext; encrypted before persistence)
    pub content: String,
    /// Kind of content
    #[serde(default)]
    pub content_type: ContentType,
    /// Attachment metadata
    #[serde(default)]
    pub attachments: Vec<NewAttachment>,
    /// Client pending id; replays with the same value return the original message
    #[serde(default)]
    pub client_ref: Option<String>,
}

impl SendRequest {
    /// Plain text message
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            content_type: ContentType::Text,
            attachments: Vec::new(),
            client_ref: None,
        }
    }

    /// Attach a client pending id
    pub fn with_client_ref(mut self, client_ref: impl Into<String>) -> Self {
        self.client_ref = Some(client_ref.into());
        self
    }

    /// Add an attachment
    pub fn with_attachment(mut self, attachment: NewAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    fn validate(&self, limits: &MessageLimits) -> Result<()> {
        if self.content.trim().is_empty() && !self.content_type.requires_attachment() {
            return Err(Error::Validation("message content must not be empty".to_string()));
        }
        if self.content.len() > limits.max_content_len {
            return Err(Error::Validation(format!(
                "message content exceeds {} bytes",
                limits.max_content_len
            )));
        }
        if self.content_type.requires_attachment() && self.attachments.is_empty() {
            return Err(Error::Validation(format!(
                "{:?} messages need at least one attachment",
                self.content_type
            )));
        }
        for attachment in &self.attachments {
            attachment.validate()?;
        }
        if let Some(client_ref) = &self.client_ref {
            validate_id("client reference", client_ref)?;
        }
        Ok(())
    }
}

/// Where a page starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageCursor {
    /// The newest messages
    Latest,
    /// Skip this many of the newest messages
    Offset(usize),
    /// Messages older than the given message id
    Before(String),
    /// Messages newer than the given message id, or from the first message
    /// when absent (catch-up fetch)
    After(Option<String>),
}

impl Default for PageCursor {
    fn default() -> Self {
        Self::Latest
    }
}

/// Pagination request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Page size; defaults to the configured default
    pub limit: Option<usize>,
    /// Starting point
    pub cursor: PageCursor,
}

impl PageRequest {
    /// Newest page with the default size
    pub fn latest() -> Self {
        Self::default()
    }

    /// Page of messages older than `message_id`
    pub fn before(message_id: impl Into<String>, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            cursor: PageCursor::Before(message_id.into()),
        }
    }

    /// Page of messages newer than `message_id`, or from the start when `None`
    pub fn after(message_id: Option<String>, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            cursor: PageCursor::After(message_id),
        }
    }
}

/// A page of messages in chronological order, newest last
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Messages, oldest first
    pub messages: Vec<Message>,
    /// Whether more messages exist beyond this page in the paging direction
    pub has_more: bool,
}

/// Result of a send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// The persisted message
    pub message: Message,
    /// Whether an earlier send with the same client reference was returned
    pub replayed: bool,
}

/// Result of a mark-read call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOutcome {
    /// Thread of the message
    pub thread_id: String,
    /// Message that was read
    pub message_id: String,
    /// Receipt, absent when the reader is the sender
    pub receipt: Option<ReadReceipt>,
    /// Whether this call created the receipt
    pub newly_read: bool,
}

/// Thread listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    /// The thread
    pub thread: Thread,
    /// The other participant
    pub counterpart_id: String,
    /// Preview of the latest message visible to the viewer
    pub last_message_preview: Option<String>,
    /// Time of the latest message
    pub last_message_at: Option<i64>,
    /// Messages the viewer has not read
    pub unread_count: u64,
}

/// Encrypted message row as stored
struct StoredMessage {
    id: String,
    thread_id: String,
    seq: i64,
    sender_id: String,
    sender_role: ParticipantRole,
    content_type: ContentType,
    ciphertext: Ciphertext,
    created_at: i64,
    status: DeliveryStatus,
    client_ref: Option<String>,
}

fn invalid_column(index: usize, reason: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Integer, reason.into())
}

impl StoredMessage {
    const COLUMNS: &'static str =
        "id, thread_id, seq, sender_id, sender_role, content_type, key_version, nonce, content, created_at, status, client_ref";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let nonce: Vec<u8> = row.get(7)?;
        let nonce: [u8; 24] = nonce
            .as_slice()
            .try_into()
            .map_err(|_| rusqlite::Error::FromSqlConversionFailure(7, Type::Blob, "invalid nonce length".into()))?;

        Ok(StoredMessage {
            id: row.get(0)?,
            thread_id: row.get(1)?,
            seq: row.get(2)?,
            sender_id: row.get(3)?,
            sender_role: ParticipantRole::from_i64(row.get(4)?).ok_or_else(|| invalid_column(4, "unknown sender role"))?,
            content_type: ContentType::from_i64(row.get(5)?).ok_or_else(|| invalid_column(5, "unknown content type"))?,
            ciphertext: Ciphertext {
                key_version: row.get(6)?,
                envelope: EncryptedEnvelope {
                    nonce,
                    ciphertext: row.get(8)?,
                },
            },
            created_at: row.get(9)?,
            status: DeliveryStatus::from_rank(row.get(10)?).ok_or_else(|| invalid_column(10, "unknown delivery status"))?,
            client_ref: row.get(11)?,
        })
    }
}

/// Message service
#[derive(Clone)]
pub struct MessageService {
    db: Database,
    threads: ThreadManager,
    crypto: EncryptionService,
    limits: MessageLimits,
}

impl MessageService {
    /// Create a message service
    pub fn new(db: Database, threads: ThreadManager, crypto: EncryptionService) -> Self {
        Self {
            db,
            threads,
            crypto,
            limits: MessageLimits::default(),
        }
    }

    /// Replace the size limits
    pub fn with_limits(mut self, limits: MessageLimits) -> Self {
        self.limits = limits;
        self
    }

    /// The thread manager used for authorization
    pub fn threads(&self) -> &ThreadManager {
        &self.threads
    }

    /// The encryption service protecting content
    pub fn crypto(&self) -> &EncryptionService {
        &self.crypto
    }

    /// Create or reuse the pair's thread, optionally sending a first message
    pub fn open_thread(
        &self,
        initiator_id: &str,
        counterparty_id: &str,
        metadata: ThreadMetadata,
        initial_message: Option<SendRequest>,
    ) -> Result<(Thread, Option<Message>)> {
        let thread = self
            .threads
            .create_or_get_thread(initiator_id, counterparty_id, metadata)?;
        self.crypto.ensure_key(&thread.id)?;

        let message = match initial_message {
            Some(request) => Some(self.send(&thread.id, initiator_id, request)?),
            None => None,
        };

        let thread = self.threads.load(&thread.id)?;
        Ok((thread, message))
    }

    /// Validate, encrypt and persist a message with status SENT
    pub fn send(&self, thread_id: &str, sender_id: &str, request: SendRequest) -> Result<Message> {
        self.send_tracked(thread_id, sender_id, request).map(|outcome| outcome.message)
    }

    /// Like [`send`](Self::send), also reporting whether the call replayed an
    /// earlier send with the same client reference
    pub fn send_tracked(&self, thread_id: &str, sender_id: &str, request: SendRequest) -> Result<SendOutcome> {
        request.validate(&self.limits)?;
        let (thread, role) = self.threads.authorize(thread_id, sender_id)?;
        if !thread.is_active() {
            return Err(Error::Validation(format!("thread {} is archived", thread_id)));
        }

        if let Some(client_ref) = &request.client_ref {
            if let Some(existing) = self.find_by_client_ref(thread_id, sender_id, client_ref)? {
                debug!("Replayed send for client ref in thread {}", thread_id);
                return self.replayed(existing, sender_id);
            }
        }

        let ciphertext = self.crypto.encrypt(thread_id, &request.content)?;
        let message_id = Uuid::new_v4().to_string();

        let attachments: Vec<Attachment> = request
            .attachments
            .iter()
            .map(|a| Attachment {
                id: Uuid::new_v4().to_string(),
                file_name: a.file_name.clone(),
                mime_type: a.mime_type.clone(),
                byte_size: a.byte_size,
                storage_url: a.storage_url.clone(),
                thumbnail_url: a.thumbnail_url.clone(),
            })
            .collect();

        let persisted = self.db.transaction(|tx| {
            // A concurrent replay may have committed since the check above
            if let Some(client_ref) = &request.client_ref {
                if let Some(existing) = find_by_client_ref_in(tx, thread_id, sender_id, client_ref)? {
                    return Ok(Err(existing));
                }
            }

            let (last_seq, last_created): (Option<i64>, Option<i64>) = tx.query_row(
                "SELECT MAX(seq), MAX(created_at) FROM messages WHERE thread_id = ?1",
                params![thread_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let seq = last_seq.unwrap_or(0) + 1;
            let created_at = now_millis().max(last_created.unwrap_or(0));

            tx.execute(
                &format!(
                    "INSERT INTO messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    StoredMessage::COLUMNS
                ),
                params![
                    message_id,
                    thread_id,
                    seq,
                    sender_id,
                    role.as_i64(),
                    request.content_type.as_i64(),
                    ciphertext.key_version,
                    ciphertext.envelope.nonce.to_vec(),
                    ciphertext.envelope.ciphertext,
                    created_at,
                    DeliveryStatus::Sent.rank(),
                    request.client_ref,
                ],
            )?;

            for attachment in &attachments {
                tx.execute(
                    "INSERT INTO attachments (id, message_id, file_name, mime_type, byte_size, storage_url, thumbnail_url)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        attachment.id,
                        message_id,
                        attachment.file_name,
                        attachment.mime_type,
                        attachment.byte_size as i64,
                        attachment.storage_url,
                        attachment.thumbnail_url,
                    ],
                )?;
            }

            touch_activity_in(tx, thread_id, created_at)?;
            Ok(Ok((seq, created_at)))
        })?;

        let (seq, created_at) = match persisted {
            Ok(position) => position,
            Err(existing) => return self.replayed(existing, sender_id),
        };

        info!(
            "Persisted message {} in thread {} (seq {}, {} bytes)",
            message_id,
            thread_id,
            seq,
            request.content.len()
        );

        let message = Message {
            id: message_id,
            thread_id: thread_id.to_string(),
            seq,
            sender_id: sender_id.to_string(),
            sender_role: role,
            content_type: request.content_type,
            content: Some(request.content),
            created_at,
            status: DeliveryStatus::Sent,
            deleted: false,
            client_ref: request.client_ref,
            attachments,
        };
        Ok(SendOutcome {
            message,
            replayed: false,
        })
    }

    /// Messages of a thread in chronological order, newest last
    pub fn list(&self, thread_id: &str, viewer_id: &str, page: PageRequest) -> Result<Page> {
        self.threads.authorize(thread_id, viewer_id)?;
        let limit = page
            .limit
            .unwrap_or(self.limits.default_page_size)
            .clamp(1, self.limits.max_page_size);
        let fetch = (limit + 1) as i64;

        // Older-first cursors are fetched newest-first and reversed afterwards
        let (mut rows, ascending) = self.db.with_conn(|conn| match &page.cursor {
            PageCursor::Latest => Ok((select_window(conn, thread_id, 0, fetch)?, false)),
            PageCursor::Offset(offset) => Ok((select_window(conn, thread_id, *offset as i64, fetch)?, false)),
            PageCursor::Before(id) => {
                let seq = cursor_seq(conn, thread_id, id)?;
                Ok((select_relative(conn, thread_id, "<", "DESC", seq, fetch)?, false))
            }
            PageCursor::After(id) => {
                let seq = match id {
                    Some(id) => cursor_seq(conn, thread_id, id)?,
                    None => 0,
                };
                Ok((select_relative(conn, thread_id, ">", "ASC", seq, fetch)?, true))
            }
        })?;

        let has_more = rows.len() > limit;
        rows.truncate(limit);
        if !ascending {
            rows.reverse();
        }

        let messages = self.reveal_all(rows, viewer_id)?;
        Ok(Page { messages, has_more })
    }

    /// Substring search over decrypted content and attachment file names
    pub fn search(&self, thread_id: &str, viewer_id: &str, query: &str) -> Result<Vec<Message>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Err(Error::Validation("search query must not be empty".to_string()));
        }
        self.threads.authorize(thread_id, viewer_id)?;

        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages WHERE thread_id = ?1 ORDER BY seq ASC",
                StoredMessage::COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![thread_id], StoredMessage::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let matches = self
            .reveal_all(rows, viewer_id)?
            .into_iter()
            .filter(|m| !m.deleted)
            .filter(|m| {
                m.content
                    .as_deref()
                    .is_some_and(|c| c.to_lowercase().contains(&needle))
                    || m.attachments
                        .iter()
                        .any(|a| a.file_name.to_lowercase().contains(&needle))
            })
            .collect::<Vec<_>>();

        debug!("Search in thread {} matched {} messages", thread_id, matches.len());
        Ok(matches)
    }

    /// A single message as seen by `viewer_id`
    pub fn get_message(&self, message_id: &str, viewer_id: &str) -> Result<Message> {
        let stored = self.load_stored(message_id)?;
        self.threads.authorize(&stored.thread_id, viewer_id)?;
        self.reveal(stored, viewer_id)
    }

    /// Record that `reader_id` observed a message (idempotent)
    pub fn mark_read(&self, message_id: &str, reader_id: &str) -> Result<ReadOutcome> {
        validate_id("reader id", reader_id)?;
        let stored = self.load_stored(message_id)?;
        self.threads.authorize(&stored.thread_id, reader_id)?;

        if stored.sender_id == reader_id {
            return Ok(ReadOutcome {
                thread_id: stored.thread_id,
                message_id: stored.id,
                receipt: None,
                newly_read: false,
            });
        }

        let (receipt, newly_read) = self.db.transaction(|tx| {
            let inserted = insert_receipt(tx, message_id, reader_id, now_millis())?;
            let receipt = tx.query_row(
                "SELECT message_id, reader_id, read_at FROM read_receipts
                 WHERE message_id = ?1 AND reader_id = ?2",
                params![message_id, reader_id],
                |row| {
                    Ok(ReadReceipt {
                        message_id: row.get(0)?,
                        reader_id: row.get(1)?,
                        read_at: row.get(2)?,
                    })
                },
            )?;
            Ok((receipt, inserted))
        })?;

        if newly_read {
            debug!("Message {} read by {}", message_id, reader_id);
        }

        Ok(ReadOutcome {
            thread_id: stored.thread_id,
            message_id: stored.id,
            receipt: Some(receipt),
            newly_read,
        })
    }

    /// Mark every unread message of the counterpart as read; returns newly read ids
    pub fn mark_thread_read(&self, thread_id: &str, reader_id: &str) -> Result<Vec<String>> {
        self.threads.authorize(thread_id, reader_id)?;
        let now = now_millis();

        let ids = self.db.transaction(|tx| {
            let mut stmt = tx.prepare(
                "SELECT m.id FROM messages m
                 WHERE m.thread_id = ?1 AND m.sender_id != ?2
                   AND NOT EXISTS (SELECT 1 FROM read_receipts r WHERE r.message_id = m.id AND r.reader_id = ?2)
                 ORDER BY m.seq ASC",
            )?;
            let ids = stmt
                .query_map(params![thread_id, reader_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            drop(stmt);

            for id in &ids {
                insert_receipt(tx, id, reader_id, now)?;
            }
            Ok(ids)
        })?;

        if !ids.is_empty() {
            info!("Marked {} messages read in thread {}", ids.len(), thread_id);
        }
        Ok(ids)
    }

    /// Advance a message from SENT to DELIVERED; returns whether it changed
    ///
    /// Called by the realtime layer once a recipient session received it.
    pub fn mark_delivered(&self, message_id: &str) -> Result<bool> {
        let rows = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE messages SET status = ?2 WHERE id = ?1 AND status < ?2",
                params![message_id, DeliveryStatus::Delivered.rank()],
            )?)
        })?;
        Ok(rows > 0)
    }

    /// Hide a message from the requester's view only; returns its thread id
    pub fn soft_delete(&self, message_id: &str, requester_id: &str) -> Result<String> {
        let stored = self.load_stored(message_id)?;
        self.threads.authorize(&stored.thread_id, requester_id)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO message_deletions (message_id, user_id, deleted_at) VALUES (?1, ?2, ?3)",
                params![message_id, requester_id, now_millis()],
            )?;
            Ok(())
        })?;

        info!("Message {} soft-deleted for {}", message_id, requester_id);
        Ok(stored.thread_id)
    }

    /// Receipts recorded for a message
    pub fn receipts(&self, message_id: &str, viewer_id: &str) -> Result<Vec<ReadReceipt>> {
        let stored = self.load_stored(message_id)?;
        self.threads.authorize(&stored.thread_id, viewer_id)?;

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, reader_id, read_at FROM read_receipts WHERE message_id = ?1 ORDER BY read_at",
            )?;
            let receipts = stmt
                .query_map(params![message_id], |row| {
                    Ok(ReadReceipt {
                        message_id: row.get(0)?,
                        reader_id: row.get(1)?,
                        read_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(receipts)
        })
    }

    /// Messages in a thread the user has not read
    pub fn unread_count(&self, thread_id: &str, user_id: &str) -> Result<u64> {
        self.threads.authorize(thread_id, user_id)?;
        Ok(self.unread_counts(user_id)?.get(thread_id).copied().unwrap_or(0))
    }

    /// Unread messages per thread for a user (threads with zero are omitted)
    pub fn unread_counts(&self, user_id: &str) -> Result<HashMap<String, u64>> {
        Ok(self
            .unread_ids(user_id)?
            .into_iter()
            .map(|(thread_id, ids)| (thread_id, ids.len() as u64))
            .collect())
    }

    /// Ids of unread messages per thread for a user, oldest first
    pub fn unread_ids(&self, user_id: &str) -> Result<HashMap<String, Vec<String>>> {
        validate_id("user id", user_id)?;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.thread_id, m.id FROM messages m
                 JOIN threads t ON t.id = m.thread_id
                 WHERE (t.initiator_id = ?1 OR t.counterparty_id = ?1)
                   AND m.sender_id != ?1
                   AND NOT EXISTS (SELECT 1 FROM read_receipts r WHERE r.message_id = m.id AND r.reader_id = ?1)
                   AND NOT EXISTS (SELECT 1 FROM message_deletions d WHERE d.message_id = m.id AND d.user_id = ?1)
                 ORDER BY m.thread_id, m.seq",
            )?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut unread: HashMap<String, Vec<String>> = HashMap::new();
            for (thread_id, message_id) in rows {
                unread.entry(thread_id).or_default().push(message_id);
            }
            Ok(unread)
        })
    }

    /// Whether a message is unread for a participant: not theirs, not read, not deleted
    pub fn is_unread(&self, message_id: &str, user_id: &str) -> Result<bool> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS (
                    SELECT 1 FROM messages m
                    JOIN threads t ON t.id = m.thread_id
                    WHERE m.id = ?1
                      AND (t.initiator_id = ?2 OR t.counterparty_id = ?2)
                      AND m.sender_id != ?2
                      AND NOT EXISTS (SELECT 1 FROM read_receipts r WHERE r.message_id = m.id AND r.reader_id = ?2)
                      AND NOT EXISTS (SELECT 1 FROM message_deletions d WHERE d.message_id = m.id AND d.user_id = ?2)
                 )",
                params![message_id, user_id],
                |row| row.get::<_, bool>(0),
            )?)
        })
    }

    /// Thread listing with last-message preview and unread count
    pub fn thread_summaries(&self, user_id: &str) -> Result<Vec<ThreadSummary>> {
        let threads = self.threads.list_threads(user_id)?;
        let unread = self.unread_counts(user_id)?;

        let mut summaries = Vec::with_capacity(threads.len());
        for thread in threads {
            let latest = self.list(
                &thread.id,
                user_id,
                PageRequest {
                    limit: Some(1),
                    cursor: PageCursor::Latest,
                },
            )?;
            let last = latest.messages.last();
            summaries.push(ThreadSummary {
                counterpart_id: thread.other_participant(user_id).unwrap_or_default().to_string(),
                last_message_preview: last.and_then(|m| m.preview(PREVIEW_CHARS)),
                last_message_at: last.map(|m| m.created_at),
                unread_count: unread.get(&thread.id).copied().unwrap_or(0),
                thread,
            });
        }
        Ok(summaries)
    }

    fn load_stored(&self, message_id: &str) -> Result<StoredMessage> {
        validate_id("message id", message_id)?;
        self.db
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {} FROM messages WHERE id = ?1", StoredMessage::COLUMNS),
                        params![message_id],
                        StoredMessage::from_row,
                    )
                    .optional()?)
            })?
            .ok_or_else(|| Error::NotFound(format!("message {}", message_id)))
    }

    fn find_by_client_ref(&self, thread_id: &str, sender_id: &str, client_ref: &str) -> Result<Option<StoredMessage>> {
        self.db
            .with_conn(|conn| find_by_client_ref_in(conn, thread_id, sender_id, client_ref))
    }

    fn replayed(&self, stored: StoredMessage, sender_id: &str) -> Result<SendOutcome> {
        Ok(SendOutcome {
            message: self.reveal(stored, sender_id)?,
            replayed: true,
        })
    }

    fn reveal(&self, stored: StoredMessage, viewer_id: &str) -> Result<Message> {
        let mut messages = self.reveal_all(vec![stored], viewer_id)?;
        messages
            .pop()
            .ok_or_else(|| Error::Storage("message vanished while decrypting".to_string()))
    }

    /// Decrypt rows for a viewer, rendering the viewer's own deletions as tombstones
    fn reveal_all(&self, rows: Vec<StoredMessage>, viewer_id: &str) -> Result<Vec<Message>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let (deleted, mut attachments) = self.db.with_conn(|conn| {
            let mut deleted = HashSet::new();
            let mut attachments: HashMap<String, Vec<Attachment>> = HashMap::new();
            let mut del_stmt =
                conn.prepare("SELECT 1 FROM message_deletions WHERE message_id = ?1 AND user_id = ?2")?;
            let mut att_stmt = conn.prepare(
                "SELECT id, file_name, mime_type, byte_size, storage_url, thumbnail_url
                 FROM attachments WHERE message_id = ?1 ORDER BY rowid",
            )?;
            for id in &ids {
                if del_stmt.exists(params![id, viewer_id])? {
                    deleted.insert(id.clone());
                }
                let list = att_stmt
                    .query_map(params![id], |row| {
                        Ok(Attachment {
                            id: row.get(0)?,
                            file_name: row.get(1)?,
                            mime_type: row.get(2)?,
                            byte_size: row.get::<_, i64>(3)? as u64,
                            storage_url: row.get(4)?,
                            thumbnail_url: row.get(5)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                if !list.is_empty() {
                    attachments.insert(id.clone(), list);
                }
            }
            Ok((deleted, attachments))
        })?;

        rows.into_iter()
            .map(|row| {
                let content = self.crypto.decrypt(&row.thread_id, &row.ciphertext)?;
                let message = Message {
                    attachments: attachments.remove(&row.id).unwrap_or_default(),
                    deleted: false,
                    content: Some(content),
                    id: row.id,
                    thread_id: row.thread_id,
                    seq: row.seq,
                    sender_id: row.sender_id,
                    sender_role: row.sender_role,
                    content_type: row.content_type,
                    created_at: row.created_at,
                    status: row.status,
                    client_ref: row.client_ref,
                };
                Ok(if deleted.contains(&message.id) {
                    message.into_tombstone()
                } else {
                    message
                })
            })
            .collect()
    }
}

impl UnreadSource for MessageService {
    fn unread_ids(&self, user_id: &str) -> Result<HashMap<String, Vec<String>>> {
        MessageService::unread_ids(self, user_id)
    }

    fn is_unread(&self, message_id: &str, user_id: &str) -> Result<bool> {
        MessageService::is_unread(self, message_id, user_id)
    }
}

fn find_by_client_ref_in(
    conn: &Connection,
    thread_id: &str,
    sender_id: &str,
    client_ref: &str,
) -> Result<Option<StoredMessage>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM messages WHERE thread_id = ?1 AND sender_id = ?2 AND client_ref = ?3",
                StoredMessage::COLUMNS
            ),
            params![thread_id, sender_id, client_ref],
            StoredMessage::from_row,
        )
        .optional()?)
}

fn cursor_seq(conn: &Connection, thread_id: &str, message_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT seq FROM messages WHERE id = ?1 AND thread_id = ?2",
        params![message_id, thread_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("cursor message {}", message_id)))
}

fn select_window(conn: &Connection, thread_id: &str, offset: i64, fetch: i64) -> Result<Vec<StoredMessage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages WHERE thread_id = ?1 ORDER BY seq DESC LIMIT ?2 OFFSET ?3",
        StoredMessage::COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![thread_id, fetch, offset], StoredMessage::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn select_relative(
    conn: &Connection,
    thread_id: &str,
    op: &str,
    order: &str,
    seq: i64,
    fetch: i64,
) -> Result<Vec<StoredMessage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages WHERE thread_id = ?1 AND seq {} ?2 ORDER BY seq {} LIMIT ?3",
        StoredMessage::COLUMNS,
        op,
        order
    ))?;
    let rows = stmt
        .query_map(params![thread_id, seq, fetch], StoredMessage::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Insert a receipt and promote the message to READ; returns whether it was new
fn insert_receipt(conn: &Connection, message_id: &str, reader_id: &str, read_at: i64) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO read_receipts (message_id, reader_id, read_at) VALUES (?1, ?2, ?3)",
        params![message_id, reader_id, read_at],
    )?;
    conn.execute(
        "UPDATE messages SET status = ?2 WHERE id = ?1 AND status < ?2",
        params![message_id, DeliveryStatus::Read.rank()],
    )?;
    Ok(inserted > 0)
}
