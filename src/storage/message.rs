//! Message structures and delivery status tracking

use crate::storage::thread::ParticipantRole;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Message delivery status, from the recipient's perspective
///
/// Transitions are monotonic: `Sent < Delivered < Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Persisted, not yet observed by any recipient session
    Sent,
    /// Pushed to at least one connected recipient session
    Delivered,
    /// Recipient marked the message read
    Read,
}

impl Default for DeliveryStatus {
    fn default() -> Self {
        Self::Sent
    }
}

impl DeliveryStatus {
    pub(crate) fn rank(self) -> i64 {
        match self {
            DeliveryStatus::Sent => 0,
            DeliveryStatus::Delivered => 1,
            DeliveryStatus::Read => 2,
        }
    }

    pub(crate) fn from_rank(value: i64) -> Option<Self> {
        match value {
            0 => Some(DeliveryStatus::Sent),
            1 => Some(DeliveryStatus::Delivered),
            2 => Some(DeliveryStatus::Read),
            _ => None,
        }
    }

    /// The later of two states; a status is never downgraded
    pub fn advance(self, next: DeliveryStatus) -> DeliveryStatus {
        self.max(next)
    }

    /// Get human-readable delivery status indicator
    pub fn indicator(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "✓",
            DeliveryStatus::Delivered => "✓✓",
            DeliveryStatus::Read => "✓✓ read",
        }
    }
}

/// Kind of message content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Plain text
    Text,
    /// Image with caption (attachment required)
    Image,
    /// Document with caption (attachment required)
    Document,
    /// Generated by the platform
    System,
}

impl Default for ContentType {
    fn default() -> Self {
        Self::Text
    }
}

impl ContentType {
    pub(crate) fn as_i64(self) -> i64 {
        match self {
            ContentType::Text => 0,
            ContentType::Image => 1,
            ContentType::Document => 2,
            ContentType::System => 3,
        }
    }

    pub(crate) fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(ContentType::Text),
            1 => Some(ContentType::Image),
            2 => Some(ContentType::Document),
            3 => Some(ContentType::System),
            _ => None,
        }
    }

    /// Whether this content type must carry an attachment
    pub fn requires_attachment(&self) -> bool {
        matches!(self, ContentType::Image | ContentType::Document)
    }
}

/// Attachment metadata supplied by the sender
///
/// The blob itself lives in external storage and is referenced by URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAttachment {
    /// Original file name
    pub file_name: String,
    /// MIME type
    pub mime_type: String,
    /// Size in bytes
    pub byte_size: u64,
    /// Location in the blob store
    pub storage_url: String,
    /// Optional preview location
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

impl NewAttachment {
    /// Check required fields
    pub fn validate(&self) -> Result<()> {
        if self.file_name.trim().is_empty() {
            return Err(Error::Validation("attachment file name must not be empty".to_string()));
        }
        if self.mime_type.trim().is_empty() {
            return Err(Error::Validation("attachment MIME type must not be empty".to_string()));
        }
        if self.storage_url.trim().is_empty() {
            return Err(Error::Validation("attachment storage URL must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Persisted attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment ID
    pub id: String,
    /// Original file name
    pub file_name: String,
    /// MIME type
    pub mime_type: String,
    /// Size in bytes
    pub byte_size: u64,
    /// Location in the blob store
    pub storage_url: String,
    /// Optional preview location
    pub thumbnail_url: Option<String>,
}

/// Canonical message descriptor returned to an authorized caller
///
/// Content is plaintext here; it only exists decrypted at this boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message ID
    pub id: String,
    /// Owning thread
    pub thread_id: String,
    /// Position within the thread (strictly increasing)
    pub seq: i64,
    /// Sender user ID
    pub sender_id: String,
    /// Sender's role in the thread
    pub sender_role: ParticipantRole,
    /// Kind of content
    pub content_type: ContentType,
    /// Decrypted content; `None` when rendered as a tombstone
    pub content: Option<String>,
    /// Creation time (Unix milliseconds)
    pub created_at: i64,
    /// Delivery status
    pub status: DeliveryStatus,
    /// Whether the viewing participant deleted this message
    #[serde(default)]
    pub deleted: bool,
    /// Client-side pending id this message confirms
    #[serde(default)]
    pub client_ref: Option<String>,
    /// Attachments
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Render this message as a tombstone for the deleting viewer
    pub fn into_tombstone(mut self) -> Self {
        self.content = None;
        self.attachments.clear();
        self.deleted = true;
        self
    }

    /// Display ordering key
    pub fn order_key(&self) -> (i64, i64) {
        (self.created_at, self.seq)
    }

    /// Short preview of the content for thread listings
    pub fn preview(&self, max_chars: usize) -> Option<String> {
        let content = self.content.as_ref()?;
        let mut preview: String = content.chars().take(max_chars).collect();
        if content.chars().count() > max_chars {
            preview.push('…');
        }
        Some(preview)
    }
}

/// Record that a reader observed a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    /// Message that was read
    pub message_id: String,
    /// Reader user ID
    pub reader_id: String,
    /// Read time (Unix milliseconds)
    pub read_at: i64,
}
