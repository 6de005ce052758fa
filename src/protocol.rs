//! Protocol module
//!
//! Wire formats shared by the server and the client:
//! - Realtime channel events (JSON text frames, `type`-tagged)
//! - HTTP API request and response bodies
//! - Protocol versioning

use crate::{
    message_service::{Page, ReadOutcome, SendRequest, ThreadSummary},
    storage::{ContentType, Message, NewAttachment, Thread},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Events sent by a client over the realtime channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// First frame of a session; carries the bearer token
    Hello {
        /// Opaque token resolved by the authenticator
        token: String,
    },
    /// Re-join one room per active thread of the user
    JoinThreadRooms,
    /// Persist and broadcast a message
    SendMessage {
        /// Target thread
        thread_id: String,
        /// Plaintext content
        content: String,
        /// Kind of content
        #[serde(default)]
        content_type: ContentType,
        /// Attachment metadata
        #[serde(default)]
        attachments: Vec<NewAttachment>,
        /// Client pending id, echoed back in the ack
        #[serde(default)]
        pending_id: Option<String>,
    },
    /// User started typing
    TypingStart {
        /// Thread being typed in
        thread_id: String,
    },
    /// User stopped typing
    TypingStop {
        /// Thread being typed in
        thread_id: String,
    },
    /// Record a read receipt
    MarkRead {
        /// Message that was read
        message_id: String,
    },
    /// Create or reopen a thread with a counterparty
    OpenThread {
        /// The other participant
        counterparty_id: String,
        /// Reference to the external entity that prompted contact
        #[serde(default)]
        origin_ref: Option<String>,
        /// Optional first message
        #[serde(default)]
        initial_message: Option<String>,
    },
}

/// Events sent by the server over the realtime channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Session authenticated and joined its rooms
    Ready {
        /// Authenticated user
        user_id: String,
        /// Server-assigned session id
        session_id: String,
        /// Thread rooms joined
        rooms: Vec<String>,
        /// Protocol version spoken by the server
        version: u8,
    },
    /// Rooms re-joined on request
    RoomsJoined {
        /// Thread rooms joined
        rooms: Vec<String>,
    },
    /// A new message in one of the session's rooms
    MessageBroadcast {
        /// The persisted message
        message: Message,
    },
    /// Confirmation to the sending session
    MessageAck {
        /// Pending id supplied with the send
        pending_id: Option<String>,
        /// The persisted message
        message: Message,
    },
    /// A recipient session received the message
    MessageDelivered {
        /// Thread of the message
        thread_id: String,
        /// Delivered message
        message_id: String,
    },
    /// The recipient read the message
    MessageRead {
        /// Thread of the message
        thread_id: String,
        /// Read message
        message_id: String,
        /// Reader
        reader_id: String,
        /// Read time (Unix milliseconds)
        read_at: i64,
    },
    /// Typing indicator; never persisted
    Typing {
        /// Thread being typed in
        thread_id: String,
        /// Typing user
        user_id: String,
        /// Started (true) or stopped (false)
        active: bool,
    },
    /// Counterparty presence changed
    PresenceUpdate {
        /// User whose presence changed
        user_id: String,
        /// Whether any session is connected
        online: bool,
        /// Last connect/disconnect time (Unix milliseconds)
        last_seen: i64,
    },
    /// A message arrived while the user was offline
    Notification {
        /// Notification id
        notification_id: String,
        /// Thread of the message
        thread_id: String,
        /// Message to catch up on
        message_id: String,
        /// When the notification was queued (Unix milliseconds)
        created_at: i64,
    },
    /// Current unread counters for the user
    UnreadCounts {
        /// Sum over all threads
        total: u64,
        /// Per-thread counters (zero entries omitted)
        threads: HashMap<String, u64>,
    },
    /// A request failed
    Error {
        /// Stable error code
        code: String,
        /// Human readable description
        message: String,
        /// Pending id of the failed send, if any
        #[serde(default)]
        pending_id: Option<String>,
    },
}

impl ServerEvent {
    /// Error frame for a failed request
    pub fn error(err: &Error, pending_id: Option<String>) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            pending_id,
        }
    }

    /// Thread this event belongs to, if any
    pub fn thread_id(&self) -> Option<&str> {
        match self {
            ServerEvent::MessageBroadcast { message } | ServerEvent::MessageAck { message, .. } => {
                Some(&message.thread_id)
            }
            ServerEvent::MessageDelivered { thread_id, .. }
            | ServerEvent::MessageRead { thread_id, .. }
            | ServerEvent::Typing { thread_id, .. }
            | ServerEvent::Notification { thread_id, .. } => Some(thread_id),
            _ => None,
        }
    }
}

/// Encode an event as a JSON text frame
pub fn to_frame<T: Serialize>(event: &T) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

/// Decode a JSON text frame
pub fn from_frame<T: for<'de> Deserialize<'de>>(frame: &str) -> Result<T> {
    serde_json::from_str(frame).map_err(|e| Error::Validation(format!("malformed frame: {}", e)))
}

/// `POST /threads` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateThreadRequest {
    /// The other participant
    pub counterparty_id: String,
    /// Reference to the external entity that prompted contact
    #[serde(default)]
    pub origin_ref: Option<String>,
    /// Optional first message
    #[serde(default)]
    pub initial_message: Option<SendRequest>,
}

/// `POST /threads` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateThreadResponse {
    /// The thread descriptor
    pub thread: Thread,
    /// First message, when one was supplied
    pub message: Option<Message>,
}

/// `GET /threads` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadListResponse {
    /// Summaries, most recent activity first
    pub threads: Vec<ThreadSummary>,
}

/// `GET /threads/{id}/messages` response
pub type MessagePageResponse = Page;

/// `GET /threads/{id}/search` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Matching messages in chronological order
    pub messages: Vec<Message>,
}

/// `POST /threads/{id}/read` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadReadResponse {
    /// Messages newly marked read
    pub message_ids: Vec<String>,
}

/// `POST /messages/{id}/read` response
pub type MessageReadResponse = ReadOutcome;

/// Generic acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    /// Always true
    pub ok: bool,
}

/// Error body returned by the HTTP API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code
    pub code: String,
    /// Human readable description
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<ErrorBody> for Error {
    fn from(body: ErrorBody) -> Self {
        Error::from_code(&body.code, body.message)
    }
}

/// `GET /health` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Protocol version
    pub version: u8,
}
