//! Server-side storage module
//!
//! This module handles persistent storage including:
//! - Thread identity and participant pairing
//! - Encrypted messages, attachments and read receipts
//! - Per-thread encryption keys
//! - Presence records and queued notifications
//!
//! The module is organized into submodules:
//! - `database` - SQLite connection handle, schema and retry boundary
//! - `thread` - Thread model and participant roles
//! - `message` - Message, attachment and receipt models, delivery status
//! - `presence` - ConnectionState model

pub mod database;
pub mod message;
pub mod presence;
pub mod thread;

// Re-export commonly used types
pub use database::Database;
pub use message::{Attachment, ContentType, DeliveryStatus, Message, NewAttachment, ReadReceipt};
pub use presence::ConnectionState;
pub use thread::{ParticipantRole, Thread, ThreadMetadata, ThreadStatus};
