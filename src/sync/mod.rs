//! Client-side offline state sync
//!
//! - `state` - Per-thread sync state, outbound queue and merge logic
//! - `store` - Durable CBOR record per thread
//! - `api` - `MessageApi` seam with HTTP and in-process implementations
//! - `service` - Queueing, FIFO drain, catch-up and reconciliation
//! - `reconnect` - Bounded exponential reconnection and link state
//! - `link` - WebSocket client feeding the service

pub mod api;
pub mod link;
pub mod reconnect;
pub mod service;
pub mod state;
pub mod store;

pub use api::{HttpMessageApi, LocalMessageApi, MessageApi};
pub use link::RealtimeLink;
pub use reconnect::{LinkState, Reconnector};
pub use service::{OfflineSyncService, SyncReport};
pub use state::{
    ConversationSyncState, MergeReport, QueueStatus, QueuedOutboundMessage, StatePatch, ThreadRecord, TimelineEntry,
};
pub use store::SyncStore;
