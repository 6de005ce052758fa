//! Realtime synchronization layer
//!
//! - `registry` - Injectable registry of live sessions and thread rooms
//! - `hub` - Fan-out, delivery/read transitions, typing and presence
//! - `presence` - ConnectionState persistence
//! - `gateway` - WebSocket listener and token authentication

pub mod gateway;
pub mod hub;
pub mod presence;
pub mod registry;

pub use gateway::{Authenticator, Gateway, TokenTable};
pub use hub::{Connected, PublishReport, RealtimeHub};
pub use presence::PresenceStore;
pub use registry::{ConnectionRegistry, SessionId};
