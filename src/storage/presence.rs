//! Presence records

use serde::{Deserialize, Serialize};

/// Online/offline state of a user, mutated only by the realtime layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    /// User ID
    pub user_id: String,
    /// Whether at least one session is connected
    pub online: bool,
    /// Last time the user connected or disconnected (Unix milliseconds)
    pub last_seen: i64,
}

impl ConnectionState {
    /// State for a user that has never connected
    pub fn unknown(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            online: false,
            last_seen: 0,
        }
    }
}
