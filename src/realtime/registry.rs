//! Connection registry
//!
//! Tracks live sessions, the sessions of each user and the thread rooms each
//! session joined. Scoped to the lifetime of one [`RealtimeHub`](super::RealtimeHub).

use crate::protocol::ServerEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use tracing::debug;
use uuid::Uuid;

/// Server-assigned session identifier
pub type SessionId = String;

struct Session {
    user_id: String,
    sender: UnboundedSender<ServerEvent>,
    rooms: HashSet<String>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    by_user: HashMap<String, HashSet<SessionId>>,
    rooms: HashMap<String, HashSet<SessionId>>,
}

/// Result of registering a session
pub struct Registration {
    /// New session id
    pub session_id: SessionId,
    /// Events addressed to the session
    pub receiver: UnboundedReceiver<ServerEvent>,
    /// Whether this is the user's only session
    pub first_session: bool,
}

/// Injectable registry of live sessions keyed by user id
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session for a user
    pub async fn register(&self, user_id: &str) -> Registration {
        let (tx, rx) = unbounded_channel();
        let session_id = Uuid::new_v4().to_string();

        let mut guard = self.inner.write().await;
        guard.sessions.insert(
            session_id.clone(),
            Session {
                user_id: user_id.to_string(),
                sender: tx,
                rooms: HashSet::new(),
            },
        );
        let sessions = guard.by_user.entry(user_id.to_string()).or_default();
        sessions.insert(session_id.clone());
        let first_session = sessions.len() == 1;

        debug!("Registered session {} for {} ({} live)", session_id, user_id, sessions.len());

        Registration {
            session_id,
            receiver: rx,
            first_session,
        }
    }

    /// Remove a session; returns its user and whether it was the last one
    pub async fn unregister(&self, session_id: &str) -> Option<(String, bool)> {
        let mut guard = self.inner.write().await;
        let session = guard.sessions.remove(session_id)?;

        for room in &session.rooms {
            if let Some(members) = guard.rooms.get_mut(room) {
                members.remove(session_id);
                if members.is_empty() {
                    guard.rooms.remove(room);
                }
            }
        }

        let last_session = match guard.by_user.get_mut(&session.user_id) {
            Some(sessions) => {
                sessions.remove(session_id);
                sessions.is_empty()
            }
            None => true,
        };
        if last_session {
            guard.by_user.remove(&session.user_id);
        }

        debug!("Unregistered session {} for {}", session_id, session.user_id);
        Some((session.user_id, last_session))
    }

    /// Join a session to a thread room
    pub async fn join(&self, session_id: &str, thread_id: &str) -> bool {
        let mut guard = self.inner.write().await;
        let Some(session) = guard.sessions.get_mut(session_id) else {
            return false;
        };
        session.rooms.insert(thread_id.to_string());
        guard
            .rooms
            .entry(thread_id.to_string())
            .or_default()
            .insert(session_id.to_string());
        true
    }

    /// Join every live session of a user to a thread room
    pub async fn join_user(&self, user_id: &str, thread_id: &str) -> usize {
        let sessions: Vec<SessionId> = {
            let guard = self.inner.read().await;
            guard
                .by_user
                .get(user_id)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()
        };
        let mut joined = 0;
        for session_id in sessions {
            if self.join(&session_id, thread_id).await {
                joined += 1;
            }
        }
        joined
    }

    /// Send an event to every room member except `exclude`
    ///
    /// Returns the distinct users that had at least one session reached.
    pub async fn broadcast(&self, thread_id: &str, event: &ServerEvent, exclude: Option<&str>) -> HashSet<String> {
        let guard = self.inner.read().await;
        let mut reached = HashSet::new();
        let Some(members) = guard.rooms.get(thread_id) else {
            return reached;
        };

        for session_id in members {
            if Some(session_id.as_str()) == exclude {
                continue;
            }
            if let Some(session) = guard.sessions.get(session_id) {
                if session.sender.send(event.clone()).is_ok() {
                    reached.insert(session.user_id.clone());
                }
            }
        }
        reached
    }

    /// Send an event to one session
    pub async fn send_to_session(&self, session_id: &str, event: ServerEvent) -> bool {
        let guard = self.inner.read().await;
        guard
            .sessions
            .get(session_id)
            .is_some_and(|session| session.sender.send(event).is_ok())
    }

    /// Send an event to every session of a user except `exclude`
    pub async fn send_to_user(&self, user_id: &str, event: &ServerEvent, exclude: Option<&str>) -> usize {
        let guard = self.inner.read().await;
        let Some(sessions) = guard.by_user.get(user_id) else {
            return 0;
        };
        sessions
            .iter()
            .filter(|id| Some(id.as_str()) != exclude)
            .filter_map(|id| guard.sessions.get(id))
            .filter(|session| session.sender.send(event.clone()).is_ok())
            .count()
    }

    /// Whether the user has at least one live session
    pub async fn is_online(&self, user_id: &str) -> bool {
        self.inner.read().await.by_user.contains_key(user_id)
    }

    /// User owning a session
    pub async fn session_user(&self, session_id: &str) -> Option<String> {
        let guard = self.inner.read().await;
        guard.sessions.get(session_id).map(|s| s.user_id.clone())
    }

    /// Sessions currently in a room
    pub async fn room_size(&self, thread_id: &str) -> usize {
        let guard = self.inner.read().await;
        guard.rooms.get(thread_id).map(|m| m.len()).unwrap_or(0)
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}
