//! Realtime hub
//!
//! Glue between live sessions and the message service: room membership,
//! fan-out of persisted messages, delivery/read state transitions, typing
//! signals, presence and unread counters.

use super::{
    presence::PresenceStore,
    registry::{ConnectionRegistry, SessionId},
};
use crate::{
    message_service::{MessageService, ReadOutcome, SendRequest},
    now_millis,
    protocol::{ClientEvent, ServerEvent, PROTOCOL_VERSION},
    storage::{thread::validate_id, Message, Thread, ThreadMetadata},
    unread::{NotificationQueue, UnreadSnapshot, UnreadTracker},
    Error, Result,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Default time after which a typing indicator expires without a stop signal
pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(5);

/// A newly connected session
pub struct Connected {
    /// Authenticated user
    pub user_id: String,
    /// Session id used for subsequent calls
    pub session_id: SessionId,
    /// Events addressed to this session, starting with `ready`
    pub events: UnboundedReceiver<ServerEvent>,
}

/// What happened when a persisted message was published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    /// A recipient session received the broadcast
    pub delivered: bool,
    /// The recipient was offline and a notification was queued
    pub notified: bool,
}

/// Realtime synchronization layer
#[derive(Clone)]
pub struct RealtimeHub {
    messages: MessageService,
    registry: ConnectionRegistry,
    presence: PresenceStore,
    unread: UnreadTracker,
    notifications: NotificationQueue,
    typing: Arc<Mutex<HashMap<(String, String), u64>>>,
    typing_generation: Arc<AtomicU64>,
    typing_ttl: Duration,
}

impl RealtimeHub {
    /// Create a hub around a message service
    pub fn new(
        messages: MessageService,
        registry: ConnectionRegistry,
        presence: PresenceStore,
        unread: UnreadTracker,
        notifications: NotificationQueue,
    ) -> Self {
        Self {
            messages,
            registry,
            presence,
            unread,
            notifications,
            typing: Arc::new(Mutex::new(HashMap::new())),
            typing_generation: Arc::new(AtomicU64::new(0)),
            typing_ttl: DEFAULT_TYPING_TTL,
        }
    }

    /// Replace the typing indicator expiry
    pub fn with_typing_ttl(mut self, ttl: Duration) -> Self {
        self.typing_ttl = ttl;
        self
    }

    /// The message service behind this hub
    pub fn messages(&self) -> &MessageService {
        &self.messages
    }

    /// The connection registry
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// The unread counters
    pub fn unread(&self) -> &UnreadTracker {
        &self.unread
    }

    /// The offline notification queue
    pub fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }

    /// Number of typing indicators currently active
    pub fn typing_count(&self) -> usize {
        self.typing.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// The presence store
    pub fn presence(&self) -> &PresenceStore {
        &self.presence
    }

    /// Register an authenticated session, join its rooms and flush what it missed
    pub async fn connect(&self, user_id: &str) -> Result<Connected> {
        validate_id("user id", user_id)?;
        let registration = self.registry.register(user_id).await;
        let session_id = registration.session_id.clone();

        let rooms = match self.join_rooms(&session_id, user_id).await {
            Ok(rooms) => rooms,
            Err(e) => {
                self.registry.unregister(&session_id).await;
                return Err(e);
            }
        };

        self.registry
            .send_to_session(
                &session_id,
                ServerEvent::Ready {
                    user_id: user_id.to_string(),
                    session_id: session_id.clone(),
                    rooms: rooms.clone(),
                    version: PROTOCOL_VERSION,
                },
            )
            .await;

        if registration.first_session {
            let state = self.presence.set(user_id, true)?;
            self.announce_presence(user_id, &rooms, state.online, state.last_seen, Some(&session_id))
                .await;
        }

        // Reads recorded while the user had no session are only in the store
        let snapshot = self.unread.seed_from(user_id, &self.messages)?;
        self.registry
            .send_to_session(&session_id, unread_event(&snapshot))
            .await;

        for notification in self.notifications.flush(user_id)? {
            self.registry
                .send_to_session(
                    &session_id,
                    ServerEvent::Notification {
                        notification_id: notification.id,
                        thread_id: notification.thread_id,
                        message_id: notification.message_id,
                        created_at: notification.created_at,
                    },
                )
                .await;
        }

        info!("User {} connected (session {}, {} rooms)", user_id, session_id, rooms.len());
        Ok(Connected {
            user_id: user_id.to_string(),
            session_id,
            events: registration.receiver,
        })
    }

    /// Drop a session; the last session going away marks the user offline
    ///
    /// Undelivered messages stay in the store for the catch-up fetch.
    pub async fn disconnect(&self, session_id: &str) -> Result<()> {
        let Some((user_id, last_session)) = self.registry.unregister(session_id).await else {
            return Ok(());
        };

        if last_session {
            let state = self.presence.set(&user_id, false)?;
            let rooms = self.messages.threads().active_thread_ids(&user_id)?;
            self.announce_presence(&user_id, &rooms, state.online, state.last_seen, None)
                .await;
            info!("User {} went offline", user_id);
        } else {
            debug!("Session {} of {} closed", session_id, user_id);
        }
        Ok(())
    }

    /// Process one client event; failures are reported to the session as error frames
    pub async fn handle(&self, session_id: &str, event: ClientEvent) -> Result<()> {
        let user_id = self
            .registry
            .session_user(session_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))?;

        let pending_id = match &event {
            ClientEvent::SendMessage { pending_id, .. } => pending_id.clone(),
            _ => None,
        };

        if let Err(e) = self.dispatch(session_id, &user_id, event).await {
            if e.is_terminal() {
                debug!("Rejected event from session {}: {}", session_id, e);
            } else {
                warn!("Event from session {} failed: {}", session_id, e);
            }
            self.registry
                .send_to_session(session_id, ServerEvent::error(&e, pending_id))
                .await;
        }
        Ok(())
    }

    async fn dispatch(&self, session_id: &str, user_id: &str, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::Hello { .. } => Err(Error::Validation("session already authenticated".to_string())),
            ClientEvent::JoinThreadRooms => {
                let rooms = self.join_rooms(session_id, user_id).await?;
                self.registry
                    .send_to_session(session_id, ServerEvent::RoomsJoined { rooms })
                    .await;
                Ok(())
            }
            ClientEvent::SendMessage {
                thread_id,
                content,
                content_type,
                attachments,
                pending_id,
            } => {
                let request = SendRequest {
                    content,
                    content_type,
                    attachments,
                    client_ref: pending_id,
                };
                self.send_message(&thread_id, user_id, request, Some(session_id))
                    .await?;
                Ok(())
            }
            ClientEvent::TypingStart { thread_id } => self.typing(session_id, user_id, &thread_id, true).await,
            ClientEvent::TypingStop { thread_id } => self.typing(session_id, user_id, &thread_id, false).await,
            ClientEvent::MarkRead { message_id } => {
                self.mark_read(&message_id, user_id).await?;
                Ok(())
            }
            ClientEvent::OpenThread {
                counterparty_id,
                origin_ref,
                initial_message,
            } => {
                let (thread, _) = self
                    .open_thread(
                        user_id,
                        &counterparty_id,
                        ThreadMetadata { origin_ref },
                        initial_message.map(SendRequest::text),
                        Some(session_id),
                    )
                    .await?;
                self.registry
                    .send_to_session(session_id, ServerEvent::RoomsJoined { rooms: vec![thread.id] })
                    .await;
                Ok(())
            }
        }
    }

    /// Persist a message and publish it
    ///
    /// The sending session (if any) receives a `message_ack`; replays of an
    /// already persisted client reference are acknowledged but not re-published.
    pub async fn send_message(
        &self,
        thread_id: &str,
        sender_id: &str,
        request: SendRequest,
        origin_session: Option<&str>,
    ) -> Result<Message> {
        let outcome = self.messages.send_tracked(thread_id, sender_id, request)?;

        if let Some(session_id) = origin_session {
            self.registry
                .send_to_session(
                    session_id,
                    ServerEvent::MessageAck {
                        pending_id: outcome.message.client_ref.clone(),
                        message: outcome.message.clone(),
                    },
                )
                .await;
        }

        if !outcome.replayed {
            self.publish_sent(&outcome.message, origin_session).await?;
        }
        Ok(outcome.message)
    }

    /// Create or reopen a thread, join both participants' sessions and
    /// publish the optional first message
    pub async fn open_thread(
        &self,
        initiator_id: &str,
        counterparty_id: &str,
        metadata: ThreadMetadata,
        initial_message: Option<SendRequest>,
        origin_session: Option<&str>,
    ) -> Result<(Thread, Option<Message>)> {
        let (thread, _) = self
            .messages
            .open_thread(initiator_id, counterparty_id, metadata, None)?;
        self.join_thread(&thread).await;

        let message = match initial_message {
            Some(request) => Some(
                self.send_message(&thread.id, initiator_id, request, origin_session)
                    .await?,
            ),
            None => None,
        };
        Ok((thread, message))
    }

    /// Broadcast a persisted message to its room and advance its delivery state
    ///
    /// Fire-and-forget relative to the send: persistence already succeeded.
    pub async fn publish_sent(&self, message: &Message, origin_session: Option<&str>) -> Result<PublishReport> {
        let thread = self.messages.threads().load(&message.thread_id)?;
        self.join_thread(&thread).await;

        let recipient_id = thread
            .other_participant(&message.sender_id)
            .ok_or_else(|| Error::Forbidden(format!("sender {} left thread {}", message.sender_id, thread.id)))?
            .to_string();

        let reached = self
            .registry
            .broadcast(
                &thread.id,
                &ServerEvent::MessageBroadcast {
                    message: message.clone(),
                },
                origin_session,
            )
            .await;

        let delivered = reached.contains(&recipient_id);
        if delivered {
            if self.messages.mark_delivered(&message.id)? {
                self.registry
                    .broadcast(
                        &thread.id,
                        &ServerEvent::MessageDelivered {
                            thread_id: thread.id.clone(),
                            message_id: message.id.clone(),
                        },
                        None,
                    )
                    .await;
            }
        } else {
            self.notifications
                .enqueue(&recipient_id, &thread.id, &message.id)?;
        }

        let snapshot = self
            .unread
            .increment_from(&recipient_id, &thread.id, &message.id, &self.messages)?;
        if delivered {
            self.registry
                .send_to_user(&recipient_id, &unread_event(&snapshot), None)
                .await;
        }

        debug!(
            "Published message {} in thread {} (delivered: {})",
            message.id, thread.id, delivered
        );
        Ok(PublishReport {
            delivered,
            notified: !delivered,
        })
    }

    /// Record a read receipt and tell the room
    pub async fn mark_read(&self, message_id: &str, reader_id: &str) -> Result<ReadOutcome> {
        let outcome = self.messages.mark_read(message_id, reader_id)?;

        if outcome.newly_read {
            let read = [outcome.message_id.clone()];
            if let Some(snapshot) = self.unread.decrement(reader_id, &outcome.thread_id, &read) {
                self.registry
                    .send_to_user(reader_id, &unread_event(&snapshot), None)
                    .await;
            }

            if let Some(receipt) = &outcome.receipt {
                self.registry
                    .broadcast(
                        &outcome.thread_id,
                        &ServerEvent::MessageRead {
                            thread_id: outcome.thread_id.clone(),
                            message_id: receipt.message_id.clone(),
                            reader_id: receipt.reader_id.clone(),
                            read_at: receipt.read_at,
                        },
                        None,
                    )
                    .await;
            }
        }
        Ok(outcome)
    }

    /// Mark a whole thread read for a user and zero its counter
    ///
    /// Only the messages this call marked are subtracted, so one arriving
    /// concurrently stays counted.
    pub async fn mark_thread_read(&self, thread_id: &str, reader_id: &str) -> Result<Vec<String>> {
        let ids = self.messages.mark_thread_read(thread_id, reader_id)?;
        if let Some(snapshot) = self.unread.decrement(reader_id, thread_id, &ids) {
            self.registry
                .send_to_user(reader_id, &unread_event(&snapshot), None)
                .await;
        }

        let read_at = now_millis();
        for message_id in &ids {
            self.registry
                .broadcast(
                    thread_id,
                    &ServerEvent::MessageRead {
                        thread_id: thread_id.to_string(),
                        message_id: message_id.clone(),
                        reader_id: reader_id.to_string(),
                        read_at,
                    },
                    None,
                )
                .await;
        }
        Ok(ids)
    }

    /// Hide a message for the requester and drop it from their unread counter
    pub async fn soft_delete(&self, message_id: &str, requester_id: &str) -> Result<()> {
        let thread_id = self.messages.soft_delete(message_id, requester_id)?;
        if let Some(snapshot) = self
            .unread
            .decrement(requester_id, &thread_id, &[message_id.to_string()])
        {
            self.registry
                .send_to_user(requester_id, &unread_event(&snapshot), None)
                .await;
        }
        Ok(())
    }

    /// Join both participants' live sessions to a thread room
    pub async fn join_thread(&self, thread: &Thread) {
        self.registry.join_user(&thread.initiator_id, &thread.id).await;
        self.registry.join_user(&thread.counterparty_id, &thread.id).await;
    }

    async fn join_rooms(&self, session_id: &str, user_id: &str) -> Result<Vec<String>> {
        let rooms = self.messages.threads().active_thread_ids(user_id)?;
        for room in &rooms {
            self.registry.join(session_id, room).await;
        }
        Ok(rooms)
    }

    async fn announce_presence(
        &self,
        user_id: &str,
        rooms: &[String],
        online: bool,
        last_seen: i64,
        exclude: Option<&str>,
    ) {
        let event = ServerEvent::PresenceUpdate {
            user_id: user_id.to_string(),
            online,
            last_seen,
        };
        for room in rooms {
            self.registry.broadcast(room, &event, exclude).await;
        }
    }

    async fn typing(&self, session_id: &str, user_id: &str, thread_id: &str, active: bool) -> Result<()> {
        self.messages.threads().authorize(thread_id, user_id)?;

        let key = (thread_id.to_string(), user_id.to_string());
        let generation = {
            let mut typing = self.typing.lock().unwrap_or_else(|p| p.into_inner());
            if active {
                let generation = self.typing_generation.fetch_add(1, Ordering::Relaxed) + 1;
                typing.insert(key.clone(), generation);
                generation
            } else {
                // A pending expiry finds no entry and stays quiet
                typing.remove(&key);
                0
            }
        };

        self.registry
            .broadcast(
                thread_id,
                &ServerEvent::Typing {
                    thread_id: thread_id.to_string(),
                    user_id: user_id.to_string(),
                    active,
                },
                Some(session_id),
            )
            .await;

        if active {
            let hub = self.clone();
            let ttl = self.typing_ttl;
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                let expired = {
                    let mut typing = hub.typing.lock().unwrap_or_else(|p| p.into_inner());
                    let current = typing.get(&key) == Some(&generation);
                    if current {
                        typing.remove(&key);
                    }
                    current
                };
                if expired {
                    let (thread_id, user_id) = key;
                    hub.registry
                        .broadcast(
                            &thread_id,
                            &ServerEvent::Typing {
                                thread_id: thread_id.clone(),
                                user_id,
                                active: false,
                            },
                            Some(&session_id),
                        )
                        .await;
                }
            });
        }
        Ok(())
    }
}

fn unread_event(snapshot: &UnreadSnapshot) -> ServerEvent {
    ServerEvent::UnreadCounts {
        total: snapshot.total,
        threads: snapshot.threads.clone(),
    }
}
