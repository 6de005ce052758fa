// Shared fixtures: an in-memory store wired into the services

use crate::crypto::{EncryptionService, MasterKey};
use crate::message_service::MessageService;
use crate::protocol::ServerEvent;
use crate::realtime::{ConnectionRegistry, PresenceStore, RealtimeHub};
use crate::storage::{Database, Thread, ThreadMetadata};
use crate::thread_manager::ThreadManager;
use crate::unread::{NotificationQueue, UnreadTracker};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub(crate) fn database() -> Database {
    Database::open_in_memory().expect("Failed to open in-memory database")
}

pub(crate) fn message_service(db: &Database) -> MessageService {
    let threads = ThreadManager::new(db.clone());
    let crypto = EncryptionService::new(db.clone(), MasterKey::generate());
    MessageService::new(db.clone(), threads, crypto)
}

pub(crate) fn hub_with(db: &Database) -> RealtimeHub {
    RealtimeHub::new(
        message_service(db),
        ConnectionRegistry::new(),
        PresenceStore::new(db.clone()),
        UnreadTracker::new(),
        NotificationQueue::new(db.clone()),
    )
}

pub(crate) fn hub() -> RealtimeHub {
    hub_with(&database())
}

pub(crate) fn open_pair(service: &MessageService, a: &str, b: &str) -> Thread {
    service
        .threads()
        .create_or_get_thread(a, b, ThreadMetadata::default())
        .expect("Failed to create thread")
}

/// Next event, failing the test if none arrives in time
pub(crate) async fn next_event(events: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Event channel closed")
}

/// Drop everything currently queued
pub(crate) fn drain(events: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Next event matching `pred`, skipping others
pub(crate) async fn wait_for<F>(events: &mut UnboundedReceiver<ServerEvent>, pred: F) -> ServerEvent
where
    F: Fn(&ServerEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}

/// The hub's live counters agree with the unread state in the store
pub(crate) fn assert_unread_matches_store(hub: &RealtimeHub, user_id: &str) {
    let stored: u64 = hub
        .messages()
        .unread_counts(user_id)
        .expect("Failed to count unread")
        .values()
        .sum();
    assert_eq!(hub.unread().counts(user_id).total, stored, "unread drift for {}", user_id);
}
