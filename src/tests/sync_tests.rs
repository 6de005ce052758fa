use crate::message_service::SendRequest;
use crate::realtime::RealtimeHub;
use crate::retry::RetryPolicy;
use crate::storage::{ContentType, DeliveryStatus, Message, ParticipantRole, Thread, ThreadMetadata};
use crate::sync::*;
use crate::tests::support::{hub, open_pair};
use crate::Error;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

struct Client {
    hub: RealtimeHub,
    api: LocalMessageApi,
    sync: OfflineSyncService,
    thread: Thread,
}

fn client() -> Client {
    let hub = hub();
    let thread = open_pair(hub.messages(), "alice", "bob");
    let api = LocalMessageApi::new(hub.clone(), "alice");
    let store = SyncStore::open_in_memory().expect("Failed to open sync store");
    let sync = OfflineSyncService::new(store, Arc::new(api.clone())).with_retry(RetryPolicy::new(3, 0, 0));
    Client { hub, api, sync, thread }
}

fn server_message(thread_id: &str, id: &str, seq: i64, created_at: i64) -> Message {
    Message {
        id: id.to_string(),
        thread_id: thread_id.to_string(),
        seq,
        sender_id: "bob".to_string(),
        sender_role: ParticipantRole::Counterparty,
        content_type: ContentType::Text,
        content: Some(format!("message {}", seq)),
        created_at,
        status: DeliveryStatus::Sent,
        deleted: false,
        client_ref: None,
        attachments: Vec::new(),
    }
}

#[tokio::test]
async fn test_queue_while_offline_never_sends() {
    let c = client();
    assert!(!c.sync.is_online());

    c.sync
        .queue_message(&c.thread.id, "first", ContentType::Text)
        .expect("Failed to queue");
    c.sync
        .queue_message(&c.thread.id, "second", ContentType::Text)
        .expect("Failed to queue");

    let report = c.sync.sync_now().await.expect("Failed to sync");
    assert!(report.sent.is_empty());
    assert_eq!(report.deferred, 2);
    assert_eq!(c.sync.queued(&c.thread.id).expect("queue").len(), 2);
}

#[tokio::test]
async fn test_queue_rejects_empty_input() {
    let c = client();
    assert!(matches!(
        c.sync.queue_message(&c.thread.id, "  ", ContentType::Text),
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        c.sync.queue_message("", "hi", ContentType::Text),
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_drain_preserves_fifo_and_maps_pending_ids() {
    let c = client();
    let pending: Vec<String> = (0..5)
        .map(|i| {
            c.sync
                .queue_message(&c.thread.id, &format!("queued {}", i), ContentType::Text)
                .expect("Failed to queue")
        })
        .collect();

    c.sync.set_online(true);
    let report = c.sync.sync_now().await.expect("Failed to sync");
    assert_eq!(report.sent.len(), 5);
    assert!(report.failed.is_empty());

    let sent_order: Vec<&str> = report.sent.iter().map(|(p, _)| p.as_str()).collect();
    let expected: Vec<&str> = pending.iter().map(String::as_str).collect();
    assert_eq!(sent_order, expected);

    // Server order matches enqueue order
    let server = c
        .hub
        .messages()
        .list(&c.thread.id, "bob", crate::message_service::PageRequest::latest())
        .expect("Failed to list");
    let contents: Vec<&str> = server.messages.iter().filter_map(|m| m.content.as_deref()).collect();
    assert_eq!(contents, vec!["queued 0", "queued 1", "queued 2", "queued 3", "queued 4"]);

    // Queue emptied; cache holds canonical ids only
    assert!(c.sync.queued(&c.thread.id).expect("queue").is_empty());
    let cached = c.sync.cached_messages(&c.thread.id).expect("cache");
    assert_eq!(cached.len(), 5);
    for (pending_id, message_id) in &report.sent {
        assert_eq!(
            c.sync.canonical_id(&c.thread.id, pending_id).expect("lookup").as_deref(),
            Some(message_id.as_str())
        );
        assert!(cached.iter().all(|m| &m.id != pending_id));
    }
}

#[tokio::test]
async fn test_transient_failure_keeps_order() {
    let c = client();
    let first = c
        .sync
        .queue_message(&c.thread.id, "one", ContentType::Text)
        .expect("Failed to queue");
    c.sync
        .queue_message(&c.thread.id, "two", ContentType::Text)
        .expect("Failed to queue");

    c.sync.set_online(true);
    c.api.set_reachable(false);
    let report = c.sync.sync_now().await.expect("Failed to sync");
    assert!(report.sent.is_empty());
    assert!(report.failed.is_empty());
    assert_eq!(report.deferred, 2);

    let queue = c.sync.queued(&c.thread.id).expect("queue");
    assert_eq!(queue[0].pending_id, first);
    assert_eq!(queue[0].attempts, 1);
    assert!(queue[0].last_error.is_some());
    assert!(queue[0].is_pending());
    // The second entry was never attempted
    assert_eq!(queue[1].attempts, 0);

    c.api.set_reachable(true);
    let report = c.sync.sync_now().await.expect("Failed to sync");
    assert_eq!(report.sent.len(), 2);
    assert_eq!(report.sent[0].0, first);
}

#[tokio::test]
async fn test_exhausted_retries_mark_failed_until_user_acts() {
    let c = client();
    let pending = c
        .sync
        .queue_message(&c.thread.id, "stubborn", ContentType::Text)
        .expect("Failed to queue");
    c.sync.set_online(true);
    c.api.set_reachable(false);

    c.sync.sync_now().await.expect("attempt 1");
    c.sync.sync_now().await.expect("attempt 2");
    let report = c.sync.sync_now().await.expect("attempt 3");
    assert_eq!(report.failed, vec![pending.clone()]);

    let entry = c.sync.queued(&c.thread.id).expect("queue").remove(0);
    assert!(matches!(entry.status, QueueStatus::Failed { retryable: true, .. }));

    // Failed entries are left alone by later drains
    c.api.set_reachable(true);
    let report = c.sync.sync_now().await.expect("Failed to sync");
    assert!(report.sent.is_empty());

    c.sync.retry_failed(&c.thread.id, &pending).expect("Failed to retry");
    let report = c.sync.sync_now().await.expect("Failed to sync");
    assert_eq!(report.sent.len(), 1);
}

#[tokio::test]
async fn test_rejected_entry_fails_without_blocking_the_rest() {
    let c = client();
    let too_long = "x".repeat(crate::message_service::MessageLimits::default().max_content_len + 1);
    let bad = c
        .sync
        .queue_message(&c.thread.id, &too_long, ContentType::Text)
        .expect("Failed to queue");
    c.sync
        .queue_message(&c.thread.id, "fine", ContentType::Text)
        .expect("Failed to queue");

    c.sync.set_online(true);
    let report = c.sync.sync_now().await.expect("Failed to sync");
    assert_eq!(report.failed, vec![bad.clone()]);
    assert_eq!(report.sent.len(), 1);

    let queue = c.sync.queued(&c.thread.id).expect("queue");
    assert_eq!(queue.len(), 1);
    assert!(matches!(queue[0].status, QueueStatus::Failed { retryable: false, .. }));

    let discarded = c.sync.discard(&c.thread.id, &bad).expect("Failed to discard");
    assert_eq!(discarded.pending_id, bad);
    assert!(c.sync.queued(&c.thread.id).expect("queue").is_empty());
    assert!(matches!(c.sync.discard(&c.thread.id, &bad), Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_threads_drain_independently() {
    let c = client();
    let other = open_pair(c.hub.messages(), "alice", "carol");
    for i in 0..3 {
        c.sync
            .queue_message(&c.thread.id, &format!("bob {}", i), ContentType::Text)
            .expect("Failed to queue");
        c.sync
            .queue_message(&other.id, &format!("carol {}", i), ContentType::Text)
            .expect("Failed to queue");
    }

    c.sync.set_online(true);
    let report = c.sync.sync_now().await.expect("Failed to sync");
    assert_eq!(report.sent.len(), 6);

    for (thread_id, prefix) in [(&c.thread.id, "bob"), (&other.id, "carol")] {
        let cached = c.sync.cached_messages(thread_id).expect("cache");
        let contents: Vec<String> = cached.iter().filter_map(|m| m.content.clone()).collect();
        assert_eq!(
            contents,
            (0..3).map(|i| format!("{} {}", prefix, i)).collect::<Vec<_>>()
        );
    }
}

#[tokio::test]
async fn test_catch_up_fetches_missed_messages_in_pages() {
    let c = client();
    let sync = c.sync.clone().with_page_size(2);
    for i in 0..5 {
        c.hub
            .send_message(&c.thread.id, "bob", SendRequest::text(format!("missed {}", i)), None)
            .await
            .expect("Failed to send");
    }

    // Seed the thread so catch-up knows about it
    sync.update_conversation_state(&c.thread.id, StatePatch::default())
        .expect("Failed to seed state");

    let fetched = sync.catch_up(&c.thread.id).await.expect("Failed to catch up");
    assert_eq!(fetched, 5);

    let cached = sync.cached_messages(&c.thread.id).expect("cache");
    let seqs: Vec<i64> = cached.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    assert_eq!(
        sync.conversation_state(&c.thread.id).expect("state").last_sync_timestamp,
        cached[4].created_at
    );

    // Nothing new on a second pass
    assert_eq!(sync.catch_up(&c.thread.id).await.expect("Failed to catch up"), 0);
}

#[tokio::test]
async fn test_on_reconnected_catches_up_then_drains() {
    let c = client();
    c.hub
        .send_message(&c.thread.id, "bob", SendRequest::text("while offline"), None)
        .await
        .expect("Failed to send");
    c.sync
        .queue_message(&c.thread.id, "reply", ContentType::Text)
        .expect("Failed to queue");

    let report = c.sync.on_reconnected().await.expect("Failed to reconnect");
    assert!(c.sync.is_online());
    assert_eq!(report.sent.len(), 1);

    let cached = c.sync.cached_messages(&c.thread.id).expect("cache");
    let contents: Vec<&str> = cached.iter().filter_map(|m| m.content.as_deref()).collect();
    assert_eq!(contents, vec!["while offline", "reply"]);
}

#[tokio::test]
async fn test_reconnect_fetches_thread_opened_while_away() {
    let c = client();
    let (thread, _) = c
        .hub
        .open_thread(
            "carol",
            "alice",
            ThreadMetadata::default(),
            Some(SendRequest::text("Hi, interested")),
            None,
        )
        .await
        .expect("Failed to open thread");
    assert!(!c.sync.store().contains(&thread.id).expect("contains"));

    c.sync.on_reconnected().await.expect("Failed to reconnect");

    let cached = c.sync.cached_messages(&thread.id).expect("cache");
    let contents: Vec<&str> = cached.iter().filter_map(|m| m.content.as_deref()).collect();
    assert_eq!(contents, vec!["Hi, interested"]);
}

#[tokio::test]
async fn test_merge_is_idempotent_and_never_regresses() {
    let c = client();
    let t = &c.thread.id;

    let mut delivered = server_message(t, "m1", 1, 1_000);
    delivered.status = DeliveryStatus::Delivered;
    let report = c.sync.merge_remote_state(t, vec![delivered]).expect("Failed to merge");
    assert_eq!(report.added, 1);

    // A stale copy neither duplicates nor downgrades
    let report = c
        .sync
        .merge_remote_state(t, vec![server_message(t, "m1", 1, 1_000)])
        .expect("Failed to merge");
    assert_eq!(report.added, 0);
    let cached = c.sync.cached_messages(t).expect("cache");
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].status, DeliveryStatus::Delivered);

    // An older batch does not move the sync timestamp back
    c.sync
        .merge_remote_state(t, vec![server_message(t, "m0", 0, 500)])
        .expect("Failed to merge");
    let state = c.sync.conversation_state(t).expect("state");
    assert_eq!(state.last_sync_timestamp, 1_000);
    let ids: Vec<String> = c.sync.cached_messages(t).expect("cache").into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec!["m0", "m1"]);

    assert!(c.sync.advance_status(t, "m1", DeliveryStatus::Read).expect("advance"));
    assert!(!c.sync.advance_status(t, "m1", DeliveryStatus::Delivered).expect("advance"));
}

#[tokio::test]
async fn test_merge_rejects_foreign_messages() {
    let c = client();
    let result = c
        .sync
        .merge_remote_state(&c.thread.id, vec![server_message("other-thread", "m1", 1, 1)]);
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[tokio::test]
async fn test_merge_confirms_queue_entry_by_client_ref() {
    let c = client();
    let pending = c
        .sync
        .queue_message(&c.thread.id, "echo", ContentType::Text)
        .expect("Failed to queue");

    let mut confirmed = server_message(&c.thread.id, "canonical-1", 1, 10);
    confirmed.client_ref = Some(pending.clone());
    let report = c
        .sync
        .merge_remote_state(&c.thread.id, vec![confirmed])
        .expect("Failed to merge");

    assert_eq!(report.confirmed, vec![(pending.clone(), "canonical-1".to_string())]);
    assert!(c.sync.queued(&c.thread.id).expect("queue").is_empty());
    assert_eq!(
        c.sync.canonical_id(&c.thread.id, &pending).expect("lookup").as_deref(),
        Some("canonical-1")
    );
}

#[tokio::test]
async fn test_state_patch_updates_only_given_fields() {
    let c = client();
    let t = &c.thread.id;

    c.sync
        .update_conversation_state(
            t,
            StatePatch {
                last_read_message_id: Some("m5".to_string()),
                scroll_position: Some(420),
                unread_count: Some(3),
            },
        )
        .expect("Failed to update");

    let state = c
        .sync
        .update_conversation_state(
            t,
            StatePatch {
                scroll_position: Some(0),
                ..Default::default()
            },
        )
        .expect("Failed to update");

    assert_eq!(state.last_read_message_id.as_deref(), Some("m5"));
    assert_eq!(state.scroll_position, Some(0));
    assert_eq!(state.unread_count, 3);
}

#[tokio::test]
async fn test_clear_thread_leaves_others() {
    let c = client();
    c.sync
        .queue_message("thread-a", "a", ContentType::Text)
        .expect("Failed to queue");
    c.sync
        .queue_message("thread-b", "b", ContentType::Text)
        .expect("Failed to queue");

    assert!(c.sync.clear_thread("thread-a").expect("Failed to clear"));
    assert!(c.sync.queued("thread-a").expect("queue").is_empty());
    assert_eq!(c.sync.queued("thread-b").expect("queue").len(), 1);
    assert!(!c.sync.clear_thread("thread-a").expect("Second clear"));
}

#[test]
fn test_store_survives_reopen() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("sync.db");

    {
        let store = SyncStore::open(&path).expect("Failed to open");
        store
            .update("t1", |record| {
                record.enqueue("p-1".to_string(), "durable".to_string(), ContentType::Text, Vec::new());
                Ok(())
            })
            .expect("Failed to update");
    }

    let store = SyncStore::open(&path).expect("Failed to reopen");
    assert!(store.contains("t1").expect("contains"));
    let record = store.load("t1").expect("Failed to load");
    assert_eq!(record.queue[0].pending_id, "p-1");
    assert_eq!(record.queue[0].content, "durable");
    assert_eq!(store.thread_ids().expect("ids"), vec!["t1".to_string()]);
}

#[test]
fn test_failed_update_leaves_record_untouched() {
    let store = SyncStore::open_in_memory().expect("Failed to open");
    store
        .update("t1", |record| {
            record.enqueue("p-1".to_string(), "kept".to_string(), ContentType::Text, Vec::new());
            Ok(())
        })
        .expect("Failed to update");

    let result: crate::Result<()> = store.update("t1", |record| {
        record.queue.clear();
        Err(Error::Validation("abort".to_string()))
    });
    assert!(result.is_err());
    assert_eq!(store.load("t1").expect("load").queue.len(), 1);
}

#[test]
fn test_catch_up_cursor_stops_at_first_gap() {
    let mut record = ThreadRecord::new("t1");
    assert_eq!(record.catch_up_cursor(), None);

    record.merge(vec![
        server_message("t1", "m1", 1, 10),
        server_message("t1", "m2", 2, 20),
        server_message("t1", "m4", 4, 40),
    ]);
    assert_eq!(record.catch_up_cursor(), Some("m2"));
    assert_eq!(record.last_message_id(), Some("m4"));

    record.merge(vec![server_message("t1", "m3", 3, 30)]);
    assert_eq!(record.catch_up_cursor(), Some("m4"));
}

#[test]
fn test_timeline_lists_confirmed_then_queued() {
    let mut record = ThreadRecord::new("t1");
    record.enqueue("p-1".to_string(), "local".to_string(), ContentType::Text, Vec::new());
    record.merge(vec![server_message("t1", "m1", 1, 10)]);

    let timeline = record.timeline();
    assert_eq!(timeline.len(), 2);
    assert!(matches!(&timeline[0], TimelineEntry::Confirmed(m) if m.id == "m1"));
    assert!(matches!(&timeline[1], TimelineEntry::Queued(q) if q.pending_id == "p-1"));
}

#[tokio::test]
async fn test_reconnector_backs_off_until_connected() {
    let reconnector = Reconnector::new(RetryPolicy::new(5, 1, 5));
    let mut states = reconnector.subscribe();
    let attempts = AtomicU32::new(0);

    let value = reconnector
        .connect_with_backoff(|attempt| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(Error::Transient("refused".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .expect("Should connect on the third attempt");

    assert_eq!(value, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(reconnector.state(), LinkState::Connected);
    assert!(states.has_changed().expect("Sender alive"));
    assert_eq!(*states.borrow_and_update(), LinkState::Connected);
}

#[tokio::test]
async fn test_reconnector_gives_up() {
    let reconnector = Reconnector::new(RetryPolicy::new(3, 1, 1));
    let attempts = AtomicU32::new(0);

    let result: crate::Result<()> = reconnector
        .connect_with_backoff(|_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Transient("down".to_string())) }
        })
        .await;
    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(reconnector.state(), LinkState::Offline);

    // Terminal errors stop immediately
    attempts.store(0, Ordering::SeqCst);
    let result: crate::Result<()> = reconnector
        .connect_with_backoff(|_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Forbidden("bad token".to_string())) }
        })
        .await;
    assert!(matches!(result, Err(Error::Forbidden(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}
