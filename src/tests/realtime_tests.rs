use crate::message_service::{PageRequest, SendRequest};
use crate::protocol::{ClientEvent, ServerEvent, PROTOCOL_VERSION};
use crate::realtime::*;
use crate::storage::{DeliveryStatus, ThreadMetadata};
use crate::tests::support::{
    assert_unread_matches_store, database, drain, hub, hub_with, next_event, open_pair, wait_for,
};
use std::time::Duration;

#[tokio::test]
async fn test_registry_broadcast_excludes_origin() {
    let registry = ConnectionRegistry::new();
    let alice = registry.register("alice").await;
    let mut alice_rx = alice.receiver;
    let bob = registry.register("bob").await;
    let mut bob_rx = bob.receiver;

    assert!(registry.join(&alice.session_id, "t1").await);
    assert!(registry.join(&bob.session_id, "t1").await);
    assert_eq!(registry.room_size("t1").await, 2);

    let event = ServerEvent::RoomsJoined { rooms: vec![] };
    let reached = registry.broadcast("t1", &event, Some(&alice.session_id)).await;

    assert_eq!(reached.len(), 1);
    assert!(reached.contains("bob"));
    assert_eq!(bob_rx.try_recv().expect("Bob got the event"), event);
    assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_registry_tracks_sessions_per_user() {
    let registry = ConnectionRegistry::new();
    let first = registry.register("alice").await;
    let second = registry.register("alice").await;

    assert!(first.first_session);
    assert!(!second.first_session);
    assert_eq!(registry.join_user("alice", "t1").await, 2);
    assert_eq!(registry.session_count().await, 2);

    assert_eq!(
        registry.unregister(&first.session_id).await,
        Some(("alice".to_string(), false))
    );
    assert!(registry.is_online("alice").await);
    assert_eq!(registry.room_size("t1").await, 1);

    assert_eq!(
        registry.unregister(&second.session_id).await,
        Some(("alice".to_string(), true))
    );
    assert!(!registry.is_online("alice").await);
    assert_eq!(registry.room_size("t1").await, 0);
    assert_eq!(registry.unregister(&second.session_id).await, None);
}

#[tokio::test]
async fn test_registry_send_to_user_skips_excluded_session() {
    let registry = ConnectionRegistry::new();
    let first = registry.register("alice").await;
    let second = registry.register("alice").await;
    let mut second_rx = second.receiver;

    let event = ServerEvent::RoomsJoined { rooms: vec!["t1".to_string()] };
    let sent = registry.send_to_user("alice", &event, Some(&first.session_id)).await;

    assert_eq!(sent, 1);
    assert_eq!(second_rx.try_recv().expect("Second session got it"), event);
    assert_eq!(registry.send_to_user("nobody", &event, None).await, 0);
}

#[tokio::test]
async fn test_connect_sends_ready_and_counts() {
    let hub = hub();
    let thread = open_pair(hub.messages(), "alice", "bob");

    let mut alice = hub.connect("alice").await.expect("Failed to connect");

    match next_event(&mut alice.events).await {
        ServerEvent::Ready {
            user_id,
            session_id,
            rooms,
            version,
        } => {
            assert_eq!(user_id, "alice");
            assert_eq!(session_id, alice.session_id);
            assert_eq!(rooms, vec![thread.id.clone()]);
            assert_eq!(version, PROTOCOL_VERSION);
        }
        other => panic!("Expected ready, got {:?}", other),
    }
    assert!(matches!(
        next_event(&mut alice.events).await,
        ServerEvent::UnreadCounts { total: 0, .. }
    ));
    assert!(hub.presence().get("alice").expect("presence").online);
}

#[tokio::test]
async fn test_live_send_is_delivered() {
    let hub = hub();
    let thread = open_pair(hub.messages(), "alice", "bob");
    let mut alice = hub.connect("alice").await.expect("Failed to connect");
    let mut bob = hub.connect("bob").await.expect("Failed to connect");
    drain(&mut alice.events);
    drain(&mut bob.events);

    let sent = hub
        .send_message(
            &thread.id,
            "alice",
            SendRequest::text("hi bob").with_client_ref("p-1"),
            Some(&alice.session_id),
        )
        .await
        .expect("Failed to send");

    match next_event(&mut alice.events).await {
        ServerEvent::MessageAck { pending_id, message } => {
            assert_eq!(pending_id.as_deref(), Some("p-1"));
            assert_eq!(message.id, sent.id);
        }
        other => panic!("Expected ack, got {:?}", other),
    }

    match next_event(&mut bob.events).await {
        ServerEvent::MessageBroadcast { message } => {
            assert_eq!(message.id, sent.id);
            assert_eq!(message.content.as_deref(), Some("hi bob"));
        }
        other => panic!("Expected broadcast, got {:?}", other),
    }
    assert_eq!(
        next_event(&mut bob.events).await,
        ServerEvent::MessageDelivered {
            thread_id: thread.id.clone(),
            message_id: sent.id.clone(),
        }
    );
    match next_event(&mut bob.events).await {
        ServerEvent::UnreadCounts { total, threads } => {
            assert_eq!(total, 1);
            assert_eq!(threads.get(&thread.id), Some(&1));
        }
        other => panic!("Expected unread counts, got {:?}", other),
    }

    // The sender sees the delivered transition, never its own broadcast
    assert!(matches!(
        next_event(&mut alice.events).await,
        ServerEvent::MessageDelivered { .. }
    ));
    assert!(drain(&mut alice.events)
        .iter()
        .all(|e| !matches!(e, ServerEvent::MessageBroadcast { .. })));

    let stored = hub.messages().get_message(&sent.id, "alice").expect("Failed to get");
    assert_eq!(stored.status, DeliveryStatus::Delivered);
    assert!(hub.notifications().pending("bob").expect("pending").is_empty());
}

#[tokio::test]
async fn test_replayed_send_is_not_republished() {
    let hub = hub();
    let thread = open_pair(hub.messages(), "alice", "bob");
    let mut bob = hub.connect("bob").await.expect("Failed to connect");

    let first = hub
        .send_message(&thread.id, "alice", SendRequest::text("once").with_client_ref("p-1"), None)
        .await
        .expect("Failed to send");
    drain(&mut bob.events);

    let replay = hub
        .send_message(&thread.id, "alice", SendRequest::text("once").with_client_ref("p-1"), None)
        .await
        .expect("Failed to replay");

    assert_eq!(first.id, replay.id);
    assert!(drain(&mut bob.events).is_empty());
    assert_eq!(hub.unread().counts("bob").total, 1);
}

#[tokio::test]
async fn test_offline_recipient_gets_notification_on_connect() {
    let hub = hub();
    let thread = open_pair(hub.messages(), "alice", "bob");

    let sent = hub
        .send_message(&thread.id, "alice", SendRequest::text("while you were away"), None)
        .await
        .expect("Failed to send");

    let pending = hub.notifications().pending("bob").expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_id, sent.id);

    // Not delivered while offline
    let stored = hub.messages().get_message(&sent.id, "bob").expect("Failed to get");
    assert_eq!(stored.status, DeliveryStatus::Sent);

    let mut bob = hub.connect("bob").await.expect("Failed to connect");
    assert!(matches!(next_event(&mut bob.events).await, ServerEvent::Ready { .. }));
    assert!(matches!(
        next_event(&mut bob.events).await,
        ServerEvent::UnreadCounts { total: 1, .. }
    ));
    match next_event(&mut bob.events).await {
        ServerEvent::Notification {
            thread_id, message_id, ..
        } => {
            assert_eq!(thread_id, thread.id);
            assert_eq!(message_id, sent.id);
        }
        other => panic!("Expected notification, got {:?}", other),
    }
    assert!(hub.notifications().pending("bob").expect("pending").is_empty());

    // Catch-up fetch returns the missed message
    let page = hub
        .messages()
        .list(&thread.id, "bob", PageRequest::after(None, 50))
        .expect("Failed to list");
    assert_eq!(page.messages[0].id, sent.id);
}

#[tokio::test]
async fn test_mark_read_broadcasts_once() {
    let hub = hub();
    let thread = open_pair(hub.messages(), "alice", "bob");
    let mut alice = hub.connect("alice").await.expect("Failed to connect");
    let mut bob = hub.connect("bob").await.expect("Failed to connect");
    let sent = hub
        .send_message(&thread.id, "alice", SendRequest::text("read me"), None)
        .await
        .expect("Failed to send");
    drain(&mut alice.events);
    drain(&mut bob.events);

    let outcome = hub.mark_read(&sent.id, "bob").await.expect("Failed to mark read");
    assert!(outcome.newly_read);

    let event = wait_for(&mut alice.events, |e| matches!(e, ServerEvent::MessageRead { .. })).await;
    match event {
        ServerEvent::MessageRead {
            message_id, reader_id, ..
        } => {
            assert_eq!(message_id, sent.id);
            assert_eq!(reader_id, "bob");
        }
        other => panic!("Expected read, got {:?}", other),
    }
    let counts = wait_for(&mut bob.events, |e| matches!(e, ServerEvent::UnreadCounts { .. })).await;
    assert!(matches!(counts, ServerEvent::UnreadCounts { total: 0, .. }));

    drain(&mut alice.events);
    let again = hub.mark_read(&sent.id, "bob").await.expect("Failed to mark read again");
    assert!(!again.newly_read);
    assert!(drain(&mut alice.events).is_empty());
}

#[tokio::test]
async fn test_mark_thread_read_zeroes_counter() {
    let hub = hub();
    let thread = open_pair(hub.messages(), "alice", "bob");
    for i in 0..3 {
        hub.send_message(&thread.id, "alice", SendRequest::text(format!("m{}", i)), None)
            .await
            .expect("Failed to send");
    }
    let mut bob = hub.connect("bob").await.expect("Failed to connect");
    drain(&mut bob.events);
    assert_eq!(hub.unread().counts("bob").thread(&thread.id), 3);

    let ids = hub.mark_thread_read(&thread.id, "bob").await.expect("Failed to mark");
    assert_eq!(ids.len(), 3);
    assert_eq!(hub.unread().counts("bob").total, 0);
    assert!(matches!(
        next_event(&mut bob.events).await,
        ServerEvent::UnreadCounts { total: 0, .. }
    ));
}

#[tokio::test]
async fn test_reads_before_first_session_are_seeded_on_connect() {
    let db = database();
    let before_restart = hub_with(&db);
    let thread = open_pair(before_restart.messages(), "buyer", "seller");
    let mut sent = Vec::new();
    for text in ["one", "two"] {
        sent.push(
            before_restart
                .send_message(&thread.id, "buyer", SendRequest::text(text), None)
                .await
                .expect("Failed to send"),
        );
    }

    // Fresh counters over the same store, then a read over HTTP
    let hub = hub_with(&db);
    let outcome = hub.mark_read(&sent[0].id, "seller").await.expect("Failed to mark read");
    assert!(outcome.newly_read);
    assert!(!hub.unread().is_tracked("seller"));

    let mut seller = hub.connect("seller").await.expect("Failed to connect");
    assert!(matches!(next_event(&mut seller.events).await, ServerEvent::Ready { .. }));
    assert!(matches!(
        next_event(&mut seller.events).await,
        ServerEvent::UnreadCounts { total: 1, .. }
    ));
    assert_unread_matches_store(&hub, "seller");
}

#[tokio::test]
async fn test_connect_between_persist_and_publish_counts_once() {
    let hub = hub();
    let thread = open_pair(hub.messages(), "buyer", "seller");

    let message = hub
        .messages()
        .send(&thread.id, "buyer", SendRequest::text("hello"))
        .expect("Failed to persist");
    let mut seller = hub.connect("seller").await.expect("Failed to connect");
    drain(&mut seller.events);

    let report = hub.publish_sent(&message, None).await.expect("Failed to publish");
    assert!(report.delivered);
    assert_eq!(hub.unread().counts("seller").total, 1);
    assert_unread_matches_store(&hub, "seller");
}

#[tokio::test]
async fn test_read_before_publish_is_not_counted() {
    let hub = hub();
    let thread = open_pair(hub.messages(), "buyer", "seller");
    let mut seller = hub.connect("seller").await.expect("Failed to connect");
    drain(&mut seller.events);

    let message = hub
        .messages()
        .send(&thread.id, "buyer", SendRequest::text("quick"))
        .expect("Failed to persist");
    hub.mark_read(&message.id, "seller").await.expect("Failed to mark read");
    hub.publish_sent(&message, None).await.expect("Failed to publish");

    assert_eq!(hub.unread().counts("seller").total, 0);
    assert_unread_matches_store(&hub, "seller");
}

#[tokio::test]
async fn test_soft_delete_drops_unread_message() {
    let hub = hub();
    let thread = open_pair(hub.messages(), "buyer", "seller");
    let mut seller = hub.connect("seller").await.expect("Failed to connect");
    let message = hub
        .send_message(&thread.id, "buyer", SendRequest::text("ignore this"), None)
        .await
        .expect("Failed to send");
    drain(&mut seller.events);
    assert_eq!(hub.unread().counts("seller").total, 1);

    hub.soft_delete(&message.id, "seller").await.expect("Failed to delete");
    assert_eq!(
        next_event(&mut seller.events).await,
        ServerEvent::UnreadCounts {
            total: 0,
            threads: Default::default(),
        }
    );
    assert_unread_matches_store(&hub, "seller");

    // The sender's copy is untouched
    let for_buyer = hub.messages().get_message(&message.id, "buyer").expect("get");
    assert!(!for_buyer.deleted);
}

#[tokio::test]
async fn test_counters_follow_store_through_mixed_flows() {
    let hub = hub();
    let thread = open_pair(hub.messages(), "buyer", "seller");
    let other = open_pair(hub.messages(), "agent", "seller");

    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(
            hub.send_message(&thread.id, "buyer", SendRequest::text(format!("b{}", i)), None)
                .await
                .expect("Failed to send")
                .id,
        );
    }
    hub.mark_read(&ids[0], "seller").await.expect("Failed to mark read");
    assert_unread_matches_store(&hub, "seller");

    let mut seller = hub.connect("seller").await.expect("Failed to connect");
    assert_unread_matches_store(&hub, "seller");

    hub.send_message(&other.id, "agent", SendRequest::text("from agent"), None)
        .await
        .expect("Failed to send");
    assert_unread_matches_store(&hub, "seller");

    hub.soft_delete(&ids[1], "seller").await.expect("Failed to delete");
    assert_unread_matches_store(&hub, "seller");

    // Already read, then deleted: nothing to subtract twice
    hub.soft_delete(&ids[0], "seller").await.expect("Failed to delete");
    assert_unread_matches_store(&hub, "seller");

    hub.mark_thread_read(&thread.id, "seller").await.expect("Failed to mark");
    assert_unread_matches_store(&hub, "seller");
    assert_eq!(hub.unread().counts("seller").total, 1);
    assert_eq!(hub.unread().counts("seller").thread(&other.id), 1);

    hub.disconnect(&seller.session_id).await.expect("Failed to disconnect");
    hub.send_message(&other.id, "agent", SendRequest::text("again"), None)
        .await
        .expect("Failed to send");
    assert_unread_matches_store(&hub, "seller");
    drain(&mut seller.events);
}

#[tokio::test]
async fn test_typing_is_relayed_and_expires() {
    let hub = hub().with_typing_ttl(Duration::from_millis(50));
    let thread = open_pair(hub.messages(), "alice", "bob");
    let mut alice = hub.connect("alice").await.expect("Failed to connect");
    let mut bob = hub.connect("bob").await.expect("Failed to connect");
    drain(&mut alice.events);
    drain(&mut bob.events);

    hub.handle(
        &alice.session_id,
        ClientEvent::TypingStart {
            thread_id: thread.id.clone(),
        },
    )
    .await
    .expect("Failed to handle");

    assert_eq!(
        next_event(&mut bob.events).await,
        ServerEvent::Typing {
            thread_id: thread.id.clone(),
            user_id: "alice".to_string(),
            active: true,
        }
    );
    // No stop signal: the indicator expires on its own
    assert_eq!(
        next_event(&mut bob.events).await,
        ServerEvent::Typing {
            thread_id: thread.id.clone(),
            user_id: "alice".to_string(),
            active: false,
        }
    );
    assert!(drain(&mut alice.events).is_empty());
    assert_eq!(hub.typing_count(), 0);
}

#[tokio::test]
async fn test_explicit_typing_stop_cancels_expiry() {
    let hub = hub().with_typing_ttl(Duration::from_millis(50));
    let thread = open_pair(hub.messages(), "alice", "bob");
    let alice = hub.connect("alice").await.expect("Failed to connect");
    let mut bob = hub.connect("bob").await.expect("Failed to connect");
    drain(&mut bob.events);

    for event in [
        ClientEvent::TypingStart {
            thread_id: thread.id.clone(),
        },
        ClientEvent::TypingStop {
            thread_id: thread.id.clone(),
        },
    ] {
        hub.handle(&alice.session_id, event).await.expect("Failed to handle");
    }

    tokio::time::sleep(Duration::from_millis(120)).await;
    let events = drain(&mut bob.events);
    assert_eq!(events.len(), 2);
    assert!(matches!(events[1], ServerEvent::Typing { active: false, .. }));
    assert_eq!(hub.typing_count(), 0);
}

#[tokio::test]
async fn test_presence_follows_first_and_last_session() {
    let hub = hub();
    open_pair(hub.messages(), "alice", "bob");
    let mut alice = hub.connect("alice").await.expect("Failed to connect");
    drain(&mut alice.events);

    let bob_phone = hub.connect("bob").await.expect("Failed to connect");
    let online = wait_for(&mut alice.events, |e| matches!(e, ServerEvent::PresenceUpdate { .. })).await;
    assert!(matches!(online, ServerEvent::PresenceUpdate { online: true, .. }));

    let bob_laptop = hub.connect("bob").await.expect("Failed to connect");
    hub.disconnect(&bob_phone.session_id).await.expect("Failed to disconnect");
    assert!(hub.presence().get("bob").expect("presence").online);
    assert!(drain(&mut alice.events)
        .iter()
        .all(|e| !matches!(e, ServerEvent::PresenceUpdate { .. })));

    hub.disconnect(&bob_laptop.session_id).await.expect("Failed to disconnect");
    let offline = next_event(&mut alice.events).await;
    match offline {
        ServerEvent::PresenceUpdate {
            user_id,
            online,
            last_seen,
        } => {
            assert_eq!(user_id, "bob");
            assert!(!online);
            assert!(last_seen > 0);
        }
        other => panic!("Expected presence update, got {:?}", other),
    }
    assert!(!hub.presence().get("bob").expect("presence").online);
}

#[tokio::test]
async fn test_failed_event_becomes_error_frame() {
    let hub = hub();
    let thread = open_pair(hub.messages(), "alice", "bob");
    let mut mallory = hub.connect("mallory").await.expect("Failed to connect");
    drain(&mut mallory.events);

    hub.handle(
        &mallory.session_id,
        ClientEvent::SendMessage {
            thread_id: thread.id.clone(),
            content: "let me in".to_string(),
            content_type: Default::default(),
            attachments: Vec::new(),
            pending_id: Some("p-x".to_string()),
        },
    )
    .await
    .expect("Handle reports errors as frames");

    match next_event(&mut mallory.events).await {
        ServerEvent::Error { code, pending_id, .. } => {
            assert_eq!(code, "forbidden");
            assert_eq!(pending_id.as_deref(), Some("p-x"));
        }
        other => panic!("Expected error, got {:?}", other),
    }
    assert!(hub
        .messages()
        .list(&thread.id, "alice", PageRequest::latest())
        .expect("list")
        .messages
        .is_empty());
}

#[tokio::test]
async fn test_open_thread_joins_live_sessions() {
    let hub = hub();
    let mut alice = hub.connect("alice").await.expect("Failed to connect");
    let mut bob = hub.connect("bob").await.expect("Failed to connect");
    drain(&mut alice.events);
    drain(&mut bob.events);

    hub.handle(
        &alice.session_id,
        ClientEvent::OpenThread {
            counterparty_id: "bob".to_string(),
            origin_ref: Some("lead-1".to_string()),
            initial_message: Some("Hello from the listing".to_string()),
        },
    )
    .await
    .expect("Failed to handle");

    let broadcast = wait_for(&mut bob.events, |e| matches!(e, ServerEvent::MessageBroadcast { .. })).await;
    let thread_id = broadcast.thread_id().expect("thread id").to_string();

    let joined = wait_for(&mut alice.events, |e| matches!(e, ServerEvent::RoomsJoined { .. })).await;
    assert_eq!(joined, ServerEvent::RoomsJoined { rooms: vec![thread_id.clone()] });

    let thread = hub.messages().threads().get_thread(&thread_id, "bob").expect("thread");
    assert_eq!(thread.origin_ref.as_deref(), Some("lead-1"));
}

#[tokio::test]
async fn test_join_thread_rooms_rejoins() {
    let db = database();
    let hub = hub_with(&db);
    let mut alice = hub.connect("alice").await.expect("Failed to connect");
    drain(&mut alice.events);

    // Thread created outside the hub; the session is not yet in its room
    let thread = hub
        .messages()
        .threads()
        .create_or_get_thread("alice", "bob", ThreadMetadata::default())
        .expect("Failed to create");
    assert_eq!(hub.registry().room_size(&thread.id).await, 0);

    hub.handle(&alice.session_id, ClientEvent::JoinThreadRooms)
        .await
        .expect("Failed to handle");
    assert_eq!(
        next_event(&mut alice.events).await,
        ServerEvent::RoomsJoined { rooms: vec![thread.id.clone()] }
    );
    assert_eq!(hub.registry().room_size(&thread.id).await, 1);
}

#[tokio::test]
async fn test_presence_store_reset() {
    let store = PresenceStore::new(database());
    assert_eq!(store.get("ghost").expect("presence").last_seen, 0);

    store.set("alice", true).expect("Failed to set");
    store.set("bob", true).expect("Failed to set");
    store.set("carol", false).expect("Failed to set");

    assert_eq!(store.reset_all().expect("Failed to reset"), 2);
    assert!(!store.get("alice").expect("presence").online);
}
