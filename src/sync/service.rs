//! Offline state sync service
//!
//! Queues outbound messages without touching the network, drains them in
//! FIFO order once online, and reconciles server-confirmed messages into the
//! per-thread cache. Each thread drains on its own timeline; different
//! threads drain concurrently.

use super::{
    api::MessageApi,
    state::{ConversationSyncState, MergeReport, QueueStatus, QueuedOutboundMessage, StatePatch, TimelineEntry},
    store::SyncStore,
};
use crate::{
    message_service::{SendRequest, DEFAULT_PAGE_SIZE},
    retry::RetryPolicy,
    storage::{ContentType, DeliveryStatus, Message},
    Error, Result,
};
use futures_util::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of a drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Entries confirmed, as (pending id, message id), in send order per thread
    pub sent: Vec<(String, String)>,
    /// Entries that became failed and need a user decision
    pub failed: Vec<String>,
    /// Entries left pending for the next drain
    pub deferred: usize,
}

impl SyncReport {
    fn absorb(&mut self, other: SyncReport) {
        self.sent.extend(other.sent);
        self.failed.extend(other.failed);
        self.deferred += other.deferred;
    }
}

/// Client-side offline sync service
#[derive(Clone)]
pub struct OfflineSyncService {
    store: SyncStore,
    api: Arc<dyn MessageApi>,
    online: Arc<AtomicBool>,
    drains: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    retry: RetryPolicy,
    page_size: usize,
}

impl OfflineSyncService {
    /// Create a service; it starts offline
    pub fn new(store: SyncStore, api: Arc<dyn MessageApi>) -> Self {
        Self {
            store,
            api,
            online: Arc::new(AtomicBool::new(false)),
            drains: Arc::new(Mutex::new(HashMap::new())),
            retry: RetryPolicy::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Transient failures allowed per entry before it is marked failed
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Page size for catch-up fetches
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// The durable store
    pub fn store(&self) -> &SyncStore {
        &self.store
    }

    /// Record connectivity changes
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!("Sync service is now {}", if online { "online" } else { "offline" });
        }
    }

    /// Current connectivity as last reported
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Queue a message for a thread and return its pending id
    ///
    /// Never touches the network.
    pub fn queue_message(&self, thread_id: &str, content: &str, content_type: ContentType) -> Result<String> {
        self.queue_request(
            thread_id,
            SendRequest {
                content: content.to_string(),
                content_type,
                attachments: Vec::new(),
                client_ref: None,
            },
        )
    }

    /// Queue a full send request; any `client_ref` is replaced by a new pending id
    pub fn queue_request(&self, thread_id: &str, request: SendRequest) -> Result<String> {
        if thread_id.trim().is_empty() {
            return Err(Error::Validation("thread id must not be empty".to_string()));
        }
        if request.content.trim().is_empty() && !request.content_type.requires_attachment() {
            return Err(Error::Validation("message content must not be empty".to_string()));
        }

        let pending_id = Uuid::new_v4().to_string();
        self.store.update(thread_id, |record| {
            record.enqueue(
                pending_id.clone(),
                request.content.clone(),
                request.content_type,
                request.attachments.clone(),
            );
            Ok(())
        })?;

        debug!("Queued {} in thread {}", pending_id, thread_id);
        Ok(pending_id)
    }

    /// Drain every thread's queue, threads concurrently
    pub async fn sync_now(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let thread_ids = self.store.thread_ids()?;

        if !self.is_online() {
            for thread_id in &thread_ids {
                report.deferred += self.store.load(thread_id)?.queue.iter().filter(|e| e.is_pending()).count();
            }
            debug!("Offline; {} queued entries deferred", report.deferred);
            return Ok(report);
        }

        let drains = thread_ids.iter().map(|thread_id| self.drain_thread(thread_id));
        for outcome in join_all(drains).await {
            report.absorb(outcome?);
        }

        if !report.sent.is_empty() || !report.failed.is_empty() {
            info!(
                "Sync drained {} messages, {} failed, {} deferred",
                report.sent.len(),
                report.failed.len(),
                report.deferred
            );
        }
        Ok(report)
    }

    /// Drain one thread's queue in FIFO order
    pub async fn drain_thread(&self, thread_id: &str) -> Result<SyncReport> {
        let lock = {
            let mut drains = self.drains.lock().await;
            drains.entry(thread_id.to_string()).or_default().clone()
        };
        let _guard = lock.lock().await;

        let mut report = SyncReport::default();
        loop {
            let record = self.store.load(thread_id)?;
            let Some(entry) = record.next_pending().cloned() else {
                break;
            };
            if !self.is_online() {
                report.deferred = record.queue.iter().filter(|e| e.is_pending()).count();
                break;
            }

            let request = SendRequest {
                content: entry.content.clone(),
                content_type: entry.content_type,
                attachments: entry.attachments.clone(),
                client_ref: Some(entry.pending_id.clone()),
            };

            match self.api.send(thread_id, request).await {
                Ok(message) => {
                    let message_id = message.id.clone();
                    self.store.update(thread_id, |record| {
                        let merged = record.merge(vec![message.clone()]);
                        // A server that drops the client reference still confirms this entry
                        if merged.confirmed.is_empty() && record.remove_entry(&entry.pending_id).is_some() {
                            record.confirmed.insert(entry.pending_id.clone(), message_id.clone());
                        }
                        Ok(())
                    })?;
                    report.sent.push((entry.pending_id, message_id));
                }
                Err(e) if e.is_retryable() => {
                    let attempts = entry.attempts + 1;
                    let exhausted = !self.retry.allows(attempts);
                    self.store.update(thread_id, |record| {
                        if let Some(queued) = record.entry_mut(&entry.pending_id) {
                            queued.attempts = attempts;
                            queued.last_error = Some(e.to_string());
                            if exhausted {
                                queued.status = QueueStatus::Failed {
                                    reason: e.to_string(),
                                    retryable: true,
                                };
                            }
                        }
                        Ok(())
                    })?;

                    if exhausted {
                        warn!("Giving up on {} after {} attempts: {}", entry.pending_id, attempts, e);
                        report.failed.push(entry.pending_id);
                    } else {
                        debug!("Transient failure for {} (attempt {}): {}", entry.pending_id, attempts, e);
                    }
                    // Later entries wait so the thread keeps its order
                    let record = self.store.load(thread_id)?;
                    report.deferred = record.queue.iter().filter(|e| e.is_pending()).count();
                    break;
                }
                Err(e) => {
                    warn!("Send of {} rejected: {}", entry.pending_id, e);
                    self.store.update(thread_id, |record| {
                        if let Some(queued) = record.entry_mut(&entry.pending_id) {
                            queued.attempts += 1;
                            queued.last_error = Some(e.to_string());
                            queued.status = QueueStatus::Failed {
                                reason: e.to_string(),
                                retryable: false,
                            };
                        }
                        Ok(())
                    })?;
                    report.failed.push(entry.pending_id);
                }
            }
        }
        Ok(report)
    }

    /// Incorporate server-confirmed messages into a thread's cache
    pub fn merge_remote_state(&self, thread_id: &str, messages: Vec<Message>) -> Result<MergeReport> {
        if let Some(foreign) = messages.iter().find(|m| m.thread_id != thread_id) {
            return Err(Error::Validation(format!(
                "message {} belongs to thread {}, not {}",
                foreign.id, foreign.thread_id, thread_id
            )));
        }
        self.store.update(thread_id, |record| Ok(record.merge(messages)))
    }

    /// Advance a cached message's delivery status from a realtime event
    pub fn advance_status(&self, thread_id: &str, message_id: &str, status: DeliveryStatus) -> Result<bool> {
        self.store
            .update(thread_id, |record| Ok(record.advance_status(message_id, status)))
    }

    /// Overwrite only the supplied state fields
    pub fn update_conversation_state(&self, thread_id: &str, patch: StatePatch) -> Result<ConversationSyncState> {
        self.store.update(thread_id, |record| {
            record.apply(patch);
            Ok(record.state.clone())
        })
    }

    /// Cached view state of a thread
    pub fn conversation_state(&self, thread_id: &str) -> Result<ConversationSyncState> {
        Ok(self.store.load(thread_id)?.state)
    }

    /// Queue entries of a thread, pending and failed
    pub fn queued(&self, thread_id: &str) -> Result<Vec<QueuedOutboundMessage>> {
        Ok(self.store.load(thread_id)?.queue)
    }

    /// Server-confirmed messages cached for a thread
    pub fn cached_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        Ok(self.store.load(thread_id)?.messages)
    }

    /// Confirmed messages plus local entries, for display
    pub fn timeline(&self, thread_id: &str) -> Result<Vec<TimelineEntry>> {
        Ok(self.store.load(thread_id)?.timeline())
    }

    /// Canonical message id a pending id resolved to
    pub fn canonical_id(&self, thread_id: &str, pending_id: &str) -> Result<Option<String>> {
        Ok(self.store.load(thread_id)?.confirmed.get(pending_id).cloned())
    }

    /// Drop one thread's cached state
    pub fn clear_thread(&self, thread_id: &str) -> Result<bool> {
        self.store.clear(thread_id)
    }

    /// Put a failed entry back in line for the next drain
    pub fn retry_failed(&self, thread_id: &str, pending_id: &str) -> Result<()> {
        self.store.update(thread_id, |record| {
            let entry = record
                .entry_mut(pending_id)
                .ok_or_else(|| Error::NotFound(format!("queued message {}", pending_id)))?;
            entry.status = QueueStatus::Pending;
            entry.attempts = 0;
            Ok(())
        })
    }

    /// Remove a queue entry at the user's request
    pub fn discard(&self, thread_id: &str, pending_id: &str) -> Result<QueuedOutboundMessage> {
        self.store.update(thread_id, |record| {
            record
                .remove_entry(pending_id)
                .ok_or_else(|| Error::NotFound(format!("queued message {}", pending_id)))
        })
    }

    /// Fetch everything newer than the cached messages of a thread
    pub async fn catch_up(&self, thread_id: &str) -> Result<usize> {
        let mut fetched = 0;
        loop {
            let after = self.store.load(thread_id)?.catch_up_cursor().map(str::to_string);
            let page = self
                .api
                .fetch_after(thread_id, after.as_deref(), self.page_size)
                .await?;
            let count = page.messages.len();
            fetched += count;
            self.merge_remote_state(thread_id, page.messages)?;
            if !page.has_more || count == 0 {
                break;
            }
        }
        if fetched > 0 {
            debug!("Caught up {} messages in thread {}", fetched, thread_id);
        }
        Ok(fetched)
    }

    /// Catch up every cached thread and every thread the server lists for the user
    ///
    /// Threads opened by the counterparty while this client was away have no
    /// local record yet; the server listing picks them up.
    pub async fn catch_up_all(&self) -> Result<usize> {
        let mut thread_ids: BTreeSet<String> = self.store.thread_ids()?.into_iter().collect();
        thread_ids.extend(self.api.thread_ids().await?);

        let mut total = 0;
        for thread_id in &thread_ids {
            total += self.catch_up(thread_id).await?;
        }
        Ok(total)
    }

    /// Connectivity returned: go online, catch up, then drain
    pub async fn on_reconnected(&self) -> Result<SyncReport> {
        self.set_online(true);
        self.catch_up_all().await?;
        self.sync_now().await
    }
}
