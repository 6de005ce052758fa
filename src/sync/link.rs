//! Client realtime link
//!
//! Keeps a WebSocket session to the gateway alive, feeding confirmed
//! messages and delivery updates into the [`OfflineSyncService`]. After every
//! successful (re)connect it runs a catch-up fetch and drains the queue;
//! offline notifications flushed by the server trigger a catch-up of their
//! thread.

use super::{
    reconnect::{LinkState, Reconnector},
    service::OfflineSyncService,
    state::StatePatch,
};
use crate::{
    protocol::{from_frame, to_frame, ClientEvent, ServerEvent},
    retry::RetryPolicy,
    storage::DeliveryStatus,
    Error, Result,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the event fan-out to UI subscribers
const EVENT_BUFFER: usize = 256;

/// WebSocket client bound to one user token
pub struct RealtimeLink {
    url: String,
    token: String,
    sync: OfflineSyncService,
    reconnector: Reconnector,
    events: broadcast::Sender<ServerEvent>,
}

impl RealtimeLink {
    /// Link to the gateway at `url` (e.g. `ws://127.0.0.1:8081`)
    pub fn new(url: impl Into<String>, token: impl Into<String>, sync: OfflineSyncService, policy: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            url: url.into(),
            token: token.into(),
            sync,
            reconnector: Reconnector::new(policy),
            events,
        }
    }

    /// Link state changes (connected / reconnecting / offline)
    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.reconnector.subscribe()
    }

    /// Every server event received, for the presentation layer
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Stay connected until reconnection gives up or the server rejects the token
    pub async fn run(&self) -> Result<()> {
        loop {
            let ws = self
                .reconnector
                .connect_with_backoff(|_| self.connect_once())
                .await
                .inspect_err(|_| self.sync.set_online(false))?;

            match self.sync.on_reconnected().await {
                Ok(report) => debug!("Post-reconnect drain sent {} messages", report.sent.len()),
                Err(e) => warn!("Post-reconnect sync failed: {}", e),
            }

            let ended = self.pump(ws).await;
            self.sync.set_online(false);
            match ended {
                Ok(()) => info!("Realtime link closed by server; reconnecting"),
                Err(e) if e.is_terminal() => {
                    self.reconnector.set_offline();
                    return Err(e);
                }
                Err(e) => warn!("Realtime link dropped: {}; reconnecting", e),
            }
        }
    }

    async fn connect_once(&self) -> Result<WsStream> {
        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Transient(format!("connect to {} failed: {}", self.url, e)))?;

        let hello = to_frame(&ClientEvent::Hello {
            token: self.token.clone(),
        })?;
        ws.send(WsMessage::Text(hello.into()))
            .await
            .map_err(|e| Error::Transient(e.to_string()))?;

        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => match from_frame::<ServerEvent>(text.as_str())? {
                    event @ ServerEvent::Ready { .. } => {
                        let _ = self.events.send(event);
                        return Ok(ws);
                    }
                    ServerEvent::Error { code, message, .. } => return Err(Error::from_code(&code, message)),
                    _ => continue,
                },
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(Error::Transient(e.to_string())),
                None => return Err(Error::Transient("connection closed before ready".to_string())),
            }
        }
    }

    async fn pump(&self, mut ws: WsStream) -> Result<()> {
        while let Some(frame) = ws.next().await {
            match frame.map_err(|e| Error::Transient(e.to_string()))? {
                WsMessage::Text(text) => {
                    let event = match from_frame::<ServerEvent>(text.as_str()) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("Ignoring malformed server frame: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = self.apply(&event).await {
                        warn!("Failed to apply server event: {}", e);
                    }
                    let _ = self.events.send(event);
                }
                WsMessage::Ping(payload) => {
                    ws.send(WsMessage::Pong(payload))
                        .await
                        .map_err(|e| Error::Transient(e.to_string()))?;
                }
                WsMessage::Close(_) => return Ok(()),
                _ => {}
            }
        }
        Ok(())
    }

    async fn apply(&self, event: &ServerEvent) -> Result<()> {
        match event {
            ServerEvent::MessageBroadcast { message } | ServerEvent::MessageAck { message, .. } => {
                self.sync
                    .merge_remote_state(&message.thread_id, vec![message.clone()])?;
            }
            ServerEvent::MessageDelivered { thread_id, message_id } => {
                self.sync
                    .advance_status(thread_id, message_id, DeliveryStatus::Delivered)?;
            }
            ServerEvent::MessageRead {
                thread_id, message_id, ..
            } => {
                self.sync.advance_status(thread_id, message_id, DeliveryStatus::Read)?;
            }
            ServerEvent::Notification { thread_id, .. } => {
                self.sync.catch_up(thread_id).await?;
            }
            ServerEvent::UnreadCounts { threads, .. } => {
                let mut thread_ids: BTreeSet<String> = self.sync.store().thread_ids()?.into_iter().collect();
                thread_ids.extend(threads.keys().cloned());
                for thread_id in thread_ids {
                    self.sync.update_conversation_state(
                        &thread_id,
                        StatePatch {
                            unread_count: Some(threads.get(&thread_id).copied().unwrap_or(0)),
                            ..Default::default()
                        },
                    )?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}
