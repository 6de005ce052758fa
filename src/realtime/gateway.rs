//! WebSocket gateway
//!
//! Accepts duplex connections, authenticates the first `hello` frame and then
//! pumps frames between the socket and the [`RealtimeHub`].

use super::hub::RealtimeHub;
use crate::{
    protocol::{from_frame, to_frame, ClientEvent, ServerEvent},
    Error, Result,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

/// How long a fresh connection may take to send `hello`
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves bearer tokens to user ids
///
/// Token issuance lives outside this crate; implementations only verify.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// User id owning `token`, or `Forbidden`
    async fn authenticate(&self, token: &str) -> Result<String>;
}

/// Static token table loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    tokens: HashMap<String, String>,
}

impl TokenTable {
    /// Build from a token -> user id map
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    /// Add one token
    pub fn insert(&mut self, token: impl Into<String>, user_id: impl Into<String>) {
        self.tokens.insert(token.into(), user_id.into());
    }
}

#[async_trait]
impl Authenticator for TokenTable {
    async fn authenticate(&self, token: &str) -> Result<String> {
        self.tokens.get(token).cloned().ok_or_else(|| {
            warn!(target: "audit", "Rejected unknown bearer token");
            Error::Forbidden("invalid token".to_string())
        })
    }
}

/// WebSocket listener
pub struct Gateway {
    hub: RealtimeHub,
    auth: Arc<dyn Authenticator>,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl Gateway {
    /// Create a gateway; call [`start`](Self::start) to listen
    pub fn new(hub: RealtimeHub, auth: Arc<dyn Authenticator>) -> Self {
        Self {
            hub,
            auth,
            local_addr: None,
            task: None,
        }
    }

    /// Bind and spawn the accept loop
    pub async fn start(&mut self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        let actual_addr = listener
            .local_addr()
            .map_err(|e| Error::Transport(format!("Failed to get local address: {}", e)))?;
        self.local_addr = Some(actual_addr);

        let hub = self.hub.clone();
        let auth = self.auth.clone();

        self.task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote_addr)) => {
                        debug!("Accepted realtime connection from {}", remote_addr);
                        let hub = hub.clone();
                        let auth = auth.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, hub, auth).await {
                                debug!("Realtime connection from {} ended: {}", remote_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }));

        info!("Realtime gateway listening on {}", actual_addr);
        Ok(())
    }

    /// Address the gateway is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting connections
    pub fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn transport(e: impl std::fmt::Display) -> Error {
    Error::Transport(e.to_string())
}

async fn handle_connection(stream: TcpStream, hub: RealtimeHub, auth: Arc<dyn Authenticator>) -> Result<()> {
    let ws = accept_async(stream).await.map_err(transport)?;
    let (mut write, mut read) = ws.split();

    let hello = tokio::time::timeout(HELLO_TIMEOUT, read.next())
        .await
        .map_err(|_| Error::Transport("no hello before timeout".to_string()))?;

    let token = match hello {
        Some(Ok(WsMessage::Text(text))) => match from_frame::<ClientEvent>(text.as_str()) {
            Ok(ClientEvent::Hello { token }) => Some(token),
            _ => None,
        },
        Some(Err(e)) => return Err(transport(e)),
        _ => None,
    };

    let authenticated = match token {
        Some(token) => auth.authenticate(&token).await,
        None => Err(Error::Validation("first frame must be hello".to_string())),
    };
    let user_id = match authenticated {
        Ok(user_id) => user_id,
        Err(e) => {
            let frame = to_frame(&ServerEvent::error(&e, None))?;
            let _ = write.send(WsMessage::Text(frame.into())).await;
            let _ = write.send(WsMessage::Close(None)).await;
            return Err(e);
        }
    };

    let connected = hub.connect(&user_id).await?;
    let session_id = connected.session_id;
    let mut events = connected.events;

    let outcome: Result<()> = async {
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    write.send(WsMessage::Text(to_frame(&event)?.into())).await.map_err(transport)?;
                }
                frame = read.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => match from_frame::<ClientEvent>(text.as_str()) {
                        Ok(event) => hub.handle(&session_id, event).await?,
                        Err(e) => {
                            hub.registry()
                                .send_to_session(&session_id, ServerEvent::error(&e, None))
                                .await;
                        }
                    },
                    Some(Ok(WsMessage::Ping(payload))) => {
                        write.send(WsMessage::Pong(payload)).await.map_err(transport)?;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(transport(e)),
                },
            }
        }
    }
    .await;

    hub.disconnect(&session_id).await?;
    outcome
}
