//! Threadsync server
//!
//! Serves the HTTP API and the WebSocket gateway from one process.
//!
//! Configuration is read from the JSON file named by `THREADSYNC_CONFIG`
//! (default `threadsync.json`), then `THREADSYNC_*` overrides are applied.

use anyhow::Context;
use std::sync::Arc;
use threadsync::{
    api::ApiServer,
    config::Config,
    crypto::EncryptionService,
    message_service::MessageService,
    realtime::{ConnectionRegistry, Gateway, PresenceStore, RealtimeHub},
    storage::Database,
    thread_manager::ThreadManager,
    unread::{NotificationQueue, UnreadTracker},
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    threadsync::init();

    let config_path = std::env::var("THREADSYNC_CONFIG").unwrap_or_else(|_| "threadsync.json".to_string());
    let mut config = Config::load(&config_path).with_context(|| format!("loading {}", config_path))?;
    config.apply_env().context("applying environment overrides")?;

    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path))?
        .with_retry(config.persistence_retry);

    let master = config.master_key().context("master key")?;
    let threads = ThreadManager::new(db.clone());
    let crypto = EncryptionService::new(db.clone(), master);
    let messages = MessageService::new(db.clone(), threads, crypto).with_limits(config.message_limits());

    // Sessions from a previous run are gone
    let presence = PresenceStore::new(db.clone());
    let reset = presence.reset_all()?;
    if reset > 0 {
        info!("Marked {} users offline after restart", reset);
    }

    let hub = RealtimeHub::new(
        messages,
        ConnectionRegistry::new(),
        presence,
        UnreadTracker::new(),
        NotificationQueue::new(db),
    )
    .with_typing_ttl(config.typing_ttl());

    let auth = Arc::new(config.token_table());

    let mut api = ApiServer::new(hub.clone(), auth.clone());
    api.start(config.api_socket_addr()?).await?;

    let mut gateway = Gateway::new(hub, auth);
    gateway.start(config.realtime_socket_addr()?).await?;

    info!(
        "Threadsync ready (api {:?}, realtime {:?})",
        api.local_addr(),
        gateway.local_addr()
    );

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutting down");
    gateway.shutdown();
    api.shutdown();
    Ok(())
}
