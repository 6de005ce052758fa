//! Bounded exponential reconnection

use crate::{retry::RetryPolicy, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Link state shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkState {
    /// Realtime link is up
    Connected,
    /// Trying again; `attempt` starts at 1
    Reconnecting {
        /// Current attempt
        attempt: u32,
    },
    /// Gave up or never connected
    Offline,
}

/// Runs connection attempts under a [`RetryPolicy`] and publishes [`LinkState`]
pub struct Reconnector {
    policy: RetryPolicy,
    state: watch::Sender<LinkState>,
}

impl Reconnector {
    /// Create a reconnector starting offline
    pub fn new(policy: RetryPolicy) -> Self {
        let (state, _) = watch::channel(LinkState::Offline);
        Self { policy, state }
    }

    /// Receiver for state changes (the reconnecting indicator)
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Mark the link down without retrying
    pub fn set_offline(&self) {
        self.state.send_replace(LinkState::Offline);
    }

    /// Try `connect` until it succeeds, a terminal error occurs or attempts run out
    ///
    /// `connect` receives the zero-based attempt number.
    pub async fn connect_with_backoff<T, F, Fut>(&self, mut connect: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            self.state.send_replace(LinkState::Reconnecting { attempt: attempt + 1 });
            match connect(attempt).await {
                Ok(value) => {
                    self.state.send_replace(LinkState::Connected);
                    debug!("Connected after {} attempt(s)", attempt + 1);
                    return Ok(value);
                }
                Err(e) if !e.is_terminal() && self.policy.allows(attempt + 1) => {
                    let delay = self.policy.delay_for(attempt);
                    warn!("Connection attempt {} failed: {}. Retrying in {:?}", attempt + 1, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.state.send_replace(LinkState::Offline);
                    return Err(e);
                }
            }
        }
    }
}
