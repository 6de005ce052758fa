//! Client view of the message service
//!
//! [`MessageApi`] is the seam the offline sync service drains through.
//! [`HttpMessageApi`] talks to the HTTP API; [`LocalMessageApi`] calls an
//! in-process hub (embedded deployments and tests).

use crate::{
    message_service::{Page, PageRequest, SendRequest},
    protocol::{ErrorBody, ThreadListResponse},
    realtime::RealtimeHub,
    storage::Message,
    Error, Result,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Operations the offline sync service needs from the server
#[async_trait]
pub trait MessageApi: Send + Sync {
    /// Persist a message; `request.client_ref` carries the pending id
    async fn send(&self, thread_id: &str, request: SendRequest) -> Result<Message>;

    /// Messages newer than `after` (or from the start), oldest first
    async fn fetch_after(&self, thread_id: &str, after: Option<&str>, limit: usize) -> Result<Page>;

    /// Every thread the user participates in, archived ones included
    async fn thread_ids(&self) -> Result<Vec<String>>;
}

/// In-process implementation acting as one user
#[derive(Clone)]
pub struct LocalMessageApi {
    hub: RealtimeHub,
    user_id: String,
    reachable: Arc<AtomicBool>,
}

impl LocalMessageApi {
    /// Act as `user_id` against `hub`
    pub fn new(hub: RealtimeHub, user_id: impl Into<String>) -> Self {
        Self {
            hub,
            user_id: user_id.into(),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate losing or regaining the network
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Transient("server unreachable".to_string()))
        }
    }
}

#[async_trait]
impl MessageApi for LocalMessageApi {
    async fn send(&self, thread_id: &str, request: SendRequest) -> Result<Message> {
        self.check_reachable()?;
        self.hub.send_message(thread_id, &self.user_id, request, None).await
    }

    async fn fetch_after(&self, thread_id: &str, after: Option<&str>, limit: usize) -> Result<Page> {
        self.check_reachable()?;
        self.hub
            .messages()
            .list(thread_id, &self.user_id, PageRequest::after(after.map(str::to_string), limit))
    }

    async fn thread_ids(&self) -> Result<Vec<String>> {
        self.check_reachable()?;
        let threads = self.hub.messages().threads().list_threads(&self.user_id)?;
        Ok(threads.into_iter().map(|thread| thread.id).collect())
    }
}

/// HTTP implementation using a bearer token
#[derive(Clone)]
pub struct HttpMessageApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpMessageApi {
    /// Client for the API at `base_url` (e.g. `http://127.0.0.1:8080`)
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.base_url)
            .map_err(|e| Error::Validation(format!("invalid base URL '{}': {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::Validation(format!("base URL '{}' cannot have a path", self.base_url)))?
            .extend(segments);
        Ok(url)
    }

    fn thread_url(&self, thread_id: &str, tail: &str) -> Result<url::Url> {
        self.endpoint(&["threads", thread_id, tail])
    }

    async fn decode<T: for<'de> serde::Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| Error::Transport(format!("Invalid response body: {}", e)));
        }

        match response.json::<ErrorBody>().await {
            Ok(body) => Err(Error::from(body)),
            Err(_) if status.is_server_error() => Err(Error::Transient(format!("server returned {}", status))),
            Err(_) => Err(Error::Transport(format!("server returned {}", status))),
        }
    }
}

/// Connection-level failures are worth retrying; anything else is not
fn classify(err: reqwest::Error) -> Error {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        Error::Transient(format!("network error: {}", err))
    } else {
        Error::Transport(err.to_string())
    }
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn send(&self, thread_id: &str, request: SendRequest) -> Result<Message> {
        let url = self.thread_url(thread_id, "messages")?;
        debug!("POST {}", url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(classify)?;
        Self::decode(response).await
    }

    async fn fetch_after(&self, thread_id: &str, after: Option<&str>, limit: usize) -> Result<Page> {
        let mut url = self.thread_url(thread_id, "messages")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            // An empty cursor asks for the thread from its first message
            query.append_pair("after", after.unwrap_or_default());
        }
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(classify)?;
        Self::decode(response).await
    }

    async fn thread_ids(&self) -> Result<Vec<String>> {
        let url = self.endpoint(&["threads"])?;
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(classify)?;
        let list: ThreadListResponse = Self::decode(response).await?;
        Ok(list.threads.into_iter().map(|summary| summary.thread.id).collect())
    }
}
