//! HTTP API
//!
//! JSON over HTTP/1 for the presentation layer:
//! - `POST /threads`, `GET /threads`
//! - `GET|POST /threads/{id}/messages`, `GET /threads/{id}/search?q=`
//! - `POST /threads/{id}/read`, `POST /messages/{id}/read`
//! - `DELETE /messages/{id}`, `GET /health`
//!
//! The caller is identified by `Authorization: Bearer <token>`. Sends made
//! here are published through the [`RealtimeHub`] like realtime sends.

use crate::{
    message_service::{PageCursor, PageRequest, SendRequest},
    protocol::{
        AckResponse, CreateThreadRequest, CreateThreadResponse, ErrorBody, HealthResponse, SearchResponse,
        ThreadListResponse, ThreadReadResponse, PROTOCOL_VERSION,
    },
    realtime::{Authenticator, RealtimeHub},
    storage::ThreadMetadata,
    Error, Result,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// HTTP API server
pub struct ApiServer {
    hub: RealtimeHub,
    auth: Arc<dyn Authenticator>,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl ApiServer {
    /// Create a server; call [`start`](Self::start) to listen
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
        info!("Starting HTTP API on {}", addr);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind to {}: {}", addr, e)))?;

        // Port 0 binds resolve to the actual port here
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
                        debug!("Accepted connection from {}", remote_addr);

                        let io = TokioIo::new(stream);
                        let hub = hub.clone();
                        let auth = auth.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, hub.clone(), auth.clone()));

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!("Error serving connection: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }));

        info!("HTTP API listening on {}", actual_addr);
        Ok(())
    }

    /// Address the server is bound to
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

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_request(
    req: Request<Incoming>,
    hub: RealtimeHub,
    auth: Arc<dyn Authenticator>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query());
    debug!("Received {} {}", method, path);

    if method == Method::GET && path == "/health" {
        return Ok(json_response(
            StatusCode::OK,
            &HealthResponse {
                status: "ok".to_string(),
                version: PROTOCOL_VERSION,
            },
        ));
    }

    let token = bearer_token(&req);
    let user_id = match authenticate(token, auth.as_ref()).await {
        Ok(user_id) => user_id,
        Err(e) => return Ok(error_response(&e)),
    };

    let body = req.collect().await?.to_bytes();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let response = match route(&hub, &user_id, &method, &segments, &query, &body).await {
        Ok(response) => response,
        Err(e) => {
            if e.is_terminal() {
                debug!("{} {} rejected: {}", method, path, e);
            } else {
                error!("{} {} failed: {}", method, path, e);
            }
            error_response(&e)
        }
    };
    Ok(response)
}

async fn route(
    hub: &RealtimeHub,
    user_id: &str,
    method: &Method,
    segments: &[&str],
    query: &HashMap<String, String>,
    body: &Bytes,
) -> Result<Response<Full<Bytes>>> {
    let messages = hub.messages();

    match (method, segments) {
        (&Method::POST, ["threads"]) => {
            let request: CreateThreadRequest = parse_json(body)?;
            let (thread, message) = hub
                .open_thread(
                    user_id,
                    &request.counterparty_id,
                    ThreadMetadata {
                        origin_ref: request.origin_ref,
                    },
                    request.initial_message,
                    None,
                )
                .await?;
            Ok(json_response(
                StatusCode::CREATED,
                &CreateThreadResponse { thread, message },
            ))
        }
        (&Method::GET, ["threads"]) => {
            let threads = messages.thread_summaries(user_id)?;
            Ok(json_response(StatusCode::OK, &ThreadListResponse { threads }))
        }
        (&Method::GET, ["threads", thread_id, "messages"]) => {
            let page = messages.list(thread_id, user_id, page_request(query)?)?;
            Ok(json_response(StatusCode::OK, &page))
        }
        (&Method::POST, ["threads", thread_id, "messages"]) => {
            let request: SendRequest = parse_json(body)?;
            let message = hub.send_message(thread_id, user_id, request, None).await?;
            Ok(json_response(StatusCode::CREATED, &message))
        }
        (&Method::GET, ["threads", thread_id, "search"]) => {
            let q = query.get("q").map(String::as_str).unwrap_or_default();
            let found = messages.search(thread_id, user_id, q)?;
            Ok(json_response(StatusCode::OK, &SearchResponse { messages: found }))
        }
        (&Method::POST, ["threads", thread_id, "read"]) => {
            let message_ids = hub.mark_thread_read(thread_id, user_id).await?;
            Ok(json_response(StatusCode::OK, &ThreadReadResponse { message_ids }))
        }
        (&Method::POST, ["messages", message_id, "read"]) => {
            let outcome = hub.mark_read(message_id, user_id).await?;
            Ok(json_response(StatusCode::OK, &outcome))
        }
        (&Method::DELETE, ["messages", message_id]) => {
            hub.soft_delete(message_id, user_id).await?;
            Ok(json_response(StatusCode::OK, &AckResponse { ok: true }))
        }
        _ => Err(Error::NotFound(format!("route {} /{}", method, segments.join("/")))),
    }
}

fn bearer_token(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

async fn authenticate(token: Option<String>, auth: &dyn Authenticator) -> Result<String> {
    let token = token.ok_or_else(|| Error::Forbidden("missing bearer token".to_string()))?;
    auth.authenticate(&token).await
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// Build a page request from `limit`, `before`, `after` and `offset`
fn page_request(query: &HashMap<String, String>) -> Result<PageRequest> {
    let limit = match query.get("limit") {
        Some(raw) => Some(
            raw.parse::<usize>()
                .map_err(|_| Error::Validation(format!("invalid limit '{}'", raw)))?,
        ),
        None => None,
    };

    let cursor = match (query.get("before"), query.get("after"), query.get("offset")) {
        (Some(before), None, None) => PageCursor::Before(before.clone()),
        (None, Some(after), None) => PageCursor::After(Some(after.clone()).filter(|a| !a.is_empty())),
        (None, None, Some(offset)) => PageCursor::Offset(
            offset
                .parse()
                .map_err(|_| Error::Validation(format!("invalid offset '{}'", offset)))?,
        ),
        (None, None, None) => PageCursor::Latest,
        _ => {
            return Err(Error::Validation(
                "use only one of before, after and offset".to_string(),
            ))
        }
    };

    Ok(PageRequest { limit, cursor })
}

fn parse_json<T: for<'de> serde::Deserialize<'de>>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::Validation(format!("invalid JSON body: {}", e)))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(json) => with_json(status, json),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            error_response(&Error::JsonSerialization(e))
        }
    }
}

fn error_response(err: &Error) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    // ErrorBody has only string fields
    let json = serde_json::to_vec(&ErrorBody::from(err)).unwrap_or_default();
    with_json(status, json)
}

fn with_json(status: StatusCode, json: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
