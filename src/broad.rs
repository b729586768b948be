//! The broadcast hub: a registry of connected clients plus the HTTP routes
//! that create them and fan messages out to them.
//!
//! Routes live under a namespace prefix (default `/afr/`):
//!
//! | Path           | Method | Behavior                                           |
//! |----------------|--------|----------------------------------------------------|
//! | `client.mjs`   | GET    | browser client script                              |
//! | `events`       | GET    | event-stream subscription, stays open              |
//! | `event`        | GET    | one-shot subscription, closes after one message    |
//! | `send`         | POST   | broadcast the JSON body to every subscriber        |
//!
//! HEAD and OPTIONS are answered on every path before any matching.

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{lock, BroadClient, ClientId, ClientKind};
use crate::error::AfrError;
use crate::msg::Msg;

pub const DEFAULT_NAMESPACE: &str = "/afr/";

/// Browser client served on the `client.mjs` route.
pub const CLIENT_SCRIPT: &str = include_str!("../static/client.mjs");

const MAX_SEND_BODY: usize = 1 << 20;

/// `access-control-*` headers attached to every hub response.
pub fn cors_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("OPTIONS, HEAD, GET, POST"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers
}

/// Construction-time settings of a hub.
#[derive(Debug, Clone)]
pub struct BroadOptions {
    pub namespace: String,
    pub cors: HeaderMap,
}

impl Default for BroadOptions {
    fn default() -> Self {
        BroadOptions {
            namespace: DEFAULT_NAMESPACE.to_string(),
            cors: cors_headers(),
        }
    }
}

/// Result of [`Broad::route`]. Unhandled requests are handed back so the
/// caller can serve files or answer 404.
pub enum Routed {
    Handled(Response),
    Unhandled(Request),
}

#[derive(Debug, Clone, Copy)]
enum Route {
    Client,
    Events,
    Event,
    Send,
}

impl Route {
    fn method(self) -> Method {
        match self {
            Route::Send => Method::POST,
            _ => Method::GET,
        }
    }
}

/// Registry of connected clients. Cheap to clone; clones share members.
#[derive(Clone)]
pub struct Broad {
    inner: Arc<BroadInner>,
}

pub(crate) struct BroadInner {
    namespace: String,
    url_client: String,
    url_events: String,
    url_event: String,
    url_send: String,
    cors: HeaderMap,
    members: Mutex<HashMap<ClientId, Arc<BroadClient>>>,
    next_id: AtomicU64,
    signal: CancellationToken,
}

impl BroadInner {
    /// Drops a member without deinitializing it; used by the member itself.
    pub(crate) fn forget(&self, id: ClientId) {
        lock(&self.members).remove(&id);
    }
}

impl Default for Broad {
    fn default() -> Self {
        Broad::new(BroadOptions::default())
    }
}

impl std::fmt::Debug for Broad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broad")
            .field("namespace", &self.inner.namespace)
            .field("members", &self.len())
            .finish()
    }
}

impl Broad {
    pub fn new(opts: BroadOptions) -> Self {
        let namespace = normalize_namespace(&opts.namespace);
        Broad {
            inner: Arc::new(BroadInner {
                url_client: format!("{namespace}client.mjs"),
                url_events: format!("{namespace}events"),
                url_event: format!("{namespace}event"),
                url_send: format!("{namespace}send"),
                namespace,
                cors: opts.cors,
                members: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                signal: CancellationToken::new(),
            }),
        }
    }

    /// Namespace with leading and trailing slash, e.g. `/afr/`.
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.members).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ClientId) -> bool {
        lock(&self.inner.members).contains_key(&id)
    }

    /// Parent of every client signal created by the routes.
    pub fn signal(&self) -> &CancellationToken {
        &self.inner.signal
    }

    pub(crate) fn next_id(&self) -> ClientId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn downgrade(&self) -> Weak<BroadInner> {
        Arc::downgrade(&self.inner)
    }

    /// Registers a client created for this hub. Adding a member twice is a no-op.
    pub fn add(&self, client: Arc<BroadClient>) -> Result<(), AfrError> {
        if !client.owned_by(&self.downgrade()) {
            return Err(AfrError::ForeignClient);
        }
        if client.is_closed() {
            return Err(AfrError::ClientClosed);
        }
        lock(&self.inner.members).entry(client.id()).or_insert(client);
        Ok(())
    }

    /// Removes and deinitializes a member. Returns whether it was a member.
    pub fn remove(&self, id: ClientId) -> bool {
        let removed = lock(&self.inner.members).remove(&id);
        match removed {
            Some(client) => {
                client.deinit();
                true
            }
            None => false,
        }
    }

    /// Removes and deinitializes every member.
    pub fn clear(&self) {
        for client in self.drain() {
            client.deinit();
        }
    }

    /// Broadcasts a message. Returns how many members it reached.
    pub fn send(&self, msg: &Msg) -> Result<usize, AfrError> {
        let json = msg.to_json()?;
        Ok(self.send_json(json))
    }

    /// Delivers serialized JSON to every member. Delivery never waits on a
    /// member: one that is gone or has stopped reading is removed, and the
    /// others still get the message.
    pub fn send_json(&self, json: Bytes) -> usize {
        let members = self.snapshot();
        let mut delivered = 0;
        for client in &members {
            match client.write_message(&json) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    log_delivery_error(client.id(), &err);
                    self.remove(client.id());
                }
            }
        }
        debug!("Delivered message to {}/{} clients", delivered, members.len());
        delivered
    }

    /// Shutdown: sends `{type: "deinit", ...extra}` to every member, then
    /// closes every member no matter how delivery went.
    pub fn deinit(&self, extra: Map<String, Value>) -> Result<(), AfrError> {
        let json = Msg::deinit(extra).to_json()?;
        let members = self.drain();
        info!("Deinitializing {} clients", members.len());

        for client in &members {
            if let Err(err) = client.write_message(&json) {
                log_delivery_error(client.id(), &err);
            }
            client.deinit();
        }
        Ok(())
    }

    /// Deinitializes every member and refuses new subscriptions.
    pub fn shutdown(&self, extra: Map<String, Value>) -> Result<(), AfrError> {
        // Members are children of the hub signal; cancelling first would race
        // their deinit delivery.
        let delivered = self.deinit(extra);
        self.inner.signal.cancel();
        self.clear();
        delivered
    }

    fn snapshot(&self) -> Vec<Arc<BroadClient>> {
        lock(&self.inner.members).values().cloned().collect()
    }

    fn drain(&self) -> Vec<Arc<BroadClient>> {
        lock(&self.inner.members).drain().map(|(_, client)| client).collect()
    }

    /// Answers hub requests. Anything outside the hub routes comes back
    /// as [`Routed::Unhandled`].
    pub async fn route(&self, req: Request) -> Routed {
        let method = req.method().clone();
        if method == Method::HEAD || method == Method::OPTIONS {
            return Routed::Handled(self.preflight());
        }

        let path = req.uri().path();
        let route = if path == self.inner.url_client {
            Route::Client
        } else if path == self.inner.url_events {
            Route::Events
        } else if path == self.inner.url_event {
            Route::Event
        } else if path == self.inner.url_send {
            Route::Send
        } else {
            return Routed::Unhandled(req);
        };

        if method != route.method() {
            let path = path.to_string();
            return Routed::Handled(self.method_not_allowed(&method, &path));
        }

        Routed::Handled(match route {
            Route::Client => self.res_client(),
            Route::Events => self.res_subscribe(ClientKind::Stream),
            Route::Event => self.res_subscribe(ClientKind::OneShot),
            Route::Send => self.res_send(req).await,
        })
    }

    /// Plain `404 not found` with CORS headers.
    pub fn not_found(&self) -> Response {
        (StatusCode::NOT_FOUND, self.inner.cors.clone(), "not found").into_response()
    }

    fn preflight(&self) -> Response {
        (StatusCode::OK, self.inner.cors.clone()).into_response()
    }

    fn method_not_allowed(&self, method: &Method, path: &str) -> Response {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            self.inner.cors.clone(),
            format!("method {method} not allowed for path {path}"),
        )
            .into_response()
    }

    fn headers_with(&self, content_type: &'static str) -> HeaderMap {
        let mut headers = self.inner.cors.clone();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers
    }

    fn error_response(&self, err: AfrError) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            self.inner.cors.clone(),
            err.to_string(),
        )
            .into_response()
    }

    fn res_client(&self) -> Response {
        (
            StatusCode::OK,
            self.headers_with("application/javascript"),
            CLIENT_SCRIPT,
        )
            .into_response()
    }

    fn res_subscribe(&self, kind: ClientKind) -> Response {
        match BroadClient::new(self, kind, self.inner.signal.child_token()) {
            Ok((client, stream)) => {
                debug!(client = client.id(), ?kind, "Client subscribed");
                match kind {
                    ClientKind::Stream => {
                        let events = stream.map(|chunk| {
                            chunk.map(|json| Event::default().data(String::from_utf8_lossy(&json)))
                        });
                        let sse = Sse::new(events).keep_alive(KeepAlive::default());
                        (StatusCode::OK, self.inner.cors.clone(), sse).into_response()
                    }
                    ClientKind::OneShot => (
                        StatusCode::OK,
                        self.headers_with("application/json"),
                        Body::from_stream(stream),
                    )
                        .into_response(),
                }
            }
            Err(err) => {
                debug!("Subscription refused: {}", err);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    self.inner.cors.clone(),
                    err.to_string(),
                )
                    .into_response()
            }
        }
    }

    async fn res_send(&self, req: Request) -> Response {
        let body = match axum::body::to_bytes(req.into_body(), MAX_SEND_BODY).await {
            Ok(body) => body,
            Err(err) => {
                return self.error_response(AfrError::Io(std::io::Error::other(err.to_string())))
            }
        };

        // Any JSON object is relayed as is; receivers ignore types they
        // don't know.
        let json = match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                warn!("Rejected non-object message: {}", other);
                return self.error_response(AfrError::NotAnObject);
            }
            Err(err) => {
                warn!("Rejected malformed message: {}", err);
                return self.error_response(err.into());
            }
        };

        match serde_json::to_vec(&json) {
            Ok(json) => {
                self.send_json(Bytes::from(json));
                (StatusCode::OK, self.headers_with("application/json"), "true").into_response()
            }
            Err(err) => self.error_response(err.into()),
        }
    }
}

fn log_delivery_error(id: ClientId, err: &AfrError) {
    if err.is_cancel() {
        debug!(client = id, "Dropping client: {}", err);
    } else {
        warn!(client = id, "Failed to deliver message, dropping client: {}", err);
    }
}

/// `afr` → `/afr/`, `/` stays `/`.
pub(crate) fn normalize_namespace(namespace: &str) -> String {
    let trimmed = namespace.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}
