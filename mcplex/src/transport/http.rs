//! The Streamable HTTP transport.
//!
//! Client-to-server messages travel as short POSTs to a single path; server-to-client
//! messages travel back either inline (responses to a POST, as a JSON body or a
//! per-POST SSE stream, chosen by the client's `Accept` header) or over a long-lived
//! SSE stream opened with GET.  The two directions are tied together by the
//! `Mcp-Session-Id` header: the server mints an id on first contact and the client
//! echoes it on every subsequent request.  DELETE tears the session down.
//!
//! Failure mapping, per request: malformed JSON is a 400 carrying a JSON-RPC parse
//! error addressed to `id:null`; an unknown session is 404; a disallowed `Origin` is
//! 403; anything else is 500.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::post;
use futures::StreamExt;
use itertools::{Either, Itertools};
use mcplex_jsonrpc::{ErrorDetails, Id, JsonRpcError, Message, ResponsePayload};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{McpError, Result};
use crate::transport::{Transport, TransportEvent};
use crate::version;

pub const SESSION_ID_HEADER: &str = "mcp-session-id";
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

const INBOUND_CHANNEL_BOUND: usize = 64;
const SINK_CHANNEL_BOUND: usize = 32;

#[derive(Debug, Error)]
pub enum HttpTransportError {
    #[error("transport shut down")]
    Closed,

    #[error("HTTP request failed")]
    Request {
        #[from]
        source: reqwest::Error,
    },

    #[error("HTTP error status {status}")]
    Status { status: reqwest::StatusCode },

    #[error("codec error")]
    Codec {
        #[from]
        source: JsonRpcError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------- Server side ----------

#[derive(Debug, Clone)]
pub struct HttpServerOptions {
    /// The single path all MCP traffic uses.
    pub path: String,
    /// `Origin` values accepted on inbound requests.  Empty means no origin check.
    pub allowed_origins: Vec<String>,
}

impl Default for HttpServerOptions {
    fn default() -> Self {
        Self {
            path: "/mcp".to_string(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Per-session server state: the SSE sink, when a GET stream is open, and the
/// protocol version negotiated by this session's initialize exchange.
#[derive(Default)]
struct HttpSessionEntry {
    sink: Option<mpsc::Sender<String>>,
    negotiated_version: Option<String>,
}

struct HttpServerState {
    options: HttpServerOptions,
    inbound_tx: mpsc::Sender<Message>,
    /// Responses owed to currently-open POSTs, keyed by request id.  An entry is
    /// consumed (removed) when its response is routed.
    post_replies: Mutex<HashMap<Id, mpsc::Sender<Message>>>,
    sessions: Mutex<HashMap<String, HttpSessionEntry>>,
}

impl HttpServerState {
    fn origin_allowed(&self, headers: &HeaderMap) -> bool {
        let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
            return true;
        };
        self.options.allowed_origins.is_empty()
            || self.options.allowed_origins.iter().any(|allowed| allowed == origin)
    }

    fn session_exists(&self, id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(id)
    }

    fn negotiated_version(&self, session_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .and_then(|entry| entry.negotiated_version.clone())
    }

    /// Pin the session to the protocol version its initialize exchange settled on.
    ///
    /// Only the initialize result carries a `protocolVersion` field, so this watches
    /// the responses routed back through a POST rather than needing a hook into the
    /// peer runtime.
    fn record_negotiated_version(&self, session_id: &str, message: &Message) {
        let Message::Response(response) = message else { return };
        let ResponsePayload::Success(result) = &response.payload else { return };
        let Some(version) = result.get("protocolVersion").and_then(|v| v.as_str()) else {
            return;
        };
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.negotiated_version = Some(version.to_string());
        }
    }

    fn create_session(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.sessions
            .lock()
            .unwrap()
            .insert(id.clone(), HttpSessionEntry::default());
        id
    }

    /// Deliver a server-originated message to one session's open SSE sink, if any.
    /// A sink whose connection has gone away is dropped on the first failed write.
    fn send_to_session(&self, session_id: &str, payload: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(entry) = sessions.get_mut(session_id) {
            if let Some(sink) = &entry.sink {
                if sink.try_send(payload.to_string()).is_err() {
                    tracing::debug!(session_id, "dropping dead SSE sink");
                    entry.sink = None;
                }
            }
        }
    }

    /// Multicast a server-originated message to every open SSE sink.
    fn broadcast(&self, payload: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        for (session_id, entry) in sessions.iter_mut() {
            if let Some(sink) = &entry.sink {
                if sink.try_send(payload.to_string()).is_err() {
                    tracing::debug!(%session_id, "dropping dead SSE sink");
                    entry.sink = None;
                }
            }
        }
    }
}

/// Clonable handle to a running HTTP server transport, independent of the transport
/// value owned by the peer runtime.
#[derive(Clone)]
pub struct HttpServerHandle {
    state: Arc<HttpServerState>,
    shutdown: CancellationToken,
    local_addr: SocketAddr,
}

impl HttpServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Push a server-originated message to one specific session's event stream.
    pub fn send_to_session(&self, session_id: &str, message: &Message) -> Result<()> {
        let payload = mcplex_jsonrpc::serialize(message)?;
        self.state.send_to_session(session_id, &payload);
        Ok(())
    }

    /// Idempotent shutdown: stops accepting requests and unblocks the runtime's read.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Server end of the Streamable HTTP transport.  Bind it, hand it to a server's
/// `serve`, and keep an [`HttpServerHandle`] for out-of-band operations.
pub struct HttpServerTransport {
    state: Arc<HttpServerState>,
    inbound_rx: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
    local_addr: SocketAddr,
}

impl HttpServerTransport {
    pub async fn bind(addr: SocketAddr, options: HttpServerOptions) -> Result<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_BOUND);
        let state = Arc::new(HttpServerState {
            options: options.clone(),
            inbound_tx,
            post_replies: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        });

        let app = axum::Router::new()
            .route(
                &options.path,
                post(handle_post).get(handle_get).delete(handle_delete),
            )
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind(addr).await.map_err(McpError::transport)?;
        let local_addr = listener.local_addr().map_err(McpError::transport)?;

        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(serve_shutdown.cancelled_owned())
                .await;
            if let Err(e) = result {
                tracing::error!(err = %e, "HTTP server terminated abnormally");
            }
        });

        tracing::info!(%local_addr, path = %options.path, "streamable HTTP transport listening");
        Ok(Self {
            state,
            inbound_rx,
            shutdown,
            local_addr,
        })
    }

    pub fn handle(&self) -> HttpServerHandle {
        HttpServerHandle {
            state: Arc::clone(&self.state),
            shutdown: self.shutdown.clone(),
            local_addr: self.local_addr,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for HttpServerTransport {
    fn drop(&mut self) {
        // The listener has no reason to outlive the peer runtime that owned us.
        self.shutdown.cancel();
    }
}

impl Transport for HttpServerTransport {
    type Error = HttpTransportError;

    fn span(&self) -> tracing::Span {
        tracing::debug_span!("http_server", addr = %self.local_addr)
    }

    fn send_message(
        &mut self,
        message: Message,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        async move {
            if self.shutdown.is_cancelled() {
                return Err(HttpTransportError::Closed);
            }

            // Responses owed to an open POST are routed back to it; everything else
            // (server-originated requests and notifications) is multicast to the open
            // GET streams.
            if let Message::Response(response) = &message {
                let reply_tx = self.state.post_replies.lock().unwrap().remove(&response.id);
                if let Some(reply_tx) = reply_tx {
                    if reply_tx.try_send(message).is_err() {
                        tracing::debug!("POST client went away before its response was ready");
                    }
                    return Ok(());
                }
            }

            let payload = mcplex_jsonrpc::serialize(&message)?;
            self.state.broadcast(&payload);
            Ok(())
        }
    }

    fn receive_message(
        &mut self,
    ) -> impl Future<Output = Result<Option<TransportEvent>, Self::Error>> + Send + '_ {
        async move {
            tokio::select! {
                _ = self.shutdown.cancelled() => Ok(None),
                message = self.inbound_rx.recv() => Ok(message.map(TransportEvent::Message)),
            }
        }
    }
}

fn session_id_header(id: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static(SESSION_ID_HEADER),
        HeaderValue::from_str(id).unwrap_or_else(|_| HeaderValue::from_static("")),
    )
}

fn parse_error_body(err: &JsonRpcError) -> String {
    let details = ErrorDetails::from(err);
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": details,
    })
    .to_string()
}

/// Checks shared by every route: origin allow-list and (when present) the protocol
/// version header.
///
/// Once a session has negotiated a version, the header must name exactly that
/// version; before negotiation (the initial POST) it only has to be one we support.
fn preflight(state: &HttpServerState, headers: &HeaderMap) -> Result<(), AxumResponse> {
    if !state.origin_allowed(headers) {
        return Err((StatusCode::FORBIDDEN, "origin not allowed").into_response());
    }
    if let Some(requested) = headers
        .get(PROTOCOL_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        let negotiated = headers
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|session_id| state.negotiated_version(session_id));
        let acceptable = match &negotiated {
            Some(negotiated) => requested == negotiated.as_str(),
            None => version::is_supported(requested),
        };
        if !acceptable {
            return Err((StatusCode::BAD_REQUEST, "unsupported protocol version").into_response());
        }
    }
    Ok(())
}

async fn handle_post(
    State(state): State<Arc<HttpServerState>>,
    headers: HeaderMap,
    body: String,
) -> AxumResponse {
    if let Err(response) = preflight(&state, &headers) {
        return response;
    }

    // A leading '[' distinguishes a batch from a single message.
    let is_batch = body.trim_start().starts_with('[');
    let parsed = if is_batch {
        mcplex_jsonrpc::parse_batch(&body)
    } else {
        mcplex_jsonrpc::parse(&body).map(|message| vec![message])
    };
    let messages = match parsed {
        Ok(messages) => messages,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
                parse_error_body(&e),
            )
                .into_response();
        }
    };

    // Session bookkeeping: the very first POST (the one carrying `initialize`) mints
    // the session id; every other request must present a known one.
    let presented = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let (session_id, minted) = match presented {
        Some(id) => {
            if !state.session_exists(&id) {
                return (StatusCode::NOT_FOUND, "unknown session").into_response();
            }
            (id, false)
        }
        None => {
            let has_initialize = messages
                .iter()
                .any(|m| matches!(m, Message::Request(req) if req.method == "initialize"));
            if !has_initialize {
                return (StatusCode::NOT_FOUND, "missing session id").into_response();
            }
            (state.create_session(), true)
        }
    };

    // Register reply routes for every request in the body before dispatching
    // anything, so responses cannot race past us.
    let (request_ids, _others): (Vec<Id>, Vec<()>) =
        messages.iter().partition_map(|message| match message {
            Message::Request(req) => Either::Left(req.id.clone()),
            _ => Either::Right(()),
        });
    let expected = request_ids.len();
    let (reply_tx, mut reply_rx) = mpsc::channel(expected.max(1));
    {
        let mut replies = state.post_replies.lock().unwrap();
        for id in &request_ids {
            replies.insert(id.clone(), reply_tx.clone());
        }
    }
    drop(reply_tx);

    for message in messages {
        if state.inbound_tx.send(message).await.is_err() {
            return (StatusCode::INTERNAL_SERVER_ERROR, "peer runtime is gone").into_response();
        }
    }

    let mut response = if expected == 0 {
        // Notifications and responses only: nothing to wait for.
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            "{}".to_string(),
        )
            .into_response()
    } else if wants_event_stream(&headers) {
        // Emit each response as its own SSE event, then a terminal done event.
        let sse_state = Arc::clone(&state);
        let sse_session = session_id.clone();
        let stream = ReceiverStream::new(reply_rx)
            .map(move |message| {
                sse_state.record_negotiated_version(&sse_session, &message);
                Event::default().data(
                    mcplex_jsonrpc::serialize(&message)
                        .unwrap_or_else(|_| parse_error_body(&JsonRpcError::NotAnObject)),
                )
            })
            .take(expected)
            .chain(futures::stream::once(async {
                Event::default().event("done").data("{}")
            }))
            .map(Ok::<_, std::convert::Infallible>);
        Sse::new(stream).into_response()
    } else {
        // Plain JSON mode: gather every owed response, then answer in one body.
        let mut responses = Vec::with_capacity(expected);
        while responses.len() < expected {
            match reply_rx.recv().await {
                Some(message) => responses.push(message),
                None => break,
            }
        }
        // Un-route anything that never got answered (runtime shut down mid-request).
        {
            let mut replies = state.post_replies.lock().unwrap();
            for id in &request_ids {
                replies.remove(id);
            }
        }
        if responses.len() < expected {
            return (StatusCode::INTERNAL_SERVER_ERROR, "session terminated").into_response();
        }
        for message in &responses {
            state.record_negotiated_version(&session_id, message);
        }

        let serialized = if is_batch {
            mcplex_jsonrpc::serialize_batch(&responses)
        } else {
            mcplex_jsonrpc::serialize(&responses[0])
        };
        match serialized {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
                body,
            )
                .into_response(),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "serialization failure").into_response(),
        }
    };

    if minted {
        let (name, value) = session_id_header(&session_id);
        response.headers_mut().insert(name, value);
    }
    response
}

async fn handle_get(
    State(state): State<Arc<HttpServerState>>,
    headers: HeaderMap,
) -> AxumResponse {
    if let Err(response) = preflight(&state, &headers) {
        return response;
    }

    let presented = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let (session_id, minted) = match presented {
        Some(id) => {
            if !state.session_exists(&id) {
                return (StatusCode::NOT_FOUND, "unknown session").into_response();
            }
            (id, false)
        }
        None => (state.create_session(), true),
    };

    // Install this connection as the session's sink; a newer GET replaces an older
    // one.  The sink lives only as long as the HTTP connection: once the stream is
    // dropped, writes start failing and the sink is discarded.
    let (sink_tx, sink_rx) = mpsc::channel(SINK_CHANNEL_BOUND);
    {
        let mut sessions = state.sessions.lock().unwrap();
        if let Some(entry) = sessions.get_mut(&session_id) {
            entry.sink = Some(sink_tx);
        }
    }

    let stream = ReceiverStream::new(sink_rx)
        .map(|payload| Event::default().data(payload))
        .map(Ok::<_, std::convert::Infallible>);
    let mut response = Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    if minted {
        let (name, value) = session_id_header(&session_id);
        response.headers_mut().insert(name, value);
    }
    response
}

async fn handle_delete(
    State(state): State<Arc<HttpServerState>>,
    headers: HeaderMap,
) -> AxumResponse {
    if let Err(response) = preflight(&state, &headers) {
        return response;
    }

    let Some(session_id) = headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing session id").into_response();
    };
    if state.sessions.lock().unwrap().remove(session_id).is_none() {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    }
    tracing::debug!(session_id, "session terminated by DELETE");
    StatusCode::OK.into_response()
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

// ---------- SSE decoding (client side) ----------

/// Extract the data payload from one blank-line-delimited SSE event block.
///
/// Comment lines and unknown fields are ignored; multi-line data is joined with
/// newlines.  Returns `None` for keep-alive comments and for the terminal `done`
/// event.
fn decode_sse_block(block: &str) -> Option<String> {
    let mut event_name: Option<&str> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = Some(rest.trim());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }

    if event_name == Some("done") || data_lines.is_empty() {
        return None;
    }
    Some(data_lines.join("\n"))
}

/// Decode every event in an SSE body that has already been fully received.
fn decode_sse_body(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(decode_sse_block)
        .collect()
}

// ---------- Client side ----------

struct HttpClientState {
    client: reqwest::Client,
    url: reqwest::Url,
    session_id: Mutex<Option<String>>,
    inbound_tx: mpsc::Sender<Message>,
    listener_started: AtomicBool,
    shutdown: CancellationToken,
}

impl HttpClientState {
    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request = request
            .header(header::ACCEPT, "application/json, text/event-stream")
            .header(PROTOCOL_VERSION_HEADER, version::PROTOCOL_VERSION);
        if let Some(session_id) = self.session_id.lock().unwrap().clone() {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        request
    }

    fn record_session_id(self: Arc<Self>, response: &reqwest::Response) {
        let Some(id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        *self.session_id.lock().unwrap() = Some(id.to_string());

        // The GET stream needs a session id, so it starts lazily after the first
        // response that supplies one.
        if !self.listener_started.swap(true, Ordering::SeqCst) {
            let state = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = state.run_sse_listener().await {
                    tracing::debug!(err = %e, "server event stream ended");
                }
            });
        }
    }

    /// Long-lived GET stream carrying server-originated requests and notifications.
    /// No reconnection: if the stream drops, server-push stops until the session is
    /// re-established by the application.
    async fn run_sse_listener(self: Arc<Self>) -> Result<(), HttpTransportError> {
        let request = self.apply_headers(self.client.get(self.url.clone()));
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(HttpTransportError::Status {
                status: response.status(),
            });
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        loop {
            let chunk = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(end) = buffer.find("\n\n") {
                let block: String = buffer.drain(..end + 2).collect();
                let Some(payload) = decode_sse_block(block.trim_end_matches('\n')) else {
                    continue;
                };
                self.deliver(&payload).await;
            }
        }
        Ok(())
    }

    /// Parse one wire payload (single message or batch) and queue it for the runtime.
    async fn deliver(&self, payload: &str) {
        let trimmed = payload.trim();
        if trimmed.is_empty() || trimmed == "{}" {
            return;
        }
        let parsed = if trimmed.starts_with('[') {
            mcplex_jsonrpc::parse_batch(trimmed)
        } else {
            mcplex_jsonrpc::parse(trimmed).map(|message| vec![message])
        };
        match parsed {
            Ok(messages) => {
                for message in messages {
                    if self.inbound_tx.send(message).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(err = %e, "discarding unparseable payload from server");
            }
        }
    }
}

/// Client end of the Streamable HTTP transport.
pub struct HttpClientTransport {
    state: Arc<HttpClientState>,
    inbound_rx: mpsc::Receiver<Message>,
}

impl HttpClientTransport {
    pub fn connect(url: &str) -> Result<Self> {
        let url = reqwest::Url::parse(url).map_err(McpError::transport)?;
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(McpError::transport)?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_BOUND);
        Ok(Self {
            state: Arc::new(HttpClientState {
                client,
                url,
                session_id: Mutex::new(None),
                inbound_tx,
                listener_started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
            inbound_rx,
        })
    }

    /// The session id assigned by the server, once the first exchange has happened.
    pub fn session_id(&self) -> Option<String> {
        self.state.session_id.lock().unwrap().clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }
}

impl Drop for HttpClientTransport {
    fn drop(&mut self) {
        // Stops the background GET listener, if one was started.
        self.state.shutdown.cancel();
    }
}

impl Transport for HttpClientTransport {
    type Error = HttpTransportError;

    fn span(&self) -> tracing::Span {
        tracing::debug_span!("http_client", url = %self.state.url)
    }

    fn send_message(
        &mut self,
        message: Message,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        async move {
            if self.state.shutdown.is_cancelled() {
                return Err(HttpTransportError::Closed);
            }

            let body = mcplex_jsonrpc::serialize(&message)?;
            let request = self
                .state
                .apply_headers(self.state.client.post(self.state.url.clone()))
                .header(header::CONTENT_TYPE, "application/json")
                .body(body);

            let response = request.send().await?;
            Arc::clone(&self.state).record_session_id(&response);

            let status = response.status();
            if status.as_u16() >= 400 {
                return Err(HttpTransportError::Status { status });
            }

            let is_event_stream = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.starts_with("text/event-stream"));
            let body = response.text().await?;

            if is_event_stream {
                for payload in decode_sse_body(&body) {
                    self.state.deliver(&payload).await;
                }
            } else {
                self.state.deliver(&body).await;
            }
            Ok(())
        }
    }

    fn receive_message(
        &mut self,
    ) -> impl Future<Output = Result<Option<TransportEvent>, Self::Error>> + Send + '_ {
        async move {
            tokio::select! {
                _ = self.state.shutdown.cancelled() => Ok(None),
                message = self.inbound_rx.recv() => Ok(message.map(TransportEvent::Message)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcplex_jsonrpc::{Notification, Request};

    #[test]
    fn sse_blocks_decode_data_and_skip_noise() {
        assert_eq!(
            decode_sse_block("event: message\ndata: {\"jsonrpc\":\"2.0\"}"),
            Some("{\"jsonrpc\":\"2.0\"}".to_string())
        );
        assert_eq!(decode_sse_block("data: a\ndata: b"), Some("a\nb".to_string()));
        assert_eq!(decode_sse_block(": keep-alive"), None);
        assert_eq!(decode_sse_block("event: done\ndata: {}"), None);
    }

    #[test]
    fn sse_bodies_split_into_events() {
        let body = "data: one\n\n: ping\n\nevent: done\ndata: {}\n\ndata: two\n\n";
        assert_eq!(decode_sse_body(body), vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn shutdown_before_start_makes_the_transport_inert() {
        let mut transport = HttpClientTransport::connect("http://127.0.0.1:9/mcp").unwrap();
        transport.shutdown_token().cancel();

        // the read side drains immediately...
        assert!(transport.receive_message().await.unwrap().is_none());
        // ...and sends are refused without touching the network
        let err = transport
            .send_message(Message::Notification(Notification::new("hi", None)))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpTransportError::Closed));
    }

    #[tokio::test]
    async fn server_routes_responses_to_the_owing_post() {
        let transport = HttpServerTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            HttpServerOptions::default(),
        )
        .await
        .unwrap();
        let state = Arc::clone(&transport.state);

        // simulate an open POST owed a response for id 7
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        state
            .post_replies
            .lock()
            .unwrap()
            .insert(Id::Number(7), reply_tx);

        let mut transport = transport;
        transport
            .send_message(Message::Response(mcplex_jsonrpc::Response::success(
                Id::Number(7),
                serde_json::json!({}),
            )))
            .await
            .unwrap();

        let routed = reply_rx.recv().await.unwrap();
        assert!(matches!(routed, Message::Response(resp) if resp.id == Id::Number(7)));
        // the reply route is consumed
        assert!(state.post_replies.lock().unwrap().is_empty());

        // a request with no owing POST is broadcast instead (no sinks: dropped)
        transport
            .send_message(Message::Request(Request::new(1u64, "roots/list", None)))
            .await
            .unwrap();
    }
}
