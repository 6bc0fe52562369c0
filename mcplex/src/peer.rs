//! The peer runtime: the event loop servicing one connection, and the handle used to
//! talk to it.
//!
//! Both MCP roles run this same machinery.  The event loop owns the transport and is
//! the only code that touches it; callers reach the loop through a bounded channel on
//! [`PeerHandle`] and park on one-shot rendezvous channels for responses.  Inbound
//! requests and notifications run in spawned tasks tracked by a `JoinSet`, so a slow
//! handler never stalls the loop, and an inbound `notifications/cancelled` can abort
//! the matching task.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use mcplex_jsonrpc::{ErrorDetails, Id, Message, Notification, Request, Response, ResponsePayload};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{McpError, Result};
use crate::router::Router;
use crate::session::{Session, SessionState};
use crate::transport::{Link, TransportEvent};
use crate::types::{CancelledParams, ProgressToken};

/// How many outbound messages may queue before senders feel backpressure.
const OUTBOUND_CHANNEL_BOUND: usize = 16;

/// Runtime knobs for one peer connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Outbound calls time out after this long.
    pub request_timeout: Duration,
    /// How often the pending-call table is swept for expired entries.
    pub timeout_sweep_interval: Duration,
    /// How long to let in-flight inbound handlers finish at shutdown before they are
    /// aborted.  `None` waits indefinitely.
    pub graceful_shutdown_timeout: Option<Duration>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            timeout_sweep_interval: Duration::from_millis(250),
            graceful_shutdown_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// The shared, clonable future representing the running event loop.  Its output is the
/// loop's final disposition; errors are stringified so the future's output is `Clone`.
pub type EventLoopFuture = futures::future::Shared<Pin<Box<dyn Future<Output = Result<(), String>> + Send>>>;

enum OutboundMessage {
    Call {
        request: Request,
        progress_token: Option<ProgressToken>,
        response_tx: oneshot::Sender<Result<Response>>,
    },
    Notify {
        notification: Notification,
        sent_tx: oneshot::Sender<Result<()>>,
    },
}

/// Start the runtime for one connection.
///
/// Returns the event-loop future (the caller must spawn or poll it) and the handle
/// used to issue outbound operations.  Messages submitted through the handle before
/// the future is first polled are queued and drained once it runs.
pub(crate) fn start_peer(
    config: PeerConfig,
    session: Arc<Session>,
    router: Router,
    link: Link,
) -> (EventLoopFuture, PeerHandle) {
    let cancel = CancellationToken::new();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_BOUND);

    let span = link.span();
    let runtime = PeerRuntime {
        config,
        session: Arc::clone(&session),
        router,
        link,
        cancel: cancel.clone(),
        inflight: JoinSet::new(),
        inflight_request_ids: HashMap::new(),
        abort_handles: HashMap::new(),
        outbound_rx,
    };

    // Catch panics so a handle waiting on the loop future learns about them instead of
    // hanging, and stringify the outcome so the future can be `Shared`.
    let event_loop_fut: EventLoopFuture = async move {
        match AssertUnwindSafe(runtime.run()).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(panic_message(panic)),
        }
    }
    .instrument(span)
    .boxed()
    .shared();

    let handle = PeerHandle {
        outbound_tx,
        cancel,
        session,
        event_loop_fut: event_loop_fut.clone(),
    };

    (event_loop_fut, handle)
}

struct PeerRuntime {
    config: PeerConfig,
    session: Arc<Session>,
    router: Router,
    link: Link,
    cancel: CancellationToken,

    /// Tasks running inbound request/notification handlers.
    inflight: JoinSet<Option<Message>>,

    /// Task id -> the JSON-RPC request id it is answering, for requests only.  Used to
    /// manufacture an error response when a task dies without producing one.
    inflight_request_ids: HashMap<tokio::task::Id, Id>,

    /// Request id -> abort handle, so an inbound `notifications/cancelled` can stop
    /// the matching handler.
    abort_handles: HashMap<Id, AbortHandle>,

    outbound_rx: mpsc::Receiver<OutboundMessage>,
}

impl PeerRuntime {
    async fn run(mut self) -> Result<()> {
        tracing::debug!("peer event loop starting");
        let mut sweep = tokio::time::interval(self.config.timeout_sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                outbound = self.outbound_rx.recv() => {
                    match outbound {
                        Some(outbound) => self.handle_outbound(outbound).await,
                        None => {
                            // Every handle is gone; nobody can observe this connection
                            // anymore, so wind it down.
                            tracing::debug!("all handles dropped; event loop terminating");
                            break Ok(());
                        }
                    }
                },
                received = self.link.receive_message() => {
                    match received {
                        Ok(Some(event)) => self.handle_inbound(event).await,
                        Ok(None) => {
                            tracing::debug!("peer closed the connection; event loop terminating");
                            break Ok(());
                        }
                        Err(e) => {
                            tracing::error!(err = %e, "transport failure; event loop terminating");
                            break Err(e);
                        }
                    }
                },
                next = self.inflight.join_next_with_id(), if !self.inflight.is_empty() => {
                    if let Some(result) = next {
                        self.handle_inflight_completion(result).await;
                    }
                },
                _ = sweep.tick() => {
                    self.expire_timed_out_calls().await;
                },
                _ = self.cancel.cancelled() => {
                    tracing::debug!("cancellation signalled; shutting down connection");
                    break Err(McpError::Cancelled);
                }
            }
        };

        self.shutdown_drain().await;

        // Cancellation is the normal way a session ends, not a failure.
        let (result, reason) = match result {
            Err(McpError::Cancelled) => (Ok(()), "cancelled"),
            Err(e) => (Err(e), "error"),
            Ok(()) => (Ok(()), "connection_closed"),
        };
        tracing::debug!(reason, "peer event loop exited");
        result
    }

    /// Orderly teardown: refuse queued outbound work, give in-flight handlers a
    /// bounded chance to finish, then fail whatever is still pending.
    async fn shutdown_drain(&mut self) {
        self.session.set_state(SessionState::ShuttingDown);

        self.outbound_rx.close();
        while let Some(outbound) = self.outbound_rx.recv().await {
            match outbound {
                OutboundMessage::Call { request, response_tx, .. } => {
                    tracing::debug!(request_id = %request.id, method = %request.method,
                        "failing queued call at shutdown");
                    let _ = response_tx.send(Err(McpError::TransportClosed));
                }
                OutboundMessage::Notify { notification, sent_tx } => {
                    tracing::debug!(method = %notification.method,
                        "dropping queued notification at shutdown");
                    let _ = sent_tx.send(Err(McpError::TransportClosed));
                }
            }
        }

        let deadline = self
            .config
            .graceful_shutdown_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        loop {
            let next = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.inflight.join_next_with_id()).await {
                        Ok(next) => next,
                        Err(_) => {
                            tracing::warn!(
                                remaining = self.inflight.len(),
                                "in-flight handlers outlived the graceful shutdown window; aborting them"
                            );
                            self.inflight.abort_all();
                            while let Some(result) = self.inflight.join_next_with_id().await {
                                self.handle_inflight_completion(result).await;
                            }
                            break;
                        }
                    }
                }
                None => self.inflight.join_next_with_id().await,
            };
            match next {
                Some(result) => self.handle_inflight_completion(result).await,
                None => break,
            }
        }

        self.session.fail_all(|| McpError::TransportClosed);
        self.session.set_state(SessionState::Closed);
    }

    async fn handle_outbound(&mut self, outbound: OutboundMessage) {
        match outbound {
            OutboundMessage::Call {
                request,
                progress_token,
                response_tx,
            } => {
                // Register the rendezvous only after the frame is accepted by the
                // transport; a failed send reports straight back to the caller.
                let id = request.id.clone();
                let method = request.method.clone();
                match self.link.send_message(Message::Request(request)).await {
                    Ok(()) => {
                        self.session.insert_pending(id, method, response_tx, progress_token);
                    }
                    Err(e) => {
                        tracing::error!(request_id = %id, method = %method, err = %e, "failed to send request");
                        let _ = response_tx.send(Err(e));
                    }
                }
            }
            OutboundMessage::Notify { notification, sent_tx } => {
                let result = self.link.send_message(Message::Notification(notification)).await;
                let _ = sent_tx.send(result);
            }
        }
    }

    async fn handle_inbound(&mut self, event: TransportEvent) {
        let message = match event {
            TransportEvent::Message(message) => message,
            TransportEvent::Malformed(details) => {
                // Malformed frame: answer with a parse error addressed to id null and
                // keep the session alive.
                let _ = self
                    .link
                    .send_message(Message::Response(Response::error(Id::Null, details)))
                    .await;
                return;
            }
        };

        match message {
            Message::Response(response) => {
                // Late responses (post-timeout, or never requested) resolve nothing
                // and are dropped.
                if !self.session.resolve(response) {
                    tracing::warn!("dropping response for unknown or expired request id");
                }
            }
            Message::Notification(notification) => {
                if notification.method == "notifications/cancelled" {
                    self.handle_inbound_cancellation(&notification);
                }
                self.spawn_dispatch(Message::Notification(notification), None);
            }
            Message::Request(request) => {
                if let Some(denial) = self.lifecycle_denial(&request) {
                    let _ = self.link.send_message(Message::Response(denial)).await;
                    return;
                }
                let id = request.id.clone();
                self.spawn_dispatch(Message::Request(request), Some(id));
            }
        }
    }

    /// Before the session is `Ready`, only the handshake subset may be invoked.
    fn lifecycle_denial(&self, request: &Request) -> Option<Response> {
        const PRE_READY_METHODS: &[&str] = &["initialize", "ping"];
        if self.session.state() == SessionState::Ready
            || PRE_READY_METHODS.contains(&request.method.as_str())
        {
            None
        } else {
            tracing::warn!(method = %request.method, state = ?self.session.state(),
                "rejecting request received before session is ready");
            Some(Response::error(
                request.id.clone(),
                ErrorDetails::invalid_request(
                    format!("Method '{}' cannot be called before initialization completes", request.method),
                    None,
                ),
            ))
        }
    }

    /// Best-effort abort of the in-flight handler for a cancelled request.  An aborted
    /// request produces no response; if the handler already finished, this is a no-op.
    fn handle_inbound_cancellation(&mut self, notification: &Notification) {
        let Some(params) = &notification.params else { return };
        let Ok(cancelled) = serde_json::from_value::<CancelledParams>(params.clone()) else {
            tracing::warn!("ignoring notifications/cancelled with malformed params");
            return;
        };
        if let Some(abort) = self.abort_handles.remove(&cancelled.request_id) {
            tracing::debug!(request_id = %cancelled.request_id, reason = ?cancelled.reason,
                "aborting in-flight handler for cancelled request");
            abort.abort();
        }
    }

    fn spawn_dispatch(&mut self, message: Message, request_id: Option<Id>) {
        let router = self.router.clone();
        let span = tracing::Span::current();
        let abort = self
            .inflight
            .spawn(async move { router.dispatch(message).await }.instrument(span));

        if let Some(request_id) = request_id {
            self.inflight_request_ids.insert(abort.id(), request_id.clone());
            self.abort_handles.insert(request_id, abort);
        }
    }

    async fn handle_inflight_completion(
        &mut self,
        result: std::result::Result<(tokio::task::Id, Option<Message>), tokio::task::JoinError>,
    ) {
        match result {
            Ok((task_id, output)) => {
                if let Some(request_id) = self.inflight_request_ids.remove(&task_id) {
                    self.abort_handles.remove(&request_id);
                }
                if let Some(message) = output {
                    let _ = self.link.send_message(message).await;
                }
            }
            Err(join_err) => {
                let task_id = join_err.id();
                let request_id = self.inflight_request_ids.remove(&task_id);
                if let Some(request_id) = &request_id {
                    self.abort_handles.remove(request_id);
                }

                if join_err.is_panic() {
                    tracing::error!(?request_id, err = %join_err, "inbound handler panicked");
                    // A request whose handler panicked still deserves an answer.
                    if let Some(request_id) = request_id {
                        let _ = self
                            .link
                            .send_message(Message::Response(Response::error(
                                request_id,
                                ErrorDetails::internal_error("Handler failed", None),
                            )))
                            .await;
                    }
                } else {
                    // Aborted via notifications/cancelled (or shutdown): the remote
                    // peer asked for no response, so none is sent.
                    tracing::debug!(?request_id, "inbound handler task cancelled");
                }
            }
        }
    }

    /// Expired calls have already had `Timeout` delivered to their waiters by the
    /// session; tell the remote peer to stop working on them.
    async fn expire_timed_out_calls(&mut self) {
        for expired in self.session.check_timeouts() {
            tracing::warn!(request_id = %expired.id, method = %expired.method, "outbound call timed out");
            let cancelled = CancelledParams {
                request_id: expired.id,
                reason: Some("request timed out".to_string()),
            };
            let params = serde_json::to_value(&cancelled)
                .unwrap_or_else(|_| JsonValue::Object(Default::default()));
            let _ = self
                .link
                .send_message(Message::Notification(Notification::new(
                    "notifications/cancelled",
                    params,
                )))
                .await;
        }
    }
}

/// Lightweight, clonable handle to a running peer connection.
///
/// Used to issue outbound calls and notifications, and to signal and await shutdown.
#[derive(Clone)]
pub struct PeerHandle {
    outbound_tx: mpsc::Sender<OutboundMessage>,
    cancel: CancellationToken,
    session: Arc<Session>,
    event_loop_fut: EventLoopFuture,
}

impl PeerHandle {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal shutdown and wait for the event loop to finish its orderly teardown.
    /// Idempotent across clones of the handle.
    pub async fn shutdown(&self) -> Result<(), String> {
        self.cancel.cancel();
        self.event_loop_fut.clone().await
    }

    /// Resolves when the event loop has exited, however that happened.
    pub async fn closed(&self) -> Result<(), String> {
        self.event_loop_fut.clone().await
    }

    /// Call a method with no parameters, decoding the result.
    pub async fn call<Resp: DeserializeOwned>(&self, method: &str) -> Result<Resp> {
        let response = self.call_raw(method, None).await?;
        decode_response(response)
    }

    /// Call a method with serializable parameters, decoding the result.
    pub async fn call_with_params<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        method: &str,
        params: Req,
    ) -> Result<Resp> {
        let params = serde_json::to_value(params).map_err(|source| McpError::SerRequest {
            source,
            type_name: std::any::type_name::<Req>(),
        })?;
        let response = self.call_raw(method, params).await?;
        decode_response(response)
    }

    /// Call a method on the raw JSON layer.
    ///
    /// The outcome is exactly one of: the remote result, the remote error (code
    /// preserved in [`McpError::Method`]), a local [`McpError::Timeout`], or
    /// [`McpError::TransportClosed`] if the session ended first.
    pub async fn call_raw(&self, method: &str, params: impl Into<Option<JsonValue>>) -> Result<JsonValue> {
        let request = Request::new(self.session.allocate_id(), method, params.into());
        self.submit_call(request, None).await
    }

    /// Like [`Self::call_raw`], but attaching a progress token in the request `_meta`
    /// so the remote peer can stream `notifications/progress` for this call.
    pub async fn call_raw_with_progress(
        &self,
        method: &str,
        params: impl Into<Option<JsonValue>>,
        token: ProgressToken,
    ) -> Result<JsonValue> {
        let mut request = Request::new(self.session.allocate_id(), method, params.into());
        request.meta = Some(serde_json::json!({ "progressToken": &token }));
        self.submit_call(request, Some(token)).await
    }

    async fn submit_call(&self, request: Request, progress_token: Option<ProgressToken>) -> Result<JsonValue> {
        let method = request.method.clone();
        let (response_tx, response_rx) = oneshot::channel();
        self.outbound_tx
            .send(OutboundMessage::Call {
                request,
                progress_token,
                response_tx,
            })
            .await
            .map_err(|_| McpError::TransportClosed)?;

        match response_rx.await {
            Ok(Ok(response)) => match response.payload {
                ResponsePayload::Success(result) => Ok(result),
                ResponsePayload::Error(error) => Err(McpError::Method { method, error }),
            },
            Ok(Err(e)) => Err(e),
            // The rendezvous sender was dropped, which only happens if the event loop
            // died without running its drain logic.
            Err(_) => Err(McpError::TransportClosed),
        }
    }

    /// Send a notification with no parameters.  Completion means the frame was handed
    /// to the transport, nothing more.
    pub async fn notify(&self, method: &str) -> Result<()> {
        self.notify_raw(method, None).await
    }

    pub async fn notify_with_params<Req: Serialize>(&self, method: &str, params: Req) -> Result<()> {
        let params = serde_json::to_value(params).map_err(|source| McpError::SerRequest {
            source,
            type_name: std::any::type_name::<Req>(),
        })?;
        self.notify_raw(method, params).await
    }

    pub async fn notify_raw(&self, method: &str, params: impl Into<Option<JsonValue>>) -> Result<()> {
        let (sent_tx, sent_rx) = oneshot::channel();
        self.outbound_tx
            .send(OutboundMessage::Notify {
                notification: Notification::new(method, params.into()),
                sent_tx,
            })
            .await
            .map_err(|_| McpError::TransportClosed)?;

        match sent_rx.await {
            Ok(result) => result,
            Err(_) => Err(McpError::TransportClosed),
        }
    }
}

fn decode_response<Resp: DeserializeOwned>(response: JsonValue) -> Result<Resp> {
    serde_json::from_value(response.clone()).map_err(|source| McpError::DeserResponse {
        source,
        type_name: std::any::type_name::<Resp>(),
        response,
    })
}

fn panic_message(err: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = err.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("panic of type {}", std::any::type_name_of_val(&*err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn echo_router() -> Router {
        let router = Router::new();
        router.on_request("echo", |params| async move { Ok(params) });
        router.on_request("slow", |_params| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!("done"))
        });
        router
    }

    fn start(
        config: PeerConfig,
        router: Router,
        transport: impl crate::transport::Transport,
    ) -> PeerHandle {
        let session = Arc::new(Session::new(config.request_timeout));
        // tests drive the full dispatch table without a handshake
        session.set_state(SessionState::Initializing);
        session.set_state(SessionState::Ready);
        let (fut, handle) = start_peer(config, session, router, Link::new(transport));
        tokio::spawn(fut);
        handle
    }

    #[tokio::test]
    async fn call_round_trips_between_two_peers() {
        testing::init_test_logging();
        let (client_io, server_io) = testing::transport_pair();
        let server = start(PeerConfig::default(), echo_router(), server_io);
        let client = start(PeerConfig::default(), Router::new(), client_io);

        let result = client.call_raw("echo", json!({"hello": "world"})).await.unwrap();
        assert_eq!(result, json!({"hello": "world"}));

        client.shutdown().await.unwrap();
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn remote_errors_preserve_their_code() {
        testing::init_test_logging();
        let (client_io, server_io) = testing::transport_pair();
        let _server = start(PeerConfig::default(), echo_router(), server_io);
        let client = start(PeerConfig::default(), Router::new(), client_io);

        let err = client.call_raw("nope", None).await.unwrap_err();
        assert_matches!(err, McpError::Method { method, error } => {
            assert_eq!(method, "nope");
            assert_eq!(error.code, mcplex_jsonrpc::ErrorCode::MethodNotFound);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_calls_fail_and_late_responses_are_dropped() {
        testing::init_test_logging();
        let (client_io, server_io) = testing::transport_pair();
        let _server = start(PeerConfig::default(), echo_router(), server_io);
        let client = start(
            PeerConfig {
                request_timeout: Duration::from_millis(100),
                ..Default::default()
            },
            Router::new(),
            client_io,
        );

        let err = client.call_raw("slow", None).await.unwrap_err();
        assert_matches!(err, McpError::Timeout { method } if method == "slow");

        // the session survives the timeout and subsequent calls still work
        let result = client.call_raw("echo", json!(1)).await.unwrap();
        assert_eq!(result, json!(1));

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn handles_fail_cleanly_after_shutdown() {
        testing::init_test_logging();
        let (client_io, _server_io) = testing::transport_pair();
        let client = start(PeerConfig::default(), Router::new(), client_io);
        let clone = client.clone();

        client.shutdown().await.unwrap();

        assert_matches!(
            clone.call_raw("echo", None).await.unwrap_err(),
            McpError::TransportClosed
        );
        assert_matches!(clone.notify("hi").await.unwrap_err(), McpError::TransportClosed);
        // shutting down again is a no-op
        clone.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn pre_ready_requests_are_denied_except_handshake_subset() {
        testing::init_test_logging();
        let (client_io, server_io) = testing::transport_pair();

        let router = echo_router();
        router.on_request("ping", |_| async move { Ok(json!({})) });
        let session = Arc::new(Session::new(Duration::from_secs(30)));
        let (fut, _server) = start_peer(PeerConfig::default(), session, router, Link::new(server_io));
        tokio::spawn(fut);

        let client = start(PeerConfig::default(), Router::new(), client_io);

        // ping is part of the pre-ready subset
        let result = client.call_raw("ping", None).await.unwrap();
        assert_eq!(result, json!({}));

        // anything else is rejected while the server session is uninitialized
        let err = client.call_raw("echo", json!(1)).await.unwrap_err();
        assert_matches!(err, McpError::Method { error, .. }
            if error.code == mcplex_jsonrpc::ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn inbound_cancellation_aborts_the_handler_and_suppresses_the_response() {
        testing::init_test_logging();
        let (client_io, server_io) = testing::transport_pair();
        let server = start(PeerConfig::default(), echo_router(), server_io);
        let client = start(PeerConfig::default(), Router::new(), client_io);

        // issue the slow call on a side task, then cancel it by id
        let call_client = client.clone();
        let call = tokio::spawn(async move { call_client.call_raw("slow", None).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // the slow call got id 1 from the counter
        client
            .notify_with_params(
                "notifications/cancelled",
                CancelledParams {
                    request_id: Id::Number(1),
                    reason: Some("test".into()),
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // no response will ever come; the call eventually fails via shutdown
        client.shutdown().await.unwrap();
        let result = call.await.unwrap();
        assert_matches!(result.unwrap_err(), McpError::TransportClosed);

        server.shutdown().await.unwrap();
    }
}
