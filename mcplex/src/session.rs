//! State-keeping for one peer relationship: the lifecycle machine, the table that
//! correlates outbound request ids with inbound responses, and the values negotiated
//! during `initialize`.
//!
//! All mutation goes through one lock, held only across map operations and never
//! across an await or a handler call.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use mcplex_jsonrpc::{Id, Response};
use tokio::sync::oneshot;

use crate::error::{McpError, Result};
use crate::types::{ClientCapabilities, ProgressToken, ServerCapabilities};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Closed,
}

impl SessionState {
    /// Legal transitions.  Shutdown may interrupt any state; `Ready -> Ready` is
    /// allowed because a server touches Ready twice (initialize response sent, then
    /// `notifications/initialized` received).
    fn may_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Initializing, Ready)
                | (Ready, Ready)
                | (_, ShuttingDown)
                | (ShuttingDown, Closed)
        )
    }
}

/// One entry in the pending-call table: a one-shot rendezvous resolved exactly once,
/// by the matching response, a timeout, or session teardown.
struct PendingCall {
    method: String,
    created_at: Instant,
    tx: oneshot::Sender<Result<Response>>,
    progress_token: Option<ProgressToken>,
}

/// An entry returned by [`Session::check_timeouts`], already removed from the table.
pub(crate) struct ExpiredCall {
    pub id: Id,
    pub method: String,
}

struct SessionInner {
    state: SessionState,
    next_id: u64,
    pending: HashMap<Id, PendingCall>,
    request_timeout: Duration,
    server_capabilities: ServerCapabilities,
    client_capabilities: ClientCapabilities,
    protocol_version: Option<String>,
    session_id: Option<String>,
}

pub struct Session {
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                next_id: 1,
                pending: HashMap::new(),
                request_timeout,
                server_capabilities: ServerCapabilities::default(),
                client_capabilities: ClientCapabilities::default(),
                protocol_version: None,
                session_id: None,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    /// Attempt a lifecycle transition.  Illegal transitions are ignored and reported
    /// back as `false`.
    pub fn set_state(&self, next: SessionState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.may_transition_to(next) {
            tracing::debug!(from = ?inner.state, to = ?next, "session state transition");
            inner.state = next;
            true
        } else {
            tracing::warn!(from = ?inner.state, to = ?next, "ignoring illegal session state transition");
            false
        }
    }

    /// Next integer request id from the monotonic counter.  Outbound ids are always
    /// integers; string ids only ever originate from the remote peer.
    pub fn allocate_id(&self) -> Id {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        Id::Number(id)
    }

    /// Park a caller's rendezvous under the given id.  The id must have come from
    /// [`Self::allocate_id`], so collisions cannot occur.
    pub(crate) fn insert_pending(
        &self,
        id: Id,
        method: impl Into<String>,
        tx: oneshot::Sender<Result<Response>>,
        progress_token: Option<ProgressToken>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let prior = inner.pending.insert(
            id,
            PendingCall {
                method: method.into(),
                created_at: Instant::now(),
                tx,
                progress_token,
            },
        );
        debug_assert!(prior.is_none(), "pending-call id reused");
    }

    /// Deliver a response to the parked caller.  Returns `false` when no call with
    /// this id is pending, which is how late (post-timeout) responses get dropped.
    pub fn resolve(&self, response: Response) -> bool {
        let entry = self.inner.lock().unwrap().pending.remove(&response.id);
        match entry {
            Some(call) => {
                // The receiver may already be gone if the caller gave up; that's fine.
                let _ = call.tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Fail every pending call.  Used at session teardown.
    pub(crate) fn fail_all(&self, make_err: impl Fn() -> McpError) {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.drain().collect()
        };
        for (id, call) in drained {
            tracing::debug!(request_id = %id, method = %call.method, "failing pending call at teardown");
            let _ = call.tx.send(Err(make_err()));
        }
    }

    /// Remove and fail every pending call older than the session timeout, delivering
    /// a `Timeout` error to each waiter.  Returns what expired so the event loop can
    /// notify the remote peer.
    pub(crate) fn check_timeouts(&self) -> Vec<ExpiredCall> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let timeout = inner.request_timeout;
        let expired_ids: Vec<Id> = inner
            .pending
            .iter()
            .filter(|(_, call)| now.duration_since(call.created_at) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut expired = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(call) = inner.pending.remove(&id) {
                let _ = call.tx.send(Err(McpError::Timeout {
                    method: call.method.clone(),
                }));
                expired.push(ExpiredCall {
                    id,
                    method: call.method,
                });
            }
        }
        expired
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn progress_token_for(&self, id: &Id) -> Option<ProgressToken> {
        self.inner
            .lock()
            .unwrap()
            .pending
            .get(id)
            .and_then(|call| call.progress_token.clone())
    }

    pub fn server_capabilities(&self) -> ServerCapabilities {
        self.inner.lock().unwrap().server_capabilities.clone()
    }

    pub fn set_server_capabilities(&self, caps: ServerCapabilities) {
        self.inner.lock().unwrap().server_capabilities = caps;
    }

    pub fn client_capabilities(&self) -> ClientCapabilities {
        self.inner.lock().unwrap().client_capabilities.clone()
    }

    pub fn set_client_capabilities(&self, caps: ClientCapabilities) {
        self.inner.lock().unwrap().client_capabilities = caps;
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.inner.lock().unwrap().protocol_version.clone()
    }

    pub fn set_protocol_version(&self, version: impl Into<String>) {
        self.inner.lock().unwrap().protocol_version = Some(version.into());
    }

    /// The transport-level session identifier (used by the HTTP transport).
    pub fn session_id(&self) -> Option<String> {
        self.inner.lock().unwrap().session_id.clone()
    }

    pub fn set_session_id(&self, id: impl Into<String>) {
        self.inner.lock().unwrap().session_id = Some(id.into());
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.lock().unwrap().request_timeout
    }
}
