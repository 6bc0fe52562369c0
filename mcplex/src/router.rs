//! Dispatch of decoded inbound requests and notifications to registered handlers.
//!
//! The router owns three maps: request handlers, notification handlers, and per-method
//! capability requirements.  Dispatch copies the handler out under the lock and invokes
//! it with the lock released, so a handler is free to re-enter the router (to register
//! a method, update capabilities, and so on) without deadlocking.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use futures::Future;
use mcplex_jsonrpc::{ErrorDetails, Message, Notification, Request, Response};
use serde_json::Value as JsonValue;

use crate::types::{ClientCapabilities, ServerCapabilities};

type HandlerFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A request handler consumes the structured params and produces either a structured
/// result or an error record.
pub type RequestHandler =
    Arc<dyn Fn(JsonValue) -> HandlerFuture<Result<JsonValue, ErrorDetails>> + Send + Sync>;

/// A notification handler consumes the structured params and produces nothing.
pub type NotificationHandler = Arc<dyn Fn(JsonValue) -> HandlerFuture<()> + Send + Sync>;

struct RouterInner {
    request_handlers: HashMap<String, RequestHandler>,
    notification_handlers: HashMap<String, NotificationHandler>,
    capability_requirements: HashMap<String, &'static str>,
    server_capabilities: ServerCapabilities,
    client_capabilities: ClientCapabilities,
}

#[derive(Clone)]
pub struct Router {
    inner: Arc<RwLock<RouterInner>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RouterInner {
                request_handlers: HashMap::new(),
                notification_handlers: HashMap::new(),
                capability_requirements: HashMap::new(),
                server_capabilities: ServerCapabilities::default(),
                client_capabilities: ClientCapabilities::default(),
            })),
        }
    }

    pub fn on_request<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, ErrorDetails>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.inner
            .write()
            .unwrap()
            .request_handlers
            .insert(method.into(), handler);
    }

    pub fn on_notification<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: NotificationHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.inner
            .write()
            .unwrap()
            .notification_handlers
            .insert(method.into(), handler);
    }

    /// Gate a method on a named capability.  Dispatch of that method answers
    /// `InvalidRequest` while the capability bag is absent from the negotiated set.
    pub fn require_capability(&self, method: impl Into<String>, capability: &'static str) {
        self.inner
            .write()
            .unwrap()
            .capability_requirements
            .insert(method.into(), capability);
    }

    /// Install the capability sets negotiated at initialize time.
    pub fn set_capabilities(&self, server: ServerCapabilities, client: ClientCapabilities) {
        let mut inner = self.inner.write().unwrap();
        inner.server_capabilities = server;
        inner.client_capabilities = client;
    }

    pub fn has_request_handler(&self, method: &str) -> bool {
        self.inner.read().unwrap().request_handlers.contains_key(method)
    }

    /// Dispatch one inbound message, producing at most one outbound message.
    ///
    /// Responses are never routed here; they are the session's concern, and the caller
    /// is expected not to pass them in.
    pub async fn dispatch(&self, message: Message) -> Option<Message> {
        match message {
            Message::Request(request) => self.dispatch_request(request).await.map(Message::Response),
            Message::Notification(notification) => {
                self.dispatch_notification(notification).await;
                None
            }
            Message::Response(response) => {
                tracing::warn!(request_id = %response.id, "router asked to dispatch a response; ignoring");
                None
            }
        }
    }

    async fn dispatch_request(&self, request: Request) -> Option<Response> {
        let Request { id, method, params, .. } = request;
        let params = params.unwrap_or_else(|| JsonValue::Object(Default::default()));

        // Look up the handler and check the capability gate under the lock, then
        // release it before invoking anything.
        let handler = {
            let inner = self.inner.read().unwrap();
            if !inner.capability_satisfied(&method) {
                return Some(Response::error(
                    id,
                    ErrorDetails::invalid_request(
                        format!("Capability not supported: {method}"),
                        None,
                    ),
                ));
            }
            match inner.request_handlers.get(&method) {
                Some(handler) => Arc::clone(handler),
                None => {
                    return Some(Response::error(
                        id,
                        ErrorDetails::method_not_found(format!("Method not found: {method}"), None),
                    ));
                }
            }
        };

        let payload = handler(params).await;
        Some(match payload {
            Ok(result) => Response::success(id, result),
            Err(error) => Response::error(id, error),
        })
    }

    async fn dispatch_notification(&self, notification: Notification) {
        let Notification { method, params } = notification;
        let params = params.unwrap_or_else(|| JsonValue::Object(Default::default()));

        let handler = {
            let inner = self.inner.read().unwrap();
            match inner.notification_handlers.get(&method) {
                Some(handler) => Arc::clone(handler),
                // Unknown notifications are ignored silently
                None => return,
            }
        };

        // Notifications produce no response, so there is nothing to report to the
        // remote peer; the handler's own tracing is the only record.
        handler(params).await;
    }
}

impl RouterInner {
    fn capability_satisfied(&self, method: &str) -> bool {
        let Some(capability) = self.capability_requirements.get(method) else {
            return true;
        };
        match *capability {
            "tools" => self.server_capabilities.tools.is_some(),
            "resources" => self.server_capabilities.resources.is_some(),
            "prompts" => self.server_capabilities.prompts.is_some(),
            "logging" => self.server_capabilities.logging.is_some(),
            "completions" => self.server_capabilities.completions.is_some(),
            "sampling" => self.client_capabilities.sampling.is_some(),
            "roots" => self.client_capabilities.roots.is_some(),
            "elicitation" => self.client_capabilities.elicitation.is_some(),
            other => {
                tracing::warn!(capability = other, method, "unknown capability requirement");
                false
            }
        }
    }
}
