//! The client-role domain surface: the initialize handshake, typed wrappers for every
//! client-invoked MCP method, notification callbacks, and the handlers that answer
//! server-originated sampling / elicitation / roots requests.

use std::sync::Arc;

use futures::Future;
use futures::future::BoxFuture;
use mcplex_jsonrpc::{ErrorDetails, Id};
use serde_json::{Value as JsonValue, json};

use crate::error::{McpError, Result};
use crate::peer::{PeerConfig, PeerHandle, start_peer};
use crate::router::Router;
use crate::session::{Session, SessionState};
use crate::transport::{Link, Transport};
use crate::types::*;
use crate::version;

pub type SamplingHandler =
    Arc<dyn Fn(SamplingRequest) -> BoxFuture<'static, Result<SamplingResult>> + Send + Sync>;
pub type RootsHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<Root>>> + Send + Sync>;
pub type ElicitationHandler =
    Arc<dyn Fn(ElicitationRequest) -> BoxFuture<'static, Result<ElicitationResult>> + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    tools_changed: Option<Arc<dyn Fn() + Send + Sync>>,
    resources_changed: Option<Arc<dyn Fn() + Send + Sync>>,
    prompts_changed: Option<Arc<dyn Fn() + Send + Sync>>,
    resource_updated: Option<Arc<dyn Fn(String) + Send + Sync>>,
    log_message: Option<Arc<dyn Fn(LogMessageParams) + Send + Sync>>,
    progress: Option<Arc<dyn Fn(ProgressParams) + Send + Sync>>,
}

/// Builder for an [`McpClient`].  Callbacks and server-request handlers are installed
/// here, before the transport is bound, so the connection never observes a
/// half-configured client.
pub struct ClientBuilder {
    client_info: Implementation,
    capabilities: ClientCapabilities,
    peer: PeerConfig,
    callbacks: Callbacks,
    sampling: Option<SamplingHandler>,
    roots: Option<RootsHandler>,
    elicitation: Option<ElicitationHandler>,
}

impl ClientBuilder {
    pub fn capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn peer_config(mut self, config: PeerConfig) -> Self {
        self.peer = config;
        self
    }

    pub fn on_tools_changed(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.tools_changed = Some(Arc::new(callback));
        self
    }

    pub fn on_resources_changed(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.resources_changed = Some(Arc::new(callback));
        self
    }

    pub fn on_prompts_changed(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.prompts_changed = Some(Arc::new(callback));
        self
    }

    pub fn on_resource_updated(mut self, callback: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.callbacks.resource_updated = Some(Arc::new(callback));
        self
    }

    pub fn on_log_message(
        mut self,
        callback: impl Fn(LogMessageParams) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.log_message = Some(Arc::new(callback));
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(ProgressParams) + Send + Sync + 'static) -> Self {
        self.callbacks.progress = Some(Arc::new(callback));
        self
    }

    /// Handler for server-originated `sampling/createMessage` requests.  Remember to
    /// also advertise the `sampling` capability, or the router will refuse the method.
    pub fn on_sampling_request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(SamplingRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SamplingResult>> + Send + 'static,
    {
        self.sampling = Some(Arc::new(move |req| Box::pin(handler(req))));
        self
    }

    pub fn on_roots_request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Root>>> + Send + 'static,
    {
        self.roots = Some(Arc::new(move || Box::pin(handler())));
        self
    }

    pub fn on_elicitation_request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ElicitationRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ElicitationResult>> + Send + 'static,
    {
        self.elicitation = Some(Arc::new(move |req| Box::pin(handler(req))));
        self
    }

    /// Bind to a transport and start the peer runtime.  The session still needs
    /// [`McpClient::initialize`] before anything beyond `ping` will be accepted.
    pub fn connect(self, transport: impl Transport) -> McpClient {
        let session = Arc::new(Session::new(self.peer.request_timeout));
        let router = Router::new();
        install_handlers(&router, &self.callbacks, &self.sampling, &self.roots, &self.elicitation);

        let (event_loop, handle) = start_peer(
            self.peer.clone(),
            Arc::clone(&session),
            router.clone(),
            Link::new(transport),
        );
        tokio::spawn(event_loop);

        McpClient {
            client_info: self.client_info,
            capabilities: self.capabilities,
            session,
            router,
            handle,
        }
    }
}

fn install_handlers(
    router: &Router,
    callbacks: &Callbacks,
    sampling: &Option<SamplingHandler>,
    roots: &Option<RootsHandler>,
    elicitation: &Option<ElicitationHandler>,
) {
    if let Some(callback) = &callbacks.tools_changed {
        let callback = Arc::clone(callback);
        router.on_notification("notifications/tools/list_changed", move |_| {
            let callback = Arc::clone(&callback);
            async move { callback() }
        });
    }
    if let Some(callback) = &callbacks.resources_changed {
        let callback = Arc::clone(callback);
        router.on_notification("notifications/resources/list_changed", move |_| {
            let callback = Arc::clone(&callback);
            async move { callback() }
        });
    }
    if let Some(callback) = &callbacks.prompts_changed {
        let callback = Arc::clone(callback);
        router.on_notification("notifications/prompts/list_changed", move |_| {
            let callback = Arc::clone(&callback);
            async move { callback() }
        });
    }
    if let Some(callback) = &callbacks.resource_updated {
        let callback = Arc::clone(callback);
        router.on_notification("notifications/resources/updated", move |params| {
            let callback = Arc::clone(&callback);
            async move {
                match serde_json::from_value::<ResourceUpdatedParams>(params) {
                    Ok(updated) => callback(updated.uri),
                    Err(e) => tracing::warn!(err = %e, "malformed resources/updated notification"),
                }
            }
        });
    }
    if let Some(callback) = &callbacks.log_message {
        let callback = Arc::clone(callback);
        router.on_notification("notifications/message", move |params| {
            let callback = Arc::clone(&callback);
            async move {
                match serde_json::from_value::<LogMessageParams>(params) {
                    Ok(message) => callback(message),
                    Err(e) => tracing::warn!(err = %e, "malformed log notification"),
                }
            }
        });
    }
    if let Some(callback) = &callbacks.progress {
        let callback = Arc::clone(callback);
        router.on_notification("notifications/progress", move |params| {
            let callback = Arc::clone(&callback);
            async move {
                match serde_json::from_value::<ProgressParams>(params) {
                    Ok(progress) => callback(progress),
                    Err(e) => tracing::warn!(err = %e, "malformed progress notification"),
                }
            }
        });
    }

    // Server-originated requests.  Each is gated on the capability this client
    // advertises at initialize time.
    {
        let sampling = sampling.clone();
        router.on_request("sampling/createMessage", move |params| {
            let sampling = sampling.clone();
            async move {
                let Some(handler) = sampling else {
                    return Err(ErrorDetails::method_not_found(
                        "No sampling handler registered",
                        None,
                    ));
                };
                let request: SamplingRequest = serde_json::from_value(params)
                    .map_err(|e| ErrorDetails::invalid_params(e.to_string(), None))?;
                let result = handler(request)
                    .await
                    .map_err(|e| ErrorDetails::internal_error(e.to_string(), None))?;
                serde_json::to_value(result)
                    .map_err(|e| ErrorDetails::internal_error(e.to_string(), None))
            }
        });
        router.require_capability("sampling/createMessage", "sampling");
    }
    {
        let roots = roots.clone();
        router.on_request("roots/list", move |_params| {
            let roots = roots.clone();
            async move {
                let Some(handler) = roots else {
                    return Err(ErrorDetails::method_not_found(
                        "No roots handler registered",
                        None,
                    ));
                };
                let roots = handler()
                    .await
                    .map_err(|e| ErrorDetails::internal_error(e.to_string(), None))?;
                serde_json::to_value(ListRootsResult { roots })
                    .map_err(|e| ErrorDetails::internal_error(e.to_string(), None))
            }
        });
        router.require_capability("roots/list", "roots");
    }
    {
        let elicitation = elicitation.clone();
        router.on_request("elicitation/create", move |params| {
            let elicitation = elicitation.clone();
            async move {
                let Some(handler) = elicitation else {
                    return Err(ErrorDetails::method_not_found(
                        "No elicitation handler registered",
                        None,
                    ));
                };
                let request: ElicitationRequest = serde_json::from_value(params)
                    .map_err(|e| ErrorDetails::invalid_params(e.to_string(), None))?;
                let result = handler(request)
                    .await
                    .map_err(|e| ErrorDetails::internal_error(e.to_string(), None))?;
                serde_json::to_value(result)
                    .map_err(|e| ErrorDetails::internal_error(e.to_string(), None))
            }
        });
        router.require_capability("elicitation/create", "elicitation");
    }

    router.on_request("ping", |_params| async move { Ok(json!({})) });
}

/// The client role of an MCP peer.
#[derive(Clone)]
pub struct McpClient {
    client_info: Implementation,
    capabilities: ClientCapabilities,
    session: Arc<Session>,
    router: Router,
    handle: PeerHandle,
}

impl McpClient {
    pub fn builder(client_info: Implementation) -> ClientBuilder {
        ClientBuilder {
            client_info,
            capabilities: ClientCapabilities::default(),
            peer: PeerConfig::default(),
            callbacks: Callbacks::default(),
            sampling: None,
            roots: None,
            elicitation: None,
        }
    }

    /// Run the initialize exchange: send our info and capabilities, verify the
    /// server's answered protocol version, record the negotiated state, and confirm
    /// with `notifications/initialized`.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        self.session.set_state(SessionState::Initializing);

        let params = InitializeParams {
            protocol_version: version::PROTOCOL_VERSION.to_string(),
            capabilities: self.capabilities.clone(),
            client_info: self.client_info.clone(),
        };
        let result: InitializeResult = self.handle.call_with_params("initialize", params).await?;

        if !version::is_supported(&result.protocol_version) {
            return Err(McpError::UnsupportedProtocolVersion {
                version: result.protocol_version,
            });
        }

        self.session.set_server_capabilities(result.capabilities.clone());
        self.session.set_client_capabilities(self.capabilities.clone());
        self.session.set_protocol_version(result.protocol_version.as_str());
        self.router
            .set_capabilities(result.capabilities.clone(), self.capabilities.clone());
        self.session.set_state(SessionState::Ready);

        self.handle.notify("notifications/initialized").await?;

        tracing::info!(
            server = %result.server_info.name,
            version = %result.server_info.version,
            protocol = %result.protocol_version,
            "session initialized"
        );
        Ok(result)
    }

    // ---- tools ----

    pub async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult> {
        self.handle
            .call_with_params("tools/list", PaginatedParams { cursor })
            .await
    }

    pub async fn call_tool(&self, name: &str, arguments: JsonValue) -> Result<CallToolResult> {
        self.handle
            .call_with_params(
                "tools/call",
                CallToolParams {
                    name: name.to_string(),
                    arguments: Some(arguments),
                },
            )
            .await
    }

    /// Like [`Self::call_tool`], attaching a progress token so the server can emit
    /// `notifications/progress` while the tool runs.
    pub async fn call_tool_with_progress(
        &self,
        name: &str,
        arguments: JsonValue,
        token: ProgressToken,
    ) -> Result<CallToolResult> {
        let params = json!({"name": name, "arguments": arguments});
        let result = self
            .handle
            .call_raw_with_progress("tools/call", params, token)
            .await?;
        serde_json::from_value(result.clone()).map_err(|source| McpError::DeserResponse {
            source,
            type_name: std::any::type_name::<CallToolResult>(),
            response: result,
        })
    }

    // ---- resources ----

    pub async fn list_resources(&self, cursor: Option<String>) -> Result<ListResourcesResult> {
        self.handle
            .call_with_params("resources/list", PaginatedParams { cursor })
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>> {
        let result: ReadResourceResult = self
            .handle
            .call_with_params("resources/read", json!({"uri": uri}))
            .await?;
        Ok(result.contents)
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourceTemplatesResult> {
        self.handle
            .call_with_params("resources/templates/list", PaginatedParams { cursor })
            .await
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<()> {
        let _: JsonValue = self
            .handle
            .call_with_params("resources/subscribe", json!({"uri": uri}))
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<()> {
        let _: JsonValue = self
            .handle
            .call_with_params("resources/unsubscribe", json!({"uri": uri}))
            .await?;
        Ok(())
    }

    // ---- prompts ----

    pub async fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResult> {
        self.handle
            .call_with_params("prompts/list", PaginatedParams { cursor })
            .await
    }

    pub async fn get_prompt(&self, name: &str, arguments: JsonValue) -> Result<GetPromptResult> {
        self.handle
            .call_with_params("prompts/get", json!({"name": name, "arguments": arguments}))
            .await
    }

    // ---- completion ----

    pub async fn complete(
        &self,
        reference: CompletionRef,
        argument_name: &str,
        argument_value: &str,
    ) -> Result<CompletionResult> {
        self.handle
            .call_with_params(
                "completion/complete",
                json!({
                    "ref": reference,
                    "argument": {"name": argument_name, "value": argument_value},
                }),
            )
            .await
    }

    // ---- logging, ping, cancellation ----

    pub async fn set_log_level(&self, level: LogLevel) -> Result<()> {
        let _: JsonValue = self
            .handle
            .call_with_params("logging/setLevel", SetLevelParams { level })
            .await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        let _: JsonValue = self.handle.call("ping").await?;
        Ok(())
    }

    /// Ask the server to abandon an in-flight request.  Fire-and-forget; completion
    /// semantics are the server's business.
    pub async fn cancel_request(&self, request_id: Id, reason: Option<String>) -> Result<()> {
        self.handle
            .notify_with_params("notifications/cancelled", CancelledParams { request_id, reason })
            .await
    }

    // ---- raw escape hatches ----

    /// Invoke a method outside the standard MCP surface.
    pub async fn call_raw(
        &self,
        method: &str,
        params: impl Into<Option<JsonValue>>,
    ) -> Result<JsonValue> {
        self.handle.call_raw(method, params).await
    }

    /// Emit a notification outside the standard MCP surface.
    pub async fn notify_raw(&self, method: &str, params: impl Into<Option<JsonValue>>) -> Result<()> {
        self.handle.notify_raw(method, params).await
    }

    // ---- state ----

    pub fn server_capabilities(&self) -> ServerCapabilities {
        self.session.server_capabilities()
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.session.protocol_version()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.session.state(), SessionState::Closed)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.handle
            .shutdown()
            .await
            .map_err(|message| McpError::transport(std::io::Error::other(message)))
    }

    /// Resolves when the underlying session ends.
    pub async fn closed(&self) {
        let _ = self.handle.closed().await;
    }
}
