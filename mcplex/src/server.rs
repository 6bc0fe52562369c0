//! The server-role domain surface: registries of tools, resources, prompts, and
//! completion, the MCP method table that exposes them, and the server-originated
//! operations (logging, progress, resource-update notifications, and the
//! sampling/elicitation/roots requests that flow back to the client).
//!
//! One `McpServer` value holds the registries; each call to [`McpServer::serve`] binds
//! it to one transport for the lifetime of that session.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::Future;
use futures::future::BoxFuture;
use mcplex_jsonrpc::ErrorDetails;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};

use crate::error::{McpError, Result};
use crate::peer::{PeerConfig, PeerHandle, start_peer};
use crate::router::Router;
use crate::session::{Session, SessionState};
use crate::transport::{Link, Transport};
use crate::types::*;
use crate::version;

pub type ToolHandler =
    Arc<dyn Fn(JsonValue) -> BoxFuture<'static, Result<CallToolResult>> + Send + Sync>;
pub type ResourceReadHandler =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Vec<ResourceContents>>> + Send + Sync>;
pub type PromptGetHandler =
    Arc<dyn Fn(JsonValue) -> BoxFuture<'static, Result<GetPromptResult>> + Send + Sync>;
pub type CompletionHandler = Arc<
    dyn Fn(CompletionRef, CompletionArgument) -> BoxFuture<'static, Result<CompletionResult>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct ServerOptions {
    pub server_info: Implementation,
    pub instructions: Option<String>,
    /// Page size for all list methods.  The protocol puts no bound on pages; this
    /// implementation always emits bounded ones.
    pub page_size: usize,
    pub peer: PeerConfig,
}

impl ServerOptions {
    pub fn new(server_info: Implementation) -> Self {
        Self {
            server_info,
            instructions: None,
            page_size: 50,
            peer: PeerConfig::default(),
        }
    }
}

#[derive(Default)]
struct Registry {
    tools: Vec<ToolDefinition>,
    tool_handlers: HashMap<String, ToolHandler>,
    resources: Vec<ResourceDefinition>,
    resource_handlers: HashMap<String, ResourceReadHandler>,
    resource_templates: Vec<ResourceTemplate>,
    template_handlers: HashMap<String, ResourceReadHandler>,
    prompts: Vec<PromptDefinition>,
    prompt_handlers: HashMap<String, PromptGetHandler>,
    completion: Option<CompletionHandler>,
    /// Resource URIs the connected client has subscribed to.
    subscriptions: HashSet<String>,
}

impl Registry {
    /// Advertise exactly what has been registered.  Logging is always offered.
    fn build_capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: (!self.tools.is_empty()).then(|| json!({"listChanged": true})),
            resources: (!self.resources.is_empty() || !self.resource_templates.is_empty())
                .then(|| json!({"subscribe": true, "listChanged": true})),
            prompts: (!self.prompts.is_empty()).then(|| json!({"listChanged": true})),
            logging: Some(json!({})),
            completions: self.completion.as_ref().map(|_| json!({})),
            experimental: None,
        }
    }

    /// Exact URI match first, then the registered template whose literal prefix (up
    /// to the first `{`) matches.
    fn resource_handler_for(&self, uri: &str) -> Option<ResourceReadHandler> {
        if let Some(handler) = self.resource_handlers.get(uri) {
            return Some(Arc::clone(handler));
        }
        self.template_handlers
            .iter()
            .filter(|(template, _)| {
                let prefix = template.split('{').next().unwrap_or(template.as_str());
                uri.starts_with(prefix)
            })
            .max_by_key(|(template, _)| template.split('{').next().map_or(0, str::len))
            .map(|(_, handler)| Arc::clone(handler))
    }
}

struct Connection {
    session: Arc<Session>,
    handle: PeerHandle,
}

struct ServerInner {
    options: ServerOptions,
    registry: Mutex<Registry>,
    min_log_level: Mutex<LogLevel>,
    current: Mutex<Option<Connection>>,
}

/// Builder for an [`McpServer`], collecting registrations before the first session.
pub struct ServerBuilder {
    options: ServerOptions,
    registry: Registry,
}

impl ServerBuilder {
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.options.instructions = Some(instructions.into());
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.options.page_size = page_size.max(1);
        self
    }

    pub fn peer_config(mut self, config: PeerConfig) -> Self {
        self.options.peer = config;
        self
    }

    pub fn tool<F, Fut>(mut self, definition: ToolDefinition, handler: F) -> Self
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult>> + Send + 'static,
    {
        self.registry.tools.retain(|t| t.name != definition.name);
        self.registry
            .tool_handlers
            .insert(definition.name.clone(), Arc::new(move |args| Box::pin(handler(args))));
        self.registry.tools.push(definition);
        self
    }

    pub fn resource<F, Fut>(mut self, definition: ResourceDefinition, handler: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ResourceContents>>> + Send + 'static,
    {
        self.registry.resources.retain(|r| r.uri != definition.uri);
        self.registry
            .resource_handlers
            .insert(definition.uri.clone(), Arc::new(move |uri| Box::pin(handler(uri))));
        self.registry.resources.push(definition);
        self
    }

    pub fn resource_template<F, Fut>(mut self, template: ResourceTemplate, handler: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ResourceContents>>> + Send + 'static,
    {
        self.registry
            .resource_templates
            .retain(|t| t.uri_template != template.uri_template);
        self.registry
            .template_handlers
            .insert(template.uri_template.clone(), Arc::new(move |uri| Box::pin(handler(uri))));
        self.registry.resource_templates.push(template);
        self
    }

    pub fn prompt<F, Fut>(mut self, definition: PromptDefinition, handler: F) -> Self
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GetPromptResult>> + Send + 'static,
    {
        self.registry.prompts.retain(|p| p.name != definition.name);
        self.registry
            .prompt_handlers
            .insert(definition.name.clone(), Arc::new(move |args| Box::pin(handler(args))));
        self.registry.prompts.push(definition);
        self
    }

    pub fn completion<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(CompletionRef, CompletionArgument) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CompletionResult>> + Send + 'static,
    {
        self.registry.completion = Some(Arc::new(move |r, a| Box::pin(handler(r, a))));
        self
    }

    pub fn build(self) -> McpServer {
        McpServer {
            inner: Arc::new(ServerInner {
                options: self.options,
                registry: Mutex::new(self.registry),
                min_log_level: Mutex::new(LogLevel::Info),
                current: Mutex::new(None),
            }),
        }
    }
}

/// The server role of an MCP peer.
#[derive(Clone)]
pub struct McpServer {
    inner: Arc<ServerInner>,
}

impl McpServer {
    pub fn builder(server_info: Implementation) -> ServerBuilder {
        ServerBuilder {
            options: ServerOptions::new(server_info),
            registry: Registry::default(),
        }
    }

    /// Bind to one transport and run until the session ends.
    pub async fn serve(&self, transport: impl Transport) -> Result<()> {
        let handle = self.connect(transport);
        handle
            .closed()
            .await
            .map_err(|message| McpError::transport(std::io::Error::other(message)))
    }

    /// Bind to one transport without blocking; the session runs in a spawned task.
    pub fn connect(&self, transport: impl Transport) -> PeerHandle {
        let session = Arc::new(Session::new(self.inner.options.peer.request_timeout));
        let router = Router::new();
        self.install_handlers(&router, &session);

        let (event_loop, handle) = start_peer(
            self.inner.options.peer.clone(),
            Arc::clone(&session),
            router,
            Link::new(transport),
        );
        tokio::spawn(event_loop);

        *self.inner.current.lock().unwrap() = Some(Connection {
            session,
            handle: handle.clone(),
        });
        handle
    }

    /// Lifecycle state of the current session, if one exists.
    pub fn session_state(&self) -> Option<SessionState> {
        self.inner
            .current
            .lock()
            .unwrap()
            .as_ref()
            .map(|conn| conn.session.state())
    }

    /// Whether a session is currently live.
    pub fn is_running(&self) -> bool {
        self.inner
            .current
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|conn| conn.session.state() != SessionState::Closed)
    }

    /// Tear the current session down and wait for its event loop to drain.
    pub async fn shutdown(&self) -> Result<()> {
        let connection = self.inner.current.lock().unwrap().take();
        if let Some(connection) = connection {
            connection
                .handle
                .shutdown()
                .await
                .map_err(|message| McpError::transport(std::io::Error::other(message)))?;
        }
        Ok(())
    }

    // ---- dynamic registration ----

    pub fn add_tool<F, Fut>(&self, definition: ToolDefinition, handler: F)
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult>> + Send + 'static,
    {
        {
            let mut registry = self.inner.registry.lock().unwrap();
            registry.tools.retain(|t| t.name != definition.name);
            registry
                .tool_handlers
                .insert(definition.name.clone(), Arc::new(move |args| Box::pin(handler(args))));
            registry.tools.push(definition);
        }
        self.notify_if_ready("notifications/tools/list_changed");
    }

    pub fn remove_tool(&self, name: &str) {
        {
            let mut registry = self.inner.registry.lock().unwrap();
            registry.tools.retain(|t| t.name != name);
            registry.tool_handlers.remove(name);
        }
        self.notify_if_ready("notifications/tools/list_changed");
    }

    pub fn add_resource<F, Fut>(&self, definition: ResourceDefinition, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ResourceContents>>> + Send + 'static,
    {
        {
            let mut registry = self.inner.registry.lock().unwrap();
            registry.resources.retain(|r| r.uri != definition.uri);
            registry
                .resource_handlers
                .insert(definition.uri.clone(), Arc::new(move |uri| Box::pin(handler(uri))));
            registry.resources.push(definition);
        }
        self.notify_if_ready("notifications/resources/list_changed");
    }

    pub fn remove_resource(&self, uri: &str) {
        {
            let mut registry = self.inner.registry.lock().unwrap();
            registry.resources.retain(|r| r.uri != uri);
            registry.resource_handlers.remove(uri);
        }
        self.notify_if_ready("notifications/resources/list_changed");
    }

    pub fn add_resource_template<F, Fut>(&self, template: ResourceTemplate, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ResourceContents>>> + Send + 'static,
    {
        {
            let mut registry = self.inner.registry.lock().unwrap();
            registry
                .resource_templates
                .retain(|t| t.uri_template != template.uri_template);
            registry
                .template_handlers
                .insert(template.uri_template.clone(), Arc::new(move |uri| Box::pin(handler(uri))));
            registry.resource_templates.push(template);
        }
        self.notify_if_ready("notifications/resources/list_changed");
    }

    pub fn remove_resource_template(&self, uri_template: &str) {
        {
            let mut registry = self.inner.registry.lock().unwrap();
            registry
                .resource_templates
                .retain(|t| t.uri_template != uri_template);
            registry.template_handlers.remove(uri_template);
        }
        self.notify_if_ready("notifications/resources/list_changed");
    }

    pub fn add_prompt<F, Fut>(&self, definition: PromptDefinition, handler: F)
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GetPromptResult>> + Send + 'static,
    {
        {
            let mut registry = self.inner.registry.lock().unwrap();
            registry.prompts.retain(|p| p.name != definition.name);
            registry
                .prompt_handlers
                .insert(definition.name.clone(), Arc::new(move |args| Box::pin(handler(args))));
            registry.prompts.push(definition);
        }
        self.notify_if_ready("notifications/prompts/list_changed");
    }

    pub fn remove_prompt(&self, name: &str) {
        {
            let mut registry = self.inner.registry.lock().unwrap();
            registry.prompts.retain(|p| p.name != name);
            registry.prompt_handlers.remove(name);
        }
        self.notify_if_ready("notifications/prompts/list_changed");
    }

    // ---- server-originated traffic ----

    /// Emit a `notifications/message` log record, subject to the level the client
    /// installed via `logging/setLevel` (default `info`).
    pub async fn log(&self, level: LogLevel, logger: impl Into<String>, data: JsonValue) -> Result<()> {
        if level < *self.inner.min_log_level.lock().unwrap() {
            return Ok(());
        }
        let Some(handle) = self.live_handle() else {
            return Ok(());
        };
        handle
            .notify_with_params(
                "notifications/message",
                LogMessageParams {
                    level,
                    logger: Some(logger.into()),
                    data,
                },
            )
            .await
    }

    pub async fn send_progress(
        &self,
        token: ProgressToken,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<()> {
        let handle = self.live_handle().ok_or(McpError::TransportClosed)?;
        handle
            .notify_with_params(
                "notifications/progress",
                ProgressParams {
                    progress_token: token,
                    progress,
                    total,
                    message,
                },
            )
            .await
    }

    /// Emit `notifications/resources/updated` for a URI, but only if the client has
    /// subscribed to it.
    pub async fn notify_resource_updated(&self, uri: &str) -> Result<()> {
        let subscribed = self
            .inner
            .registry
            .lock()
            .unwrap()
            .subscriptions
            .contains(uri);
        if !subscribed {
            return Ok(());
        }
        let Some(handle) = self.live_handle() else {
            return Ok(());
        };
        handle
            .notify_with_params(
                "notifications/resources/updated",
                ResourceUpdatedParams { uri: uri.to_string() },
            )
            .await
    }

    /// Ask the connected client to run model inference.  Requires the client to have
    /// advertised the `sampling` capability at initialize time.
    pub async fn request_sampling(&self, request: SamplingRequest) -> Result<SamplingResult> {
        let handle = self.ready_handle_with(|caps| caps.sampling.is_some(), "sampling")?;
        handle.call_with_params("sampling/createMessage", request).await
    }

    /// Ask the connected client to elicit structured input from its user.
    pub async fn request_elicitation(&self, request: ElicitationRequest) -> Result<ElicitationResult> {
        let handle = self.ready_handle_with(|caps| caps.elicitation.is_some(), "elicitation")?;
        handle.call_with_params("elicitation/create", request).await
    }

    /// Ask the connected client for its filesystem roots.
    pub async fn request_roots(&self) -> Result<Vec<Root>> {
        let handle = self.ready_handle_with(|caps| caps.roots.is_some(), "roots")?;
        let result: ListRootsResult = handle.call("roots/list").await?;
        Ok(result.roots)
    }

    // ---- internals ----

    fn live_handle(&self) -> Option<PeerHandle> {
        self.inner
            .current
            .lock()
            .unwrap()
            .as_ref()
            .filter(|conn| conn.session.state() != SessionState::Closed)
            .map(|conn| conn.handle.clone())
    }

    /// Server-originated requests are only legal once the session is Ready and the
    /// client advertised the matching capability.
    fn ready_handle_with(
        &self,
        has_capability: impl Fn(&ClientCapabilities) -> bool,
        capability: &'static str,
    ) -> Result<PeerHandle> {
        let current = self.inner.current.lock().unwrap();
        let connection = current.as_ref().ok_or(McpError::TransportClosed)?;
        if connection.session.state() != SessionState::Ready {
            return Err(McpError::TransportClosed);
        }
        if !has_capability(&connection.session.client_capabilities()) {
            return Err(McpError::CapabilityNotAdvertised { capability });
        }
        Ok(connection.handle.clone())
    }

    fn notify_if_ready(&self, method: &'static str) {
        let Some(handle) = self.live_handle() else { return };
        if handle.session().state() != SessionState::Ready {
            return;
        }
        tokio::spawn(async move {
            if let Err(e) = handle.notify(method).await {
                tracing::debug!(method, err = %e, "list-changed notification not delivered");
            }
        });
    }

    fn install_handlers(&self, router: &Router, session: &Arc<Session>) {
        // initialize: negotiate the version, record the client's capabilities, and
        // answer with what this server can do.
        {
            let inner = Arc::clone(&self.inner);
            let session = Arc::clone(session);
            router.on_request("initialize", move |params| {
                let inner = Arc::clone(&inner);
                let session = Arc::clone(&session);
                async move {
                    let params: InitializeParams = serde_json::from_value(params)
                        .map_err(|e| ErrorDetails::invalid_params(e.to_string(), None))?;

                    tracing::info!(
                        client = %params.client_info.name,
                        version = %params.client_info.version,
                        requested = %params.protocol_version,
                        "initialize received"
                    );

                    let negotiated = version::negotiate(&params.protocol_version);
                    session.set_client_capabilities(params.capabilities);
                    session.set_protocol_version(negotiated);
                    session.set_state(SessionState::Initializing);

                    let capabilities = inner.registry.lock().unwrap().build_capabilities();
                    session.set_server_capabilities(capabilities.clone());

                    to_result(InitializeResult {
                        protocol_version: negotiated.to_string(),
                        capabilities,
                        server_info: inner.options.server_info.clone(),
                        instructions: inner.options.instructions.clone(),
                    })
                }
            });
        }

        // notifications/initialized: the client confirmed the handshake; open the
        // full dispatch table by installing the negotiated capabilities.
        {
            let session = Arc::clone(session);
            let router_for_caps = router.clone();
            router.on_notification("notifications/initialized", move |_params| {
                let session = Arc::clone(&session);
                let router = router_for_caps.clone();
                async move {
                    session.set_state(SessionState::Ready);
                    router.set_capabilities(session.server_capabilities(), session.client_capabilities());
                }
            });
        }

        router.on_request("ping", |_params| async move { Ok(json!({})) });

        // tools
        {
            let inner = Arc::clone(&self.inner);
            router.on_request("tools/list", move |params| {
                let inner = Arc::clone(&inner);
                async move {
                    let page: PaginatedParams = serde_json::from_value(params).unwrap_or_default();
                    let registry = inner.registry.lock().unwrap();
                    let (tools, next_cursor) =
                        paginate(&registry.tools, page.cursor.as_deref(), inner.options.page_size);
                    to_result(ListToolsResult { tools, next_cursor })
                }
            });
        }
        {
            let inner = Arc::clone(&self.inner);
            router.on_request("tools/call", move |params| {
                let inner = Arc::clone(&inner);
                async move {
                    let params: CallToolParams = serde_json::from_value(params)
                        .map_err(|e| ErrorDetails::invalid_params(e.to_string(), None))?;
                    let handler = inner
                        .registry
                        .lock()
                        .unwrap()
                        .tool_handlers
                        .get(&params.name)
                        .cloned();
                    let Some(handler) = handler else {
                        return Err(ErrorDetails::invalid_params(
                            format!("Unknown tool: {}", params.name),
                            None,
                        ));
                    };

                    let arguments = params.arguments.unwrap_or_else(|| json!({}));
                    // Tool-level failures are reported in-band as an isError result,
                    // not as a JSON-RPC error.
                    let result = match handler(arguments).await {
                        Ok(result) => result,
                        Err(e) => CallToolResult::error(e.to_string()),
                    };
                    to_result(result)
                }
            });
        }

        // resources
        {
            let inner = Arc::clone(&self.inner);
            router.on_request("resources/list", move |params| {
                let inner = Arc::clone(&inner);
                async move {
                    let page: PaginatedParams = serde_json::from_value(params).unwrap_or_default();
                    let registry = inner.registry.lock().unwrap();
                    let (resources, next_cursor) =
                        paginate(&registry.resources, page.cursor.as_deref(), inner.options.page_size);
                    to_result(ListResourcesResult { resources, next_cursor })
                }
            });
        }
        {
            let inner = Arc::clone(&self.inner);
            router.on_request("resources/templates/list", move |params| {
                let inner = Arc::clone(&inner);
                async move {
                    let page: PaginatedParams = serde_json::from_value(params).unwrap_or_default();
                    let registry = inner.registry.lock().unwrap();
                    let (resource_templates, next_cursor) = paginate(
                        &registry.resource_templates,
                        page.cursor.as_deref(),
                        inner.options.page_size,
                    );
                    to_result(ListResourceTemplatesResult {
                        resource_templates,
                        next_cursor,
                    })
                }
            });
        }
        {
            let inner = Arc::clone(&self.inner);
            router.on_request("resources/read", move |params| {
                let inner = Arc::clone(&inner);
                async move {
                    let uri = required_string(&params, "uri")?;
                    let handler = inner.registry.lock().unwrap().resource_handler_for(&uri);
                    let Some(handler) = handler else {
                        return Err(ErrorDetails::resource_not_found(
                            format!("Resource not found: {uri}"),
                            None,
                        ));
                    };
                    let contents = handler(uri)
                        .await
                        .map_err(|e| ErrorDetails::internal_error(e.to_string(), None))?;
                    to_result(ReadResourceResult { contents })
                }
            });
        }
        {
            let inner = Arc::clone(&self.inner);
            router.on_request("resources/subscribe", move |params| {
                let inner = Arc::clone(&inner);
                async move {
                    let uri = required_string(&params, "uri")?;
                    inner.registry.lock().unwrap().subscriptions.insert(uri);
                    Ok(json!({}))
                }
            });
        }
        {
            let inner = Arc::clone(&self.inner);
            router.on_request("resources/unsubscribe", move |params| {
                let inner = Arc::clone(&inner);
                async move {
                    let uri = required_string(&params, "uri")?;
                    inner.registry.lock().unwrap().subscriptions.remove(&uri);
                    Ok(json!({}))
                }
            });
        }

        // prompts
        {
            let inner = Arc::clone(&self.inner);
            router.on_request("prompts/list", move |params| {
                let inner = Arc::clone(&inner);
                async move {
                    let page: PaginatedParams = serde_json::from_value(params).unwrap_or_default();
                    let registry = inner.registry.lock().unwrap();
                    let (prompts, next_cursor) =
                        paginate(&registry.prompts, page.cursor.as_deref(), inner.options.page_size);
                    to_result(ListPromptsResult { prompts, next_cursor })
                }
            });
        }
        {
            let inner = Arc::clone(&self.inner);
            router.on_request("prompts/get", move |params| {
                let inner = Arc::clone(&inner);
                async move {
                    let name = required_string(&params, "name")?;
                    let handler = inner
                        .registry
                        .lock()
                        .unwrap()
                        .prompt_handlers
                        .get(&name)
                        .cloned();
                    let Some(handler) = handler else {
                        return Err(ErrorDetails::invalid_params(
                            format!("Unknown prompt: {name}"),
                            None,
                        ));
                    };
                    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                    let result = handler(arguments)
                        .await
                        .map_err(|e| ErrorDetails::internal_error(e.to_string(), None))?;
                    to_result(result)
                }
            });
        }

        // completion
        {
            let inner = Arc::clone(&self.inner);
            router.on_request("completion/complete", move |params| {
                let inner = Arc::clone(&inner);
                async move {
                    let handler = inner.registry.lock().unwrap().completion.clone();
                    let Some(handler) = handler else {
                        return Err(ErrorDetails::method_not_found(
                            "No completion handler registered",
                            None,
                        ));
                    };
                    let reference: CompletionRef =
                        serde_json::from_value(params.get("ref").cloned().unwrap_or_default())
                            .map_err(|e| ErrorDetails::invalid_params(e.to_string(), None))?;
                    let argument: CompletionArgument =
                        serde_json::from_value(params.get("argument").cloned().unwrap_or_default())
                            .map_err(|e| ErrorDetails::invalid_params(e.to_string(), None))?;
                    let result = handler(reference, argument)
                        .await
                        .map_err(|e| ErrorDetails::internal_error(e.to_string(), None))?;
                    to_result(result)
                }
            });
        }

        // logging
        {
            let inner = Arc::clone(&self.inner);
            router.on_request("logging/setLevel", move |params| {
                let inner = Arc::clone(&inner);
                async move {
                    let params: SetLevelParams = serde_json::from_value(params)
                        .map_err(|e| ErrorDetails::invalid_params(e.to_string(), None))?;
                    *inner.min_log_level.lock().unwrap() = params.level;
                    Ok(json!({}))
                }
            });
        }

        // Capability gates for everything above that depends on a registration.
        for method in ["tools/list", "tools/call"] {
            router.require_capability(method, "tools");
        }
        for method in [
            "resources/list",
            "resources/read",
            "resources/templates/list",
            "resources/subscribe",
            "resources/unsubscribe",
        ] {
            router.require_capability(method, "resources");
        }
        for method in ["prompts/list", "prompts/get"] {
            router.require_capability(method, "prompts");
        }
        router.require_capability("completion/complete", "completions");
        router.require_capability("logging/setLevel", "logging");
    }
}

fn to_result<T: Serialize>(value: T) -> std::result::Result<JsonValue, ErrorDetails> {
    serde_json::to_value(value)
        .map_err(|e| ErrorDetails::internal_error(format!("Error serializing result: {e}"), None))
}

fn required_string(params: &JsonValue, key: &str) -> std::result::Result<String, ErrorDetails> {
    params
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| ErrorDetails::invalid_params(format!("Missing required parameter: {key}"), None))
}

/// Offset pagination with opaque decimal cursors.  An unparseable cursor starts from
/// the beginning; a cursor past the end yields an empty final page.
fn paginate<T: Clone>(items: &[T], cursor: Option<&str>, page_size: usize) -> (Vec<T>, Option<String>) {
    let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
    if start >= items.len() {
        return (Vec::new(), None);
    }
    let end = (start + page_size).min(items.len());
    let next = (end < items.len()).then(|| end.to_string());
    (items[start..end].to_vec(), next)
}
