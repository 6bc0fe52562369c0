//! A symmetric Model Context Protocol (MCP) peer runtime.
//!
//! MCP is a bidirectional JSON-RPC 2.0 protocol between an AI host (the "client") and
//! a context provider (the "server").  Both roles run the same machinery: an event
//! loop that owns a transport, correlates outbound requests with inbound responses,
//! and routes inbound requests and notifications to registered handlers.  The roles
//! differ only in which methods they register and which they invoke, so this crate
//! exposes one runtime ([`peer`]) with two thin domain surfaces on top:
//! [`McpServer`] and [`McpClient`].
//!
//! Transports: newline-delimited JSON over any byte-stream pair (stdio for
//! subprocess servers, an in-process duplex for tests) and Streamable HTTP (POST for
//! client-to-server, SSE for server-to-client, tied together by `Mcp-Session-Id`).
//!
//! The JSON-RPC message model and codec live in the `mcplex-jsonrpc` crate and are
//! re-exported here under [`jsonrpc`].

pub mod client;
pub mod error;
pub mod peer;
pub mod router;
pub mod session;
pub mod server;
#[cfg(test)]
pub mod testing;
pub mod transport;
pub mod types;
pub mod version;

/// The JSON-RPC message layer this runtime is built on.
pub use mcplex_jsonrpc as jsonrpc;

pub use client::{ClientBuilder, McpClient};
pub use error::{McpError, Result};
pub use peer::{PeerConfig, PeerHandle};
pub use router::Router;
pub use server::{McpServer, ServerBuilder, ServerOptions};
pub use session::{Session, SessionState};
pub use transport::http::{
    HttpClientTransport, HttpServerHandle, HttpServerOptions, HttpServerTransport,
};
pub use transport::{ByteStreamTransport, Link, Transport, TransportEvent};
pub use types::{
    Annotations, CallToolParams, CallToolResult, CancelledParams, ClientCapabilities,
    CompletionArgument, CompletionRef, CompletionResult, Content, ElicitationRequest,
    ElicitationResult, GetPromptResult, Implementation, InitializeParams, InitializeResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListRootsResult,
    ListToolsResult, LogLevel, LogMessageParams, ModelHint, ModelPreferences, PaginatedParams,
    ProgressParams, ProgressToken, PromptArgument, PromptDefinition, PromptMessage,
    ReadResourceResult, ResourceContents, ResourceDefinition, ResourceTemplate,
    ResourceUpdatedParams, Root, SamplingRequest, SamplingResult, ServerCapabilities,
    SetLevelParams, ToolDefinition,
};
pub use version::{PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
