//! Shared scaffolding for the integration tests.
#![allow(dead_code)]

use mcplex::{
    ByteStreamTransport, CallToolResult, Implementation, McpServer, ResourceContents,
    ResourceDefinition, ToolDefinition,
};
use serde_json::json;
use tokio::io::DuplexStream;

pub fn init_logging() {
    use std::sync::OnceLock;
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".into()))
            .with_test_writer()
            .init();
    });
}

/// `(client_transport, server_transport)` over an in-process duplex pipe.
pub fn transport_pair() -> (
    ByteStreamTransport<DuplexStream>,
    ByteStreamTransport<DuplexStream>,
) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    (
        ByteStreamTransport::new(client),
        ByteStreamTransport::new(server),
    )
}

pub fn server_info() -> Implementation {
    Implementation::new("test-server", "0.1.0")
}

pub fn client_info() -> Implementation {
    Implementation::new("test-client", "0.1.0")
}

/// A server with an echo tool and one readable, subscribable resource.
pub fn echo_server() -> McpServer {
    McpServer::builder(server_info())
        .instructions("echoes things back")
        .tool(
            ToolDefinition::new("echo").with_description("Echo the text argument"),
            |args| async move {
                let text = args["text"].as_str().unwrap_or_default().to_string();
                Ok(CallToolResult::text(text))
            },
        )
        .resource(ResourceDefinition::new("file:///x", "x"), |uri| async move {
            Ok(vec![ResourceContents::text(uri, "contents of x")])
        })
        .build()
}

/// Tool arguments for the echo tool.
pub fn echo_args(text: &str) -> serde_json::Value {
    json!({"text": text})
}
