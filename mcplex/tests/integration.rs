//! End-to-end tests: a client peer and a server peer wired together over an
//! in-process byte-stream transport.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use mcplex::jsonrpc::ErrorCode;
use mcplex::{
    CallToolResult, ClientCapabilities, CompletionResult, Content, ElicitationResult,
    GetPromptResult, LogLevel, McpClient, McpError, McpServer, PeerConfig, ProgressToken,
    PromptDefinition, PromptMessage, ResourceContents, ResourceTemplate, Root, SamplingResult,
    SessionState, ToolDefinition,
};
use serde_json::json;
use tokio::sync::mpsc;

use common::{client_info, echo_args, echo_server, init_logging, transport_pair};

fn basic_client(transport: mcplex::ByteStreamTransport<tokio::io::DuplexStream>) -> McpClient {
    McpClient::builder(client_info()).connect(transport)
}

#[tokio::test]
async fn initialize_exchange_negotiates_version_and_capabilities() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    let server = echo_server();
    let server_task = server.clone();
    tokio::spawn(async move { server_task.serve(server_io).await });

    let client = basic_client(client_io);
    let result = client.initialize().await.unwrap();

    assert_eq!(result.protocol_version, mcplex::PROTOCOL_VERSION);
    assert_eq!(result.server_info.name, "test-server");
    assert_eq!(result.instructions.as_deref(), Some("echoes things back"));

    // capabilities reflect what was registered: a tool, a resource, always logging
    assert_eq!(result.capabilities.tools.as_ref().unwrap()["listChanged"], true);
    assert_eq!(result.capabilities.resources.as_ref().unwrap()["subscribe"], true);
    assert!(result.capabilities.logging.is_some());
    assert!(result.capabilities.prompts.is_none());

    // both sides reach Ready
    assert_eq!(client.state(), SessionState::Ready);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.session_state(), Some(SessionState::Ready));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn echo_tool_call_round_trips() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    let server = echo_server();
    tokio::spawn(async move { server.serve(server_io).await });

    let client = basic_client(client_io);
    client.initialize().await.unwrap();

    let result = client.call_tool("echo", echo_args("hi")).await.unwrap();
    assert!(!result.is_error);
    assert_matches!(&result.content[0], Content::Text { text, .. } if text == "hi");

    // and the exact wire shape of the content element
    let content = serde_json::to_value(&result.content[0]).unwrap();
    assert_eq!(content, json!({"type": "text", "text": "hi"}));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn tool_failures_are_reported_in_band() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    let server = McpServer::builder(common::server_info())
        .tool(ToolDefinition::new("explode"), |_args| async move {
            Err::<CallToolResult, _>(McpError::Bug {
                message: "kaboom".into(),
            })
        })
        .build();
    tokio::spawn(async move { server.serve(server_io).await });

    let client = basic_client(client_io);
    client.initialize().await.unwrap();

    // the call succeeds at the protocol level; the failure is in the result
    let result = client.call_tool("explode", json!({})).await.unwrap();
    assert!(result.is_error);
    assert_matches!(&result.content[0], Content::Text { text, .. } if text.contains("kaboom"));

    // an unknown tool, by contrast, is a protocol-level error
    let err = client.call_tool("missing", json!({})).await.unwrap_err();
    assert_matches!(err, McpError::Method { error, .. } => {
        assert_eq!(error.code, ErrorCode::InvalidParams);
        assert!(error.message.contains("missing"));
    });

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_method_gets_method_not_found_and_session_survives() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    let server = echo_server();
    tokio::spawn(async move { server.serve(server_io).await });

    let client = basic_client(client_io);
    client.initialize().await.unwrap();

    let err = client.call_raw("nope", json!({})).await.unwrap_err();
    assert_matches!(err, McpError::Method { method, error } => {
        assert_eq!(method, "nope");
        assert_eq!(error.code, ErrorCode::MethodNotFound);
        assert!(error.message.starts_with("Method not found"));
    });

    // the session is still Ready and usable
    assert_eq!(client.state(), SessionState::Ready);
    client.ping().await.unwrap();

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn pagination_walks_sixty_tools_deterministically() {
    init_logging();
    let (client_io, server_io) = transport_pair();

    let mut builder = McpServer::builder(common::server_info());
    for n in 0..60 {
        builder = builder.tool(ToolDefinition::new(format!("tool-{n:02}")), |_args| async move {
            Ok(CallToolResult::text("ok"))
        });
    }
    let server = builder.build();
    tokio::spawn(async move { server.serve(server_io).await });

    let client = basic_client(client_io);
    client.initialize().await.unwrap();

    let first = client.list_tools(None).await.unwrap();
    assert_eq!(first.tools.len(), 50);
    let cursor = first.next_cursor.clone().expect("a second page remains");

    let second = client.list_tools(Some(cursor)).await.unwrap();
    assert_eq!(second.tools.len(), 10);
    assert!(second.next_cursor.is_none());

    let names: Vec<String> = first
        .tools
        .iter()
        .chain(second.tools.iter())
        .map(|t| t.name.clone())
        .collect();
    let expected: Vec<String> = (0..60).map(|n| format!("tool-{n:02}")).collect();
    assert_eq!(names, expected);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn resource_subscription_filters_update_notifications() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    let server = echo_server();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(server_io).await });

    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let client = McpClient::builder(client_info())
        .on_resource_updated(move |uri| {
            let _ = updates_tx.send(uri);
        })
        .connect(client_io);
    client.initialize().await.unwrap();

    client.subscribe_resource("file:///x").await.unwrap();

    // subscribed URI: the update arrives
    server.notify_resource_updated("file:///x").await.unwrap();
    let uri = tokio::time::timeout(Duration::from_secs(2), updates_rx.recv())
        .await
        .expect("update should arrive")
        .unwrap();
    assert_eq!(uri, "file:///x");

    // unsubscribed URI: nothing arrives
    server.notify_resource_updated("file:///y").await.unwrap();
    let nothing = tokio::time::timeout(Duration::from_millis(200), updates_rx.recv()).await;
    assert!(nothing.is_err(), "no update expected for file:///y");

    // after unsubscribe, updates for x stop too
    client.unsubscribe_resource("file:///x").await.unwrap();
    server.notify_resource_updated("file:///x").await.unwrap();
    let nothing = tokio::time::timeout(Duration::from_millis(200), updates_rx.recv()).await;
    assert!(nothing.is_err());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn resources_read_and_templates() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    let server = echo_server();
    tokio::spawn(async move { server.serve(server_io).await });

    let client = basic_client(client_io);
    client.initialize().await.unwrap();

    let contents = client.read_resource("file:///x").await.unwrap();
    assert_eq!(contents[0].text.as_deref(), Some("contents of x"));

    let err = client.read_resource("file:///definitely-not-there").await.unwrap_err();
    assert_matches!(err, McpError::Method { error, .. }
        if error.code == ErrorCode::ResourceNotFound);

    let listing = client.list_resources(None).await.unwrap();
    assert_eq!(listing.resources.len(), 1);
    assert_eq!(listing.resources[0].uri, "file:///x");

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn slow_handler_times_out_and_late_response_is_dropped() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    let server = McpServer::builder(common::server_info())
        .tool(ToolDefinition::new("slow"), |_args| async move {
            tokio::time::sleep(Duration::from_millis(800)).await;
            Ok(CallToolResult::text("finally"))
        })
        .tool(ToolDefinition::new("fast"), |_args| async move {
            Ok(CallToolResult::text("quick"))
        })
        .build();
    tokio::spawn(async move { server.serve(server_io).await });

    let client = McpClient::builder(client_info())
        .peer_config(PeerConfig {
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .connect(client_io);
    client.initialize().await.unwrap();

    let err = client.call_tool("slow", json!({})).await.unwrap_err();
    assert_matches!(err, McpError::Timeout { method } if method == "tools/call");

    // wait past the handler's completion so its late response arrives and is dropped
    tokio::time::sleep(Duration::from_millis(800)).await;

    // the session survived both the timeout and the late response
    client.ping().await.unwrap();
    let result = client.call_tool("fast", json!({})).await.unwrap();
    assert_matches!(&result.content[0], Content::Text { text, .. } if text == "quick");

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn capability_gating_denies_unadvertised_surfaces() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    // no prompts registered, so the prompts capability is not advertised
    let server = echo_server();
    tokio::spawn(async move { server.serve(server_io).await });

    let client = basic_client(client_io);
    client.initialize().await.unwrap();

    let err = client.list_prompts(None).await.unwrap_err();
    assert_matches!(err, McpError::Method { error, .. } => {
        assert_eq!(error.code, ErrorCode::InvalidRequest);
        assert!(error.message.contains("prompts/list"));
    });

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn requests_before_initialize_are_rejected_but_ping_is_not() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    let server = echo_server();
    tokio::spawn(async move { server.serve(server_io).await });

    let client = basic_client(client_io);

    // no initialize yet: ping belongs to the pre-ready subset
    client.ping().await.unwrap();

    let err = client.call_raw("tools/list", json!({})).await.unwrap_err();
    assert_matches!(err, McpError::Method { error, .. } => {
        assert_eq!(error.code, ErrorCode::InvalidRequest);
        assert!(error.message.contains("tools/list"));
    });

    // the handshake still works afterwards
    client.initialize().await.unwrap();
    client.list_tools(None).await.unwrap();

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn prompts_and_completion_round_trip() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    let server = McpServer::builder(common::server_info())
        .prompt(
            PromptDefinition {
                name: "greeting".into(),
                title: None,
                description: Some("greet someone".into()),
                arguments: vec![],
            },
            |args| async move {
                let name = args["name"].as_str().unwrap_or("stranger").to_string();
                Ok(GetPromptResult {
                    description: Some("a greeting".into()),
                    messages: vec![PromptMessage {
                        role: "user".into(),
                        content: Content::text(format!("Hello, {name}!")),
                    }],
                })
            },
        )
        .completion(|_reference, argument| async move {
            let candidates = ["alpha", "beta", "gamma"];
            let values: Vec<String> = candidates
                .iter()
                .filter(|c| c.starts_with(&argument.value))
                .map(|c| c.to_string())
                .collect();
            let total = values.len() as u64;
            Ok(CompletionResult {
                values,
                total: Some(total),
                has_more: false,
            })
        })
        .build();
    tokio::spawn(async move { server.serve(server_io).await });

    let client = basic_client(client_io);
    client.initialize().await.unwrap();

    let prompt = client.get_prompt("greeting", json!({"name": "world"})).await.unwrap();
    assert_matches!(&prompt.messages[0].content, Content::Text { text, .. }
        if text == "Hello, world!");

    let completion = client
        .complete(
            mcplex::CompletionRef {
                ref_type: "ref/prompt".into(),
                name: "greeting".into(),
            },
            "name",
            "a",
        )
        .await
        .unwrap();
    assert_eq!(completion.values, vec!["alpha".to_string()]);
    assert!(!completion.has_more);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn logging_respects_the_installed_level() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    let server = echo_server();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(server_io).await });

    let (log_tx, mut log_rx) = mpsc::unbounded_channel();
    let client = McpClient::builder(client_info())
        .on_log_message(move |message| {
            let _ = log_tx.send(message);
        })
        .connect(client_io);
    client.initialize().await.unwrap();

    // default level is info: an info record arrives
    server.log(LogLevel::Info, "test", json!("first")).await.unwrap();
    let message = tokio::time::timeout(Duration::from_secs(2), log_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.data, json!("first"));
    assert_eq!(message.level, LogLevel::Info);

    // raise the floor to error: info records are filtered out at the source
    client.set_log_level(LogLevel::Error).await.unwrap();
    server.log(LogLevel::Info, "test", json!("suppressed")).await.unwrap();
    server.log(LogLevel::Error, "test", json!("second")).await.unwrap();
    let message = tokio::time::timeout(Duration::from_secs(2), log_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.data, json!("second"));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn progress_notifications_reach_the_caller() {
    init_logging();
    let (client_io, server_io) = transport_pair();

    let server = McpServer::builder(common::server_info()).build();
    // a tool that reports progress through the server handle while it works
    let progress_server = server.clone();
    server.add_tool(ToolDefinition::new("work"), move |_args| {
        let server = progress_server.clone();
        async move {
            for step in 1..=3u32 {
                server
                    .send_progress(
                        ProgressToken::Str("job-1".into()),
                        f64::from(step),
                        Some(3.0),
                        None,
                    )
                    .await?;
            }
            Ok(CallToolResult::text("done"))
        }
    });
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(server_io).await });

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let client = McpClient::builder(client_info())
        .on_progress(move |progress| {
            let _ = progress_tx.send(progress);
        })
        .connect(client_io);
    client.initialize().await.unwrap();

    let result = client
        .call_tool_with_progress("work", json!({}), ProgressToken::Str("job-1".into()))
        .await
        .unwrap();
    assert_matches!(&result.content[0], Content::Text { text, .. } if text == "done");

    for expected in 1..=3u32 {
        let progress = tokio::time::timeout(Duration::from_secs(2), progress_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.progress_token, ProgressToken::Str("job-1".into()));
        assert_eq!(progress.progress, f64::from(expected));
        assert_eq!(progress.total, Some(3.0));
    }

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn bidirectional_requests_flow_server_to_client() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    let server = echo_server();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(server_io).await });

    let client = McpClient::builder(client_info())
        .capabilities(
            ClientCapabilities::default()
                .with_sampling()
                .with_roots()
                .with_elicitation(),
        )
        .on_sampling_request(|request| async move {
            assert_eq!(request.messages.len(), 1);
            Ok(SamplingResult {
                role: "assistant".into(),
                content: Content::text("sampled!"),
                model: "test-model".into(),
                stop_reason: Some("endTurn".into()),
            })
        })
        .on_roots_request(|| async move {
            Ok(vec![Root {
                uri: "file:///workspace".into(),
                name: Some("workspace".into()),
            }])
        })
        .on_elicitation_request(|request| async move {
            assert!(request.message.contains("name"));
            Ok(ElicitationResult {
                action: "accept".into(),
                content: Some(json!({"name": "tester"})),
            })
        })
        .connect(client_io);
    client.initialize().await.unwrap();
    // let the server observe notifications/initialized before it originates requests
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sampled = server
        .request_sampling(mcplex::SamplingRequest {
            messages: vec![PromptMessage {
                role: "user".into(),
                content: Content::text("please sample"),
            }],
            model_preferences: None,
            system_prompt: None,
            max_tokens: Some(64),
        })
        .await
        .unwrap();
    assert_eq!(sampled.model, "test-model");

    let roots = server.request_roots().await.unwrap();
    assert_eq!(roots[0].uri, "file:///workspace");

    let elicited = server
        .request_elicitation(mcplex::ElicitationRequest {
            message: "what is your name?".into(),
            requested_schema: json!({"type": "object"}),
        })
        .await
        .unwrap();
    assert_eq!(elicited.action, "accept");

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn server_requests_require_the_client_capability() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    let server = echo_server();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(server_io).await });

    // this client advertises nothing
    let client = basic_client(client_io);
    client.initialize().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = server
        .request_roots()
        .await
        .expect_err("roots capability was not advertised");
    assert_matches!(err, McpError::CapabilityNotAdvertised { capability: "roots" });

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn dynamic_tool_registration_emits_list_changed() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    let server = echo_server();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(server_io).await });

    let changes = Arc::new(AtomicUsize::new(0));
    let changes_counter = Arc::clone(&changes);
    let client = McpClient::builder(client_info())
        .on_tools_changed(move || {
            changes_counter.fetch_add(1, Ordering::SeqCst);
        })
        .connect(client_io);
    client.initialize().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.add_tool(ToolDefinition::new("extra"), |_args| async move {
        Ok(CallToolResult::text("extra"))
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(changes.load(Ordering::SeqCst), 1);

    // the new tool is immediately callable
    let result = client.call_tool("extra", json!({})).await.unwrap();
    assert_matches!(&result.content[0], Content::Text { text, .. } if text == "extra");

    server.remove_tool("extra");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(changes.load(Ordering::SeqCst), 2);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn resource_templates_can_change_while_live() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    let server = echo_server();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(server_io).await });

    let changes = Arc::new(AtomicUsize::new(0));
    let changes_counter = Arc::clone(&changes);
    let client = McpClient::builder(client_info())
        .on_resources_changed(move || {
            changes_counter.fetch_add(1, Ordering::SeqCst);
        })
        .connect(client_io);
    client.initialize().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.add_resource_template(
        ResourceTemplate {
            uri_template: "notes:///{path}".into(),
            name: "notes".into(),
            title: None,
            description: None,
            mime_type: Some("text/plain".into()),
            annotations: None,
        },
        |uri| async move { Ok(vec![ResourceContents::text(uri, "from template")]) },
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(changes.load(Ordering::SeqCst), 1);

    let listing = client.list_resource_templates(None).await.unwrap();
    assert_eq!(listing.resource_templates.len(), 1);
    assert_eq!(listing.resource_templates[0].uri_template, "notes:///{path}");

    // the template now answers reads for matching URIs
    let contents = client.read_resource("notes:///2026/plan").await.unwrap();
    assert_eq!(contents[0].text.as_deref(), Some("from template"));

    server.remove_resource_template("notes:///{path}");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(changes.load(Ordering::SeqCst), 2);

    let listing = client.list_resource_templates(None).await.unwrap();
    assert!(listing.resource_templates.is_empty());
    let err = client.read_resource("notes:///2026/plan").await.unwrap_err();
    assert_matches!(err, McpError::Method { error, .. }
        if error.code == ErrorCode::ResourceNotFound);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn client_cancellation_suppresses_the_response() {
    init_logging();
    let (client_io, server_io) = transport_pair();
    let server = McpServer::builder(common::server_info())
        .tool(ToolDefinition::new("forever"), |_args| async move {
            tokio::time::sleep(Duration::from_secs(300)).await;
            Ok(CallToolResult::text("never"))
        })
        .build();
    tokio::spawn(async move { server.serve(server_io).await });

    let client = McpClient::builder(client_info())
        .peer_config(PeerConfig {
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .connect(client_io);
    client.initialize().await.unwrap();

    // start the call in the background, then cancel it by its id; ids are integer
    // and monotonic, and initialize consumed id 1, so this call holds id 2
    let calling = client.clone();
    let call = tokio::spawn(async move { calling.call_tool("forever", json!({})).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    client
        .cancel_request(mcplex::jsonrpc::Id::Number(2), Some("changed my mind".into()))
        .await
        .unwrap();

    // no response will come; the call ends via the client-side timeout
    let result = tokio::time::timeout(Duration::from_secs(5), call).await.unwrap().unwrap();
    assert_matches!(result.unwrap_err(), McpError::Timeout { .. });

    // the server session is still alive and well
    client.ping().await.unwrap();
    client.shutdown().await.unwrap();
}
