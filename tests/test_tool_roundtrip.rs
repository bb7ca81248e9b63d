mod common;

use common::{connect, schema_for_name_argument};
use mcpkit::{
    Client, Server, ServerOptions, ToolError,
    model::{CallToolRequestParam, CallToolResult, Tool},
};

fn greet_tool(description: &str) -> Tool {
    Tool::new("greet", schema_for_name_argument()).with_description(description)
}

fn arguments(name: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    serde_json::json!({"name": name}).as_object().cloned()
}

#[tokio::test]
async fn greet_round_trip_and_replacement() {
    let server = Server::new(ServerOptions {
        has_tools: true,
        ..Default::default()
    });
    server.add_tool(greet_tool("first"), |args, _ctx| async move {
        let name = args
            .as_ref()
            .and_then(|a| a.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::failure("missing name"))?
            .to_string();
        Ok(CallToolResult::text(format!("hi {name}")))
    });

    let client = Client::default();
    let (_server_running, client_running) = connect(server.clone(), &client).await;

    let result = client_running
        .call_tool(CallToolRequestParam {
            name: "greet".into(),
            arguments: arguments("user"),
            meta: None,
        })
        .await
        .expect("tools/call");
    assert_eq!(result.content.len(), 1);
    assert_eq!(result.content[0].as_text(), Some("hi user"));
    assert!(!result.is_error());

    // registering under the same name replaces the entry in place
    server.add_tool(greet_tool("second"), |_args, _ctx| async move {
        Ok(CallToolResult::text("replaced"))
    });

    let tools = client_running.list_all_tools().await.expect("tools/list");
    let greets: Vec<_> = tools.iter().filter(|t| t.name == "greet").collect();
    assert_eq!(greets.len(), 1);
    assert_eq!(greets[0].description.as_deref(), Some("second"));

    let replaced = client_running
        .call_tool(CallToolRequestParam {
            name: "greet".into(),
            arguments: arguments("user"),
            meta: None,
        })
        .await
        .expect("tools/call after replace");
    assert_eq!(replaced.content[0].as_text(), Some("replaced"));
}

#[tokio::test]
async fn unknown_tool_is_method_not_found() {
    let server = Server::new(ServerOptions {
        has_tools: true,
        ..Default::default()
    });
    let client = Client::default();
    let (_server_running, client_running) = connect(server, &client).await;

    let error = client_running
        .call_tool(CallToolRequestParam {
            name: "missing".into(),
            arguments: None,
            meta: None,
        })
        .await
        .expect_err("unknown tool must fail");
    match error {
        mcpkit::ServiceError::McpError(e) => {
            assert_eq!(e.code, mcpkit::model::ErrorCode::METHOD_NOT_FOUND);
        }
        other => panic!("expected an mcp error, got {other:?}"),
    }
}

#[tokio::test]
async fn business_failure_is_a_successful_tool_error_result() {
    let server = Server::new(ServerOptions {
        has_tools: true,
        ..Default::default()
    });
    server.add_tool(greet_tool("failing"), |_args, _ctx| async move {
        Err::<CallToolResult, _>(ToolError::failure("backend unavailable"))
    });
    let client = Client::default();
    let (_server_running, client_running) = connect(server, &client).await;

    let result = client_running
        .call_tool(CallToolRequestParam {
            name: "greet".into(),
            arguments: arguments("user"),
            meta: None,
        })
        .await
        .expect("business failures still resolve the call");
    assert!(result.is_error());
    assert_eq!(result.content[0].as_text(), Some("backend unavailable"));
}

#[tokio::test]
async fn progress_notifications_arrive_before_the_result() {
    let server = Server::new(ServerOptions {
        has_tools: true,
        ..Default::default()
    });
    server.add_tool(greet_tool("progress"), |_args, ctx| async move {
        for step in 0..2 {
            ctx.report_progress(step as f64, Some(2.0), None)
                .await
                .map_err(|e| ToolError::failure(e.to_string()))?;
        }
        Ok(CallToolResult::text("done"))
    });
    let client = Client::default();
    let (_server_running, client_running) = connect(server, &client).await;

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let result = client_running
        .call_tool_with(
            CallToolRequestParam {
                name: "greet".into(),
                arguments: arguments("user"),
                meta: None,
            },
            mcpkit::PeerRequestOptions {
                ct: None,
                progress_handler: Some(Box::new(move |p| {
                    sink.lock().expect("lock").push(p.progress);
                })),
            },
        )
        .await
        .expect("tools/call");
    assert_eq!(result.content[0].as_text(), Some("done"));
    assert_eq!(*seen.lock().expect("lock"), vec![0.0, 1.0]);
}
