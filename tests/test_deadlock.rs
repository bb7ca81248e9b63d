mod common;

use std::time::Duration;

use common::{connect, schema_for_name_argument};
use mcpkit::{
    Client, Server, ServerOptions, ToolError,
    model::{
        CallToolRequestParam, CallToolResult, Content, CreateMessageRequestParam,
        CreateMessageResult, Role, SamplingMessage, Tool,
    },
};

/// tool1 calls back into the client, which invokes tool2, which pings the
/// client again. Request dispatch must stay parallel for this chain to
/// terminate.
#[tokio::test]
async fn reentrant_calls_do_not_deadlock() {
    let server = Server::new(ServerOptions {
        has_tools: true,
        ..Default::default()
    });
    server.add_tool(
        Tool::new("tool1", schema_for_name_argument()),
        |_args, ctx| async move {
            let sampled = ctx
                .peer
                .create_message(CreateMessageRequestParam {
                    messages: vec![SamplingMessage {
                        role: Role::User,
                        content: Content::text("go deeper"),
                    }],
                    model_preferences: None,
                    system_prompt: None,
                    include_context: None,
                    temperature: None,
                    max_tokens: 16,
                    stop_sequences: None,
                    metadata: None,
                })
                .await
                .map_err(|e| ToolError::failure(format!("sampling failed: {e}")))?;
            Ok(CallToolResult::text(format!(
                "tool1:{}",
                sampled.content.as_text().unwrap_or_default()
            )))
        },
    );
    server.add_tool(
        Tool::new("tool2", schema_for_name_argument()),
        |_args, ctx| async move {
            ctx.peer
                .ping()
                .await
                .map_err(|e| ToolError::failure(format!("ping failed: {e}")))?;
            Ok(CallToolResult::text("tool2:pong"))
        },
    );

    let client = Client::default();
    client.set_sampling_handler(|_params, ctx| async move {
        let nested = ctx
            .peer
            .call_tool(CallToolRequestParam {
                name: "tool2".into(),
                arguments: None,
                meta: None,
            })
            .await
            .map_err(|e| mcpkit::ErrorData::internal_error(format!("nested call failed: {e}"), None))?;
        Ok(CreateMessageResult {
            role: Role::Assistant,
            content: Content::text(
                nested.content.first().and_then(|c| c.as_text()).unwrap_or(""),
            ),
            model: "test-model".into(),
            stop_reason: Some(CreateMessageResult::STOP_REASON_END_TURN.to_string()),
        })
    });
    let (_server_running, client_running) = connect(server, &client).await;

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client_running.call_tool(CallToolRequestParam {
            name: "tool1".into(),
            arguments: None,
            meta: None,
        }),
    )
    .await
    .expect("the call chain must finish within five seconds")
    .expect("tool1 must succeed");
    assert_eq!(result.content[0].as_text(), Some("tool1:tool2:pong"));
}
