mod common;

use std::time::Duration;

use common::{connect, schema_for_name_argument};
use mcpkit::{
    Client, PeerRequestOptions, Server, ServerOptions, ServiceError, ToolError,
    model::{CallToolRequestParam, CallToolResult, Tool},
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn cancelling_a_call_cancels_the_remote_handler() {
    let server = Server::new(ServerOptions {
        has_tools: true,
        ..Default::default()
    });
    let (observed_tx, mut observed_rx) = tokio::sync::mpsc::unbounded_channel();
    server.add_tool(
        Tool::new("block", schema_for_name_argument()),
        move |_args, ctx| {
            let observed = observed_tx.clone();
            async move {
                // park until the peer's notifications/cancelled fires the
                // context token
                ctx.ct.cancelled().await;
                let _ = observed.send(());
                Err::<CallToolResult, _>(ToolError::failure("cancelled"))
            }
        },
    );
    let client = Client::default();
    let (_server_running, client_running) = connect(server, &client).await;

    let ct = CancellationToken::new();
    let cancel = ct.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client_running.call_tool_with(
            CallToolRequestParam {
                name: "block".into(),
                arguments: None,
                meta: None,
            },
            PeerRequestOptions::cancellable(ct),
        ),
    )
    .await
    .expect("call must resolve within five seconds");
    assert!(matches!(result, Err(ServiceError::Cancelled)));

    // the peer received notifications/cancelled and fired the handler's
    // context
    tokio::time::timeout(Duration::from_secs(5), observed_rx.recv())
        .await
        .expect("handler must observe cancellation within five seconds")
        .expect("handler signal");
}

#[tokio::test]
async fn session_close_fails_outstanding_calls() {
    let server = Server::new(ServerOptions {
        has_tools: true,
        ..Default::default()
    });
    server.add_tool(
        Tool::new("hang", schema_for_name_argument()),
        |_args, ctx| async move {
            ctx.ct.cancelled().await;
            Err::<CallToolResult, _>(ToolError::failure("torn down"))
        },
    );
    let client = Client::default();
    let (server_running, client_running) = connect(server, &client).await;

    let call = tokio::spawn(async move {
        client_running
            .call_tool(CallToolRequestParam {
                name: "hang".into(),
                arguments: None,
                meta: None,
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    server_running.cancel().await.expect("server shutdown");

    let result = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("call must resolve after session close")
        .expect("task join");
    assert!(matches!(
        result,
        Err(ServiceError::TransportClosed) | Err(ServiceError::McpError(_))
    ));
}
