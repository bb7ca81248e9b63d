mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use common::{connect, schema_for_name_argument};
use mcpkit::{
    Client, Server, ServerOptions,
    model::{CallToolResult, Root, Tool},
};

async fn wait_for_count(counter: &AtomicUsize, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while counter.load(Ordering::SeqCst) < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "expected {expected} notifications, saw {}",
            counter.load(Ordering::SeqCst)
        )
    });
}

#[tokio::test]
async fn registry_mutations_emit_one_list_changed_each() {
    let server = Server::new(ServerOptions {
        has_tools: true,
        ..Default::default()
    });
    let client = Client::default();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    client.on_tool_list_changed(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    let (_server_running, client_running) = connect(server.clone(), &client).await;

    server.add_tool(
        Tool::new("greet", schema_for_name_argument()).with_description("first"),
        |_args, _ctx| async move { Ok(CallToolResult::text("hi")) },
    );
    wait_for_count(&seen, 1).await;

    // replacement still counts as exactly one mutation
    server.add_tool(
        Tool::new("greet", schema_for_name_argument()).with_description("second"),
        |_args, _ctx| async move { Ok(CallToolResult::text("hi")) },
    );
    wait_for_count(&seen, 2).await;
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    let tools = client_running.list_all_tools().await.expect("tools/list");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].description.as_deref(), Some("second"));

    server.remove_tool("greet");
    wait_for_count(&seen, 3).await;
    assert!(client_running.list_all_tools().await.expect("list").is_empty());

    // removing a missing entry is not a mutation
    assert!(!server.remove_tool("greet"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn roots_are_queryable_and_fan_out_changes() {
    let server = Server::default();
    let client = Client::default();
    client.add_root(Root {
        uri: "file:///workspace".into(),
        name: Some("workspace".into()),
    });
    let changed = Arc::new(AtomicUsize::new(0));
    {
        let changed = changed.clone();
        server.on_roots_list_changed(move |_peer| {
            let changed = changed.clone();
            async move {
                changed.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    let (server_running, _client_running) = connect(server, &client).await;

    let roots = mcpkit::handler::server::list_all_roots(server_running.peer())
        .await
        .expect("roots/list");
    assert_eq!(roots.roots.len(), 1);
    assert_eq!(roots.roots[0].uri, "file:///workspace");

    client.add_root(Root {
        uri: "file:///scratch".into(),
        name: None,
    });
    wait_for_count(&changed, 1).await;

    let roots = mcpkit::handler::server::list_all_roots(server_running.peer())
        .await
        .expect("roots/list after change");
    assert_eq!(roots.roots.len(), 2);
}
