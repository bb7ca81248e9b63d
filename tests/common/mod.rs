use mcpkit::{
    Client, Server,
    service::{RoleClient, RoleServer, RunningService, serve_server},
    transport::io::in_memory_duplex,
};

/// Wire a server and a client together over an in-memory duplex and run
/// the initialize handshake.
pub async fn connect(
    server: Server,
    client: &Client,
) -> (
    RunningService<RoleServer, Server>,
    RunningService<RoleClient, Client>,
) {
    let (client_transport, server_transport) = in_memory_duplex(64);
    let server_task = tokio::spawn(async move { serve_server(server, server_transport).await });
    let client_running = client
        .serve(client_transport)
        .await
        .expect("client handshake");
    let server_running = server_task
        .await
        .expect("server task join")
        .expect("server handshake");
    (server_running, client_running)
}

pub fn schema_for_name_argument() -> serde_json::Map<String, serde_json::Value> {
    serde_json::json!({
        "type": "object",
        "properties": {"name": {"type": "string"}},
        "required": ["name"],
    })
    .as_object()
    .cloned()
    .unwrap_or_default()
}
