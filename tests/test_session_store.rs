mod common;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use common::schema_for_name_argument;
use http::{Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use mcpkit::{
    Server, ServerOptions,
    model::{CallToolResult, Tool},
    transport::{
        session_store::{InMemorySessionStore, SessionStore},
        streamable_http_server::{
            HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID, StreamableHttpServerConfig,
            StreamableHttpService,
        },
    },
};
use serde_json::{Value, json};
use tower_service::Service as _;

type Factory = Box<dyn Fn() -> Result<Server, std::io::Error> + Send + Sync>;
type TestService = StreamableHttpService<Server, Factory>;

fn instance(store: Arc<InMemorySessionStore>) -> TestService {
    let server = Server::new(ServerOptions {
        has_tools: true,
        ..Default::default()
    });
    server.add_tool(
        Tool::new("shared", schema_for_name_argument()),
        |_args, _ctx| async move { Ok(CallToolResult::text("shared")) },
    );
    StreamableHttpService::new(
        Box::new(move || Ok(server.clone())) as Factory,
        StreamableHttpServerConfig {
            session_store: Some(store),
            session_timeout: Some(Duration::from_secs(60)),
            sse_keep_alive: None,
            ..Default::default()
        },
    )
    .with_session_restore(|server, peer, info| {
        server.bind_session(peer, info.session_state.log_level);
    })
}

async fn call(
    service: &TestService,
    request: Request<Full<Bytes>>,
) -> Response<BoxBody<Bytes, std::convert::Infallible>> {
    let mut service = service.clone();
    service.call(request).await.expect("infallible")
}

fn post() -> http::request::Builder {
    Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::ACCEPT, "application/json, text/event-stream")
        .header(header::CONTENT_TYPE, "application/json")
}

async fn first_event(body: &mut BoxBody<Bytes, std::convert::Infallible>) -> Value {
    let mut buffer = String::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("sse event within five seconds")
            .expect("stream must not end before the first event")
            .expect("infallible body");
        if let Some(data) = frame.data_ref() {
            buffer.push_str(std::str::from_utf8(data).expect("utf-8"));
            for line in buffer.lines() {
                if let Some(data) = line.strip_prefix("data: ") {
                    return serde_json::from_str(data).expect("event payload");
                }
            }
        }
    }
}

#[tokio::test]
async fn sessions_recover_across_handler_instances() {
    let store = Arc::new(InMemorySessionStore::new());

    let instance_a = instance(store.clone());
    let instance_b = instance(store.clone());

    // initialize against instance A
    let response = call(
        &instance_a,
        post()
            .body(Full::new(Bytes::from(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": "initialize",
                    "params": {
                        "protocolVersion": "2025-06-18",
                        "capabilities": {},
                        "clientInfo": {"name": "balancer-test", "version": "0.0.1"},
                    },
                })
                .to_string(),
            )))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let sid = response
        .headers()
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .expect("session id")
        .to_string();
    let mut body = response.into_body();
    let init_event = first_event(&mut body).await;
    assert!(init_event["result"]["capabilities"].is_object());

    let response = call(
        &instance_a,
        post()
            .header(HEADER_SESSION_ID, sid.as_str())
            .header(HEADER_PROTOCOL_VERSION, "2025-06-18")
            .body(Full::new(Bytes::from(
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string(),
            )))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // the same session id lands on instance B: it must rehydrate and
    // answer, not 404 and not claim the session is still initializing
    let response = call(
        &instance_b,
        post()
            .header(HEADER_SESSION_ID, sid.as_str())
            .header(HEADER_PROTOCOL_VERSION, "2025-06-18")
            .body(Full::new(Bytes::from(
                json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}).to_string(),
            )))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();
    let event = first_event(&mut body).await;
    assert_eq!(event["id"], json!(2));
    assert_eq!(event["result"]["tools"][0]["name"], json!("shared"));

    // the store kept the session's state across both instances
    let stored = store.get(&sid).await.expect("store read").expect("stored session");
    assert!(stored.session_state.initialized);
}

#[tokio::test]
async fn refcounts_pause_and_resume_the_idle_clock() {
    let store = Arc::new(InMemorySessionStore::new());
    let service = instance(store.clone());

    let response = call(
        &service,
        post()
            .body(Full::new(Bytes::from(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": "initialize",
                    "params": {
                        "protocolVersion": "2025-06-18",
                        "capabilities": {},
                        "clientInfo": {"name": "refs-test", "version": "0.0.1"},
                    },
                })
                .to_string(),
            )))
            .expect("request"),
    )
    .await;
    let sid = response
        .headers()
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .expect("session id")
        .to_string();
    let mut body = response.into_body();
    let _ = first_event(&mut body).await;
    // drain the body so the POST's refcount is released
    drop(body);

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let refs = store
                .get(&sid)
                .await
                .expect("store read")
                .expect("stored session")
                .refs;
            if refs == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("refcount must return to zero after the stream closes");
}
