mod common;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use common::schema_for_name_argument;
use http::{Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use mcpkit::{
    Server, ServerOptions, ToolError,
    model::{CallToolResult, LoggingLevel, LoggingMessageNotificationParam, Tool},
    transport::{
        event_store::InMemoryEventStore,
        streamable_http_server::{
            HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID, StreamableHttpServerConfig,
            StreamableHttpService,
        },
    },
};
use serde_json::{Value, json};
use tower_service::Service as _;

type TestService = StreamableHttpService<Server, Box<dyn Fn() -> Result<Server, std::io::Error> + Send + Sync>>;

fn progress_server() -> Server {
    let server = Server::new(ServerOptions {
        has_tools: true,
        ..Default::default()
    });
    server.add_tool(
        Tool::new("work", schema_for_name_argument()),
        |_args, ctx| async move {
            ctx.report_progress(1.0, Some(2.0), Some("msg1".into()))
                .await
                .map_err(|e| ToolError::failure(e.to_string()))?;
            ctx.report_progress(2.0, Some(2.0), Some("msg2".into()))
                .await
                .map_err(|e| ToolError::failure(e.to_string()))?;
            // detached traffic belongs on the background stream
            let background = ctx.peer.detached();
            for message in ["msg3", "msg4"] {
                background
                    .notify_logging_message(LoggingMessageNotificationParam {
                        level: LoggingLevel::Info,
                        logger: None,
                        data: json!(message),
                    })
                    .await
                    .map_err(|e| ToolError::failure(e.to_string()))?;
            }
            Ok(CallToolResult::text("done"))
        },
    );
    server
}

fn service(config: StreamableHttpServerConfig) -> TestService {
    let server = progress_server();
    StreamableHttpService::new(
        Box::new(move || Ok(server.clone())) as Box<dyn Fn() -> Result<Server, std::io::Error> + Send + Sync>,
        config,
    )
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

fn initialize_body() -> String {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": {"name": "http-test", "version": "0.0.1"},
        },
    })
    .to_string()
}

/// Read SSE events (id, data) off a response body until it ends or `max`
/// events arrived.
async fn read_events(
    body: &mut BoxBody<Bytes, std::convert::Infallible>,
    max: usize,
) -> Vec<(Option<String>, Value)> {
    let mut events = Vec::new();
    let mut buffer = String::new();
    while events.len() < max {
        let frame = match tokio::time::timeout(Duration::from_secs(5), body.frame()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => panic!("timed out waiting for an SSE event"),
        };
        let Some(data) = frame.data_ref() else {
            continue;
        };
        buffer.push_str(std::str::from_utf8(data).expect("sse frames are utf-8"));
        while let Some(end) = buffer.find("\n\n") {
            let raw: String = buffer.drain(..end + 2).collect();
            let mut id = None;
            let mut data = None;
            for line in raw.lines() {
                if let Some(value) = line.strip_prefix("id: ") {
                    id = Some(value.to_string());
                } else if let Some(value) = line.strip_prefix("data: ") {
                    data = Some(value.to_string());
                }
            }
            if let Some(data) = data {
                events.push((id, serde_json::from_str(&data).expect("event payload")));
            }
        }
    }
    events
}

fn session_id(response: &Response<BoxBody<Bytes, std::convert::Infallible>>) -> String {
    response
        .headers()
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .expect("session id header")
        .to_string()
}

/// initialize + notifications/initialized, returning the session id.
async fn establish_session(service: &TestService) -> String {
    let response = call(
        service,
        post().body(Full::new(Bytes::from(initialize_body()))).expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let sid = session_id(&response);
    let mut body = response.into_body();
    let events = read_events(&mut body, 1).await;
    assert_eq!(events.len(), 1, "initialize response arrives on the POST stream");
    assert!(events[0].1["result"]["protocolVersion"].is_string());

    let response = call(
        service,
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
    sid
}

#[tokio::test]
async fn initialize_assigns_a_session_and_streams_the_response() {
    let service = service(StreamableHttpServerConfig::default());
    let sid = establish_session(&service).await;
    assert!(!sid.is_empty());
    assert!(!sid.contains('_'), "session ids must stay event-id safe");
}

#[tokio::test]
async fn post_without_both_accept_types_is_rejected() {
    let service = service(StreamableHttpServerConfig::default());
    let response = call(
        &service,
        Request::builder()
            .method("POST")
            .uri("/mcp")
            .header(header::ACCEPT, "application/json")
            .body(Full::new(Bytes::from(initialize_body())))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // wildcards resolve standardly
    let response = call(
        &service,
        Request::builder()
            .method("POST")
            .uri("/mcp")
            .header(header::ACCEPT, "*/*")
            .body(Full::new(Bytes::from(initialize_body())))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unsupported_protocol_version_names_a_supported_one() {
    let service = service(StreamableHttpServerConfig::default());
    let response = call(
        &service,
        post()
            .header(HEADER_PROTOCOL_VERSION, "1999-01-01")
            .body(Full::new(Bytes::from(initialize_body())))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response.into_body().collect().await.expect("body").to_bytes();
    let body = String::from_utf8_lossy(&body);
    assert!(body.contains("2025-06-18"), "must name a supported version: {body}");
}

#[tokio::test]
async fn batches_are_rejected_on_new_protocols_only() {
    let service = service(StreamableHttpServerConfig {
        stateful_mode: false,
        ..Default::default()
    });
    let batch = json!([
        {"jsonrpc": "2.0", "method": "notifications/initialized"},
        {"jsonrpc": "2.0", "method": "notifications/roots/list_changed"},
    ])
    .to_string();

    let response = call(
        &service,
        post()
            .header(HEADER_PROTOCOL_VERSION, "2025-06-18")
            .body(Full::new(Bytes::from(batch.clone())))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response.into_body().collect().await.expect("body").to_bytes();
    assert!(String::from_utf8_lossy(&body).contains("batch"));

    let response = call(
        &service,
        post()
            .header(HEADER_PROTOCOL_VERSION, "2025-03-26")
            .body(Full::new(Bytes::from(batch)))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn unknown_and_missing_sessions_are_rejected() {
    let service = service(StreamableHttpServerConfig::default());
    let list = json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}).to_string();

    let response = call(
        &service,
        post().body(Full::new(Bytes::from(list.clone()))).expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = call(
        &service,
        post()
            .header(HEADER_SESSION_ID, "deadbeef")
            .body(Full::new(Bytes::from(list)))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let service = service(StreamableHttpServerConfig::default());
    let sid = establish_session(&service).await;
    for _ in 0..2 {
        let response = call(
            &service,
            Request::builder()
                .method("DELETE")
                .uri("/mcp")
                .header(HEADER_SESSION_ID, sid.as_str())
                .body(Full::new(Bytes::new()))
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    let response = call(
        &service,
        Request::builder()
            .method("DELETE")
            .uri("/mcp")
            .body(Full::new(Bytes::new()))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stateless_mode_rejects_get_and_serves_posts() {
    let service = service(StreamableHttpServerConfig {
        stateful_mode: false,
        sse_keep_alive: None,
        ..Default::default()
    });

    let response = call(
        &service,
        Request::builder()
            .method("GET")
            .uri("/mcp")
            .header(header::ACCEPT, "text/event-stream")
            .body(Full::new(Bytes::new()))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = call(
        &service,
        post()
            .body(Full::new(Bytes::from(
                json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}).to_string(),
            )))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(HEADER_SESSION_ID).is_none());
    let mut body = response.into_body();
    let events = read_events(&mut body, 1).await;
    assert_eq!(events[0].1["result"]["tools"][0]["name"], json!("work"));
}

#[tokio::test]
async fn post_stream_orders_progress_before_response_and_replays() {
    let store = Arc::new(InMemoryEventStore::default());
    let service = service(StreamableHttpServerConfig {
        event_store: Some(store),
        sse_keep_alive: None,
        ..Default::default()
    });
    let sid = establish_session(&service).await;

    let call_body = json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "tools/call",
        "params": {
            "name": "work",
            "arguments": {"name": "user"},
            "_meta": {"progressToken": 2},
        },
    })
    .to_string();
    let response = call(
        &service,
        post()
            .header(HEADER_SESSION_ID, sid.as_str())
            .header(HEADER_PROTOCOL_VERSION, "2025-06-18")
            .body(Full::new(Bytes::from(call_body)))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();
    // all related messages precede the response, and the stream closes
    // right after it
    let events = read_events(&mut body, 8).await;
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].1["method"], json!("notifications/progress"));
    assert_eq!(events[0].1["params"]["message"], json!("msg1"));
    assert_eq!(events[1].1["params"]["message"], json!("msg2"));
    assert_eq!(
        events[2].1["result"]["content"][0]["text"],
        json!("done")
    );
    let last_progress_id = events[0].0.clone().expect("event ids with a store");

    // replay everything after the first progress event
    let response = call(
        &service,
        Request::builder()
            .method("GET")
            .uri("/mcp")
            .header(header::ACCEPT, "text/event-stream")
            .header(HEADER_SESSION_ID, sid.as_str())
            .header("last-event-id", last_progress_id.as_str())
            .body(Full::new(Bytes::new()))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();
    let replayed = read_events(&mut body, 8).await;
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].1["params"]["message"], json!("msg2"));
    assert!(replayed[1].1["result"].is_object());

    // detached messages wait on the background stream
    let response = call(
        &service,
        Request::builder()
            .method("GET")
            .uri("/mcp")
            .header(header::ACCEPT, "text/event-stream")
            .header(HEADER_SESSION_ID, sid.as_str())
            .body(Full::new(Bytes::new()))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();
    let background = read_events(&mut body, 2).await;
    assert_eq!(background.len(), 2);
    assert_eq!(background[0].1["params"]["data"], json!("msg3"));
    assert_eq!(background[1].1["params"]["data"], json!("msg4"));
}
