mod common;

use common::connect;
use mcpkit::{
    Client, Server, ServiceError,
    model::{
        CreateElicitationRequestParam, CreateElicitationResult, ElicitationAction,
        validate_elicitation_schema,
    },
};
use serde_json::json;

fn schema(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn invalid_schemas_fail_before_sending() {
    let client = Client::default();
    // deliberately no elicitation handler: a validation failure must
    // surface before the wire, so the missing handler is never consulted
    let (server_running, _client_running) = connect(Server::default(), &client).await;

    let string_root = server_running
        .create_elicitation(CreateElicitationRequestParam {
            message: "root must be an object".into(),
            requested_schema: schema(json!({"type": "string"})),
        })
        .await
        .expect_err("string root schema");
    assert!(matches!(string_root, ServiceError::Rejected(_)));

    let nested = server_running
        .create_elicitation(CreateElicitationRequestParam {
            message: "no nested objects".into(),
            requested_schema: schema(json!({
                "type": "object",
                "properties": {"address": {"type": "object", "properties": {}}},
            })),
        })
        .await
        .expect_err("nested object property");
    match nested {
        ServiceError::Rejected(e) => {
            assert_eq!(e.code, mcpkit::model::ErrorCode::INVALID_PARAMS);
        }
        other => panic!("expected a local rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn valid_schema_round_trips_through_the_client_handler() {
    let client = Client::default();
    client.set_elicitation_handler(|params, _ctx| async move {
        assert!(params.requested_schema.contains_key("properties"));
        Ok(CreateElicitationResult {
            action: ElicitationAction::Accept,
            content: Some(json!({"country": "US"})),
        })
    });
    let (server_running, _client_running) = connect(Server::default(), &client).await;

    let result = server_running
        .create_elicitation(CreateElicitationRequestParam {
            message: "pick a country".into(),
            requested_schema: schema(json!({
                "type": "object",
                "properties": {
                    "country": {
                        "type": "string",
                        "enum": ["US", "UK"],
                        "enumNames": ["United States", "United Kingdom"],
                    }
                },
                "required": ["country"],
            })),
        })
        .await
        .expect("valid schema must reach the handler");
    assert_eq!(result.action, ElicitationAction::Accept);
    assert_eq!(result.content, Some(json!({"country": "US"})));
}

#[tokio::test]
async fn missing_handler_is_unsupported_method() {
    let client = Client::default();
    let (server_running, _client_running) = connect(Server::default(), &client).await;

    let error = server_running
        .create_elicitation(CreateElicitationRequestParam {
            message: "anyone there?".into(),
            requested_schema: schema(json!({
                "type": "object",
                "properties": {"ok": {"type": "boolean"}},
            })),
        })
        .await
        .expect_err("no handler registered");
    match error {
        ServiceError::McpError(e) => {
            assert_eq!(e.code, mcpkit::model::ErrorCode::METHOD_NOT_FOUND);
        }
        other => panic!("expected method-not-found from the peer, got {other:?}"),
    }
}

#[test]
fn validator_is_exported_for_reuse() {
    assert!(validate_elicitation_schema(&schema(json!({"type": "object"}))).is_ok());
    assert!(validate_elicitation_schema(&schema(json!({"type": "array"}))).is_err());
}
