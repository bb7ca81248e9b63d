//! JSON-RPC 2.0 framing: the envelope types and the codec that maps raw
//! JSON to them.
//!
//! Requests and notifications are method-tagged unions; their payloads are
//! (de)serialised through the [`WireMethod`] switch instead of serde enum
//! tagging so that absent `params` never serialise as `null`. Incoming
//! `result` fields stay raw: the pending-request slot that awaits them knows
//! the expected shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ErrorData, JsonRpcVersion2_0, ProtocolVersion, RequestId};

/// Method-tagged wire form of a request or notification union.
pub trait WireMethod: Sized {
    fn method(&self) -> &'static str;
    fn params(&self) -> Result<Option<Value>, serde_json::Error>;
    fn from_wire(method: &str, params: Option<Value>) -> Result<Self, WireError>;
}

/// Failure to map a method-tagged payload onto its typed union.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown method: {method}")]
    UnknownMethod { method: String },
    #[error("invalid params for {method}: {source}")]
    InvalidParams {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

impl WireError {
    fn into_error_data(self) -> ErrorData {
        match self {
            WireError::UnknownMethod { method } => ErrorData::method_not_found(method),
            WireError::InvalidParams { method, source } => ErrorData::invalid_params(
                format!("invalid params for {method}: {source}"),
                None,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest<Req> {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub request: Req,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification<Not> {
    pub jsonrpc: JsonRpcVersion2_0,
    pub notification: Not,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub error: ErrorData,
}

/// One JSON-RPC message of a fixed direction.
///
/// `Req`/`Not` are the request and notification unions of the sending side.
/// [`JsonRpcMessage::InvalidRequest`] only ever appears on the receiving
/// side: it marks a request whose id was recoverable but whose payload was
/// not, and obliges the receiver to answer with the contained error.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage<Req, Not> {
    Request(JsonRpcRequest<Req>),
    Notification(JsonRpcNotification<Not>),
    Response(JsonRpcResponse),
    Error(JsonRpcError),
    InvalidRequest { id: RequestId, error: ErrorData },
}

impl<Req, Not> JsonRpcMessage<Req, Not> {
    pub fn request(request: Req, id: RequestId) -> Self {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion2_0,
            id,
            request,
        })
    }

    pub fn notification(notification: Not) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion2_0,
            notification,
        })
    }

    pub fn response(result: Value, id: RequestId) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: JsonRpcVersion2_0,
            id,
            result,
        })
    }

    pub fn error(error: ErrorData, id: RequestId) -> Self {
        JsonRpcMessage::Error(JsonRpcError {
            jsonrpc: JsonRpcVersion2_0,
            id,
            error,
        })
    }

    /// The request id, for messages that carry one.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.id),
            JsonRpcMessage::Response(r) => Some(&r.id),
            JsonRpcMessage::Error(e) => Some(&e.id),
            JsonRpcMessage::InvalidRequest { id, .. } => Some(id),
            JsonRpcMessage::Notification(_) => None,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_)
        )
    }

    pub fn into_request(self) -> Option<(Req, RequestId)> {
        match self {
            JsonRpcMessage::Request(r) => Some((r.request, r.id)),
            _ => None,
        }
    }

    pub fn into_notification(self) -> Option<Not> {
        match self {
            JsonRpcMessage::Notification(n) => Some(n.notification),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<(Value, RequestId)> {
        match self {
            JsonRpcMessage::Response(r) => Some((r.result, r.id)),
            _ => None,
        }
    }
}

/// A message that failed to decode.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Not a conforming JSON-RPC object; the connection (or HTTP request)
    /// should be failed with the contained error.
    #[error("malformed message: {0}")]
    Malformed(ErrorData),
    /// A notification whose payload did not decode; droppable.
    #[error("undecodable notification: {0}")]
    Notification(WireError),
}

impl DecodeError {
    pub fn into_error_data(self) -> ErrorData {
        match self {
            DecodeError::Malformed(e) => e,
            DecodeError::Notification(e) => e.into_error_data(),
        }
    }
}

fn parse_id(raw: Option<&Value>) -> Result<Option<RequestId>, ErrorData> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let id: RequestId = serde_json::from_value(value.clone()).map_err(|_| {
                ErrorData::invalid_request("request id must be a string or an integer", None)
            })?;
            // Numeric id 0 is reserved and treated as absent.
            Ok((!id.is_reserved()).then_some(id))
        }
    }
}

impl<Req: WireMethod, Not: WireMethod> JsonRpcMessage<Req, Not> {
    /// Decode a single JSON-RPC object.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut obj) = value else {
            return Err(DecodeError::Malformed(ErrorData::invalid_request(
                "expected a JSON object",
                None,
            )));
        };
        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == "2.0" => {}
            _ => {
                return Err(DecodeError::Malformed(ErrorData::invalid_request(
                    "missing or unsupported jsonrpc version",
                    None,
                )));
            }
        }
        let id = parse_id(obj.get("id")).map_err(DecodeError::Malformed)?;
        let method = match obj.get("method") {
            Some(Value::String(m)) => Some(m.clone()),
            Some(_) => {
                return Err(DecodeError::Malformed(ErrorData::invalid_request(
                    "method must be a string",
                    None,
                )));
            }
            None => None,
        };
        let result = obj.remove("result");
        let error = obj.remove("error");
        if result.is_some() && error.is_some() {
            return Err(DecodeError::Malformed(ErrorData::invalid_request(
                "response carries both result and error",
                None,
            )));
        }

        if let Some(method) = method {
            let params = obj.remove("params");
            return match id {
                Some(id) => match Req::from_wire(&method, params) {
                    Ok(request) => Ok(JsonRpcMessage::request(request, id)),
                    Err(wire_error) => Ok(JsonRpcMessage::InvalidRequest {
                        id,
                        error: wire_error.into_error_data(),
                    }),
                },
                None => Not::from_wire(&method, params)
                    .map(JsonRpcMessage::notification)
                    .map_err(DecodeError::Notification),
            };
        }

        let Some(id) = id else {
            return Err(DecodeError::Malformed(ErrorData::invalid_request(
                "response without an id",
                None,
            )));
        };
        if let Some(error) = error {
            let error: ErrorData = serde_json::from_value(error).map_err(|e| {
                DecodeError::Malformed(ErrorData::invalid_request(
                    format!("malformed error object: {e}"),
                    None,
                ))
            })?;
            return Ok(JsonRpcMessage::error(error, id));
        }
        match result {
            Some(result) => Ok(JsonRpcMessage::response(result, id)),
            None => Err(DecodeError::Malformed(ErrorData::invalid_request(
                "message is neither request, notification nor response",
                None,
            ))),
        }
    }

    /// Decode a message body that may be a single object or, on protocol
    /// revisions that still allow it, a batch array.
    pub fn decode_body(body: &str, version: &ProtocolVersion) -> Result<Vec<Self>, ErrorData> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| ErrorData::parse_error(format!("invalid JSON: {e}"), None))?;
        match value {
            Value::Array(items) => {
                if !version.supports_batching() {
                    return Err(ErrorData::invalid_request(
                        format!("batch messages are not supported on protocol {version}"),
                        None,
                    ));
                }
                if items.is_empty() {
                    return Err(ErrorData::invalid_request("empty batch", None));
                }
                let mut messages = Vec::with_capacity(items.len());
                for item in items {
                    match Self::from_value(item) {
                        Ok(message) => messages.push(message),
                        Err(DecodeError::Notification(e)) => {
                            tracing::debug!("dropping undecodable notification: {e}");
                        }
                        Err(DecodeError::Malformed(e)) => return Err(e),
                    }
                }
                Ok(messages)
            }
            single => match Self::from_value(single) {
                Ok(message) => Ok(vec![message]),
                Err(DecodeError::Notification(e)) => {
                    tracing::debug!("dropping undecodable notification: {e}");
                    Ok(Vec::new())
                }
                Err(DecodeError::Malformed(e)) => Err(e),
            },
        }
    }
}

impl<Req: WireMethod> Serialize for JsonRpcRequest<Req> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let params = self.request.params().map_err(serde::ser::Error::custom)?;
        let len = 3 + usize::from(params.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("jsonrpc", &self.jsonrpc)?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("method", self.request.method())?;
        if let Some(params) = &params {
            map.serialize_entry("params", params)?;
        }
        map.end()
    }
}

impl<Not: WireMethod> Serialize for JsonRpcNotification<Not> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let params = self
            .notification
            .params()
            .map_err(serde::ser::Error::custom)?;
        let len = 2 + usize::from(params.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("jsonrpc", &self.jsonrpc)?;
        map.serialize_entry("method", self.notification.method())?;
        if let Some(params) = &params {
            map.serialize_entry("params", params)?;
        }
        map.end()
    }
}

impl<Req: WireMethod, Not: WireMethod> Serialize for JsonRpcMessage<Req, Not> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcMessage::Request(r) => r.serialize(serializer),
            JsonRpcMessage::Notification(n) => n.serialize(serializer),
            JsonRpcMessage::Response(r) => r.serialize(serializer),
            JsonRpcMessage::Error(e) => e.serialize(serializer),
            // An invalid request re-serialises as the error response it
            // demands; it never travels outbound otherwise.
            JsonRpcMessage::InvalidRequest { id, error } => JsonRpcError {
                jsonrpc: JsonRpcVersion2_0,
                id: id.clone(),
                error: error.clone(),
            }
            .serialize(serializer),
        }
    }
}

impl<'de, Req: WireMethod, Not: WireMethod> Deserialize<'de> for JsonRpcMessage<Req, Not> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::{ClientJsonRpcMessage, ClientRequest, ErrorCode};

    #[test]
    fn request_encodes_without_null_params() {
        let message = ClientJsonRpcMessage::request(ClientRequest::Ping, 1.into());
        let encoded = serde_json::to_string(&message).unwrap();
        assert_eq!(encoded, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        assert!(!encoded.contains("null"));
    }

    #[test]
    fn id_zero_decodes_as_notification() {
        let message: ClientJsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "notifications/initialized",
        }))
        .unwrap();
        assert!(matches!(message, JsonRpcMessage::Notification(_)));
    }

    #[test]
    fn result_and_error_together_are_rejected() {
        let err = ClientJsonRpcMessage::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {},
            "error": {"code": -32000, "message": "x"},
        }))
        .unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn unknown_request_method_becomes_invalid_request() {
        let message = ClientJsonRpcMessage::from_value(json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "tools/unknown",
        }))
        .unwrap();
        match message {
            JsonRpcMessage::InvalidRequest { id, error } => {
                assert_eq!(id, 5.into());
                assert_eq!(error.code, ErrorCode::METHOD_NOT_FOUND);
            }
            other => panic!("expected InvalidRequest, got {other:?}"),
        }
    }

    #[test]
    fn batches_expand_on_legacy_protocols_only() {
        let body = r#"[
            {"jsonrpc":"2.0","id":1,"method":"ping"},
            {"jsonrpc":"2.0","method":"notifications/initialized"}
        ]"#;
        let messages =
            ClientJsonRpcMessage::decode_body(body, &crate::model::ProtocolVersion::V_2025_03_26)
                .unwrap();
        assert_eq!(messages.len(), 2);

        let err =
            ClientJsonRpcMessage::decode_body(body, &crate::model::ProtocolVersion::V_2025_06_18)
                .unwrap_err();
        assert!(err.message.contains("batch"));
    }

    #[test]
    fn response_round_trip() {
        let message = ClientJsonRpcMessage::response(json!({"ok": true}), "a".into());
        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(
            encoded,
            json!({"jsonrpc": "2.0", "id": "a", "result": {"ok": true}})
        );
        let decoded = ClientJsonRpcMessage::from_value(encoded).unwrap();
        assert_eq!(decoded, message);
    }
}
