//! Data types of the Model Context Protocol.
//!
//! The module is split in two layers: the JSON-RPC framing layer
//! ([`JsonRpcMessage`] and friends, serialised by [`wire`]) and the MCP
//! method layer (the request/notification unions and their parameter
//! types). Responses carry their `result` as a raw [`serde_json::Value`] on
//! the wire; typed decoding happens at the call site that knows which
//! request the response answers.

use std::{borrow::Cow, collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod capabilities;
mod content;
mod elicitation;
mod prompt;
mod resource;
mod sampling;
mod tool;
pub mod wire;

pub use capabilities::*;
pub use content::*;
pub use elicitation::*;
pub use prompt::*;
pub use resource::*;
pub use sampling::*;
pub use tool::*;
pub use wire::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    WireMethod,
};

/// A JSON object as MCP passes them around.
pub type JsonObject = serde_json::Map<String, Value>;

/// The `"jsonrpc": "2.0"` marker field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion2_0;

impl Serialize for JsonRpcVersion2_0 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version: Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        if version == "2.0" {
            Ok(JsonRpcVersion2_0)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported JSON-RPC version: {version}"
            )))
        }
    }
}

/// A string or an integer. Request ids and progress tokens are this shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(i64),
    String(Arc<str>),
}

impl NumberOrString {
    /// JSON-RPC reserves the numeric id 0 as "absent".
    pub fn is_reserved(&self) -> bool {
        matches!(self, NumberOrString::Number(0))
    }
}

impl std::fmt::Display for NumberOrString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumberOrString::Number(n) => n.fmt(f),
            NumberOrString::String(s) => s.fmt(f),
        }
    }
}

impl From<i64> for NumberOrString {
    fn from(value: i64) -> Self {
        NumberOrString::Number(value)
    }
}

impl From<String> for NumberOrString {
    fn from(value: String) -> Self {
        NumberOrString::String(value.into())
    }
}

impl From<&str> for NumberOrString {
    fn from(value: &str) -> Self {
        NumberOrString::String(value.into())
    }
}

pub type RequestId = NumberOrString;

/// Opaque token correlating progress notifications with a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressToken(pub NumberOrString);

/// The `_meta` object attached to request params.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Meta(pub JsonObject);

impl Meta {
    pub fn progress_token(&self) -> Option<ProgressToken> {
        self.0
            .get("progressToken")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_progress_token(&mut self, token: ProgressToken) {
        let value = match &token.0 {
            NumberOrString::Number(n) => Value::from(*n),
            NumberOrString::String(s) => Value::from(s.as_ref()),
        };
        self.0.insert("progressToken".to_string(), value);
    }
}

/// A protocol revision, ordered by date.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(Cow<'static, str>);

impl ProtocolVersion {
    pub const V_2024_11_05: Self = Self(Cow::Borrowed("2024-11-05"));
    pub const V_2025_03_26: Self = Self(Cow::Borrowed("2025-03-26"));
    pub const V_2025_06_18: Self = Self(Cow::Borrowed("2025-06-18"));
    pub const LATEST: Self = Self::V_2025_06_18;

    pub const SUPPORTED: &'static [Self] =
        &[Self::V_2024_11_05, Self::V_2025_03_26, Self::V_2025_06_18];

    pub fn is_supported(&self) -> bool {
        Self::SUPPORTED.contains(self)
    }

    /// Whether top-level batch arrays are still legal on this revision.
    pub fn supports_batching(&self) -> bool {
        *self < Self::V_2025_06_18
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ProtocolVersion {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Cow::Owned(s.to_string())))
    }
}

/// A JSON-RPC error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);
    /// Domain code for a missing resource, outside the reserved -32xxx band.
    pub const RESOURCE_NOT_FOUND: Self = Self(-1002);
}

/// The error object of a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorData {
    pub fn new(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        data: Option<Value>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message, data)
    }

    pub fn invalid_request(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message, data)
    }

    pub fn method_not_found(method: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
            None,
        )
    }

    pub fn invalid_params(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message, data)
    }

    pub fn internal_error(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message, data)
    }

    pub fn resource_not_found(message: impl Into<Cow<'static, str>>, data: Option<Value>) -> Self {
        Self::new(ErrorCode::RESOURCE_NOT_FOUND, message, data)
    }
}

/// Name and version a peer announces about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Implementation {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Default for Implementation {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
        }
    }
}

/// Params of the `initialize` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestParam {
    pub protocol_version: ProtocolVersion,
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

impl Default for InitializeRequestParam {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ClientCapabilities::default(),
            client_info: Implementation::default(),
        }
    }
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: ProtocolVersion,
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

pub type ClientInfo = InitializeRequestParam;
pub type ServerInfo = InitializeResult;

/// Opaque pagination cursor.
pub type Cursor = String;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedRequestParam {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// Serialises as `{}`; the result of requests that return nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyResult {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledNotificationParam {
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressNotificationParam {
    pub progress_token: ProgressToken,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Severity levels of `notifications/message`, least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLevelRequestParam {
    pub level: LoggingLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingMessageNotificationParam {
    pub level: LoggingLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    pub data: Value,
}

/// A client-exposed root the server may operate under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Root {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRootsResult {
    pub roots: Vec<Root>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

// ---------------------------------------------------------------------------
// completion
// ---------------------------------------------------------------------------

/// What a completion request completes against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CompletionReference {
    #[serde(rename = "ref/prompt")]
    Prompt { name: String },
    #[serde(rename = "ref/resource")]
    Resource { uri: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionArgument {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequestParam {
    #[serde(rename = "ref")]
    pub reference: CompletionReference,
    pub argument: CompletionArgument,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<CompletionContext>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub values: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_more: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResult {
    pub completion: Completion,
}

// ---------------------------------------------------------------------------
// method unions
// ---------------------------------------------------------------------------

macro_rules! wire_params {
    ($params:expr) => {
        Some(serde_json::to_value($params)?)
    };
}

fn parse_params<T: serde::de::DeserializeOwned>(
    method: &str,
    params: Option<Value>,
) -> Result<T, wire::WireError> {
    let params = params.unwrap_or(Value::Object(JsonObject::new()));
    serde_json::from_value(params).map_err(|e| wire::WireError::InvalidParams {
        method: method.to_string(),
        source: e,
    })
}

fn parse_opt_params<T: serde::de::DeserializeOwned>(
    method: &str,
    params: Option<Value>,
) -> Result<Option<T>, wire::WireError> {
    match params {
        None | Some(Value::Null) => Ok(None),
        Some(params) => serde_json::from_value(params)
            .map(Some)
            .map_err(|e| wire::WireError::InvalidParams {
                method: method.to_string(),
                source: e,
            }),
    }
}

/// Requests a client may send to a server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Initialize(InitializeRequestParam),
    Ping,
    ListTools(Option<PaginatedRequestParam>),
    CallTool(CallToolRequestParam),
    ListPrompts(Option<PaginatedRequestParam>),
    GetPrompt(GetPromptRequestParam),
    ListResources(Option<PaginatedRequestParam>),
    ListResourceTemplates(Option<PaginatedRequestParam>),
    ReadResource(ReadResourceRequestParam),
    Subscribe(SubscribeRequestParam),
    Unsubscribe(UnsubscribeRequestParam),
    SetLevel(SetLevelRequestParam),
    Complete(CompleteRequestParam),
}

impl WireMethod for ClientRequest {
    fn method(&self) -> &'static str {
        match self {
            ClientRequest::Initialize(_) => "initialize",
            ClientRequest::Ping => "ping",
            ClientRequest::ListTools(_) => "tools/list",
            ClientRequest::CallTool(_) => "tools/call",
            ClientRequest::ListPrompts(_) => "prompts/list",
            ClientRequest::GetPrompt(_) => "prompts/get",
            ClientRequest::ListResources(_) => "resources/list",
            ClientRequest::ListResourceTemplates(_) => "resources/templates/list",
            ClientRequest::ReadResource(_) => "resources/read",
            ClientRequest::Subscribe(_) => "resources/subscribe",
            ClientRequest::Unsubscribe(_) => "resources/unsubscribe",
            ClientRequest::SetLevel(_) => "logging/setLevel",
            ClientRequest::Complete(_) => "completion/complete",
        }
    }

    fn params(&self) -> Result<Option<Value>, serde_json::Error> {
        Ok(match self {
            ClientRequest::Initialize(p) => wire_params!(p),
            ClientRequest::Ping => None,
            ClientRequest::ListTools(p)
            | ClientRequest::ListPrompts(p)
            | ClientRequest::ListResources(p)
            | ClientRequest::ListResourceTemplates(p) => match p {
                Some(p) => wire_params!(p),
                None => None,
            },
            ClientRequest::CallTool(p) => wire_params!(p),
            ClientRequest::GetPrompt(p) => wire_params!(p),
            ClientRequest::ReadResource(p) => wire_params!(p),
            ClientRequest::Subscribe(p) => wire_params!(p),
            ClientRequest::Unsubscribe(p) => wire_params!(p),
            ClientRequest::SetLevel(p) => wire_params!(p),
            ClientRequest::Complete(p) => wire_params!(p),
        })
    }

    fn from_wire(method: &str, params: Option<Value>) -> Result<Self, wire::WireError> {
        Ok(match method {
            "initialize" => ClientRequest::Initialize(parse_params(method, params)?),
            "ping" => ClientRequest::Ping,
            "tools/list" => ClientRequest::ListTools(parse_opt_params(method, params)?),
            "tools/call" => ClientRequest::CallTool(parse_params(method, params)?),
            "prompts/list" => ClientRequest::ListPrompts(parse_opt_params(method, params)?),
            "prompts/get" => ClientRequest::GetPrompt(parse_params(method, params)?),
            "resources/list" => ClientRequest::ListResources(parse_opt_params(method, params)?),
            "resources/templates/list" => {
                ClientRequest::ListResourceTemplates(parse_opt_params(method, params)?)
            }
            "resources/read" => ClientRequest::ReadResource(parse_params(method, params)?),
            "resources/subscribe" => ClientRequest::Subscribe(parse_params(method, params)?),
            "resources/unsubscribe" => ClientRequest::Unsubscribe(parse_params(method, params)?),
            "logging/setLevel" => ClientRequest::SetLevel(parse_params(method, params)?),
            "completion/complete" => ClientRequest::Complete(parse_params(method, params)?),
            _ => {
                return Err(wire::WireError::UnknownMethod {
                    method: method.to_string(),
                });
            }
        })
    }
}

impl ClientRequest {
    /// The `_meta` object carried by the request params, if any.
    pub fn meta(&self) -> Option<&Meta> {
        match self {
            ClientRequest::CallTool(p) => p.meta.as_ref(),
            _ => None,
        }
    }

    pub fn meta_mut(&mut self) -> Option<&mut Option<Meta>> {
        match self {
            ClientRequest::CallTool(p) => Some(&mut p.meta),
            _ => None,
        }
    }
}

/// Requests a server may send to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerRequest {
    Ping,
    CreateMessage(CreateMessageRequestParam),
    CreateElicitation(CreateElicitationRequestParam),
    ListRoots(Option<PaginatedRequestParam>),
}

impl WireMethod for ServerRequest {
    fn method(&self) -> &'static str {
        match self {
            ServerRequest::Ping => "ping",
            ServerRequest::CreateMessage(_) => "sampling/createMessage",
            ServerRequest::CreateElicitation(_) => "elicitation/create",
            ServerRequest::ListRoots(_) => "roots/list",
        }
    }

    fn params(&self) -> Result<Option<Value>, serde_json::Error> {
        Ok(match self {
            ServerRequest::Ping => None,
            ServerRequest::CreateMessage(p) => wire_params!(p),
            ServerRequest::CreateElicitation(p) => wire_params!(p),
            ServerRequest::ListRoots(p) => match p {
                Some(p) => wire_params!(p),
                None => None,
            },
        })
    }

    fn from_wire(method: &str, params: Option<Value>) -> Result<Self, wire::WireError> {
        Ok(match method {
            "ping" => ServerRequest::Ping,
            "sampling/createMessage" => ServerRequest::CreateMessage(parse_params(method, params)?),
            "elicitation/create" => {
                ServerRequest::CreateElicitation(parse_params(method, params)?)
            }
            "roots/list" => ServerRequest::ListRoots(parse_opt_params(method, params)?),
            _ => {
                return Err(wire::WireError::UnknownMethod {
                    method: method.to_string(),
                });
            }
        })
    }
}

/// Notifications a client may send to a server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotification {
    Initialized,
    Cancelled(CancelledNotificationParam),
    Progress(ProgressNotificationParam),
    RootsListChanged,
}

impl WireMethod for ClientNotification {
    fn method(&self) -> &'static str {
        match self {
            ClientNotification::Initialized => "notifications/initialized",
            ClientNotification::Cancelled(_) => "notifications/cancelled",
            ClientNotification::Progress(_) => "notifications/progress",
            ClientNotification::RootsListChanged => "notifications/roots/list_changed",
        }
    }

    fn params(&self) -> Result<Option<Value>, serde_json::Error> {
        Ok(match self {
            ClientNotification::Initialized | ClientNotification::RootsListChanged => None,
            ClientNotification::Cancelled(p) => wire_params!(p),
            ClientNotification::Progress(p) => wire_params!(p),
        })
    }

    fn from_wire(method: &str, params: Option<Value>) -> Result<Self, wire::WireError> {
        Ok(match method {
            "notifications/initialized" => ClientNotification::Initialized,
            "notifications/cancelled" => ClientNotification::Cancelled(parse_params(method, params)?),
            "notifications/progress" => ClientNotification::Progress(parse_params(method, params)?),
            "notifications/roots/list_changed" => ClientNotification::RootsListChanged,
            _ => {
                return Err(wire::WireError::UnknownMethod {
                    method: method.to_string(),
                });
            }
        })
    }
}

/// Notifications a server may send to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotification {
    Cancelled(CancelledNotificationParam),
    Progress(ProgressNotificationParam),
    LoggingMessage(LoggingMessageNotificationParam),
    ResourceUpdated(ResourceUpdatedNotificationParam),
    ResourceListChanged,
    ToolListChanged,
    PromptListChanged,
}

impl WireMethod for ServerNotification {
    fn method(&self) -> &'static str {
        match self {
            ServerNotification::Cancelled(_) => "notifications/cancelled",
            ServerNotification::Progress(_) => "notifications/progress",
            ServerNotification::LoggingMessage(_) => "notifications/message",
            ServerNotification::ResourceUpdated(_) => "notifications/resources/updated",
            ServerNotification::ResourceListChanged => "notifications/resources/list_changed",
            ServerNotification::ToolListChanged => "notifications/tools/list_changed",
            ServerNotification::PromptListChanged => "notifications/prompts/list_changed",
        }
    }

    fn params(&self) -> Result<Option<Value>, serde_json::Error> {
        Ok(match self {
            ServerNotification::Cancelled(p) => wire_params!(p),
            ServerNotification::Progress(p) => wire_params!(p),
            ServerNotification::LoggingMessage(p) => wire_params!(p),
            ServerNotification::ResourceUpdated(p) => wire_params!(p),
            ServerNotification::ResourceListChanged
            | ServerNotification::ToolListChanged
            | ServerNotification::PromptListChanged => None,
        })
    }

    fn from_wire(method: &str, params: Option<Value>) -> Result<Self, wire::WireError> {
        Ok(match method {
            "notifications/cancelled" => ServerNotification::Cancelled(parse_params(method, params)?),
            "notifications/progress" => ServerNotification::Progress(parse_params(method, params)?),
            "notifications/message" => {
                ServerNotification::LoggingMessage(parse_params(method, params)?)
            }
            "notifications/resources/updated" => {
                ServerNotification::ResourceUpdated(parse_params(method, params)?)
            }
            "notifications/resources/list_changed" => ServerNotification::ResourceListChanged,
            "notifications/tools/list_changed" => ServerNotification::ToolListChanged,
            "notifications/prompts/list_changed" => ServerNotification::PromptListChanged,
            _ => {
                return Err(wire::WireError::UnknownMethod {
                    method: method.to_string(),
                });
            }
        })
    }
}

/// Results a server produces, serialised untagged into the `result` field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerResult {
    Initialize(InitializeResult),
    ListTools(ListToolsResult),
    CallTool(CallToolResult),
    ListPrompts(ListPromptsResult),
    GetPrompt(GetPromptResult),
    ListResources(ListResourcesResult),
    ListResourceTemplates(ListResourceTemplatesResult),
    ReadResource(ReadResourceResult),
    Complete(CompleteResult),
    Empty(EmptyResult),
}

/// Results a client produces, serialised untagged into the `result` field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClientResult {
    CreateMessage(Box<CreateMessageResult>),
    CreateElicitation(CreateElicitationResult),
    ListRoots(ListRootsResult),
    Empty(EmptyResult),
}

/// Messages a client emits; what a server receives.
pub type ClientJsonRpcMessage = JsonRpcMessage<ClientRequest, ClientNotification>;
/// Messages a server emits; what a client receives.
pub type ServerJsonRpcMessage = JsonRpcMessage<ServerRequest, ServerNotification>;

/// A type-erased bag of request-scoped values (transport metadata, token
/// info). Values are kept behind `Arc`, so cloning the bag is cheap.
#[derive(Clone, Default)]
pub struct Extensions {
    map: HashMap<std::any::TypeId, Arc<dyn std::any::Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.map.insert(std::any::TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&std::any::TypeId::of::<T>())
            .and_then(|v| v.downcast_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn protocol_versions_are_date_ordered() {
        assert!(ProtocolVersion::V_2024_11_05 < ProtocolVersion::V_2025_03_26);
        assert!(ProtocolVersion::V_2025_03_26 < ProtocolVersion::V_2025_06_18);
        assert!(ProtocolVersion::V_2025_03_26.supports_batching());
        assert!(!ProtocolVersion::V_2025_06_18.supports_batching());
    }

    #[test]
    fn request_round_trips_through_wire_form() {
        let request = ClientRequest::CallTool(CallToolRequestParam {
            name: "greet".into(),
            arguments: Some(json!({"name": "user"}).as_object().cloned().unwrap_or_default()),
            meta: None,
        });
        assert_eq!(request.method(), "tools/call");
        let params = request.params().unwrap();
        let decoded = ClientRequest::from_wire("tools/call", params).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn paramless_list_request_decodes_without_params() {
        let decoded = ClientRequest::from_wire("tools/list", None).unwrap();
        assert_eq!(decoded, ClientRequest::ListTools(None));
    }

    #[test]
    fn unknown_method_is_rejected() {
        let err = ClientRequest::from_wire("tools/destroy", None).unwrap_err();
        assert!(matches!(err, wire::WireError::UnknownMethod { .. }));
    }

    #[test]
    fn empty_result_serialises_as_empty_object() {
        assert_eq!(serde_json::to_string(&EmptyResult {}).unwrap(), "{}");
    }

    #[test]
    fn progress_token_reads_from_meta() {
        let mut meta = Meta::default();
        meta.set_progress_token(ProgressToken(7.into()));
        assert_eq!(meta.progress_token(), Some(ProgressToken(7.into())));
    }
}
