use std::{borrow::Cow, sync::Arc};

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{
    AtomicI64RequestIdProvider, Peer, PeerRequestOptions, RoleWithInitialize, RunningService,
    Service, ServiceError, ServiceRole, serve_inner,
};
use crate::{
    model::{
        CallToolRequestParam, CallToolResult, CancelledNotificationParam, ClientInfo,
        ClientNotification, ClientRequest, CompleteRequestParam, CompleteResult, EmptyResult,
        ErrorData, GetPromptRequestParam, GetPromptResult, InitializeResult, JsonRpcMessage,
        ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
        Meta, PaginatedRequestParam, ProgressNotificationParam, ProgressToken,
        ReadResourceRequestParam, ReadResourceResult, RequestId, ServerInfo, ServerNotification,
        ServerRequest, SetLevelRequestParam, SubscribeRequestParam, UnsubscribeRequestParam,
    },
    transport::{DynamicTransportError, IntoTransport, OutgoingMessage, Transport},
};

/// The initiating side of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleClient;

impl ServiceRole for RoleClient {
    type Req = ClientRequest;
    type Resp = crate::model::ClientResult;
    type Not = ClientNotification;
    type PeerReq = ServerRequest;
    type PeerNot = ServerNotification;
    type Info = ClientInfo;
    type PeerInfo = ServerInfo;
    const IS_CLIENT: bool = true;

    fn ping_request() -> Self::Req {
        ClientRequest::Ping
    }

    fn cancelled_notification(param: CancelledNotificationParam) -> Self::Not {
        ClientNotification::Cancelled(param)
    }

    fn progress_notification(param: ProgressNotificationParam) -> Self::Not {
        ClientNotification::Progress(param)
    }

    fn attach_progress_token(request: &mut Self::Req, token: &ProgressToken) -> bool {
        match request {
            ClientRequest::CallTool(param) => {
                param
                    .meta
                    .get_or_insert_with(Meta::default)
                    .set_progress_token(token.clone());
                true
            }
            _ => false,
        }
    }

    fn peer_request_meta(_request: &Self::PeerReq) -> Option<&Meta> {
        None
    }

    fn match_cancelled(notification: &Self::PeerNot) -> Option<&CancelledNotificationParam> {
        match notification {
            ServerNotification::Cancelled(param) => Some(param),
            _ => None,
        }
    }

    fn match_progress(notification: &Self::PeerNot) -> Option<&ProgressNotificationParam> {
        match notification {
            ServerNotification::Progress(param) => Some(param),
            _ => None,
        }
    }

    fn panic_response(_request: &Self::PeerReq) -> Result<Self::Resp, ErrorData> {
        Err(ErrorData::internal_error("request handler panicked", None))
    }
}

pub type ServerSink = Peer<RoleClient>;

/// It represents the error that may occur when initializing the client side
/// of a session.
#[derive(Error, Debug)]
pub enum ClientInitializeError {
    #[error("expected initialize response, but received: {0:?}")]
    ExpectedInitResponse(Option<super::RxJsonRpcMessage<RoleClient>>),

    #[error("expected initialize result, but received: {0:?}")]
    ExpectedInitResult(Option<Value>),

    #[error("conflict initialize response id: expected {0}, got {1}")]
    ConflictInitResponseId(RequestId, RequestId),

    #[error("initialize failed: {0}")]
    InitializeFailed(ErrorData),

    #[error("the server negotiated an unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(crate::model::ProtocolVersion),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Send message error {error}, when {context}")]
    TransportError {
        error: DynamicTransportError,
        context: Cow<'static, str>,
    },

    #[error("Cancelled")]
    Cancelled,
}

impl ClientInitializeError {
    fn transport<T: Transport<RoleClient> + 'static>(
        error: T::Error,
        context: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::TransportError {
            error: DynamicTransportError::new::<T>(error),
            context: context.into(),
        }
    }
}

impl<S: Service<RoleClient>> RoleWithInitialize<S> for RoleClient {
    type InitializeError = ClientInitializeError;

    fn serve_with_ct<T, E, A>(
        service: S,
        transport: T,
        ct: CancellationToken,
    ) -> impl Future<Output = Result<RunningService<RoleClient, S>, ClientInitializeError>> + Send
    where
        T: IntoTransport<RoleClient, E, A>,
        E: std::error::Error + Send + Sync + 'static,
    {
        serve_client_with_ct(service, transport, ct)
    }
}

pub async fn serve_client<S, T, E, A>(
    service: S,
    transport: T,
) -> Result<RunningService<RoleClient, S>, ClientInitializeError>
where
    S: Service<RoleClient>,
    T: IntoTransport<RoleClient, E, A>,
    E: std::error::Error + Send + Sync + 'static,
{
    serve_client_with_ct(service, transport, CancellationToken::new()).await
}

pub async fn serve_client_with_ct<S, T, E, A>(
    service: S,
    transport: T,
    ct: CancellationToken,
) -> Result<RunningService<RoleClient, S>, ClientInitializeError>
where
    S: Service<RoleClient>,
    T: IntoTransport<RoleClient, E, A>,
    E: std::error::Error + Send + Sync + 'static,
{
    tokio::select! {
        result = serve_client_inner(service, transport.into_transport(), ct.clone()) => result,
        _ = ct.cancelled() => Err(ClientInitializeError::Cancelled),
    }
}

/// Helper function to get the next message from the transport.
async fn expect_next_message<T>(
    transport: &mut T,
    context: &str,
) -> Result<super::RxJsonRpcMessage<RoleClient>, ClientInitializeError>
where
    T: Transport<RoleClient>,
{
    transport
        .receive()
        .await
        .map(|(message, _)| message)
        .ok_or_else(|| ClientInitializeError::ConnectionClosed(context.to_string()))
}

async fn serve_client_inner<S, T>(
    service: S,
    mut transport: T,
    ct: CancellationToken,
) -> Result<RunningService<RoleClient, S>, ClientInitializeError>
where
    S: Service<RoleClient>,
    T: Transport<RoleClient> + 'static,
{
    let id_provider = Arc::new(AtomicI64RequestIdProvider::default());

    let id = id_provider.next_request_id();
    let init_request = ClientRequest::Initialize(service.get_info());
    transport
        .send(OutgoingMessage::new(JsonRpcMessage::request(
            init_request,
            id.clone(),
        )))
        .await
        .map_err(|e| ClientInitializeError::transport::<T>(e, "send initialize request"))?;

    let (result, response_id) = match expect_next_message(&mut transport, "initialize response")
        .await?
    {
        JsonRpcMessage::Response(response) => (response.result, response.id),
        JsonRpcMessage::Error(error) => {
            return Err(ClientInitializeError::InitializeFailed(error.error));
        }
        other => return Err(ClientInitializeError::ExpectedInitResponse(Some(other))),
    };
    if response_id != id {
        return Err(ClientInitializeError::ConflictInitResponseId(
            id,
            response_id,
        ));
    }
    let init_result: InitializeResult = serde_json::from_value(result.clone())
        .map_err(|_| ClientInitializeError::ExpectedInitResult(Some(result)))?;
    if !init_result.protocol_version.is_supported() {
        return Err(ClientInitializeError::UnsupportedProtocolVersion(
            init_result.protocol_version,
        ));
    }

    transport
        .send(OutgoingMessage::new(JsonRpcMessage::notification(
            ClientNotification::Initialized,
        )))
        .await
        .map_err(|e| ClientInitializeError::transport::<T>(e, "send initialized notification"))?;

    let (peer, peer_rx) = Peer::new(id_provider, Some(init_result));
    Ok(serve_inner(service, transport, peer, peer_rx, ct))
}

macro_rules! method {
    ($(#[$attr:meta])* $method:ident $Variant:ident($Param:ty) => $Resp:ty) => {
        $(#[$attr])*
        pub async fn $method(&self, params: $Param) -> Result<$Resp, ServiceError> {
            let result = self.send_request(ClientRequest::$Variant(params)).await?;
            serde_json::from_value(result).map_err(ServiceError::UnexpectedResponse)
        }
    };
    ($(#[$attr:meta])* $method:ident $Variant:ident($Param:ty)) => {
        $(#[$attr])*
        pub async fn $method(&self, params: $Param) -> Result<(), ServiceError> {
            let result = self.send_request(ClientRequest::$Variant(params)).await?;
            let _: EmptyResult =
                serde_json::from_value(result).map_err(ServiceError::UnexpectedResponse)?;
            Ok(())
        }
    };
    ($(#[$attr:meta])* $method:ident paginated $Variant:ident => $Resp:ty) => {
        $(#[$attr])*
        pub async fn $method(
            &self,
            params: Option<PaginatedRequestParam>,
        ) -> Result<$Resp, ServiceError> {
            let result = self.send_request(ClientRequest::$Variant(params)).await?;
            serde_json::from_value(result).map_err(ServiceError::UnexpectedResponse)
        }
    };
}

impl Peer<RoleClient> {
    method!(call_tool CallTool(CallToolRequestParam) => CallToolResult);
    method!(get_prompt GetPrompt(GetPromptRequestParam) => GetPromptResult);
    method!(read_resource ReadResource(ReadResourceRequestParam) => ReadResourceResult);
    method!(complete Complete(CompleteRequestParam) => CompleteResult);
    method!(subscribe Subscribe(SubscribeRequestParam));
    method!(unsubscribe Unsubscribe(UnsubscribeRequestParam));
    method!(set_level SetLevel(SetLevelRequestParam));
    method!(list_tools paginated ListTools => ListToolsResult);
    method!(list_prompts paginated ListPrompts => ListPromptsResult);
    method!(list_resources paginated ListResources => ListResourcesResult);
    method!(list_resource_templates paginated ListResourceTemplates => ListResourceTemplatesResult);

    pub async fn ping(&self) -> Result<(), ServiceError> {
        let result = self.send_request(ClientRequest::Ping).await?;
        let _: EmptyResult =
            serde_json::from_value(result).map_err(ServiceError::UnexpectedResponse)?;
        Ok(())
    }

    /// Call a tool with a cancellation token and/or a progress subscription
    /// for the lifetime of the call.
    pub async fn call_tool_with(
        &self,
        params: CallToolRequestParam,
        options: PeerRequestOptions,
    ) -> Result<CallToolResult, ServiceError> {
        let result = self
            .send_request_with(ClientRequest::CallTool(params), options)
            .await?;
        serde_json::from_value(result).map_err(ServiceError::UnexpectedResponse)
    }

    pub async fn notify_progress(
        &self,
        params: ProgressNotificationParam,
    ) -> Result<(), ServiceError> {
        self.send_notification(ClientNotification::Progress(params))
            .await
    }

    pub async fn notify_roots_list_changed(&self) -> Result<(), ServiceError> {
        self.send_notification(ClientNotification::RootsListChanged)
            .await
    }

    /// Drain every `tools/list` page.
    pub async fn list_all_tools(&self) -> Result<Vec<crate::model::Tool>, ServiceError> {
        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let result = self
                .list_tools(Some(PaginatedRequestParam { cursor }))
                .await?;
            tools.extend(result.tools);
            cursor = result.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(tools)
    }

    /// Drain every `prompts/list` page.
    pub async fn list_all_prompts(&self) -> Result<Vec<crate::model::Prompt>, ServiceError> {
        let mut prompts = Vec::new();
        let mut cursor = None;
        loop {
            let result = self
                .list_prompts(Some(PaginatedRequestParam { cursor }))
                .await?;
            prompts.extend(result.prompts);
            cursor = result.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(prompts)
    }

    /// Drain every `resources/list` page.
    pub async fn list_all_resources(&self) -> Result<Vec<crate::model::Resource>, ServiceError> {
        let mut resources = Vec::new();
        let mut cursor = None;
        loop {
            let result = self
                .list_resources(Some(PaginatedRequestParam { cursor }))
                .await?;
            resources.extend(result.resources);
            cursor = result.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(resources)
    }
}
