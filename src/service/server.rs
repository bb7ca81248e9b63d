use std::{borrow::Cow, sync::Arc};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{
    AtomicI64RequestIdProvider, Peer, RequestContext, RoleWithInitialize, RunningService,
    RxJsonRpcMessage, Service, ServiceError, ServiceRole, serve_inner,
};
use crate::{
    model::{
        CancelledNotificationParam, ClientInfo, ClientNotification, ClientRequest,
        CreateElicitationRequestParam, CreateElicitationResult, CreateMessageRequestParam,
        CreateMessageResult, EmptyResult, ErrorData, Extensions, JsonRpcMessage, ListRootsResult,
        LoggingMessageNotificationParam, Meta, PaginatedRequestParam, ProgressNotificationParam,
        ProgressToken, ResourceUpdatedNotificationParam, ServerInfo, ServerNotification,
        ServerRequest, ServerResult, WireMethod, validate_elicitation_schema,
    },
    transport::{DynamicTransportError, IntoTransport, OutgoingMessage, Transport},
};

/// The responding side of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleServer;

impl ServiceRole for RoleServer {
    type Req = ServerRequest;
    type Resp = ServerResult;
    type Not = ServerNotification;
    type PeerReq = ClientRequest;
    type PeerNot = ClientNotification;
    type Info = ServerInfo;
    type PeerInfo = ClientInfo;
    const IS_CLIENT: bool = false;

    fn ping_request() -> Self::Req {
        ServerRequest::Ping
    }

    fn cancelled_notification(param: CancelledNotificationParam) -> Self::Not {
        ServerNotification::Cancelled(param)
    }

    fn progress_notification(param: ProgressNotificationParam) -> Self::Not {
        ServerNotification::Progress(param)
    }

    fn attach_progress_token(_request: &mut Self::Req, _token: &ProgressToken) -> bool {
        // no server-initiated request carries a `_meta` today
        false
    }

    fn peer_request_meta(request: &Self::PeerReq) -> Option<&Meta> {
        request.meta()
    }

    fn match_cancelled(notification: &Self::PeerNot) -> Option<&CancelledNotificationParam> {
        match notification {
            ClientNotification::Cancelled(param) => Some(param),
            _ => None,
        }
    }

    fn match_progress(notification: &Self::PeerNot) -> Option<&ProgressNotificationParam> {
        match notification {
            ClientNotification::Progress(param) => Some(param),
            _ => None,
        }
    }

    fn panic_response(request: &Self::PeerReq) -> Result<Self::Resp, ErrorData> {
        match request {
            // a crashed tool is a tool failure, not a protocol error; no
            // backtrace crosses the trust boundary
            ClientRequest::CallTool(_) => Ok(ServerResult::CallTool(
                crate::model::CallToolResult::error(vec![crate::model::Content::text(
                    "tool handler panicked",
                )]),
            )),
            _ => Err(ErrorData::internal_error("request handler panicked", None)),
        }
    }
}

pub type ClientSink = Peer<RoleServer>;

/// It represents the error that may occur when initializing the server side
/// of a session.
#[derive(Error, Debug)]
pub enum ServerInitializeError {
    #[error("expected initialize request, but received: {0:?}")]
    ExpectedInitializeRequest(Option<RxJsonRpcMessage<RoleServer>>),

    #[error("expected initialized notification, but received: {0:?}")]
    ExpectedInitializedNotification(Option<RxJsonRpcMessage<RoleServer>>),

    #[error("unexpected initialize result: {0:?}")]
    UnexpectedInitializeResponse(ServerResult),

    #[error("initialize failed: {0}")]
    InitializeFailed(ErrorData),

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

impl ServerInitializeError {
    fn transport<T: Transport<RoleServer> + 'static>(
        error: T::Error,
        context: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::TransportError {
            error: DynamicTransportError::new::<T>(error),
            context: context.into(),
        }
    }
}

impl<S: Service<RoleServer>> RoleWithInitialize<S> for RoleServer {
    type InitializeError = ServerInitializeError;

    fn serve_with_ct<T, E, A>(
        service: S,
        transport: T,
        ct: CancellationToken,
    ) -> impl Future<Output = Result<RunningService<RoleServer, S>, ServerInitializeError>> + Send
    where
        T: IntoTransport<RoleServer, E, A>,
        E: std::error::Error + Send + Sync + 'static,
    {
        serve_server_with_ct(service, transport, ct)
    }
}

pub async fn serve_server<S, T, E, A>(
    service: S,
    transport: T,
) -> Result<RunningService<RoleServer, S>, ServerInitializeError>
where
    S: Service<RoleServer>,
    T: IntoTransport<RoleServer, E, A>,
    E: std::error::Error + Send + Sync + 'static,
{
    serve_server_with_ct(service, transport, CancellationToken::new()).await
}

pub async fn serve_server_with_ct<S, T, E, A>(
    service: S,
    transport: T,
    ct: CancellationToken,
) -> Result<RunningService<RoleServer, S>, ServerInitializeError>
where
    S: Service<RoleServer>,
    T: IntoTransport<RoleServer, E, A>,
    E: std::error::Error + Send + Sync + 'static,
{
    tokio::select! {
        result = serve_server_inner(service, transport.into_transport(), ct.clone()) => result,
        _ = ct.cancelled() => Err(ServerInitializeError::Cancelled),
    }
}

/// Serve a session whose initialize exchange already happened elsewhere:
/// stateless HTTP requests and sessions rehydrated from an external session
/// store.
pub fn serve_directly<S, T, E, A>(
    service: S,
    transport: T,
    peer_info: Option<ClientInfo>,
    ct: CancellationToken,
) -> RunningService<RoleServer, S>
where
    S: Service<RoleServer>,
    T: IntoTransport<RoleServer, E, A>,
    E: std::error::Error + Send + Sync + 'static,
{
    let id_provider = Arc::new(AtomicI64RequestIdProvider::default());
    let (peer, peer_rx) = Peer::new(id_provider, peer_info);
    serve_inner(service, transport.into_transport(), peer, peer_rx, ct)
}

async fn expect_next_message<T>(
    transport: &mut T,
    context: &str,
) -> Result<(RxJsonRpcMessage<RoleServer>, Extensions), ServerInitializeError>
where
    T: Transport<RoleServer>,
{
    transport
        .receive()
        .await
        .ok_or_else(|| ServerInitializeError::ConnectionClosed(context.to_string()))
}

async fn reject_during_initialization<T>(
    transport: &mut T,
    id: crate::model::RequestId,
    method: &str,
) -> Result<(), ServerInitializeError>
where
    T: Transport<RoleServer> + 'static,
{
    let error = ErrorData::invalid_request(
        format!("method {method} is invalid during session initialization"),
        None,
    );
    transport
        .send(OutgoingMessage::related_to(
            JsonRpcMessage::error(error, id.clone()),
            Some(id),
        ))
        .await
        .map_err(|e| ServerInitializeError::transport::<T>(e, "reject pre-initialize request"))
}

async fn serve_server_inner<S, T>(
    service: S,
    mut transport: T,
    ct: CancellationToken,
) -> Result<RunningService<RoleServer, S>, ServerInitializeError>
where
    S: Service<RoleServer>,
    T: Transport<RoleServer> + 'static,
{
    let id_provider = Arc::new(AtomicI64RequestIdProvider::default());

    // The first request must be `initialize`; `ping` is answered, anything
    // else is rejected without giving up on the session.
    let (init_param, init_id, extensions) = loop {
        let (message, extensions) = expect_next_message(&mut transport, "initialize request").await?;
        match message {
            JsonRpcMessage::Request(request) => match request.request {
                ClientRequest::Initialize(param) => break (param, request.id, extensions),
                ClientRequest::Ping => {
                    let pong = serde_json::Value::Object(Default::default());
                    transport
                        .send(OutgoingMessage::related_to(
                            JsonRpcMessage::response(pong, request.id.clone()),
                            Some(request.id),
                        ))
                        .await
                        .map_err(|e| {
                            ServerInitializeError::transport::<T>(e, "answer pre-initialize ping")
                        })?;
                }
                other => {
                    reject_during_initialization(&mut transport, request.id, other.method())
                        .await?;
                }
            },
            JsonRpcMessage::InvalidRequest { id, error } => {
                transport
                    .send(OutgoingMessage::related_to(
                        JsonRpcMessage::error(error, id.clone()),
                        Some(id),
                    ))
                    .await
                    .map_err(|e| {
                        ServerInitializeError::transport::<T>(e, "reject invalid request")
                    })?;
            }
            JsonRpcMessage::Notification(_) => {
                // notifications before initialize carry nothing actionable
                continue;
            }
            other => {
                return Err(ServerInitializeError::ExpectedInitializeRequest(Some(
                    other,
                )));
            }
        }
    };

    let (peer, peer_rx) = Peer::new(id_provider, Some(init_param.clone()));
    let context = RequestContext {
        ct: ct.child_token(),
        id: init_id.clone(),
        meta: Meta::default(),
        extensions,
        peer: peer.clone().bind_related(init_id.clone()),
    };
    let init_response = service
        .handle_request(ClientRequest::Initialize(init_param.clone()), context)
        .await;
    let mut init_result = match init_response {
        Ok(ServerResult::Initialize(init_result)) => init_result,
        Ok(other) => return Err(ServerInitializeError::UnexpectedInitializeResponse(other)),
        Err(error) => {
            transport
                .send(OutgoingMessage::related_to(
                    JsonRpcMessage::error(error.clone(), init_id.clone()),
                    Some(init_id),
                ))
                .await
                .map_err(|e| {
                    ServerInitializeError::transport::<T>(e, "send initialize error response")
                })?;
            return Err(ServerInitializeError::InitializeFailed(error));
        }
    };
    // accept the initiator's version when we support it; otherwise propose
    // the latest we do
    if init_param.protocol_version.is_supported() {
        init_result.protocol_version = init_param.protocol_version.clone();
    }
    let result_value = serde_json::to_value(&ServerResult::Initialize(init_result)).map_err(
        |e| {
            ServerInitializeError::InitializeFailed(ErrorData::internal_error(
                format!("failed to serialize initialize result: {e}"),
                None,
            ))
        },
    )?;
    transport
        .send(OutgoingMessage::related_to(
            JsonRpcMessage::response(result_value, init_id.clone()),
            Some(init_id),
        ))
        .await
        .map_err(|e| ServerInitializeError::transport::<T>(e, "send initialize response"))?;

    // Only `ping` is serviced until `notifications/initialized` arrives.
    loop {
        let (message, extensions) =
            expect_next_message(&mut transport, "initialized notification").await?;
        match message {
            JsonRpcMessage::Notification(notification) => match notification.notification {
                ClientNotification::Initialized => {
                    let context = super::NotificationContext {
                        extensions,
                        peer: peer.clone(),
                    };
                    let _ = service
                        .handle_notification(ClientNotification::Initialized, context)
                        .await;
                    break;
                }
                _ => continue,
            },
            JsonRpcMessage::Request(request) => match request.request {
                ClientRequest::Ping => {
                    let pong = serde_json::Value::Object(Default::default());
                    transport
                        .send(OutgoingMessage::related_to(
                            JsonRpcMessage::response(pong, request.id.clone()),
                            Some(request.id),
                        ))
                        .await
                        .map_err(|e| {
                            ServerInitializeError::transport::<T>(e, "answer pre-initialized ping")
                        })?;
                }
                other => {
                    reject_during_initialization(&mut transport, request.id, other.method())
                        .await?;
                }
            },
            JsonRpcMessage::InvalidRequest { id, error } => {
                transport
                    .send(OutgoingMessage::related_to(
                        JsonRpcMessage::error(error, id.clone()),
                        Some(id),
                    ))
                    .await
                    .map_err(|e| {
                        ServerInitializeError::transport::<T>(e, "reject invalid request")
                    })?;
            }
            other => {
                return Err(ServerInitializeError::ExpectedInitializedNotification(Some(
                    other,
                )));
            }
        }
    }

    Ok(serve_inner(service, transport, peer, peer_rx, ct))
}

macro_rules! method {
    ($(#[$attr:meta])* $method:ident $Variant:ident($Param:ty) => $Resp:ty) => {
        $(#[$attr])*
        pub async fn $method(&self, params: $Param) -> Result<$Resp, ServiceError> {
            let result = self.send_request(ServerRequest::$Variant(params)).await?;
            serde_json::from_value(result).map_err(ServiceError::UnexpectedResponse)
        }
    };
    ($(#[$attr:meta])* $method:ident notify $Variant:ident($Param:ty)) => {
        $(#[$attr])*
        pub async fn $method(&self, params: $Param) -> Result<(), ServiceError> {
            self.send_notification(ServerNotification::$Variant(params)).await
        }
    };
    ($(#[$attr:meta])* $method:ident notify $Variant:ident) => {
        $(#[$attr])*
        pub async fn $method(&self) -> Result<(), ServiceError> {
            self.send_notification(ServerNotification::$Variant).await
        }
    };
}

impl Peer<RoleServer> {
    method!(create_message CreateMessage(CreateMessageRequestParam) => CreateMessageResult);
    method!(list_roots ListRoots(Option<PaginatedRequestParam>) => ListRootsResult);

    method!(notify_progress notify Progress(ProgressNotificationParam));
    method!(notify_logging_message notify LoggingMessage(LoggingMessageNotificationParam));
    method!(notify_resource_updated notify ResourceUpdated(ResourceUpdatedNotificationParam));
    method!(notify_resource_list_changed notify ResourceListChanged);
    method!(notify_tool_list_changed notify ToolListChanged);
    method!(notify_prompt_list_changed notify PromptListChanged);

    pub async fn ping(&self) -> Result<(), ServiceError> {
        let result = self.send_request(ServerRequest::Ping).await?;
        let _: EmptyResult =
            serde_json::from_value(result).map_err(ServiceError::UnexpectedResponse)?;
        Ok(())
    }

    /// Ask the client's user for structured input.
    ///
    /// The requested schema is validated against the restricted elicitation
    /// form before anything is sent; a violation fails with invalid-params
    /// locally.
    pub async fn create_elicitation(
        &self,
        params: CreateElicitationRequestParam,
    ) -> Result<CreateElicitationResult, ServiceError> {
        validate_elicitation_schema(&params.requested_schema).map_err(ServiceError::Rejected)?;
        let result = self
            .send_request(ServerRequest::CreateElicitation(params))
            .await?;
        serde_json::from_value(result).map_err(ServiceError::UnexpectedResponse)
    }
}
