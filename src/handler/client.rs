//! The client feature layer: a roots registry, sampling and elicitation
//! handlers, and callbacks for server-initiated notifications.

use std::{
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::registry::{DEFAULT_PAGE_SIZE, FeatureRegistry};
use crate::{
    model::{
        ClientCapabilities, ClientInfo, ClientResult, CreateElicitationRequestParam,
        CreateElicitationResult, CreateMessageRequestParam, CreateMessageResult, EmptyResult,
        ErrorData, Implementation, JsonObject, ListChangedCapability, ListRootsResult,
        LoggingMessageNotificationParam, ProgressNotificationParam, ProtocolVersion,
        ResourceUpdatedNotificationParam, Root, ServerNotification, ServerRequest,
    },
    service::{
        ClientInitializeError, NotificationContext, Peer, ReceivingMiddleware, RequestContext,
        RoleClient, RunningService, SendingMiddleware, Service, ServiceError, SessionOptions,
        serve_client_with_ct,
    },
    transport::IntoTransport,
};

pub type SamplingHandler = Arc<
    dyn Fn(
            CreateMessageRequestParam,
            RequestContext<RoleClient>,
        ) -> BoxFuture<'static, Result<CreateMessageResult, ErrorData>>
        + Send
        + Sync,
>;

pub type ElicitationHandler = Arc<
    dyn Fn(
            CreateElicitationRequestParam,
            RequestContext<RoleClient>,
        ) -> BoxFuture<'static, Result<CreateElicitationResult, ErrorData>>
        + Send
        + Sync,
>;

type NotificationHook<P> = Arc<dyn Fn(P) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub struct ClientOptions {
    pub client_info: Implementation,
    pub keep_alive: Option<Duration>,
    pub page_size: usize,
    /// Advertise the roots capability even while the registry is empty.
    pub has_roots: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_info: Implementation::default(),
            keep_alive: None,
            page_size: DEFAULT_PAGE_SIZE,
            has_roots: false,
        }
    }
}

struct ClientInner {
    options: ClientOptions,
    roots: RwLock<FeatureRegistry<Root>>,
    sampling: RwLock<Option<SamplingHandler>>,
    elicitation: RwLock<Option<ElicitationHandler>>,
    on_logging_message: RwLock<Option<NotificationHook<LoggingMessageNotificationParam>>>,
    on_progress: RwLock<Option<NotificationHook<ProgressNotificationParam>>>,
    on_resource_updated: RwLock<Option<NotificationHook<ResourceUpdatedNotificationParam>>>,
    on_tool_list_changed: RwLock<Option<NotificationHook<()>>>,
    on_prompt_list_changed: RwLock<Option<NotificationHook<()>>>,
    on_resource_list_changed: RwLock<Option<NotificationHook<()>>>,
    sessions: Mutex<Vec<Peer<RoleClient>>>,
    sending_middlewares: RwLock<Vec<Arc<dyn SendingMiddleware<RoleClient>>>>,
    receiving_middlewares: RwLock<Vec<Arc<dyn ReceivingMiddleware<RoleClient>>>>,
}

/// An MCP client: what it announces at initialize plus the handlers for
/// server-initiated traffic. Cheaply cloneable.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ClientOptions::default())
    }
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                options,
                roots: RwLock::new(FeatureRegistry::default()),
                sampling: RwLock::new(None),
                elicitation: RwLock::new(None),
                on_logging_message: RwLock::new(None),
                on_progress: RwLock::new(None),
                on_resource_updated: RwLock::new(None),
                on_tool_list_changed: RwLock::new(None),
                on_prompt_list_changed: RwLock::new(None),
                on_resource_list_changed: RwLock::new(None),
                sessions: Mutex::new(Vec::new()),
                sending_middlewares: RwLock::new(Vec::new()),
                receiving_middlewares: RwLock::new(Vec::new()),
            }),
        }
    }

    fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
        lock.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
        lock.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, Vec<Peer<RoleClient>>> {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Establish a session over a transport: initialize handshake included.
    pub async fn serve<T, E, A>(
        &self,
        transport: T,
    ) -> Result<RunningService<RoleClient, Client>, ClientInitializeError>
    where
        T: IntoTransport<RoleClient, E, A>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.serve_with_ct(transport, CancellationToken::new()).await
    }

    pub async fn serve_with_ct<T, E, A>(
        &self,
        transport: T,
        ct: CancellationToken,
    ) -> Result<RunningService<RoleClient, Client>, ClientInitializeError>
    where
        T: IntoTransport<RoleClient, E, A>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let running = serve_client_with_ct(self.clone(), transport, ct).await?;
        self.lock_sessions().push(running.peer().clone());
        Ok(running)
    }

    pub fn capabilities(&self) -> ClientCapabilities {
        let has_roots = self.inner.options.has_roots || !Self::read(&self.inner.roots).is_empty();
        ClientCapabilities {
            experimental: None,
            roots: has_roots.then_some(ListChangedCapability::LIST_CHANGED),
            sampling: Self::read(&self.inner.sampling).is_some().then(JsonObject::new),
            elicitation: Self::read(&self.inner.elicitation)
                .is_some()
                .then(JsonObject::new),
        }
    }

    // -- roots ----------------------------------------------------------------

    /// Expose a root. Re-adding a URI replaces its entry in place.
    pub fn add_root(&self, root: Root) {
        Self::write(&self.inner.roots).add(root.uri.clone(), root);
        self.notify_roots_changed();
    }

    pub fn remove_root(&self, uri: &str) -> bool {
        let removed = Self::write(&self.inner.roots).remove(uri).is_some();
        if removed {
            self.notify_roots_changed();
        }
        removed
    }

    pub fn roots(&self) -> Vec<Root> {
        Self::read(&self.inner.roots)
            .iter()
            .map(|(_, root)| root.clone())
            .collect()
    }

    fn notify_roots_changed(&self) {
        let targets: Vec<Peer<RoleClient>> = self.lock_sessions().iter().cloned().collect();
        for peer in targets {
            let client = self.clone();
            tokio::spawn(async move {
                if let Err(ServiceError::TransportClosed) =
                    peer.notify_roots_list_changed().await
                {
                    client
                        .lock_sessions()
                        .retain(|session| !session.is_same_session(&peer));
                }
            });
        }
    }

    // -- handlers -------------------------------------------------------------

    /// Install the `sampling/createMessage` handler; without one the
    /// capability is not advertised and requests fail with
    /// method-not-found.
    pub fn set_sampling_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(CreateMessageRequestParam, RequestContext<RoleClient>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CreateMessageResult, ErrorData>> + Send + 'static,
    {
        *Self::write(&self.inner.sampling) =
            Some(Arc::new(move |params, context| Box::pin(handler(params, context))));
    }

    /// Install the `elicitation/create` handler.
    pub fn set_elicitation_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(CreateElicitationRequestParam, RequestContext<RoleClient>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<CreateElicitationResult, ErrorData>> + Send + 'static,
    {
        *Self::write(&self.inner.elicitation) =
            Some(Arc::new(move |params, context| Box::pin(handler(params, context))));
    }

    pub fn on_logging_message<F, Fut>(&self, hook: F)
    where
        F: Fn(LoggingMessageNotificationParam) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *Self::write(&self.inner.on_logging_message) =
            Some(Arc::new(move |params| Box::pin(hook(params))));
    }

    /// Fallback for progress notifications that no per-call subscription
    /// claimed.
    pub fn on_progress<F, Fut>(&self, hook: F)
    where
        F: Fn(ProgressNotificationParam) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *Self::write(&self.inner.on_progress) =
            Some(Arc::new(move |params| Box::pin(hook(params))));
    }

    pub fn on_resource_updated<F, Fut>(&self, hook: F)
    where
        F: Fn(ResourceUpdatedNotificationParam) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *Self::write(&self.inner.on_resource_updated) =
            Some(Arc::new(move |params| Box::pin(hook(params))));
    }

    pub fn on_tool_list_changed<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *Self::write(&self.inner.on_tool_list_changed) =
            Some(Arc::new(move |()| Box::pin(hook())));
    }

    pub fn on_prompt_list_changed<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *Self::write(&self.inner.on_prompt_list_changed) =
            Some(Arc::new(move |()| Box::pin(hook())));
    }

    pub fn on_resource_list_changed<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *Self::write(&self.inner.on_resource_list_changed) =
            Some(Arc::new(move |()| Box::pin(hook())));
    }

    pub fn add_sending_middleware(&self, middleware: impl SendingMiddleware<RoleClient>) {
        Self::write(&self.inner.sending_middlewares).push(Arc::new(middleware));
    }

    pub fn add_receiving_middleware(&self, middleware: impl ReceivingMiddleware<RoleClient>) {
        Self::write(&self.inner.receiving_middlewares).push(Arc::new(middleware));
    }
}

impl Service<RoleClient> for Client {
    async fn handle_request(
        &self,
        request: ServerRequest,
        context: RequestContext<RoleClient>,
    ) -> Result<ClientResult, ErrorData> {
        match request {
            ServerRequest::Ping => Ok(ClientResult::Empty(EmptyResult {})),
            ServerRequest::CreateMessage(params) => {
                let handler = Self::read(&self.inner.sampling).clone();
                match handler {
                    Some(handler) => Ok(ClientResult::CreateMessage(Box::new(
                        handler(params, context).await?,
                    ))),
                    None => Err(ErrorData::method_not_found("sampling/createMessage")),
                }
            }
            ServerRequest::CreateElicitation(params) => {
                let handler = Self::read(&self.inner.elicitation).clone();
                match handler {
                    Some(handler) => Ok(ClientResult::CreateElicitation(
                        handler(params, context).await?,
                    )),
                    None => Err(ErrorData::method_not_found("elicitation/create")),
                }
            }
            ServerRequest::ListRoots(params) => {
                let cursor = params.and_then(|p| p.cursor);
                let (roots, next_cursor) = Self::read(&self.inner.roots).page(
                    cursor.as_deref(),
                    self.inner.options.page_size.max(1),
                    Clone::clone,
                )?;
                Ok(ClientResult::ListRoots(ListRootsResult { roots, next_cursor }))
            }
        }
    }

    async fn handle_notification(
        &self,
        notification: ServerNotification,
        _context: NotificationContext<RoleClient>,
    ) -> Result<(), ErrorData> {
        match notification {
            ServerNotification::LoggingMessage(params) => {
                let hook = Self::read(&self.inner.on_logging_message).clone();
                if let Some(hook) = hook {
                    hook(params).await;
                }
            }
            ServerNotification::Progress(params) => {
                let hook = Self::read(&self.inner.on_progress).clone();
                if let Some(hook) = hook {
                    hook(params).await;
                }
            }
            ServerNotification::ResourceUpdated(params) => {
                let hook = Self::read(&self.inner.on_resource_updated).clone();
                if let Some(hook) = hook {
                    hook(params).await;
                }
            }
            ServerNotification::ToolListChanged => {
                let hook = Self::read(&self.inner.on_tool_list_changed).clone();
                if let Some(hook) = hook {
                    hook(()).await;
                }
            }
            ServerNotification::PromptListChanged => {
                let hook = Self::read(&self.inner.on_prompt_list_changed).clone();
                if let Some(hook) = hook {
                    hook(()).await;
                }
            }
            ServerNotification::ResourceListChanged => {
                let hook = Self::read(&self.inner.on_resource_list_changed).clone();
                if let Some(hook) = hook {
                    hook(()).await;
                }
            }
            // consumed by the engine before the service sees it
            ServerNotification::Cancelled(_) => {}
        }
        Ok(())
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: self.capabilities(),
            client_info: self.inner.options.client_info.clone(),
        }
    }

    fn session_options(&self) -> SessionOptions<RoleClient> {
        SessionOptions {
            keep_alive: self.inner.options.keep_alive,
            sending_middlewares: Self::read(&self.inner.sending_middlewares).clone(),
            receiving_middlewares: Self::read(&self.inner.receiving_middlewares).clone(),
        }
    }
}
