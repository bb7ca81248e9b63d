//! The server feature layer: registries of tools, prompts and resources
//! plus the per-method dispatch behind a [`Service<RoleServer>`]
//! implementation.
//!
//! A [`Server`] is cheaply cloneable and may serve any number of concurrent
//! sessions; registry mutations fan `list_changed` notifications out to
//! every connected session whose negotiated capabilities advertised them.

pub mod resource;

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use futures::future::BoxFuture;
use serde_json::Value;

pub use super::registry::DEFAULT_PAGE_SIZE;
use super::registry::FeatureRegistry;
pub use resource::{FileResourceHandler, UriTemplate};

use crate::{
    model::{
        CallToolRequestParam, CallToolResult, ClientNotification, ClientRequest,
        CompleteRequestParam, CompleteResult, Content, EmptyResult, ErrorData, GetPromptRequestParam,
        GetPromptResult, Implementation, InitializeRequestParam, InitializeResult, JsonObject,
        ListChangedCapability, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
        ListRootsResult, ListToolsResult, LoggingLevel, LoggingMessageNotificationParam,
        PaginatedRequestParam, Prompt, ProtocolVersion, ReadResourceRequestParam,
        ReadResourceResult, Resource, ResourceTemplate, ResourceUpdatedNotificationParam,
        ResourcesCapability, ServerCapabilities, ServerInfo, ServerResult, SetLevelRequestParam,
        SubscribeRequestParam, Tool, UnsubscribeRequestParam,
    },
    service::{
        NotificationContext, Peer, ReceivingMiddleware, RequestContext, RoleServer,
        SendingMiddleware, Service, ServiceError, SessionOptions,
    },
};

/// What a tool handler may fail with.
///
/// A [`ToolError::Failure`] is a business error: it is embedded into a
/// successful `CallToolResult` with `is_error: true`. Only
/// [`ToolError::Protocol`] surfaces as a JSON-RPC error.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Failure(String),
    #[error("{0}")]
    Protocol(ErrorData),
}

impl From<ErrorData> for ToolError {
    fn from(value: ErrorData) -> Self {
        ToolError::Protocol(value)
    }
}

impl ToolError {
    pub fn failure(message: impl Into<String>) -> Self {
        ToolError::Failure(message.into())
    }
}

/// Opaque schema predicate; schema inference and full JSON-Schema
/// validation live outside this crate.
pub type SchemaValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

type ToolHandler = Arc<
    dyn Fn(
            Option<JsonObject>,
            RequestContext<RoleServer>,
        ) -> BoxFuture<'static, Result<CallToolResult, ToolError>>
        + Send
        + Sync,
>;

type PromptHandler = Arc<
    dyn Fn(
            BTreeMap<String, String>,
            RequestContext<RoleServer>,
        ) -> BoxFuture<'static, Result<GetPromptResult, ErrorData>>
        + Send
        + Sync,
>;

type ResourceReadHandler = Arc<
    dyn Fn(String, RequestContext<RoleServer>) -> BoxFuture<'static, Result<ReadResourceResult, ErrorData>>
        + Send
        + Sync,
>;

type TemplateReadHandler = Arc<
    dyn Fn(
            String,
            BTreeMap<String, String>,
            RequestContext<RoleServer>,
        ) -> BoxFuture<'static, Result<ReadResourceResult, ErrorData>>
        + Send
        + Sync,
>;

type CompletionHandler = Arc<
    dyn Fn(
            CompleteRequestParam,
            RequestContext<RoleServer>,
        ) -> BoxFuture<'static, Result<CompleteResult, ErrorData>>
        + Send
        + Sync,
>;

type SubscriptionHook = Arc<dyn Fn(String, bool) -> BoxFuture<'static, ()> + Send + Sync>;
type RootsChangedHook = Arc<dyn Fn(Peer<RoleServer>) -> BoxFuture<'static, ()> + Send + Sync>;

struct ToolEntry {
    tool: Tool,
    handler: ToolHandler,
    input_validator: Option<SchemaValidator>,
    output_validator: Option<SchemaValidator>,
}

struct PromptEntry {
    prompt: Prompt,
    handler: PromptHandler,
}

struct ResourceEntry {
    resource: Resource,
    handler: ResourceReadHandler,
}

struct TemplateEntry {
    template: ResourceTemplate,
    matcher: UriTemplate,
    handler: TemplateReadHandler,
}

/// Per-connected-session state kept by the server.
#[derive(Clone)]
struct SessionHandle {
    peer: Peer<RoleServer>,
    capabilities: ServerCapabilities,
    /// Threshold of `notifications/message`; nothing is emitted until the
    /// client sets one.
    log_level: Arc<Mutex<Option<LoggingLevel>>>,
    subscriptions: Arc<RwLock<HashSet<String>>>,
}

#[derive(Clone)]
pub struct ServerOptions {
    pub server_info: Implementation,
    pub instructions: Option<String>,
    /// Upper bound of entries per list page.
    pub page_size: usize,
    pub keep_alive: Option<Duration>,
    /// Advertise the capability even while the registry is still empty.
    pub has_tools: bool,
    pub has_prompts: bool,
    pub has_resources: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            server_info: Implementation::default(),
            instructions: None,
            page_size: DEFAULT_PAGE_SIZE,
            keep_alive: None,
            has_tools: false,
            has_prompts: false,
            has_resources: false,
        }
    }
}

struct ServerInner {
    options: ServerOptions,
    tools: RwLock<FeatureRegistry<ToolEntry>>,
    prompts: RwLock<FeatureRegistry<PromptEntry>>,
    resources: RwLock<FeatureRegistry<ResourceEntry>>,
    templates: RwLock<FeatureRegistry<TemplateEntry>>,
    completion: RwLock<Option<CompletionHandler>>,
    subscription_hook: RwLock<Option<SubscriptionHook>>,
    roots_changed_hook: RwLock<Option<RootsChangedHook>>,
    sessions: Mutex<Vec<SessionHandle>>,
    sending_middlewares: RwLock<Vec<Arc<dyn SendingMiddleware<RoleServer>>>>,
    receiving_middlewares: RwLock<Vec<Arc<dyn ReceivingMiddleware<RoleServer>>>>,
}

/// An MCP server: registries plus dispatch. Clone it to share one feature
/// set across sessions and transports.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerOptions::default())
    }
}

#[derive(Clone, Copy)]
enum ListChangedKind {
    Tools,
    Prompts,
    Resources,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                options,
                tools: RwLock::new(FeatureRegistry::default()),
                prompts: RwLock::new(FeatureRegistry::default()),
                resources: RwLock::new(FeatureRegistry::default()),
                templates: RwLock::new(FeatureRegistry::default()),
                completion: RwLock::new(None),
                subscription_hook: RwLock::new(None),
                roots_changed_hook: RwLock::new(None),
                sessions: Mutex::new(Vec::new()),
                sending_middlewares: RwLock::new(Vec::new()),
                receiving_middlewares: RwLock::new(Vec::new()),
            }),
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, Vec<SessionHandle>> {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
        lock.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
        lock.write().unwrap_or_else(|e| e.into_inner())
    }

    /// The capability set advertised to a newly connecting session.
    pub fn capabilities(&self) -> ServerCapabilities {
        let has_tools = self.inner.options.has_tools || !Self::read(&self.inner.tools).is_empty();
        let has_prompts =
            self.inner.options.has_prompts || !Self::read(&self.inner.prompts).is_empty();
        let has_resources = self.inner.options.has_resources
            || !Self::read(&self.inner.resources).is_empty()
            || !Self::read(&self.inner.templates).is_empty();
        ServerCapabilities {
            experimental: None,
            logging: Some(JsonObject::new()),
            completions: Self::read(&self.inner.completion)
                .is_some()
                .then(JsonObject::new),
            prompts: has_prompts.then_some(ListChangedCapability::LIST_CHANGED),
            resources: has_resources.then_some(ResourcesCapability {
                subscribe: Some(true),
                list_changed: Some(true),
            }),
            tools: has_tools.then_some(ListChangedCapability::LIST_CHANGED),
        }
    }

    // -- feature registration -------------------------------------------------

    /// Register a tool. Registering under an existing name replaces the
    /// previous entry in place.
    pub fn add_tool<F, Fut>(&self, tool: Tool, handler: F)
    where
        F: Fn(Option<JsonObject>, RequestContext<RoleServer>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult, ToolError>> + Send + 'static,
    {
        self.add_tool_validated(tool, None, None, handler)
    }

    /// Register a tool together with its input/output validators. The
    /// validators are opaque predicates; the input one runs before the
    /// handler, the output one against `structured_content` afterwards.
    pub fn add_tool_validated<F, Fut>(
        &self,
        tool: Tool,
        input_validator: Option<SchemaValidator>,
        output_validator: Option<SchemaValidator>,
        handler: F,
    ) where
        F: Fn(Option<JsonObject>, RequestContext<RoleServer>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult, ToolError>> + Send + 'static,
    {
        let name = tool.name.clone();
        let entry = ToolEntry {
            tool,
            handler: Arc::new(move |args, context| Box::pin(handler(args, context))),
            input_validator,
            output_validator,
        };
        Self::write(&self.inner.tools).add(name, entry);
        self.notify_list_changed(ListChangedKind::Tools);
    }

    pub fn remove_tool(&self, name: &str) -> bool {
        let removed = Self::write(&self.inner.tools).remove(name).is_some();
        if removed {
            self.notify_list_changed(ListChangedKind::Tools);
        }
        removed
    }

    pub fn add_prompt<F, Fut>(&self, prompt: Prompt, handler: F)
    where
        F: Fn(BTreeMap<String, String>, RequestContext<RoleServer>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GetPromptResult, ErrorData>> + Send + 'static,
    {
        let name = prompt.name.clone();
        let entry = PromptEntry {
            prompt,
            handler: Arc::new(move |args, context| Box::pin(handler(args, context))),
        };
        Self::write(&self.inner.prompts).add(name, entry);
        self.notify_list_changed(ListChangedKind::Prompts);
    }

    pub fn remove_prompt(&self, name: &str) -> bool {
        let removed = Self::write(&self.inner.prompts).remove(name).is_some();
        if removed {
            self.notify_list_changed(ListChangedKind::Prompts);
        }
        removed
    }

    pub fn add_resource<F, Fut>(&self, resource: Resource, handler: F)
    where
        F: Fn(String, RequestContext<RoleServer>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ReadResourceResult, ErrorData>> + Send + 'static,
    {
        let uri = resource.uri.clone();
        let entry = ResourceEntry {
            resource,
            handler: Arc::new(move |uri, context| Box::pin(handler(uri, context))),
        };
        Self::write(&self.inner.resources).add(uri, entry);
        self.notify_list_changed(ListChangedKind::Resources);
    }

    pub fn remove_resource(&self, uri: &str) -> bool {
        let removed = Self::write(&self.inner.resources).remove(uri).is_some();
        if removed {
            self.notify_list_changed(ListChangedKind::Resources);
        }
        removed
    }

    /// Register a resource template; templates match `resources/read` URIs
    /// that no exact resource matched, in registration order.
    pub fn add_resource_template<F, Fut>(
        &self,
        template: ResourceTemplate,
        handler: F,
    ) -> Result<(), ErrorData>
    where
        F: Fn(String, BTreeMap<String, String>, RequestContext<RoleServer>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<ReadResourceResult, ErrorData>> + Send + 'static,
    {
        let matcher = UriTemplate::parse(&template.uri_template)?;
        let key = template.uri_template.clone();
        let entry = TemplateEntry {
            template,
            matcher,
            handler: Arc::new(move |uri, vars, context| Box::pin(handler(uri, vars, context))),
        };
        Self::write(&self.inner.templates).add(key, entry);
        self.notify_list_changed(ListChangedKind::Resources);
        Ok(())
    }

    pub fn remove_resource_template(&self, uri_template: &str) -> bool {
        let removed = Self::write(&self.inner.templates).remove(uri_template).is_some();
        if removed {
            self.notify_list_changed(ListChangedKind::Resources);
        }
        removed
    }

    /// Install the `completion/complete` handler; without one the
    /// capability is not advertised and calls fail with method-not-found.
    pub fn set_completion_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(CompleteRequestParam, RequestContext<RoleServer>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CompleteResult, ErrorData>> + Send + 'static,
    {
        *Self::write(&self.inner.completion) =
            Some(Arc::new(move |params, context| Box::pin(handler(params, context))));
    }

    /// Hook invoked after every `resources/subscribe` (true) and
    /// `resources/unsubscribe` (false).
    pub fn set_subscription_hook<F, Fut>(&self, hook: F)
    where
        F: Fn(String, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *Self::write(&self.inner.subscription_hook) =
            Some(Arc::new(move |uri, subscribed| Box::pin(hook(uri, subscribed))));
    }

    /// Hook invoked on `notifications/roots/list_changed`, handed the
    /// session peer so it can re-query `roots/list`.
    pub fn on_roots_list_changed<F, Fut>(&self, hook: F)
    where
        F: Fn(Peer<RoleServer>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *Self::write(&self.inner.roots_changed_hook) =
            Some(Arc::new(move |peer| Box::pin(hook(peer))));
    }

    pub fn add_sending_middleware(&self, middleware: impl SendingMiddleware<RoleServer>) {
        Self::write(&self.inner.sending_middlewares).push(Arc::new(middleware));
    }

    pub fn add_receiving_middleware(&self, middleware: impl ReceivingMiddleware<RoleServer>) {
        Self::write(&self.inner.receiving_middlewares).push(Arc::new(middleware));
    }

    // -- session fan-out ------------------------------------------------------

    /// Emit `notifications/message` to every session whose log threshold
    /// admits `level`. Sessions that never set a level receive nothing.
    pub fn notify_log_message(&self, params: LoggingMessageNotificationParam) {
        let targets: Vec<Peer<RoleServer>> = self
            .lock_sessions()
            .iter()
            .filter(|session| {
                session
                    .log_level
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .is_some_and(|threshold| params.level >= threshold)
            })
            .map(|session| session.peer.clone())
            .collect();
        for peer in targets {
            let params = params.clone();
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(ServiceError::TransportClosed) =
                    peer.notify_logging_message(params).await
                {
                    server.remove_session(&peer);
                }
            });
        }
    }

    /// Emit `notifications/resources/updated` to the sessions currently
    /// subscribed to `uri`.
    pub fn notify_resource_updated(&self, uri: impl Into<String>) {
        let uri = uri.into();
        let targets: Vec<Peer<RoleServer>> = self
            .lock_sessions()
            .iter()
            .filter(|session| {
                session
                    .subscriptions
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .contains(&uri)
            })
            .map(|session| session.peer.clone())
            .collect();
        for peer in targets {
            let params = ResourceUpdatedNotificationParam { uri: uri.clone() };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(ServiceError::TransportClosed) =
                    peer.notify_resource_updated(params).await
                {
                    server.remove_session(&peer);
                }
            });
        }
    }

    fn notify_list_changed(&self, kind: ListChangedKind) {
        let targets: Vec<Peer<RoleServer>> = self
            .lock_sessions()
            .iter()
            .filter(|session| match kind {
                ListChangedKind::Tools => session.capabilities.supports_tools_list_changed(),
                ListChangedKind::Prompts => session.capabilities.supports_prompts_list_changed(),
                ListChangedKind::Resources => {
                    session.capabilities.supports_resources_list_changed()
                }
            })
            .map(|session| session.peer.clone())
            .collect();
        for peer in targets {
            let server = self.clone();
            tokio::spawn(async move {
                let result = match kind {
                    ListChangedKind::Tools => peer.notify_tool_list_changed().await,
                    ListChangedKind::Prompts => peer.notify_prompt_list_changed().await,
                    ListChangedKind::Resources => peer.notify_resource_list_changed().await,
                };
                if let Err(ServiceError::TransportClosed) = result {
                    server.remove_session(&peer);
                }
            });
        }
    }

    fn remove_session(&self, peer: &Peer<RoleServer>) {
        self.lock_sessions()
            .retain(|session| !session.peer.is_same_session(peer));
    }

    /// Register a session with the server's fan-out lists. Sessions served
    /// through the normal handshake register themselves in `initialize`;
    /// rehydrated sessions are bound here with their restored log level.
    pub fn bind_session(&self, peer: &Peer<RoleServer>, log_level: Option<LoggingLevel>) {
        let handle = SessionHandle {
            peer: peer.detached(),
            capabilities: self.capabilities(),
            log_level: Arc::new(Mutex::new(log_level)),
            subscriptions: Arc::new(RwLock::new(HashSet::new())),
        };
        let mut sessions = self.lock_sessions();
        sessions.retain(|session| !session.peer.is_same_session(peer));
        sessions.push(handle);
    }

    fn find_or_bind_session(&self, peer: &Peer<RoleServer>) -> SessionHandle {
        {
            let sessions = self.lock_sessions();
            if let Some(handle) = sessions
                .iter()
                .find(|session| session.peer.is_same_session(peer))
            {
                return handle.clone();
            }
        }
        self.bind_session(peer, None);
        let sessions = self.lock_sessions();
        sessions
            .iter()
            .find(|session| session.peer.is_same_session(peer))
            .cloned()
            .unwrap_or(SessionHandle {
                peer: peer.detached(),
                capabilities: ServerCapabilities::default(),
                log_level: Arc::new(Mutex::new(None)),
                subscriptions: Arc::new(RwLock::new(HashSet::new())),
            })
    }

    /// The log level a session last set, if any.
    pub fn session_log_level(&self, peer: &Peer<RoleServer>) -> Option<LoggingLevel> {
        self.lock_sessions()
            .iter()
            .find(|session| session.peer.is_same_session(peer))
            .and_then(|session| *session.log_level.lock().unwrap_or_else(|e| e.into_inner()))
    }

    // -- dispatch -------------------------------------------------------------

    fn handle_initialize(
        &self,
        _param: InitializeRequestParam,
        context: &RequestContext<RoleServer>,
    ) -> InitializeResult {
        self.bind_session(&context.peer, None);
        InitializeResult {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: self.capabilities(),
            server_info: self.inner.options.server_info.clone(),
            instructions: self.inner.options.instructions.clone(),
        }
    }

    async fn handle_call_tool(
        &self,
        params: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let (handler, input_validator, output_validator, output_schema) = {
            let tools = Self::read(&self.inner.tools);
            let entry = tools.get(&params.name).ok_or_else(|| {
                ErrorData::method_not_found(format!("tools/call:{}", params.name))
            })?;
            (
                entry.handler.clone(),
                entry.input_validator.clone(),
                entry.output_validator.clone(),
                entry.tool.output_schema.clone(),
            )
        };
        if let Some(validate) = input_validator {
            let arguments = Value::Object(params.arguments.clone().unwrap_or_default());
            validate(&arguments).map_err(|e| {
                ErrorData::invalid_params(format!("tool arguments rejected: {e}"), None)
            })?;
        }
        let result = handler(params.arguments, context).await;
        let result = match result {
            Ok(result) => result,
            Err(ToolError::Failure(message)) => {
                return Ok(CallToolResult::error(vec![Content::text(message)]));
            }
            Err(ToolError::Protocol(error)) => return Err(error),
        };
        // a declared output schema makes malformed structured output a
        // developer bug, surfaced as a protocol error rather than a tool
        // failure
        if output_schema.is_some() && !result.is_error() {
            match (&result.structured_content, output_validator) {
                (None, _) => {
                    return Err(ErrorData::internal_error(
                        "tool declares an output schema but returned no structured content",
                        None,
                    ));
                }
                (Some(content), Some(validate)) => {
                    validate(content).map_err(|e| {
                        ErrorData::internal_error(
                            format!("tool output failed schema validation: {e}"),
                            None,
                        )
                    })?;
                }
                (Some(_), None) => {}
            }
        }
        Ok(result)
    }

    async fn handle_get_prompt(
        &self,
        params: GetPromptRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, ErrorData> {
        let (handler, missing) = {
            let prompts = Self::read(&self.inner.prompts);
            let entry = prompts.get(&params.name).ok_or_else(|| {
                ErrorData::invalid_params(format!("prompt not found: {}", params.name), None)
            })?;
            let provided = params.arguments.clone().unwrap_or_default();
            let missing: Vec<String> = entry
                .prompt
                .required_arguments()
                .filter(|name| !provided.contains_key(*name))
                .map(str::to_string)
                .collect();
            (entry.handler.clone(), missing)
        };
        if !missing.is_empty() {
            return Err(ErrorData::invalid_params(
                format!("missing required prompt arguments: {}", missing.join(", ")),
                None,
            ));
        }
        handler(params.arguments.unwrap_or_default(), context).await
    }

    async fn handle_read_resource(
        &self,
        params: ReadResourceRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, ErrorData> {
        let exact = {
            let resources = Self::read(&self.inner.resources);
            resources.get(&params.uri).map(|entry| entry.handler.clone())
        };
        if let Some(handler) = exact {
            return handler(params.uri, context).await;
        }
        let templated = {
            let templates = Self::read(&self.inner.templates);
            templates.iter().find_map(|(_, entry)| {
                entry
                    .matcher
                    .matches(&params.uri)
                    .map(|vars| (entry.handler.clone(), vars))
            })
        };
        match templated {
            Some((handler, vars)) => handler(params.uri, vars, context).await,
            None => Err(ErrorData::resource_not_found(
                format!("resource not found: {}", params.uri),
                None,
            )),
        }
    }

    fn handle_subscribe(&self, uri: String, context: &RequestContext<RoleServer>, subscribed: bool) {
        let session = self.find_or_bind_session(&context.peer);
        {
            let mut subscriptions = session
                .subscriptions
                .write()
                .unwrap_or_else(|e| e.into_inner());
            if subscribed {
                subscriptions.insert(uri.clone());
            } else {
                subscriptions.remove(&uri);
            }
        }
        let hook = Self::read(&self.inner.subscription_hook).clone();
        if let Some(hook) = hook {
            tokio::spawn(hook(uri, subscribed));
        }
    }
}

impl Service<RoleServer> for Server {
    async fn handle_request(
        &self,
        request: ClientRequest,
        context: RequestContext<RoleServer>,
    ) -> Result<ServerResult, ErrorData> {
        match request {
            ClientRequest::Initialize(param) => Ok(ServerResult::Initialize(
                self.handle_initialize(param, &context),
            )),
            ClientRequest::Ping => Ok(ServerResult::Empty(EmptyResult {})),
            ClientRequest::ListTools(params) => {
                let cursor = params.and_then(|p| p.cursor);
                let (tools, next_cursor) = Self::read(&self.inner.tools).page(
                    cursor.as_deref(),
                    self.inner.options.page_size.max(1),
                    |entry| entry.tool.clone(),
                )?;
                Ok(ServerResult::ListTools(ListToolsResult { tools, next_cursor }))
            }
            ClientRequest::CallTool(params) => Ok(ServerResult::CallTool(
                self.handle_call_tool(params, context).await?,
            )),
            ClientRequest::ListPrompts(params) => {
                let cursor = params.and_then(|p| p.cursor);
                let (prompts, next_cursor) = Self::read(&self.inner.prompts).page(
                    cursor.as_deref(),
                    self.inner.options.page_size.max(1),
                    |entry| entry.prompt.clone(),
                )?;
                Ok(ServerResult::ListPrompts(ListPromptsResult {
                    prompts,
                    next_cursor,
                }))
            }
            ClientRequest::GetPrompt(params) => Ok(ServerResult::GetPrompt(
                self.handle_get_prompt(params, context).await?,
            )),
            ClientRequest::ListResources(params) => {
                let cursor = params.and_then(|p| p.cursor);
                let (resources, next_cursor) = Self::read(&self.inner.resources).page(
                    cursor.as_deref(),
                    self.inner.options.page_size.max(1),
                    |entry| entry.resource.clone(),
                )?;
                Ok(ServerResult::ListResources(ListResourcesResult {
                    resources,
                    next_cursor,
                }))
            }
            ClientRequest::ListResourceTemplates(params) => {
                let cursor = params.and_then(|p| p.cursor);
                let (resource_templates, next_cursor) = Self::read(&self.inner.templates).page(
                    cursor.as_deref(),
                    self.inner.options.page_size.max(1),
                    |entry| entry.template.clone(),
                )?;
                Ok(ServerResult::ListResourceTemplates(
                    ListResourceTemplatesResult {
                        resource_templates,
                        next_cursor,
                    },
                ))
            }
            ClientRequest::ReadResource(params) => Ok(ServerResult::ReadResource(
                self.handle_read_resource(params, context).await?,
            )),
            ClientRequest::Subscribe(SubscribeRequestParam { uri }) => {
                self.handle_subscribe(uri, &context, true);
                Ok(ServerResult::Empty(EmptyResult {}))
            }
            ClientRequest::Unsubscribe(UnsubscribeRequestParam { uri }) => {
                self.handle_subscribe(uri, &context, false);
                Ok(ServerResult::Empty(EmptyResult {}))
            }
            ClientRequest::SetLevel(SetLevelRequestParam { level }) => {
                let session = self.find_or_bind_session(&context.peer);
                *session.log_level.lock().unwrap_or_else(|e| e.into_inner()) = Some(level);
                Ok(ServerResult::Empty(EmptyResult {}))
            }
            ClientRequest::Complete(params) => {
                let handler = Self::read(&self.inner.completion).clone();
                match handler {
                    Some(handler) => {
                        Ok(ServerResult::Complete(handler(params, context).await?))
                    }
                    None => Err(ErrorData::method_not_found("completion/complete")),
                }
            }
        }
    }

    async fn handle_notification(
        &self,
        notification: ClientNotification,
        context: NotificationContext<RoleServer>,
    ) -> Result<(), ErrorData> {
        match notification {
            ClientNotification::RootsListChanged => {
                let hook = Self::read(&self.inner.roots_changed_hook).clone();
                if let Some(hook) = hook {
                    hook(context.peer).await;
                }
                Ok(())
            }
            // the engine consumes cancellation and subscribed progress
            // before the service sees them
            _ => Ok(()),
        }
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: self.capabilities(),
            server_info: self.inner.options.server_info.clone(),
            instructions: self.inner.options.instructions.clone(),
        }
    }

    fn session_options(&self) -> SessionOptions<RoleServer> {
        SessionOptions {
            keep_alive: self.inner.options.keep_alive,
            sending_middlewares: Self::read(&self.inner.sending_middlewares).clone(),
            receiving_middlewares: Self::read(&self.inner.receiving_middlewares).clone(),
        }
    }
}

/// Query the roots a connected client exposes, draining every page.
pub async fn list_all_roots(peer: &Peer<RoleServer>) -> Result<ListRootsResult, ServiceError> {
    let mut roots = Vec::new();
    let mut cursor = None;
    loop {
        let result = peer
            .list_roots(Some(PaginatedRequestParam { cursor }))
            .await?;
        roots.extend(result.roots);
        cursor = result.next_cursor;
        if cursor.is_none() {
            break;
        }
    }
    Ok(ListRootsResult {
        roots,
        next_cursor: None,
    })
}
