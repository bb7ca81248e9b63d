//! The tower `Service` behind the streamable HTTP endpoint.

use std::{
    collections::HashMap,
    convert::Infallible,
    fmt::Write as _,
    pin::Pin,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::Ordering,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode, header};
use http_body::Frame;
use http_body_util::{BodyExt, Full, StreamBody, combinators::BoxBody};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{
    HEADER_LAST_EVENT_ID, HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID, StreamableHttpServerConfig,
    random_session_id,
    session::{ServerSseMessage, SessionHandle, create_session},
};
use crate::{
    model::{
        ClientNotification, ClientRequest, ErrorData, Extensions, InitializeRequestParam,
        JsonRpcMessage, ProtocolVersion,
    },
    service::{RoleServer, RxJsonRpcMessage, serve_directly, serve_server},
    transport::{
        auth::TokenInfo,
        event_store::parse_event_id,
        session_store::{ServerSessionState, StoredSessionInfo},
    },
};

type ResponseBody = BoxBody<Bytes, Infallible>;
type HttpResponse = Response<ResponseBody>;

/// Request metadata exposed to handlers through the context extensions.
#[derive(Debug, Clone)]
pub struct HttpRequestInfo {
    pub method: Method,
    pub uri: http::Uri,
    pub headers: HeaderMap,
}

/// How long a throwaway stateless session lingers after its response went
/// out, so fire-and-forget notifications still reach their handlers.
const STATELESS_LINGER: Duration = Duration::from_secs(2);

struct Inner<S, F> {
    config: StreamableHttpServerConfig,
    service_factory: F,
    session_restore:
        Option<Arc<dyn Fn(&S, &crate::service::Peer<RoleServer>, &StoredSessionInfo) + Send + Sync>>,
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
    reaper_started: OnceLock<()>,
}

/// A streamable HTTP MCP endpoint. `F` builds one [`Service<RoleServer>`]
/// per session.
pub struct StreamableHttpService<S, F> {
    inner: Arc<Inner<S, F>>,
}

impl<S, F> Clone for StreamableHttpService<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, F> StreamableHttpService<S, F>
where
    S: crate::service::Service<RoleServer>,
    F: Fn() -> Result<S, std::io::Error> + Send + Sync + 'static,
{
    pub fn new(service_factory: F, config: StreamableHttpServerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                service_factory,
                session_restore: None,
                sessions: Arc::new(Mutex::new(HashMap::new())),
                reaper_started: OnceLock::new(),
            }),
        }
    }

    /// Hook run after a session is rehydrated from the session store, so
    /// the service can restore session-scoped state (log level).
    pub fn with_session_restore(
        mut self,
        hook: impl Fn(&S, &crate::service::Peer<RoleServer>, &StoredSessionInfo) + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_session_restore must be called before the service is shared");
        inner.session_restore = Some(Arc::new(hook));
        self
    }
}

impl<S, F, B> tower_service::Service<Request<B>> for StreamableHttpService<S, F>
where
    S: crate::service::Service<RoleServer>,
    F: Fn() -> Result<S, std::io::Error> + Send + Sync + 'static,
    B: http_body::Body + Send + 'static,
    B::Data: bytes::Buf + Send,
    B::Error: std::fmt::Display + Send,
{
    type Response = HttpResponse;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<HttpResponse, Infallible>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(handle(inner, request).await) })
    }
}

// -- response helpers --------------------------------------------------------

fn empty_body() -> ResponseBody {
    Full::new(Bytes::new()).boxed()
}

fn text_response(status: StatusCode, body: impl Into<String>) -> HttpResponse {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.into())).boxed())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn error_response(status: StatusCode, error: &ErrorData) -> HttpResponse {
    let body = serde_json::to_string(error).unwrap_or_else(|_| error.message.to_string());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

fn status_response(status: StatusCode) -> HttpResponse {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

fn method_not_allowed() -> HttpResponse {
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .header(header::ALLOW, "GET, POST, DELETE")
        .body(empty_body())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

/// Resolve an `Accept` header entry against a concrete content type, with
/// standard wildcard handling.
fn accept_allows(headers: &HeaderMap, content_type: &str) -> bool {
    let Some(accept) = headers.get(header::ACCEPT) else {
        return false;
    };
    let Ok(accept) = accept.to_str() else {
        return false;
    };
    accept.split(',').any(|entry| {
        let media = entry.split(';').next().unwrap_or("").trim();
        if media == "*/*" || media == content_type {
            return true;
        }
        media
            .strip_suffix("/*")
            .is_some_and(|main| content_type.starts_with(&format!("{main}/")))
    })
}

fn claimed_protocol_version(headers: &HeaderMap) -> Result<ProtocolVersion, HttpResponse> {
    match headers.get(HEADER_PROTOCOL_VERSION) {
        // absent header: the pre-header revision
        None => Ok(ProtocolVersion::V_2025_03_26),
        Some(value) => {
            let Ok(value) = value.to_str() else {
                return Err(text_response(
                    StatusCode::BAD_REQUEST,
                    format!(
                        "malformed {HEADER_PROTOCOL_VERSION} header; supported: {}",
                        ProtocolVersion::LATEST
                    ),
                ));
            };
            let version: ProtocolVersion = value.parse().unwrap_or_else(|never| match never {});
            if !version.is_supported() {
                return Err(text_response(
                    StatusCode::BAD_REQUEST,
                    format!(
                        "unsupported protocol version {value}; supported: {}",
                        ProtocolVersion::LATEST
                    ),
                ));
            }
            Ok(version)
        }
    }
}

fn header_value<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn sse_frame(event: &ServerSseMessage) -> Bytes {
    let data = serde_json::to_string(&event.message).unwrap_or_default();
    let mut frame = String::with_capacity(data.len() + 32);
    if let Some(event_id) = &event.event_id {
        let _ = writeln!(frame, "id: {event_id}");
    }
    let _ = writeln!(frame, "data: {data}");
    frame.push('\n');
    Bytes::from(frame)
}

struct CompletionGuard(Option<Box<dyn FnOnce() + Send>>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(hook) = self.0.take() {
            hook();
        }
    }
}

fn sse_response(
    events: mpsc::Receiver<ServerSseMessage>,
    keep_alive: Option<Duration>,
    session_id: Option<&str>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
) -> HttpResponse {
    let (frames_tx, frames_rx) = mpsc::channel::<Result<Frame<Bytes>, Infallible>>(16);
    tokio::spawn(pump_sse(events, keep_alive, frames_tx, on_complete));
    let body = BodyExt::boxed(StreamBody::new(ReceiverStream::new(frames_rx)));
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-store");
    if let Some(session_id) = session_id {
        builder = builder.header(HEADER_SESSION_ID, session_id);
    }
    builder
        .body(body)
        .unwrap_or_else(|_| Response::new(empty_body()))
}

async fn pump_sse(
    mut events: mpsc::Receiver<ServerSseMessage>,
    keep_alive: Option<Duration>,
    frames: mpsc::Sender<Result<Frame<Bytes>, Infallible>>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
) {
    let _guard = CompletionGuard(on_complete);
    let mut ticker = keep_alive.map(tokio::time::interval);
    if let Some(ticker) = &mut ticker {
        // the first tick fires immediately; skip it
        ticker.tick().await;
    }
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if frames.send(Ok(Frame::data(sse_frame(&event)))).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
            _ = async {
                match &mut ticker {
                    Some(ticker) => { ticker.tick().await; }
                    None => std::future::pending().await,
                }
            } => {
                if frames
                    .send(Ok(Frame::data(Bytes::from_static(b": keep-alive\n\n"))))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

// -- request handling --------------------------------------------------------

async fn handle<S, F, B>(inner: Arc<Inner<S, F>>, request: Request<B>) -> HttpResponse
where
    S: crate::service::Service<RoleServer>,
    F: Fn() -> Result<S, std::io::Error> + Send + Sync + 'static,
    B: http_body::Body + Send + 'static,
    B::Data: bytes::Buf + Send,
    B::Error: std::fmt::Display + Send,
{
    let (parts, body) = request.into_parts();

    let mut extensions = Extensions::new();
    extensions.insert(HttpRequestInfo {
        method: parts.method.clone(),
        uri: parts.uri.clone(),
        headers: parts.headers.clone(),
    });

    if let Some(verifier) = &inner.config.token_verifier {
        let token = header_value(&parts.headers, header::AUTHORIZATION.as_str())
            .and_then(|value| value.strip_prefix("Bearer "));
        let verified = match token {
            Some(token) => verifier.verify(token).await,
            None => Err(crate::transport::auth::TokenVerifyError::new(
                "missing bearer token",
            )),
        };
        match verified {
            Ok(info) => extensions.insert::<TokenInfo>(info),
            Err(e) => {
                let challenge = e
                    .www_authenticate
                    .clone()
                    .unwrap_or_else(|| "Bearer".to_string());
                return Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .header(header::WWW_AUTHENTICATE, challenge)
                    .body(empty_body())
                    .unwrap_or_else(|_| Response::new(empty_body()));
            }
        }
    }

    let version = match claimed_protocol_version(&parts.headers) {
        Ok(version) => version,
        Err(response) => return response,
    };

    match parts.method {
        Method::POST => handle_post(inner, parts.headers, body, version, extensions).await,
        Method::GET => handle_get(inner, parts.headers).await,
        Method::DELETE => handle_delete(inner, parts.headers).await,
        _ => method_not_allowed(),
    }
}

fn find_initialize_param(
    messages: &[RxJsonRpcMessage<RoleServer>],
) -> Option<InitializeRequestParam> {
    messages.iter().find_map(|message| match message {
        JsonRpcMessage::Request(request) => match &request.request {
            ClientRequest::Initialize(param) => Some(param.clone()),
            _ => None,
        },
        _ => None,
    })
}

fn contains_request(messages: &[RxJsonRpcMessage<RoleServer>]) -> bool {
    messages
        .iter()
        .any(|message| matches!(message, JsonRpcMessage::Request(_) | JsonRpcMessage::InvalidRequest { .. }))
}

async fn handle_post<S, F, B>(
    inner: Arc<Inner<S, F>>,
    headers: HeaderMap,
    body: B,
    version: ProtocolVersion,
    extensions: Extensions,
) -> HttpResponse
where
    S: crate::service::Service<RoleServer>,
    F: Fn() -> Result<S, std::io::Error> + Send + Sync + 'static,
    B: http_body::Body + Send + 'static,
    B::Data: bytes::Buf + Send,
    B::Error: std::fmt::Display + Send,
{
    if !accept_allows(&headers, "application/json") || !accept_allows(&headers, "text/event-stream")
    {
        return text_response(
            StatusCode::BAD_REQUEST,
            "Accept must include application/json and text/event-stream",
        );
    }

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return text_response(StatusCode::BAD_REQUEST, format!("body read failed: {e}")),
    };
    let body = match std::str::from_utf8(&body) {
        Ok(body) => body,
        Err(_) => return text_response(StatusCode::BAD_REQUEST, "body is not valid UTF-8"),
    };
    let messages = match RxJsonRpcMessage::<RoleServer>::decode_body(body, &version) {
        Ok(messages) => messages,
        Err(error) => return error_response(StatusCode::BAD_REQUEST, &error),
    };
    if messages.is_empty() {
        return status_response(StatusCode::ACCEPTED);
    }

    if !inner.config.stateful_mode {
        return handle_stateless_post(inner, messages, extensions).await;
    }

    if let Some(init_param) = find_initialize_param(&messages) {
        if messages.len() != 1 {
            return text_response(
                StatusCode::BAD_REQUEST,
                "initialize must be the only message in its request",
            );
        }
        return handle_initialize_post(inner, init_param, messages, extensions).await;
    }

    let Some(session_id) = header_value(&headers, HEADER_SESSION_ID).map(str::to_string) else {
        return text_response(
            StatusCode::BAD_REQUEST,
            format!("missing {HEADER_SESSION_ID} header"),
        );
    };
    let handle = match find_session(&inner, &session_id).await {
        Ok(handle) => handle,
        Err(response) => return response,
    };

    // refcount: +1 on arrival, -1 once the response (stream) is done
    handle.refs.fetch_add(1, Ordering::SeqCst);
    if let Some(store) = &inner.config.session_store {
        let _ = store.update_refs(&session_id, 1).await;
    }
    track_state_changes(&inner, &session_id, &messages).await;

    let release = make_release_hook(&inner, handle.clone());

    if contains_request(&messages) {
        match handle.open_request_stream(messages, extensions).await {
            Ok(events) => sse_response(
                events,
                inner.config.sse_keep_alive,
                Some(&session_id),
                Some(release),
            ),
            Err(_) => {
                release();
                remove_session(&inner, &session_id);
                text_response(StatusCode::NOT_FOUND, "session closed")
            }
        }
    } else {
        let result = handle.accept(messages, extensions).await;
        release();
        match result {
            Ok(()) => {
                let mut response = status_response(StatusCode::ACCEPTED);
                if let Ok(value) = session_id.parse() {
                    response.headers_mut().insert(HEADER_SESSION_ID, value);
                }
                response
            }
            Err(_) => {
                remove_session(&inner, &session_id);
                text_response(StatusCode::NOT_FOUND, "session closed")
            }
        }
    }
}

async fn handle_initialize_post<S, F>(
    inner: Arc<Inner<S, F>>,
    init_param: InitializeRequestParam,
    messages: Vec<RxJsonRpcMessage<RoleServer>>,
    extensions: Extensions,
) -> HttpResponse
where
    S: crate::service::Service<RoleServer>,
    F: Fn() -> Result<S, std::io::Error> + Send + Sync + 'static,
{
    let service = match (inner.service_factory)() {
        Ok(service) => service,
        Err(e) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("service construction failed: {e}"),
            );
        }
    };
    let session_id: String = match &inner.config.session_id_generator {
        Some(generator) => generator(),
        None => random_session_id(),
    };
    let (handle, transport) = create_session(
        session_id.clone().into(),
        inner.config.event_store.clone(),
    );

    // the initialize request flows through the normal handshake so version
    // selection and the pre-initialized gate apply
    tokio::spawn({
        let session_id = session_id.clone();
        async move {
            match serve_server(service, transport).await {
                Ok(running) => {
                    if let Err(e) = running.waiting().await {
                        tracing::debug!(session_id, "session task ended: {e}");
                    }
                }
                Err(e) => tracing::debug!(session_id, "session handshake failed: {e}"),
            }
        }
    });

    if let Some(store) = &inner.config.session_store {
        let info = StoredSessionInfo::new(
            ServerSessionState {
                init_params: Some(init_param),
                initialized: false,
                log_level: None,
            },
            inner.config.session_timeout,
        );
        if let Err(e) = store
            .put(&session_id, info, inner.config.session_timeout)
            .await
        {
            tracing::warn!("session store put failed: {e}");
        }
        let _ = store.update_refs(&session_id, 1).await;
    }

    handle.refs.fetch_add(1, Ordering::SeqCst);
    let release = make_release_hook(&inner, handle.clone());
    let events = match handle.open_request_stream(messages, extensions).await {
        Ok(events) => events,
        Err(_) => {
            release();
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "session failed to start");
        }
    };

    inner
        .sessions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(session_id.clone(), handle);
    start_reaper(&inner);

    sse_response(
        events,
        inner.config.sse_keep_alive,
        Some(&session_id),
        Some(release),
    )
}

async fn handle_stateless_post<S, F>(
    inner: Arc<Inner<S, F>>,
    messages: Vec<RxJsonRpcMessage<RoleServer>>,
    extensions: Extensions,
) -> HttpResponse
where
    S: crate::service::Service<RoleServer>,
    F: Fn() -> Result<S, std::io::Error> + Send + Sync + 'static,
{
    let service = match (inner.service_factory)() {
        Ok(service) => service,
        Err(e) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("service construction failed: {e}"),
            );
        }
    };
    let init_param = find_initialize_param(&messages);
    let (handle, transport) = create_session("".into(), None);
    let running = serve_directly(service, transport, init_param, CancellationToken::new());
    drop(running);

    if contains_request(&messages) {
        let close = {
            let handle = handle.clone();
            Box::new(move || handle.close()) as Box<dyn FnOnce() + Send>
        };
        match handle.open_request_stream(messages, extensions).await {
            Ok(events) => sse_response(events, inner.config.sse_keep_alive, None, Some(close)),
            Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "session failed to start"),
        }
    } else {
        let result = handle.accept(messages, extensions).await;
        tokio::spawn(async move {
            tokio::time::sleep(STATELESS_LINGER).await;
            handle.close();
        });
        match result {
            Ok(()) => status_response(StatusCode::ACCEPTED),
            Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "session failed to start"),
        }
    }
}

async fn handle_get<S, F>(inner: Arc<Inner<S, F>>, headers: HeaderMap) -> HttpResponse
where
    S: crate::service::Service<RoleServer>,
    F: Fn() -> Result<S, std::io::Error> + Send + Sync + 'static,
{
    if !inner.config.stateful_mode {
        return method_not_allowed();
    }
    if !accept_allows(&headers, "text/event-stream") {
        return text_response(
            StatusCode::BAD_REQUEST,
            "Accept must include text/event-stream",
        );
    }
    let Some(session_id) = header_value(&headers, HEADER_SESSION_ID).map(str::to_string) else {
        return text_response(
            StatusCode::BAD_REQUEST,
            format!("missing {HEADER_SESSION_ID} header"),
        );
    };
    let handle = match find_session(&inner, &session_id).await {
        Ok(handle) => handle,
        Err(response) => return response,
    };

    let events = match header_value(&headers, HEADER_LAST_EVENT_ID) {
        Some(last_event_id) => {
            let Some((stream_id, index)) = parse_event_id(last_event_id) else {
                return text_response(StatusCode::BAD_REQUEST, "malformed Last-Event-ID");
            };
            match handle.resume(stream_id, index).await {
                Ok(Ok(events)) => events,
                Ok(Err(error)) => return error_response(StatusCode::BAD_REQUEST, &error),
                Err(_) => return text_response(StatusCode::NOT_FOUND, "session closed"),
            }
        }
        None => match handle.open_standalone().await {
            Ok(events) => events,
            Err(_) => return text_response(StatusCode::NOT_FOUND, "session closed"),
        },
    };
    sse_response(events, inner.config.sse_keep_alive, Some(&session_id), None)
}

async fn handle_delete<S, F>(inner: Arc<Inner<S, F>>, headers: HeaderMap) -> HttpResponse
where
    S: crate::service::Service<RoleServer>,
    F: Fn() -> Result<S, std::io::Error> + Send + Sync + 'static,
{
    if !inner.config.stateful_mode {
        return method_not_allowed();
    }
    let Some(session_id) = header_value(&headers, HEADER_SESSION_ID).map(str::to_string) else {
        return text_response(
            StatusCode::BAD_REQUEST,
            format!("missing {HEADER_SESSION_ID} header"),
        );
    };
    if let Some(handle) = inner
        .sessions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&session_id)
    {
        handle.close();
    }
    if let Some(store) = &inner.config.session_store {
        let _ = store.delete(&session_id).await;
    }
    if let Some(event_store) = &inner.config.event_store {
        let _ = event_store.purge_session(&session_id).await;
    }
    status_response(StatusCode::NO_CONTENT)
}

// -- session lookup, rehydration, lifecycle ----------------------------------

async fn find_session<S, F>(
    inner: &Arc<Inner<S, F>>,
    session_id: &str,
) -> Result<SessionHandle, HttpResponse>
where
    S: crate::service::Service<RoleServer>,
    F: Fn() -> Result<S, std::io::Error> + Send + Sync + 'static,
{
    let local = inner
        .sessions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(session_id)
        .cloned();
    if let Some(handle) = local {
        return Ok(handle);
    }

    // known to the shared store but not to this instance: rehydrate
    let Some(store) = &inner.config.session_store else {
        return Err(text_response(StatusCode::NOT_FOUND, "unknown session"));
    };
    let info = match store.get(session_id).await {
        Ok(Some(info)) => info,
        Ok(None) => return Err(text_response(StatusCode::NOT_FOUND, "unknown session")),
        Err(e) => {
            return Err(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("session store failure: {e}"),
            ));
        }
    };
    let service = (inner.service_factory)().map_err(|e| {
        text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("service construction failed: {e}"),
        )
    })?;
    let (handle, transport) = create_session(
        session_id.to_string().into(),
        inner.config.event_store.clone(),
    );
    let running = serve_directly(
        service,
        transport,
        info.session_state.init_params.clone(),
        CancellationToken::new(),
    );
    if let Some(restore) = &inner.session_restore {
        restore(running.service(), running.peer(), &info);
    }
    drop(running);

    let mut sessions = inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
    let handle = sessions
        .entry(session_id.to_string())
        .or_insert(handle)
        .clone();
    drop(sessions);
    start_reaper(inner);
    tracing::info!(session_id, "session rehydrated from the session store");
    Ok(handle)
}

fn remove_session<S, F>(inner: &Arc<Inner<S, F>>, session_id: &str) {
    if let Some(handle) = inner
        .sessions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(session_id)
    {
        handle.close();
    }
}

/// Builds the hook that runs when a POST's response is complete:
/// decrement the refcounts and restart the idle clock.
fn make_release_hook<S, F>(
    inner: &Arc<Inner<S, F>>,
    handle: SessionHandle,
) -> Box<dyn FnOnce() + Send>
where
    S: crate::service::Service<RoleServer>,
    F: Fn() -> Result<S, std::io::Error> + Send + Sync + 'static,
{
    let store = inner.config.session_store.clone();
    let timeout = inner.config.session_timeout;
    Box::new(move || {
        handle.refs.fetch_sub(1, Ordering::SeqCst);
        *handle.idle_since.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        if let Some(store) = store {
            let session_id = handle.id.clone();
            if tokio::runtime::Handle::try_current().is_ok() {
                tokio::spawn(async move {
                    let _ = store.update_refs(&session_id, -1).await;
                    let _ = store.refresh_ttl(&session_id, timeout).await;
                });
            }
        }
    })
}

/// Mirror session-state-changing client messages into the session store.
async fn track_state_changes<S, F>(
    inner: &Arc<Inner<S, F>>,
    session_id: &str,
    messages: &[RxJsonRpcMessage<RoleServer>],
) {
    let Some(store) = &inner.config.session_store else {
        return;
    };
    let mut initialized = false;
    let mut log_level = None;
    for message in messages {
        match message {
            JsonRpcMessage::Notification(notification) => {
                if matches!(notification.notification, ClientNotification::Initialized) {
                    initialized = true;
                }
            }
            JsonRpcMessage::Request(request) => {
                if let ClientRequest::SetLevel(param) = &request.request {
                    log_level = Some(param.level);
                }
            }
            _ => {}
        }
    }
    if !initialized && log_level.is_none() {
        return;
    }
    let Ok(Some(mut info)) = store.get(session_id).await else {
        return;
    };
    if initialized {
        info.session_state.initialized = true;
    }
    if let Some(level) = log_level {
        info.session_state.log_level = Some(level);
    }
    info.last_accessed_at = std::time::SystemTime::now();
    if let Err(e) = store
        .put(session_id, info, inner.config.session_timeout)
        .await
    {
        tracing::warn!("session store update failed: {e}");
    }
}

fn start_reaper<S, F>(inner: &Arc<Inner<S, F>>)
where
    S: Send + Sync + 'static,
    F: Send + Sync + 'static,
{
    let Some(timeout) = inner.config.session_timeout else {
        return;
    };
    inner.reaper_started.get_or_init(|| {
        let sessions = Arc::downgrade(&inner.sessions);
        let interval = timeout.min(Duration::from_secs(30)).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(sessions) = sessions.upgrade() else {
                    return;
                };
                let mut sessions = sessions.lock().unwrap_or_else(|e| e.into_inner());
                sessions.retain(|session_id, handle| {
                    let idle = handle.refs.load(Ordering::SeqCst) <= 0
                        && handle
                            .idle_since
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .elapsed()
                            > timeout;
                    if idle {
                        tracing::info!(session_id, "closing idle session");
                        handle.close();
                    }
                    !idle
                });
            }
        });
    });
}
