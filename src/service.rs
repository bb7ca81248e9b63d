//! The transport-agnostic JSON-RPC session engine.
//!
//! One [`serve_inner`] loop per session owns the transport: it correlates
//! responses to pending outgoing requests, dispatches every incoming request
//! onto its own task (tool dispatch is never serialised; a tool that calls
//! back into its caller must not deadlock the session), routes progress and
//! cancellation notifications, and drives the optional keep-alive.
//!
//! Ordering: a completed `send_notification` means the peer will observe the
//! notification before any later message from the same caller activity. The
//! loop acknowledges the notification only after the transport write
//! returned; multiplexing transports keep their outbound streams in
//! enqueue order.

use std::{
    collections::HashMap,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    model::{
        CancelledNotificationParam, ErrorData, Extensions, JsonRpcMessage, Meta, NumberOrString,
        ProgressNotificationParam, ProgressToken, RequestId, WireMethod,
    },
    transport::{DynamicTransportError, IntoTransport, OutgoingMessage, Transport},
};

#[cfg(feature = "client")]
pub mod client;
mod middleware;
#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "client")]
pub use client::{ClientInitializeError, RoleClient, serve_client, serve_client_with_ct};
pub use middleware::{
    NextNotification, NextRequest, NextSend, ReceivingMiddleware, SendingMiddleware,
};
#[cfg(feature = "server")]
pub use server::{
    RoleServer, ServerInitializeError, serve_directly, serve_server, serve_server_with_ct,
};

/// One side of the protocol. The role fixes which requests travel in which
/// direction and supplies the few constructors the generic engine needs.
pub trait ServiceRole: std::fmt::Debug + Send + Sync + Clone + Copy + Default + 'static {
    type Req: WireMethod + std::fmt::Debug + Clone + Send + Sync + 'static;
    type Resp: serde::Serialize + std::fmt::Debug + Clone + Send + Sync + 'static;
    type Not: WireMethod + std::fmt::Debug + Clone + Send + Sync + 'static;
    type PeerReq: WireMethod + std::fmt::Debug + Clone + Send + Sync + 'static;
    type PeerNot: WireMethod + std::fmt::Debug + Clone + Send + Sync + 'static;
    type Info: std::fmt::Debug + Clone + Send + Sync + 'static;
    type PeerInfo: std::fmt::Debug + Clone + Send + Sync + 'static;
    const IS_CLIENT: bool;

    fn ping_request() -> Self::Req;
    fn cancelled_notification(param: CancelledNotificationParam) -> Self::Not;
    fn progress_notification(param: ProgressNotificationParam) -> Self::Not;

    /// Attach an outgoing progress token to a request that can carry one.
    /// Returns false when the request type has no `_meta`.
    fn attach_progress_token(request: &mut Self::Req, token: &ProgressToken) -> bool;

    fn peer_request_meta(request: &Self::PeerReq) -> Option<&Meta>;
    fn match_cancelled(notification: &Self::PeerNot) -> Option<&CancelledNotificationParam>;
    fn match_progress(notification: &Self::PeerNot) -> Option<&ProgressNotificationParam>;

    /// What to answer when a handler panics. Tool calls degrade to a tool
    /// failure; everything else surfaces an internal error.
    fn panic_response(request: &Self::PeerReq) -> Result<Self::Resp, ErrorData>;
}

/// Messages this side emits on the wire.
pub type TxJsonRpcMessage<R> =
    JsonRpcMessage<<R as ServiceRole>::Req, <R as ServiceRole>::Not>;
/// Messages the peer emits; what this side receives.
pub type RxJsonRpcMessage<R> =
    JsonRpcMessage<<R as ServiceRole>::PeerReq, <R as ServiceRole>::PeerNot>;

/// The user-facing half of a session: the set of handlers the engine
/// dispatches incoming traffic to.
pub trait Service<R: ServiceRole>: Send + Sync + 'static {
    fn handle_request(
        &self,
        request: R::PeerReq,
        context: RequestContext<R>,
    ) -> impl Future<Output = Result<R::Resp, ErrorData>> + Send + '_;

    fn handle_notification(
        &self,
        notification: R::PeerNot,
        context: NotificationContext<R>,
    ) -> impl Future<Output = Result<(), ErrorData>> + Send + '_;

    fn get_info(&self) -> R::Info;

    /// Session-level tuning: keep-alive and middleware chains.
    fn session_options(&self) -> SessionOptions<R> {
        SessionOptions::default()
    }
}

/// Per-session tuning supplied by the [`Service`].
pub struct SessionOptions<R: ServiceRole> {
    /// Ping the peer at this interval; an unanswered ping closes the session.
    pub keep_alive: Option<Duration>,
    pub sending_middlewares: Vec<Arc<dyn SendingMiddleware<R>>>,
    pub receiving_middlewares: Vec<Arc<dyn ReceivingMiddleware<R>>>,
}

impl<R: ServiceRole> Default for SessionOptions<R> {
    fn default() -> Self {
        Self {
            keep_alive: None,
            sending_middlewares: Vec::new(),
            receiving_middlewares: Vec::new(),
        }
    }
}

/// Why a session loop stopped.
#[derive(Debug)]
pub enum QuitReason {
    Cancelled,
    Closed,
    TransportError(DynamicTransportError),
}

/// Errors surfaced by operations on a live session.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The peer answered with a JSON-RPC error.
    #[error("mcp error: {0}")]
    McpError(ErrorData),
    #[error("transport send error: {0}")]
    TransportSend(DynamicTransportError),
    #[error("transport closed")]
    TransportClosed,
    #[error("unexpected response shape: {0}")]
    UnexpectedResponse(serde_json::Error),
    #[error("cancelled")]
    Cancelled,
    #[error("request rejected before sending: {0}")]
    Rejected(ErrorData),
}

/// Allocates per-session outgoing request ids; monotone, starting at 1.
#[derive(Debug, Default)]
pub struct AtomicI64RequestIdProvider {
    id: AtomicI64,
}

impl AtomicI64RequestIdProvider {
    pub fn next_request_id(&self) -> RequestId {
        NumberOrString::Number(self.id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// A per-incoming-notification handler registered for the lifetime of the
/// outgoing call that attached the progress token.
pub type ProgressHandler = Box<dyn FnMut(ProgressNotificationParam) + Send + 'static>;

/// Options of a single outgoing call.
#[derive(Default)]
pub struct PeerRequestOptions {
    pub ct: Option<CancellationToken>,
    pub progress_handler: Option<ProgressHandler>,
}

impl PeerRequestOptions {
    pub fn cancellable(ct: CancellationToken) -> Self {
        Self {
            ct: Some(ct),
            progress_handler: None,
        }
    }
}

pub(crate) enum PeerSinkMessage<R: ServiceRole> {
    Request {
        request: R::Req,
        id: RequestId,
        responder: oneshot::Sender<Result<Value, ServiceError>>,
        progress: Option<(ProgressToken, ProgressHandler)>,
        related: Option<RequestId>,
    },
    Notification {
        notification: R::Not,
        responder: oneshot::Sender<Result<(), ServiceError>>,
        related: Option<RequestId>,
    },
    Response {
        response: R::Resp,
        id: RequestId,
    },
    ErrorResponse {
        error: ErrorData,
        id: RequestId,
    },
    CancelOutgoing {
        id: RequestId,
        reason: Option<String>,
        done: oneshot::Sender<()>,
    },
}

/// Handle to the remote peer: issues requests and notifications into the
/// session loop. Cloneable; a clone handed to a request context stays bound
/// to that request so transports can route related traffic onto its stream.
pub struct Peer<R: ServiceRole> {
    tx: mpsc::Sender<PeerSinkMessage<R>>,
    info: Arc<OnceLock<R::PeerInfo>>,
    id_provider: Arc<AtomicI64RequestIdProvider>,
    related: Option<RequestId>,
}

impl<R: ServiceRole> Clone for Peer<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            info: self.info.clone(),
            id_provider: self.id_provider.clone(),
            related: self.related.clone(),
        }
    }
}

impl<R: ServiceRole> std::fmt::Debug for Peer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("role", &R::default())
            .field("related", &self.related)
            .finish()
    }
}

const SINK_CHANNEL_SIZE: usize = 64;

impl<R: ServiceRole> Peer<R> {
    pub(crate) fn new(
        id_provider: Arc<AtomicI64RequestIdProvider>,
        peer_info: Option<R::PeerInfo>,
    ) -> (Self, mpsc::Receiver<PeerSinkMessage<R>>) {
        let (tx, rx) = mpsc::channel(SINK_CHANNEL_SIZE);
        let info = OnceLock::new();
        if let Some(peer_info) = peer_info {
            let _ = info.set(peer_info);
        }
        (
            Self {
                tx,
                info: Arc::new(info),
                id_provider,
                related: None,
            },
            rx,
        )
    }

    /// Capabilities and implementation info the peer declared at initialize.
    pub fn peer_info(&self) -> Option<&R::PeerInfo> {
        self.info.get()
    }

    pub(crate) fn set_peer_info(&self, info: R::PeerInfo) {
        let _ = self.info.set(info);
    }

    pub(crate) fn bind_related(mut self, id: RequestId) -> Self {
        self.related = Some(id);
        self
    }

    /// A clone of this handle with no request binding: messages sent
    /// through it travel on the session's background channel.
    pub fn detached(&self) -> Self {
        let mut peer = self.clone();
        peer.related = None;
        peer
    }

    /// Whether two handles address the same session.
    pub fn is_same_session(&self, other: &Peer<R>) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Issue a request and wait for the peer's raw result.
    pub async fn send_request(&self, request: R::Req) -> Result<Value, ServiceError> {
        self.send_request_with(request, PeerRequestOptions::default())
            .await
    }

    /// Issue a request with cancellation and/or a progress subscription.
    ///
    /// When the token fires, the pending slot is discarded, a
    /// `notifications/cancelled` for the call's id is sent, and only then
    /// does this return [`ServiceError::Cancelled`].
    pub async fn send_request_with(
        &self,
        mut request: R::Req,
        options: PeerRequestOptions,
    ) -> Result<Value, ServiceError> {
        let id = self.id_provider.next_request_id();
        let mut progress = None;
        if let Some(handler) = options.progress_handler {
            let token = ProgressToken(id.clone());
            if R::attach_progress_token(&mut request, &token) {
                progress = Some((token, handler));
            }
        }
        let (responder, receiver) = oneshot::channel();
        self.tx
            .send(PeerSinkMessage::Request {
                request,
                id: id.clone(),
                responder,
                progress,
                related: self.related.clone(),
            })
            .await
            .map_err(|_| ServiceError::TransportClosed)?;

        match options.ct {
            None => receiver.await.map_err(|_| ServiceError::TransportClosed)?,
            Some(ct) => {
                tokio::select! {
                    result = receiver => result.map_err(|_| ServiceError::TransportClosed)?,
                    _ = ct.cancelled() => {
                        let (done, done_rx) = oneshot::channel();
                        let _ = self
                            .tx
                            .send(PeerSinkMessage::CancelOutgoing {
                                id,
                                reason: None,
                                done,
                            })
                            .await;
                        let _ = done_rx.await;
                        Err(ServiceError::Cancelled)
                    }
                }
            }
        }
    }

    /// Send a notification. Resolves once the transport write completed, so
    /// a subsequent message from this caller is observed after it.
    pub async fn send_notification(&self, notification: R::Not) -> Result<(), ServiceError> {
        let (responder, receiver) = oneshot::channel();
        self.tx
            .send(PeerSinkMessage::Notification {
                notification,
                responder,
                related: self.related.clone(),
            })
            .await
            .map_err(|_| ServiceError::TransportClosed)?;
        receiver.await.map_err(|_| ServiceError::TransportClosed)?
    }
}

/// Everything an incoming request's handler gets to see.
pub struct RequestContext<R: ServiceRole> {
    /// Fires on peer `notifications/cancelled`, local deadline or session
    /// teardown. Handlers must return promptly once it does.
    pub ct: CancellationToken,
    pub id: RequestId,
    pub meta: Meta,
    /// Transport-supplied extras: token info, HTTP request parts.
    pub extensions: Extensions,
    /// Bound to this request: messages sent through it are routed onto the
    /// stream that carried the request.
    pub peer: Peer<R>,
}

impl<R: ServiceRole> RequestContext<R> {
    /// Send a progress notification tied to this request's progress token.
    /// A request without a token makes this a no-op.
    pub async fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<(), ServiceError> {
        let Some(progress_token) = self.meta.progress_token() else {
            return Ok(());
        };
        self.peer
            .send_notification(R::progress_notification(ProgressNotificationParam {
                progress_token,
                progress,
                total,
                message,
            }))
            .await
    }
}

/// Everything an incoming notification's handler gets to see.
pub struct NotificationContext<R: ServiceRole> {
    pub extensions: Extensions,
    pub peer: Peer<R>,
}

/// A live session: the peer handle plus the loop's join handle.
pub struct RunningService<R: ServiceRole, S: Service<R>> {
    service: Arc<S>,
    peer: Peer<R>,
    ct: CancellationToken,
    handle: tokio::task::JoinHandle<QuitReason>,
}

impl<R: ServiceRole, S: Service<R>> std::ops::Deref for RunningService<R, S> {
    type Target = Peer<R>;
    fn deref(&self) -> &Self::Target {
        &self.peer
    }
}

impl<R: ServiceRole, S: Service<R>> RunningService<R, S> {
    pub fn peer(&self) -> &Peer<R> {
        &self.peer
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.ct
    }

    /// Tear the session down and wait for the loop to finish.
    pub async fn cancel(self) -> Result<QuitReason, tokio::task::JoinError> {
        self.ct.cancel();
        self.handle.await
    }

    /// Wait until the session ends on its own.
    pub async fn waiting(self) -> Result<QuitReason, tokio::task::JoinError> {
        self.handle.await
    }
}

/// Convenience `serve` entry points on handler types, mirroring the role
/// specific `serve_client`/`serve_server` functions.
pub trait ServiceExt<R: ServiceRole>: Service<R> + Sized {
    fn serve<T, E, A>(
        self,
        transport: T,
    ) -> impl Future<Output = Result<RunningService<R, Self>, R::InitializeError>> + Send
    where
        T: IntoTransport<R, E, A>,
        E: std::error::Error + Send + Sync + 'static,
        R: RoleWithInitialize<Self>;

    fn serve_with_ct<T, E, A>(
        self,
        transport: T,
        ct: CancellationToken,
    ) -> impl Future<Output = Result<RunningService<R, Self>, R::InitializeError>> + Send
    where
        T: IntoTransport<R, E, A>,
        E: std::error::Error + Send + Sync + 'static,
        R: RoleWithInitialize<Self>;
}

/// Glue between the generic [`ServiceExt`] surface and the role-specific
/// handshake functions.
pub trait RoleWithInitialize<S>: ServiceRole
where
    S: Service<Self>,
{
    type InitializeError: std::error::Error + Send + Sync + 'static;

    fn serve_with_ct<T, E, A>(
        service: S,
        transport: T,
        ct: CancellationToken,
    ) -> impl Future<Output = Result<RunningService<Self, S>, Self::InitializeError>> + Send
    where
        T: IntoTransport<Self, E, A>,
        E: std::error::Error + Send + Sync + 'static;
}

impl<R, S> ServiceExt<R> for S
where
    R: ServiceRole,
    S: Service<R>,
{
    async fn serve<T, E, A>(self, transport: T) -> Result<RunningService<R, Self>, R::InitializeError>
    where
        T: IntoTransport<R, E, A>,
        E: std::error::Error + Send + Sync + 'static,
        R: RoleWithInitialize<Self>,
    {
        R::serve_with_ct(self, transport, CancellationToken::new()).await
    }

    async fn serve_with_ct<T, E, A>(
        self,
        transport: T,
        ct: CancellationToken,
    ) -> Result<RunningService<R, Self>, R::InitializeError>
    where
        T: IntoTransport<R, E, A>,
        E: std::error::Error + Send + Sync + 'static,
        R: RoleWithInitialize<Self>,
    {
        R::serve_with_ct(self, transport, ct).await
    }
}

fn transport_send_error<T: 'static, E>(error: E) -> ServiceError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ServiceError::TransportSend(DynamicTransportError::new::<T>(error))
}

/// Spawn the session loop over an already-initialised transport.
pub(crate) fn serve_inner<R, S, T>(
    service: S,
    transport: T,
    peer: Peer<R>,
    peer_rx: mpsc::Receiver<PeerSinkMessage<R>>,
    ct: CancellationToken,
) -> RunningService<R, S>
where
    R: ServiceRole,
    S: Service<R>,
    T: Transport<R> + 'static,
{
    let service = Arc::new(service);
    let options = service.session_options();
    let request_chain = middleware::compose_request_chain(service.clone(), &options.receiving_middlewares);
    let notification_chain =
        middleware::compose_notification_chain(service.clone(), &options.receiving_middlewares);
    let send_chain = middleware::compose_send_chain(&options.sending_middlewares);

    if let Some(interval) = options.keep_alive {
        spawn_keep_alive(peer.clone(), interval, ct.clone());
    }

    let loop_peer = peer.clone();
    let loop_ct = ct.clone();
    let handle = tokio::spawn(async move {
        let mut session = SessionLoop::<R, T> {
            transport,
            pending: HashMap::new(),
            progress_subscriptions: HashMap::new(),
            token_by_request: HashMap::new(),
            inflight: HashMap::new(),
            request_chain,
            notification_chain,
            send_chain,
            peer: loop_peer,
            ct: loop_ct,
        };
        let reason = session.run(peer_rx).await;
        session.shutdown().await;
        tracing::info!(?reason, "session loop finished");
        reason
    });

    RunningService {
        service,
        peer,
        ct,
        handle,
    }
}

fn spawn_keep_alive<R: ServiceRole>(peer: Peer<R>, interval: Duration, ct: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = ct.cancelled() => return,
            }
            match tokio::time::timeout(interval, peer.send_request(R::ping_request())).await {
                Ok(Ok(_)) => {}
                Ok(Err(ServiceError::McpError(e))) => {
                    // an error response still proves the peer is alive
                    tracing::debug!("keep-alive ping answered with error: {e}");
                }
                Ok(Err(e)) => {
                    tracing::warn!("keep-alive ping failed: {e}; closing session");
                    ct.cancel();
                    return;
                }
                Err(_) => {
                    tracing::warn!("keep-alive ping timed out; closing session");
                    ct.cancel();
                    return;
                }
            }
        }
    });
}

struct SessionLoop<R: ServiceRole, T: Transport<R>> {
    transport: T,
    pending: HashMap<RequestId, oneshot::Sender<Result<Value, ServiceError>>>,
    progress_subscriptions: HashMap<ProgressToken, ProgressHandler>,
    token_by_request: HashMap<RequestId, ProgressToken>,
    inflight: HashMap<RequestId, CancellationToken>,
    request_chain: NextRequest<R>,
    notification_chain: NextNotification<R>,
    send_chain: NextSend<R>,
    peer: Peer<R>,
    ct: CancellationToken,
}

impl<R: ServiceRole, T: Transport<R>> SessionLoop<R, T> {
    async fn run(&mut self, mut peer_rx: mpsc::Receiver<PeerSinkMessage<R>>) -> QuitReason {
        loop {
            tokio::select! {
                incoming = self.transport.receive() => {
                    match incoming {
                        Some((message, extensions)) => {
                            if let Some(reason) = self.handle_incoming(message, extensions).await {
                                return reason;
                            }
                        }
                        None => return QuitReason::Closed,
                    }
                }
                sink = peer_rx.recv() => {
                    match sink {
                        Some(message) => {
                            if let Some(reason) = self.handle_sink(message).await {
                                return reason;
                            }
                        }
                        // every peer handle is gone; nothing can use the
                        // session any more
                        None => return QuitReason::Closed,
                    }
                }
                _ = self.ct.cancelled() => return QuitReason::Cancelled,
            }
        }
    }

    async fn send_through_chain(
        &mut self,
        item: OutgoingMessage<R>,
    ) -> Result<Result<(), T::Error>, ErrorData> {
        let item = self.send_chain.call(item).await?;
        Ok(self.transport.send(item).await)
    }

    /// Returns a quit reason to stop the loop.
    async fn handle_incoming(
        &mut self,
        message: RxJsonRpcMessage<R>,
        extensions: Extensions,
    ) -> Option<QuitReason> {
        match message {
            JsonRpcMessage::Response(response) => {
                self.resolve_pending(response.id, Ok(response.result));
            }
            JsonRpcMessage::Error(error) => {
                self.resolve_pending(error.id, Err(ServiceError::McpError(error.error)));
            }
            JsonRpcMessage::Request(request) => {
                self.dispatch_request(request.request, request.id, extensions);
            }
            JsonRpcMessage::Notification(notification) => {
                self.dispatch_notification(notification.notification, extensions);
            }
            JsonRpcMessage::InvalidRequest { id, error } => {
                let item = OutgoingMessage::related_to(
                    JsonRpcMessage::error(error, id.clone()),
                    Some(id),
                );
                match self.send_through_chain(item).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        return Some(QuitReason::TransportError(DynamicTransportError::new::<T>(e)));
                    }
                    Err(rejected) => {
                        tracing::warn!("sending middleware rejected error response: {rejected}");
                    }
                }
            }
        }
        None
    }

    fn resolve_pending(&mut self, id: RequestId, result: Result<Value, ServiceError>) {
        if let Some(token) = self.token_by_request.remove(&id) {
            self.progress_subscriptions.remove(&token);
        }
        match self.pending.remove(&id) {
            Some(responder) => {
                let _ = responder.send(result);
            }
            None => tracing::debug!(%id, "response for unknown or already-resolved request"),
        }
    }

    fn dispatch_request(&mut self, request: R::PeerReq, id: RequestId, extensions: Extensions) {
        let request_ct = self.ct.child_token();
        self.inflight.insert(id.clone(), request_ct.clone());
        let meta = R::peer_request_meta(&request).cloned().unwrap_or_default();
        let context = RequestContext {
            ct: request_ct,
            id: id.clone(),
            meta,
            extensions,
            peer: self.peer.clone().bind_related(id.clone()),
        };
        let chain = self.request_chain.clone();
        let sink = self.peer.tx.clone();
        let panic_fallback = R::panic_response(&request);
        tokio::spawn(async move {
            let outcome = match std::panic::AssertUnwindSafe(chain.call(context, request))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(%id, "request handler panicked");
                    panic_fallback
                }
            };
            let message = match outcome {
                Ok(response) => PeerSinkMessage::Response { response, id },
                Err(error) => PeerSinkMessage::ErrorResponse { error, id },
            };
            let _ = sink.send(message).await;
        });
    }

    fn dispatch_notification(&mut self, notification: R::PeerNot, extensions: Extensions) {
        if let Some(cancelled) = R::match_cancelled(&notification) {
            if let Some(ct) = self.inflight.remove(&cancelled.request_id) {
                tracing::debug!(id = %cancelled.request_id, reason = ?cancelled.reason, "request cancelled by peer");
                ct.cancel();
            }
            return;
        }
        if let Some(progress) = R::match_progress(&notification) {
            if let Some(handler) = self.progress_subscriptions.get_mut(&progress.progress_token) {
                handler(progress.clone());
                return;
            }
            // fall through: the service-level handler is the session's
            // progress sink of last resort
        }
        let chain = self.notification_chain.clone();
        let context = NotificationContext {
            extensions,
            peer: self.peer.clone(),
        };
        tokio::spawn(async move {
            let result = std::panic::AssertUnwindSafe(chain.call(context, notification))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("notification handler failed: {e}"),
                Err(_) => tracing::error!("notification handler panicked"),
            }
        });
    }

    async fn handle_sink(&mut self, message: PeerSinkMessage<R>) -> Option<QuitReason> {
        match message {
            PeerSinkMessage::Request {
                request,
                id,
                responder,
                progress,
                related,
            } => {
                self.pending.insert(id.clone(), responder);
                if let Some((token, handler)) = progress {
                    self.token_by_request.insert(id.clone(), token.clone());
                    self.progress_subscriptions.insert(token, handler);
                }
                let item = OutgoingMessage::related_to(
                    JsonRpcMessage::request(request, id.clone()),
                    related,
                );
                match self.send_through_chain(item).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!("failed to send request over the transport");
                        self.resolve_pending(id, Err(transport_send_error::<T, _>(e)));
                    }
                    Err(rejected) => {
                        self.resolve_pending(id, Err(ServiceError::Rejected(rejected)));
                    }
                }
            }
            PeerSinkMessage::Notification {
                notification,
                responder,
                related,
            } => {
                let item = OutgoingMessage::related_to(
                    JsonRpcMessage::notification(notification),
                    related,
                );
                let result = match self.send_through_chain(item).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(transport_send_error::<T, _>(e)),
                    Err(rejected) => Err(ServiceError::Rejected(rejected)),
                };
                let _ = responder.send(result);
            }
            PeerSinkMessage::Response { response, id } => {
                // a cancelled request keeps no inflight entry; its response
                // must not reach the peer
                if self.inflight.remove(&id).is_none() {
                    tracing::debug!(%id, "dropping response for cancelled request");
                    return None;
                }
                let message = match serde_json::to_value(&response) {
                    Ok(result) => JsonRpcMessage::response(result, id.clone()),
                    Err(e) => JsonRpcMessage::error(
                        ErrorData::internal_error(
                            format!("failed to serialize response: {e}"),
                            None,
                        ),
                        id.clone(),
                    ),
                };
                let item = OutgoingMessage::related_to(message, Some(id));
                match self.send_through_chain(item).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        return Some(QuitReason::TransportError(DynamicTransportError::new::<T>(e)));
                    }
                    Err(rejected) => {
                        tracing::warn!("sending middleware rejected response: {rejected}");
                    }
                }
            }
            PeerSinkMessage::ErrorResponse { error, id } => {
                if self.inflight.remove(&id).is_none() {
                    return None;
                }
                let item = OutgoingMessage::related_to(
                    JsonRpcMessage::error(error, id.clone()),
                    Some(id),
                );
                match self.send_through_chain(item).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        return Some(QuitReason::TransportError(DynamicTransportError::new::<T>(e)));
                    }
                    Err(rejected) => {
                        tracing::warn!("sending middleware rejected error response: {rejected}");
                    }
                }
            }
            PeerSinkMessage::CancelOutgoing { id, reason, done } => {
                if let Some(token) = self.token_by_request.remove(&id) {
                    self.progress_subscriptions.remove(&token);
                }
                if self.pending.remove(&id).is_some() {
                    let notification =
                        R::cancelled_notification(CancelledNotificationParam {
                            request_id: id.clone(),
                            reason,
                        });
                    let item =
                        OutgoingMessage::new(JsonRpcMessage::notification(notification));
                    match self.send_through_chain(item).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::warn!("failed to send cancellation notification: {e}");
                        }
                        Err(rejected) => {
                            tracing::warn!("sending middleware rejected cancellation: {rejected}");
                        }
                    }
                }
                let _ = done.send(());
            }
        }
        None
    }

    async fn shutdown(&mut self) {
        for ct in self.inflight.values() {
            ct.cancel();
        }
        self.inflight.clear();
        for (_, responder) in self.pending.drain() {
            let _ = responder.send(Err(ServiceError::TransportClosed));
        }
        self.progress_subscriptions.clear();
        self.token_by_request.clear();
        if let Err(e) = self.transport.close().await {
            tracing::debug!("transport close failed: {e}");
        }
    }
}
