//! Streamable HTTP client transport: POST for outgoing messages, per-POST
//! SSE response streams, and a standalone GET for server-initiated traffic,
//! with backoff retry and `Last-Event-ID` resumption.

use std::{borrow::Cow, sync::Arc, time::Duration};

use futures::{StreamExt, stream::BoxStream};
pub use sse_stream::Error as SseError;
use sse_stream::{Sse, SseStream};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{OutgoingMessage, Transport};
use crate::{
    model::{
        ClientNotification, Extensions, InitializeResult, JsonRpcMessage, ProtocolVersion,
        ServerJsonRpcMessage,
    },
    service::{RoleClient, RxJsonRpcMessage, TxJsonRpcMessage},
};

type BoxedSseStream = BoxStream<'static, Result<Sse, SseError>>;

#[derive(Error, Debug)]
pub enum StreamableHttpError<E: std::error::Error + Send + Sync + 'static> {
    #[error("SSE error: {0}")]
    Sse(#[from] SseError),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Client error: {0}")]
    Client(E),
    #[error("unexpected server response: {0}")]
    UnexpectedServerResponse(Cow<'static, str>),
    #[error("Unexpected content type: {0:?}")]
    UnexpectedContentType(Option<String>),
    #[error("Server does not support SSE")]
    ServerDoesNotSupportSse,
    #[error("Server does not support delete session")]
    ServerDoesNotSupportDeleteSession,
    #[error("Deserialize error: {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("Transport channel closed")]
    TransportChannelClosed,
}

impl From<reqwest::Error> for StreamableHttpError<reqwest::Error> {
    fn from(e: reqwest::Error) -> Self {
        StreamableHttpError::Client(e)
    }
}

/// What a POST came back with.
pub enum StreamableHttpPostResponse {
    /// 202; notifications and responses land here.
    Accepted,
    Json(ServerJsonRpcMessage, Option<String>),
    Sse(BoxedSseStream, Option<String>),
}

impl StreamableHttpPostResponse {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            StreamableHttpPostResponse::Json(_, session_id)
            | StreamableHttpPostResponse::Sse(_, session_id) => session_id.as_deref(),
            StreamableHttpPostResponse::Accepted => None,
        }
    }
}

/// The HTTP half the worker drives; implemented for `reqwest::Client` and
/// mockable in tests.
pub trait StreamableHttpClient: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn post_message(
        &self,
        uri: Arc<str>,
        message: TxJsonRpcMessage<RoleClient>,
        session_id: Option<Arc<str>>,
        protocol_version: Option<ProtocolVersion>,
    ) -> impl Future<Output = Result<StreamableHttpPostResponse, StreamableHttpError<Self::Error>>>
    + Send
    + '_;

    fn get_stream(
        &self,
        uri: Arc<str>,
        session_id: Option<Arc<str>>,
        last_event_id: Option<String>,
        protocol_version: Option<ProtocolVersion>,
    ) -> impl Future<Output = Result<BoxedSseStream, StreamableHttpError<Self::Error>>> + Send + '_;

    fn delete_session(
        &self,
        uri: Arc<str>,
        session_id: Arc<str>,
        protocol_version: Option<ProtocolVersion>,
    ) -> impl Future<Output = Result<(), StreamableHttpError<Self::Error>>> + Send + '_;
}

/// Retry policy of broken SSE streams. `max_times: Some(0)` disables
/// retries; `None` retries forever. Delays grow exponentially from
/// `min_duration`, shrunk by any server-sent `retry:` hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SseRetryConfig {
    pub max_times: Option<usize>,
    pub min_duration: Duration,
}

impl SseRetryConfig {
    pub const DEFAULT_MIN_DURATION: Duration = Duration::from_millis(1000);

    pub const DISABLED: Self = Self {
        max_times: Some(0),
        min_duration: Self::DEFAULT_MIN_DURATION,
    };
}

impl Default for SseRetryConfig {
    fn default() -> Self {
        Self {
            max_times: None,
            min_duration: Self::DEFAULT_MIN_DURATION,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamableHttpClientTransportConfig {
    pub uri: Arc<str>,
    pub retry_config: SseRetryConfig,
    pub channel_buffer_capacity: usize,
}

impl StreamableHttpClientTransportConfig {
    pub fn with_uri(uri: impl Into<Arc<str>>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }
}

impl Default for StreamableHttpClientTransportConfig {
    fn default() -> Self {
        Self {
            uri: "localhost".into(),
            retry_config: SseRetryConfig::default(),
            channel_buffer_capacity: 16,
        }
    }
}

type SendRequest<C> = (
    TxJsonRpcMessage<RoleClient>,
    oneshot::Sender<Result<(), StreamableHttpError<<C as StreamableHttpClient>::Error>>>,
);

/// [`Transport<RoleClient>`] over streamable HTTP; a worker task owns the
/// HTTP client and every live SSE pump.
pub struct StreamableHttpClientTransport<C: StreamableHttpClient> {
    send_tx: mpsc::Sender<SendRequest<C>>,
    inbound_rx: mpsc::Receiver<ServerJsonRpcMessage>,
    ct: CancellationToken,
}

impl StreamableHttpClientTransport<reqwest::Client> {
    pub fn from_uri(uri: impl Into<Arc<str>>) -> Self {
        Self::with_client(
            reqwest::Client::default(),
            StreamableHttpClientTransportConfig::with_uri(uri),
        )
    }
}

impl<C: StreamableHttpClient> StreamableHttpClientTransport<C> {
    pub fn with_client(client: C, config: StreamableHttpClientTransportConfig) -> Self {
        let (send_tx, send_rx) = mpsc::channel(config.channel_buffer_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_buffer_capacity);
        let ct = CancellationToken::new();
        let worker = ClientWorker {
            client,
            config,
            send_rx,
            inbound_tx,
            ct: ct.clone(),
            session_id: None,
            protocol_version: None,
            pumps: tokio::task::JoinSet::new(),
        };
        tokio::spawn(worker.run());
        Self {
            send_tx,
            inbound_rx,
            ct,
        }
    }
}

impl<C: StreamableHttpClient> Transport<RoleClient> for StreamableHttpClientTransport<C> {
    type Error = StreamableHttpError<C::Error>;

    async fn send(&mut self, item: OutgoingMessage<RoleClient>) -> Result<(), Self::Error> {
        let (ack, acked) = oneshot::channel();
        self.send_tx
            .send((item.message, ack))
            .await
            .map_err(|_| StreamableHttpError::TransportChannelClosed)?;
        acked
            .await
            .map_err(|_| StreamableHttpError::TransportChannelClosed)?
    }

    async fn receive(&mut self) -> Option<(RxJsonRpcMessage<RoleClient>, Extensions)> {
        self.inbound_rx.recv().await.map(|m| (m, Extensions::new()))
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.ct.cancel();
        self.inbound_rx.close();
        Ok(())
    }
}

struct ClientWorker<C: StreamableHttpClient> {
    client: C,
    config: StreamableHttpClientTransportConfig,
    send_rx: mpsc::Receiver<SendRequest<C>>,
    inbound_tx: mpsc::Sender<ServerJsonRpcMessage>,
    ct: CancellationToken,
    session_id: Option<Arc<str>>,
    protocol_version: Option<ProtocolVersion>,
    pumps: tokio::task::JoinSet<Result<(), StreamableHttpError<C::Error>>>,
}

impl<C: StreamableHttpClient> ClientWorker<C> {
    async fn run(mut self) {
        let (sse_tx, mut sse_rx) = mpsc::channel::<Sse>(self.config.channel_buffer_capacity);
        loop {
            tokio::select! {
                _ = self.ct.cancelled() => break,
                request = self.send_rx.recv() => {
                    match request {
                        Some((message, ack)) => {
                            let result = self.handle_send(message, &sse_tx).await;
                            let fatal = result.is_err();
                            let _ = ack.send(result);
                            if fatal && self.session_id.is_none() {
                                // nothing to salvage before a session exists
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = sse_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_sse_event(event).await;
                }
                done = self.pumps.join_next(), if !self.pumps.is_empty() => {
                    match done {
                        Some(Ok(Ok(()))) => {}
                        Some(Ok(Err(e))) => {
                            tracing::error!("sse stream failed permanently: {e}; closing transport");
                            break;
                        }
                        Some(Err(e)) => {
                            tracing::error!("sse pump panicked: {e}");
                            break;
                        }
                        None => {}
                    }
                }
            }
        }
        self.pumps.shutdown().await;
        if let Some(session_id) = self.session_id.take() {
            match self
                .client
                .delete_session(self.config.uri.clone(), session_id, self.protocol_version.clone())
                .await
            {
                Ok(()) => tracing::debug!("session deleted"),
                Err(StreamableHttpError::ServerDoesNotSupportDeleteSession) => {
                    tracing::debug!("server does not support session deletion");
                }
                Err(e) => tracing::warn!("failed to delete session: {e}"),
            }
        }
    }

    async fn handle_send(
        &mut self,
        message: TxJsonRpcMessage<RoleClient>,
        sse_tx: &mpsc::Sender<Sse>,
    ) -> Result<(), StreamableHttpError<C::Error>> {
        let is_initialized_notification = matches!(
            &message,
            JsonRpcMessage::Notification(n)
                if matches!(n.notification, ClientNotification::Initialized)
        );
        let response = self
            .client
            .post_message(
                self.config.uri.clone(),
                message,
                self.session_id.clone(),
                self.protocol_version.clone(),
            )
            .await?;
        if self.session_id.is_none() {
            if let Some(session_id) = response.session_id() {
                self.session_id = Some(session_id.into());
            }
        }
        match response {
            StreamableHttpPostResponse::Accepted => {}
            StreamableHttpPostResponse::Json(message, _) => {
                self.capture_protocol_version(&message);
                if self.inbound_tx.send(message).await.is_err() {
                    return Err(StreamableHttpError::TransportChannelClosed);
                }
            }
            StreamableHttpPostResponse::Sse(stream, _) => {
                self.spawn_pump(stream, sse_tx.clone());
            }
        }
        if is_initialized_notification {
            self.open_standalone_stream(sse_tx).await;
        }
        Ok(())
    }

    /// The hanging GET for server-initiated traffic, opened right after the
    /// handshake completed. A server may decline it with 405.
    async fn open_standalone_stream(&mut self, sse_tx: &mpsc::Sender<Sse>) {
        match self
            .client
            .get_stream(
                self.config.uri.clone(),
                self.session_id.clone(),
                None,
                self.protocol_version.clone(),
            )
            .await
        {
            Ok(stream) => {
                self.spawn_pump(stream, sse_tx.clone());
                tracing::debug!("standalone stream established");
            }
            Err(StreamableHttpError::ServerDoesNotSupportSse) => {
                tracing::debug!("server declined the standalone stream");
            }
            Err(e) => {
                tracing::warn!("failed to open the standalone stream: {e}");
            }
        }
    }

    fn spawn_pump(&mut self, stream: BoxedSseStream, sse_tx: mpsc::Sender<Sse>) {
        let pump = StreamPump {
            client: self.client.clone(),
            uri: self.config.uri.clone(),
            retry: self.config.retry_config,
            session_id: self.session_id.clone(),
            protocol_version: self.protocol_version.clone(),
            ct: self.ct.child_token(),
        };
        self.pumps.spawn(pump.run(stream, sse_tx));
    }

    async fn handle_sse_event(&mut self, event: Sse) {
        let Some(data) = event.data else {
            return;
        };
        match serde_json::from_str::<ServerJsonRpcMessage>(&data) {
            Ok(message) => {
                self.capture_protocol_version(&message);
                if self.inbound_tx.send(message).await.is_err() {
                    self.ct.cancel();
                }
            }
            Err(e) => tracing::warn!("failed to deserialize server message: {e}"),
        }
    }

    /// The negotiated version rides inside the initialize result; the
    /// transport needs it for the `MCP-Protocol-Version` header.
    fn capture_protocol_version(&mut self, message: &ServerJsonRpcMessage) {
        if self.protocol_version.is_some() {
            return;
        }
        if let JsonRpcMessage::Response(response) = message {
            if let Ok(result) = serde_json::from_value::<InitializeResult>(response.result.clone())
            {
                self.protocol_version = Some(result.protocol_version);
            }
        }
    }
}

struct StreamPump<C: StreamableHttpClient> {
    client: C,
    uri: Arc<str>,
    retry: SseRetryConfig,
    session_id: Option<Arc<str>>,
    protocol_version: Option<ProtocolVersion>,
    ct: CancellationToken,
}

impl<C: StreamableHttpClient> StreamPump<C> {
    async fn run(
        self,
        mut stream: BoxedSseStream,
        sse_tx: mpsc::Sender<Sse>,
    ) -> Result<(), StreamableHttpError<C::Error>> {
        let mut retry_delay = self.retry.min_duration;
        let mut last_event_id: Option<String> = None;
        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                _ = self.ct.cancelled() => return Ok(()),
            };
            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    tracing::warn!("sse stream error: {e}");
                    stream = self
                        .reconnect(&mut retry_delay, last_event_id.clone())
                        .await?;
                    continue;
                }
                None => return Ok(()),
            };
            if let Some(hint) = event.retry {
                retry_delay = retry_delay.min(Duration::from_millis(hint));
            }
            if let Some(id) = &event.id {
                last_event_id = Some(id.clone());
            }
            if sse_tx.send(event).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn reconnect(
        &self,
        delay: &mut Duration,
        last_event_id: Option<String>,
    ) -> Result<BoxedSseStream, StreamableHttpError<C::Error>> {
        let max_times = self.retry.max_times;
        let mut attempts = 0usize;
        loop {
            if max_times.is_some_and(|max| attempts >= max) {
                return Err(StreamableHttpError::UnexpectedServerResponse(
                    "sse stream lost and retries exhausted".into(),
                ));
            }
            attempts += 1;
            tokio::select! {
                _ = tokio::time::sleep(*delay) => {}
                _ = self.ct.cancelled() => {
                    return Err(StreamableHttpError::TransportChannelClosed);
                }
            }
            *delay = delay.saturating_mul(2);
            match self
                .client
                .get_stream(
                    self.uri.clone(),
                    self.session_id.clone(),
                    last_event_id.clone(),
                    self.protocol_version.clone(),
                )
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!("sse reconnect attempt {attempts} failed: {e}");
                }
            }
        }
    }
}

// -- reqwest implementation --------------------------------------------------

const HEADER_SESSION_ID: &str = "mcp-session-id";
const HEADER_PROTOCOL_VERSION: &str = "mcp-protocol-version";
const HEADER_LAST_EVENT_ID: &str = "last-event-id";

impl StreamableHttpClient for reqwest::Client {
    type Error = reqwest::Error;

    async fn post_message(
        &self,
        uri: Arc<str>,
        message: TxJsonRpcMessage<RoleClient>,
        session_id: Option<Arc<str>>,
        protocol_version: Option<ProtocolVersion>,
    ) -> Result<StreamableHttpPostResponse, StreamableHttpError<Self::Error>> {
        let mut request = self
            .post(uri.as_ref())
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .json(&message);
        if let Some(session_id) = session_id {
            request = request.header(HEADER_SESSION_ID, session_id.as_ref());
        }
        if let Some(version) = protocol_version {
            request = request.header(HEADER_PROTOCOL_VERSION, version.as_str());
        }
        let response = request.send().await?.error_for_status()?;
        if response.status() == reqwest::StatusCode::ACCEPTED {
            return Ok(StreamableHttpPostResponse::Accepted);
        }
        let session_id = response
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match content_type.as_deref() {
            Some(ct) if ct.starts_with("text/event-stream") => {
                let stream = SseStream::from_byte_stream(response.bytes_stream()).boxed();
                Ok(StreamableHttpPostResponse::Sse(stream, session_id))
            }
            Some(ct) if ct.starts_with("application/json") => {
                let message: ServerJsonRpcMessage = response.json().await?;
                Ok(StreamableHttpPostResponse::Json(message, session_id))
            }
            other => Err(StreamableHttpError::UnexpectedContentType(
                other.map(str::to_string),
            )),
        }
    }

    async fn get_stream(
        &self,
        uri: Arc<str>,
        session_id: Option<Arc<str>>,
        last_event_id: Option<String>,
        protocol_version: Option<ProtocolVersion>,
    ) -> Result<BoxedSseStream, StreamableHttpError<Self::Error>> {
        let mut request = self
            .get(uri.as_ref())
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(session_id) = session_id {
            request = request.header(HEADER_SESSION_ID, session_id.as_ref());
        }
        if let Some(last_event_id) = last_event_id {
            request = request.header(HEADER_LAST_EVENT_ID, last_event_id);
        }
        if let Some(version) = protocol_version {
            request = request.header(HEADER_PROTOCOL_VERSION, version.as_str());
        }
        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            return Err(StreamableHttpError::ServerDoesNotSupportSse);
        }
        let response = response.error_for_status()?;
        Ok(SseStream::from_byte_stream(response.bytes_stream()).boxed())
    }

    async fn delete_session(
        &self,
        uri: Arc<str>,
        session_id: Arc<str>,
        protocol_version: Option<ProtocolVersion>,
    ) -> Result<(), StreamableHttpError<Self::Error>> {
        let mut request = self
            .delete(uri.as_ref())
            .header(HEADER_SESSION_ID, session_id.as_ref());
        if let Some(version) = protocol_version {
            request = request.header(HEADER_PROTOCOL_VERSION, version.as_str());
        }
        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            return Err(StreamableHttpError::ServerDoesNotSupportDeleteSession);
        }
        response.error_for_status()?;
        Ok(())
    }
}
