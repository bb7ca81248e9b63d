//! The transport contract: a bidirectional, message-framed pipe between two
//! peers.
//!
//! A [`Transport`] pairs a single-consumer `receive` side with a `send` side
//! that is safe to drive from the session loop. Closing either side releases
//! a blocked `receive` with `None` and fails subsequent sends.
//!
//! Realisations: newline-delimited JSON over byte streams and in-memory
//! duplex pairs ([`io`]), the streamable HTTP server
//! ([`streamable_http_server`]) and client ([`streamable_http_client`]).

use crate::{
    model::{Extensions, RequestId},
    service::{RxJsonRpcMessage, ServiceRole, TxJsonRpcMessage},
};

#[cfg(feature = "transport-io")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-io")))]
pub mod io;

#[cfg(feature = "transport-streamable-http-server")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-streamable-http-server")))]
pub mod auth;

#[cfg(feature = "transport-streamable-http-server")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-streamable-http-server")))]
pub mod streamable_http_server;

#[cfg(feature = "transport-streamable-http-client")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-streamable-http-client")))]
pub mod streamable_http_client;

pub mod event_store;
pub mod session_store;

#[cfg(feature = "transport-io")]
pub use io::{AsyncRwTransport, stdio};
#[cfg(feature = "transport-streamable-http-client")]
pub use streamable_http_client::{
    StreamableHttpClient, StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
#[cfg(feature = "transport-streamable-http-server")]
pub use streamable_http_server::{StreamableHttpServerConfig, StreamableHttpService};

/// An outbound message plus the incoming request it was produced on behalf
/// of. The `related` tag never reaches the wire; stream-multiplexing
/// transports use it to pick the channel that carries the message.
#[derive(Debug, Clone)]
pub struct OutgoingMessage<R: ServiceRole> {
    pub message: TxJsonRpcMessage<R>,
    pub related: Option<RequestId>,
}

impl<R: ServiceRole> OutgoingMessage<R> {
    pub fn new(message: TxJsonRpcMessage<R>) -> Self {
        Self {
            message,
            related: None,
        }
    }

    pub fn related_to(message: TxJsonRpcMessage<R>, related: Option<RequestId>) -> Self {
        Self { message, related }
    }
}

/// A bidirectional message pipe of a fixed direction.
///
/// `receive` must be cancel-safe: the session loop polls it inside a
/// `select!` and drops the future on every other wakeup.
pub trait Transport<R: ServiceRole>: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn send(
        &mut self,
        item: OutgoingMessage<R>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// `None` means end-of-stream; the session is over. The returned
    /// [`Extensions`] carry transport-supplied extras for the message
    /// (HTTP request parts, verified token info).
    fn receive(
        &mut self,
    ) -> impl Future<Output = Option<(RxJsonRpcMessage<R>, Extensions)>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// A type-erased transport error that keeps the transport's type name for
/// diagnostics.
#[derive(Debug, thiserror::Error)]
#[error("{error} (transport {transport})")]
pub struct DynamicTransportError {
    pub transport: &'static str,
    #[source]
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl DynamicTransportError {
    pub fn new<T: 'static>(
        error: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            transport: std::any::type_name::<T>(),
            error: error.into(),
        }
    }
}

/// Conversion into a [`Transport`]. The `Adapter` parameter only
/// disambiguates the blanket impls; users never name it.
pub trait IntoTransport<R: ServiceRole, E, Adapter>: Send + 'static
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_transport(self) -> impl Transport<R, Error = E> + 'static;
}

pub enum TransportAdapterIdentity {}

impl<R: ServiceRole, T: Transport<R> + 'static> IntoTransport<R, T::Error, TransportAdapterIdentity>
    for T
{
    fn into_transport(self) -> impl Transport<R, Error = T::Error> + 'static {
        self
    }
}
