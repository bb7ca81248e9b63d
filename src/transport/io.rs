//! Byte-stream transports: newline-delimited JSON over any
//! `AsyncRead`/`AsyncWrite` pair (stdio included) and typed in-memory
//! duplex pairs for tests and embedded hosts.

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
};

use super::{IntoTransport, OutgoingMessage, Transport};
use crate::{
    model::{Extensions, JsonRpcMessage, ProtocolVersion},
    service::{RxJsonRpcMessage, ServiceRole, TxJsonRpcMessage},
};

const INBOUND_CHANNEL_SIZE: usize = 64;

/// One JSON-RPC message per `\n`-terminated line. A reader task pumps the
/// read half so that `receive` stays cancel-safe.
pub struct AsyncRwTransport<R: ServiceRole, W: AsyncWrite + Send + Unpin + 'static> {
    rx: mpsc::Receiver<RxJsonRpcMessage<R>>,
    writer: Option<W>,
}

impl<R: ServiceRole, W: AsyncWrite + Send + Unpin + 'static> AsyncRwTransport<R, W> {
    pub fn new<Rd>(reader: Rd, writer: W) -> Self
    where
        Rd: AsyncRead + Send + Unpin + 'static,
    {
        Self::with_protocol(reader, writer, ProtocolVersion::LATEST)
    }

    /// `protocol` governs whether top-level batch arrays are still
    /// expanded (legacy revisions) or rejected.
    pub fn with_protocol<Rd>(reader: Rd, writer: W, protocol: ProtocolVersion) -> Self
    where
        Rd: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim_end_matches('\r');
                        if line.is_empty() {
                            continue;
                        }
                        match RxJsonRpcMessage::<R>::decode_body(line, &protocol) {
                            Ok(messages) => {
                                for message in messages {
                                    if tx.send(message).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                // parse failure with no recoverable id:
                                // the line protocol gives up
                                tracing::warn!("closing line transport on malformed input: {e}");
                                return;
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        tracing::debug!("line transport read error: {e}");
                        return;
                    }
                }
            }
        });
        Self {
            rx,
            writer: Some(writer),
        }
    }
}

impl<R: ServiceRole, W: AsyncWrite + Send + Unpin + 'static> Transport<R>
    for AsyncRwTransport<R, W>
{
    type Error = std::io::Error;

    async fn send(&mut self, item: OutgoingMessage<R>) -> Result<(), Self::Error> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "transport closed"))?;
        let mut line = serde_json::to_string(&item.message).map_err(std::io::Error::other)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    async fn receive(&mut self) -> Option<(RxJsonRpcMessage<R>, Extensions)> {
        self.rx.recv().await.map(|m| (m, Extensions::new()))
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.rx.close();
        Ok(())
    }
}

/// The conventional child-process transport: this process's stdin/stdout.
pub fn stdio<R: ServiceRole>() -> AsyncRwTransport<R, tokio::io::Stdout> {
    AsyncRwTransport::new(tokio::io::stdin(), tokio::io::stdout())
}

/// Marker for the `(reader, writer)` pair conversion.
pub enum TransportAdapterAsyncRw {}

impl<R, Rd, W> IntoTransport<R, std::io::Error, TransportAdapterAsyncRw> for (Rd, W)
where
    R: ServiceRole,
    Rd: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn into_transport(self) -> impl Transport<R, Error = std::io::Error> + 'static {
        AsyncRwTransport::new(self.0, self.1)
    }
}

/// Typed in-memory transport; one side of a [`in_memory_duplex`] pair.
pub struct InMemoryTransport<R: ServiceRole> {
    tx: Option<mpsc::Sender<TxJsonRpcMessage<R>>>,
    rx: mpsc::Receiver<RxJsonRpcMessage<R>>,
}

impl<R: ServiceRole> Transport<R> for InMemoryTransport<R> {
    type Error = std::io::Error;

    async fn send(&mut self, item: OutgoingMessage<R>) -> Result<(), Self::Error> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "transport closed"))?;
        tx.send(item.message).await.map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer transport dropped")
        })
    }

    async fn receive(&mut self) -> Option<(RxJsonRpcMessage<R>, Extensions)> {
        self.rx.recv().await.map(|m| (m, Extensions::new()))
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.tx = None;
        self.rx.close();
        Ok(())
    }
}

/// A connected pair of in-memory transports for embedding a server and a
/// client in one process.
#[cfg(all(feature = "client", feature = "server"))]
pub fn in_memory_duplex(
    buffer: usize,
) -> (
    InMemoryTransport<crate::service::RoleClient>,
    InMemoryTransport<crate::service::RoleServer>,
) {
    let (client_tx, server_rx) =
        mpsc::channel::<JsonRpcMessage<crate::model::ClientRequest, crate::model::ClientNotification>>(
            buffer,
        );
    let (server_tx, client_rx) =
        mpsc::channel::<JsonRpcMessage<crate::model::ServerRequest, crate::model::ServerNotification>>(
            buffer,
        );
    (
        InMemoryTransport {
            tx: Some(client_tx),
            rx: client_rx,
        },
        InMemoryTransport {
            tx: Some(server_tx),
            rx: server_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(all(feature = "client", feature = "server"))]
    #[tokio::test]
    async fn line_transport_round_trip() {
        use crate::model::ClientRequest;
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let mut client: AsyncRwTransport<crate::service::RoleClient, _> =
            AsyncRwTransport::new(client_read, client_write);
        let mut server: AsyncRwTransport<crate::service::RoleServer, _> =
            AsyncRwTransport::new(server_read, server_write);

        client
            .send(OutgoingMessage::new(JsonRpcMessage::request(
                ClientRequest::Ping,
                1.into(),
            )))
            .await
            .expect("send");
        let (received, _) = server.receive().await.expect("message");
        assert!(matches!(received, JsonRpcMessage::Request(_)));

        client.close().await.expect("close");
        assert!(server.receive().await.is_none());
    }
}
