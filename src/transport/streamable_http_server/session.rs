//! The per-session stream multiplexer.
//!
//! Each session runs one worker task that owns every outbound SSE channel:
//! one stream per request-bearing POST plus the standalone background
//! stream. The engine's transport half feeds the worker; the HTTP layer
//! attaches and detaches stream receivers.
//!
//! Channel selection: a response goes to the stream of the POST that
//! carried its request (closing it once every in-batch response left);
//! messages produced on behalf of a live POSTed request follow that
//! request's stream; everything else, including traffic produced after the
//! originating stream closed, goes to the background stream.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::AtomicI64,
    },
    time::Instant,
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    model::{ErrorData, Extensions, JsonRpcMessage, RequestId, ServerJsonRpcMessage},
    service::RxJsonRpcMessage,
    service::RoleServer,
    transport::{
        OutgoingMessage, Transport,
        event_store::{BACKGROUND_STREAM_ID, EventStore, StreamId, format_event_id},
    },
};

pub type SessionId = Arc<str>;

/// One SSE event as the HTTP layer will write it.
#[derive(Debug, Clone)]
pub struct ServerSseMessage {
    pub event_id: Option<String>,
    pub message: ServerJsonRpcMessage,
}

const STREAM_CHANNEL_SIZE: usize = 64;
const COMMAND_CHANNEL_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
#[error("session closed")]
pub struct SessionClosed;

pub(crate) enum WorkerCommand {
    OpenRequestStream {
        messages: Vec<RxJsonRpcMessage<RoleServer>>,
        extensions: Extensions,
        respond: oneshot::Sender<mpsc::Receiver<ServerSseMessage>>,
    },
    Accept {
        messages: Vec<RxJsonRpcMessage<RoleServer>>,
        extensions: Extensions,
    },
    OpenStandalone {
        respond: oneshot::Sender<mpsc::Receiver<ServerSseMessage>>,
    },
    Resume {
        stream_id: StreamId,
        last_index: u64,
        respond: oneshot::Sender<Result<mpsc::Receiver<ServerSseMessage>, ErrorData>>,
    },
    FromEngine {
        item: OutgoingMessage<RoleServer>,
        ack: oneshot::Sender<()>,
    },
}

/// The HTTP layer's grip on one live session.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub id: SessionId,
    pub ct: CancellationToken,
    /// In-flight POST count; the idle reaper only considers a session
    /// whose count is zero.
    pub refs: Arc<AtomicI64>,
    pub idle_since: Arc<Mutex<Instant>>,
    cmd_tx: mpsc::Sender<WorkerCommand>,
}

impl SessionHandle {
    pub async fn open_request_stream(
        &self,
        messages: Vec<RxJsonRpcMessage<RoleServer>>,
        extensions: Extensions,
    ) -> Result<mpsc::Receiver<ServerSseMessage>, SessionClosed> {
        let (respond, receiver) = oneshot::channel();
        self.cmd_tx
            .send(WorkerCommand::OpenRequestStream {
                messages,
                extensions,
                respond,
            })
            .await
            .map_err(|_| SessionClosed)?;
        receiver.await.map_err(|_| SessionClosed)
    }

    pub async fn accept(
        &self,
        messages: Vec<RxJsonRpcMessage<RoleServer>>,
        extensions: Extensions,
    ) -> Result<(), SessionClosed> {
        self.cmd_tx
            .send(WorkerCommand::Accept {
                messages,
                extensions,
            })
            .await
            .map_err(|_| SessionClosed)
    }

    pub async fn open_standalone(
        &self,
    ) -> Result<mpsc::Receiver<ServerSseMessage>, SessionClosed> {
        let (respond, receiver) = oneshot::channel();
        self.cmd_tx
            .send(WorkerCommand::OpenStandalone { respond })
            .await
            .map_err(|_| SessionClosed)?;
        receiver.await.map_err(|_| SessionClosed)
    }

    pub async fn resume(
        &self,
        stream_id: StreamId,
        last_index: u64,
    ) -> Result<Result<mpsc::Receiver<ServerSseMessage>, ErrorData>, SessionClosed> {
        let (respond, receiver) = oneshot::channel();
        self.cmd_tx
            .send(WorkerCommand::Resume {
                stream_id,
                last_index,
                respond,
            })
            .await
            .map_err(|_| SessionClosed)?;
        receiver.await.map_err(|_| SessionClosed)
    }

    pub fn close(&self) {
        self.ct.cancel();
    }
}

/// The engine-facing half: a [`Transport<RoleServer>`] whose wire is the
/// session worker.
pub struct SessionTransport {
    rx: mpsc::UnboundedReceiver<(RxJsonRpcMessage<RoleServer>, Extensions)>,
    cmd_tx: mpsc::Sender<WorkerCommand>,
    ct: CancellationToken,
}

impl Transport<RoleServer> for SessionTransport {
    type Error = std::io::Error;

    async fn send(&mut self, item: OutgoingMessage<RoleServer>) -> Result<(), Self::Error> {
        let closed =
            || std::io::Error::new(std::io::ErrorKind::BrokenPipe, "session worker gone");
        let (ack, acked) = oneshot::channel();
        self.cmd_tx
            .send(WorkerCommand::FromEngine { item, ack })
            .await
            .map_err(|_| closed())?;
        acked.await.map_err(|_| closed())
    }

    async fn receive(&mut self) -> Option<(RxJsonRpcMessage<RoleServer>, Extensions)> {
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.ct.cancel();
        self.rx.close();
        Ok(())
    }
}

struct StreamState {
    live: Option<mpsc::Sender<ServerSseMessage>>,
    /// Holds background traffic while no GET is attached.
    buffer: VecDeque<ServerSseMessage>,
    /// Requests still awaiting a response on this stream; always empty for
    /// the background stream.
    pending: HashSet<RequestId>,
    closed: bool,
}

impl StreamState {
    fn new(live: Option<mpsc::Sender<ServerSseMessage>>) -> Self {
        Self {
            live,
            buffer: VecDeque::new(),
            pending: HashSet::new(),
            closed: false,
        }
    }
}

struct SessionWorker {
    session_id: SessionId,
    cmd_rx: mpsc::Receiver<WorkerCommand>,
    // client messages only arrive via HTTP bodies, so this side is
    // already bounded; an unbounded sender keeps the worker from ever
    // waiting on the engine
    to_engine: mpsc::UnboundedSender<(RxJsonRpcMessage<RoleServer>, Extensions)>,
    ct: CancellationToken,
    event_store: Option<Arc<dyn EventStore>>,
    streams: HashMap<StreamId, StreamState>,
    request_streams: HashMap<RequestId, StreamId>,
    next_stream: u64,
}

pub(crate) fn create_session(
    id: SessionId,
    event_store: Option<Arc<dyn EventStore>>,
) -> (SessionHandle, SessionTransport) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
    let (to_engine, engine_rx) = mpsc::unbounded_channel();
    let ct = CancellationToken::new();

    let mut streams = HashMap::new();
    streams.insert(BACKGROUND_STREAM_ID.to_string(), StreamState::new(None));
    let worker = SessionWorker {
        session_id: id.clone(),
        cmd_rx,
        to_engine,
        ct: ct.clone(),
        event_store,
        streams,
        request_streams: HashMap::new(),
        next_stream: 1,
    };
    tokio::spawn(worker.run());

    let handle = SessionHandle {
        id,
        ct: ct.clone(),
        refs: Arc::new(AtomicI64::new(0)),
        idle_since: Arc::new(Mutex::new(Instant::now())),
        cmd_tx: cmd_tx.clone(),
    };
    let transport = SessionTransport {
        rx: engine_rx,
        cmd_tx,
        ct,
    };
    (handle, transport)
}

impl SessionWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command).await.is_err() {
                                tracing::debug!(session_id = %self.session_id, "engine side gone, stopping session worker");
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = self.ct.cancelled() => break,
            }
        }
        // dropping `to_engine` releases the engine's blocked receive with
        // end-of-stream
    }

    async fn handle_command(&mut self, command: WorkerCommand) -> Result<(), SessionClosed> {
        match command {
            WorkerCommand::OpenRequestStream {
                messages,
                extensions,
                respond,
            } => {
                let (tx, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
                let stream_id = self.next_stream.to_string();
                self.next_stream += 1;
                let mut state = StreamState::new(Some(tx));
                for message in &messages {
                    if let Some(id) = message.request_id().filter(|_| !message.is_response()) {
                        state.pending.insert(id.clone());
                        self.request_streams.insert(id.clone(), stream_id.clone());
                    }
                }
                self.streams.insert(stream_id, state);
                let _ = respond.send(rx);
                self.forward(messages, extensions).await?;
            }
            WorkerCommand::Accept {
                messages,
                extensions,
            } => {
                self.forward(messages, extensions).await?;
            }
            WorkerCommand::OpenStandalone { respond } => {
                let background = self
                    .streams
                    .get_mut(BACKGROUND_STREAM_ID)
                    .expect("background stream always exists");
                let capacity = background.buffer.len() + STREAM_CHANNEL_SIZE;
                let (tx, rx) = mpsc::channel(capacity);
                while let Some(event) = background.buffer.pop_front() {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                // a reconnecting GET replaces any previous standalone
                // stream
                background.live = Some(tx);
                let _ = respond.send(rx);
            }
            WorkerCommand::Resume {
                stream_id,
                last_index,
                respond,
            } => {
                let result = self.resume_stream(&stream_id, last_index).await;
                let _ = respond.send(result);
            }
            WorkerCommand::FromEngine { item, ack } => {
                self.route_from_engine(item).await;
                let _ = ack.send(());
            }
        }
        Ok(())
    }

    async fn forward(
        &mut self,
        messages: Vec<RxJsonRpcMessage<RoleServer>>,
        extensions: Extensions,
    ) -> Result<(), SessionClosed> {
        for message in messages {
            self.to_engine
                .send((message, extensions.clone()))
                .map_err(|_| SessionClosed)?;
        }
        Ok(())
    }

    async fn resume_stream(
        &mut self,
        stream_id: &str,
        last_index: u64,
    ) -> Result<mpsc::Receiver<ServerSseMessage>, ErrorData> {
        let Some(store) = self.event_store.clone() else {
            return Err(ErrorData::invalid_request(
                "stream resumption requires an event store",
                None,
            ));
        };
        let events = store
            .events_after(&self.session_id, stream_id, last_index)
            .await
            .map_err(|e| ErrorData::internal_error(format!("event store failure: {e}"), None))?;
        let (tx, rx) = mpsc::channel(events.len() + STREAM_CHANNEL_SIZE);
        for (index, message) in events {
            let event = ServerSseMessage {
                event_id: Some(format_event_id(stream_id, index)),
                message,
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
        match self.streams.get_mut(stream_id) {
            Some(state) if !state.closed => {
                state.live = Some(tx);
            }
            // unknown or closed stream: replay only, then end-of-stream
            _ => drop(tx),
        }
        Ok(rx)
    }

    async fn route_from_engine(&mut self, item: OutgoingMessage<RoleServer>) {
        let response_id = match &item.message {
            JsonRpcMessage::Response(response) => Some(response.id.clone()),
            JsonRpcMessage::Error(error) => Some(error.id.clone()),
            _ => None,
        };
        let stream_id = match &response_id {
            Some(id) => self
                .request_streams
                .get(id)
                .cloned()
                .unwrap_or_else(|| BACKGROUND_STREAM_ID.to_string()),
            None => item
                .related
                .as_ref()
                .and_then(|id| self.request_streams.get(id))
                .filter(|sid| {
                    self.streams
                        .get(sid.as_str())
                        .is_some_and(|state| !state.closed)
                })
                .cloned()
                .unwrap_or_else(|| BACKGROUND_STREAM_ID.to_string()),
        };
        self.deliver(&stream_id, item.message).await;

        if let Some(id) = response_id {
            let close = match self.streams.get_mut(&stream_id) {
                Some(state) => {
                    state.pending.remove(&id);
                    state.pending.is_empty() && stream_id != BACKGROUND_STREAM_ID
                }
                None => false,
            };
            if close {
                if let Some(state) = self.streams.get_mut(&stream_id) {
                    // dropping the sender ends the HTTP response body once
                    // the last event drained
                    state.live = None;
                    state.closed = true;
                }
            }
        }
    }

    async fn deliver(&mut self, stream_id: &str, message: ServerJsonRpcMessage) {
        let event_id = match &self.event_store {
            Some(store) => match store
                .append(&self.session_id, stream_id, message.clone())
                .await
            {
                Ok(index) => Some(format_event_id(stream_id, index)),
                Err(e) => {
                    tracing::warn!(session_id = %self.session_id, "event store append failed: {e}");
                    None
                }
            },
            None => None,
        };
        let event = ServerSseMessage { event_id, message };
        let Some(state) = self.streams.get_mut(stream_id) else {
            return;
        };
        if let Some(live) = &state.live {
            if live.send(event.clone()).await.is_ok() {
                return;
            }
            // receiver gone: the client disconnected from this stream
            state.live = None;
        }
        if stream_id == BACKGROUND_STREAM_ID {
            state.buffer.push_back(event);
        } else if self.event_store.is_none() {
            tracing::debug!(
                session_id = %self.session_id,
                stream_id,
                "dropping event for disconnected stream without an event store"
            );
        }
    }
}
