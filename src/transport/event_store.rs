//! Optional per-stream append-only logs enabling SSE replay after a client
//! disconnects.
//!
//! An event id is the lossless serialisation of `(stream-id, index)` as
//! `<stream-id>_<index>`; stream ids never contain `_`.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use futures::future::BoxFuture;

use crate::model::ServerJsonRpcMessage;

/// Identifies one SSE stream within a session. The background stream is
/// [`BACKGROUND_STREAM_ID`]; request-bearing POSTs allocate fresh ids.
pub type StreamId = String;

pub const BACKGROUND_STREAM_ID: &str = "0";

pub fn format_event_id(stream_id: &str, index: u64) -> String {
    format!("{stream_id}_{index}")
}

/// Inverse of [`format_event_id`]. Rejects ids whose stream part contains
/// `_` or whose index part is empty, signed or non-numeric.
pub fn parse_event_id(event_id: &str) -> Option<(StreamId, u64)> {
    let (stream_id, index) = event_id.split_once('_')?;
    if index.is_empty() {
        return None;
    }
    let index: u64 = index.parse().ok()?;
    Some((stream_id.to_string(), index))
}

/// An append-only log of the SSE events of every stream of a session.
/// Capacity and eviction are the store's own business; the transport treats
/// it as opaque.
pub trait EventStore: Send + Sync + 'static {
    /// Append an event, returning the index assigned to it.
    fn append<'a>(
        &'a self,
        session_id: &'a str,
        stream_id: &'a str,
        message: ServerJsonRpcMessage,
    ) -> BoxFuture<'a, std::io::Result<u64>>;

    /// Every retained event with an index greater than `last_index`, in
    /// order.
    fn events_after<'a>(
        &'a self,
        session_id: &'a str,
        stream_id: &'a str,
        last_index: u64,
    ) -> BoxFuture<'a, std::io::Result<Vec<(u64, ServerJsonRpcMessage)>>>;

    /// Forget everything a closed session ever wrote.
    fn purge_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, std::io::Result<()>>;
}

struct StreamLog {
    first_index: u64,
    events: VecDeque<ServerJsonRpcMessage>,
}

/// In-memory [`EventStore`] with a per-stream event cap; the oldest events
/// are evicted first.
pub struct InMemoryEventStore {
    max_events_per_stream: usize,
    streams: Mutex<HashMap<(String, StreamId), StreamLog>>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryEventStore {
    pub fn new(max_events_per_stream: usize) -> Self {
        Self {
            max_events_per_stream: max_events_per_stream.max(1),
            streams: Mutex::new(HashMap::new()),
        }
    }
}

impl EventStore for InMemoryEventStore {
    fn append<'a>(
        &'a self,
        session_id: &'a str,
        stream_id: &'a str,
        message: ServerJsonRpcMessage,
    ) -> BoxFuture<'a, std::io::Result<u64>> {
        Box::pin(async move {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            let log = streams
                .entry((session_id.to_string(), stream_id.to_string()))
                .or_insert_with(|| StreamLog {
                    first_index: 0,
                    events: VecDeque::new(),
                });
            if log.events.len() >= self.max_events_per_stream {
                log.events.pop_front();
                log.first_index += 1;
            }
            let index = log.first_index + log.events.len() as u64;
            log.events.push_back(message);
            Ok(index)
        })
    }

    fn events_after<'a>(
        &'a self,
        session_id: &'a str,
        stream_id: &'a str,
        last_index: u64,
    ) -> BoxFuture<'a, std::io::Result<Vec<(u64, ServerJsonRpcMessage)>>> {
        Box::pin(async move {
            let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            let Some(log) = streams.get(&(session_id.to_string(), stream_id.to_string())) else {
                return Ok(Vec::new());
            };
            let events = log
                .events
                .iter()
                .enumerate()
                .map(|(offset, message)| (log.first_index + offset as u64, message.clone()))
                .filter(|(index, _)| *index > last_index)
                .collect();
            Ok(events)
        })
    }

    fn purge_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, std::io::Result<()>> {
        Box::pin(async move {
            self.streams
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|(session, _), _| session != session_id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JsonRpcMessage;

    #[test]
    fn event_ids_round_trip() {
        for (stream_id, index) in [("0", 0u64), ("17", 42), ("", 3)] {
            let encoded = format_event_id(stream_id, index);
            assert_eq!(
                parse_event_id(&encoded),
                Some((stream_id.to_string(), index))
            );
        }
    }

    #[test]
    fn invalid_event_ids_are_rejected() {
        for invalid in ["", "_", "1_", "1_a", "1_-1", "42"] {
            assert_eq!(parse_event_id(invalid), None, "{invalid:?} should not parse");
        }
    }

    #[tokio::test]
    async fn append_then_replay() {
        let store = InMemoryEventStore::default();
        for i in 0..4 {
            let message = JsonRpcMessage::notification(
                crate::model::ServerNotification::ToolListChanged,
            );
            let index = store.append("s", "0", message).await.expect("append");
            assert_eq!(index, i);
        }
        let replay = store.events_after("s", "0", 1).await.expect("replay");
        assert_eq!(
            replay.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(store.events_after("s", "nope", 0).await.expect("empty").is_empty());
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let store = InMemoryEventStore::new(2);
        for _ in 0..3 {
            let message = JsonRpcMessage::notification(
                crate::model::ServerNotification::ToolListChanged,
            );
            store.append("s", "0", message).await.expect("append");
        }
        let replay = store.events_after("s", "0", 0).await.expect("replay");
        assert_eq!(
            replay.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }
}
