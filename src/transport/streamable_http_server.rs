//! Streamable HTTP Server Transport Module
//!
//! One HTTP endpoint multiplexes an MCP session over three methods: POST
//! carries client messages in (answered on a per-POST SSE stream when the
//! body holds requests), GET opens the standalone stream for
//! server-initiated traffic, DELETE terminates the session.
//!
//! The [`StreamableHttpService`] is a plain `tower_service::Service`; mount
//! it under a route in any tower-compatible HTTP stack.

pub mod session;
pub mod tower;

use std::{sync::Arc, time::Duration};

pub use session::{ServerSseMessage, SessionId};
pub use tower::StreamableHttpService;

use crate::transport::{
    auth::TokenVerifier, event_store::EventStore, session_store::SessionStore,
};

pub const HEADER_SESSION_ID: &str = "mcp-session-id";
pub const HEADER_PROTOCOL_VERSION: &str = "mcp-protocol-version";
pub const HEADER_LAST_EVENT_ID: &str = "last-event-id";

/// Configuration for the streamable HTTP server.
#[derive(Clone)]
pub struct StreamableHttpServerConfig {
    /// The ping message duration for SSE connections.
    pub sse_keep_alive: Option<Duration>,
    /// If true, the server keeps one session per client across requests;
    /// if false every request is served by a throwaway session and GET is
    /// rejected.
    pub stateful_mode: bool,
    /// Close a session once its in-flight POST count has been zero for
    /// this long.
    pub session_timeout: Option<Duration>,
    /// Overrides the default 128-bit random hex session id generator.
    pub session_id_generator: Option<Arc<dyn Fn() -> String + Send + Sync>>,
    /// Enables SSE replay via `Last-Event-ID`.
    pub event_store: Option<Arc<dyn EventStore>>,
    /// Externalises session state for horizontal scaling.
    pub session_store: Option<Arc<dyn SessionStore>>,
    /// Bearer-token verification; absent means no authentication.
    pub token_verifier: Option<Arc<dyn TokenVerifier>>,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            sse_keep_alive: Some(Duration::from_secs(15)),
            stateful_mode: true,
            session_timeout: None,
            session_id_generator: None,
            event_store: None,
            session_store: None,
            token_verifier: None,
        }
    }
}

impl std::fmt::Debug for StreamableHttpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpServerConfig")
            .field("sse_keep_alive", &self.sse_keep_alive)
            .field("stateful_mode", &self.stateful_mode)
            .field("session_timeout", &self.session_timeout)
            .field("has_event_store", &self.event_store.is_some())
            .field("has_session_store", &self.session_store.is_some())
            .field("has_token_verifier", &self.token_verifier.is_some())
            .finish()
    }
}

pub(crate) fn random_session_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(32);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
