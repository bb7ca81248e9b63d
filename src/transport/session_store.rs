//! Externalised session state for horizontal scaling of the streamable
//! HTTP transport.
//!
//! Multiple handler instances behind a load balancer share one
//! [`SessionStore`]; a request landing on an instance with no in-memory
//! session for its `Mcp-Session-Id` is rehydrated from the stored state.
//! Reference counting tracks in-flight POSTs across all instances so the
//! idle timeout only runs while nothing is happening.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant, SystemTime},
};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::model::{InitializeRequestParam, LoggingLevel};

/// The MCP half of a stored session: what the peer said at initialize and
/// the mutable session-scoped settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSessionState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_params: Option<InitializeRequestParam>,
    pub initialized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LoggingLevel>,
}

/// Everything a session needs to be resumed on another instance. Fully
/// JSON-serialisable; no live timers or locks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSessionInfo {
    pub session_state: ServerSessionState,
    /// In-flight POST count across every instance; the idle timeout is
    /// paused while it is positive.
    pub refs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    pub created_at: SystemTime,
    pub last_accessed_at: SystemTime,
}

impl StoredSessionInfo {
    pub fn new(session_state: ServerSessionState, timeout: Option<Duration>) -> Self {
        let now = SystemTime::now();
        Self {
            session_state,
            refs: 0,
            timeout,
            created_at: now,
            last_accessed_at: now,
        }
    }
}

/// Pluggable key-value store of [`StoredSessionInfo`].
///
/// `update_refs` must be atomic even across distributed deployments; no
/// caller may assume it is the only instance mutating a session.
pub trait SessionStore: Send + Sync + 'static {
    /// `None` when the session does not exist or has expired.
    fn get<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, std::io::Result<Option<StoredSessionInfo>>>;

    /// Store or replace a session. A `ttl` of `None` never expires.
    fn put<'a>(
        &'a self,
        session_id: &'a str,
        info: StoredSessionInfo,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, std::io::Result<()>>;

    /// Safe to call on an already-deleted session.
    fn delete<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, std::io::Result<()>>;

    /// Atomically add `delta` to the reference count, returning the new
    /// count, or `None` when the session is unknown.
    fn update_refs<'a>(
        &'a self,
        session_id: &'a str,
        delta: i64,
    ) -> BoxFuture<'a, std::io::Result<Option<i64>>>;

    /// Restart the inactivity timeout. Returns false when the session is
    /// unknown.
    fn refresh_ttl<'a>(
        &'a self,
        session_id: &'a str,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, std::io::Result<bool>>;
}

struct StoreEntry {
    info: StoredSessionInfo,
    expires_at: Option<Instant>,
}

impl StoreEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }
}

/// In-memory [`SessionStore`] for single-instance deployments; expired
/// entries are dropped on access and by a background sweeper when a tokio
/// runtime is available.
pub struct InMemorySessionStore {
    sessions: std::sync::Arc<Mutex<HashMap<String, StoreEntry>>>,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

impl InMemorySessionStore {
    pub fn new() -> Self {
        let sessions = std::sync::Arc::new(Mutex::new(HashMap::<String, StoreEntry>::new()));
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let sweep = std::sync::Arc::downgrade(&sessions);
            handle.spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    ticker.tick().await;
                    let Some(sessions) = sweep.upgrade() else {
                        return;
                    };
                    sessions
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .retain(|_, entry| !entry.expired());
                }
            });
        }
        Self { sessions }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoreEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionStore for InMemorySessionStore {
    fn get<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, std::io::Result<Option<StoredSessionInfo>>> {
        Box::pin(async move {
            let sessions = self.lock();
            Ok(sessions
                .get(session_id)
                .filter(|entry| !entry.expired())
                .map(|entry| entry.info.clone()))
        })
    }

    fn put<'a>(
        &'a self,
        session_id: &'a str,
        info: StoredSessionInfo,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, std::io::Result<()>> {
        Box::pin(async move {
            let entry = StoreEntry {
                info,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            };
            self.lock().insert(session_id.to_string(), entry);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, std::io::Result<()>> {
        Box::pin(async move {
            self.lock().remove(session_id);
            Ok(())
        })
    }

    fn update_refs<'a>(
        &'a self,
        session_id: &'a str,
        delta: i64,
    ) -> BoxFuture<'a, std::io::Result<Option<i64>>> {
        Box::pin(async move {
            let mut sessions = self.lock();
            let Some(entry) = sessions.get_mut(session_id).filter(|entry| !entry.expired())
            else {
                return Ok(None);
            };
            entry.info.refs = (entry.info.refs + delta).max(0);
            entry.info.last_accessed_at = SystemTime::now();
            Ok(Some(entry.info.refs))
        })
    }

    fn refresh_ttl<'a>(
        &'a self,
        session_id: &'a str,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, std::io::Result<bool>> {
        Box::pin(async move {
            let mut sessions = self.lock();
            let Some(entry) = sessions.get_mut(session_id).filter(|entry| !entry.expired())
            else {
                return Ok(false);
            };
            entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> StoredSessionInfo {
        StoredSessionInfo::new(ServerSessionState::default(), Some(Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn refs_are_clamped_and_tracked() {
        let store = InMemorySessionStore::new();
        store.put("s", info(), None).await.expect("put");
        assert_eq!(store.update_refs("s", 1).await.expect("refs"), Some(1));
        assert_eq!(store.update_refs("s", 1).await.expect("refs"), Some(2));
        assert_eq!(store.update_refs("s", -1).await.expect("refs"), Some(1));
        assert_eq!(store.update_refs("s", -5).await.expect("refs"), Some(0));
        assert_eq!(store.update_refs("missing", 1).await.expect("refs"), None);
    }

    #[tokio::test]
    async fn expired_sessions_read_as_missing() {
        let store = InMemorySessionStore::new();
        store
            .put("s", info(), Some(Duration::from_millis(10)))
            .await
            .expect("put");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("s").await.expect("get").is_none());
        assert!(!store.refresh_ttl("s", None).await.expect("refresh"));
    }

    #[tokio::test]
    async fn stored_info_is_json_serialisable() {
        let info = info();
        let encoded = serde_json::to_string(&info).expect("encode");
        let decoded: StoredSessionInfo = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.session_state, info.session_state);
        assert_eq!(decoded.refs, info.refs);
    }
}
