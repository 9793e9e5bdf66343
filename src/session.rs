use crate::error::Error;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Resumable-session handle for one shard.
///
/// Owned by host-supplied persistence; the manager only reads and writes it
/// through the configured callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session id handed out by the gateway on READY
    pub session_id: String,
    /// Sequence number of the last dispatch seen
    pub sequence: u64,
    /// The shard this session belongs to
    pub shard_id: u16,
    /// Total shard count at the time this session identified
    pub shard_count: u16,
    /// Gateway URL to use when resuming this session
    pub resume_url: Option<String>,
}

/// Identify-session budget declared by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until `remaining` resets
    pub reset_after: u64,
    pub max_concurrency: u16,
}

/// Connection metadata fetched from the gateway's HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayMetadata {
    /// Base URL shards connect to
    pub url: String,
    /// Shard count the service recommends
    pub shards: u16,
    pub session_start_limit: SessionStartLimit,
}

/// Host callback that retrieves persisted session info for a shard.
pub type RetrieveSession =
    Arc<dyn Fn(u16) -> BoxFuture<'static, Option<SessionInfo>> + Send + Sync>;

/// Host callback that persists (or clears, with `None`) session info.
pub type UpdateSession =
    Arc<dyn Fn(u16, Option<SessionInfo>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Host callback performing the gateway metadata fetch.
pub type FetchMetadata =
    Arc<dyn Fn() -> BoxFuture<'static, Result<GatewayMetadata, Error>> + Send + Sync>;

/// Session persistence wired in by the host application.
#[derive(Clone)]
pub struct SessionCallbacks {
    pub retrieve: RetrieveSession,
    pub update: UpdateSession,
}

impl std::fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCallbacks").finish_non_exhaustive()
    }
}

impl SessionCallbacks {
    /// In-memory persistence, suitable for processes that do not need to
    /// survive a restart.
    pub fn in_memory() -> Self {
        let store: Arc<parking_lot::Mutex<std::collections::HashMap<u16, SessionInfo>>> =
            Arc::default();
        let read_store = store.clone();
        Self {
            retrieve: Arc::new(move |shard_id| {
                let store = read_store.clone();
                Box::pin(async move { store.lock().get(&shard_id).cloned() })
            }),
            update: Arc::new(move |shard_id, session| {
                let store = store.clone();
                Box::pin(async move {
                    match session {
                        Some(session) => {
                            store.lock().insert(shard_id, session);
                        }
                        None => {
                            store.lock().remove(&shard_id);
                        }
                    }
                })
            }),
        }
    }
}
