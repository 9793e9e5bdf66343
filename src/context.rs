use crate::error::Error;
use crate::session::{SessionCallbacks, SessionInfo};
use crate::throttle::IdentifyThrottle;
use crate::worker::RemoteContext;
use futures_util::future::BoxFuture;
use std::sync::Arc;

/// How a shard reaches the coordinator-owned session persistence and
/// identify throttle.
///
/// In-process shards call straight into the host callbacks and the shared
/// throttle. Worker shards hold no reference to either; every call becomes
/// an envelope round-trip to the coordinating context.
pub(crate) enum ShardContext {
    Direct {
        session: SessionCallbacks,
        throttle: Arc<IdentifyThrottle>,
    },
    Remote(RemoteContext),
}

impl ShardContext {
    pub(crate) async fn retrieve_session(&self, shard_id: u16) -> Option<SessionInfo> {
        match self {
            Self::Direct { session, .. } => (session.retrieve)(shard_id).await,
            Self::Remote(remote) => remote.retrieve_session(shard_id).await,
        }
    }

    pub(crate) async fn update_session(&self, shard_id: u16, session_info: Option<SessionInfo>) {
        match self {
            Self::Direct { session, .. } => (session.update)(shard_id, session_info).await,
            Self::Remote(remote) => remote.update_session(shard_id, session_info),
        }
    }

    /// Admission future for the shared identify throttle. Boxed so the
    /// shard loop can hold it across select iterations and drop it to
    /// cancel on destroy.
    pub(crate) fn wait_for_identify(&self, shard_id: u16) -> BoxFuture<'static, Result<(), Error>> {
        match self {
            Self::Direct { throttle, .. } => {
                let throttle = throttle.clone();
                Box::pin(async move {
                    throttle.wait_for_identify(shard_id).await;
                    Ok(())
                })
            }
            Self::Remote(remote) => remote.wait_for_identify(shard_id),
        }
    }
}
