use crate::codec::OutboundPayload;
use crate::config::{ManagerConfig, Placement};
use crate::context::ShardContext;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::shard::{DestroyOptions, ShardEvent, ShardHandle, ShardOptions, ShardStatus};
use crate::throttle::IdentifyThrottle;
use crate::worker::WorkerStrategy;
use futures_util::future::{join_all, BoxFuture};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Everything a placement needs from the manager to spawn shards.
pub(crate) struct StrategyResources {
    pub config: ManagerConfig,
    pub shard_count: u16,
    pub gateway_url: String,
    pub throttle: Arc<IdentifyThrottle>,
    pub event_tx: mpsc::UnboundedSender<(u16, ShardEvent)>,
    pub metrics: Arc<Metrics>,
}

/// Execution placement behind a uniform control surface.
///
/// Both variants expose the same operations; callers cannot tell which one
/// is driving the shards.
pub(crate) enum ShardingStrategy {
    InProcess(InProcessStrategy),
    Worker(WorkerStrategy),
}

impl ShardingStrategy {
    /// Spawn shards for `ids` under the configured placement.
    pub(crate) fn spawn(ids: &[u16], resources: &StrategyResources) -> Self {
        match resources.config.placement {
            Placement::InProcess => Self::InProcess(InProcessStrategy::spawn(ids, resources)),
            Placement::Workers { shards_per_worker } => {
                Self::Worker(WorkerStrategy::spawn(ids, shards_per_worker, resources))
            }
        }
    }

    /// Future connecting every spawned shard, resolving when all are Ready
    /// or any reports a fatal error.
    pub(crate) fn connect_future(&self) -> BoxFuture<'static, Result<(), Error>> {
        match self {
            Self::InProcess(strategy) => strategy.connect_future(),
            Self::Worker(strategy) => strategy.connect_future(),
        }
    }

    pub(crate) async fn destroy(self, options: DestroyOptions) -> Result<(), Error> {
        match self {
            Self::InProcess(strategy) => strategy.destroy(options).await,
            Self::Worker(strategy) => strategy.destroy(options).await,
        }
    }

    pub(crate) fn send_future(
        &self,
        shard_id: u16,
        payload: OutboundPayload,
    ) -> BoxFuture<'static, Result<(), Error>> {
        match self {
            Self::InProcess(strategy) => strategy.send_future(shard_id, payload),
            Self::Worker(strategy) => strategy.send_future(shard_id, payload),
        }
    }

    pub(crate) fn fetch_status_future(
        &self,
    ) -> BoxFuture<'static, Result<HashMap<u16, ShardStatus>, Error>> {
        match self {
            Self::InProcess(strategy) => {
                let statuses = strategy.fetch_status();
                Box::pin(async move { Ok(statuses) })
            }
            Self::Worker(strategy) => strategy.fetch_status_future(),
        }
    }
}

/// Direct ownership of shard tasks inside the calling runtime.
pub(crate) struct InProcessStrategy {
    shards: HashMap<u16, ShardHandle>,
}

impl InProcessStrategy {
    fn spawn(ids: &[u16], resources: &StrategyResources) -> Self {
        let options = ShardOptions::from_config(
            &resources.config,
            resources.shard_count,
            resources.gateway_url.clone(),
        );
        debug!(shards = ids.len(), "spawning in-process shards");

        let shards = ids
            .iter()
            .map(|&id| {
                let context = ShardContext::Direct {
                    session: resources.config.session.clone(),
                    throttle: resources.throttle.clone(),
                };
                let handle = ShardHandle::spawn(
                    id,
                    options.clone(),
                    context,
                    resources.event_tx.clone(),
                    resources.metrics.clone(),
                );
                (id, handle)
            })
            .collect();

        Self { shards }
    }

    fn connect_future(&self) -> BoxFuture<'static, Result<(), Error>> {
        let connects: Vec<_> = self
            .shards
            .values()
            .map(ShardHandle::connect_future)
            .collect();
        Box::pin(async move {
            let mut first_error = None;
            for result in join_all(connects).await {
                if let Err(error) = result {
                    first_error.get_or_insert(error);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
    }

    async fn destroy(self, options: DestroyOptions) -> Result<(), Error> {
        let destroys: Vec<_> = self
            .shards
            .into_values()
            .map(|handle| handle.destroy(options))
            .collect();
        for result in join_all(destroys).await {
            result?;
        }
        Ok(())
    }

    fn send_future(
        &self,
        shard_id: u16,
        payload: OutboundPayload,
    ) -> BoxFuture<'static, Result<(), Error>> {
        match self.shards.get(&shard_id) {
            Some(handle) => handle.send_future(payload),
            None => Box::pin(async move { Err(Error::UnknownShard(shard_id)) }),
        }
    }

    fn fetch_status(&self) -> HashMap<u16, ShardStatus> {
        self.shards
            .iter()
            .map(|(&id, handle)| (id, handle.status()))
            .collect()
    }
}

/// Partition `ids` into contiguous chunks of `shards_per_worker`.
/// `None` yields a single chunk holding everything.
pub(crate) fn partition_ids(ids: &[u16], shards_per_worker: Option<usize>) -> Vec<Vec<u16>> {
    if ids.is_empty() {
        return Vec::new();
    }
    match shards_per_worker {
        None => vec![ids.to_vec()],
        Some(per_worker) => ids
            .chunks(per_worker.max(1))
            .map(<[u16]>::to_vec)
            .collect(),
    }
}
