use crate::codec::OutboundPayload;
use crate::config::ManagerConfig;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::session::GatewayMetadata;
use crate::shard::{DestroyOptions, ShardEvent, ShardStatus};
use crate::strategy::{ShardingStrategy, StrategyResources};
use crate::throttle::IdentifyThrottle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Minimum cache lifetime for gateway metadata; single-shard deployments
/// get `reset_after = 0` from the service.
const MIN_METADATA_TTL: Duration = Duration::from_secs(5);

struct CachedMetadata {
    data: GatewayMetadata,
    expires_at: Instant,
}

struct ManagerState {
    strategy: Option<ShardingStrategy>,
    metadata: Option<CachedMetadata>,
    shard_ids: Option<Vec<u16>>,
    /// Effective shard count; starts from config and can be changed at
    /// runtime via `update_shard_count`
    shard_count: Option<u16>,
}

/// Drives a fleet of gateway shards behind one execution strategy.
///
/// The manager resolves how many shards are needed and which ids this
/// process owns, constructs exactly one strategy for them, republishes
/// shard events, and exposes per-id operations.
///
/// # Example
///
/// ```ignore
/// use gateway_shard_manager::{Manager, ManagerConfig};
///
/// let config = ManagerConfig::builder(token, fetch_metadata)
///     .intents(513)
///     .build()?;
/// let manager = Manager::new(config);
/// let mut events = manager.events().expect("first take");
/// manager.connect().await?;
/// while let Some((shard_id, event)) = events.recv().await {
///     // ...
/// }
/// ```
pub struct Manager {
    config: ManagerConfig,
    metrics: Arc<Metrics>,
    /// Serializes connect/destroy/resolution; a tokio Mutex so it can be
    /// held across awaits
    state: tokio::sync::Mutex<ManagerState>,
    event_tx: mpsc::UnboundedSender<(u16, ShardEvent)>,
    event_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<(u16, ShardEvent)>>>,
}

impl Manager {
    /// Create a new manager. Nothing connects until [`Manager::connect`].
    pub fn new(config: ManagerConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shard_count = config.shard_count;
        Self {
            config,
            metrics: Arc::new(Metrics::new()),
            state: tokio::sync::Mutex::new(ManagerState {
                strategy: None,
                metadata: None,
                shard_ids: None,
                shard_count,
            }),
            event_tx,
            event_rx: parking_lot::Mutex::new(Some(event_rx)),
        }
    }

    /// Get the metrics for this manager
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Take the event stream. Events arrive as `(shard_id, event)` pairs
    /// from every shard regardless of placement. Returns `None` after the
    /// first call.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<(u16, ShardEvent)>> {
        self.event_rx.lock().take()
    }

    /// Fetch gateway metadata, served from cache until the expiry derived
    /// from `session_start_limit.reset_after`.
    ///
    /// `force` bypasses the cache.
    pub async fn gateway_metadata(&self, force: bool) -> Result<GatewayMetadata, Error> {
        let mut state = self.state.lock().await;
        self.metadata_locked(&mut state, force).await
    }

    async fn metadata_locked(
        &self,
        state: &mut ManagerState,
        force: bool,
    ) -> Result<GatewayMetadata, Error> {
        if let Some(cached) = &state.metadata {
            if Instant::now() >= cached.expires_at {
                state.metadata = None;
            } else if !force {
                return Ok(cached.data.clone());
            }
        }

        debug!("fetching gateway metadata");
        let data = (self.config.fetch_metadata)().await?;
        let ttl = match data.session_start_limit.reset_after {
            0 => MIN_METADATA_TTL,
            reset_after => Duration::from_millis(reset_after),
        };
        state.metadata = Some(CachedMetadata {
            data: data.clone(),
            expires_at: Instant::now() + ttl,
        });
        Ok(data)
    }

    /// The ids of the shards this manager drives: the explicit set when
    /// configured, otherwise `0..shard_count`.
    pub async fn shard_ids(&self, force: bool) -> Result<Vec<u16>, Error> {
        let mut state = self.state.lock().await;
        self.shard_ids_locked(&mut state, force).await
    }

    async fn shard_ids_locked(
        &self,
        state: &mut ManagerState,
        force: bool,
    ) -> Result<Vec<u16>, Error> {
        if !force {
            if let Some(ids) = &state.shard_ids {
                return Ok(ids.clone());
            }
        }

        let ids = if let Some(ids) = &self.config.shard_ids {
            ids.clone()
        } else {
            let count = match state.shard_count {
                Some(count) => count,
                None => self.metadata_locked(state, false).await?.shards,
            };
            (0..count).collect()
        };

        state.shard_ids = Some(ids.clone());
        Ok(ids)
    }

    /// Total shard count: the configured count, or the highest owned id
    /// plus one under automatic resolution.
    pub async fn shard_count(&self) -> Result<u16, Error> {
        let mut state = self.state.lock().await;
        self.shard_count_locked(&mut state).await
    }

    async fn shard_count_locked(&self, state: &mut ManagerState) -> Result<u16, Error> {
        if let Some(count) = state.shard_count {
            return Ok(count);
        }
        let ids = self.shard_ids_locked(state, false).await?;
        Ok(ids.iter().copied().max().map_or(0, |max| max + 1))
    }

    /// Change the total shard count on the fly. Destroys the current
    /// strategy; call [`Manager::connect`] to respawn.
    pub async fn update_shard_count(&self, shard_count: Option<u16>) -> Result<(), Error> {
        let strategy = {
            let mut state = self.state.lock().await;
            state.shard_count = shard_count;
            state.shard_ids = None;
            state.strategy.take()
        };
        if let Some(strategy) = strategy {
            info!("destroying shards to adjust shard count");
            strategy.destroy(DestroyOptions::default()).await?;
        }
        Ok(())
    }

    /// Spawn all owned shards under the configured placement and drive
    /// every one of them to Ready.
    ///
    /// Fails fast when the identify-session budget cannot cover the spawn.
    /// A previous strategy, if any, is destroyed first.
    pub async fn connect(&self) -> Result<(), Error> {
        let connect = {
            let mut state = self.state.lock().await;

            if let Some(previous) = state.strategy.take() {
                debug!("destroying previous strategy before reconnecting");
                previous.destroy(DestroyOptions::default()).await?;
            }

            let metadata = self.metadata_locked(&mut state, false).await?;
            let ids = self.shard_ids_locked(&mut state, false).await?;
            let shard_count = self.shard_count_locked(&mut state).await?;

            if u64::from(metadata.session_start_limit.remaining) < ids.len() as u64 {
                return Err(Error::SessionsExhausted {
                    required: ids.len(),
                    remaining: metadata.session_start_limit.remaining,
                    reset_after_ms: metadata.session_start_limit.reset_after,
                });
            }

            info!(
                shards = ids.len(),
                shard_count,
                max_concurrency = metadata.session_start_limit.max_concurrency,
                "connecting"
            );

            // One throttle for the whole fleet, owned here in the
            // coordinating context
            let throttle = Arc::new(IdentifyThrottle::with_cooldown(
                metadata.session_start_limit.max_concurrency,
                self.config.identify_cooldown,
            ));

            let resources = StrategyResources {
                config: self.config.clone(),
                shard_count,
                gateway_url: metadata.url,
                throttle,
                event_tx: self.event_tx.clone(),
                metrics: self.metrics.clone(),
            };
            let strategy = ShardingStrategy::spawn(&ids, &resources);
            let connect = strategy.connect_future();
            state.strategy = Some(strategy);
            connect
        };

        connect.await
    }

    /// Destroy every shard (and worker, in the distributed placement).
    /// By default sessions are preserved for a later resume.
    pub async fn destroy(&self, options: DestroyOptions) -> Result<(), Error> {
        let strategy = self.state.lock().await.strategy.take();
        match strategy {
            Some(strategy) => {
                info!("destroying all shards");
                strategy.destroy(options).await
            }
            None => Ok(()),
        }
    }

    /// Send a payload on one shard, suspending on that shard's rate
    /// window. Non-allow-listed opcodes fail until the shard is Ready.
    pub async fn send(&self, shard_id: u16, payload: OutboundPayload) -> Result<(), Error> {
        let send = {
            let state = self.state.lock().await;
            let strategy = state
                .strategy
                .as_ref()
                .ok_or_else(|| Error::ChannelSend("manager is not connected".to_string()))?;
            strategy.send_future(shard_id, payload)
        };
        send.await
    }

    /// Current handshake status of every shard.
    pub async fn fetch_status(&self) -> Result<HashMap<u16, ShardStatus>, Error> {
        let fetch = {
            let state = self.state.lock().await;
            let strategy = state
                .strategy
                .as_ref()
                .ok_or_else(|| Error::ChannelSend("manager is not connected".to_string()))?;
            strategy.fetch_status_future()
        };
        fetch.await
    }
}
