//! # gateway-shard-manager
//!
//! Client-side manager for a fleet of persistent gateway WebSocket
//! connections ("shards"), with identify throttling and pluggable
//! execution placement.
//!
//! ## Features
//!
//! - **Shard handshake machine** - connect, Hello, Identify/Resume, Ready,
//!   heartbeating with zombie detection, close-code-driven recovery
//! - **Identify throttling** - one shared gate bounding concurrent fresh
//!   handshakes across every shard, bucketed by `id % max_concurrency`
//! - **Execution placement** - run shards in-process, or partitioned
//!   across worker threads coordinated purely by message passing
//! - **Send governance** - per-shard FIFO ordering and a fixed quota per
//!   rolling window; non-allow-listed sends rejected until Ready
//! - **Session resumption** - host-supplied persistence callbacks decide
//!   where resume state lives
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use gateway_shard_manager::{Manager, ManagerConfig, Placement};
//!
//! let config = ManagerConfig::builder(token, fetch_metadata)
//!     .intents(513)
//!     .placement(Placement::Workers { shards_per_worker: Some(8) })
//!     .build()?;
//!
//! let manager = Manager::new(config);
//! let mut events = manager.events().expect("first take");
//! manager.connect().await?;
//! while let Some((shard_id, event)) = events.recv().await {
//!     // decoded dispatches, ready/resumed notices, per-shard errors
//! }
//! ```

mod codec;
mod config;
mod context;
mod error;
mod heartbeat;
mod manager;
mod metrics;
mod session;
mod shard;
mod strategy;
mod throttle;
mod worker;

pub use codec::{
    classify_close, opcode, CloseBehavior, Compression, IdentifyProperties, OutboundPayload,
};
pub use config::{BackoffConfig, ConfigError, ManagerConfig, ManagerConfigBuilder, Placement};
pub use error::{Error, ErrorKind};
pub use manager::Manager;
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use session::{
    FetchMetadata, GatewayMetadata, RetrieveSession, SessionCallbacks, SessionInfo,
    SessionStartLimit, UpdateSession,
};
pub use shard::{DestroyOptions, ShardEvent, ShardStatus};
pub use throttle::IdentifyThrottle;

/// Result type for gateway-shard-manager operations
pub type Result<T> = std::result::Result<T, Error>;
