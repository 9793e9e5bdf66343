use crate::codec::{Compression, IdentifyProperties};
use crate::session::{FetchMetadata, SessionCallbacks};
use crate::throttle::IDENTIFY_COOLDOWN;
use std::time::Duration;

/// Where shard execution is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// All shards run as tasks inside the calling runtime
    #[default]
    InProcess,
    /// Shards are partitioned across dedicated worker threads, each with
    /// its own single-threaded runtime
    Workers {
        /// Shards per worker; `None` puts every shard in one worker
        shards_per_worker: Option<usize>,
    },
}

/// Configuration for the shard manager.
#[derive(Clone)]
pub struct ManagerConfig {
    /// Token presented in identify/resume payloads
    pub token: String,
    /// Intent bitfield requested on identify
    pub intents: u64,
    /// Explicit shard count; `None` uses the gateway's recommendation
    pub shard_count: Option<u16>,
    /// Explicit shard ids; `None` spawns `0..shard_count`
    pub shard_ids: Option<Vec<u16>>,
    /// Execution placement for the shards
    pub placement: Placement,
    /// Transport compression to negotiate
    pub compression: Compression,
    /// Gateway protocol version, sent in the connection URL
    pub version: String,
    /// Timeout for opening the WebSocket
    pub connect_timeout: Duration,
    /// How long to wait for the gateway's Hello frame
    pub hello_timeout: Duration,
    /// How long to wait for READY after identifying
    pub ready_timeout: Duration,
    /// Client properties reported on identify
    pub identify_properties: IdentifyProperties,
    /// Member-list threshold forwarded on identify
    pub large_threshold: Option<u16>,
    /// Reconnect attempts before a shard gives up and reports fatal
    pub max_reconnect_attempts: u32,
    /// Backoff settings for reconnection
    pub backoff: BackoffConfig,
    /// Outbound sends allowed per rate-limit window
    pub send_limit: u32,
    /// Length of the outbound rate-limit window
    pub send_window: Duration,
    /// Spacing between identify admissions within one throttle bucket
    pub identify_cooldown: Duration,
    /// Host-supplied session persistence
    pub session: SessionCallbacks,
    /// Host-supplied gateway metadata fetch
    pub fetch_metadata: FetchMetadata,
}

impl std::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("intents", &self.intents)
            .field("shard_count", &self.shard_count)
            .field("shard_ids", &self.shard_ids)
            .field("placement", &self.placement)
            .field("compression", &self.compression)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl ManagerConfig {
    /// Create a new builder for configuration.
    pub fn builder(token: impl Into<String>, fetch_metadata: FetchMetadata) -> ManagerConfigBuilder {
        ManagerConfigBuilder {
            config: ManagerConfig {
                token: token.into(),
                intents: 0,
                shard_count: None,
                shard_ids: None,
                placement: Placement::default(),
                compression: Compression::default(),
                version: "10".to_string(),
                connect_timeout: Duration::from_secs(10),
                hello_timeout: Duration::from_secs(60),
                ready_timeout: Duration::from_secs(15),
                identify_properties: IdentifyProperties::default(),
                large_threshold: None,
                max_reconnect_attempts: 10,
                backoff: BackoffConfig::default(),
                send_limit: 120,
                send_window: Duration::from_secs(60),
                identify_cooldown: IDENTIFY_COOLDOWN,
                session: SessionCallbacks::in_memory(),
                fetch_metadata,
            },
        }
    }
}

/// Builder for ManagerConfig
#[derive(Clone)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Set the intent bitfield requested on identify
    pub fn intents(mut self, intents: u64) -> Self {
        self.config.intents = intents;
        self
    }

    /// Pin the shard count instead of using the gateway's recommendation
    pub fn shard_count(mut self, count: u16) -> Self {
        self.config.shard_count = Some(count);
        self
    }

    /// Restrict this process to an explicit set of shard ids
    pub fn shard_ids(mut self, ids: Vec<u16>) -> Self {
        self.config.shard_ids = Some(ids);
        self
    }

    /// Set the execution placement
    pub fn placement(mut self, placement: Placement) -> Self {
        self.config.placement = placement;
        self
    }

    /// Set the transport compression to negotiate
    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    /// Set the session persistence callbacks
    pub fn session(mut self, session: SessionCallbacks) -> Self {
        self.config.session = session;
        self
    }

    /// Set the timeout for opening the WebSocket
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set how long to wait for the gateway's Hello frame
    pub fn hello_timeout(mut self, timeout: Duration) -> Self {
        self.config.hello_timeout = timeout;
        self
    }

    /// Set how long to wait for READY after identifying
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.config.ready_timeout = timeout;
        self
    }

    /// Set client properties reported on identify
    pub fn identify_properties(mut self, properties: IdentifyProperties) -> Self {
        self.config.identify_properties = properties;
        self
    }

    /// Set the member-list threshold forwarded on identify
    pub fn large_threshold(mut self, threshold: u16) -> Self {
        self.config.large_threshold = Some(threshold);
        self
    }

    /// Set reconnect attempts before a shard reports fatal
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Set the outbound send budget per window
    pub fn send_limit(mut self, limit: u32, window: Duration) -> Self {
        self.config.send_limit = limit;
        self.config.send_window = window;
        self
    }

    /// Set the identify bucket cooldown
    pub fn identify_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.identify_cooldown = cooldown;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<ManagerConfig, ConfigError> {
        let config = self.config;

        if config.token.is_empty() {
            return Err(ConfigError::MissingToken);
        }

        if let (Some(ids), Some(count)) = (&config.shard_ids, config.shard_count) {
            if let Some(&bad) = ids.iter().find(|&&id| id >= count) {
                return Err(ConfigError::ShardIdOutOfRange { id: bad, count });
            }
        }

        if config.backoff.max_delay < config.backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if config.backoff.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }

        if config.send_limit == 0 {
            return Err(ConfigError::InvalidSendLimit);
        }

        if let Placement::Workers {
            shards_per_worker: Some(0),
        } = config.placement
        {
            return Err(ConfigError::InvalidPlacement(
                "shards_per_worker cannot be 0".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// The token was empty
    #[error("A token is required")]
    MissingToken,
    /// An explicit shard id is outside the explicit shard count
    #[error("Shard id {id} is out of range for shard count {count}")]
    ShardIdOutOfRange { id: u16, count: u16 },
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// The send budget cannot be zero
    #[error("send_limit cannot be 0")]
    InvalidSendLimit,
    /// Invalid placement configuration
    #[error("Invalid placement: {0}")]
    InvalidPlacement(String),
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay before first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::GatewayMetadata;
    use std::sync::Arc;

    fn test_fetch() -> FetchMetadata {
        Arc::new(|| {
            Box::pin(async {
                Ok(GatewayMetadata {
                    url: "wss://gateway.example".into(),
                    shards: 1,
                    session_start_limit: crate::session::SessionStartLimit {
                        total: 1000,
                        remaining: 1000,
                        reset_after: 0,
                        max_concurrency: 1,
                    },
                })
            })
        })
    }

    #[test]
    fn test_backoff_delay_calculation() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));

        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_with_jitter() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        };

        for attempt in 0..5 {
            let delay = config.delay_for_attempt(attempt);
            let max_expected = Duration::from_millis((100.0 * 2.0_f64.powi(attempt as i32)) as u64);
            assert!(delay <= max_expected);
        }
    }

    #[test]
    fn test_config_builder() {
        let config = ManagerConfig::builder("token", test_fetch())
            .intents(513)
            .shard_count(4)
            .shard_ids(vec![0, 2])
            .build()
            .expect("valid config");

        assert_eq!(config.intents, 513);
        assert_eq!(config.shard_count, Some(4));
        assert_eq!(config.shard_ids, Some(vec![0, 2]));
        assert_eq!(config.placement, Placement::InProcess); // default
    }

    #[test]
    fn test_builder_rejects_empty_token() {
        assert!(ManagerConfig::builder("", test_fetch()).build().is_err());
    }

    #[test]
    fn test_builder_rejects_out_of_range_id() {
        let result = ManagerConfig::builder("token", test_fetch())
            .shard_count(4)
            .shard_ids(vec![0, 4])
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::ShardIdOutOfRange { id: 4, count: 4 })
        ));
    }

    #[test]
    fn test_builder_rejects_zero_shards_per_worker() {
        let result = ManagerConfig::builder("token", test_fetch())
            .placement(Placement::Workers {
                shards_per_worker: Some(0),
            })
            .build();
        assert!(result.is_err());
    }
}
