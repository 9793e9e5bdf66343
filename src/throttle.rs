use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Interval between admissions within one bucket, matching the cadence the
/// gateway enforces server-side.
pub const IDENTIFY_COOLDOWN: Duration = Duration::from_secs(5);

/// Gates concurrent identifies across every shard this process drives.
///
/// The gateway allows at most `max_concurrency` shards to start a fresh
/// handshake at once, bucketed by `shard_id % max_concurrency`. Each bucket
/// is an independent single-slot queue: a shard waits for the bucket's
/// mutex (fair, first come first served) and then for the bucket's
/// cooldown to elapse. Resumes never pass through here.
///
/// There must be exactly one instance per process, owned by the
/// coordinating context; worker shards request admission through the
/// message protocol rather than holding their own copy.
#[derive(Debug)]
pub struct IdentifyThrottle {
    buckets: Vec<Mutex<Option<Instant>>>,
    cooldown: Duration,
}

impl IdentifyThrottle {
    pub fn new(max_concurrency: u16) -> Self {
        Self::with_cooldown(max_concurrency, IDENTIFY_COOLDOWN)
    }

    pub fn with_cooldown(max_concurrency: u16, cooldown: Duration) -> Self {
        let buckets = (0..max_concurrency.max(1))
            .map(|_| Mutex::new(None))
            .collect();
        Self { buckets, cooldown }
    }

    /// Number of identify buckets (the declared `max_concurrency`).
    pub fn max_concurrency(&self) -> u16 {
        self.buckets.len() as u16
    }

    /// Suspends until `shard_id`'s bucket admits it.
    pub async fn wait_for_identify(&self, shard_id: u16) {
        let bucket_id = usize::from(shard_id) % self.buckets.len();
        let mut last_admission = self.buckets[bucket_id].lock().await;

        if let Some(at) = *last_admission {
            let ready_at = at + self.cooldown;
            let now = Instant::now();
            if ready_at > now {
                debug!(
                    shard_id,
                    bucket_id,
                    wait_ms = (ready_at - now).as_millis() as u64,
                    "identify bucket cooling down"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }

        *last_admission = Some(Instant::now());
        debug!(shard_id, bucket_id, "identify admitted");
    }
}
