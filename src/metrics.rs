use crate::shard::ShardStatus;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters and per-shard gauges for observability.
///
/// Use `snapshot()` for a point-in-time view suitable for export, or the
/// individual getters for specific values.
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    zombie_disconnects_total: AtomicU64,
    rate_limit_stalls_total: AtomicU64,

    shard_metrics: RwLock<HashMap<u16, ShardMetrics>>,
}

/// Gauges for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    pub shard_id: u16,
    pub status: ShardStatus,
    /// Latest heartbeat round trip in milliseconds
    pub latency_ms: Option<u64>,
    pub(crate) last_connected_at: Option<Instant>,
}

impl ShardMetrics {
    fn new(shard_id: u16) -> Self {
        Self {
            shard_id,
            status: ShardStatus::Idle,
            latency_ms: None,
            last_connected_at: None,
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Total connections established
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Total reconnections
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    /// Total fresh identifies
    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    /// Total successful resumes
    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    /// Total frames received
    pub fn messages_received(&self) -> u64 {
        self.messages_received_total.load(Ordering::Relaxed)
    }

    /// Total payloads sent
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent_total.load(Ordering::Relaxed)
    }

    /// Total errors
    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Total zombie-connection disconnects
    pub fn zombie_disconnects(&self) -> u64 {
        self.zombie_disconnects_total.load(Ordering::Relaxed)
    }

    /// Total sends that stalled on the rate-limit window
    pub fn rate_limit_stalls(&self) -> u64 {
        self.rate_limit_stalls_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_identify(&self) {
        self.identifies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_received(&self) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_sent(&self) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_zombie_disconnect(&self) {
        self.zombie_disconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limit_stall(&self) {
        self.rate_limit_stalls_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update gauges for a specific shard
    pub(crate) fn update_shard(&self, shard_id: u16, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();
        let entry = shards
            .entry(shard_id)
            .or_insert_with(|| ShardMetrics::new(shard_id));
        update_fn(entry);
    }

    /// Gauges for every known shard
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        let mut shards: Vec<_> = self.shard_metrics.read().values().cloned().collect();
        shards.sort_by_key(|s| s.shard_id);
        shards
    }

    /// Number of shards currently in the Ready state
    pub fn ready_shards(&self) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.status == ShardStatus::Ready)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        let shards = self.shard_metrics();
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            messages_received_total: self.messages_received_total.load(Ordering::Acquire),
            messages_sent_total: self.messages_sent_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            zombie_disconnects_total: self.zombie_disconnects_total.load(Ordering::Acquire),
            rate_limit_stalls_total: self.rate_limit_stalls_total.load(Ordering::Acquire),
            ready_shards: shards
                .iter()
                .filter(|s| s.status == ShardStatus::Ready)
                .count(),
            shards,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub messages_received_total: u64,
    pub messages_sent_total: u64,
    pub errors_total: u64,
    pub zombie_disconnects_total: u64,
    pub rate_limit_stalls_total: u64,
    pub ready_shards: usize,
    pub shards: Vec<ShardMetrics>,
}
