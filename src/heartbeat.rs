use std::time::Duration;
use tokio::time::Instant;

/// Tracks heartbeat state for a single connection.
///
/// The gateway declares the interval in its Hello frame. The first beat is
/// delayed by a random jitter fraction of the interval so a fleet of shards
/// reconnecting together does not beat in lockstep. A beat that was never
/// acknowledged by the time the next one is due marks the connection as a
/// zombie.
#[derive(Debug)]
pub struct Heartbeater {
    interval: Duration,
    /// When the next beat is due
    next_beat_at: Instant,
    /// Time of the last beat sent
    last_beat_at: Option<Instant>,
    /// Whether the last beat has been acknowledged
    acked: bool,
}

impl Heartbeater {
    /// Create a tracker from a Hello frame's declared interval.
    pub fn new(interval_ms: u64) -> Self {
        Self::with_jitter(interval_ms, rand::random::<f64>())
    }

    /// Deterministic constructor for tests; `jitter` in [0, 1).
    pub fn with_jitter(interval_ms: u64, jitter: f64) -> Self {
        let interval = Duration::from_millis(interval_ms);
        let first_wait = interval.mul_f64(jitter.clamp(0.0, 1.0));
        Self {
            interval,
            next_beat_at: Instant::now() + first_wait,
            last_beat_at: None,
            acked: true,
        }
    }

    /// Deadline for the next scheduled beat.
    pub fn next_beat_at(&self) -> Instant {
        self.next_beat_at
    }

    /// True when the previous beat was never acknowledged, meaning the
    /// connection should be dropped and resumed.
    pub fn is_zombie(&self) -> bool {
        !self.acked
    }

    /// Record that a beat went out on the wire.
    pub fn record_beat(&mut self) {
        self.last_beat_at = Some(Instant::now());
        self.next_beat_at = Instant::now() + self.interval;
        self.acked = false;
    }

    /// Record an acknowledgement; returns the round-trip latency.
    pub fn record_ack(&mut self) -> Option<Duration> {
        self.acked = true;
        self.last_beat_at.map(|at| at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_beat_is_jittered() {
        let beater = Heartbeater::with_jitter(10_000, 0.5);
        let wait = beater.next_beat_at() - Instant::now();
        assert!(wait > Duration::from_millis(4_900));
        assert!(wait <= Duration::from_millis(5_000));
    }

    #[test]
    fn test_zero_jitter_beats_immediately() {
        let beater = Heartbeater::with_jitter(10_000, 0.0);
        assert!(beater.next_beat_at() <= Instant::now());
    }

    #[test]
    fn test_ack_cycle() {
        let mut beater = Heartbeater::with_jitter(10_000, 0.0);
        assert!(!beater.is_zombie());

        beater.record_beat();
        assert!(beater.is_zombie()); // unacked until the gateway replies

        let latency = beater.record_ack();
        assert!(latency.is_some());
        assert!(!beater.is_zombie());
    }

    #[test]
    fn test_beat_schedules_full_interval() {
        let mut beater = Heartbeater::with_jitter(10_000, 0.0);
        beater.record_beat();
        let wait = beater.next_beat_at() - Instant::now();
        assert!(wait > Duration::from_millis(9_900));
    }
}
