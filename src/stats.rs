//! Query statistics for the masquerading server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::handler::Outcome;

/// Atomic per-outcome counters.
pub struct Stats {
    masqueraded: AtomicU64,
    forwarded: AtomicU64,
    server_failures: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            masqueraded: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            server_failures: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    pub fn record(&self, outcome: &Outcome, elapsed: Duration) {
        let counter = match outcome {
            Outcome::Masqueraded { .. } => &self.masqueraded,
            Outcome::Forwarded { .. } => &self.forwarded,
            Outcome::ServerFailure { .. } => &self.server_failures,
            Outcome::FormatError | Outcome::NotImplemented { .. } => &self.rejected,
            Outcome::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let masqueraded = self.masqueraded.load(Ordering::Relaxed);
        let forwarded = self.forwarded.load(Ordering::Relaxed);
        let server_failures = self.server_failures.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let dropped = self.dropped.load(Ordering::Relaxed);
        let total_us = self.total_response_time_us.load(Ordering::Relaxed);

        let requests = masqueraded + forwarded + server_failures + rejected + dropped;
        let avg_response_ms = if requests > 0 {
            (total_us as f64 / requests as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            requests,
            masqueraded,
            forwarded,
            server_failures,
            rejected,
            dropped,
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub masqueraded: u64,
    pub forwarded: u64,
    pub server_failures: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub avg_response_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_counts_by_outcome() {
        let stats = Stats::new();
        let upstream = "10.0.0.1:53".parse().unwrap();

        stats.record(
            &Outcome::Masqueraded {
                addr: "127.0.0.1".parse().unwrap(),
            },
            Duration::from_millis(1),
        );
        stats.record(&Outcome::Forwarded { upstream }, Duration::from_millis(3));
        stats.record(&Outcome::FormatError, Duration::ZERO);
        stats.record(&Outcome::NotImplemented { opcode: 5 }, Duration::ZERO);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests, 4);
        assert_eq!(snapshot.masqueraded, 1);
        assert_eq!(snapshot.forwarded, 1);
        assert_eq!(snapshot.rejected, 2);
        assert_eq!(snapshot.server_failures, 0);
        assert!((snapshot.avg_response_ms - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_snapshot_has_zero_average() {
        assert_eq!(Stats::new().snapshot().avg_response_ms, 0.0);
    }
}
