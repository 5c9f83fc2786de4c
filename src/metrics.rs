use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Pipeline-wide observability counters.
///
/// Counters never affect behavior; they feed the health probe and logs.
#[derive(Default)]
pub struct Counters {
    // Upstream client
    pub rate_stalled: AtomicU64,
    pub upstream_calls: AtomicU64,
    pub upstream_retries: AtomicU64,
    pub upstream_unavailable: AtomicU64,
    pub upstream_rejected: AtomicU64,
    pub upstream_malformed: AtomicU64,
    pub upstream_backpressure_429: AtomicU64,

    // Tick store
    pub odds_ticks_written: AtomicU64,
    pub event_ticks_written: AtomicU64,
    pub stat_ticks_written: AtomicU64,
    pub prematch_rows_written: AtomicU64,
    pub duplicate_ticks_dropped: AtomicU64,
    pub validation_dropped: AtomicU64,
    pub storage_retries: AtomicU64,

    // Frame aggregator
    pub frames_materialized: AtomicU64,
    pub frames_lag_seconds: AtomicU64,
    pub late_ticks_dropped: AtomicU64,

    // Live loop
    pub pulls_completed: AtomicU64,
    pub pulls_failed: AtomicU64,
    pub pulls_cooled_down: AtomicU64,
    pub fixtures_closed: AtomicU64,

    // Scheduler & queues
    pub jobs_dispatched: AtomicU64,
    pub jobs_succeeded: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_timed_out: AtomicU64,
    pub jobs_cancelled: AtomicU64,
    pub queue_dropped_full: AtomicU64,
    pub queue_dropped_ttl: AtomicU64,

    // Fan-out bridge
    pub notes_published: AtomicU64,
    pub messages_delivered: AtomicU64,
    pub catchup_served_ring: AtomicU64,
    pub catchup_served_store: AtomicU64,
    pub catchup_unavailable: AtomicU64,
    pub slow_consumers_disconnected: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(counter: &AtomicU64, n: u64) {
        counter.store(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Rolling window of recent ingestion lags (pull start -> rows durable),
/// kept small so percentile reads stay cheap.
pub struct LagWindow {
    samples: Mutex<VecDeque<u64>>,
    capacity: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LagPercentiles {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub samples: usize,
}

impl LagWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, lag_ms: u64) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(lag_ms);
    }

    pub fn percentiles(&self) -> LagPercentiles {
        let samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return LagPercentiles::default();
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = |q: f64| -> u64 {
            let pos = ((sorted.len() - 1) as f64 * q).round() as usize;
            sorted[pos]
        };
        LagPercentiles {
            p50_ms: idx(0.50),
            p95_ms: idx(0.95),
            samples: sorted.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lag_window_percentiles() {
        let w = LagWindow::new(8);
        for ms in [10, 20, 30, 40, 50, 60, 70, 80] {
            w.record(ms);
        }
        let p = w.percentiles();
        assert_eq!(p.samples, 8);
        assert_eq!(p.p50_ms, 50);
        assert_eq!(p.p95_ms, 80);
    }

    #[test]
    fn lag_window_evicts_oldest() {
        let w = LagWindow::new(4);
        for ms in [1000, 1, 2, 3, 4] {
            w.record(ms);
        }
        // The 1000 ms outlier fell off the window.
        assert_eq!(w.percentiles().p95_ms, 4);
    }
}
