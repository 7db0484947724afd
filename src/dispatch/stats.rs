//! Lookup statistics tracking
//!
//! Per-phase timings follow the host runtime totals of the device driver:
//! preparing descriptors, copy-in, launch, copy-out and merge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Phases of one lookup call that are timed separately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    CopyIn,
    Launch,
    CopyOut,
    Merge,
}

/// Statistics for lookup calls
#[derive(Debug)]
pub struct LookupStats {
    /// Lookup calls that reached `Done`
    pub lookups_completed: AtomicU64,

    /// Lookup calls that failed
    pub lookups_failed: AtomicU64,

    /// Bags reduced across all calls and embeddings
    pub bags_reduced: AtomicU64,

    /// Wall time of completed calls, microseconds
    pub total_lookup_us: AtomicU64,

    pub prepare_us: AtomicU64,
    pub copy_in_us: AtomicU64,
    pub launch_us: AtomicU64,
    pub copy_out_us: AtomicU64,
    pub merge_us: AtomicU64,

    /// Start time for uptime tracking
    pub start_time: Instant,
}

impl Default for LookupStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LookupStats {
    pub fn new() -> Self {
        Self {
            lookups_completed: AtomicU64::new(0),
            lookups_failed: AtomicU64::new(0),
            bags_reduced: AtomicU64::new(0),
            total_lookup_us: AtomicU64::new(0),
            prepare_us: AtomicU64::new(0),
            copy_in_us: AtomicU64::new(0),
            launch_us: AtomicU64::new(0),
            copy_out_us: AtomicU64::new(0),
            merge_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a completed call
    pub fn record_success(&self, bags: u64, elapsed: Duration) {
        self.lookups_completed.fetch_add(1, Ordering::Relaxed);
        self.bags_reduced.fetch_add(bags, Ordering::Relaxed);
        self.total_lookup_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        self.lookups_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Accumulate time spent in one phase
    pub fn record_phase(&self, phase: Phase, elapsed: Duration) {
        let counter = match phase {
            Phase::Prepare => &self.prepare_us,
            Phase::CopyIn => &self.copy_in_us,
            Phase::Launch => &self.launch_us,
            Phase::CopyOut => &self.copy_out_us,
            Phase::Merge => &self.merge_us,
        };
        counter.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn total_lookups(&self) -> u64 {
        self.lookups_completed.load(Ordering::Relaxed) + self.lookups_failed.load(Ordering::Relaxed)
    }

    /// Average latency of completed calls in milliseconds
    pub fn avg_latency_ms(&self) -> f64 {
        let done = self.lookups_completed.load(Ordering::Relaxed);
        if done == 0 {
            return 0.0;
        }
        self.total_lookup_us.load(Ordering::Relaxed) as f64 / done as f64 / 1000.0
    }

    /// Bags reduced per second of lookup wall time
    pub fn bags_per_second(&self) -> f64 {
        let total_s = self.total_lookup_us.load(Ordering::Relaxed) as f64 / 1e6;
        if total_s == 0.0 {
            return 0.0;
        }
        self.bags_reduced.load(Ordering::Relaxed) as f64 / total_s
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Log a summary of the counters
    pub fn log_summary(&self) {
        let ms = |c: &AtomicU64| c.load(Ordering::Relaxed) as f64 / 1000.0;
        info!(
            completed = self.lookups_completed.load(Ordering::Relaxed),
            failed = self.lookups_failed.load(Ordering::Relaxed),
            avg_latency_ms = format!("{:.3}", self.avg_latency_ms()),
            bags_per_sec = format!("{:.0}", self.bags_per_second()),
            prepare_ms = ms(&self.prepare_us),
            copy_in_ms = ms(&self.copy_in_us),
            launch_ms = ms(&self.launch_us),
            copy_out_ms = ms(&self.copy_out_us),
            merge_ms = ms(&self.merge_us),
            "Lookup statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stats() {
        let stats = LookupStats::new();
        assert_eq!(stats.total_lookups(), 0);
        assert_eq!(stats.avg_latency_ms(), 0.0);
        assert_eq!(stats.bags_per_second(), 0.0);
    }

    #[test]
    fn test_record_success_and_failure() {
        let stats = LookupStats::new();
        stats.record_success(64, Duration::from_millis(2));
        stats.record_success(64, Duration::from_millis(4));
        stats.record_failure();

        assert_eq!(stats.total_lookups(), 3);
        assert!((stats.avg_latency_ms() - 3.0).abs() < 1e-9);
        assert!((stats.bags_per_second() - 128.0 / 0.006).abs() < 1.0);
    }

    #[test]
    fn test_record_phase() {
        let stats = LookupStats::new();
        stats.record_phase(Phase::Launch, Duration::from_micros(250));
        stats.record_phase(Phase::Launch, Duration::from_micros(250));
        assert_eq!(stats.launch_us.load(Ordering::Relaxed), 500);
        assert_eq!(stats.copy_in_us.load(Ordering::Relaxed), 0);
    }
}
