//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics so the fetch adapter and the pipeline can record without
//! sharing a lock. `report()` swaps the per-interval counters to get a
//! consistent snapshot.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters
//! only; do NOT use them for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Refresh duration bucket boundaries (milliseconds)
/// Buckets: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120
const BUCKET_BOUNDS: [u64; 10] = [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a duration value using binary search
#[inline]
fn bucket_index(duration_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < duration_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120, 10240];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Refreshes completed (monotonic)
    refreshes_total: AtomicU64,
    /// Reports handed to the pipeline (monotonic)
    reports_total: AtomicU64,
    /// Malformed reports skipped (monotonic)
    reports_skipped_total: AtomicU64,
    /// Reports outside the route/direction selection (monotonic)
    reports_filtered_total: AtomicU64,
    /// Loop events detected (monotonic)
    loops_total: AtomicU64,
    /// Loop events with an imputed boundary crossing (monotonic)
    loops_imputed_total: AtomicU64,
    /// Routes that failed a refresh (monotonic)
    route_failures_total: AtomicU64,
    /// API requests sent, including retries (monotonic)
    fetch_requests_total: AtomicU64,
    /// API requests retried (monotonic)
    fetch_retries_total: AtomicU64,
    /// Fetches that gave up (monotonic)
    fetch_failures_total: AtomicU64,
    /// Refresh duration histogram (reset on report)
    refresh_buckets: [AtomicU64; NUM_BUCKETS],
    /// Refreshes since last report (reset on report)
    refreshes_since_report: AtomicU64,
    /// Sum of refresh durations in ms (reset on report)
    refresh_sum_ms: AtomicU64,
    /// Max refresh duration in ms (reset on report)
    refresh_max_ms: AtomicU64,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            refreshes_total: AtomicU64::new(0),
            reports_total: AtomicU64::new(0),
            reports_skipped_total: AtomicU64::new(0),
            reports_filtered_total: AtomicU64::new(0),
            loops_total: AtomicU64::new(0),
            loops_imputed_total: AtomicU64::new(0),
            route_failures_total: AtomicU64::new(0),
            fetch_requests_total: AtomicU64::new(0),
            fetch_retries_total: AtomicU64::new(0),
            fetch_failures_total: AtomicU64::new(0),
            refresh_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            refreshes_since_report: AtomicU64::new(0),
            refresh_sum_ms: AtomicU64::new(0),
            refresh_max_ms: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Record a completed refresh and its pipeline counts
    #[inline]
    pub fn record_refresh(&self, stats: RefreshStats) {
        self.refreshes_total.fetch_add(1, Ordering::Relaxed);
        self.reports_total.fetch_add(stats.reports, Ordering::Relaxed);
        self.reports_skipped_total.fetch_add(stats.skipped, Ordering::Relaxed);
        self.reports_filtered_total.fetch_add(stats.filtered, Ordering::Relaxed);
        self.loops_total.fetch_add(stats.loops, Ordering::Relaxed);
        self.loops_imputed_total.fetch_add(stats.imputed, Ordering::Relaxed);
        self.route_failures_total.fetch_add(stats.route_failures, Ordering::Relaxed);

        self.refreshes_since_report.fetch_add(1, Ordering::Relaxed);
        self.refresh_sum_ms.fetch_add(stats.duration_ms, Ordering::Relaxed);
        self.refresh_buckets[bucket_index(stats.duration_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.refresh_max_ms, stats.duration_ms);
    }

    #[inline]
    pub fn record_fetch_request(&self) {
        self.fetch_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fetch_retry(&self) {
        self.fetch_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fetch_failure(&self) {
        self.fetch_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn refreshes_total(&self) -> u64 {
        self.refreshes_total.load(Ordering::Relaxed)
    }

    pub fn loops_total(&self) -> u64 {
        self.loops_total.load(Ordering::Relaxed)
    }

    /// Snapshot all counters; per-interval histogram values are reset
    pub fn report(&self) -> MetricsSummary {
        let buckets = swap_buckets(&self.refresh_buckets);
        let refreshes = self.refreshes_since_report.swap(0, Ordering::Relaxed);
        let sum_ms = self.refresh_sum_ms.swap(0, Ordering::Relaxed);
        let max_ms = self.refresh_max_ms.swap(0, Ordering::Relaxed);

        MetricsSummary {
            uptime_secs: self.started_at.elapsed().as_secs(),
            refreshes_total: self.refreshes_total.load(Ordering::Relaxed),
            reports_total: self.reports_total.load(Ordering::Relaxed),
            reports_skipped_total: self.reports_skipped_total.load(Ordering::Relaxed),
            reports_filtered_total: self.reports_filtered_total.load(Ordering::Relaxed),
            loops_total: self.loops_total.load(Ordering::Relaxed),
            loops_imputed_total: self.loops_imputed_total.load(Ordering::Relaxed),
            route_failures_total: self.route_failures_total.load(Ordering::Relaxed),
            fetch_requests_total: self.fetch_requests_total.load(Ordering::Relaxed),
            fetch_retries_total: self.fetch_retries_total.load(Ordering::Relaxed),
            fetch_failures_total: self.fetch_failures_total.load(Ordering::Relaxed),
            refresh_buckets: buckets,
            refresh_avg_ms: if refreshes > 0 { sum_ms / refreshes } else { 0 },
            refresh_max_ms: max_ms,
            refresh_p50_ms: percentile_from_buckets(&buckets, 0.50),
            refresh_p99_ms: percentile_from_buckets(&buckets, 0.99),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts from one refresh
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshStats {
    pub reports: u64,
    pub skipped: u64,
    pub filtered: u64,
    pub loops: u64,
    pub imputed: u64,
    pub route_failures: u64,
    pub duration_ms: u64,
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub uptime_secs: u64,
    pub refreshes_total: u64,
    pub reports_total: u64,
    pub reports_skipped_total: u64,
    pub reports_filtered_total: u64,
    pub loops_total: u64,
    pub loops_imputed_total: u64,
    pub route_failures_total: u64,
    pub fetch_requests_total: u64,
    pub fetch_retries_total: u64,
    pub fetch_failures_total: u64,
    /// Refresh duration histogram buckets since the last report
    /// Bounds: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120 ms
    pub refresh_buckets: [u64; NUM_BUCKETS],
    pub refresh_avg_ms: u64,
    pub refresh_max_ms: u64,
    pub refresh_p50_ms: u64,
    pub refresh_p99_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            uptime_secs = %self.uptime_secs,
            refreshes = %self.refreshes_total,
            reports = %self.reports_total,
            skipped = %self.reports_skipped_total,
            filtered = %self.reports_filtered_total,
            loops = %self.loops_total,
            imputed = %self.loops_imputed_total,
            route_failures = %self.route_failures_total,
            fetch_requests = %self.fetch_requests_total,
            fetch_retries = %self.fetch_retries_total,
            fetch_failures = %self.fetch_failures_total,
            refresh_avg_ms = %self.refresh_avg_ms,
            refresh_p99_ms = %self.refresh_p99_ms,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.refreshes_total(), 0);
        assert_eq!(metrics.loops_total(), 0);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(10), 0);
        assert_eq!(bucket_index(11), 1);
        assert_eq!(bucket_index(5120), 9);
        assert_eq!(bucket_index(100_000), 10);
    }

    #[test]
    fn test_record_refresh() {
        let metrics = Metrics::new();
        metrics.record_refresh(RefreshStats {
            reports: 10,
            skipped: 1,
            loops: 3,
            imputed: 1,
            duration_ms: 15,
            ..Default::default()
        });
        metrics.record_refresh(RefreshStats { reports: 5, loops: 2, duration_ms: 300, ..Default::default() });

        let summary = metrics.report();
        assert_eq!(summary.refreshes_total, 2);
        assert_eq!(summary.reports_total, 15);
        assert_eq!(summary.reports_skipped_total, 1);
        assert_eq!(summary.loops_total, 5);
        assert_eq!(summary.loops_imputed_total, 1);
        assert_eq!(summary.refresh_max_ms, 300);
        assert_eq!(summary.refresh_avg_ms, 157);
        assert_eq!(summary.refresh_p50_ms, 20);
        assert_eq!(summary.refresh_p99_ms, 320);
    }

    #[test]
    fn test_report_resets_interval_values() {
        let metrics = Metrics::new();
        metrics.record_refresh(RefreshStats { loops: 1, duration_ms: 50, ..Default::default() });
        let _ = metrics.report();

        let summary = metrics.report();
        assert_eq!(summary.refresh_max_ms, 0);
        assert_eq!(summary.refresh_avg_ms, 0);
        assert_eq!(summary.refresh_buckets.iter().sum::<u64>(), 0);
        // Monotonic counters survive
        assert_eq!(summary.loops_total, 1);
    }

    #[test]
    fn test_fetch_counters() {
        let metrics = Metrics::new();
        metrics.record_fetch_request();
        metrics.record_fetch_request();
        metrics.record_fetch_retry();
        metrics.record_fetch_failure();

        let summary = metrics.report();
        assert_eq!(summary.fetch_requests_total, 2);
        assert_eq!(summary.fetch_retries_total, 1);
        assert_eq!(summary.fetch_failures_total, 1);
    }
}
