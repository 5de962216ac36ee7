//! Gateway counters and the periodic summary line
//!
//! Totals back `/metrics`; the `*_since_report` counters are swapped to zero
//! by each `report()`.
//!
//! All atomics are Relaxed. They are statistics, never used for control flow.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Command round-trip bucket boundaries (milliseconds)
/// Buckets: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, >5000
const BUCKET_BOUNDS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
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

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
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

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

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
    positions_received: AtomicU64,
    positions_discarded: AtomicU64,
    /// Positions received since last report (reset on report)
    positions_since_report: AtomicU64,
    detector_ticks: AtomicU64,
    destination_events: AtomicU64,
    origin_events: AtomicU64,
    commands_enqueued: AtomicU64,
    commands_delivered: AtomicU64,
    commands_timed_out: AtomicU64,
    commands_failed: AtomicU64,
    command_queue_depth: AtomicU64,
    /// Delivery round-trip histogram (monotonic, exported to Prometheus)
    command_latency_buckets: [AtomicU64; NUM_BUCKETS],
    command_latency_sum_ms: AtomicU64,
    /// Max round trip since last report (reset on report)
    command_latency_max_ms: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_failed: AtomicU64,
    notifications_in_flight: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            positions_received: AtomicU64::new(0),
            positions_discarded: AtomicU64::new(0),
            positions_since_report: AtomicU64::new(0),
            detector_ticks: AtomicU64::new(0),
            destination_events: AtomicU64::new(0),
            origin_events: AtomicU64::new(0),
            commands_enqueued: AtomicU64::new(0),
            commands_delivered: AtomicU64::new(0),
            commands_timed_out: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
            command_queue_depth: AtomicU64::new(0),
            command_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            command_latency_sum_ms: AtomicU64::new(0),
            command_latency_max_ms: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            notifications_in_flight: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_position_received(&self) {
        self.positions_received.fetch_add(1, Ordering::Relaxed);
        self.positions_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_position_discarded(&self) {
        self.positions_discarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_detector_tick(&self) {
        self.detector_ticks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_destination_event(&self) {
        self.destination_events.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_origin_event(&self) {
        self.origin_events.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_command_enqueued(&self) {
        self.commands_enqueued.fetch_add(1, Ordering::Relaxed);
        self.command_queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Worker picked a command off the queue
    #[inline]
    pub fn record_command_dequeued(&self) {
        let _ = self.command_queue_depth.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
            Some(d.saturating_sub(1))
        });
    }

    /// Record a successful delivery and its round trip
    #[inline]
    pub fn record_command_delivered(&self, latency_ms: u64) {
        self.commands_delivered.fetch_add(1, Ordering::Relaxed);
        self.command_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.command_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.command_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_command_timeout(&self) {
        self.commands_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_command_failed(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn notification_started(&self) {
        self.notifications_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notification(&self, success: bool) {
        let _ = self.notifications_in_flight.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |n| Some(n.saturating_sub(1)),
        );
        if success {
            self.notifications_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.notifications_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn positions_received(&self) -> u64 {
        self.positions_received.load(Ordering::Relaxed)
    }

    pub fn positions_discarded(&self) -> u64 {
        self.positions_discarded.load(Ordering::Relaxed)
    }

    pub fn detector_ticks(&self) -> u64 {
        self.detector_ticks.load(Ordering::Relaxed)
    }

    pub fn destination_events(&self) -> u64 {
        self.destination_events.load(Ordering::Relaxed)
    }

    pub fn origin_events(&self) -> u64 {
        self.origin_events.load(Ordering::Relaxed)
    }

    pub fn commands_enqueued(&self) -> u64 {
        self.commands_enqueued.load(Ordering::Relaxed)
    }

    pub fn commands_delivered(&self) -> u64 {
        self.commands_delivered.load(Ordering::Relaxed)
    }

    pub fn commands_timed_out(&self) -> u64 {
        self.commands_timed_out.load(Ordering::Relaxed)
    }

    pub fn commands_failed(&self) -> u64 {
        self.commands_failed.load(Ordering::Relaxed)
    }

    pub fn command_queue_depth(&self) -> u64 {
        self.command_queue_depth.load(Ordering::Relaxed)
    }

    pub fn command_latency_buckets(&self) -> [u64; NUM_BUCKETS] {
        load_buckets(&self.command_latency_buckets)
    }

    pub fn command_latency_sum_ms(&self) -> u64 {
        self.command_latency_sum_ms.load(Ordering::Relaxed)
    }

    pub fn notifications_sent(&self) -> u64 {
        self.notifications_sent.load(Ordering::Relaxed)
    }

    pub fn notifications_failed(&self) -> u64 {
        self.notifications_failed.load(Ordering::Relaxed)
    }

    pub fn notifications_in_flight(&self) -> u64 {
        self.notifications_in_flight.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let positions_count = self.positions_since_report.swap(0, Ordering::Relaxed);
        let command_max_ms = self.command_latency_max_ms.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let positions_per_sec = if elapsed.as_secs_f64() > 0.0 {
            positions_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let buckets = self.command_latency_buckets();
        let delivered = self.commands_delivered();
        let avg_ms = if delivered > 0 { self.command_latency_sum_ms() / delivered } else { 0 };

        MetricsSummary {
            positions_received: self.positions_received(),
            positions_discarded: self.positions_discarded(),
            positions_per_sec,
            detector_ticks: self.detector_ticks(),
            destination_events: self.destination_events(),
            origin_events: self.origin_events(),
            commands_enqueued: self.commands_enqueued(),
            commands_delivered: delivered,
            commands_timed_out: self.commands_timed_out(),
            commands_failed: self.commands_failed(),
            command_queue_depth: self.command_queue_depth(),
            command_avg_ms: avg_ms,
            command_max_ms,
            command_p99_ms: percentile_from_buckets(&buckets, 0.99),
            notifications_sent: self.notifications_sent(),
            notifications_failed: self.notifications_failed(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for the status endpoint)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub positions_received: u64,
    pub positions_discarded: u64,
    pub positions_per_sec: f64,
    pub detector_ticks: u64,
    pub destination_events: u64,
    pub origin_events: u64,
    pub commands_enqueued: u64,
    pub commands_delivered: u64,
    pub commands_timed_out: u64,
    pub commands_failed: u64,
    pub command_queue_depth: u64,
    /// Average delivery round trip (ms)
    pub command_avg_ms: u64,
    /// Max delivery round trip since last report (ms)
    pub command_max_ms: u64,
    pub command_p99_ms: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            positions = %self.positions_received,
            discarded = %self.positions_discarded,
            positions_per_sec = format!("{:.1}", self.positions_per_sec),
            ticks = %self.detector_ticks,
            destination_events = %self.destination_events,
            origin_events = %self.origin_events,
            cmds_delivered = %self.commands_delivered,
            cmds_timed_out = %self.commands_timed_out,
            cmds_failed = %self.commands_failed,
            cmd_queue = %self.command_queue_depth,
            cmd_avg_ms = %self.command_avg_ms,
            cmd_p99_ms = %self.command_p99_ms,
            notify_sent = %self.notifications_sent,
            notify_failed = %self.notifications_failed,
            "metrics"
        );
    }
}
