//! Workload Statistics
//!
//! Lock-free counters updated by processors and transmitters and sampled by
//! the reporter. All counters increase monotonically; the reporter derives
//! rates from the difference between two [`StatsSample`]s. Response latency
//! extremes are the exception and are swapped out at each sample.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Upper bound of the latency histogram in microseconds
pub const HISTOGRAM_CEILING_MICROS: u64 = 10_000_000;

/// Number of log2 buckets needed to reach the ceiling
const BUCKETS: usize = 25;

/// Error counter with per-category tracking
#[derive(Debug, Default)]
pub struct ErrorCounter {
    total: AtomicU64,
    by_category: RwLock<HashMap<String, u64>>,
}

impl ErrorCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error under its category
    pub fn record(&self, category: &str) {
        self.total.fetch_add(1, Ordering::AcqRel);
        *self.by_category.write().entry(category.to_string()).or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn count(&self, category: &str) -> u64 {
        self.by_category.read().get(category).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.by_category.read().clone()
    }
}

/// Log-scaled latency histogram.
///
/// Bucket 0 holds samples below one microsecond; bucket `i` holds samples in
/// `[2^(i-1), 2^i)` microseconds. Samples at or above the ceiling land in the
/// last bucket.
#[derive(Debug)]
pub struct AtomicHistogram {
    buckets: [AtomicU64; BUCKETS],
}

impl Default for AtomicHistogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl AtomicHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_of(micros: u64) -> usize {
        if micros >= HISTOGRAM_CEILING_MICROS {
            return BUCKETS - 1;
        }
        ((u64::BITS - micros.leading_zeros()) as usize).min(BUCKETS - 1)
    }

    #[inline]
    pub fn record_nanos(&self, nanos: u64) {
        self.buckets[Self::bucket_of(nanos / 1_000)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            counts: self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect(),
        }
    }
}

/// Point-in-time copy of a histogram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramSnapshot {
    counts: Vec<u64>,
}

impl Default for HistogramSnapshot {
    fn default() -> Self {
        Self {
            counts: vec![0; BUCKETS],
        }
    }
}

impl HistogramSnapshot {
    pub fn count(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn merge(&mut self, other: &HistogramSnapshot) {
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            *mine += theirs;
        }
    }

    /// Samples recorded since `earlier`
    pub fn diff(&self, earlier: &HistogramSnapshot) -> HistogramSnapshot {
        HistogramSnapshot {
            counts: self
                .counts
                .iter()
                .zip(&earlier.counts)
                .map(|(now, then)| now.saturating_sub(*then))
                .collect(),
        }
    }

    /// Upper bucket bound in microseconds below which `percentile` percent of
    /// samples fall
    pub fn percentile(&self, percentile: f64) -> Option<u64> {
        let total = self.count();
        if total == 0 {
            return None;
        }
        let rank = ((percentile / 100.0) * total as f64).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (index, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return Some(if index == BUCKETS - 1 {
                    HISTOGRAM_CEILING_MICROS
                } else {
                    1u64 << index
                });
            }
        }
        Some(HISTOGRAM_CEILING_MICROS)
    }
}

/// Counters maintained by one event processor
#[derive(Debug)]
pub struct ProcessorStats {
    pub bytes_in: AtomicU64,
    pub messages_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub messages_out: AtomicU64,
    pub receipts_in: AtomicU64,
    pub receipt_samples: AtomicU64,
    pub receipt_nanos: AtomicU64,
    pub responses_in: AtomicU64,
    pub response_samples: AtomicU64,
    pub response_nanos: AtomicU64,
    response_min: AtomicU64,
    response_max: AtomicU64,
    pub local_backlog_events: AtomicU64,
    pub local_backlog_nanos: AtomicU64,
    pub remote_backlog_events: AtomicU64,
    pub connections: AtomicI64,
    pub histogram: AtomicHistogram,
}

impl Default for ProcessorStats {
    fn default() -> Self {
        Self {
            bytes_in: AtomicU64::new(0),
            messages_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            receipts_in: AtomicU64::new(0),
            receipt_samples: AtomicU64::new(0),
            receipt_nanos: AtomicU64::new(0),
            responses_in: AtomicU64::new(0),
            response_samples: AtomicU64::new(0),
            response_nanos: AtomicU64::new(0),
            response_min: AtomicU64::new(u64::MAX),
            response_max: AtomicU64::new(0),
            local_backlog_events: AtomicU64::new(0),
            local_backlog_nanos: AtomicU64::new(0),
            remote_backlog_events: AtomicU64::new(0),
            connections: AtomicI64::new(0),
            histogram: AtomicHistogram::new(),
        }
    }
}

impl ProcessorStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_in(&self, bytes: usize) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_out(&self, bytes: usize) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Count a receipt, with its latency when the send was timestamped
    pub fn record_receipt(&self, latency_nanos: Option<u64>) {
        self.receipts_in.fetch_add(1, Ordering::Relaxed);
        if let Some(nanos) = latency_nanos {
            self.receipt_samples.fetch_add(1, Ordering::Relaxed);
            self.receipt_nanos.fetch_add(nanos, Ordering::Relaxed);
        }
    }

    /// Count a response, with its round-trip latency when sampled
    pub fn record_response(&self, latency_nanos: Option<u64>) {
        self.responses_in.fetch_add(1, Ordering::Relaxed);
        if let Some(nanos) = latency_nanos {
            self.record_latency_sample(nanos);
        }
    }

    /// Record a round-trip sample without counting a response message
    pub fn record_latency_sample(&self, nanos: u64) {
        self.response_samples.fetch_add(1, Ordering::Relaxed);
        self.response_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.response_min.fetch_min(nanos, Ordering::Relaxed);
        self.response_max.fetch_max(nanos, Ordering::Relaxed);
        self.histogram.record_nanos(nanos);
    }

    /// Minimum and maximum response latency since the previous call
    pub fn take_response_extremes(&self) -> (Option<u64>, Option<u64>) {
        let min = self.response_min.swap(u64::MAX, Ordering::AcqRel);
        let max = self.response_max.swap(0, Ordering::AcqRel);
        if min == u64::MAX {
            (None, None)
        } else {
            (Some(min), Some(max))
        }
    }
}

/// Counters maintained by one transmitter
#[derive(Debug, Default)]
pub struct TransmitterStats {
    pub bytes_out: AtomicU64,
    pub messages_out: AtomicU64,
    backlog_nanos: AtomicU64,
    backlog_start: AtomicI64,
}

impl TransmitterStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_out(&self, bytes: usize) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn begin_backlog(&self) {
        self.backlog_start.store(exabus::clock::now_nanos(), Ordering::Release);
    }

    pub fn end_backlog(&self) {
        let start = self.backlog_start.swap(0, Ordering::AcqRel);
        if start != 0 {
            self.backlog_nanos
                .fetch_add(exabus::clock::elapsed_since(start), Ordering::Relaxed);
        }
    }

    /// Time spent blocked on global backlog, including an ongoing wait
    pub fn backlog_nanos(&self) -> u64 {
        let done = self.backlog_nanos.load(Ordering::Acquire);
        match self.backlog_start.load(Ordering::Acquire) {
            0 => done,
            start => done + exabus::clock::elapsed_since(start),
        }
    }
}

/// Workload-wide counters at one instant
#[derive(Debug, Clone)]
pub struct StatsSample {
    pub at: Instant,
    pub bytes_in: u64,
    pub messages_in: u64,
    pub bytes_out: u64,
    pub messages_out: u64,
    pub receipts_in: u64,
    pub receipt_samples: u64,
    pub receipt_nanos: u64,
    pub responses_in: u64,
    pub response_samples: u64,
    pub response_nanos: u64,
    pub response_min: Option<u64>,
    pub response_max: Option<u64>,
    pub local_backlog_events: u64,
    pub local_backlog_nanos: u64,
    pub remote_backlog_events: u64,
    pub tx_backlog_nanos: u64,
    pub connections: i64,
    pub errors: u64,
    /// Bytes handed to the collectors; `None` when polling
    pub collected_bytes: Option<u64>,
    pub histogram: HistogramSnapshot,
}

impl StatsSample {
    pub fn empty(at: Instant) -> Self {
        Self {
            at,
            bytes_in: 0,
            messages_in: 0,
            bytes_out: 0,
            messages_out: 0,
            receipts_in: 0,
            receipt_samples: 0,
            receipt_nanos: 0,
            responses_in: 0,
            response_samples: 0,
            response_nanos: 0,
            response_min: None,
            response_max: None,
            local_backlog_events: 0,
            local_backlog_nanos: 0,
            remote_backlog_events: 0,
            tx_backlog_nanos: 0,
            connections: 0,
            errors: 0,
            collected_bytes: None,
            histogram: HistogramSnapshot::default(),
        }
    }

    /// Fold one processor's counters into the sample
    pub fn add_processor(&mut self, stats: &ProcessorStats) {
        self.bytes_in += stats.bytes_in.load(Ordering::Relaxed);
        self.messages_in += stats.messages_in.load(Ordering::Relaxed);
        self.bytes_out += stats.bytes_out.load(Ordering::Relaxed);
        self.messages_out += stats.messages_out.load(Ordering::Relaxed);
        self.receipts_in += stats.receipts_in.load(Ordering::Relaxed);
        self.receipt_samples += stats.receipt_samples.load(Ordering::Relaxed);
        self.receipt_nanos += stats.receipt_nanos.load(Ordering::Relaxed);
        self.responses_in += stats.responses_in.load(Ordering::Relaxed);
        self.response_samples += stats.response_samples.load(Ordering::Relaxed);
        self.response_nanos += stats.response_nanos.load(Ordering::Relaxed);
        self.local_backlog_events += stats.local_backlog_events.load(Ordering::Relaxed);
        self.local_backlog_nanos += stats.local_backlog_nanos.load(Ordering::Relaxed);
        self.remote_backlog_events += stats.remote_backlog_events.load(Ordering::Relaxed);
        self.connections += stats.connections.load(Ordering::Relaxed);

        let (min, max) = stats.take_response_extremes();
        self.response_min = merge_opt(self.response_min, min, u64::min);
        self.response_max = merge_opt(self.response_max, max, u64::max);
        self.histogram.merge(&stats.histogram.snapshot());
    }

    pub fn add_transmitter(&mut self, stats: &TransmitterStats) {
        self.bytes_out += stats.bytes_out.load(Ordering::Relaxed);
        self.messages_out += stats.messages_out.load(Ordering::Relaxed);
        self.tx_backlog_nanos += stats.backlog_nanos();
    }

    pub fn add_collected(&mut self, bytes: u64) {
        self.collected_bytes = Some(self.collected_bytes.unwrap_or(0) + bytes);
    }
}

fn merge_opt(a: Option<u64>, b: Option<u64>, f: fn(u64, u64) -> u64) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(a, b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_and_ceiling() {
        let histogram = AtomicHistogram::new();
        histogram.record_nanos(500); // < 1us
        histogram.record_nanos(1_500); // 1us
        histogram.record_nanos(3_000_000); // 3ms
        histogram.record_nanos(60_000_000_000); // above ceiling

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count(), 4);
        assert_eq!(snapshot.percentile(25.0), Some(1));
        assert_eq!(snapshot.percentile(50.0), Some(2));
        assert_eq!(snapshot.percentile(75.0), Some(4096));
        assert_eq!(snapshot.percentile(100.0), Some(HISTOGRAM_CEILING_MICROS));
        assert_eq!(HistogramSnapshot::default().percentile(50.0), None);
    }

    #[test]
    fn test_histogram_merge_and_diff() {
        let a = AtomicHistogram::new();
        let b = AtomicHistogram::new();
        a.record_nanos(10_000);
        let before = a.snapshot();
        a.record_nanos(10_000);
        b.record_nanos(1_000_000);

        let mut merged = a.snapshot();
        merged.merge(&b.snapshot());
        assert_eq!(merged.count(), 3);
        assert_eq!(a.snapshot().diff(&before).count(), 1);
    }

    #[test]
    fn test_response_extremes_reset_per_sample() {
        let stats = ProcessorStats::new();
        stats.record_response(Some(300));
        stats.record_response(Some(100));
        stats.record_response(None);
        assert_eq!(stats.responses_in.load(Ordering::Relaxed), 3);
        assert_eq!(stats.take_response_extremes(), (Some(100), Some(300)));
        assert_eq!(stats.take_response_extremes(), (None, None));
    }

    #[test]
    fn test_transmitter_backlog_includes_ongoing_wait() {
        let stats = TransmitterStats::new();
        assert_eq!(stats.backlog_nanos(), 0);
        stats.begin_backlog();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(stats.backlog_nanos() >= 2_000_000);
        stats.end_backlog();
        let settled = stats.backlog_nanos();
        assert!(settled >= 2_000_000);
        stats.end_backlog();
        assert_eq!(stats.backlog_nanos(), settled);
    }

    #[test]
    fn test_sample_aggregates_workers() {
        let p1 = ProcessorStats::new();
        let p2 = ProcessorStats::new();
        p1.record_in(100);
        p2.record_in(50);
        p1.record_response(Some(900));
        p2.record_response(Some(400));
        p1.connections.fetch_add(2, Ordering::Relaxed);

        let tx = TransmitterStats::new();
        tx.record_out(64);

        let mut sample = StatsSample::empty(Instant::now());
        sample.add_processor(&p1);
        sample.add_processor(&p2);
        sample.add_transmitter(&tx);

        assert_eq!(sample.bytes_in, 150);
        assert_eq!(sample.messages_in, 2);
        assert_eq!(sample.messages_out, 1);
        assert_eq!(sample.response_min, Some(400));
        assert_eq!(sample.response_max, Some(900));
        assert_eq!(sample.connections, 2);
        assert_eq!(sample.collected_bytes, None);
        assert_eq!(sample.histogram.count(), 2);
    }

    #[test]
    fn test_error_counter_categories() {
        let errors = ErrorCounter::new();
        errors.record("unknown_peer");
        errors.record("unknown_peer");
        errors.record("header");
        assert_eq!(errors.total(), 3);
        assert_eq!(errors.count("unknown_peer"), 2);
        assert_eq!(errors.snapshot().len(), 2);
    }
}
