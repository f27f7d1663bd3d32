use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::IoResult;

/// Running aggregate for one engine. Latency fields are `None` until the
/// first operation is recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoStats {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub total_bytes: u64,
    pub total_time: Duration,
    pub min_latency: Option<Duration>,
    pub max_latency: Option<Duration>,
    pub avg_latency: Option<Duration>,
}

impl IoStats {
    fn record(&mut self, r: &IoResult) {
        self.total_operations += 1;
        if r.success {
            self.successful_operations += 1;
        } else {
            self.failed_operations += 1;
        }
        self.total_bytes += r.bytes_transferred;
        self.total_time += r.latency;
        self.min_latency = Some(self.min_latency.map_or(r.latency, |m| m.min(r.latency)));
        self.max_latency = Some(self.max_latency.map_or(r.latency, |m| m.max(r.latency)));
        let avg_ns = self.total_time.as_nanos() / self.total_operations as u128;
        self.avg_latency = Some(Duration::from_nanos(avg_ns as u64));
    }
}

/// All mutation goes through one lock so concurrent submitters never lose updates.
#[derive(Debug)]
pub(crate) struct StatsCollector {
    stats: Mutex<IoStats>,
    enabled: AtomicBool,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self { stats: Mutex::new(IoStats::default()), enabled: AtomicBool::new(true) }
    }
}

impl StatsCollector {
    pub(crate) fn record(&self, r: &IoResult) {
        if self.enabled.load(Ordering::Relaxed) {
            self.stats.lock().record(r);
        }
    }

    pub(crate) fn snapshot(&self) -> IoStats {
        self.stats.lock().clone()
    }

    pub(crate) fn reset(&self) {
        *self.stats.lock() = IoStats::default();
    }

    pub(crate) fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(us: u64, bytes: u64) -> IoResult {
        IoResult::ok(bytes, Duration::from_micros(us))
    }

    #[test]
    fn aggregates_and_reset() {
        let c = StatsCollector::default();
        c.record(&ok(10, 4096));
        c.record(&ok(30, 4096));
        let s = c.snapshot();
        assert_eq!(s.total_operations, 2);
        assert_eq!(s.successful_operations, 2);
        assert_eq!(s.total_bytes, 8192);
        assert_eq!(s.min_latency, Some(Duration::from_micros(10)));
        assert_eq!(s.max_latency, Some(Duration::from_micros(30)));
        assert_eq!(s.avg_latency, Some(Duration::from_micros(20)));
        c.reset();
        assert_eq!(c.snapshot(), IoStats::default());
    }

    #[test]
    fn disabled_collector_keeps_last_values() {
        let c = StatsCollector::default();
        c.record(&ok(10, 512));
        c.set_enabled(false);
        c.record(&ok(99, 512));
        let s = c.snapshot();
        assert_eq!(s.total_operations, 1);
        assert_eq!(s.max_latency, Some(Duration::from_micros(10)));
    }
}
