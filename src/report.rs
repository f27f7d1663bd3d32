//! Result records produced by the harnesses and their JSON rendering.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;

use crate::latency::LatencyStats;

/// Summary of one performance run. Latencies are in microseconds and are
/// `NaN` for a direction with no completed operations.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceResult {
    pub test_name: String,
    /// MiB/s.
    pub read_throughput_mbps: f64,
    pub write_throughput_mbps: f64,
    pub read_iops: f64,
    pub write_iops: f64,
    pub avg_read_latency_us: f64,
    pub avg_write_latency_us: f64,
    pub min_read_latency_us: f64,
    pub min_write_latency_us: f64,
    pub max_read_latency_us: f64,
    pub max_write_latency_us: f64,
    pub p99_read_latency_us: f64,
    pub p99_write_latency_us: f64,
    pub read_ops: u64,
    pub write_ops: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub failed_ops: u64,
    pub elapsed_seconds: f64,
    /// The run ended on a stop request rather than a bound.
    pub stopped: bool,
    /// Set when the run could not start (bad parameters).
    pub error: Option<String>,
}

impl PerformanceResult {
    pub fn empty(test_name: &str) -> Self {
        Self {
            test_name: test_name.to_string(),
            read_throughput_mbps: 0.0,
            write_throughput_mbps: 0.0,
            read_iops: 0.0,
            write_iops: 0.0,
            avg_read_latency_us: f64::NAN,
            avg_write_latency_us: f64::NAN,
            min_read_latency_us: f64::NAN,
            min_write_latency_us: f64::NAN,
            max_read_latency_us: f64::NAN,
            max_write_latency_us: f64::NAN,
            p99_read_latency_us: f64::NAN,
            p99_write_latency_us: f64::NAN,
            read_ops: 0,
            write_ops: 0,
            bytes_read: 0,
            bytes_written: 0,
            failed_ops: 0,
            elapsed_seconds: 0.0,
            stopped: false,
            error: None,
        }
    }

    pub fn invalid(test_name: &str, reason: String) -> Self {
        Self { error: Some(reason), ..Self::empty(test_name) }
    }

    pub(crate) fn fill_read_latency(&mut self, s: &LatencyStats) {
        self.avg_read_latency_us = s.get_average();
        self.min_read_latency_us = s.get_min();
        self.max_read_latency_us = s.get_max();
        self.p99_read_latency_us = s.get_percentile(99.0);
    }

    pub(crate) fn fill_write_latency(&mut self, s: &LatencyStats) {
        self.avg_write_latency_us = s.get_average();
        self.min_write_latency_us = s.get_min();
        self.max_write_latency_us = s.get_max();
        self.p99_write_latency_us = s.get_percentile(99.0);
    }

    pub fn total_ops(&self) -> u64 {
        self.read_ops + self.write_ops
    }

    pub fn metrics(&self) -> BTreeMap<String, f64> {
        [
            ("read_throughput_mbps", self.read_throughput_mbps),
            ("write_throughput_mbps", self.write_throughput_mbps),
            ("read_iops", self.read_iops),
            ("write_iops", self.write_iops),
            ("avg_read_latency_us", self.avg_read_latency_us),
            ("avg_write_latency_us", self.avg_write_latency_us),
            ("min_read_latency_us", self.min_read_latency_us),
            ("min_write_latency_us", self.min_write_latency_us),
            ("max_read_latency_us", self.max_read_latency_us),
            ("max_write_latency_us", self.max_write_latency_us),
            ("p99_read_latency_us", self.p99_read_latency_us),
            ("p99_write_latency_us", self.p99_write_latency_us),
            ("read_ops", self.read_ops as f64),
            ("write_ops", self.write_ops as f64),
            ("bytes_read", self.bytes_read as f64),
            ("bytes_written", self.bytes_written as f64),
            ("failed_ops", self.failed_ops as f64),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    /// Non-finite latencies render as `null`.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "test_name": self.test_name,
            "read_throughput_mbps": self.read_throughput_mbps,
            "write_throughput_mbps": self.write_throughput_mbps,
            "read_iops": self.read_iops,
            "write_iops": self.write_iops,
            "avg_read_latency_us": self.avg_read_latency_us,
            "avg_write_latency_us": self.avg_write_latency_us,
            "min_read_latency_us": self.min_read_latency_us,
            "min_write_latency_us": self.min_write_latency_us,
            "max_read_latency_us": self.max_read_latency_us,
            "max_write_latency_us": self.max_write_latency_us,
            "p99_read_latency_us": self.p99_read_latency_us,
            "p99_write_latency_us": self.p99_write_latency_us,
            "read_ops": self.read_ops,
            "write_ops": self.write_ops,
            "bytes_read": self.bytes_read,
            "bytes_written": self.bytes_written,
            "failed_ops": self.failed_ops,
            "elapsed_seconds": self.elapsed_seconds,
            "stopped": self.stopped,
            "error": self.error,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReliabilityResult {
    pub passed: bool,
    pub test_name: String,
    pub description: String,
    /// Operations that failed outright.
    pub errors_detected: usize,
    /// Blocks whose contents did not match what was written.
    pub data_corruptions: usize,
    /// Corrupted bytes over bytes compared.
    pub error_rate: f64,
    pub error_details: Vec<String>,
    pub duration: Duration,
}

impl ReliabilityResult {
    pub fn new(test_name: &str, description: &str) -> Self {
        Self {
            passed: false,
            test_name: test_name.to_string(),
            description: description.to_string(),
            errors_detected: 0,
            data_corruptions: 0,
            error_rate: 0.0,
            error_details: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Records an operation failure.
    pub fn error(&mut self, detail: String) {
        self.errors_detected += 1;
        self.error_details.push(detail);
    }

    /// Adds a note without counting it as an error.
    pub fn note(&mut self, detail: String) {
        self.error_details.push(detail);
    }

    pub fn is_clean(&self) -> bool {
        self.errors_detected == 0 && self.data_corruptions == 0
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "test_name": self.test_name,
            "description": self.description,
            "passed": self.passed,
            "errors_detected": self.errors_detected,
            "data_corruptions": self.data_corruptions,
            "error_rate": self.error_rate,
            "error_details": self.error_details,
            "duration_seconds": self.duration.as_secs_f64(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    Performance,
    Reliability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed,
    Stopped,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
            Outcome::Stopped => "stopped",
        }
    }
}

/// Flat record handed to whatever renders reports.
#[derive(Debug, Clone, PartialEq)]
pub struct TestSummary {
    pub name: String,
    pub kind: TestKind,
    pub outcome: Outcome,
    pub duration: Duration,
    pub metrics: BTreeMap<String, f64>,
    pub details: Vec<String>,
}

impl TestSummary {
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "type": match self.kind {
                TestKind::Performance => "performance",
                TestKind::Reliability => "reliability",
            },
            "outcome": self.outcome.as_str(),
            "duration_seconds": self.duration.as_secs_f64(),
            "metrics": self.metrics,
            "details": self.details,
        })
    }
}

impl From<&PerformanceResult> for TestSummary {
    fn from(r: &PerformanceResult) -> Self {
        let outcome = if r.error.is_some() || r.failed_ops > 0 {
            Outcome::Failed
        } else if r.stopped {
            Outcome::Stopped
        } else {
            Outcome::Passed
        };
        Self {
            name: r.test_name.clone(),
            kind: TestKind::Performance,
            outcome,
            duration: Duration::from_secs_f64(r.elapsed_seconds.max(0.0)),
            metrics: r.metrics(),
            details: r.error.iter().cloned().collect(),
        }
    }
}

impl From<&ReliabilityResult> for TestSummary {
    fn from(r: &ReliabilityResult) -> Self {
        let metrics = [
            ("errors_detected", r.errors_detected as f64),
            ("data_corruptions", r.data_corruptions as f64),
            ("error_rate", r.error_rate),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            name: r.test_name.clone(),
            kind: TestKind::Reliability,
            outcome: if r.passed { Outcome::Passed } else { Outcome::Failed },
            duration: r.duration,
            metrics,
            details: r.error_details.clone(),
        }
    }
}
