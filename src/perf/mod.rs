//! Performance harness: throughput, latency, IOPS and scaling runs.
//!
//! Every run keeps the engine's queue topped up to `queue_depth` until a
//! bound is hit (duration, data size or a stop request), then drains what is
//! still outstanding. Written blocks carry an address pattern so optional
//! read-back verification can regenerate them from the LBA alone.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

mod preset;

pub use preset::Preset;

use crate::buffer::{allocate_aligned_buffer, AlignedBuf, DEFAULT_ALIGNMENT};
use crate::config::TestConfig;
use crate::device::SharedDevice;
use crate::engine::{Direction, IoCompletion, IoEngine, IoRequest, IoResult, RequestId};
use crate::error::{ErrorKind, Result};
use crate::latency::LatencyStats;
use crate::log::Logger;
use crate::pattern::{compare, ErrorStatistics, Pattern};
use crate::report::{PerformanceResult, ReliabilityResult};

/// Progress in `[0, 1]`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

const MIB: f64 = 1024.0 * 1024.0;
/// Share of an IOPS run excluded from the reported numbers.
const WARMUP_FRACTION: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Workload {
    SequentialRead,
    SequentialWrite,
    RandomRead,
    RandomWrite,
    /// Random LBAs; each op is a read with probability `read_percentage / 100`.
    Mixed { read_percentage: f64 },
}

impl Workload {
    fn is_random(self) -> bool {
        !matches!(self, Workload::SequentialRead | Workload::SequentialWrite)
    }

    fn pick(self, rng: &mut StdRng) -> Direction {
        match self {
            Workload::SequentialRead | Workload::RandomRead => Direction::Read,
            Workload::SequentialWrite | Workload::RandomWrite => Direction::Write,
            Workload::Mixed { read_percentage } => {
                if rng.gen_bool((read_percentage / 100.0).clamp(0.0, 1.0)) {
                    Direction::Read
                } else {
                    Direction::Write
                }
            }
        }
    }
}

/// Rate-limits callbacks to one per percent, plus a final `1.0`.
pub(crate) struct Progress {
    cb: Option<ProgressFn>,
    last: f64,
}

impl Progress {
    pub(crate) fn new(cb: Option<ProgressFn>) -> Self {
        Self { cb, last: 0.0 }
    }

    pub(crate) fn update(&mut self, fraction: f64) {
        let f = fraction.clamp(0.0, 1.0);
        if let Some(cb) = &self.cb {
            if f - self.last >= 0.01 {
                cb(f);
                self.last = f;
            }
        }
    }

    pub(crate) fn finish(&mut self) {
        if let Some(cb) = &self.cb {
            if self.last < 1.0 {
                cb(1.0);
            }
        }
        self.last = 1.0;
    }
}

#[derive(Default)]
struct Tally {
    read_lat: LatencyStats,
    write_lat: LatencyStats,
    read_ops: u64,
    write_ops: u64,
    bytes_read: u64,
    bytes_written: u64,
    failed: u64,
}

impl Tally {
    fn record(&mut self, direction: Direction, r: &IoResult) {
        if !r.success {
            self.failed += 1;
            return;
        }
        match direction {
            Direction::Read => {
                self.read_ops += 1;
                self.bytes_read += r.bytes_transferred;
                self.read_lat.add_sample(r.latency_us());
            }
            Direction::Write => {
                self.write_ops += 1;
                self.bytes_written += r.bytes_transferred;
                self.write_lat.add_sample(r.latency_us());
            }
        }
    }

    fn into_result(self, name: &str, elapsed: Duration, stopped: bool) -> PerformanceResult {
        let secs = elapsed.as_secs_f64();
        let per_sec = |v: f64| if secs > 0.0 { v / secs } else { 0.0 };
        let mut r = PerformanceResult::empty(name);
        r.read_throughput_mbps = per_sec(self.bytes_read as f64 / MIB);
        r.write_throughput_mbps = per_sec(self.bytes_written as f64 / MIB);
        r.read_iops = per_sec(self.read_ops as f64);
        r.write_iops = per_sec(self.write_ops as f64);
        r.fill_read_latency(&self.read_lat);
        r.fill_write_latency(&self.write_lat);
        r.read_ops = self.read_ops;
        r.write_ops = self.write_ops;
        r.bytes_read = self.bytes_read;
        r.bytes_written = self.bytes_written;
        r.failed_ops = self.failed;
        r.elapsed_seconds = secs;
        r.stopped = stopped;
        r
    }
}

#[derive(Debug, Default)]
struct VerifyLedger {
    stats: ErrorStatistics,
    verified_writes: u64,
    read_failures: u64,
}

pub struct PerformanceTests {
    engine: IoEngine,
    log: Logger,
    config: TestConfig,
    stop: Arc<AtomicBool>,
    progress: Option<ProgressFn>,
    ledger: Mutex<VerifyLedger>,
}

impl PerformanceTests {
    pub fn new(device: SharedDevice, log: Logger) -> Result<Self> {
        Ok(Self {
            engine: IoEngine::new(device, log.clone())?,
            log,
            config: TestConfig::default(),
            stop: Arc::new(AtomicBool::new(false)),
            progress: None,
            ledger: Mutex::new(VerifyLedger::default()),
        })
    }

    /// Base configuration for the latency, IOPS, scaling and preset runs.
    pub fn set_config(&mut self, cfg: TestConfig) -> std::result::Result<(), crate::config::ConfigError> {
        cfg.validate()?;
        self.config = cfg;
        Ok(())
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    pub fn engine(&self) -> &IoEngine {
        &self.engine
    }

    pub fn set_progress_callback(&mut self, cb: ProgressFn) {
        self.progress = Some(cb);
    }

    /// Checked between operations; the current run returns a partial result.
    pub fn stop_current_test(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Flag shared with signal handlers and other threads.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn begin(&self, name: &str) {
        self.stop.store(false, Ordering::SeqCst);
        self.engine.reset_statistics();
        self.log.info("starting performance test", &[("test", &name)]);
    }

    fn finish(&self, r: PerformanceResult) -> PerformanceResult {
        match &r.error {
            Some(e) => self.log.error("performance test not run", &[("test", &r.test_name), ("reason", e)]),
            None => {
                let elapsed = format!("{:.3}", r.elapsed_seconds);
                self.log.info(
                    "performance test finished",
                    &[
                        ("test", &r.test_name),
                        ("ops", &r.total_ops()),
                        ("failed", &r.failed_ops),
                        ("elapsed_s", &elapsed),
                        ("stopped", &r.stopped),
                    ],
                );
            }
        }
        r
    }

    pub fn test_sequential_read(&self, cfg: &TestConfig) -> PerformanceResult {
        self.begin("sequential_read");
        self.finish(self.run_workload("sequential_read", cfg, Workload::SequentialRead, None))
    }

    pub fn test_sequential_write(&self, cfg: &TestConfig) -> PerformanceResult {
        self.begin("sequential_write");
        self.finish(self.run_workload("sequential_write", cfg, Workload::SequentialWrite, None))
    }

    pub fn test_random_read(&self, cfg: &TestConfig) -> PerformanceResult {
        self.begin("random_read");
        self.finish(self.run_workload("random_read", cfg, Workload::RandomRead, None))
    }

    pub fn test_random_write(&self, cfg: &TestConfig) -> PerformanceResult {
        self.begin("random_write");
        self.finish(self.run_workload("random_write", cfg, Workload::RandomWrite, None))
    }

    pub fn test_mixed_workload(&self, cfg: &TestConfig, read_percentage: f64) -> PerformanceResult {
        let name = format!("mixed_workload_{}r", read_percentage);
        self.begin(&name);
        if !(0.0..=100.0).contains(&read_percentage) {
            return self.finish(PerformanceResult::invalid(
                &name,
                format!("read percentage {} outside 0..=100", read_percentage),
            ));
        }
        self.finish(self.run_workload(&name, cfg, Workload::Mixed { read_percentage }, None))
    }

    pub fn test_read_latency(&self, block_size: usize, sample_count: usize) -> PerformanceResult {
        self.begin("read_latency");
        self.finish(self.latency_run("read_latency", Direction::Read, block_size, sample_count))
    }

    pub fn test_write_latency(&self, block_size: usize, sample_count: usize) -> PerformanceResult {
        self.begin("write_latency");
        self.finish(self.latency_run("write_latency", Direction::Write, block_size, sample_count))
    }

    pub fn test_4k_random_read_iops(&self, duration_seconds: u64) -> PerformanceResult {
        self.begin("4k_random_read_iops");
        let cfg = self.iops_config(duration_seconds);
        self.finish(self.run_workload("4k_random_read_iops", &cfg, Workload::RandomRead, Some(WARMUP_FRACTION)))
    }

    pub fn test_4k_random_write_iops(&self, duration_seconds: u64) -> PerformanceResult {
        self.begin("4k_random_write_iops");
        let cfg = self.iops_config(duration_seconds);
        self.finish(self.run_workload("4k_random_write_iops", &cfg, Workload::RandomWrite, Some(WARMUP_FRACTION)))
    }

    fn iops_config(&self, duration_seconds: u64) -> TestConfig {
        TestConfig { block_size: 4096, duration_seconds, data_size: 0, ..self.config.clone() }
    }

    /// One random-read run per depth, in input order.
    pub fn test_queue_depth_scaling(&self, queue_depths: &[usize]) -> Vec<PerformanceResult> {
        self.begin("queue_depth_scaling");
        self.sweep(queue_depths, Workload::RandomRead, |cfg, qd| cfg.queue_depth = qd, "qd")
    }

    /// One sequential-read run per block size, in input order.
    pub fn test_block_size_scaling(&self, block_sizes: &[usize]) -> Vec<PerformanceResult> {
        self.begin("block_size_scaling");
        self.sweep(block_sizes, Workload::SequentialRead, |cfg, bs| cfg.block_size = bs, "bs")
    }

    fn sweep(
        &self,
        values: &[usize],
        workload: Workload,
        set: impl Fn(&mut TestConfig, usize),
        tag: &str,
    ) -> Vec<PerformanceResult> {
        values
            .iter()
            .map(|&v| {
                let name = format!("{}_scaling_{}{}", if tag == "qd" { "queue_depth" } else { "block_size" }, tag, v);
                if self.stop_requested() {
                    return PerformanceResult { stopped: true, ..PerformanceResult::empty(&name) };
                }
                self.engine.reset_statistics();
                let mut cfg = self.config.clone();
                set(&mut cfg, v);
                self.finish(self.run_workload(&name, &cfg, workload, None))
            })
            .collect()
    }

    /// Write then read with the preset's geometry, as two results.
    pub fn run_preset(&self, preset: Preset) -> Vec<PerformanceResult> {
        let cfg = preset.config(&self.config);
        let (w, r) = if preset.is_random() {
            (Workload::RandomWrite, Workload::RandomRead)
        } else {
            (Workload::SequentialWrite, Workload::SequentialRead)
        };
        let mut out = Vec::with_capacity(2);
        for (workload, suffix) in [(w, "write"), (r, "read")] {
            if out.last().is_some_and(|p: &PerformanceResult| p.stopped) {
                break;
            }
            let name = format!("{} {}", preset.label(), suffix);
            self.begin(&name);
            out.push(self.finish(self.run_workload(&name, &cfg, workload, None)));
        }
        out
    }

    /// Corruption found by read-back verification since the last reset.
    pub fn verification_result(&self) -> ReliabilityResult {
        let ledger = self.ledger.lock();
        let mut r = ReliabilityResult::new(
            "performance_verify",
            "read-back verification of writes issued by performance runs",
        );
        r.errors_detected = ledger.read_failures as usize;
        r.data_corruptions = ledger.stats.block_errors;
        r.error_rate = ledger.stats.error_rate();
        if ledger.read_failures > 0 {
            r.note(format!("{} verify reads failed", ledger.read_failures));
        }
        for pos in ledger.stats.error_positions.iter().take(32) {
            r.note(format!("mismatch at byte offset {}", pos));
        }
        r.note(format!("{} writes verified, {} bytes compared", ledger.verified_writes, ledger.stats.bytes_compared));
        r.passed = r.is_clean();
        r
    }

    pub fn reset_verification(&self) {
        *self.ledger.lock() = VerifyLedger::default();
    }

    fn verify_write(&self, c: &IoCompletion, device_block: usize) {
        let mut back = match allocate_aligned_buffer(c.buffer.len(), DEFAULT_ALIGNMENT) {
            Ok(b) => b,
            Err(_) => {
                self.ledger.lock().read_failures += 1;
                return;
            }
        };
        let r = self.engine.sync_read(c.lba, c.block_count, &mut back);
        let mut ledger = self.ledger.lock();
        if !r.success {
            ledger.read_failures += 1;
            return;
        }
        let stats = compare(&c.buffer, &back, device_block);
        if !stats.is_clean() {
            self.log.error(
                "read-back mismatch",
                &[("lba", &c.lba), ("bytes", &stats.byte_errors), ("bits", &stats.bit_errors)],
            );
        }
        ledger.stats.merge(&stats, c.lba as usize * device_block);
        ledger.verified_writes += 1;
    }

    /// Checks the transfer size against the device and returns blocks per op.
    fn blocks_per_op(&self, block_size: usize) -> std::result::Result<u64, String> {
        let info = self.engine.device_info();
        let dev = info.block_bytes();
        if block_size == 0 || block_size % dev != 0 {
            return Err(format!("block size {} is not a multiple of device block size {}", block_size, dev));
        }
        let bpo = (block_size / dev) as u64;
        if bpo > info.max_lba || bpo > u32::MAX as u64 {
            return Err(format!("block size {} exceeds device capacity", block_size));
        }
        Ok(bpo)
    }

    fn run_workload(
        &self,
        name: &str,
        cfg: &TestConfig,
        workload: Workload,
        warmup_fraction: Option<f64>,
    ) -> PerformanceResult {
        if let Err(e) = cfg.validate() {
            return PerformanceResult::invalid(name, e.to_string());
        }
        let bpo = match self.blocks_per_op(cfg.block_size) {
            Ok(n) => n,
            Err(e) => return PerformanceResult::invalid(name, e),
        };
        if let Err(e) = self.engine.configure(cfg) {
            return PerformanceResult::invalid(name, e.to_string());
        }
        let mut pool: Vec<AlignedBuf> = Vec::with_capacity(cfg.queue_depth);
        for _ in 0..cfg.queue_depth {
            match allocate_aligned_buffer(cfg.block_size, DEFAULT_ALIGNMENT) {
                Ok(b) => pool.push(b),
                Err(e) => return PerformanceResult::invalid(name, e.to_string()),
            }
        }

        let max_lba = self.engine.device_info().max_lba;
        let device_block = self.engine.device_info().block_bytes();
        let op_bytes = cfg.block_size as u64;
        let deadline = cfg.duration();
        let warmup = warmup_fraction.and_then(|f| deadline.map(|d| d.mul_f64(f)));
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut progress = Progress::new(self.progress.clone());
        let mut tally = Tally::default();
        let mut seq_lba = 0u64;
        let mut submitted_bytes = 0u64;
        // Requests accepted before warm-up ended; their completions are not tallied.
        let mut warmup_ids: HashSet<RequestId> = HashSet::new();
        let mut submitting = true;
        let mut stopped = false;
        let mut warmed = warmup.is_none();

        let start = Instant::now();
        let mut measure_start = start;
        loop {
            if !warmed && warmup.is_some_and(|w| start.elapsed() >= w) {
                warmed = true;
                tally = Tally::default();
                measure_start = Instant::now();
            }
            if submitting {
                if self.stop_requested() {
                    stopped = true;
                    submitting = false;
                } else if deadline.is_some_and(|d| start.elapsed() >= d) {
                    submitting = false;
                }
            }
            while submitting && self.engine.outstanding() < cfg.queue_depth {
                if cfg.data_size > 0 && submitted_bytes + op_bytes > cfg.data_size {
                    submitting = false;
                    break;
                }
                let Some(mut buf) = pool.pop() else { break };
                let lba = if workload.is_random() {
                    rng.gen_range(0..=max_lba - bpo)
                } else {
                    let l = seq_lba;
                    seq_lba = if l + 2 * bpo > max_lba { 0 } else { l + bpo };
                    l
                };
                let direction = workload.pick(&mut rng);
                let req = IoRequest::new(lba, bpo as u32, {
                    if direction == Direction::Write {
                        Pattern::Address { base: lba * device_block as u64 }.fill(&mut buf);
                    }
                    buf
                });
                let submitted = match direction {
                    Direction::Read => self.engine.async_read(req),
                    Direction::Write => self.engine.async_write(req),
                };
                match submitted {
                    Ok(id) => {
                        submitted_bytes += op_bytes;
                        if !warmed {
                            warmup_ids.insert(id);
                        }
                    }
                    Err(rejected) => {
                        tally.failed += 1;
                        self.log.debug("submission rejected", &[("lba", &lba), ("kind", &rejected.kind())]);
                        let busy = rejected.kind() == ErrorKind::ResourceExhausted;
                        pool.push(rejected.request.buffer);
                        if busy {
                            break;
                        }
                    }
                }
            }
            if !submitting && self.engine.outstanding() == 0 {
                break;
            }
            for c in self.engine.wait_for_completions(0) {
                if cfg.verify_data && c.direction == Direction::Write && c.result.success {
                    self.verify_write(&c, device_block);
                }
                if !warmup_ids.remove(&c.id) {
                    tally.record(c.direction, &c.result);
                }
                pool.push(c.buffer);
            }
            let by_time = deadline.map_or(0.0, |d| start.elapsed().as_secs_f64() / d.as_secs_f64());
            let by_bytes = if cfg.data_size > 0 { submitted_bytes as f64 / cfg.data_size as f64 } else { 0.0 };
            progress.update(by_time.max(by_bytes));
        }
        progress.finish();
        tally.into_result(name, measure_start.elapsed(), stopped)
    }

    fn latency_run(&self, name: &str, direction: Direction, block_size: usize, sample_count: usize) -> PerformanceResult {
        let bpo = match self.blocks_per_op(block_size) {
            Ok(n) => n,
            Err(e) => return PerformanceResult::invalid(name, e),
        };
        let mut buf = match allocate_aligned_buffer(block_size, DEFAULT_ALIGNMENT) {
            Ok(b) => b,
            Err(e) => return PerformanceResult::invalid(name, e.to_string()),
        };
        self.engine.enable_direct_io(self.config.direct_io);
        let max_lba = self.engine.device_info().max_lba;
        let device_block = self.engine.device_info().block_bytes() as u64;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut progress = Progress::new(self.progress.clone());
        let mut tally = Tally { read_lat: LatencyStats::with_capacity(sample_count), ..Tally::default() };
        let mut stopped = false;

        let start = Instant::now();
        for i in 0..sample_count {
            if self.stop_requested() {
                stopped = true;
                break;
            }
            let lba = rng.gen_range(0..=max_lba - bpo);
            let r = match direction {
                Direction::Read => self.engine.sync_read(lba, bpo as u32, &mut buf),
                Direction::Write => {
                    Pattern::Address { base: lba * device_block }.fill(&mut buf);
                    self.engine.sync_write(lba, bpo as u32, &buf)
                }
            };
            tally.record(direction, &r);
            progress.update((i + 1) as f64 / sample_count as f64);
        }
        progress.finish();
        tally.into_result(name, start.elapsed(), stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{share, BlockDevice, FaultPlan, SimDevice};

    fn harness(dev: SimDevice) -> PerformanceTests {
        let mut dev = dev;
        dev.initialize().unwrap();
        PerformanceTests::new(share(dev), Logger::null()).unwrap()
    }

    fn small_cfg() -> TestConfig {
        TestConfig {
            block_size: 4096,
            queue_depth: 4,
            duration_seconds: 5,
            data_size: 256 * 1024,
            direct_io: false,
            ..TestConfig::default()
        }
    }

    #[test]
    fn sequential_write_stays_within_data_size() {
        let p = harness(SimDevice::new(512, 4096));
        let cfg = TestConfig { queue_depth: 1, duration_seconds: 1, data_size: 1024 * 1024, ..small_cfg() };
        let r = p.test_sequential_write(&cfg);
        assert!(r.error.is_none());
        assert!(r.write_ops * 4096 <= 1024 * 1024);
        assert_eq!(r.failed_ops, 0);
        assert!(r.min_write_latency_us >= 0.0);
        assert!(r.avg_write_latency_us >= r.min_write_latency_us);
        let expected = r.write_ops as f64 / r.elapsed_seconds;
        assert!((r.write_iops - expected).abs() < 1e-6 * expected.max(1.0));
        assert!(r.read_ops == 0 && r.avg_read_latency_us.is_nan());
    }

    #[test]
    fn mixed_workload_respects_read_share() {
        let p = harness(SimDevice::new(512, 8192));
        let cfg = TestConfig { block_size: 512, data_size: 2000 * 512, ..small_cfg() };
        let r = p.test_mixed_workload(&cfg, 70.0);
        assert_eq!(r.total_ops(), 2000);
        let share = r.read_ops as f64 / 2000.0;
        assert!((0.6..0.8).contains(&share), "read share {}", share);
        assert!(p.test_mixed_workload(&cfg, 120.0).error.is_some());
    }

    #[test]
    fn verification_reports_flipped_blocks() {
        let faults = FaultPlan { flip_on_read: [8u64].into_iter().collect(), ..Default::default() };
        let p = harness(SimDevice::new(512, 256).with_faults(faults));
        let cfg = TestConfig { verify_data: true, data_size: 64 * 1024, ..small_cfg() };
        p.test_sequential_write(&cfg);
        let v = p.verification_result();
        assert!(!v.passed);
        assert_eq!(v.data_corruptions, 1);
        assert!(v.error_rate > 0.0);
        p.reset_verification();
        assert!(p.verification_result().passed);
    }

    #[test]
    fn stop_request_returns_partial_result() {
        let mut p = harness(SimDevice::new(512, 1024));
        let stop = p.stop_handle();
        p.set_progress_callback(Arc::new(move |f| {
            if f >= 0.01 {
                stop.store(true, Ordering::SeqCst);
            }
        }));
        let cfg = TestConfig { duration_seconds: 30, data_size: 0, ..small_cfg() };
        let r = p.test_random_read(&cfg);
        assert!(r.stopped);
        assert!(r.elapsed_seconds < 10.0);
        assert!(r.read_ops > 0);
    }

    #[test]
    fn progress_is_bounded_and_ends_at_one() {
        let mut p = harness(SimDevice::new(512, 1024));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        p.set_progress_callback(Arc::new(move |f| sink.lock().push(f)));
        p.test_sequential_read(&small_cfg());
        let seen = seen.lock();
        assert!(seen.len() <= 101);
        assert!(seen.iter().all(|f| (0.0..=1.0).contains(f)));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&1.0));
    }

    #[test]
    fn latency_runs_take_requested_samples() {
        let p = harness(SimDevice::new(512, 1024));
        let r = p.test_read_latency(4096, 100);
        assert_eq!(r.read_ops, 100);
        assert!(r.min_read_latency_us <= r.avg_read_latency_us);
        assert!(r.avg_read_latency_us <= r.max_read_latency_us);
        assert!(r.p99_read_latency_us <= r.max_read_latency_us);
        let w = p.test_write_latency(4096, 10);
        assert_eq!(w.write_ops, 10);
        assert!(p.test_read_latency(1000, 10).error.is_some());
    }

    #[test]
    fn iops_excludes_warmup() {
        let mut p = harness(SimDevice::new(512, 4096));
        p.set_config(TestConfig { queue_depth: 8, direct_io: false, ..TestConfig::default() }).unwrap();
        let r = p.test_4k_random_read_iops(1);
        assert!(r.read_iops > 0.0);
        assert!(r.elapsed_seconds < 1.0);
        assert!(p.test_4k_random_write_iops(0).error.is_some());
    }

    #[test]
    fn ops_submitted_during_warmup_are_not_counted() {
        let faults = FaultPlan { op_delay: Some(Duration::from_millis(20)), ..Default::default() };
        let mut dev = SimDevice::new(512, 4096).with_faults(faults);
        dev.initialize().unwrap();
        let shared = share(dev);
        let mut p = PerformanceTests::new(Arc::clone(&shared), Logger::null()).unwrap();
        p.set_config(TestConfig { queue_depth: 8, direct_io: false, ..TestConfig::default() }).unwrap();
        let r = p.test_4k_random_read_iops(1);
        assert_eq!(r.failed_ops, 0);
        assert!(r.read_ops > 0);
        // The first full queue goes out at once and is all warm-up.
        let executed = shared.lock().get_smart_data().unwrap().host_read_commands as u64;
        assert!(executed >= r.read_ops + 8, "{} executed, {} counted", executed, r.read_ops);
    }

    #[test]
    fn sync_mode_workload_completes() {
        let p = harness(SimDevice::new(512, 4096));
        let cfg = TestConfig { sync_io: true, verify_data: true, ..small_cfg() };
        let r = p.test_random_write(&cfg);
        assert!(r.error.is_none());
        assert_eq!(r.write_ops * 4096, 256 * 1024);
        assert_eq!(r.failed_ops, 0);
        assert!(p.engine().sync_io_enabled());
        assert!(p.verification_result().passed);
    }

    #[test]
    fn scaling_returns_one_result_per_value() {
        let mut p = harness(SimDevice::new(512, 2048));
        p.set_config(small_cfg()).unwrap();
        let qd = p.test_queue_depth_scaling(&[1, 0, 8]);
        assert_eq!(qd.len(), 3);
        assert!(qd[0].error.is_none() && qd[1].error.is_some() && qd[2].error.is_none());
        assert!(qd[2].test_name.ends_with("qd8"));
        let bs = p.test_block_size_scaling(&[512, 4096, 65536]);
        assert_eq!(bs.len(), 3);
        assert!(bs.iter().all(|r| r.error.is_none() && r.read_ops > 0));
        assert_eq!(bs[1].bytes_read % 4096, 0);
    }

    #[test]
    fn presets_write_then_read() {
        let mut p = harness(SimDevice::new(512, 8192));
        p.set_config(TestConfig { duration_seconds: 2, data_size: 2 * 1024 * 1024, direct_io: false, ..TestConfig::default() })
            .unwrap();
        let r = p.run_preset(Preset::Seq1Mq1t1);
        assert_eq!(r.len(), 2);
        assert_eq!(r[0].test_name, "SEQ1M Q1T1 write");
        assert_eq!(r[0].write_ops, 2);
        assert_eq!(r[1].read_ops, 2);
    }
}
