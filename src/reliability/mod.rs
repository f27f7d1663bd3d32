//! Reliability harness: data integrity, adverse conditions, boundaries,
//! recovery and SMART health checks.
//!
//! Tests work inside a region that starts after `guard_blocks` and is
//! followed by another `guard_blocks`; the adverse-condition tests use the
//! guards to detect writes that land outside the range they targeted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

mod adverse;
mod boundary;
mod integrity;
mod recovery;
mod smart;

pub use adverse::Interruption;

use crate::buffer::{allocate_aligned_buffer, AlignedBuf, DEFAULT_ALIGNMENT};
use crate::config::DEFAULT_SEED;
use crate::device::{DeviceInfo, SharedDevice, SmartData};
use crate::engine::{IoEngine, IoResult};
use crate::error::Result;
use crate::log::Logger;
use crate::pattern::{compare, ErrorStatistics, Pattern};
use crate::perf::{Progress, ProgressFn};
use crate::report::ReliabilityResult;

/// NVMe critical warning bit for temperature outside the operating range.
pub(crate) const WARN_TEMPERATURE: u8 = 0x02;

/// Sizes and knobs shared by the reliability tests.
#[derive(Debug, Clone, PartialEq)]
pub struct ReliabilityConfig {
    /// Blocks under test, clamped to what the device can hold with guards.
    pub region_blocks: u64,
    /// Blocks on each side of the region that must never change.
    pub guard_blocks: u64,
    /// Region-relative block where adverse-condition tests interrupt the device.
    pub interruption_block: u64,
    /// Largest single transfer, in blocks.
    pub chunk_blocks: u32,
    pub cycles: usize,
    pub seed: u64,
    pub direct_io: bool,
    /// Sustained-load phase of the thermal test.
    pub stress_duration: Duration,
    pub queue_depth: usize,
    pub concurrent_queues: u32,
    /// Rewrite passes over the hot set in the wear-leveling test.
    pub wear_passes: usize,
    pub hot_blocks: u64,
    /// Extra attempts before a read failure is treated as persistent.
    pub retries: u32,
    /// Highest acceptable composite temperature.
    pub max_temperature_c: i32,
    /// Lowest acceptable spare capacity, in percent. The device's own
    /// threshold applies when it is higher.
    pub min_available_spare: u8,
    /// Highest acceptable share of rated endurance used, in percent.
    pub max_percentage_used: u8,
    /// Temperature the thermal tests hold the device at. A target above
    /// `max_temperature_c` is expected to cross the temperature limit.
    pub thermal_target_c: Option<i32>,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            region_blocks: 1024,
            guard_blocks: 16,
            interruption_block: 512,
            chunk_blocks: 64,
            cycles: 100,
            seed: DEFAULT_SEED,
            direct_io: false,
            stress_duration: Duration::from_secs(2),
            queue_depth: 16,
            concurrent_queues: 4,
            wear_passes: 16,
            hot_blocks: 8,
            retries: 2,
            max_temperature_c: 70,
            min_available_spare: 10,
            max_percentage_used: 100,
            thermal_target_c: Some(85),
        }
    }
}

/// Block range, in LBAs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Region {
    pub start: u64,
    pub blocks: u64,
}

impl Region {
    pub fn end(&self) -> u64 {
        self.start + self.blocks
    }
}

/// State of one test while it runs.
pub(crate) struct Run {
    pub result: ReliabilityResult,
    pub ledger: ErrorStatistics,
    pub progress: Progress,
    pub start: Instant,
    pub stopped: bool,
}

pub struct ReliabilityTests {
    device: SharedDevice,
    engine: IoEngine,
    log: Logger,
    config: ReliabilityConfig,
    stop: Arc<AtomicBool>,
    progress: Option<ProgressFn>,
}

impl ReliabilityTests {
    pub fn new(device: SharedDevice, log: Logger) -> Result<Self> {
        let engine = IoEngine::new(Arc::clone(&device), log.clone())?;
        let config = ReliabilityConfig::default();
        engine.set_queue_depth(config.queue_depth)?;
        Ok(Self { device, engine, log, config, stop: Arc::new(AtomicBool::new(false)), progress: None })
    }

    pub fn set_config(&mut self, config: ReliabilityConfig) -> Result<()> {
        self.engine.set_queue_depth(config.queue_depth)?;
        self.engine.enable_direct_io(config.direct_io);
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    pub fn set_progress_callback(&mut self, cb: ProgressFn) {
        self.progress = Some(cb);
    }

    pub fn stop_current_test(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn info(&self) -> &DeviceInfo {
        self.engine.device_info()
    }

    pub(crate) fn block_bytes(&self) -> usize {
        self.info().block_bytes()
    }

    /// Every test in a fixed order; stops early on a stop request.
    pub fn run_all(&self) -> Vec<ReliabilityResult> {
        type Test = fn(&ReliabilityTests) -> ReliabilityResult;
        let tests: [Test; 16] = [
            Self::test_data_integrity_simple,
            Self::test_data_integrity_complex_patterns,
            Self::test_data_persistence,
            |t| t.test_write_read_verify_cycles(t.config.cycles),
            Self::test_power_loss_simulation,
            Self::test_unexpected_disconnection,
            Self::test_thermal_stress,
            Self::test_boundary_conditions,
            Self::test_maximum_lba_access,
            Self::test_concurrent_access,
            Self::test_error_recovery,
            Self::test_bad_block_handling,
            Self::test_wear_leveling_verification,
            Self::test_smart_attributes,
            Self::test_smart_thresholds,
            Self::test_smart_error_log,
        ];
        let mut out = Vec::with_capacity(tests.len());
        for test in tests {
            let r = test(self);
            let stopped = self.stop_requested();
            out.push(r);
            if stopped {
                self.log.warn("reliability run stopped", &[("completed", &out.len())]);
                break;
            }
        }
        out
    }

    pub(crate) fn begin(&self, name: &str, description: &str) -> Run {
        self.stop.store(false, Ordering::SeqCst);
        self.log.info("starting reliability test", &[("test", &name)]);
        Run {
            result: ReliabilityResult::new(name, description),
            ledger: ErrorStatistics::default(),
            progress: Progress::new(self.progress.clone()),
            start: Instant::now(),
            stopped: false,
        }
    }

    /// Checks the stop flag at an operation boundary.
    pub(crate) fn should_stop(&self, run: &mut Run) -> bool {
        if !run.stopped && self.stop_requested() {
            run.stopped = true;
            run.result.note("stopped before completion".to_string());
        }
        run.stopped
    }

    pub(crate) fn conclude(&self, mut run: Run) -> ReliabilityResult {
        run.progress.finish();
        let r = &mut run.result;
        r.data_corruptions += run.ledger.block_errors;
        r.error_rate = run.ledger.error_rate();
        r.passed = r.is_clean() && !run.stopped;
        r.duration = run.start.elapsed();
        if r.passed {
            self.log.info("reliability test passed", &[("test", &r.test_name)]);
        } else {
            self.log.error(
                "reliability test failed",
                &[
                    ("test", &r.test_name),
                    ("errors", &r.errors_detected),
                    ("corruptions", &r.data_corruptions),
                ],
            );
        }
        run.result
    }

    /// The test region with guards on both sides, or `None` if the device is too small.
    pub(crate) fn region(&self, run: &mut Run) -> Option<Region> {
        let guard = self.config.guard_blocks;
        let max = self.info().max_lba;
        let room = max.saturating_sub(2 * guard);
        if room == 0 || self.config.region_blocks == 0 {
            run.result.error(format!("device with {} blocks has no room for a test region", max));
            return None;
        }
        Some(Region { start: guard, blocks: self.config.region_blocks.min(room) })
    }

    pub(crate) fn pattern_buf(&self, blocks: u64, pattern: &Pattern) -> Result<AlignedBuf> {
        let mut buf = allocate_aligned_buffer(blocks as usize * self.block_bytes(), DEFAULT_ALIGNMENT)?;
        pattern.fill(&mut buf);
        Ok(buf)
    }

    pub(crate) fn write(&self, run: &mut Run, lba: u64, data: &[u8]) -> bool {
        let blocks = (data.len() / self.block_bytes()) as u32;
        let w = self.engine.sync_write(lba, blocks, data);
        if !w.success {
            run.result.error(format!("write of {} blocks at LBA {} failed: {}", blocks, lba, describe(&w)));
        }
        w.success
    }

    pub(crate) fn read(&self, run: &mut Run, lba: u64, blocks: u64) -> Option<AlignedBuf> {
        let mut buf = match allocate_aligned_buffer(blocks as usize * self.block_bytes(), DEFAULT_ALIGNMENT) {
            Ok(b) => b,
            Err(e) => {
                run.result.error(format!("buffer allocation failed: {}", e));
                return None;
            }
        };
        let r = self.engine.sync_read(lba, blocks as u32, &mut buf);
        if !r.success {
            run.result.error(format!("read of {} blocks at LBA {} failed: {}", blocks, lba, describe(&r)));
            return None;
        }
        Some(buf)
    }

    /// Compares and folds mismatches into the run's ledger; `true` when clean.
    pub(crate) fn check(&self, run: &mut Run, lba: u64, expected: &[u8], actual: &[u8]) -> bool {
        let bs = self.block_bytes();
        let s = compare(expected, actual, bs);
        let clean = s.is_clean();
        if !clean {
            let first = s.error_positions.first().map_or(lba, |p| lba + (*p / bs) as u64);
            run.result.note(format!(
                "{} corrupted bytes ({} bits) in {} blocks starting near LBA {}",
                s.byte_errors, s.bit_errors, s.block_errors, first
            ));
        }
        run.ledger.merge(&s, lba as usize * bs);
        clean
    }

    /// Write, read back and compare one transfer.
    pub(crate) fn write_verify(&self, run: &mut Run, lba: u64, blocks: u64, pattern: &Pattern) -> bool {
        let expected = match self.pattern_buf(blocks, pattern) {
            Ok(b) => b,
            Err(e) => {
                run.result.error(format!("buffer allocation failed: {}", e));
                return false;
            }
        };
        if !self.write(run, lba, &expected) {
            return false;
        }
        match self.read(run, lba, blocks) {
            Some(actual) => self.check(run, lba, &expected, &actual),
            None => false,
        }
    }

    /// Splits `region` into transfers of at most `chunk_blocks`.
    pub(crate) fn chunks(&self, region: Region) -> impl Iterator<Item = (u64, u64)> {
        let step = self.config.chunk_blocks.max(1) as u64;
        let end = region.end();
        (region.start..end).step_by(step as usize).map(move |lba| (lba, step.min(end - lba)))
    }

    /// Writes `region` chunk by chunk with a per-LBA address pattern.
    pub(crate) fn fill_region(&self, run: &mut Run, region: Region) -> bool {
        let bs = self.block_bytes() as u64;
        for (lba, n) in self.chunks(region) {
            let data = match self.pattern_buf(n, &Pattern::Address { base: lba * bs }) {
                Ok(b) => b,
                Err(e) => {
                    run.result.error(format!("buffer allocation failed: {}", e));
                    return false;
                }
            };
            if !self.write(run, lba, &data) {
                return false;
            }
        }
        true
    }

    /// Reads `region` back and checks it against the address pattern.
    pub(crate) fn verify_region(&self, run: &mut Run, region: Region) -> bool {
        let bs = self.block_bytes() as u64;
        let mut clean = true;
        for (lba, n) in self.chunks(region) {
            let Some(actual) = self.read(run, lba, n) else {
                clean = false;
                continue;
            };
            let expected = Pattern::Address { base: lba * bs }.generate(actual.len());
            clean &= self.check(run, lba, &expected, &actual);
        }
        clean
    }

    pub(crate) fn flush(&self, run: &mut Run) -> bool {
        let f = self.engine.sync_flush();
        if !f.success {
            run.result.error(format!("flush failed: {}", describe(&f)));
        }
        f.success
    }

    /// Re-runs identify after an interruption.
    pub(crate) fn reconnect(&self, run: &mut Run) -> bool {
        let outcome = self.device.lock().initialize();
        match outcome {
            Ok(info) => {
                if &info != self.info() {
                    run.result.note(format!("identify data changed across reconnect: {:?}", info));
                }
                true
            }
            Err(e) => {
                run.result.error(format!("device did not come back: {}", e));
                false
            }
        }
    }

    pub(crate) fn smart(&self, run: &mut Run) -> Option<SmartData> {
        let outcome = self.device.lock().get_smart_data();
        match outcome {
            Ok(s) => Some(s),
            Err(e) => {
                run.result.error(format!("SMART log unavailable: {}", e));
                None
            }
        }
    }
}

pub(crate) fn describe(r: &IoResult) -> String {
    match (&r.message, r.error) {
        (Some(m), _) => m.clone(),
        (None, Some(k)) => k.to_string(),
        (None, None) => "unknown error".to_string(),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::device::{share, BlockDevice, SimDevice};

    pub fn harness_on(dev: SimDevice, config: ReliabilityConfig) -> (ReliabilityTests, SharedDevice) {
        let mut dev = dev;
        dev.initialize().unwrap();
        let shared = share(dev);
        let mut t = ReliabilityTests::new(Arc::clone(&shared), Logger::null()).unwrap();
        t.set_config(config).unwrap();
        (t, shared)
    }

    pub fn small() -> ReliabilityConfig {
        ReliabilityConfig {
            region_blocks: 128,
            guard_blocks: 4,
            interruption_block: 64,
            chunk_blocks: 16,
            cycles: 20,
            stress_duration: Duration::from_millis(100),
            wear_passes: 4,
            ..ReliabilityConfig::default()
        }
    }

    pub fn harness() -> ReliabilityTests {
        harness_on(SimDevice::new(512, 256), small()).0
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::device::{FaultPlan, SimDevice};

    #[test]
    fn region_sits_between_guards() {
        let t = harness();
        let mut run = t.begin("r", "");
        assert_eq!(t.region(&mut run), Some(Region { start: 4, blocks: 128 }));
        let chunks: Vec<_> = t.chunks(Region { start: 4, blocks: 40 }).collect();
        assert_eq!(chunks, vec![(4, 16), (20, 16), (36, 8)]);
    }

    #[test]
    fn tiny_device_has_no_region() {
        let (t, _) = harness_on(SimDevice::new(512, 8), small());
        let mut run = t.begin("r", "");
        assert_eq!(t.region(&mut run), None);
        assert!(!t.conclude(run).passed);
    }

    #[test]
    fn run_all_covers_every_test() {
        let results = harness().run_all();
        assert_eq!(results.len(), 16);
        for r in &results {
            assert!(r.passed, "{} failed: {:?}", r.test_name, r.error_details);
        }
    }

    #[test]
    fn stop_ends_run_all_early() {
        let faults = FaultPlan { op_delay: Some(Duration::from_millis(1)), ..Default::default() };
        let (mut t, _) = harness_on(SimDevice::new(512, 256).with_faults(faults), small());
        let stop = t.stop_handle();
        t.set_progress_callback(Arc::new(move |f| {
            if f > 0.2 {
                stop.store(true, Ordering::SeqCst);
            }
        }));
        let results = t.run_all();
        assert!(results.len() < 16);
        assert!(!results.last().unwrap().passed);
    }
}
