use super::{describe, Region, ReliabilityTests, Run};
use crate::buffer::allocate_aligned_buffer;
use crate::buffer::DEFAULT_ALIGNMENT;
use crate::error::ErrorKind;
use crate::pattern::{ErrorStatistics, Pattern};
use crate::perf::Progress;
use crate::report::ReliabilityResult;

impl ReliabilityTests {
    /// Invalid requests are refused without wedging the device; read
    /// failures are retried and only persistent ones count as errors.
    pub fn test_error_recovery(&self) -> ReliabilityResult {
        let mut run = self.begin(
            "error_recovery",
            "invalid requests are refused and the device keeps serving valid ones",
        );
        let Some(region) = self.region(&mut run) else {
            return self.conclude(run);
        };
        let bs = self.block_bytes();
        let max = self.info().max_lba;

        let mut buf = vec![0u8; bs];
        let probes = [
            ("read past the end", self.engine.sync_read(max, 1, &mut buf)),
            ("read with mismatched buffer", self.engine.sync_read(region.start, 2, &mut buf)),
            ("zero-length read", self.engine.sync_read(region.start, 0, &mut buf[..0])),
        ];
        for (what, r) in probes {
            if r.error != Some(ErrorKind::InvalidArgument) {
                run.result.error(format!("{}: expected invalid_argument, got {:?}", what, r.error));
            }
        }
        run.progress.update(0.2);

        if !self.write_verify(&mut run, region.start, 1, &Pattern::WalkingOnes) {
            run.result.note("device did not recover after invalid requests".to_string());
        }
        run.progress.update(0.4);

        let (mut retried, mut recovered) = (0usize, 0usize);
        for (lba, n) in self.chunks(region) {
            if self.should_stop(&mut run) {
                break;
            }
            match self.read_with_retry(lba, n) {
                Ok(0) => {}
                Ok(attempts) => {
                    retried += 1;
                    recovered += 1;
                    run.result.note(format!("LBA {} read recovered after {} retries", lba, attempts));
                }
                Err(msg) => {
                    retried += 1;
                    run.result.error(format!("LBA {} unreadable after {} retries: {}", lba, self.config.retries, msg));
                }
            }
            run.progress.update(0.4 + 0.6 * (lba + n - region.start) as f64 / region.blocks as f64);
        }
        run.result.note(format!("{} chunks needed retries, {} recovered", retried, recovered));
        self.conclude(run)
    }

    /// Retries a read up to `config.retries` extra times; returns the number
    /// of retries that were needed.
    fn read_with_retry(&self, lba: u64, blocks: u64) -> std::result::Result<u32, String> {
        let mut buf = allocate_aligned_buffer(blocks as usize * self.block_bytes(), DEFAULT_ALIGNMENT)
            .map_err(|e| e.to_string())?;
        let mut last = String::new();
        for attempt in 0..=self.config.retries {
            let r = self.engine.sync_read(lba, blocks as u32, &mut buf);
            if r.success {
                return Ok(attempt);
            }
            last = describe(&r);
        }
        Err(last)
    }

    /// Scans the region, isolates unreadable blocks and tries to revive each
    /// one by rewriting it. Blocks that stay unreadable fail the test.
    pub fn test_bad_block_handling(&self) -> ReliabilityResult {
        let mut run = self.begin("bad_block_handling", "scan for unreadable blocks and attempt rewrite");
        let Some(region) = self.region(&mut run) else {
            return self.conclude(run);
        };
        let bad = self.scan_bad_blocks(&mut run, region);
        let bs = self.block_bytes() as u64;
        for (i, &lba) in bad.iter().enumerate() {
            if self.should_stop(&mut run) {
                break;
            }
            let mut probe = self.begin_nested(&run);
            if self.write_verify(&mut probe, lba, 1, &Pattern::Address { base: lba * bs }) {
                run.result.note(format!("LBA {} recovered after rewrite", lba));
            } else {
                run.result.error(format!("LBA {} unrecoverable", lba));
            }
            run.ledger.merge(&probe.ledger, 0);
            run.progress.update(0.5 + 0.5 * (i + 1) as f64 / bad.len() as f64);
        }
        run.result.note(format!("scanned {} blocks, {} bad", region.blocks, bad.len()));
        self.conclude(run)
    }

    /// Scratch run for operations whose failures are judged by the caller.
    fn begin_nested(&self, parent: &Run) -> Run {
        Run {
            result: ReliabilityResult::new(&parent.result.test_name, ""),
            ledger: ErrorStatistics::default(),
            progress: Progress::new(None),
            start: parent.start,
            stopped: false,
        }
    }

    fn scan_bad_blocks(&self, run: &mut Run, region: Region) -> Vec<u64> {
        let mut bad = Vec::new();
        let mut buf = match allocate_aligned_buffer(self.block_bytes(), DEFAULT_ALIGNMENT) {
            Ok(b) => b,
            Err(e) => {
                run.result.error(format!("buffer allocation failed: {}", e));
                return bad;
            }
        };
        for (lba, n) in self.chunks(region) {
            if self.should_stop(run) {
                break;
            }
            if self.read_with_retry(lba, n).is_err() {
                for b in lba..lba + n {
                    if !self.engine.sync_read(b, 1, &mut buf).success {
                        self.log.warn("unreadable block", &[("lba", &b)]);
                        bad.push(b);
                    }
                }
            }
            run.progress.update(0.5 * (lba + n - region.start) as f64 / region.blocks as f64);
        }
        bad
    }

    /// Hammers a small hot set with rewrites while the rest of the region
    /// stays cold; cold data must be untouched and wear counters must not
    /// go backwards.
    pub fn test_wear_leveling_verification(&self) -> ReliabilityResult {
        let mut run = self.begin(
            "wear_leveling_verification",
            "repeated rewrites of a hot set leave cold data intact",
        );
        let Some(region) = self.region(&mut run) else {
            return self.conclude(run);
        };
        let hot = self.config.hot_blocks.clamp(1, region.blocks);
        let cold = Region { start: region.start + hot, blocks: region.blocks - hot };
        let before = self.smart(&mut run);
        if cold.blocks > 0 && !self.fill_region(&mut run, cold) {
            return self.conclude(run);
        }
        let passes = self.config.wear_passes;
        for pass in 0..passes {
            if self.should_stop(&mut run) {
                break;
            }
            let p = Pattern::all(self.config.seed.wrapping_add(pass as u64), 0)[pass % 4];
            self.write_verify(&mut run, region.start, hot, &p);
            run.progress.update(0.8 * (pass + 1) as f64 / passes.max(1) as f64);
        }
        self.flush(&mut run);
        if cold.blocks > 0 && !self.verify_region(&mut run, cold) {
            run.result.note("cold data changed while the hot set was rewritten".to_string());
        }
        let after = self.smart(&mut run);
        if let (Some(b), Some(a)) = (before, after) {
            if a.percentage_used < b.percentage_used {
                run.result.error(format!("percentage used fell from {} to {}", b.percentage_used, a.percentage_used));
            }
            if a.data_units_written < b.data_units_written {
                run.result.error("data units written went backwards".to_string());
            }
            run.result.note(format!(
                "percentage used {} -> {}, data units written {} -> {}",
                b.percentage_used, a.percentage_used, b.data_units_written, a.data_units_written
            ));
        }
        self.conclude(run)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use crate::device::{FaultPlan, SimDevice};

    #[test]
    fn invalid_requests_do_not_break_the_device() {
        let r = harness().test_error_recovery();
        assert!(r.passed, "{:?}", r.error_details);
        assert!(r.error_details.iter().any(|d| d == "0 chunks needed retries, 0 recovered"));
    }

    #[test]
    fn persistent_read_errors_fail_recovery() {
        let faults = FaultPlan { bad_blocks: [40u64].into_iter().collect(), ..Default::default() };
        let (t, _) = harness_on(SimDevice::new(512, 256).with_faults(faults), small());
        let r = t.test_error_recovery();
        assert!(!r.passed);
        assert_eq!(r.errors_detected, 1);
    }

    #[test]
    fn bad_blocks_are_isolated_and_reported() {
        let faults = FaultPlan { bad_blocks: [40u64, 41].into_iter().collect(), ..Default::default() };
        let (t, _) = harness_on(SimDevice::new(512, 256).with_faults(faults), small());
        let r = t.test_bad_block_handling();
        assert!(!r.passed);
        assert_eq!(r.errors_detected, 2);
        assert!(r.error_details.iter().any(|d| d == "LBA 40 unrecoverable"));
        assert!(r.error_details.iter().any(|d| d == "scanned 128 blocks, 2 bad"));
    }

    #[test]
    fn clean_scan_and_wear() {
        let t = harness();
        assert!(t.test_bad_block_handling().passed);
        let r = t.test_wear_leveling_verification();
        assert!(r.passed, "{:?}", r.error_details);
    }
}
