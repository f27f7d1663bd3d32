use super::ReliabilityTests;
use crate::pattern::Pattern;
use crate::report::ReliabilityResult;

impl ReliabilityTests {
    /// Seeded random data across the region, one write-read-compare per chunk.
    pub fn test_data_integrity_simple(&self) -> ReliabilityResult {
        let mut run = self.begin("data_integrity_simple", "write, read back and compare seeded random data");
        let Some(region) = self.region(&mut run) else {
            return self.conclude(run);
        };
        let total = region.blocks as f64;
        for (lba, n) in self.chunks(region) {
            if self.should_stop(&mut run) {
                break;
            }
            self.write_verify(&mut run, lba, n, &Pattern::Random { seed: self.config.seed ^ lba });
            run.progress.update((lba + n - region.start) as f64 / total);
        }
        self.conclude(run)
    }

    /// Every pattern generator over the whole region, flushing between passes.
    pub fn test_data_integrity_complex_patterns(&self) -> ReliabilityResult {
        let mut run = self.begin(
            "data_integrity_complex_patterns",
            "walking ones/zeros, checkerboard, random and address patterns over the region",
        );
        let Some(region) = self.region(&mut run) else {
            return self.conclude(run);
        };
        let bs = self.block_bytes() as u64;
        let patterns = Pattern::all(self.config.seed, 0);
        'passes: for (i, p) in patterns.iter().enumerate() {
            let before = run.ledger.byte_errors;
            for (lba, n) in self.chunks(region) {
                if self.should_stop(&mut run) {
                    break 'passes;
                }
                let p = match p {
                    Pattern::Address { .. } => Pattern::Address { base: lba * bs },
                    other => *other,
                };
                self.write_verify(&mut run, lba, n, &p);
            }
            self.flush(&mut run);
            let bad = run.ledger.byte_errors - before;
            if bad > 0 {
                run.result.note(format!("{} pass: {} corrupted bytes", p.name(), bad));
            }
            run.progress.update((i + 1) as f64 / patterns.len() as f64);
        }
        self.conclude(run)
    }

    /// Data written and flushed must survive a disconnect and re-identify.
    pub fn test_data_persistence(&self) -> ReliabilityResult {
        let mut run = self.begin("data_persistence", "flushed data survives a disconnect/reconnect cycle");
        let Some(region) = self.region(&mut run) else {
            return self.conclude(run);
        };
        if self.fill_region(&mut run, region) && self.flush(&mut run) {
            run.progress.update(0.5);
            self.device.lock().disconnect();
            if self.reconnect(&mut run) {
                self.verify_region(&mut run, region);
            }
        }
        self.conclude(run)
    }

    /// `cycle_count` write-read-verify cycles rotating through the patterns
    /// and walking the region one chunk per cycle.
    pub fn test_write_read_verify_cycles(&self, cycle_count: usize) -> ReliabilityResult {
        let mut run = self.begin(
            "write_read_verify_cycles",
            "repeated write-read-verify cycles with rotating patterns",
        );
        let Some(region) = self.region(&mut run) else {
            return self.conclude(run);
        };
        let bs = self.block_bytes() as u64;
        let chunks: Vec<(u64, u64)> = self.chunks(region).collect();
        let mut clean_cycles = 0usize;
        for cycle in 0..cycle_count {
            if self.should_stop(&mut run) {
                break;
            }
            let (lba, n) = chunks[cycle % chunks.len()];
            let p = match Pattern::all(self.config.seed.wrapping_add(cycle as u64), lba * bs)[cycle % 5] {
                Pattern::Address { .. } => Pattern::Address { base: lba * bs },
                other => other,
            };
            if self.write_verify(&mut run, lba, n, &p) {
                clean_cycles += 1;
            }
            run.progress.update((cycle + 1) as f64 / cycle_count as f64);
        }
        run.result.note(format!("{} of {} cycles clean", clean_cycles, cycle_count));
        self.conclude(run)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use crate::device::{FaultPlan, SimDevice};

    #[test]
    fn clean_device_passes_integrity() {
        let t = harness();
        for r in [t.test_data_integrity_simple(), t.test_data_integrity_complex_patterns(), t.test_data_persistence()] {
            assert!(r.passed, "{}: {:?}", r.test_name, r.error_details);
            assert_eq!(r.error_rate, 0.0);
        }
    }

    #[test]
    fn flipped_bit_is_a_corruption() {
        let faults = FaultPlan { flip_on_read: [10u64].into_iter().collect(), ..Default::default() };
        let (t, _) = harness_on(SimDevice::new(512, 256).with_faults(faults), small());
        let r = t.test_data_integrity_simple();
        assert!(!r.passed);
        assert_eq!(r.data_corruptions, 1);
        assert_eq!(r.errors_detected, 0);
        assert!(r.error_rate > 0.0);
    }

    #[test]
    fn cycles_report_clean_count() {
        let t = harness();
        let r = t.test_write_read_verify_cycles(12);
        assert!(r.passed);
        assert!(r.error_details.iter().any(|d| d == "12 of 12 cycles clean"));
    }

    #[test]
    fn failed_writes_are_errors() {
        let faults = FaultPlan { fail_writes_after: Some(3), ..Default::default() };
        let (t, _) = harness_on(SimDevice::new(512, 256).with_faults(faults), small());
        let r = t.test_write_read_verify_cycles(6);
        assert!(!r.passed);
        assert_eq!(r.errors_detected, 3);
    }
}
