//! Injected interruptions: the device handle is dropped part-way through a
//! sequential write of the region and the test checks what survived.

use std::time::Instant;

use super::{Region, ReliabilityTests, Run, WARN_TEMPERATURE};
use crate::error::Result;
use crate::pattern::Pattern;
use crate::report::ReliabilityResult;

/// Kelvin rise that is worth noting under sustained load.
const NOTABLE_TEMP_RISE_K: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// Handle dropped with writes still unflushed.
    PowerLoss,
    /// Cache flushed, then the handle is dropped.
    Disconnect,
}

impl Interruption {
    pub fn as_str(self) -> &'static str {
        match self {
            Interruption::PowerLoss => "power_loss",
            Interruption::Disconnect => "disconnect",
        }
    }
}

impl ReliabilityTests {
    pub fn test_power_loss_simulation(&self) -> ReliabilityResult {
        let mut run = self.begin(
            "power_loss_simulation",
            "drop the device without flushing mid-write, then verify acknowledged data",
        );
        self.interrupted_write(&mut run, Interruption::PowerLoss);
        self.conclude(run)
    }

    pub fn test_unexpected_disconnection(&self) -> ReliabilityResult {
        let mut run = self.begin(
            "unexpected_disconnection",
            "flush and disconnect mid-write, then verify acknowledged data",
        );
        self.interrupted_write(&mut run, Interruption::Disconnect);
        self.conclude(run)
    }

    /// Holds the device at `celsius` until [`ReliabilityTests::clear_thermal_condition`].
    /// Fails on devices that cannot simulate their temperature.
    pub fn simulate_thermal_condition(&self, celsius: i32) -> Result<()> {
        self.log.info("simulating thermal condition", &[("celsius", &celsius)]);
        self.device.lock().simulate_temperature(Some(celsius))
    }

    pub fn clear_thermal_condition(&self) -> Result<()> {
        self.device.lock().simulate_temperature(None)
    }

    /// `true` when the condition took effect; a refusal is noted, not failed.
    pub(crate) fn apply_thermal(&self, run: &mut Run, celsius: i32) -> bool {
        match self.simulate_thermal_condition(celsius) {
            Ok(()) => true,
            Err(e) => {
                run.result.note(format!("thermal condition of {} C not applied: {}", celsius, e));
                false
            }
        }
    }

    pub(crate) fn release_thermal(&self, run: &mut Run) {
        if let Err(e) = self.clear_thermal_condition() {
            run.result.error(format!("thermal condition not cleared: {}", e));
        }
    }

    /// Sustained write-verify load at `config.thermal_target_c`, then a
    /// power-loss interruption. The temperature delta is recorded; a raised
    /// temperature warning is noted.
    pub fn test_thermal_stress(&self) -> ReliabilityResult {
        let mut run = self.begin(
            "thermal_stress",
            "sustained load followed by a power-loss interruption",
        );
        let Some(region) = self.region(&mut run) else {
            return self.conclude(run);
        };
        let before = self.smart(&mut run);
        let applied = self.config.thermal_target_c.filter(|&c| self.apply_thermal(&mut run, c));
        let bs = self.block_bytes() as u64;
        let started = Instant::now();
        let budget = self.config.stress_duration;
        let mut passes = 0u64;
        'load: loop {
            for (lba, n) in self.chunks(region) {
                if self.should_stop(&mut run) {
                    break 'load;
                }
                let p = Pattern::Random { seed: self.config.seed ^ passes ^ (lba * bs) };
                self.write_verify(&mut run, lba, n, &p);
            }
            passes += 1;
            let done = started.elapsed().as_secs_f64() / budget.as_secs_f64().max(f64::EPSILON);
            run.progress.update(0.5 * done);
            if started.elapsed() >= budget {
                break;
            }
        }
        run.result.note(format!("{} load passes in {:.2}s", passes, started.elapsed().as_secs_f64()));

        let after = self.smart(&mut run);
        if applied.is_some() {
            self.release_thermal(&mut run);
        }
        if let (Some(b), Some(a)) = (before, after) {
            match (b.temperature_celsius(), a.temperature_celsius()) {
                (Some(tb), Some(ta)) => {
                    run.result.note(format!("temperature {} C -> {} C (delta {})", tb, ta, ta - tb));
                    if ta - tb >= NOTABLE_TEMP_RISE_K {
                        self.log.warn("temperature rose under load", &[("before_c", &tb), ("after_c", &ta)]);
                    }
                    if let Some(c) = applied.filter(|&c| c != ta) {
                        run.result.note(format!("device reported {} C under a simulated {} C condition", ta, c));
                    }
                }
                _ => run.result.note("device does not report temperature".to_string()),
            }
            if a.critical_warning & WARN_TEMPERATURE != 0 {
                run.result.note("temperature warning raised under load".to_string());
            }
        }
        if !run.stopped {
            self.interrupted_write(&mut run, Interruption::PowerLoss);
        }
        self.conclude(run)
    }

    /// Stale-fills the region and writes the guards, then rewrites the region
    /// one block at a time and interrupts the device at
    /// `config.interruption_block`. After reconnecting, acknowledged blocks
    /// must hold the new data, unacknowledged blocks are reported, and the
    /// guards must be untouched.
    pub(crate) fn interrupted_write(&self, run: &mut Run, kind: Interruption) {
        let Some(region) = self.region(run) else { return };
        let guard = self.config.guard_blocks;
        let guards = [
            Region { start: region.start - guard, blocks: guard },
            Region { start: region.end(), blocks: guard },
        ];
        let guard_pattern = Pattern::Random { seed: self.config.seed ^ 0x6A09_E667 };
        let mut guard_data = Vec::new();
        for g in guards.iter().filter(|g| g.blocks > 0) {
            let Ok(data) = self.pattern_buf(g.blocks, &guard_pattern) else {
                run.result.error("buffer allocation failed".to_string());
                return;
            };
            if !self.write(run, g.start, &data) {
                return;
            }
            guard_data.push((*g, data));
        }
        let stale = Pattern::Checkerboard;
        for (lba, n) in self.chunks(region) {
            let Ok(data) = self.pattern_buf(n, &stale) else {
                run.result.error("buffer allocation failed".to_string());
                return;
            };
            if !self.write(run, lba, &data) {
                return;
            }
        }
        if !self.flush(run) {
            return;
        }

        let bs = self.block_bytes() as u64;
        let cut = self.config.interruption_block.min(region.blocks);
        let mut acked = vec![false; region.blocks as usize];
        for i in 0..cut {
            if self.should_stop(run) {
                return;
            }
            let lba = region.start + i;
            let Ok(data) = self.pattern_buf(1, &Pattern::Address { base: lba * bs }) else {
                run.result.error("buffer allocation failed".to_string());
                return;
            };
            acked[i as usize] = self.write(run, lba, &data);
            run.progress.update(0.5 + 0.4 * (i + 1) as f64 / region.blocks as f64);
        }

        match kind {
            Interruption::PowerLoss => {}
            Interruption::Disconnect => {
                self.flush(run);
            }
        }
        self.log.warn(
            "injecting interruption",
            &[("kind", &kind.as_str()), ("lba", &(region.start + cut))],
        );
        self.device.lock().disconnect();
        if !self.reconnect(run) {
            return;
        }

        // Unacknowledged blocks may hold either the stale fill or the new
        // data; anything else is corruption.
        let stale_block = stale.generate(bs as usize);
        let mut lost = Vec::new();
        for (lba, n) in self.chunks(region) {
            let Some(actual) = self.read(run, lba, n) else { continue };
            for (j, block) in actual.chunks(bs as usize).enumerate() {
                let b = lba + j as u64;
                let expected = Pattern::Address { base: b * bs }.generate(block.len());
                if acked[(b - region.start) as usize] {
                    self.check(run, b, &expected, block);
                } else if block == stale_block.as_slice() {
                    lost.push(b);
                } else if expected != block {
                    self.check(run, b, &stale_block, block);
                }
            }
        }
        for (g, data) in &guard_data {
            if let Some(actual) = self.read(run, g.start, g.blocks) {
                if !self.check(run, g.start, data, &actual) {
                    run.result.note(format!("guard region at LBA {} was modified", g.start));
                }
            }
        }

        let acked_count = acked.iter().filter(|a| **a).count();
        run.result.note(format!(
            "interrupted at block {} of {}: {} acknowledged, {} unacknowledged",
            cut,
            region.blocks,
            acked_count,
            region.blocks as usize - acked_count
        ));
        if let (Some(first), Some(last)) = (lost.first(), lost.last()) {
            run.result.note(format!(
                "{} unacknowledged blocks not written (LBA {}..={})",
                lost.len(),
                first,
                last
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::ReliabilityConfig;
    use crate::device::SimDevice;

    #[test]
    fn interruption_midway_keeps_acknowledged_blocks() {
        let cfg = ReliabilityConfig { region_blocks: 1000, interruption_block: 500, guard_blocks: 8, ..small() };
        let (t, dev) = harness_on(SimDevice::new(512, 1024), cfg);
        let r = t.test_power_loss_simulation();
        assert!(r.passed, "{:?}", r.error_details);
        assert!(r
            .error_details
            .iter()
            .any(|d| d == "interrupted at block 500 of 1000: 500 acknowledged, 500 unacknowledged"));
        assert!(r.error_details.iter().any(|d| d.contains("LBA 508..=1007")));
        let smart = dev.lock().get_smart_data().unwrap();
        assert_eq!(smart.unsafe_shutdowns, 1);
    }

    #[test]
    fn disconnect_flushes_first() {
        let (t, dev) = harness_on(SimDevice::new(512, 256), small());
        let r = t.test_unexpected_disconnection();
        assert!(r.passed, "{:?}", r.error_details);
        assert_eq!(dev.lock().get_smart_data().unwrap().unsafe_shutdowns, 0);
    }

    #[test]
    fn corrupted_acknowledged_block_fails() {
        let cfg = ReliabilityConfig { interruption_block: 128, ..small() };
        let faults = crate::device::FaultPlan { flip_on_read: [20u64].into_iter().collect(), ..Default::default() };
        let (t, _) = harness_on(SimDevice::new(512, 256).with_faults(faults), cfg);
        let r = t.test_power_loss_simulation();
        assert!(!r.passed);
        assert_eq!(r.data_corruptions, 1);
    }

    #[test]
    fn corrupted_unacknowledged_block_fails() {
        let faults = crate::device::FaultPlan { flip_on_read: [100u64].into_iter().collect(), ..Default::default() };
        let (t, _) = harness_on(SimDevice::new(512, 256).with_faults(faults), small());
        let r = t.test_power_loss_simulation();
        assert!(!r.passed);
        assert_eq!(r.data_corruptions, 1);
        assert!(r.error_details.iter().any(|d| d.contains("starting near LBA 100")));
        assert!(r.error_details.iter().any(|d| d.starts_with("63 unacknowledged blocks not written")));
    }

    #[test]
    fn thermal_stress_records_temperature() {
        let mut dev = SimDevice::new(512, 256);
        dev.set_thermal_stress(true);
        let (t, _) = harness_on(dev, small());
        let r = t.test_thermal_stress();
        assert!(r.passed, "{:?}", r.error_details);
        assert!(r.error_details.iter().any(|d| d.starts_with("temperature 85 C -> 85 C")));
        assert!(r.error_details.iter().any(|d| d == "temperature warning raised under load"));
    }

    #[test]
    fn thermal_stress_drives_the_target_temperature() {
        let cfg = ReliabilityConfig { thermal_target_c: Some(95), ..small() };
        let (t, dev) = harness_on(SimDevice::new(512, 256), cfg);
        let r = t.test_thermal_stress();
        assert!(r.passed, "{:?}", r.error_details);
        assert!(r.error_details.iter().any(|d| d == "temperature 35 C -> 95 C (delta 60)"));
        assert!(r.error_details.iter().any(|d| d == "temperature warning raised under load"));
        let smart = dev.lock().get_smart_data().unwrap();
        assert_eq!(smart.temperature_celsius(), Some(35));
        assert_eq!(smart.critical_warning, 0);

        t.simulate_thermal_condition(50).unwrap();
        assert_eq!(dev.lock().get_smart_data().unwrap().temperature_celsius(), Some(50));
        t.clear_thermal_condition().unwrap();
        assert!(t.simulate_thermal_condition(500).is_err());
    }

    #[test]
    fn stuck_sensor_is_noted_under_thermal_stress() {
        let faults = crate::device::FaultPlan { stuck_temperature: true, ..Default::default() };
        let (t, _) = harness_on(SimDevice::new(512, 256).with_faults(faults), small());
        let r = t.test_thermal_stress();
        assert!(r.passed, "{:?}", r.error_details);
        assert!(r
            .error_details
            .iter()
            .any(|d| d == "device reported 35 C under a simulated 85 C condition"));
    }
}
