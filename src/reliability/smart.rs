//! SMART health checks. Counters come from the device when it reports them
//! and from host-side accounting otherwise.

use super::{ReliabilityTests, Run, WARN_TEMPERATURE};
use crate::device::SmartData;
use crate::pattern::Pattern;
use crate::report::ReliabilityResult;

/// NVMe critical warning bits.
const CRITICAL_WARNINGS: [(u8, &str); 6] = [
    (0x01, "available spare below threshold"),
    (0x02, "temperature outside operating range"),
    (0x04, "reliability degraded by media errors"),
    (0x08, "media placed in read-only mode"),
    (0x10, "volatile memory backup failed"),
    (0x20, "persistent memory region read-only"),
];

/// A health limit a snapshot can cross.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Limit {
    Warning(u8),
    Temperature,
    Spare,
    Endurance,
}

impl Limit {
    fn is_thermal(self) -> bool {
        matches!(self, Limit::Temperature | Limit::Warning(WARN_TEMPERATURE))
    }
}

impl ReliabilityTests {
    /// Cumulative counters must never go backwards across a write-verify
    /// workload, and the host command counters must move.
    pub fn test_smart_attributes(&self) -> ReliabilityResult {
        let mut run = self.begin("smart_attributes", "SMART counters advance monotonically under load");
        let Some((before, after)) = self.around_workload(&mut run) else {
            return self.conclude(run);
        };
        for ((name, b), (_, a)) in before.counters().into_iter().zip(after.counters()) {
            if a < b {
                run.result.error(format!("{} went backwards: {} -> {}", name, b, a));
            }
        }
        if after.host_read_commands <= before.host_read_commands {
            run.result.error("host read commands did not increase".to_string());
        }
        if after.host_write_commands <= before.host_write_commands {
            run.result.error("host write commands did not increase".to_string());
        }
        run.result.note(format!(
            "reads {} -> {}, writes {} -> {}",
            before.host_read_commands, after.host_read_commands, before.host_write_commands, after.host_write_commands
        ));
        self.conclude(run)
    }

    /// Takes a snapshot, holds the device at `config.thermal_target_c`
    /// through one write-verify pass, then takes another. Limits crossed
    /// before the stress fail. Limits newly crossed afterwards fail unless
    /// they are thermal and the target was above `max_temperature_c`, in
    /// which case the temperature limit must have been crossed.
    pub fn test_smart_thresholds(&self) -> ReliabilityResult {
        let mut run = self.begin("smart_thresholds", "health limits crossed only under the applied stress");
        let Some((before, after, applied)) = self.under_stress(&mut run, self.config.thermal_target_c) else {
            return self.conclude(run);
        };
        let baseline = self.crossings(&before);
        for (_, what) in &baseline {
            run.result.error(format!("{} before stress", what));
        }
        let stress = match applied {
            Some(c) => format!("under a simulated {} C condition", c),
            None => "after the workload".to_string(),
        };
        let expect_hot = applied.is_some_and(|c| c > self.config.max_temperature_c);
        let crossed = self.crossings(&after);
        for (limit, what) in &crossed {
            if baseline.iter().any(|(l, _)| l == limit) {
                continue;
            }
            if expect_hot && limit.is_thermal() {
                run.result.note(format!("{} {}", what, stress));
            } else {
                run.result.error(format!("{} {}", what, stress));
            }
        }
        if expect_hot && !crossed.iter().any(|(l, _)| *l == Limit::Temperature) {
            run.result.error(format!(
                "temperature stayed within {} C {}",
                self.config.max_temperature_c, stress
            ));
        }
        match (before.temperature_celsius(), after.temperature_celsius()) {
            (Some(b), Some(a)) => run.result.note(format!("temperature {} C -> {} C", b, a)),
            _ => run.result.note("device does not report temperature".to_string()),
        }
        run.progress.update(1.0);
        self.conclude(run)
    }

    /// A clean workload must not add media errors or error log entries.
    pub fn test_smart_error_log(&self) -> ReliabilityResult {
        let mut run = self.begin("smart_error_log", "no new media errors during a clean workload");
        let Some((before, after)) = self.around_workload(&mut run) else {
            return self.conclude(run);
        };
        if after.media_errors != before.media_errors {
            run.result.error(format!("media errors {} -> {}", before.media_errors, after.media_errors));
        }
        if after.error_log_entries != before.error_log_entries {
            run.result.error(format!(
                "error log entries {} -> {}",
                before.error_log_entries, after.error_log_entries
            ));
        }
        run.result.note(format!(
            "media errors {}, error log entries {}",
            after.media_errors, after.error_log_entries
        ));
        self.conclude(run)
    }

    fn smart_supported(&self, run: &mut Run) -> bool {
        if !self.info().smart_enabled {
            run.result.note("SMART not supported by this device; skipped".to_string());
            run.progress.update(1.0);
            return false;
        }
        true
    }

    /// Every configured or device-reported limit `s` is past.
    fn crossings(&self, s: &SmartData) -> Vec<(Limit, String)> {
        let mut out = Vec::new();
        for (bit, what) in CRITICAL_WARNINGS {
            if s.critical_warning & bit != 0 {
                out.push((Limit::Warning(bit), format!("critical warning: {}", what)));
            }
        }
        let max_c = self.config.max_temperature_c;
        if let Some(c) = s.temperature_celsius().filter(|&c| c > max_c) {
            out.push((Limit::Temperature, format!("temperature {} C above {} C", c, max_c)));
        }
        let spare_floor = self.config.min_available_spare.max(s.available_spare_threshold);
        if s.available_spare < spare_floor {
            out.push((Limit::Spare, format!("available spare {}% below {}%", s.available_spare, spare_floor)));
        }
        if s.percentage_used > self.config.max_percentage_used {
            out.push((
                Limit::Endurance,
                format!("percentage used {}% above {}%", s.percentage_used, self.config.max_percentage_used),
            ));
        }
        out
    }

    /// SMART snapshots taken before and after one write-verify pass over the
    /// region. `None` when there is nothing to compare.
    fn around_workload(&self, run: &mut Run) -> Option<(SmartData, SmartData)> {
        self.under_stress(run, None).map(|(before, after, _)| (before, after))
    }

    /// Like [`Self::around_workload`], with the device held at `target`
    /// degrees during the pass. The third value is the temperature that
    /// actually took effect.
    fn under_stress(&self, run: &mut Run, target: Option<i32>) -> Option<(SmartData, SmartData, Option<i32>)> {
        if !self.smart_supported(run) {
            return None;
        }
        let region = self.region(run)?;
        let before = self.smart(run)?;
        let applied = target.filter(|&c| self.apply_thermal(run, c));
        let mut stopped = false;
        for (lba, n) in self.chunks(region) {
            if self.should_stop(run) {
                stopped = true;
                break;
            }
            self.write_verify(run, lba, n, &Pattern::Random { seed: self.config.seed ^ lba });
            run.progress.update(0.9 * (lba + n - region.start) as f64 / region.blocks as f64);
        }
        self.flush(run);
        let after = if stopped { None } else { self.smart(run) };
        if applied.is_some() {
            self.release_thermal(run);
        }
        Some((before, after?, applied))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::ReliabilityConfig;
    use crate::device::{FaultPlan, SimDevice};

    #[test]
    fn counters_advance_on_a_clean_device() {
        let t = harness();
        for r in [t.test_smart_attributes(), t.test_smart_thresholds(), t.test_smart_error_log()] {
            assert!(r.passed, "{}: {:?}", r.test_name, r.error_details);
        }
    }

    #[test]
    fn expected_thermal_crossing_passes() {
        let (t, dev) = harness_on(SimDevice::new(512, 256), small());
        let r = t.test_smart_thresholds();
        assert!(r.passed, "{:?}", r.error_details);
        assert!(r
            .error_details
            .iter()
            .any(|d| d == "temperature 85 C above 70 C under a simulated 85 C condition"));
        assert!(r.error_details.iter().any(|d| d == "temperature 35 C -> 85 C"));
        assert_eq!(dev.lock().get_smart_data().unwrap().temperature_celsius(), Some(35));
    }

    #[test]
    fn crossing_without_stress_fails_thresholds() {
        let mut dev = SimDevice::new(512, 256);
        dev.set_thermal_stress(true);
        let (t, _) = harness_on(dev, ReliabilityConfig { thermal_target_c: None, ..small() });
        let r = t.test_smart_thresholds();
        assert!(!r.passed);
        assert_eq!(r.errors_detected, 2);
        assert!(r
            .error_details
            .iter()
            .any(|d| d == "critical warning: temperature outside operating range before stress"));
        assert!(r.error_details.iter().any(|d| d == "temperature 85 C above 70 C before stress"));
    }

    #[test]
    fn stress_expectation_follows_the_limit() {
        let cfg = ReliabilityConfig { thermal_target_c: Some(60), max_temperature_c: 55, ..small() };
        let (t, _) = harness_on(SimDevice::new(512, 256), cfg.clone());
        assert!(t.test_smart_thresholds().passed);

        let (t, _) = harness_on(SimDevice::new(512, 256), ReliabilityConfig { max_temperature_c: 65, ..cfg.clone() });
        let r = t.test_smart_thresholds();
        assert!(r.passed, "{:?}", r.error_details);
        assert!(r.error_details.iter().any(|d| d == "temperature 35 C -> 60 C"));

        // 75 C stays under the configured limit but trips the device's own warning.
        let cfg = ReliabilityConfig { thermal_target_c: Some(75), max_temperature_c: 80, ..cfg };
        let (t, _) = harness_on(SimDevice::new(512, 256), cfg);
        let r = t.test_smart_thresholds();
        assert!(!r.passed);
        assert_eq!(r.errors_detected, 1);
        assert!(r
            .error_details
            .iter()
            .any(|d| d == "critical warning: temperature outside operating range under a simulated 75 C condition"));
    }

    #[test]
    fn stress_that_does_not_cross_fails_thresholds() {
        let faults = FaultPlan { stuck_temperature: true, ..Default::default() };
        let (t, _) = harness_on(SimDevice::new(512, 256).with_faults(faults), small());
        let r = t.test_smart_thresholds();
        assert!(!r.passed);
        assert_eq!(r.errors_detected, 1);
        assert!(r
            .error_details
            .iter()
            .any(|d| d == "temperature stayed within 70 C under a simulated 85 C condition"));
    }

    #[test]
    fn worn_device_fails_thresholds() {
        let mut dev = SimDevice::new(512, 256);
        dev.set_wear(101, 5);
        let cfg = ReliabilityConfig { min_available_spare: 20, ..small() };
        let (t, _) = harness_on(dev, cfg);
        let r = t.test_smart_thresholds();
        assert!(!r.passed);
        assert!(r.error_details.iter().any(|d| d == "available spare 5% below 20% before stress"));
        assert!(r.error_details.iter().any(|d| d == "percentage used 101% above 100% before stress"));
        assert!(r
            .error_details
            .iter()
            .any(|d| d == "critical warning: available spare below threshold before stress"));
    }

    #[test]
    fn media_errors_show_in_error_log() {
        let faults = FaultPlan { bad_blocks: [70u64].into_iter().collect(), ..Default::default() };
        let (t, _) = harness_on(SimDevice::new(512, 256).with_faults(faults), small());
        let r = t.test_smart_error_log();
        assert!(!r.passed);
        assert!(r.error_details.iter().any(|d| d == "media errors 0 -> 1"));
    }
}
