#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::tempdir;

    use crate::buffer::{allocate_aligned_buffer, DEFAULT_ALIGNMENT};
    use crate::pattern::verify;
    use crate::{
        share, BlockDevice, ErrorKind, FaultPlan, FileDevice, FileDeviceOptions, IoEngine, IoStats, Level,
        Logger, MemorySink, Outcome, Pattern, PerformanceTests, ReliabilityConfig, ReliabilityTests,
        Setting, SharedDevice, SimDevice, TestConfig, TestSummary,
    };

    fn sim(block_size: u32, blocks: u64) -> SharedDevice {
        let mut dev = SimDevice::new(block_size, blocks);
        dev.initialize().unwrap();
        share(dev)
    }

    #[test]
    fn test_patterns_round_trip_through_image_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("image.bin");
        let opts = FileDeviceOptions { block_size: Some(512), create_len: Some(1024 * 1024), ..Default::default() };
        let mut dev = FileDevice::new(&path, opts);
        let info = dev.initialize().unwrap();
        assert_eq!(info.max_lba, 2048);
        let engine = IoEngine::new(share(dev), Logger::null()).unwrap();

        for (i, p) in Pattern::all(99, 0).iter().enumerate() {
            let lba = i as u64 * 16;
            let mut data = allocate_aligned_buffer(8 * 512, DEFAULT_ALIGNMENT).unwrap();
            p.fill(&mut data);
            assert!(engine.sync_write(lba, 8, &data).success, "{}", p.name());
            let mut back = allocate_aligned_buffer(8 * 512, DEFAULT_ALIGNMENT).unwrap();
            assert!(engine.sync_read(lba, 8, &mut back).success);
            assert!(verify(p, &back, 512).is_clean(), "{}", p.name());
        }
        assert!(engine.sync_flush().success);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024 * 1024);
    }

    #[test]
    fn test_last_lba_is_usable_and_max_lba_is_not() {
        let engine = IoEngine::new(sim(512, 100), Logger::null()).unwrap();
        let data = vec![0x5Au8; 512];
        assert!(engine.sync_write(99, 1, &data).success);
        let r = engine.sync_write(100, 1, &data);
        assert!(!r.success);
        assert_eq!(r.error, Some(ErrorKind::InvalidArgument));
        let mut back = vec![0u8; 512];
        assert!(engine.sync_read(99, 1, &mut back).success);
        assert_eq!(back, data);
    }

    #[test]
    fn test_sequential_write_honours_data_size() {
        let perf = PerformanceTests::new(sim(4096, 4096), Logger::null()).unwrap();
        let cfg = TestConfig {
            block_size: 4096,
            queue_depth: 8,
            duration_seconds: 1,
            data_size: 1024 * 1024,
            direct_io: false,
            ..TestConfig::default()
        };
        let r = perf.test_sequential_write(&cfg);
        assert!(r.error.is_none());
        assert!(r.write_ops * 4096 <= 1024 * 1024);
        assert!(r.bytes_written <= 1024 * 1024);
        assert_eq!(r.read_ops, 0);
        assert!(r.avg_read_latency_us.is_nan());
    }

    #[test]
    fn test_reset_statistics_is_idempotent() {
        let engine = IoEngine::new(sim(512, 64), Logger::null()).unwrap();
        let mut buf = vec![0u8; 512];
        engine.sync_read(0, 1, &mut buf);
        engine.sync_read(64, 1, &mut buf);
        let s = engine.get_statistics();
        assert_eq!((s.total_operations, s.failed_operations), (2, 1));
        engine.reset_statistics();
        let once = engine.get_statistics();
        engine.reset_statistics();
        assert_eq!(once, engine.get_statistics());
        assert_eq!(once, IoStats::default());
    }

    #[test]
    fn test_power_loss_midway_through_region() {
        let dev = sim(512, 1100);
        let mut t = ReliabilityTests::new(Arc::clone(&dev), Logger::null()).unwrap();
        t.set_config(ReliabilityConfig {
            region_blocks: 1000,
            interruption_block: 500,
            guard_blocks: 16,
            ..ReliabilityConfig::default()
        })
        .unwrap();
        let r = t.test_power_loss_simulation();
        assert!(r.passed, "{:?}", r.error_details);
        assert!(r
            .error_details
            .iter()
            .any(|d| d == "interrupted at block 500 of 1000: 500 acknowledged, 500 unacknowledged"));
        assert_eq!(dev.lock().get_smart_data().unwrap().unsafe_shutdowns, 1);
    }

    #[test]
    fn test_failures_reach_the_injected_logger() {
        let mut dev = SimDevice::new(512, 256)
            .with_faults(FaultPlan { bad_blocks: [30u64].into_iter().collect(), ..Default::default() });
        dev.initialize().unwrap();
        let sink = Arc::new(MemorySink::new());
        let log = Logger::new(sink.clone()).with_min_level(Level::Warning);
        let mut t = ReliabilityTests::new(share(dev), log).unwrap();
        t.set_config(ReliabilityConfig { region_blocks: 64, guard_blocks: 4, chunk_blocks: 16, ..Default::default() })
            .unwrap();
        let r = t.test_data_integrity_simple();
        assert!(!r.passed);
        assert_eq!(sink.count(Level::Info), 0);
        let failed = sink.records().into_iter().find(|rec| rec.message == "reliability test failed").unwrap();
        assert_eq!(failed.level, Level::Error);
        assert_eq!(failed.field("test"), Some("data_integrity_simple"));

        let summary = TestSummary::from(&r);
        assert_eq!(summary.outcome, Outcome::Failed);
        assert_eq!(summary.to_json()["type"], "reliability");
    }

    #[test]
    fn test_settings_drive_a_mixed_run() {
        let settings = ["block_size=8K", "queue_depth=4", "duration=2", "data_size=512K", "direct_io=off"]
            .iter()
            .map(|s| Setting::parse_pair(s).unwrap());
        let cfg = TestConfig::from_settings(settings).unwrap();
        assert_eq!((cfg.block_size, cfg.queue_depth, cfg.data_size), (8192, 4, 512 * 1024));

        let mut dev = SimDevice::new(512, 8192)
            .with_faults(FaultPlan { op_delay: Some(Duration::from_micros(50)), ..Default::default() });
        dev.initialize().unwrap();
        let perf = PerformanceTests::new(share(dev), Logger::null()).unwrap();
        let r = perf.test_mixed_workload(&cfg, 50.0);
        assert!(r.error.is_none());
        assert_eq!(r.failed_ops, 0);
        assert!(r.bytes_read + r.bytes_written <= 512 * 1024);
        assert!(r.total_ops() > 0);
    }
}
