//! src/main.rs
#![allow(clippy::too_many_arguments)]

use std::io;
use std::panic;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::Local;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;

use disk_validator::{
    parse_size_with_suffix, share, FileDevice, FileDeviceOptions, FileSink, Logger,
    PerformanceResult, PerformanceTests, Preset, ProgressFn, ReliabilityConfig, ReliabilityResult,
    ReliabilityTests, Setting, SharedDevice, SimDevice, StorageError, TestConfig, TestSummary,
    TracingSink,
};

const LOG_FILE_NAME: &str = "disk_validator.log";
const DEFAULT_SIM_BLOCK: u64 = 4096;
const SCALING_QUEUE_DEPTHS: [usize; 6] = [1, 2, 4, 8, 16, 32];
const SCALING_BLOCK_SIZES: [usize; 5] = [4096, 16 * 1024, 64 * 1024, 256 * 1024, 1024 * 1024];

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Print results as JSON instead of text.
    #[clap(long, global = true)]
    json: bool,
    /// Route log records through `tracing` (filtered by RUST_LOG) instead of the log file.
    #[clap(long, global = true)]
    trace: bool,
    #[clap(long, global = true, default_value = LOG_FILE_NAME)]
    log_file: PathBuf,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct DeviceArgs {
    /// Block device node or image file.
    #[clap(long, conflicts_with = "simulate", required_unless_present = "simulate")]
    path: Option<PathBuf>,
    /// Use an in-memory device of this size instead of a real one.
    #[clap(long, value_parser = parse_size_with_suffix)]
    simulate: Option<u64>,
    /// Logical block size override (simulated devices default to 4K).
    #[clap(long, value_parser = parse_size_with_suffix)]
    device_block_size: Option<u64>,
    /// Create or extend the image file at `--path` to this size.
    #[clap(long, value_parser = parse_size_with_suffix)]
    create: Option<u64>,
    /// Open the device with O_DIRECT.
    #[clap(long)]
    direct_io: bool,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum PerfChoice {
    SeqRead,
    SeqWrite,
    RndRead,
    RndWrite,
    Mixed,
    ReadLatency,
    WriteLatency,
    ReadIops,
    WriteIops,
    QdScaling,
    BsScaling,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Identify data and SMART health.
    Info {
        #[clap(flatten)]
        device: DeviceArgs,
    },
    /// Throughput, latency and IOPS runs.
    Perf {
        #[clap(flatten)]
        device: DeviceArgs,
        #[clap(long, value_enum, default_value = "seq-read", conflicts_with = "preset")]
        workload: PerfChoice,
        /// `SEQ1M Q8T1`, `rnd4k-q1t1`... or `all`.
        #[clap(long)]
        preset: Option<String>,
        /// Configuration override, e.g. `--set block_size=64K --set queue_depth=8`.
        #[clap(long = "set", value_parser = Setting::parse_pair)]
        settings: Vec<Setting>,
        /// Samples taken by the latency runs.
        #[clap(long, default_value = "1000")]
        samples: usize,
    },
    /// Data integrity, adverse-condition, boundary, recovery and SMART tests.
    Reliability {
        #[clap(flatten)]
        device: DeviceArgs,
        /// Single test to run, e.g. `power_loss_simulation`; all tests when omitted.
        #[clap(long)]
        test: Option<String>,
        #[clap(flatten)]
        tuning: ReliabilityArgs,
    },
}

#[derive(clap::Args, Debug)]
struct ReliabilityArgs {
    #[clap(long)]
    region_blocks: Option<u64>,
    #[clap(long)]
    cycles: Option<usize>,
    #[clap(long)]
    seed: Option<u64>,
    /// Highest acceptable device temperature, in Celsius.
    #[clap(long, allow_hyphen_values = true)]
    max_temperature: Option<i32>,
    /// Temperature the thermal tests hold a simulated device at, in Celsius.
    #[clap(long, allow_hyphen_values = true, conflicts_with = "no_thermal")]
    thermal_target: Option<i32>,
    /// Run the thermal tests without a simulated temperature.
    #[clap(long)]
    no_thermal: bool,
}

fn current_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Log sink plus, when it is a file sink, a handle for attaching the progress bar.
fn setup_logging(cli: &Cli) -> (Logger, Option<Arc<FileSink>>) {
    if cli.trace {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).try_init();
        return (Logger::new(Arc::new(TracingSink)), None);
    }
    let sink = match FileSink::open(&cli.log_file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!(
                "[{}] Failed to open log file '{}': {}. Further logs will only go to stderr.",
                current_timestamp(),
                cli.log_file.display(),
                e
            );
            FileSink::stderr_only()
        }
    };
    let sink = Arc::new(sink);
    (Logger::new(sink.clone()), Some(sink))
}

fn setup_signal_handler(stop: Arc<AtomicBool>) {
    let installed = ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C; stopping after the current operation...");
        STOP_REQUESTED.store(true, Ordering::SeqCst);
        stop.store(true, Ordering::SeqCst);
    });
    if let Err(e) = installed {
        eprintln!("[{}] Could not install Ctrl+C handler: {}", current_timestamp(), e);
    }
}

fn progress_bar(sink: &Option<Arc<FileSink>>) -> (ProgressBar, ProgressFn) {
    let pb = ProgressBar::new(1000);
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{elapsed_precise}] [{bar:40}] {percent:>3}% {msg}") {
        pb.set_style(style.progress_chars("=> "));
    }
    if let Some(sink) = sink {
        sink.attach_progress(Some(pb.clone()));
    }
    let bar = pb.clone();
    let cb: ProgressFn = Arc::new(move |f: f64| bar.set_position((f.clamp(0.0, 1.0) * 1000.0) as u64));
    (pb, cb)
}

fn finish_bar(pb: &ProgressBar, sink: &Option<Arc<FileSink>>) {
    pb.finish_and_clear();
    if let Some(sink) = sink {
        sink.attach_progress(None);
    }
}

fn open_device(args: &DeviceArgs, log: &Logger) -> disk_validator::Result<SharedDevice> {
    let dev = match (&args.path, args.simulate) {
        (_, Some(size)) => {
            let bs = args.device_block_size.unwrap_or(DEFAULT_SIM_BLOCK);
            if bs == 0 || size < bs {
                return Err(StorageError::invalid(format!("cannot simulate {} bytes with {}-byte blocks", size, bs)));
            }
            share(SimDevice::new(bs as u32, size / bs))
        }
        (Some(path), None) => share(FileDevice::new(
            path,
            FileDeviceOptions {
                block_size: args.device_block_size.map(|b| b as u32),
                direct_io: args.direct_io,
                create_len: args.create,
            },
        )),
        (None, None) => return Err(StorageError::invalid("either --path or --simulate is required")),
    };
    let mut guard = dev.lock();
    let info = guard.initialize()?;
    log.info(
        "device ready",
        &[
            ("path", &guard.path().display()),
            ("model", &info.model),
            ("blocks", &info.max_lba),
            ("block_size", &info.block_size),
        ],
    );
    drop(guard);
    Ok(dev)
}

fn print_summaries(summaries: &[TestSummary], as_json: bool) -> io::Result<()> {
    if as_json {
        let v: Vec<_> = summaries.iter().map(TestSummary::to_json).collect();
        let text = serde_json::to_string_pretty(&v).map_err(io::Error::other)?;
        println!("{}", text);
        return Ok(());
    }
    for s in summaries {
        println!("{:<36} {:<8} {:>8.2}s", s.name, s.outcome.as_str().to_uppercase(), s.duration.as_secs_f64());
        for (k, v) in &s.metrics {
            if v.is_finite() {
                println!("    {:<28} {:.3}", k, v);
            }
        }
        for d in &s.details {
            println!("    - {}", d);
        }
    }
    Ok(())
}

fn cmd_info(device: &DeviceArgs, log: &Logger, as_json: bool) -> Result<bool, StorageError> {
    let dev = open_device(device, log)?;
    let mut guard = dev.lock();
    let info = guard.info()?.clone();
    let smart = guard.get_smart_data().ok();
    drop(guard);
    let smart_json = smart.as_ref().map(|s| {
        let counters: serde_json::Map<String, serde_json::Value> =
            s.counters().iter().map(|(k, v)| (k.to_string(), json!(v.to_string()))).collect();
        json!({
            "critical_warning": s.critical_warning,
            "temperature_celsius": s.temperature_celsius(),
            "available_spare": s.available_spare,
            "available_spare_threshold": s.available_spare_threshold,
            "percentage_used": s.percentage_used,
            "counters": counters,
        })
    });
    let v = json!({
        "model": info.model,
        "serial": info.serial,
        "firmware_version": info.firmware_version,
        "capacity_bytes": info.capacity_bytes,
        "block_size": info.block_size,
        "max_lba": info.max_lba,
        "smart_enabled": info.smart_enabled,
        "trim_supported": info.trim_supported,
        "power_states": info.power_states,
        "smart": smart_json,
    });
    if as_json {
        println!("{}", serde_json::to_string_pretty(&v).map_err(|e| StorageError::Io(io::Error::other(e)))?);
    } else {
        println!("Model:     {}", info.model);
        println!("Serial:    {}", info.serial);
        println!("Firmware:  {}", info.firmware_version);
        println!("Capacity:  {} bytes ({} x {}-byte blocks)", info.capacity_bytes, info.max_lba, info.block_size);
        println!("TRIM:      {}", info.trim_supported);
        match &smart {
            Some(s) => {
                println!("Warnings:  0x{:02X}", s.critical_warning);
                if let Some(c) = s.temperature_celsius() {
                    println!("Temp:      {} C", c);
                }
                println!("Spare:     {}% (threshold {}%)", s.available_spare, s.available_spare_threshold);
                println!("Used:      {}%", s.percentage_used);
                for (k, v) in s.counters() {
                    println!("  {:<22} {}", k, v);
                }
            }
            None => println!("SMART:     unavailable"),
        }
    }
    Ok(smart.map_or(true, |s| s.critical_warning == 0))
}

fn run_perf(
    perf: &PerformanceTests,
    cfg: &TestConfig,
    workload: PerfChoice,
    preset: Option<&str>,
    samples: usize,
) -> Result<Vec<PerformanceResult>, StorageError> {
    if let Some(label) = preset {
        let presets: Vec<Preset> = if label.eq_ignore_ascii_case("all") {
            Preset::ALL.to_vec()
        } else {
            vec![Preset::from_label(label).ok_or_else(|| StorageError::invalid(format!("unknown preset '{}'", label)))?]
        };
        let mut out = Vec::new();
        for p in presets {
            if STOP_REQUESTED.load(Ordering::SeqCst) {
                break;
            }
            out.extend(perf.run_preset(p));
        }
        return Ok(out);
    }
    Ok(match workload {
        PerfChoice::SeqRead => vec![perf.test_sequential_read(cfg)],
        PerfChoice::SeqWrite => vec![perf.test_sequential_write(cfg)],
        PerfChoice::RndRead => vec![perf.test_random_read(cfg)],
        PerfChoice::RndWrite => vec![perf.test_random_write(cfg)],
        PerfChoice::Mixed => vec![perf.test_mixed_workload(cfg, cfg.read_percentage)],
        PerfChoice::ReadLatency => vec![perf.test_read_latency(cfg.block_size, samples)],
        PerfChoice::WriteLatency => vec![perf.test_write_latency(cfg.block_size, samples)],
        PerfChoice::ReadIops => vec![perf.test_4k_random_read_iops(cfg.duration_seconds)],
        PerfChoice::WriteIops => vec![perf.test_4k_random_write_iops(cfg.duration_seconds)],
        PerfChoice::QdScaling => perf.test_queue_depth_scaling(&SCALING_QUEUE_DEPTHS),
        PerfChoice::BsScaling => perf.test_block_size_scaling(&SCALING_BLOCK_SIZES),
    })
}

fn cmd_perf(
    device: &DeviceArgs,
    workload: PerfChoice,
    preset: Option<&str>,
    settings: Vec<Setting>,
    samples: usize,
    log: &Logger,
    sink: &Option<Arc<FileSink>>,
    as_json: bool,
) -> Result<bool, StorageError> {
    let mut cfg = TestConfig { direct_io: device.direct_io, ..TestConfig::default() };
    for s in settings {
        cfg.apply(s).map_err(|e| StorageError::invalid(e.to_string()))?;
    }
    let dev = open_device(device, log)?;
    let mut perf = PerformanceTests::new(dev, log.clone())?;
    perf.set_config(cfg.clone()).map_err(|e| StorageError::invalid(e.to_string()))?;
    setup_signal_handler(perf.stop_handle());
    let (pb, cb) = progress_bar(sink);
    perf.set_progress_callback(cb);
    let results = run_perf(&perf, &cfg, workload, preset, samples);
    finish_bar(&pb, sink);
    let results = results?;

    let mut summaries: Vec<TestSummary> = results.iter().map(TestSummary::from).collect();
    if cfg.verify_data {
        summaries.push(TestSummary::from(&perf.verification_result()));
    }
    print_summaries(&summaries, as_json)?;
    Ok(summaries.iter().all(TestSummary::passed))
}

fn run_reliability(t: &ReliabilityTests, test: Option<&str>) -> Result<Vec<ReliabilityResult>, StorageError> {
    let Some(name) = test else {
        return Ok(t.run_all());
    };
    let r = match name {
        "data_integrity_simple" => t.test_data_integrity_simple(),
        "data_integrity_complex_patterns" => t.test_data_integrity_complex_patterns(),
        "data_persistence" => t.test_data_persistence(),
        "write_read_verify_cycles" => t.test_write_read_verify_cycles(t.config().cycles),
        "power_loss_simulation" => t.test_power_loss_simulation(),
        "unexpected_disconnection" => t.test_unexpected_disconnection(),
        "thermal_stress" => t.test_thermal_stress(),
        "boundary_conditions" => t.test_boundary_conditions(),
        "maximum_lba_access" => t.test_maximum_lba_access(),
        "concurrent_access" => t.test_concurrent_access(),
        "error_recovery" => t.test_error_recovery(),
        "bad_block_handling" => t.test_bad_block_handling(),
        "wear_leveling_verification" => t.test_wear_leveling_verification(),
        "smart_attributes" => t.test_smart_attributes(),
        "smart_thresholds" => t.test_smart_thresholds(),
        "smart_error_log" => t.test_smart_error_log(),
        other => return Err(StorageError::invalid(format!("unknown reliability test '{}'", other))),
    };
    Ok(vec![r])
}

fn cmd_reliability(
    device: &DeviceArgs,
    test: Option<&str>,
    tuning: &ReliabilityArgs,
    log: &Logger,
    sink: &Option<Arc<FileSink>>,
    as_json: bool,
) -> Result<bool, StorageError> {
    let defaults = ReliabilityConfig::default();
    let thermal_target_c = match (tuning.no_thermal, tuning.thermal_target) {
        (true, _) => None,
        (false, Some(c)) => Some(c),
        (false, None) => defaults.thermal_target_c,
    };
    let config = ReliabilityConfig {
        region_blocks: tuning.region_blocks.unwrap_or(defaults.region_blocks),
        cycles: tuning.cycles.unwrap_or(defaults.cycles),
        seed: tuning.seed.unwrap_or(defaults.seed),
        max_temperature_c: tuning.max_temperature.unwrap_or(defaults.max_temperature_c),
        thermal_target_c,
        direct_io: device.direct_io,
        ..defaults
    };
    let dev = open_device(device, log)?;
    let mut t = ReliabilityTests::new(dev, log.clone())?;
    t.set_config(config)?;
    setup_signal_handler(t.stop_handle());
    let (pb, cb) = progress_bar(sink);
    t.set_progress_callback(cb);
    let results = run_reliability(&t, test);
    finish_bar(&pb, sink);
    let summaries: Vec<TestSummary> = results?.iter().map(TestSummary::from).collect();
    print_summaries(&summaries, as_json)?;
    Ok(summaries.iter().all(TestSummary::passed))
}

fn main_logic(cli: Cli, log: &Logger, sink: &Option<Arc<FileSink>>) -> Result<bool, StorageError> {
    log.info("starting disk validator", &[("command", &format!("{:?}", cli.command))]);
    log.info(
        "host",
        &[("os", &std::env::consts::OS), ("arch", &std::env::consts::ARCH)],
    );
    match cli.command {
        Commands::Info { device } => cmd_info(&device, log, cli.json),
        Commands::Perf { device, workload, preset, settings, samples } => {
            cmd_perf(&device, workload, preset.as_deref(), settings, samples, log, sink, cli.json)
        }
        Commands::Reliability { device, test, tuning } => cmd_reliability(
            &device,
            test.as_deref(),
            &tuning,
            log,
            sink,
            cli.json,
        ),
    }
}

fn main() {
    let cli = Cli::parse();
    let (log, sink) = setup_logging(&cli);
    let main_result = panic::catch_unwind(panic::AssertUnwindSafe(|| main_logic(cli, &log, &sink)));
    let exit_code = match main_result {
        Ok(Ok(true)) => {
            log.info("all tests passed", &[]);
            0
        }
        Ok(Ok(false)) => {
            log.error("one or more tests failed", &[]);
            1
        }
        Ok(Err(e)) => {
            log.critical("run aborted", &[("kind", &e.kind()), ("error", &e)]);
            eprintln!("error: {}", e);
            1
        }
        Err(panic_payload) => {
            let msg = if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = panic_payload.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "(type not recognized as string)".to_string()
            };
            log.critical("test panicked", &[("panic", &msg)]);
            eprintln!("[{}] A critical error occurred: Test panicked!\nPanic message: {}", current_timestamp(), msg);
            101
        }
    };
    std::process::exit(exit_code);
}
