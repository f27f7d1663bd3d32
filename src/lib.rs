//! Block storage validation: a device abstraction, an I/O engine with a
//! bounded asynchronous queue, and performance and reliability harnesses
//! built on top of it.
//!
//! ```no_run
//! use disk_validator::{share, Logger, PerformanceTests, SimDevice, BlockDevice, TestConfig};
//!
//! let mut dev = SimDevice::new(4096, 1 << 16);
//! dev.initialize()?;
//! let perf = PerformanceTests::new(share(dev), Logger::null())?;
//! let cfg = TestConfig { duration_seconds: 1, direct_io: false, ..TestConfig::default() };
//! let r = perf.test_sequential_write(&cfg);
//! println!("{}", r.to_json());
//! # Ok::<(), disk_validator::StorageError>(())
//! ```

pub mod buffer;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod latency;
pub mod log;
pub mod pattern;
pub mod perf;
pub mod reliability;
pub mod report;

pub use config::{parse_size_with_suffix, ConfigError, Setting, TestConfig};
pub use device::{
    share, BlockDevice, DeviceInfo, FaultPlan, FileDevice, FileDeviceOptions, SharedDevice, SimDevice,
    SmartData,
};
pub use engine::{Direction, IoCompletion, IoEngine, IoRequest, IoResult, IoStats, RequestId};
pub use error::{ErrorKind, Result, StorageError};
pub use log::{FileSink, Level, LogSink, Logger, MemorySink, TracingSink};
pub use pattern::{ErrorStatistics, Pattern};
pub use perf::{PerformanceTests, Preset, ProgressFn, Workload};
pub use reliability::{Interruption, ReliabilityConfig, ReliabilityTests};
pub use report::{Outcome, PerformanceResult, ReliabilityResult, TestKind, TestSummary};

#[cfg(test)]
mod tests;
