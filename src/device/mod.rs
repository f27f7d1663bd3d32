//! Block device abstraction.
//!
//! A [`BlockDevice`] owns exactly one handle to one device. Implementations
//! are not internally synchronized; the I/O engine shares them through a
//! [`SharedDevice`] and serializes access on their behalf.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, StorageError};

mod file;
mod identity;
#[cfg(target_os = "linux")]
mod nvme;
mod sim;

pub use file::{FileDevice, FileDeviceOptions};
pub use sim::{FaultPlan, SimDevice};

/// Bytes per NVMe "data unit" (1000 512-byte units).
pub const DATA_UNIT_BYTES: u64 = 512_000;
/// Highest power state accepted by devices that track power state in-process.
pub const EMULATED_POWER_STATES: u8 = 5;

/// Where SMART telemetry comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetrySource {
    /// Reported by the device firmware (NVMe log page 0x02).
    Device,
    /// Counted host-side by the device wrapper.
    Host,
}

/// Identify data, captured once at initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: String,
    pub serial: String,
    pub firmware_version: String,
    pub capacity_bytes: u64,
    pub block_size: u32,
    /// Number of addressable blocks; valid LBAs are `0..max_lba`.
    pub max_lba: u64,
    pub smart_enabled: bool,
    pub trim_supported: bool,
    pub power_states: u8,
    pub telemetry: TelemetrySource,
}

impl DeviceInfo {
    pub fn block_bytes(&self) -> usize {
        self.block_size as usize
    }
}

/// SMART / health snapshot. Counters are cumulative over the device lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmartData {
    pub critical_warning: u8,
    /// Composite temperature in Kelvin; `0` when unknown.
    pub temperature: u16,
    pub available_spare: u8,
    pub available_spare_threshold: u8,
    pub percentage_used: u8,
    pub data_units_read: u128,
    pub data_units_written: u128,
    pub host_read_commands: u128,
    pub host_write_commands: u128,
    pub controller_busy_time: u128,
    pub power_cycles: u128,
    pub power_on_hours: u128,
    pub unsafe_shutdowns: u128,
    pub media_errors: u128,
    pub error_log_entries: u128,
}

impl SmartData {
    /// `(name, value)` for every cumulative counter.
    pub fn counters(&self) -> [(&'static str, u128); 10] {
        [
            ("data_units_read", self.data_units_read),
            ("data_units_written", self.data_units_written),
            ("host_read_commands", self.host_read_commands),
            ("host_write_commands", self.host_write_commands),
            ("controller_busy_time", self.controller_busy_time),
            ("power_cycles", self.power_cycles),
            ("power_on_hours", self.power_on_hours),
            ("unsafe_shutdowns", self.unsafe_shutdowns),
            ("media_errors", self.media_errors),
            ("error_log_entries", self.error_log_entries),
        ]
    }

    pub fn temperature_celsius(&self) -> Option<i32> {
        (self.temperature > 0).then(|| self.temperature as i32 - 273)
    }
}

pub trait BlockDevice: Send {
    /// Opens the device and issues identify. Failure here is fatal for callers.
    fn initialize(&mut self) -> Result<DeviceInfo>;

    fn is_connected(&self) -> bool;

    /// Drops the handle without flushing. Used to model power loss.
    fn disconnect(&mut self);

    /// Identify data from the last successful [`BlockDevice::initialize`].
    fn info(&self) -> Result<&DeviceInfo>;

    fn path(&self) -> &Path;

    fn read_blocks(&mut self, lba: u64, block_count: u32, buf: &mut [u8]) -> Result<()>;

    fn write_blocks(&mut self, lba: u64, block_count: u32, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Deallocates a range. A no-op when `trim_supported` is false.
    fn perform_trim(&mut self, lba: u64, block_count: u32) -> Result<()>;

    fn get_smart_data(&mut self) -> Result<SmartData>;

    fn set_power_state(&mut self, state: u8) -> Result<()>;

    fn get_power_state(&self) -> Result<u8>;

    /// Holds the reported composite temperature at `celsius` until called
    /// again with `None`. Only devices that model their own sensor can do this.
    fn simulate_temperature(&mut self, celsius: Option<i32>) -> Result<()> {
        let _ = celsius;
        Err(StorageError::Device(format!("{} cannot simulate temperature", self.path().display())))
    }
}

pub type SharedDevice = Arc<Mutex<dyn BlockDevice>>;

/// Wraps a device for sharing between an engine and the harnesses.
pub fn share<D: BlockDevice + 'static>(device: D) -> SharedDevice {
    Arc::new(Mutex::new(device))
}

/// Range and size checks done before a request reaches the device.
pub fn check_request(info: &DeviceInfo, lba: u64, block_count: u32, buf_len: usize) -> Result<()> {
    if block_count == 0 {
        return Err(StorageError::invalid("block count is zero"));
    }
    let end = lba
        .checked_add(block_count as u64)
        .ok_or_else(|| StorageError::invalid("LBA range overflows"))?;
    if end > info.max_lba {
        return Err(StorageError::invalid(format!(
            "LBA range {}..{} exceeds device end {}",
            lba, end, info.max_lba
        )));
    }
    let expected = block_count as usize * info.block_bytes();
    if buf_len != expected {
        return Err(StorageError::invalid(format!(
            "buffer is {} bytes, {} blocks need {}",
            buf_len, block_count, expected
        )));
    }
    Ok(())
}

pub fn check_power_state(info: &DeviceInfo, state: u8) -> Result<()> {
    if state >= info.power_states {
        return Err(StorageError::invalid(format!(
            "power state {} outside 0..{}",
            state, info.power_states
        )));
    }
    Ok(())
}

/// Number of data units touched by `bytes`, rounded up.
pub(crate) fn data_units(bytes: u64) -> u128 {
    bytes.div_ceil(DATA_UNIT_BYTES) as u128
}

/// SMART-style counters kept by the host when the device cannot report its own.
#[derive(Debug, Default)]
pub(crate) struct HostTelemetry {
    bytes_read: u64,
    bytes_written: u64,
    read_commands: u128,
    write_commands: u128,
    busy: Duration,
    power_cycles: u128,
    unsafe_shutdowns: u128,
    media_errors: u128,
    powered_on: Duration,
    up_since: Option<Instant>,
    unflushed: bool,
}

impl HostTelemetry {
    pub(crate) fn power_up(&mut self) {
        self.power_cycles += 1;
        self.up_since = Some(Instant::now());
    }

    /// Closing with unflushed writes counts as an unsafe shutdown.
    pub(crate) fn power_down(&mut self) {
        if let Some(t) = self.up_since.take() {
            self.powered_on += t.elapsed();
        }
        if self.unflushed {
            self.unsafe_shutdowns += 1;
            self.unflushed = false;
        }
    }

    pub(crate) fn read(&mut self, bytes: u64, took: Duration) {
        self.bytes_read += bytes;
        self.read_commands += 1;
        self.busy += took;
    }

    pub(crate) fn write(&mut self, bytes: u64, took: Duration) {
        self.bytes_written += bytes;
        self.write_commands += 1;
        self.busy += took;
        self.unflushed = true;
    }

    pub(crate) fn flushed(&mut self) {
        self.unflushed = false;
    }

    pub(crate) fn media_error(&mut self) {
        self.media_errors += 1;
    }

    pub(crate) fn snapshot(&self) -> SmartData {
        let on = self.powered_on + self.up_since.map(|t| t.elapsed()).unwrap_or_default();
        SmartData {
            critical_warning: 0,
            temperature: 0,
            available_spare: 100,
            available_spare_threshold: 10,
            percentage_used: 0,
            data_units_read: data_units(self.bytes_read),
            data_units_written: data_units(self.bytes_written),
            host_read_commands: self.read_commands,
            host_write_commands: self.write_commands,
            controller_busy_time: (self.busy.as_secs() / 60) as u128,
            power_cycles: self.power_cycles,
            power_on_hours: (on.as_secs() / 3600) as u128,
            unsafe_shutdowns: self.unsafe_shutdowns,
            media_errors: self.media_errors,
            error_log_entries: self.media_errors,
        }
    }
}
