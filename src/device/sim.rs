//! In-memory device with injectable faults.
//!
//! Media contents survive `disconnect()`/`initialize()` the way a real
//! drive's flash survives a power cycle, which is what the adverse-condition
//! tests rely on.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use super::{
    check_power_state, check_request, BlockDevice, DeviceInfo, HostTelemetry, SmartData,
    TelemetrySource, EMULATED_POWER_STATES,
};
use crate::error::{Result, StorageError};

/// Temperature reported while idle, in Kelvin (35 C).
const IDLE_TEMP_K: u16 = 308;
/// Temperature reported under injected thermal stress (85 C).
const STRESS_TEMP_K: u16 = 358;
/// Above this the temperature warning bit is raised (70 C).
const WARNING_TEMP_K: u16 = 343;
const WARN_TEMPERATURE: u8 = 0x02;
/// Range accepted by [`BlockDevice::simulate_temperature`], in Celsius.
const SIMULATED_TEMP_RANGE_C: std::ops::RangeInclusive<i32> = -40..=150;

#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Writes fail once this many have been acknowledged.
    pub fail_writes_after: Option<u64>,
    /// Any transfer touching one of these LBAs fails with a media error.
    pub bad_blocks: BTreeSet<u64>,
    /// Reads of these LBAs silently return a flipped bit.
    pub flip_on_read: BTreeSet<u64>,
    /// Added to every transfer.
    pub op_delay: Option<Duration>,
    pub fail_initialize: bool,
    /// Temperature injection is accepted but the sensor keeps reporting ambient.
    pub stuck_temperature: bool,
}

pub struct SimDevice {
    path: PathBuf,
    block_size: u32,
    blocks: u64,
    media: Vec<u8>,
    connected: bool,
    info: Option<DeviceInfo>,
    faults: FaultPlan,
    telemetry: HostTelemetry,
    power_state: u8,
    writes_acked: u64,
    ambient_temp: u16,
    /// Kelvin set through `simulate_temperature`.
    held_temp: Option<u16>,
    /// `(percentage_used, available_spare)` overriding the fresh-media values.
    wear: Option<(u8, u8)>,
}

impl SimDevice {
    pub fn new(block_size: u32, blocks: u64) -> Self {
        let len = block_size as usize * blocks as usize;
        Self {
            path: PathBuf::from(format!("sim://{}x{}", blocks, block_size)),
            block_size,
            blocks,
            media: vec![0u8; len],
            connected: false,
            info: None,
            faults: FaultPlan::default(),
            telemetry: HostTelemetry::default(),
            power_state: 0,
            writes_acked: 0,
            ambient_temp: IDLE_TEMP_K,
            held_temp: None,
            wear: None,
        }
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    pub fn faults_mut(&mut self) -> &mut FaultPlan {
        &mut self.faults
    }

    /// Raises the ambient temperature to 85 C, and with it the temperature
    /// warning bit, until cleared.
    pub fn set_thermal_stress(&mut self, on: bool) {
        self.ambient_temp = if on { STRESS_TEMP_K } else { IDLE_TEMP_K };
    }

    /// Reports a worn device: `percentage_used` of rated endurance consumed
    /// and `available_spare` percent of spare capacity left.
    pub fn set_wear(&mut self, percentage_used: u8, available_spare: u8) {
        self.wear = Some((percentage_used, available_spare));
    }

    pub fn writes_acked(&self) -> u64 {
        self.writes_acked
    }

    /// Direct view of the media, bypassing fault injection.
    pub fn media(&self) -> &[u8] {
        &self.media
    }

    /// Overwrites media behind the host's back.
    pub fn corrupt_byte(&mut self, offset: usize, xor: u8) {
        self.media[offset] ^= xor;
    }

    fn ready(&self) -> Result<&DeviceInfo> {
        if !self.connected {
            return Err(StorageError::Disconnected);
        }
        self.info.as_ref().ok_or(StorageError::NotInitialized)
    }

    fn touches_bad_block(&self, lba: u64, block_count: u32) -> Option<u64> {
        self.faults.bad_blocks.range(lba..lba + block_count as u64).next().copied()
    }

    fn span(&self, lba: u64, block_count: u32) -> std::ops::Range<usize> {
        let bs = self.block_size as usize;
        let start = lba as usize * bs;
        start..start + block_count as usize * bs
    }
}

impl BlockDevice for SimDevice {
    fn initialize(&mut self) -> Result<DeviceInfo> {
        if self.faults.fail_initialize {
            return Err(StorageError::Device(format!("{} does not respond to identify", self.path.display())));
        }
        let info = DeviceInfo {
            model: "SIMULATED BLOCK DEVICE".to_string(),
            serial: format!("SIM{:08X}", self.blocks),
            firmware_version: "SIM-1.0".to_string(),
            capacity_bytes: self.blocks * self.block_size as u64,
            block_size: self.block_size,
            max_lba: self.blocks,
            smart_enabled: true,
            trim_supported: true,
            power_states: EMULATED_POWER_STATES,
            telemetry: TelemetrySource::Host,
        };
        if !self.connected {
            self.telemetry.power_up();
        }
        self.connected = true;
        self.power_state = 0;
        self.info = Some(info.clone());
        Ok(info)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.telemetry.power_down();
        }
        self.connected = false;
    }

    fn info(&self) -> Result<&DeviceInfo> {
        self.info.as_ref().ok_or(StorageError::NotInitialized)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn read_blocks(&mut self, lba: u64, block_count: u32, buf: &mut [u8]) -> Result<()> {
        check_request(self.ready()?, lba, block_count, buf.len())?;
        let start = Instant::now();
        if let Some(d) = self.faults.op_delay {
            thread::sleep(d);
        }
        if let Some(bad) = self.touches_bad_block(lba, block_count) {
            self.telemetry.media_error();
            return Err(StorageError::Device(format!("unrecovered read error at LBA {}", bad)));
        }
        buf.copy_from_slice(&self.media[self.span(lba, block_count)]);
        let bs = self.block_size as usize;
        for flip in self.faults.flip_on_read.range(lba..lba + block_count as u64) {
            buf[(flip - lba) as usize * bs] ^= 0x01;
        }
        self.telemetry.read(buf.len() as u64, start.elapsed());
        Ok(())
    }

    fn write_blocks(&mut self, lba: u64, block_count: u32, buf: &[u8]) -> Result<()> {
        check_request(self.ready()?, lba, block_count, buf.len())?;
        let start = Instant::now();
        if let Some(d) = self.faults.op_delay {
            thread::sleep(d);
        }
        if self.faults.fail_writes_after.is_some_and(|n| self.writes_acked >= n) {
            return Err(StorageError::Device("write rejected: controller not ready".to_string()));
        }
        if let Some(bad) = self.touches_bad_block(lba, block_count) {
            self.telemetry.media_error();
            return Err(StorageError::Device(format!("write fault at LBA {}", bad)));
        }
        let span = self.span(lba, block_count);
        self.media[span].copy_from_slice(buf);
        self.writes_acked += 1;
        self.telemetry.write(buf.len() as u64, start.elapsed());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.ready()?;
        self.telemetry.flushed();
        Ok(())
    }

    fn perform_trim(&mut self, lba: u64, block_count: u32) -> Result<()> {
        let bytes = block_count as usize * self.block_size as usize;
        check_request(self.ready()?, lba, block_count, bytes)?;
        let span = self.span(lba, block_count);
        self.media[span].fill(0);
        Ok(())
    }

    fn get_smart_data(&mut self) -> Result<SmartData> {
        self.ready()?;
        let mut smart = self.telemetry.snapshot();
        smart.temperature = match self.held_temp {
            Some(k) if !self.faults.stuck_temperature => k,
            _ => self.ambient_temp,
        };
        if smart.temperature > WARNING_TEMP_K {
            smart.critical_warning |= WARN_TEMPERATURE;
        }
        if let Some((used, spare)) = self.wear {
            smart.percentage_used = used;
            smart.available_spare = spare;
            if spare < smart.available_spare_threshold {
                smart.critical_warning |= 0x01;
            }
        }
        Ok(smart)
    }

    fn set_power_state(&mut self, state: u8) -> Result<()> {
        check_power_state(self.ready()?, state)?;
        self.power_state = state;
        Ok(())
    }

    fn get_power_state(&self) -> Result<u8> {
        self.ready()?;
        Ok(self.power_state)
    }

    fn simulate_temperature(&mut self, celsius: Option<i32>) -> Result<()> {
        self.held_temp = match celsius {
            None => None,
            Some(c) if SIMULATED_TEMP_RANGE_C.contains(&c) => Some((c + 273) as u16),
            Some(c) => {
                return Err(StorageError::invalid(format!(
                    "simulated temperature {} C outside {}..={} C",
                    c,
                    SIMULATED_TEMP_RANGE_C.start(),
                    SIMULATED_TEMP_RANGE_C.end()
                )))
            }
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> SimDevice {
        let mut d = SimDevice::new(512, 64);
        d.initialize().unwrap();
        d
    }

    #[test]
    fn write_then_read_back() {
        let mut d = dev();
        let data: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        d.write_blocks(10, 2, &data).unwrap();
        let mut out = vec![0u8; 1024];
        d.read_blocks(10, 2, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn out_of_range_fails_without_touching_last_block() {
        let mut d = dev();
        let last = vec![0xAB; 512];
        d.write_blocks(63, 1, &last).unwrap();
        let e = d.write_blocks(64, 1, &[0u8; 512]).unwrap_err();
        assert_eq!(e.kind(), crate::error::ErrorKind::InvalidArgument);
        let mut out = vec![0u8; 512];
        d.read_blocks(63, 1, &mut out).unwrap();
        assert_eq!(out, last);
    }

    #[test]
    fn disconnected_device_rejects_io_but_keeps_media() {
        let mut d = dev();
        d.write_blocks(0, 1, &[7u8; 512]).unwrap();
        d.disconnect();
        assert!(d.read_blocks(0, 1, &mut [0u8; 512]).is_err());
        d.initialize().unwrap();
        let mut out = [0u8; 512];
        d.read_blocks(0, 1, &mut out).unwrap();
        assert_eq!(out, [7u8; 512]);
        let smart = d.get_smart_data().unwrap();
        assert_eq!(smart.power_cycles, 2);
        assert_eq!(smart.unsafe_shutdowns, 1);
    }

    #[test]
    fn injected_faults() {
        let mut plan = FaultPlan::default();
        plan.bad_blocks.insert(5);
        plan.flip_on_read.insert(6);
        plan.fail_writes_after = Some(2);
        let mut d = SimDevice::new(512, 16).with_faults(plan);
        d.initialize().unwrap();
        assert!(d.read_blocks(4, 2, &mut [0u8; 1024]).is_err());
        let mut out = [0u8; 512];
        d.read_blocks(6, 1, &mut out).unwrap();
        assert_eq!(out[0], 1);
        d.write_blocks(0, 1, &[0u8; 512]).unwrap();
        d.write_blocks(1, 1, &[0u8; 512]).unwrap();
        assert!(d.write_blocks(2, 1, &[0u8; 512]).is_err());
        assert_eq!(d.get_smart_data().unwrap().media_errors, 1);
    }

    #[test]
    fn trim_zeroes_and_power_states_are_bounded() {
        let mut d = dev();
        d.write_blocks(3, 1, &[9u8; 512]).unwrap();
        d.perform_trim(3, 1).unwrap();
        let mut out = [1u8; 512];
        d.read_blocks(3, 1, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
        d.set_power_state(4).unwrap();
        assert_eq!(d.get_power_state().unwrap(), 4);
        assert!(d.set_power_state(EMULATED_POWER_STATES).is_err());
    }

    #[test]
    fn temperature_follows_the_simulated_condition() {
        let mut d = dev();
        assert_eq!(d.get_smart_data().unwrap().temperature_celsius(), Some(35));
        d.simulate_temperature(Some(60)).unwrap();
        let s = d.get_smart_data().unwrap();
        assert_eq!(s.temperature_celsius(), Some(60));
        assert_eq!(s.critical_warning, 0);
        d.simulate_temperature(Some(90)).unwrap();
        let s = d.get_smart_data().unwrap();
        assert_eq!(s.temperature_celsius(), Some(90));
        assert_eq!(s.critical_warning & WARN_TEMPERATURE, WARN_TEMPERATURE);
        assert!(d.simulate_temperature(Some(400)).is_err());
        d.simulate_temperature(None).unwrap();
        assert_eq!(d.get_smart_data().unwrap().temperature_celsius(), Some(35));

        d.set_thermal_stress(true);
        d.simulate_temperature(Some(40)).unwrap();
        assert_eq!(d.get_smart_data().unwrap().temperature_celsius(), Some(40));
        d.simulate_temperature(None).unwrap();
        assert_eq!(d.get_smart_data().unwrap().temperature_celsius(), Some(85));
    }

    #[test]
    fn stuck_sensor_ignores_simulated_temperature() {
        let plan = FaultPlan { stuck_temperature: true, ..FaultPlan::default() };
        let mut d = SimDevice::new(512, 8).with_faults(plan);
        d.initialize().unwrap();
        d.simulate_temperature(Some(90)).unwrap();
        assert_eq!(d.get_smart_data().unwrap().temperature_celsius(), Some(35));
    }

    #[test]
    fn wear_shows_in_smart() {
        let mut d = dev();
        d.set_wear(120, 5);
        let s = d.get_smart_data().unwrap();
        assert_eq!((s.percentage_used, s.available_spare), (120, 5));
        assert_eq!(s.critical_warning & 0x01, 0x01);
    }

    #[test]
    fn initialize_failure_is_reported() {
        let plan = FaultPlan { fail_initialize: true, ..FaultPlan::default() };
        let mut d = SimDevice::new(512, 8).with_faults(plan);
        assert!(d.initialize().is_err());
        assert!(d.info().is_err());
    }
}
