//! Device backed by a raw block node (`/dev/nvme0n1`, `/dev/sdb`) or an image file.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[cfg(target_os = "linux")]
use std::os::unix::{fs::OpenOptionsExt, io::AsRawFd};

use super::identity;
#[cfg(target_os = "linux")]
use super::nvme::NvmeAdmin;
use super::{
    check_power_state, check_request, BlockDevice, DeviceInfo, HostTelemetry, SmartData,
    TelemetrySource, EMULATED_POWER_STATES,
};
use crate::error::{Result, StorageError};

#[derive(Debug, Clone, Default)]
pub struct FileDeviceOptions {
    /// Overrides the logical block size reported by the device.
    pub block_size: Option<u32>,
    /// `O_DIRECT` on Linux; callers must then use aligned buffers.
    pub direct_io: bool,
    /// Create (or extend) an image file to this many bytes.
    pub create_len: Option<u64>,
}

pub struct FileDevice {
    path: PathBuf,
    opts: FileDeviceOptions,
    file: Option<File>,
    #[cfg(target_os = "linux")]
    nvme: Option<NvmeAdmin>,
    info: Option<DeviceInfo>,
    telemetry: HostTelemetry,
    power_state: u8,
    block_node: bool,
}

impl FileDevice {
    pub fn new<P: AsRef<Path>>(path: P, opts: FileDeviceOptions) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            opts,
            file: None,
            #[cfg(target_os = "linux")]
            nvme: None,
            info: None,
            telemetry: HostTelemetry::default(),
            power_state: 0,
            block_node: false,
        }
    }

    fn open(&self) -> io::Result<File> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        if self.opts.create_len.is_some() {
            opts.create(true);
        }
        if self.opts.direct_io {
            #[cfg(target_os = "linux")]
            {
                opts.custom_flags(libc::O_DIRECT);
            }
        }
        opts.open(&self.path)
    }

    fn handle(&mut self) -> Result<&mut File> {
        if self.info.is_none() {
            return Err(StorageError::NotInitialized);
        }
        self.file.as_mut().ok_or(StorageError::Disconnected)
    }

    fn ready_info(&self) -> Result<&DeviceInfo> {
        if self.file.is_none() {
            return Err(StorageError::Disconnected);
        }
        self.info.as_ref().ok_or(StorageError::NotInitialized)
    }

    fn offset(&self, lba: u64) -> u64 {
        lba * self.info.as_ref().map(|i| i.block_size as u64).unwrap_or(0)
    }

    #[cfg(target_os = "linux")]
    fn discard(&self, file: &File, offset: u64, len: u64) -> io::Result<()> {
        const BLKDISCARD: u32 = 0x1277;
        let ret = if self.block_node {
            let range: [u64; 2] = [offset, len];
            unsafe { libc::ioctl(file.as_raw_fd(), BLKDISCARD as _, range.as_ptr()) }
        } else {
            unsafe {
                libc::fallocate(
                    file.as_raw_fd(),
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    offset as libc::off_t,
                    len as libc::off_t,
                )
            }
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn discard(&self, _file: &File, _offset: u64, _len: u64) -> io::Result<()> {
        Ok(())
    }
}

fn read_at(file: &mut File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::fs::FileExt;
            file.read_exact_at(buf, offset)
        } else {
            use std::io::Read;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(buf)
        }
    }
}

fn write_at(file: &mut File, buf: &[u8], offset: u64) -> io::Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::fs::FileExt;
            file.write_all_at(buf, offset)
        } else {
            use std::io::Write;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)
        }
    }
}

impl BlockDevice for FileDevice {
    fn initialize(&mut self) -> Result<DeviceInfo> {
        self.disconnect();
        let mut file = self
            .open()
            .map_err(|e| StorageError::Device(format!("cannot open {}: {}", self.path.display(), e)))?;
        let meta = file.metadata()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            self.block_node = meta.file_type().is_block_device();
        }
        if let Some(len) = self.opts.create_len {
            if meta.is_file() && meta.len() < len {
                file.set_len(len)?;
            }
        }
        let capacity = file.seek(SeekFrom::End(0))?;

        let mut model = None;
        let mut serial = None;
        let mut firmware = None;
        let mut ns_block_size = None;
        let mut power_states = EMULATED_POWER_STATES;
        let mut trim_supported = meta.is_file() && cfg!(target_os = "linux");
        let mut telemetry = TelemetrySource::Host;

        #[cfg(target_os = "linux")]
        {
            self.nvme = NvmeAdmin::probe(file.as_raw_fd());
            if let Some(admin) = self.nvme {
                if let Ok(ctrl) = admin.identify_controller() {
                    model = Some(ctrl.model);
                    serial = Some(ctrl.serial);
                    firmware = Some(ctrl.firmware);
                    power_states = ctrl.power_states;
                    trim_supported = ctrl.dataset_management;
                }
                if let Ok(ns) = admin.identify_namespace() {
                    ns_block_size = Some(ns.block_size).filter(|&b| b > 0);
                }
                if admin.smart_log().is_ok() {
                    telemetry = TelemetrySource::Device;
                }
            }
        }

        let id = if self.block_node { identity::lookup(&self.path) } else { identity::Identity::default() };
        if self.block_node && model.is_none() {
            trim_supported = id.discard_supported;
        }
        let block_size = self
            .opts
            .block_size
            .or(ns_block_size)
            .or(id.logical_block_size)
            .unwrap_or(crate::config::SECTOR as u32);
        if block_size == 0 {
            return Err(StorageError::invalid("block size is zero"));
        }
        let max_lba = capacity / block_size as u64;
        if max_lba == 0 {
            return Err(StorageError::Device(format!(
                "{} holds {} bytes, less than one {}-byte block",
                self.path.display(),
                capacity,
                block_size
            )));
        }

        let info = DeviceInfo {
            model: model.or(id.model).unwrap_or_else(|| {
                if self.block_node { "GENERIC BLOCK DEVICE".to_string() } else { "IMAGE FILE".to_string() }
            }),
            serial: serial.or(id.serial).unwrap_or_default(),
            firmware_version: firmware.or(id.firmware).unwrap_or_default(),
            capacity_bytes: max_lba * block_size as u64,
            block_size,
            max_lba,
            smart_enabled: true,
            trim_supported,
            power_states,
            telemetry,
        };
        self.file = Some(file);
        self.telemetry.power_up();
        self.power_state = 0;
        self.info = Some(info.clone());
        Ok(info)
    }

    fn is_connected(&self) -> bool {
        self.file.is_some()
    }

    fn disconnect(&mut self) {
        if self.file.take().is_some() {
            self.telemetry.power_down();
        }
        #[cfg(target_os = "linux")]
        {
            self.nvme = None;
        }
    }

    fn info(&self) -> Result<&DeviceInfo> {
        self.info.as_ref().ok_or(StorageError::NotInitialized)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn read_blocks(&mut self, lba: u64, block_count: u32, buf: &mut [u8]) -> Result<()> {
        check_request(self.ready_info()?, lba, block_count, buf.len())?;
        let offset = self.offset(lba);
        let start = Instant::now();
        let res = read_at(self.handle()?, buf, offset);
        match res {
            Ok(()) => {
                self.telemetry.read(buf.len() as u64, start.elapsed());
                Ok(())
            }
            Err(e) => {
                self.telemetry.media_error();
                Err(e.into())
            }
        }
    }

    fn write_blocks(&mut self, lba: u64, block_count: u32, buf: &[u8]) -> Result<()> {
        check_request(self.ready_info()?, lba, block_count, buf.len())?;
        let offset = self.offset(lba);
        let start = Instant::now();
        let res = write_at(self.handle()?, buf, offset);
        match res {
            Ok(()) => {
                self.telemetry.write(buf.len() as u64, start.elapsed());
                Ok(())
            }
            Err(e) => {
                self.telemetry.media_error();
                Err(e.into())
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.handle()?.sync_data()?;
        self.telemetry.flushed();
        Ok(())
    }

    fn perform_trim(&mut self, lba: u64, block_count: u32) -> Result<()> {
        let info = self.ready_info()?;
        let bytes = block_count as usize * info.block_bytes();
        check_request(info, lba, block_count, bytes)?;
        if !info.trim_supported {
            return Ok(());
        }
        let offset = self.offset(lba);
        let file = self.file.as_ref().ok_or(StorageError::Disconnected)?;
        match self.discard(file, offset, bytes as u64) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EOPNOTSUPP) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn get_smart_data(&mut self) -> Result<SmartData> {
        let info = self.ready_info()?;
        #[cfg(target_os = "linux")]
        {
            if let (TelemetrySource::Device, Some(admin)) = (info.telemetry, self.nvme) {
                return admin.smart_log().map_err(StorageError::from);
            }
        }
        let _ = info;
        Ok(self.telemetry.snapshot())
    }

    fn set_power_state(&mut self, state: u8) -> Result<()> {
        check_power_state(self.ready_info()?, state)?;
        #[cfg(target_os = "linux")]
        {
            if let Some(admin) = self.nvme {
                admin.set_power_state(state)?;
            }
        }
        self.power_state = state;
        Ok(())
    }

    fn get_power_state(&self) -> Result<u8> {
        self.ready_info()?;
        #[cfg(target_os = "linux")]
        {
            if let Some(admin) = self.nvme {
                return admin.power_state().map_err(StorageError::from);
            }
        }
        Ok(self.power_state)
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        self.disconnect();
    }
}
