//! NVMe admin pass-through (Linux `NVME_IOCTL_ADMIN_CMD`).

use std::io;
use std::os::unix::io::RawFd;

use super::SmartData;

const NVME_IOCTL_ID: u32 = 0x4E40;
const NVME_IOCTL_ADMIN_CMD: u32 = 0xC048_4E41;

const OPC_GET_LOG_PAGE: u8 = 0x02;
const OPC_IDENTIFY: u8 = 0x06;
const OPC_SET_FEATURES: u8 = 0x09;
const OPC_GET_FEATURES: u8 = 0x0A;

const CNS_NAMESPACE: u32 = 0x00;
const CNS_CONTROLLER: u32 = 0x01;
const LID_SMART: u32 = 0x02;
const FID_POWER_MANAGEMENT: u32 = 0x02;
const NSID_ALL: u32 = 0xFFFF_FFFF;

const IDENTIFY_LEN: usize = 4096;
const SMART_LOG_LEN: usize = 512;
const ADMIN_TIMEOUT_MS: u32 = 5_000;

#[repr(C)]
#[derive(Debug, Default)]
struct AdminCmd {
    opcode: u8,
    flags: u8,
    rsvd1: u16,
    nsid: u32,
    cdw2: u32,
    cdw3: u32,
    metadata: u64,
    addr: u64,
    metadata_len: u32,
    data_len: u32,
    cdw10: u32,
    cdw11: u32,
    cdw12: u32,
    cdw13: u32,
    cdw14: u32,
    cdw15: u32,
    timeout_ms: u32,
    result: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerIdentity {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    /// NPSS + 1.
    pub power_states: u8,
    pub dataset_management: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceIdentity {
    pub blocks: u64,
    pub block_size: u32,
}

/// Admin command channel over an open NVMe controller or namespace node.
#[derive(Debug, Clone, Copy)]
pub struct NvmeAdmin {
    fd: RawFd,
    nsid: u32,
}

fn submit(fd: RawFd, cmd: &mut AdminCmd) -> io::Result<u32> {
    let ret = unsafe { libc::ioctl(fd, NVME_IOCTL_ADMIN_CMD as _, cmd as *mut AdminCmd) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if ret > 0 {
        return Err(io::Error::other(format!("NVMe status {:#06x}", ret)));
    }
    Ok(cmd.result)
}

impl NvmeAdmin {
    /// Succeeds only if `fd` is an NVMe namespace that answers `NVME_IOCTL_ID`.
    pub fn probe(fd: RawFd) -> Option<Self> {
        let nsid = unsafe { libc::ioctl(fd, NVME_IOCTL_ID as _) };
        (nsid > 0).then_some(Self { fd, nsid: nsid as u32 })
    }

    fn read_admin(&self, opcode: u8, nsid: u32, cdw10: u32, len: usize) -> io::Result<Vec<u8>> {
        let mut data = vec![0u8; len];
        let mut cmd = AdminCmd {
            opcode,
            nsid,
            addr: data.as_mut_ptr() as u64,
            data_len: len as u32,
            cdw10,
            timeout_ms: ADMIN_TIMEOUT_MS,
            ..AdminCmd::default()
        };
        submit(self.fd, &mut cmd)?;
        Ok(data)
    }

    pub fn identify_controller(&self) -> io::Result<ControllerIdentity> {
        let data = self.read_admin(OPC_IDENTIFY, 0, CNS_CONTROLLER, IDENTIFY_LEN)?;
        Ok(parse_identify_controller(&data))
    }

    pub fn identify_namespace(&self) -> io::Result<NamespaceIdentity> {
        let data = self.read_admin(OPC_IDENTIFY, self.nsid, CNS_NAMESPACE, IDENTIFY_LEN)?;
        Ok(parse_identify_namespace(&data))
    }

    pub fn smart_log(&self) -> io::Result<SmartData> {
        let numd = (SMART_LOG_LEN / 4 - 1) as u32;
        let data = self.read_admin(OPC_GET_LOG_PAGE, NSID_ALL, (numd << 16) | LID_SMART, SMART_LOG_LEN)?;
        Ok(parse_smart_log(&data))
    }

    pub fn power_state(&self) -> io::Result<u8> {
        let mut cmd = AdminCmd {
            opcode: OPC_GET_FEATURES,
            cdw10: FID_POWER_MANAGEMENT,
            timeout_ms: ADMIN_TIMEOUT_MS,
            ..AdminCmd::default()
        };
        Ok((submit(self.fd, &mut cmd)? & 0x1F) as u8)
    }

    pub fn set_power_state(&self, ps: u8) -> io::Result<()> {
        let mut cmd = AdminCmd {
            opcode: OPC_SET_FEATURES,
            cdw10: FID_POWER_MANAGEMENT,
            cdw11: ps as u32 & 0x1F,
            timeout_ms: ADMIN_TIMEOUT_MS,
            ..AdminCmd::default()
        };
        submit(self.fd, &mut cmd).map(|_| ())
    }
}

fn ascii_field(b: &[u8]) -> String {
    String::from_utf8_lossy(b).trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_string()
}

fn le_u128(b: &[u8]) -> u128 {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&b[..16]);
    u128::from_le_bytes(raw)
}

pub fn parse_identify_controller(d: &[u8]) -> ControllerIdentity {
    let oncs = u16::from_le_bytes([d[520], d[521]]);
    ControllerIdentity {
        serial: ascii_field(&d[4..24]),
        model: ascii_field(&d[24..64]),
        firmware: ascii_field(&d[64..72]),
        power_states: d[263].saturating_add(1),
        dataset_management: oncs & 0x04 != 0,
    }
}

pub fn parse_identify_namespace(d: &[u8]) -> NamespaceIdentity {
    let mut nsze = [0u8; 8];
    nsze.copy_from_slice(&d[0..8]);
    let fmt = (d[26] & 0x0F) as usize;
    let lbads = d[128 + fmt * 4 + 2];
    NamespaceIdentity {
        blocks: u64::from_le_bytes(nsze),
        block_size: 1u32.checked_shl(lbads as u32).unwrap_or(0),
    }
}

pub fn parse_smart_log(d: &[u8]) -> SmartData {
    SmartData {
        critical_warning: d[0],
        temperature: u16::from_le_bytes([d[1], d[2]]),
        available_spare: d[3],
        available_spare_threshold: d[4],
        percentage_used: d[5],
        data_units_read: le_u128(&d[32..]),
        data_units_written: le_u128(&d[48..]),
        host_read_commands: le_u128(&d[64..]),
        host_write_commands: le_u128(&d[80..]),
        controller_busy_time: le_u128(&d[96..]),
        power_cycles: le_u128(&d[112..]),
        power_on_hours: le_u128(&d[128..]),
        unsafe_shutdowns: le_u128(&d[144..]),
        media_errors: le_u128(&d[160..]),
        error_log_entries: le_u128(&d[176..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_command_layout_matches_kernel() {
        assert_eq!(std::mem::size_of::<AdminCmd>(), 72);
    }

    #[test]
    fn parses_controller_identify() {
        let mut d = vec![0u8; IDENTIFY_LEN];
        d[4..14].copy_from_slice(b"S5GXNX0T12");
        d[14..24].fill(b' ');
        d[24..40].copy_from_slice(b"Samsung SSD 980 ");
        d[64..72].copy_from_slice(b"3B4QFXO7");
        d[263] = 4;
        d[520] = 0x04;
        let id = parse_identify_controller(&d);
        assert_eq!(id.serial, "S5GXNX0T12");
        assert_eq!(id.model, "Samsung SSD 980");
        assert_eq!(id.firmware, "3B4QFXO7");
        assert_eq!(id.power_states, 5);
        assert!(id.dataset_management);
    }

    #[test]
    fn parses_namespace_format() {
        let mut d = vec![0u8; IDENTIFY_LEN];
        d[0..8].copy_from_slice(&1_000_000u64.to_le_bytes());
        d[26] = 1;
        d[128 + 2] = 9;
        d[128 + 4 + 2] = 12;
        let ns = parse_identify_namespace(&d);
        assert_eq!(ns.blocks, 1_000_000);
        assert_eq!(ns.block_size, 4096);
    }

    #[test]
    fn parses_smart_log() {
        let mut d = vec![0u8; SMART_LOG_LEN];
        d[0] = 0x02;
        d[1..3].copy_from_slice(&310u16.to_le_bytes());
        d[3] = 100;
        d[4] = 10;
        d[48..64].copy_from_slice(&12345u128.to_le_bytes());
        d[112..128].copy_from_slice(&7u128.to_le_bytes());
        d[160..176].copy_from_slice(&3u128.to_le_bytes());
        let s = parse_smart_log(&d);
        assert_eq!(s.critical_warning, 2);
        assert_eq!(s.temperature, 310);
        assert_eq!(s.temperature_celsius(), Some(37));
        assert_eq!(s.available_spare, 100);
        assert_eq!(s.data_units_written, 12345);
        assert_eq!(s.power_cycles, 7);
        assert_eq!(s.media_errors, 3);
    }
}
