//! Model / serial / firmware lookup for devices that do not answer NVMe identify.

use std::path::Path;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Identity {
    pub model: Option<String>,
    pub serial: Option<String>,
    pub firmware: Option<String>,
    pub logical_block_size: Option<u32>,
    pub discard_supported: bool,
}

/// Unified entry point.
pub fn lookup<P: AsRef<Path>>(dev: P) -> Identity {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            linux::lookup(dev.as_ref()).unwrap_or_default()
        } else {
            let _ = dev;
            Identity::default()
        }
    }
}

/* ---------- LINUX ---------- */
#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::fs;
    use std::io;
    use udev::{Device, Enumerator};

    pub fn lookup(dev: &Path) -> io::Result<Identity> {
        let dev = dev.canonicalize()?;
        let mut id = Identity::default();
        let mut en = Enumerator::new()?;
        en.match_subsystem("block")?;
        for d in en.scan_devices()? {
            if d.devnode() == Some(dev.as_path()) {
                id.model = prop(&d, &["ID_MODEL", "ID_NAME"]);
                id.serial = prop(&d, &["ID_SERIAL_SHORT", "ID_SERIAL"]);
                id.firmware = prop(&d, &["ID_REVISION"]);
                break;
            }
        }
        if let Some(name) = dev.file_name().and_then(|s| s.to_str()) {
            let queue = Path::new("/sys/class/block").join(name).join("queue");
            id.logical_block_size = fs::read_to_string(queue.join("logical_block_size"))
                .ok()
                .and_then(|v| v.trim().parse::<u32>().ok());
            id.discard_supported = fs::read_to_string(queue.join("discard_max_bytes"))
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .is_some_and(|v| v > 0);
        }
        Ok(id)
    }

    fn prop(d: &Device, keys: &[&str]) -> Option<String> {
        keys.iter()
            .find_map(|k| d.property_value(k))
            .map(|v| v.to_string_lossy().trim().to_owned())
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_files_have_no_identity() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let id = lookup(tmp.path());
        assert!(id.model.is_none());
        assert!(id.serial.is_none());
    }
}
