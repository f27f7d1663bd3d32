//! Validated test settings.
//!
//! Raw `key=value` input is turned into a [`Setting`] at the boundary; the
//! rest of the crate only ever sees a checked [`TestConfig`].

use std::time::Duration;

pub const DEFAULT_SEED: u64 = 0x1234_5678;
pub const MAX_QUEUE_DEPTH: usize = 1024;
pub const SECTOR: usize = 512;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown setting '{0}'")]
    UnknownKey(String),
    #[error("expected key=value, got '{0}'")]
    Malformed(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue { key, reason: reason.into() }
}

/// Parses `4096`, `4K`, `1MiB`, `2G`... into bytes.
pub fn parse_size_with_suffix(s: &str) -> Result<u64, String> {
    let s_trimmed = s.trim();
    if s_trimmed.is_empty() {
        return Err("Input string is empty".to_string());
    }
    let first_non_digit_idx = s_trimmed.find(|c: char| !c.is_ascii_digit());
    let (num_str, suffix_orig) = match first_non_digit_idx {
        Some(0) => return Err(format!("Invalid format: missing numeric value in '{}'", s_trimmed)),
        Some(idx) => s_trimmed.split_at(idx),
        None => (s_trimmed, ""),
    };
    let num = num_str
        .parse::<u64>()
        .map_err(|_| format!("Invalid number: '{}' in '{}'", num_str, s_trimmed))?;
    let suffix = suffix_orig.trim_start().to_uppercase();
    match suffix.as_str() {
        "" | "B" => Ok(num),
        "K" | "KB" | "KIB" => Ok(num.saturating_mul(1024)),
        "M" | "MB" | "MIB" => Ok(num.saturating_mul(1024 * 1024)),
        "G" | "GB" | "GIB" => Ok(num.saturating_mul(1024 * 1024 * 1024)),
        "T" | "TB" | "TIB" => Ok(num.saturating_mul(1024 * 1024 * 1024 * 1024)),
        _ => Err(format!("Unknown or misplaced size suffix: '{}' in '{}'", suffix_orig, s_trimmed)),
    }
}

fn parse_bool(key: &'static str, v: &str) -> Result<bool, ConfigError> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(invalid(key, format!("'{}' is not a boolean", other))),
    }
}

fn parse_u64(key: &'static str, v: &str) -> Result<u64, ConfigError> {
    let v = v.trim();
    let parsed = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => v.parse::<u64>(),
    };
    parsed.map_err(|e| invalid(key, e.to_string()))
}

/// One recognized configuration key with its typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Setting {
    BlockSize(usize),
    QueueDepth(usize),
    DurationSeconds(u64),
    DataSize(u64),
    DirectIo(bool),
    SyncIo(bool),
    VerifyData(bool),
    TimeoutMs(u32),
    Seed(u64),
    ReadPercentage(f64),
}

impl Setting {
    pub fn parse(key: &str, value: &str) -> Result<Self, ConfigError> {
        match key.trim() {
            "block_size" => {
                let v = parse_size_with_suffix(value).map_err(|e| invalid("block_size", e))?;
                Ok(Setting::BlockSize(v as usize))
            }
            "queue_depth" => Ok(Setting::QueueDepth(parse_u64("queue_depth", value)? as usize)),
            "duration" | "duration_seconds" => {
                Ok(Setting::DurationSeconds(parse_u64("duration_seconds", value)?))
            }
            "data_size" => {
                let v = parse_size_with_suffix(value).map_err(|e| invalid("data_size", e))?;
                Ok(Setting::DataSize(v))
            }
            "direct_io" => Ok(Setting::DirectIo(parse_bool("direct_io", value)?)),
            "sync_io" => Ok(Setting::SyncIo(parse_bool("sync_io", value)?)),
            "verify_data" => Ok(Setting::VerifyData(parse_bool("verify_data", value)?)),
            "timeout_ms" => {
                let v = parse_u64("timeout_ms", value)?;
                let v = u32::try_from(v).map_err(|_| invalid("timeout_ms", "too large"))?;
                Ok(Setting::TimeoutMs(v))
            }
            "seed" => Ok(Setting::Seed(parse_u64("seed", value)?)),
            "read_percentage" => {
                let v = value
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| invalid("read_percentage", e.to_string()))?;
                Ok(Setting::ReadPercentage(v))
            }
            other => Err(ConfigError::UnknownKey(other.to_string())),
        }
    }

    /// Parses a `key=value` pair.
    pub fn parse_pair(s: &str) -> Result<Self, ConfigError> {
        let (k, v) = s.split_once('=').ok_or_else(|| ConfigError::Malformed(s.to_string()))?;
        Self::parse(k, v)
    }
}

/// Workload parameters for one performance run.
#[derive(Debug, Clone, PartialEq)]
pub struct TestConfig {
    pub block_size: usize,
    pub queue_depth: usize,
    pub duration_seconds: u64,
    /// Upper bound on bytes transferred; `0` means no byte bound.
    pub data_size: u64,
    pub direct_io: bool,
    /// Run queued operations on the submitting thread.
    pub sync_io: bool,
    pub verify_data: bool,
    pub timeout_ms: u32,
    pub seed: u64,
    pub read_percentage: f64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            queue_depth: 32,
            duration_seconds: 60,
            data_size: 1024 * 1024 * 1024,
            direct_io: true,
            sync_io: false,
            verify_data: false,
            timeout_ms: 30_000,
            seed: DEFAULT_SEED,
            read_percentage: 70.0,
        }
    }
}

impl TestConfig {
    pub fn apply(&mut self, setting: Setting) -> Result<(), ConfigError> {
        match setting {
            Setting::BlockSize(v) => self.block_size = v,
            Setting::QueueDepth(v) => self.queue_depth = v,
            Setting::DurationSeconds(v) => self.duration_seconds = v,
            Setting::DataSize(v) => self.data_size = v,
            Setting::DirectIo(v) => self.direct_io = v,
            Setting::SyncIo(v) => self.sync_io = v,
            Setting::VerifyData(v) => self.verify_data = v,
            Setting::TimeoutMs(v) => self.timeout_ms = v,
            Setting::Seed(v) => self.seed = v,
            Setting::ReadPercentage(v) => self.read_percentage = v,
        }
        self.validate()
    }

    pub fn from_settings<I: IntoIterator<Item = Setting>>(settings: I) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        for s in settings {
            cfg.apply(s)?;
        }
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 || self.block_size % SECTOR != 0 {
            return Err(invalid("block_size", format!("{} is not a non-zero multiple of {}", self.block_size, SECTOR)));
        }
        if self.queue_depth == 0 || self.queue_depth > MAX_QUEUE_DEPTH {
            return Err(invalid("queue_depth", format!("{} outside 1..={}", self.queue_depth, MAX_QUEUE_DEPTH)));
        }
        if self.duration_seconds == 0 && self.data_size == 0 {
            return Err(invalid("duration_seconds", "either a duration or a data size bound is required"));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms", "must be non-zero"));
        }
        if !(0.0..=100.0).contains(&self.read_percentage) {
            return Err(invalid("read_percentage", format!("{} outside 0..=100", self.read_percentage)));
        }
        Ok(())
    }

    pub fn duration(&self) -> Option<Duration> {
        (self.duration_seconds > 0).then(|| Duration::from_secs(self.duration_seconds))
    }
}
