use std::{fmt, io};

/// Failure category shared by the device layer, the I/O engine and the harnesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Misaligned buffer, out-of-range LBA/block count, bad configuration value.
    InvalidArgument,
    /// Hardware or driver reported failure.
    DeviceError,
    Timeout,
    Cancelled,
    /// Verify mismatch.
    Corruption,
    /// Queue full or allocation failure.
    ResourceExhausted,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::DeviceError => "device_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Corruption => "corruption",
            ErrorKind::ResourceExhausted => "resource_exhausted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("device not initialized")]
    NotInitialized,
    #[error("device disconnected")]
    Disconnected,
    #[error("operation timed out after {0} ms")]
    Timeout(u32),
    #[error("operation cancelled")]
    Cancelled,
    #[error("data corruption: {0}")]
    Corruption(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            StorageError::Device(_)
            | StorageError::Io(_)
            | StorageError::NotInitialized
            | StorageError::Disconnected => ErrorKind::DeviceError,
            StorageError::Timeout(_) => ErrorKind::Timeout,
            StorageError::Cancelled => ErrorKind::Cancelled,
            StorageError::Corruption(_) => ErrorKind::Corruption,
            StorageError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
        }
    }

    /// Raw OS error code when the failure came from the kernel, `0` otherwise.
    pub fn code(&self) -> i32 {
        match self {
            StorageError::Io(e) => e.raw_os_error().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        StorageError::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
