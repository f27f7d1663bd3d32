//! Injected logging.
//!
//! Every component receives a [`Logger`] at construction; there is no
//! process-wide logger. Call sites pass a message plus an explicit field
//! list and the sink decides how (and whether) to render them.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Local;
use indicatif::ProgressBar;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARN",
            Level::Error => "ERROR",
            Level::Critical => "CRIT",
        }
    }
}

/// One structured field: a static key and anything displayable.
pub type Field<'a> = (&'static str, &'a dyn fmt::Display);

/// Destination for leveled, structured log records.
pub trait LogSink: Send + Sync {
    fn record(&self, level: Level, message: &str, fields: &[Field<'_>]);
}

/// Renders a field list as `key=value key=value`.
pub struct Fields<'a, 'b>(pub &'a [Field<'b>]);

impl fmt::Display for Fields<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

/// Cloneable handle to a sink with a minimum level.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    min_level: Level,
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink, min_level: Level::Info }
    }

    /// A logger that drops everything.
    pub fn null() -> Self {
        Self::new(Arc::new(NullSink))
    }

    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }

    pub fn enabled(&self, level: Level) -> bool {
        level >= self.min_level
    }

    pub fn log(&self, level: Level, message: &str, fields: &[Field<'_>]) {
        if self.enabled(level) {
            self.sink.record(level, message, fields);
        }
    }

    pub fn debug(&self, message: &str, fields: &[Field<'_>]) {
        self.log(Level::Debug, message, fields);
    }

    pub fn info(&self, message: &str, fields: &[Field<'_>]) {
        self.log(Level::Info, message, fields);
    }

    pub fn warn(&self, message: &str, fields: &[Field<'_>]) {
        self.log(Level::Warning, message, fields);
    }

    pub fn error(&self, message: &str, fields: &[Field<'_>]) {
        self.log(Level::Error, message, fields);
    }

    pub fn critical(&self, message: &str, fields: &[Field<'_>]) {
        self.log(Level::Critical, message, fields);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("min_level", &self.min_level).finish()
    }
}

pub struct NullSink;

impl LogSink for NullSink {
    fn record(&self, _level: Level, _message: &str, _fields: &[Field<'_>]) {}
}

/// Timestamped text lines to stderr (or an attached progress bar) and an
/// optional append-only log file.
pub struct FileSink {
    file: Option<Mutex<File>>,
    progress: Mutex<Option<ProgressBar>>,
    echo: bool,
    /// Set on the first failed write to the log file, which is reported once.
    write_failed: AtomicBool,
}

impl FileSink {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::with_file(Some(Mutex::new(f))))
    }

    pub fn stderr_only() -> Self {
        Self::with_file(None)
    }

    fn with_file(file: Option<Mutex<File>>) -> Self {
        Self { file, progress: Mutex::new(None), echo: true, write_failed: AtomicBool::new(false) }
    }

    /// `true` once a write to the log file has failed.
    pub fn write_failed(&self) -> bool {
        self.write_failed.load(Ordering::Relaxed)
    }

    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    /// While a bar is attached, echoed lines are printed above it.
    pub fn attach_progress(&self, pb: Option<ProgressBar>) {
        *self.progress.lock() = pb;
    }
}

impl LogSink for FileSink {
    fn record(&self, level: Level, message: &str, fields: &[Field<'_>]) {
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = if fields.is_empty() {
            format!("[{}] {:<5} {}", ts, level.as_str(), message)
        } else {
            format!("[{}] {:<5} {} {}", ts, level.as_str(), message, Fields(fields))
        };
        if self.echo {
            match self.progress.lock().as_ref() {
                Some(pb) => pb.println(line.as_str()),
                None => eprintln!("{}", line),
            }
        }
        if let Some(f) = &self.file {
            let mut guard = f.lock();
            let written = writeln!(*guard, "{}", line).and_then(|_| guard.flush());
            if let Err(e) = written {
                if !self.write_failed.swap(true, Ordering::Relaxed) {
                    eprintln!("log file write failed, further log file errors are not reported: {}", e);
                }
            }
        }
    }
}

/// Forwards records to `tracing`; fields travel as one rendered `fields` value.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record(&self, level: Level, message: &str, fields: &[Field<'_>]) {
        let fields = Fields(fields);
        match level {
            Level::Debug => tracing::debug!(fields = %fields, "{}", message),
            Level::Info => tracing::info!(fields = %fields, "{}", message),
            Level::Warning => tracing::warn!(fields = %fields, "{}", message),
            Level::Error | Level::Critical => tracing::error!(fields = %fields, "{}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRecord {
    pub level: Level,
    pub message: String,
    pub fields: Vec<(String, String)>,
}

impl CapturedRecord {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Keeps every record in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<CapturedRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CapturedRecord> {
        self.records.lock().clone()
    }

    pub fn count(&self, level: Level) -> usize {
        self.records.lock().iter().filter(|r| r.level == level).count()
    }
}

impl LogSink for MemorySink {
    fn record(&self, level: Level, message: &str, fields: &[Field<'_>]) {
        let fields = fields.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.records.lock().push(CapturedRecord { level, message: message.to_string(), fields });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_level_filters_records() {
        let sink = Arc::new(MemorySink::new());
        let log = Logger::new(sink.clone()).with_min_level(Level::Warning);
        log.info("dropped", &[]);
        log.warn("kept", &[("lba", &42u64)]);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "kept");
        assert_eq!(records[0].field("lba"), Some("42"));
    }

    #[test]
    fn file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let sink = FileSink::open(&path).unwrap().quiet();
        sink.record(Level::Error, "write failed", &[("lba", &7u64), ("blocks", &1u32)]);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("ERROR write failed lba=7 blocks=1"));
        assert!(!sink.write_failed());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn file_sink_flags_failed_writes() {
        let sink = FileSink::open("/dev/full").unwrap().quiet();
        sink.record(Level::Info, "first", &[]);
        assert!(sink.write_failed());
        sink.record(Level::Info, "second", &[]);
        assert!(sink.write_failed());
    }
}
