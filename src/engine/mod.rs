//! I/O execution engine.
//!
//! Synchronous operations run on the caller's thread under the device lock.
//! Queued operations go through [`queue::AsyncQueue`], whose single worker
//! thread owns execution order, unless [`IoEngine::enable_sync_io`] routes
//! them through the synchronous path. Both paths feed the same [`IoStats`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

mod queue;
mod stats;

pub use queue::{InFlight, RequestId};
pub use stats::IoStats;

use crate::buffer::{is_aligned, AlignedBuf, DEFAULT_ALIGNMENT};
use crate::config::{TestConfig, MAX_QUEUE_DEPTH};
use crate::device::{check_request, DeviceInfo, SharedDevice};
use crate::error::{ErrorKind, Result, StorageError};
use crate::log::Logger;
use queue::AsyncQueue;
use stats::StatsCollector;

pub const DEFAULT_QUEUE_DEPTH: usize = 32;
pub const DEFAULT_TIMEOUT_MS: u32 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

/// A queued transfer. The buffer travels with the request and comes back in
/// its [`IoCompletion`] (or [`Rejected`]).
#[derive(Debug)]
pub struct IoRequest {
    pub lba: u64,
    pub block_count: u32,
    pub buffer: AlignedBuf,
    pub direction: Direction,
    pub queue_id: u32,
}

impl IoRequest {
    pub fn new(lba: u64, block_count: u32, buffer: AlignedBuf) -> Self {
        Self { lba, block_count, buffer, direction: Direction::Read, queue_id: 0 }
    }

    pub fn on_queue(mut self, queue_id: u32) -> Self {
        self.queue_id = queue_id;
        self
    }
}

/// Outcome of one operation. Failures are values, never panics or `Err`s.
#[derive(Debug, Clone, PartialEq)]
pub struct IoResult {
    pub success: bool,
    pub bytes_transferred: u64,
    pub latency: Duration,
    pub error: Option<ErrorKind>,
    /// Raw OS error code, `0` when the failure did not come from the kernel.
    pub error_code: i32,
    pub message: Option<String>,
}

impl IoResult {
    pub fn ok(bytes: u64, latency: Duration) -> Self {
        Self { success: true, bytes_transferred: bytes, latency, error: None, error_code: 0, message: None }
    }

    pub fn failed(err: &StorageError, latency: Duration) -> Self {
        Self {
            success: false,
            bytes_transferred: 0,
            latency,
            error: Some(err.kind()),
            error_code: err.code(),
            message: Some(err.to_string()),
        }
    }

    pub fn latency_us(&self) -> f64 {
        self.latency.as_secs_f64() * 1e6
    }
}

#[derive(Debug)]
pub struct IoCompletion {
    pub id: RequestId,
    pub queue_id: u32,
    pub direction: Direction,
    pub lba: u64,
    pub block_count: u32,
    pub buffer: AlignedBuf,
    pub result: IoResult,
}

/// A request refused at submission. Nothing was queued or counted.
#[derive(Debug)]
pub struct Rejected {
    pub id: RequestId,
    pub error: StorageError,
    pub request: IoRequest,
}

impl Rejected {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    fn into_completion(self) -> IoCompletion {
        let result = IoResult::failed(&self.error, Duration::ZERO);
        let IoRequest { lba, block_count, buffer, direction, queue_id } = self.request;
        IoCompletion { id: self.id, queue_id, direction, lba, block_count, buffer, result }
    }
}

pub struct IoEngine {
    device: SharedDevice,
    info: DeviceInfo,
    log: Logger,
    stats: Arc<StatsCollector>,
    queue: AsyncQueue,
    queue_depth: AtomicUsize,
    direct_io: AtomicBool,
    sync_io: AtomicBool,
    alignment: usize,
}

impl IoEngine {
    /// The device must already be initialized; its identify data is cached
    /// for bounds checks until [`IoEngine::refresh_device_info`].
    pub fn new(device: SharedDevice, log: Logger) -> Result<Self> {
        let info = device.lock().info()?.clone();
        let stats = Arc::new(StatsCollector::default());
        let queue = AsyncQueue::start(Arc::clone(&device), Arc::clone(&stats), DEFAULT_TIMEOUT_MS, log.clone())?;
        Ok(Self {
            device,
            info,
            log,
            stats,
            queue,
            queue_depth: AtomicUsize::new(DEFAULT_QUEUE_DEPTH),
            direct_io: AtomicBool::new(false),
            sync_io: AtomicBool::new(false),
            alignment: DEFAULT_ALIGNMENT.max(1),
        })
    }

    /// Applies queue depth, timeout and the I/O modes from a validated config.
    pub fn configure(&self, cfg: &TestConfig) -> Result<()> {
        self.set_queue_depth(cfg.queue_depth)?;
        self.set_timeout_ms(cfg.timeout_ms);
        self.enable_direct_io(cfg.direct_io);
        self.enable_sync_io(cfg.sync_io);
        Ok(())
    }

    pub fn refresh_device_info(&mut self) -> Result<()> {
        self.info = self.device.lock().info()?.clone();
        Ok(())
    }

    pub fn device(&self) -> &SharedDevice {
        &self.device
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn set_queue_depth(&self, depth: usize) -> Result<()> {
        if depth == 0 || depth > MAX_QUEUE_DEPTH {
            return Err(StorageError::invalid(format!("queue depth {} outside 1..={}", depth, MAX_QUEUE_DEPTH)));
        }
        self.queue_depth.store(depth, Ordering::Relaxed);
        Ok(())
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn set_timeout_ms(&self, ms: u32) {
        self.queue.set_timeout_ms(ms);
    }

    pub fn timeout(&self) -> Duration {
        self.queue.timeout()
    }

    /// In direct mode every buffer must start on the alignment boundary.
    pub fn enable_direct_io(&self, on: bool) {
        self.direct_io.store(on, Ordering::Relaxed);
    }

    /// Queued reads and writes execute on the submitting thread before
    /// `async_read`/`async_write` return. Queue depth still applies and the
    /// completions are still collected with [`IoEngine::wait_for_completions`].
    /// Switch modes only while nothing is outstanding.
    pub fn enable_sync_io(&self, on: bool) {
        self.sync_io.store(on, Ordering::Relaxed);
    }

    pub fn sync_io_enabled(&self) -> bool {
        self.sync_io.load(Ordering::Relaxed)
    }

    pub fn enable_statistics(&self, on: bool) {
        self.stats.set_enabled(on);
    }

    pub fn get_statistics(&self) -> IoStats {
        self.stats.snapshot()
    }

    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// Accepted requests not yet returned by [`IoEngine::wait_for_completions`].
    pub fn outstanding(&self) -> usize {
        self.queue.outstanding()
    }

    pub fn in_flight(&self, id: RequestId) -> Option<InFlight> {
        self.queue.in_flight(id)
    }

    fn check(&self, lba: u64, block_count: u32, buf: &[u8]) -> Result<()> {
        if self.direct_io.load(Ordering::Relaxed) && !is_aligned(buf, self.alignment) {
            return Err(StorageError::invalid(format!(
                "buffer at {:p} is not {}-byte aligned",
                buf.as_ptr(),
                self.alignment
            )));
        }
        check_request(&self.info, lba, block_count, buf.len())
    }

    fn finish(&self, op: &'static str, lba: u64, outcome: Result<u64>, start: Instant) -> IoResult {
        let latency = start.elapsed();
        let result = match outcome {
            Ok(bytes) => IoResult::ok(bytes, latency),
            Err(e) => {
                self.log.warn(op, &[("lba", &lba), ("kind", &e.kind()), ("error", &e)]);
                IoResult::failed(&e, latency)
            }
        };
        self.stats.record(&result);
        result
    }

    pub fn sync_read(&self, lba: u64, block_count: u32, buf: &mut [u8]) -> IoResult {
        let start = Instant::now();
        let len = buf.len() as u64;
        let outcome = self
            .check(lba, block_count, buf)
            .and_then(|_| self.device.lock().read_blocks(lba, block_count, buf))
            .map(|_| len);
        self.finish("sync read failed", lba, outcome, start)
    }

    pub fn sync_write(&self, lba: u64, block_count: u32, buf: &[u8]) -> IoResult {
        let start = Instant::now();
        let outcome = self
            .check(lba, block_count, buf)
            .and_then(|_| self.device.lock().write_blocks(lba, block_count, buf))
            .map(|_| buf.len() as u64);
        self.finish("sync write failed", lba, outcome, start)
    }

    pub fn sync_flush(&self) -> IoResult {
        let start = Instant::now();
        let outcome = self.device.lock().flush().map(|_| 0);
        self.finish("flush failed", 0, outcome, start)
    }

    pub fn sync_trim(&self, lba: u64, block_count: u32) -> IoResult {
        let start = Instant::now();
        let span = block_count as usize * self.info.block_bytes();
        let outcome = check_request(&self.info, lba, block_count, span)
            .and_then(|_| self.device.lock().perform_trim(lba, block_count))
            .map(|_| 0);
        self.finish("trim failed", lba, outcome, start)
    }

    fn submit(&self, request: IoRequest) -> std::result::Result<RequestId, Rejected> {
        let id = self.queue.next_id();
        if let Err(error) = self.check(request.lba, request.block_count, &request.buffer) {
            return Err(Rejected { id, error, request });
        }
        let depth = self.queue_depth();
        if !self.queue.try_reserve(depth) {
            let error = StorageError::ResourceExhausted(format!("{} requests already outstanding", depth));
            return Err(Rejected { id, error, request });
        }
        if self.sync_io_enabled() {
            self.queue.complete_inline(self.execute_inline(id, request));
            return Ok(id);
        }
        self.queue.push(id, request).map_err(|request| Rejected {
            id,
            error: StorageError::Device("I/O worker is not running".to_string()),
            request,
        })?;
        Ok(id)
    }

    fn execute_inline(&self, id: RequestId, request: IoRequest) -> IoCompletion {
        let IoRequest { lba, block_count, mut buffer, direction, queue_id } = request;
        let result = match direction {
            Direction::Read => self.sync_read(lba, block_count, &mut buffer),
            Direction::Write => self.sync_write(lba, block_count, &buffer),
        };
        IoCompletion { id, queue_id, direction, lba, block_count, buffer, result }
    }

    pub fn async_read(&self, mut request: IoRequest) -> std::result::Result<RequestId, Rejected> {
        request.direction = Direction::Read;
        self.submit(request)
    }

    pub fn async_write(&self, mut request: IoRequest) -> std::result::Result<RequestId, Rejected> {
        request.direction = Direction::Write;
        self.submit(request)
    }

    /// Blocks until at least one completion is ready or the timeout passes,
    /// then drains up to `max` of them (`0` drains everything ready).
    pub fn wait_for_completions(&self, max: usize) -> Vec<IoCompletion> {
        self.queue.wait(max)
    }

    /// Requests not yet started complete as `Cancelled`; one already on the
    /// device finishes and is tagged `Cancelled`. Returns the number affected.
    pub fn cancel_pending_operations(&self) -> usize {
        let n = self.queue.cancel();
        if n > 0 {
            self.log.info("cancelled pending operations", &[("count", &n)]);
        }
        n
    }

    pub fn batch_read(&self, requests: Vec<IoRequest>) -> Vec<IoCompletion> {
        self.batch(Direction::Read, requests)
    }

    pub fn batch_write(&self, requests: Vec<IoRequest>) -> Vec<IoCompletion> {
        self.batch(Direction::Write, requests)
    }

    /// Keeps at most `queue_depth` requests outstanding; completions come back
    /// in submission order. Completions for requests submitted outside the
    /// batch are held for the next [`IoEngine::wait_for_completions`].
    fn batch(&self, direction: Direction, requests: Vec<IoRequest>) -> Vec<IoCompletion> {
        let total = requests.len();
        let mut slots: Vec<Option<IoCompletion>> = std::iter::repeat_with(|| None).take(total).collect();
        let mut index: HashMap<RequestId, usize> = HashMap::new();
        let mut foreign = Vec::new();
        let mut done = 0;
        let mut pending = requests.into_iter().enumerate().peekable();

        while done < total {
            while let Some((i, mut req)) = pending.next_if(|_| self.outstanding() < self.queue_depth()) {
                req.direction = direction;
                match self.submit(req) {
                    Ok(id) => {
                        index.insert(id, i);
                    }
                    Err(rejected) => {
                        slots[i] = Some(rejected.into_completion());
                        done += 1;
                    }
                }
            }
            if done == total {
                break;
            }
            let ready = self.queue.wait(0);
            if ready.is_empty() && !self.queue.is_running() {
                self.log.error("I/O worker stopped during batch", &[("missing", &(total - done))]);
                break;
            }
            for c in ready {
                match index.remove(&c.id) {
                    Some(i) => {
                        slots[i] = Some(c);
                        done += 1;
                    }
                    None => foreign.push(c),
                }
            }
        }
        self.queue.hold(foreign);
        slots.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::allocate_aligned_buffer;
    use crate::device::{share, BlockDevice, FaultPlan, SimDevice};
    use crate::pattern::Pattern;

    fn engine_with(dev: SimDevice) -> IoEngine {
        let mut dev = dev;
        dev.initialize().unwrap();
        IoEngine::new(share(dev), Logger::null()).unwrap()
    }

    fn engine(blocks: u64) -> IoEngine {
        engine_with(SimDevice::new(512, blocks))
    }

    fn buf(blocks: usize) -> AlignedBuf {
        allocate_aligned_buffer(blocks * 512, 512).unwrap()
    }

    fn drain(e: &IoEngine, n: usize) -> Vec<IoCompletion> {
        let mut out = Vec::new();
        for _ in 0..1000 {
            if out.len() >= n {
                break;
            }
            out.extend(e.wait_for_completions(0));
        }
        out
    }

    #[test]
    fn sync_round_trip_updates_stats() {
        let e = engine(64);
        let data = Pattern::Checkerboard.generate(1024);
        let w = e.sync_write(10, 2, &data);
        assert!(w.success, "{:?}", w.message);
        assert_eq!(w.bytes_transferred, 1024);
        let mut back = vec![0u8; 1024];
        let r = e.sync_read(10, 2, &mut back);
        assert!(r.success);
        assert_eq!(back, data);
        let s = e.get_statistics();
        assert_eq!(s.total_operations, 2);
        assert_eq!(s.successful_operations, 2);
        assert_eq!(s.total_bytes, 2048);
        assert!(s.min_latency.is_some());
    }

    #[test]
    fn sync_failures_are_values() {
        let e = engine(16);
        let r = e.sync_write(16, 1, &[0u8; 512]);
        assert!(!r.success);
        assert_eq!(r.error, Some(ErrorKind::InvalidArgument));
        let r = e.sync_read(0, 2, &mut [0u8; 512]);
        assert_eq!(r.error, Some(ErrorKind::InvalidArgument));
        assert_eq!(e.get_statistics().failed_operations, 2);
        e.reset_statistics();
        e.reset_statistics();
        assert_eq!(e.get_statistics(), IoStats::default());
    }

    #[test]
    fn direct_mode_rejects_misaligned_buffers() {
        let e = engine(16);
        e.enable_direct_io(true);
        let mut big = buf(3);
        let r = e.sync_read(0, 1, &mut big[1..513]);
        assert_eq!(r.error, Some(ErrorKind::InvalidArgument));
        assert!(e.sync_read(0, 1, &mut big[..512]).success);
    }

    #[test]
    fn queue_depth_overflow_returns_buffer() {
        let e = engine_with(
            SimDevice::new(512, 64)
                .with_faults(FaultPlan { op_delay: Some(Duration::from_millis(5)), ..Default::default() }),
        );
        e.set_queue_depth(2).unwrap();
        e.async_write(IoRequest::new(0, 1, buf(1))).unwrap();
        e.async_write(IoRequest::new(1, 1, buf(1))).unwrap();
        let rejected = e.async_write(IoRequest::new(2, 1, buf(1))).unwrap_err();
        assert_eq!(rejected.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(rejected.request.buffer.len(), 512);
        assert_eq!(e.outstanding(), 2);
        let done = drain(&e, 2);
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|c| c.result.success));
        assert_eq!(e.outstanding(), 0);
        assert!(e.async_write(IoRequest::new(2, 1, buf(1))).is_ok());
    }

    #[test]
    fn invalid_bounds_are_rejected_at_submission() {
        let e = engine(8);
        let r = e.async_read(IoRequest::new(8, 1, buf(1))).unwrap_err();
        assert_eq!(r.kind(), ErrorKind::InvalidArgument);
        assert_eq!(e.outstanding(), 0);
        assert!(e.set_queue_depth(0).is_err());
        assert!(e.set_queue_depth(MAX_QUEUE_DEPTH + 1).is_err());
    }

    #[test]
    fn same_queue_completes_in_submission_order() {
        let e = engine(64);
        let ids: Vec<_> = (0..8)
            .map(|i| e.async_write(IoRequest::new(i, 1, buf(1)).on_queue(3)).unwrap())
            .collect();
        let done = drain(&e, 8);
        let got: Vec<_> = done.iter().map(|c| c.id).collect();
        assert_eq!(got, ids);
        assert!(done.iter().all(|c| c.queue_id == 3 && c.direction == Direction::Write));
    }

    #[test]
    fn cancel_tags_every_accepted_request() {
        let e = engine_with(
            SimDevice::new(512, 64)
                .with_faults(FaultPlan { op_delay: Some(Duration::from_millis(20)), ..Default::default() }),
        );
        for i in 0..4 {
            e.async_read(IoRequest::new(i, 1, buf(1))).unwrap();
        }
        assert_eq!(e.cancel_pending_operations(), 4);
        let done = drain(&e, 4);
        assert_eq!(done.len(), 4);
        let cancelled = done.iter().filter(|c| c.result.error == Some(ErrorKind::Cancelled)).count();
        assert!(cancelled >= 3, "only {} cancelled", cancelled);
        assert!(done.iter().all(|c| c.buffer.len() == 512));
    }

    #[test]
    fn slow_operations_time_out_with_buffer() {
        let e = engine_with(
            SimDevice::new(512, 16)
                .with_faults(FaultPlan { op_delay: Some(Duration::from_millis(40)), ..Default::default() }),
        );
        e.set_timeout_ms(5);
        e.async_write(IoRequest::new(0, 1, buf(1))).unwrap();
        let done = drain(&e, 1);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].result.error, Some(ErrorKind::Timeout));
        assert_eq!(done[0].buffer.len(), 512);
    }

    #[test]
    fn sync_mode_executes_before_submission_returns() {
        let e = engine(64);
        e.enable_sync_io(true);
        e.set_queue_depth(2).unwrap();
        let mut data = buf(1);
        Pattern::Address { base: 5 * 512 }.fill(&mut data);
        let first = e.async_write(IoRequest::new(5, 1, data)).unwrap();
        let mut back = vec![0u8; 512];
        assert!(e.sync_read(5, 1, &mut back).success);
        assert_eq!(back, Pattern::Address { base: 5 * 512 }.generate(512));
        let second = e.async_read(IoRequest::new(5, 1, buf(1))).unwrap();
        let rejected = e.async_read(IoRequest::new(6, 1, buf(1))).unwrap_err();
        assert_eq!(rejected.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(e.outstanding(), 2);

        let done = e.wait_for_completions(0);
        assert_eq!(done.iter().map(|c| c.id).collect::<Vec<_>>(), vec![first, second]);
        assert!(done.iter().all(|c| c.result.success));
        assert_eq!(&done[1].buffer[..], &back[..]);
        assert_eq!(e.outstanding(), 0);
        assert_eq!(e.get_statistics().total_operations, 3);

        e.enable_sync_io(false);
        assert!(!e.sync_io_enabled());
        e.async_read(IoRequest::new(5, 1, buf(1))).unwrap();
        assert_eq!(drain(&e, 1).len(), 1);
    }

    #[test]
    fn wait_without_outstanding_returns_empty() {
        let e = engine(4);
        assert!(e.wait_for_completions(0).is_empty());
    }

    #[test]
    fn batch_preserves_submission_order() {
        let e = engine(64);
        e.set_queue_depth(3).unwrap();
        let writes: Vec<_> = (0..10u64)
            .map(|i| {
                let mut b = buf(1);
                Pattern::Address { base: i * 512 }.fill(&mut b);
                IoRequest::new(i, 1, b)
            })
            .collect();
        let done = e.batch_write(writes);
        assert_eq!(done.len(), 10);
        assert!(done.iter().all(|c| c.result.success));

        let mut reads: Vec<_> = (0..10u64).rev().map(|i| IoRequest::new(i, 1, buf(1))).collect();
        reads.push(IoRequest::new(64, 1, buf(1)));
        let done = e.batch_read(reads);
        assert_eq!(done.len(), 11);
        for (c, lba) in done.iter().zip((0..10u64).rev()) {
            assert_eq!(c.lba, lba);
            assert_eq!(&c.buffer[..], &Pattern::Address { base: lba * 512 }.generate(512)[..]);
        }
        assert_eq!(done[10].result.error, Some(ErrorKind::InvalidArgument));
    }
}
