//! Submission / completion state for queued I/O.
//!
//! One worker thread drains the submission channel in order, so requests
//! sharing a queue id complete in submission order. Cancellation bumps a
//! generation counter; the worker compares each job's generation at start
//! and at finish and tags it `Cancelled` instead of dropping it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;

use super::stats::StatsCollector;
use super::{Direction, IoCompletion, IoRequest, IoResult};
use crate::device::SharedDevice;
use crate::error::{ErrorKind, StorageError};
use crate::log::Logger;

pub type RequestId = u64;

struct Job {
    id: RequestId,
    request: IoRequest,
    generation: u64,
    submitted: Instant,
}

/// Book-keeping for a request between acceptance and completion.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub queue_id: u32,
    pub direction: Direction,
    pub lba: u64,
    pub block_count: u32,
    pub started: Option<Instant>,
}

/// Shared with the worker thread.
struct Shared {
    device: SharedDevice,
    stats: Arc<StatsCollector>,
    in_flight: DashMap<RequestId, InFlight>,
    generation: AtomicU64,
    timeout_ms: AtomicU32,
    log: Logger,
}

pub(crate) struct AsyncQueue {
    shared: Arc<Shared>,
    submit_tx: Option<Sender<Job>>,
    done_rx: Receiver<IoCompletion>,
    held: Mutex<VecDeque<IoCompletion>>,
    /// Requests executed on the submitting thread, still counted as outstanding.
    inline: Mutex<VecDeque<IoCompletion>>,
    next_id: AtomicU64,
    outstanding: AtomicUsize,
    worker: Option<JoinHandle<()>>,
}

impl AsyncQueue {
    pub(crate) fn start(
        device: SharedDevice,
        stats: Arc<StatsCollector>,
        timeout_ms: u32,
        log: Logger,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            device,
            stats,
            in_flight: DashMap::new(),
            generation: AtomicU64::new(0),
            timeout_ms: AtomicU32::new(timeout_ms),
            log,
        });
        let (submit_tx, submit_rx) = unbounded::<Job>();
        let (done_tx, done_rx) = unbounded::<IoCompletion>();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("io-worker".to_string())
            .spawn(move || worker_loop(worker_shared, submit_rx, done_tx))?;
        Ok(Self {
            shared,
            submit_tx: Some(submit_tx),
            done_rx,
            held: Mutex::new(VecDeque::new()),
            inline: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            outstanding: AtomicUsize::new(0),
            worker: Some(worker),
        })
    }

    pub(crate) fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn set_timeout_ms(&self, ms: u32) {
        self.shared.timeout_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.shared.timeout_ms.load(Ordering::Relaxed) as u64)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub(crate) fn in_flight(&self, id: RequestId) -> Option<InFlight> {
        self.shared.in_flight.get(&id).map(|e| e.value().clone())
    }

    /// Reserves a slot if fewer than `depth` requests are outstanding.
    pub(crate) fn try_reserve(&self, depth: usize) -> bool {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < depth).then_some(n + 1))
            .is_ok()
    }

    /// Hands an accepted request to the worker. A slot must have been reserved.
    pub(crate) fn push(&self, id: RequestId, request: IoRequest) -> Result<(), IoRequest> {
        let Some(tx) = &self.submit_tx else {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(request);
        };
        self.shared.in_flight.insert(
            id,
            InFlight {
                queue_id: request.queue_id,
                direction: request.direction,
                lba: request.lba,
                block_count: request.block_count,
                started: None,
            },
        );
        let job = Job {
            id,
            request,
            generation: self.shared.generation.load(Ordering::Acquire),
            submitted: Instant::now(),
        };
        if let Err(e) = tx.send(job) {
            self.shared.in_flight.remove(&id);
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(e.into_inner().request);
        }
        Ok(())
    }

    /// Every request accepted so far completes as `Cancelled` unless it has
    /// already finished. Returns how many requests are affected.
    pub(crate) fn cancel(&self) -> usize {
        let affected = self.shared.in_flight.len();
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        affected
    }

    /// Queues a completion for a request that already ran on the caller's
    /// thread. A slot must have been reserved; draining it releases the slot.
    pub(crate) fn complete_inline(&self, completion: IoCompletion) {
        self.inline.lock().push_back(completion);
    }

    /// Puts completions back so the next wait returns them first.
    pub(crate) fn hold(&self, completions: Vec<IoCompletion>) {
        let mut held = self.held.lock();
        for c in completions.into_iter().rev() {
            held.push_front(c);
        }
    }

    pub(crate) fn wait(&self, max: usize) -> Vec<IoCompletion> {
        let limit = if max == 0 { usize::MAX } else { max };
        let mut out = Vec::new();
        {
            let mut held = self.held.lock();
            while out.len() < limit {
                match held.pop_front() {
                    Some(c) => out.push(c),
                    None => break,
                }
            }
        }
        {
            let mut inline = self.inline.lock();
            while out.len() < limit {
                match inline.pop_front() {
                    Some(c) => {
                        self.outstanding.fetch_sub(1, Ordering::AcqRel);
                        out.push(c);
                    }
                    None => break,
                }
            }
        }
        if out.is_empty() {
            if self.outstanding() == 0 {
                return out;
            }
            match self.done_rx.recv_timeout(self.timeout()) {
                Ok(c) => {
                    self.outstanding.fetch_sub(1, Ordering::AcqRel);
                    out.push(c);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return out,
            }
        }
        while out.len() < limit {
            match self.done_rx.try_recv() {
                Ok(c) => {
                    self.outstanding.fetch_sub(1, Ordering::AcqRel);
                    out.push(c);
                }
                Err(_) => break,
            }
        }
        out
    }
}

impl Drop for AsyncQueue {
    fn drop(&mut self) {
        self.cancel();
        self.submit_tx.take();
        if let Some(h) = self.worker.take() {
            let _ = h.join();
        }
    }
}

fn terminal(kind: ErrorKind, message: &str, latency: Duration, bytes: u64) -> IoResult {
    IoResult {
        success: false,
        bytes_transferred: bytes,
        latency,
        error: Some(kind),
        error_code: 0,
        message: Some(message.to_string()),
    }
}

fn execute(device: &SharedDevice, req: &mut IoRequest) -> Result<u64, StorageError> {
    let mut dev = device.lock();
    match req.direction {
        Direction::Read => dev.read_blocks(req.lba, req.block_count, &mut req.buffer)?,
        Direction::Write => dev.write_blocks(req.lba, req.block_count, &req.buffer)?,
    }
    Ok(req.buffer.len() as u64)
}

fn worker_loop(shared: Arc<Shared>, submit_rx: Receiver<Job>, done_tx: Sender<IoCompletion>) {
    for mut job in submit_rx.iter() {
        let timeout = Duration::from_millis(shared.timeout_ms.load(Ordering::Relaxed) as u64);
        let result = if job.generation < shared.generation.load(Ordering::Acquire) {
            terminal(ErrorKind::Cancelled, "cancelled before start", job.submitted.elapsed(), 0)
        } else if job.submitted.elapsed() > timeout {
            terminal(ErrorKind::Timeout, "expired in submission queue", job.submitted.elapsed(), 0)
        } else {
            if let Some(mut e) = shared.in_flight.get_mut(&job.id) {
                e.started = Some(Instant::now());
            }
            let started = Instant::now();
            let outcome = execute(&shared.device, &mut job.request);
            let took = started.elapsed();
            let latency = job.submitted.elapsed();
            match outcome {
                Ok(bytes) if job.generation < shared.generation.load(Ordering::Acquire) => {
                    terminal(ErrorKind::Cancelled, "cancelled while in flight", latency, bytes)
                }
                Ok(bytes) if took > timeout => {
                    terminal(ErrorKind::Timeout, "completed after timeout", latency, bytes)
                }
                Ok(bytes) => IoResult::ok(bytes, latency),
                Err(e) => {
                    shared.log.warn(
                        "queued I/O failed",
                        &[("id", &job.id), ("lba", &job.request.lba), ("error", &e)],
                    );
                    IoResult::failed(&e, latency)
                }
            }
        };
        shared.stats.record(&result);
        shared.in_flight.remove(&job.id);
        let IoRequest { lba, block_count, buffer, direction, queue_id } = job.request;
        let completion = IoCompletion { id: job.id, queue_id, direction, lba, block_count, buffer, result };
        if done_tx.send(completion).is_err() {
            break;
        }
    }
}
