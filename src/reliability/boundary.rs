use std::collections::HashMap;

use super::{ReliabilityTests, Run};
use crate::buffer::AlignedBuf;
use crate::engine::IoRequest;
use crate::error::ErrorKind;
use crate::pattern::Pattern;
use crate::report::ReliabilityResult;

/// Blocks covered by the maximum-LBA transfer test.
const TAIL_BLOCKS: u64 = 8;

impl ReliabilityTests {
    /// First and last LBA round-trip; every request touching `max_lba` or
    /// beyond is refused and leaves the last block intact.
    pub fn test_boundary_conditions(&self) -> ReliabilityResult {
        let mut run = self.begin("boundary_conditions", "first/last LBA access and out-of-range rejection");
        let max = self.info().max_lba;
        let bs = self.block_bytes();
        if max == 0 {
            run.result.error("device reports no addressable blocks".to_string());
            return self.conclude(run);
        }
        self.write_verify(&mut run, 0, 1, &Pattern::Address { base: 0 });
        run.progress.update(0.25);
        let last = max - 1;
        let last_pattern = Pattern::Address { base: last * bs as u64 };
        self.write_verify(&mut run, last, 1, &last_pattern);
        run.progress.update(0.5);

        let probe = vec![0u8; 2 * bs];
        let cases: [(&str, u64, u32, &[u8]); 5] = [
            ("write at max_lba", max, 1, &probe[..bs]),
            ("write past max_lba", max.saturating_add(1), 1, &probe[..bs]),
            ("write straddling the end", last, 2, &probe[..]),
            ("write at u64::MAX", u64::MAX, 1, &probe[..bs]),
            ("zero-length write", 0, 0, &probe[..0]),
        ];
        for (what, lba, count, data) in cases {
            self.expect_rejected(&mut run, what, lba, count, data);
        }
        let mut short = vec![0u8; bs];
        let r = self.engine.sync_read(last, 2, &mut short);
        if r.success || r.error != Some(ErrorKind::InvalidArgument) {
            run.result.error(format!("read with undersized buffer returned {:?}", r.error));
        }
        run.progress.update(0.75);

        if let Some(actual) = self.read(&mut run, last, 1) {
            if !self.check(&mut run, last, &last_pattern.generate(bs), &actual) {
                run.result.note(format!("LBA {} changed after out-of-range requests", last));
            }
        }
        self.conclude(run)
    }

    fn expect_rejected(&self, run: &mut Run, what: &str, lba: u64, count: u32, data: &[u8]) {
        let r = self.engine.sync_write(lba, count, data);
        match r.error {
            Some(ErrorKind::InvalidArgument) => {}
            Some(other) => run.result.error(format!("{}: expected invalid_argument, got {}", what, other)),
            None => run.result.error(format!("{}: accepted", what)),
        }
    }

    /// One multi-block transfer that ends exactly on the last LBA, then the
    /// last block alone.
    pub fn test_maximum_lba_access(&self) -> ReliabilityResult {
        let mut run = self.begin("maximum_lba_access", "transfers ending exactly at the device's last block");
        let info = self.info().clone();
        let bs = info.block_bytes() as u64;
        if info.capacity_bytes != info.max_lba * bs {
            run.result.note(format!(
                "capacity {} bytes is not {} blocks of {}",
                info.capacity_bytes, info.max_lba, bs
            ));
        }
        let n = TAIL_BLOCKS.min(info.max_lba);
        if n == 0 {
            run.result.error("device reports no addressable blocks".to_string());
            return self.conclude(run);
        }
        let start = info.max_lba - n;
        self.write_verify(&mut run, start, n, &Pattern::Address { base: start * bs });
        run.progress.update(0.5);
        let last = info.max_lba - 1;
        if let Some(actual) = self.read(&mut run, last, 1) {
            let expected = Pattern::Address { base: last * bs }.generate(bs as usize);
            self.check(&mut run, last, &expected, &actual);
        }
        self.conclude(run)
    }

    /// Writes spread over several queue ids are kept in flight together; each
    /// queue must complete in submission order and every block must read
    /// back as written.
    pub fn test_concurrent_access(&self) -> ReliabilityResult {
        let mut run = self.begin(
            "concurrent_access",
            "queued writes across several queues, per-queue ordering and read-back",
        );
        let Some(region) = self.region(&mut run) else {
            return self.conclude(run);
        };
        let bs = self.block_bytes() as u64;
        let queues = self.config.concurrent_queues.max(1);
        let per_req = (self.config.chunk_blocks as u64).min(4).max(1);
        let lbas: Vec<u64> = (region.start..(region.end() + 1).saturating_sub(per_req)).step_by(per_req as usize).collect();
        let mut requests = Vec::with_capacity(lbas.len());
        for (i, &lba) in lbas.iter().enumerate() {
            match self.pattern_buf(per_req, &Pattern::Address { base: lba * bs }) {
                Ok(buf) => requests.push(IoRequest::new(lba, per_req as u32, buf).on_queue(i as u32 % queues)),
                Err(e) => {
                    run.result.error(format!("buffer allocation failed: {}", e));
                    return self.conclude(run);
                }
            }
        }

        let total = requests.len();
        let mut pending = requests.into_iter();
        let mut last_seen: HashMap<u32, u64> = HashMap::new();
        let mut done = 0usize;
        let mut exhausted = false;
        while done < total {
            while !exhausted && self.engine.outstanding() < self.engine.queue_depth() {
                if self.should_stop(&mut run) {
                    exhausted = true;
                    break;
                }
                let Some(req) = pending.next() else {
                    exhausted = true;
                    break;
                };
                if let Err(rejected) = self.engine.async_write(req) {
                    run.result.error(format!(
                        "write at LBA {} rejected: {}",
                        rejected.request.lba, rejected.error
                    ));
                    done += 1;
                }
            }
            if exhausted && self.engine.outstanding() == 0 {
                break;
            }
            for c in self.engine.wait_for_completions(0) {
                done += 1;
                if let Some(prev) = last_seen.insert(c.queue_id, c.id) {
                    if prev > c.id {
                        run.result.error(format!(
                            "queue {} completed request {} after {}",
                            c.queue_id, c.id, prev
                        ));
                    }
                }
                if !c.result.success {
                    run.result.error(format!("queued write at LBA {} failed: {}", c.lba, super::describe(&c.result)));
                }
            }
            run.progress.update(0.5 * done as f64 / total.max(1) as f64);
        }

        let reads: Vec<IoRequest> = lbas
            .iter()
            .filter_map(|&lba| {
                let buf = self.pattern_buf(per_req, &Pattern::Checkerboard).ok()?;
                Some(IoRequest::new(lba, per_req as u32, buf))
            })
            .collect();
        for c in self.engine.batch_read(reads) {
            if !c.result.success {
                run.result.error(format!("read-back at LBA {} failed: {}", c.lba, super::describe(&c.result)));
                continue;
            }
            let expected: AlignedBuf = match self.pattern_buf(per_req, &Pattern::Address { base: c.lba * bs }) {
                Ok(b) => b,
                Err(_) => continue,
            };
            self.check(&mut run, c.lba, &expected, &c.buffer);
        }
        run.result.note(format!("{} requests over {} queues", total, queues));
        self.conclude(run)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use crate::device::{BlockDevice, SimDevice};

    #[test]
    fn out_of_range_is_refused_and_last_block_survives() {
        let (t, dev) = harness_on(SimDevice::new(512, 64), small());
        let r = t.test_boundary_conditions();
        assert!(r.passed, "{:?}", r.error_details);
        let mut last = [0u8; 512];
        dev.lock().read_blocks(63, 1, &mut last).unwrap();
        assert_eq!(&last[..8], &(63u64 * 512).to_le_bytes());
    }

    #[test]
    fn maximum_lba_round_trip() {
        let t = harness();
        let r = t.test_maximum_lba_access();
        assert!(r.passed, "{:?}", r.error_details);
    }

    #[test]
    fn concurrent_queues_stay_ordered() {
        let t = harness();
        let r = t.test_concurrent_access();
        assert!(r.passed, "{:?}", r.error_details);
        assert!(r.error_details.iter().any(|d| d == "32 requests over 4 queues"));
    }
}
