//! Deterministic data patterns and byte-level verification.
//!
//! Every generator is a pure function of the buffer length and its
//! parameters, so a verifier can regenerate exactly what was written.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// `0x01, 0x02, 0x04 ... 0x80` repeating.
    WalkingOnes,
    /// `0xFE, 0xFD, 0xFB ... 0x7F` repeating.
    WalkingZeros,
    /// `0xAA, 0x55` repeating.
    Checkerboard,
    /// Seeded pseudo-random bytes.
    Random { seed: u64 },
    /// Each 8-byte word holds its own byte address (`base + offset`), little endian.
    Address { base: u64 },
}

impl Pattern {
    pub fn name(&self) -> &'static str {
        match self {
            Pattern::WalkingOnes => "walking_ones",
            Pattern::WalkingZeros => "walking_zeros",
            Pattern::Checkerboard => "checkerboard",
            Pattern::Random { .. } => "random",
            Pattern::Address { .. } => "address",
        }
    }

    /// The five generators, in a fixed order.
    pub fn all(seed: u64, base: u64) -> [Pattern; 5] {
        [
            Pattern::WalkingOnes,
            Pattern::WalkingZeros,
            Pattern::Checkerboard,
            Pattern::Random { seed },
            Pattern::Address { base },
        ]
    }

    pub fn fill(&self, buf: &mut [u8]) {
        match *self {
            Pattern::WalkingOnes => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = 1u8 << (i % 8);
                }
            }
            Pattern::WalkingZeros => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = !(1u8 << (i % 8));
                }
            }
            Pattern::Checkerboard => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = if i % 2 == 0 { 0xAA } else { 0x55 };
                }
            }
            Pattern::Random { seed } => StdRng::seed_from_u64(seed).fill_bytes(buf),
            Pattern::Address { base } => {
                for (i, chunk) in buf.chunks_mut(8).enumerate() {
                    let word = base.wrapping_add(i as u64 * 8).to_le_bytes();
                    chunk.copy_from_slice(&word[..chunk.len()]);
                }
            }
        }
    }

    pub fn generate(&self, size: usize) -> Vec<u8> {
        let mut v = vec![0u8; size];
        self.fill(&mut v);
        v
    }
}

/// Outcome of comparing one written buffer against what was read back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorStatistics {
    /// Differing bits across all mismatched bytes.
    pub bit_errors: usize,
    pub byte_errors: usize,
    /// Blocks with at least one differing byte.
    pub block_errors: usize,
    /// Byte offsets of every mismatch, ascending.
    pub error_positions: Vec<usize>,
    pub bytes_compared: usize,
}

impl ErrorStatistics {
    pub fn is_clean(&self) -> bool {
        self.byte_errors == 0
    }

    /// Corrupted bytes over bytes compared; `0.0` when nothing was compared.
    pub fn error_rate(&self) -> f64 {
        if self.bytes_compared == 0 {
            return 0.0;
        }
        self.byte_errors as f64 / self.bytes_compared as f64
    }

    /// Folds `other` in, shifting its positions by `offset` bytes.
    pub fn merge(&mut self, other: &ErrorStatistics, offset: usize) {
        self.bit_errors += other.bit_errors;
        self.byte_errors += other.byte_errors;
        self.block_errors += other.block_errors;
        self.bytes_compared += other.bytes_compared;
        self.error_positions.extend(other.error_positions.iter().map(|p| p + offset));
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Byte-compares `actual` against `expected`. Bytes missing from the shorter
/// side count as fully corrupted.
pub fn compare(expected: &[u8], actual: &[u8], block_size: usize) -> ErrorStatistics {
    let block_size = block_size.max(1);
    let len = expected.len().max(actual.len());
    let mut stats = ErrorStatistics { bytes_compared: len, ..Default::default() };
    let mut last_block = None;
    for i in 0..len {
        let diff = match (expected.get(i), actual.get(i)) {
            (Some(e), Some(a)) => e ^ a,
            _ => 0xFF,
        };
        if diff == 0 {
            continue;
        }
        stats.byte_errors += 1;
        stats.bit_errors += diff.count_ones() as usize;
        stats.error_positions.push(i);
        let block = i / block_size;
        if last_block != Some(block) {
            stats.block_errors += 1;
            last_block = Some(block);
        }
    }
    stats
}

/// Regenerates `pattern` for `actual.len()` bytes and compares.
pub fn verify(pattern: &Pattern, actual: &[u8], block_size: usize) -> ErrorStatistics {
    compare(&pattern.generate(actual.len()), actual, block_size)
}
