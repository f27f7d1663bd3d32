//! Aligned transfer buffers for direct (unbuffered) I/O.

use aligned_vec::{AVec, RuntimeAlign};

use crate::error::{Result, StorageError};

pub const DEFAULT_ALIGNMENT: usize = 512;

/// Heap buffer whose start address is a multiple of its alignment.
pub type AlignedBuf = AVec<u8, RuntimeAlign>;

/// `true` iff the buffer's address is a multiple of `alignment`.
pub fn is_aligned(buffer: &[u8], alignment: usize) -> bool {
    alignment != 0 && (buffer.as_ptr() as usize) % alignment == 0
}

/// Zero-filled buffer of `size` bytes aligned to `alignment` (a power of two).
pub fn allocate_aligned_buffer(size: usize, alignment: usize) -> Result<AlignedBuf> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(StorageError::invalid(format!("alignment {} is not a power of two", alignment)));
    }
    Ok(AlignedBuf::from_iter(alignment, std::iter::repeat(0u8).take(size)))
}

/// Releases a buffer obtained from [`allocate_aligned_buffer`].
pub fn free_aligned_buffer(buffer: AlignedBuf) {
    drop(buffer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_honours_alignment() {
        for align in [512usize, 4096] {
            let b = allocate_aligned_buffer(8192, align).unwrap();
            assert_eq!(b.len(), 8192);
            assert!(is_aligned(&b, align));
            assert!(b.iter().all(|&x| x == 0));
            free_aligned_buffer(b);
        }
    }

    #[test]
    fn offset_slices_are_misaligned() {
        let b = allocate_aligned_buffer(1024, 512).unwrap();
        assert!(is_aligned(&b[..], 512));
        assert!(!is_aligned(&b[1..], 512));
        assert!(is_aligned(&b[1..], 1));
        assert!(!is_aligned(&b, 0));
    }

    #[test]
    fn empty_and_large_buffers() {
        let empty = allocate_aligned_buffer(0, 4096).unwrap();
        assert!(empty.is_empty());
        let big = allocate_aligned_buffer(16 << 20, 4096).unwrap();
        assert_eq!(big.len(), 16 << 20);
        assert!(is_aligned(&big, 4096));
        assert!(big.iter().all(|&x| x == 0));
    }

    #[test]
    fn rejects_bad_alignment() {
        assert!(allocate_aligned_buffer(16, 3).is_err());
        assert!(allocate_aligned_buffer(16, 0).is_err());
    }
}
