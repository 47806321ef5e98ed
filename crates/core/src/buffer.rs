//! Ring buffer accounting for virtual device buffers.
//!
//! Offsets and capacity are in native device words. One slot is always kept
//! free so that `read == write` unambiguously means "empty".

/// Used and free space of a ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub used: usize,
    pub free: usize,
}

/// Compute used/free counts for a ring buffer.
///
/// # Arguments
/// - `read`: consumer offset
/// - `write`: producer offset
/// - `size`: capacity in device words
/// - `width`: device word width in bits; results are rescaled by `width / 32`
pub fn buffer_stats(read: usize, write: usize, size: usize, width: u32) -> BufferStats {
    let used = if write >= read {
        write - read
    } else {
        size - (read - write)
    };
    let free = size.saturating_sub(used + 1);

    BufferStats {
        used: rescale(used, width),
        free: rescale(free, width),
    }
}

fn rescale(words: usize, width: u32) -> usize {
    words * width as usize / 32
}
