//! Packet-based streaming of audio that carries its own framing.
//!
//! Some audio sources record where each over-the-air packet starts and how
//! long it is. For those, the link stream sends exactly one recorded packet
//! per transmit slot instead of slicing fixed-size chunks.

use crate::Sample;

/// Boundary of one packet inside a flat sample buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    /// First sample of the packet
    pub offset: usize,
    /// Number of samples in the packet
    pub length: usize,
}

impl PacketInfo {
    pub fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }
}

/// Yields packets from a sample buffer following recorded boundaries.
///
/// # Invariants
/// - `cursor <= boundaries.len()`
/// - Boundaries reaching past the end of `data` are clipped, never panic
#[derive(Debug, Clone)]
pub struct Packetiser {
    data: Vec<Sample>,
    boundaries: Vec<PacketInfo>,
    cursor: usize,
}

impl Packetiser {
    pub fn new(data: Vec<Sample>, boundaries: Vec<PacketInfo>) -> Self {
        Self {
            data,
            boundaries,
            cursor: 0,
        }
    }

    /// Return the next packet and advance.
    ///
    /// # Returns
    /// - `Some(samples)` for the next recorded packet
    /// - `None` once every boundary has been consumed (end of file)
    pub fn next_packet(&mut self) -> Option<&[Sample]> {
        let info = *self.boundaries.get(self.cursor)?;
        self.cursor += 1;

        let start = info.offset.min(self.data.len());
        let end = info.offset.saturating_add(info.length).min(self.data.len());
        Some(&self.data[start..end])
    }

    /// Check whether every packet has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.boundaries.len()
    }

    /// Number of packets left to send.
    pub fn remaining(&self) -> usize {
        self.boundaries.len() - self.cursor
    }

    pub fn total_packets(&self) -> usize {
        self.boundaries.len()
    }

    /// Rewind to the first packet. Only the owning stream's start does this.
    pub(crate) fn rewind(&mut self) {
        self.cursor = 0;
    }
}
