//! Bit-level and sample-level conversions for link packets.
//!
//! The error model works on individual bits. Bytes are expanded LSB-first:
//! bit 0 of byte 0 is the first bit of the sequence, bit 7 of byte 0 the
//! eighth.
//!
//! 16-bit audio travels over the link as little-endian byte pairs, so this
//! module also packs samples to bytes and back.
//!
//! # Example
//! ```
//! use scosim_core::bitio::{bits_to_bytes, bytes_to_bits};
//!
//! let bits = bytes_to_bits(&[0b0000_0101]);
//! assert_eq!(&bits[..3], &[true, false, true]);
//! assert_eq!(bits_to_bytes(&bits), vec![0b0000_0101]);
//! ```

use crate::Sample;

/// Expand bytes into bits, LSB-first within each byte.
pub fn bytes_to_bits(bytes: &[u8]) -> Vec<bool> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);
    for &byte in bytes {
        for shift in 0..8 {
            bits.push((byte >> shift) & 1 == 1);
        }
    }
    bits
}

/// Contract bits back into bytes, LSB-first within each byte.
///
/// A trailing partial byte is padded with zero bits.
pub fn bits_to_bytes(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (shift, &bit)| acc | (u8::from(bit) << shift))
        })
        .collect()
}

/// Number of set bits in a bit sequence.
pub fn count_ones(bits: &[bool]) -> usize {
    bits.iter().filter(|&&bit| bit).count()
}

/// Pack signed 16-bit samples into little-endian bytes.
///
/// Values outside the i16 range are truncated to their low 16 bits.
pub fn samples_to_bytes(samples: &[Sample]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&(sample as i16).to_le_bytes());
    }
    bytes
}

/// Unpack little-endian bytes into signed 16-bit samples.
///
/// An odd trailing byte is completed with a zero high byte.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<Sample> {
    bytes
        .chunks(2)
        .map(|pair| {
            let lo = pair[0];
            let hi = pair.get(1).copied().unwrap_or(0);
            Sample::from(i16::from_le_bytes([lo, hi]))
        })
        .collect()
}

/// Narrow 8-bit samples to bytes.
pub fn samples_to_octets(samples: &[Sample]) -> Vec<u8> {
    samples.iter().map(|&s| s as u8).collect()
}

/// Widen bytes to 8-bit samples.
pub fn octets_to_samples(bytes: &[u8]) -> Vec<Sample> {
    bytes.iter().map(|&b| Sample::from(b)).collect()
}
