//! SCO packet metadata formats.
//!
//! # Standard
//!
//! Five little-endian u16 words in front of the payload:
//!
//! ```text
//! +-----------+--------------+----------------+--------+----------+---------+
//! | sync (2B) | length (2B)  | payload_len(2B)| status | bt_clock | payload |
//! |  0x5C5C   | 5 (words)    | bytes          |  (2B)  |   (2B)   |         |
//! +-----------+--------------+----------------+--------+----------+---------+
//! ```
//!
//! # Zeagle
//!
//! A Standard header with status 4 whose length covers everything after it,
//! then the payload, the weak header word and the byte-packed bit-error mask:
//!
//! ```text
//! +-------------------------------+---------+------------------+------------+
//! | standard header, status 4     | payload | weak header (2B) | mask       |
//! | payload_len = 2 * payload + 2 |         |                  | (payload)  |
//! +-------------------------------+---------+------------------+------------+
//! weak header = (error_bit_count & 0x3FFF) | status << 14
//! ```
//!
//! The mask has one bit per payload bit, so it is as long as the payload.

use crate::bitio::bits_to_bytes;
use crate::Sample;
use serde::{Deserialize, Serialize};

/// Sync word opening every Standard header.
pub const SYNC_WORD: u16 = 0x5C5C;

/// Standard header length in 16-bit words.
pub const STANDARD_HEADER_WORDS: u16 = 5;

/// Standard header length in bytes.
pub const STANDARD_HEADER_BYTES: usize = 10;

/// Weak header length in bytes.
pub const WEAK_HEADER_BYTES: usize = 2;

const WEAK_HEADER_COUNT_MASK: u16 = 0x3FFF;
const WEAK_HEADER_STATUS_SHIFT: u16 = 14;

/// Which header a link prepends to its packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataFormat {
    #[default]
    Standard,
    Zeagle,
}

/// Status field of a Standard header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum StandardStatus {
    Ok = 0,
    CrcError = 1,
    NothingReceived = 2,
    NeverScheduled = 3,
    Zeagle = 4,
}

/// Status field of a Zeagle weak header (two bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ZeagleStatus {
    Ok = 0,
    OneBadCrc = 1,
    MultipleBadCrc = 2,
    PacketLost = 3,
}

impl ZeagleStatus {
    /// Classify a reception from the number of surviving copies and whether
    /// any of them had bit errors.
    pub fn classify(survivors: usize, has_bit_errors: bool) -> Self {
        match (survivors, has_bit_errors) {
            (0, _) => ZeagleStatus::PacketLost,
            (_, false) => ZeagleStatus::Ok,
            (1, true) => ZeagleStatus::OneBadCrc,
            (_, true) => ZeagleStatus::MultipleBadCrc,
        }
    }
}

/// A decoded Standard header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardHeader {
    pub sync_word: u16,
    pub length_words: u16,
    /// Payload length in bytes
    pub payload_length: u16,
    pub status: u16,
    pub bt_clock: u16,
}

impl StandardHeader {
    pub fn new(payload_length: usize, status: StandardStatus, bt_clock: u16) -> Self {
        Self {
            sync_word: SYNC_WORD,
            length_words: STANDARD_HEADER_WORDS,
            payload_length: payload_length as u16,
            status: status as u16,
            bt_clock,
        }
    }

    fn words(&self) -> [u16; 5] {
        [
            self.sync_word,
            self.length_words,
            self.payload_length,
            self.status,
            self.bt_clock,
        ]
    }

    /// Serialize as ten little-endian bytes.
    pub fn to_bytes(&self) -> [u8; STANDARD_HEADER_BYTES] {
        let mut out = [0u8; STANDARD_HEADER_BYTES];
        for (chunk, word) in out.chunks_exact_mut(2).zip(self.words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Parse from the first ten bytes of `bytes`.
    ///
    /// # Returns
    /// `None` if fewer than ten bytes are available.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let header = bytes.get(..STANDARD_HEADER_BYTES)?;
        let word = |i: usize| u16::from_le_bytes([header[2 * i], header[2 * i + 1]]);
        Some(Self::from_words_array([word(0), word(1), word(2), word(3), word(4)]))
    }

    /// Parse from the first five 16-bit samples of a received packet.
    pub fn from_samples(samples: &[Sample]) -> Option<Self> {
        let header = samples.get(..usize::from(STANDARD_HEADER_WORDS))?;
        let word = |i: usize| header[i] as u16;
        Some(Self::from_words_array([word(0), word(1), word(2), word(3), word(4)]))
    }

    fn from_words_array(words: [u16; 5]) -> Self {
        Self {
            sync_word: words[0],
            length_words: words[1],
            payload_length: words[2],
            status: words[3],
            bt_clock: words[4],
        }
    }
}

/// Weak header word of a Zeagle packet.
pub fn weak_header(error_bit_count: usize, status: ZeagleStatus) -> u16 {
    (error_bit_count as u16 & WEAK_HEADER_COUNT_MASK) | ((status as u16) << WEAK_HEADER_STATUS_SHIFT)
}

/// Build a Standard packet: header then payload.
pub fn encode_standard(payload: &[u8], status: StandardStatus, bt_clock: u16) -> Vec<u8> {
    let header = StandardHeader::new(payload.len(), status, bt_clock);
    let mut out = Vec::with_capacity(STANDARD_HEADER_BYTES + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    out
}

/// Build a Zeagle packet: Standard header (status 4), payload, weak header,
/// mask.
pub fn encode_zeagle(payload: &[u8], status: ZeagleStatus, bit_error: &[bool], bt_clock: u16) -> Vec<u8> {
    let error_bits = bit_error.iter().filter(|&&b| b).count();
    let mask = bits_to_bytes(bit_error);
    // declared length counts the payload, the weak header and a payload-sized mask
    let declared = 2 * payload.len() + WEAK_HEADER_BYTES;
    let header = StandardHeader::new(declared, StandardStatus::Zeagle, bt_clock);

    let mut out = Vec::with_capacity(STANDARD_HEADER_BYTES + payload.len() + WEAK_HEADER_BYTES + mask.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&weak_header(error_bits, status).to_le_bytes());
    out.extend_from_slice(&mask);
    out
}
