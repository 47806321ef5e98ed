//! Packet and bit error injection with majority-vote recovery.
//!
//! A SCO packet may be sent `packet_number` times. Each copy is lost with
//! probability `per`%, and each bit of a surviving copy flips with
//! probability `ber`%. The receiver rebuilds one packet by majority vote
//! over the survivors.
//!
//! # Determinism
//!
//! All randomness comes from a seeded ChaCha8 RNG. Given the same seed
//! and inputs, outputs are bit-identical.

use crate::bitio::{bits_to_bytes, bytes_to_bits, count_ones};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

/// What the receiver made of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reception {
    /// At least one copy arrived and none had bit errors
    Ok,
    /// At least one surviving copy had bit errors
    CrcError,
    /// Every copy was lost
    NothingReceived,
}

/// Result of pushing one packet through the error model.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorOutcome {
    /// Reconstructed bytes
    pub data: Vec<u8>,
    /// Surviving copies as received, bit by bit
    pub packets: Vec<Vec<bool>>,
    /// OR of the per-copy error masks
    pub bit_error: Vec<bool>,
}

impl ErrorOutcome {
    pub fn survivors(&self) -> usize {
        self.packets.len()
    }

    /// Number of bit positions that saw an error in any copy.
    pub fn error_bits(&self) -> usize {
        count_ones(&self.bit_error)
    }

    pub fn has_bit_errors(&self) -> bool {
        self.bit_error.iter().any(|&b| b)
    }

    pub fn reception(&self) -> Reception {
        if self.packets.is_empty() {
            Reception::NothingReceived
        } else if self.has_bit_errors() {
            Reception::CrcError
        } else {
            Reception::Ok
        }
    }
}

/// Seeded PER/BER error model.
#[derive(Debug, Clone)]
pub struct ErrorModel {
    seed: u64,
    rng: ChaCha8Rng,
}

impl ErrorModel {
    /// Create a model. A missing seed is drawn from entropy and logged so the
    /// run can be reproduced.
    pub fn new(seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| u64::from(rand::thread_rng().gen::<u32>()));
        info!(seed, "random with seed");
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform draw in `[0, 100)`.
    pub fn draw_percent(&mut self) -> f64 {
        self.rng.gen::<f64>() * 100.0
    }

    /// Send `data` as `packet_number` copies through a lossy channel and
    /// rebuild it on the receiving side.
    pub fn insert_error(&mut self, data: &[u8], packet_number: u32, per: f64, ber: f64) -> ErrorOutcome {
        let bits = bytes_to_bits(data);
        let mut bit_error = vec![false; bits.len()];
        let mut packets = Vec::with_capacity(packet_number as usize);

        for _ in 0..packet_number {
            if self.draw_percent() < per {
                continue;
            }

            let mut copy = bits.clone();
            for (bit, error) in copy.iter_mut().zip(bit_error.iter_mut()) {
                if self.draw_percent() < ber {
                    *bit = !*bit;
                    *error = true;
                }
            }
            packets.push(copy);
        }

        let voted = majority_vote(&packets, bits.len(), &mut self.rng);
        ErrorOutcome {
            data: bits_to_bytes(&voted),
            packets,
            bit_error,
        }
    }
}

/// Rebuild one bit sequence of length `len` from several copies.
///
/// - no copies: all zeros
/// - one copy: that copy verbatim
/// - several: per-bit majority, ties broken by a uniform random bit
pub fn majority_vote<R: Rng>(packets: &[Vec<bool>], len: usize, rng: &mut R) -> Vec<bool> {
    match packets {
        [] => vec![false; len],
        [only] => only.clone(),
        _ => (0..len)
            .map(|i| {
                let ones = packets.iter().filter(|p| p.get(i).copied().unwrap_or(false)).count();
                let zeros = packets.len() - ones;
                match ones.cmp(&zeros) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => rng.gen::<bool>(),
                }
            })
            .collect(),
    }
}
