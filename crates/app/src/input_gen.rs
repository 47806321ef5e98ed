//! Test audio generation.
//!
//! When no input file is given we synthesise a tone with a little noise, so
//! that both bit errors (noise-like clicks) and lost packets (gaps in the
//! tone) are easy to spot in the received audio.
//!
//! # Design
//!
//! - A 1 kHz sine at half of full scale
//! - Uniform noise of about 1% of full scale on top
//! - Optionally, random packet boundaries (10-60 samples) so the source
//!   plays recorded packets instead of fixed slices

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use scosim_core::audio::AudioClip;
use scosim_core::packetiser::PacketInfo;
use scosim_core::Sample;

const TONE_HZ: f64 = 1000.0;

/// Generate a noisy tone.
///
/// # Arguments
/// - `seed`: random seed for determinism
/// - `sample_rate`: in Hz
/// - `sample_width`: 8 or 16 bits; sets the full scale
/// - `seconds`: length
pub fn generate_tone(seed: u64, sample_rate: f64, sample_width: u32, seconds: f64) -> Vec<Sample> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let full_scale: f64 = if sample_width == 8 { 127.0 } else { 32767.0 };
    let noise = (full_scale / 100.0).max(1.0);
    let count = (sample_rate * seconds).max(0.0) as usize;

    (0..count)
        .map(|n| {
            let t = n as f64 / sample_rate;
            let tone = 0.5 * full_scale * (2.0 * std::f64::consts::PI * TONE_HZ * t).sin();
            let value = tone + rng.gen_range(-noise..=noise);
            value.round().clamp(-full_scale - 1.0, full_scale) as Sample
        })
        .collect()
}

/// Cut `total` samples into packets of 10-60 samples.
pub fn packet_boundaries(seed: u64, total: usize) -> Vec<PacketInfo> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(1));
    let mut packets = Vec::new();
    let mut offset = 0;
    while offset < total {
        let length = rng.gen_range(10..=60).min(total - offset);
        packets.push(PacketInfo::new(offset, length));
        offset += length;
    }
    packets
}

/// Build the in-memory clip the runner plays.
pub fn generate_clip(seed: u64, sample_rate: f64, sample_width: u32, seconds: f64, packetised: bool) -> AudioClip {
    let data = generate_tone(seed, sample_rate, sample_width, seconds);
    let total = data.len();
    let clip = AudioClip::mono(sample_rate, sample_width, data);
    if packetised {
        clip.with_packets(packet_boundaries(seed, total))
    } else {
        clip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scosim_core::audio::AudioSource;

    #[test]
    fn test_generate_tone_length() {
        assert_eq!(generate_tone(42, 8000.0, 16, 0.5).len(), 4000);
        assert!(generate_tone(42, 8000.0, 16, 0.0).is_empty());
    }

    #[test]
    fn test_determinism() {
        assert_eq!(generate_tone(12345, 8000.0, 16, 0.1), generate_tone(12345, 8000.0, 16, 0.1));
        assert_ne!(generate_tone(1, 8000.0, 16, 0.1), generate_tone(2, 8000.0, 16, 0.1));
    }

    #[test]
    fn test_eight_bit_range() {
        let tone = generate_tone(3, 8000.0, 8, 0.1);
        assert!(tone.iter().all(|&s| (-128..=127).contains(&s)));
    }

    #[test]
    fn test_packets_cover_everything() {
        for total in [0, 1, 59, 1000] {
            let packets = packet_boundaries(9, total);
            let covered: usize = packets.iter().map(|p| p.length).sum();
            assert_eq!(covered, total);
            assert!(packets.iter().all(|p| p.length <= 60));
        }
    }

    #[test]
    fn test_clip_carries_packets() {
        let clip = generate_clip(5, 8000.0, 16, 0.05, true);
        assert!(clip.get_packet_info(0).is_some());
        let clip = generate_clip(5, 8000.0, 16, 0.05, false);
        assert!(clip.get_packet_info(0).is_none());
    }
}
