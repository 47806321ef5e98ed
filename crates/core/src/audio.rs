//! Audio file collaborators.
//!
//! File-backed streams read their samples through [`AudioSource`] and write
//! what they received with [`write_audio`]. Three sources exist:
//! - [`AudioClip`]: in-memory samples, optionally with packet boundaries
//! - [`WavFile`]: a WAV file decoded with `hound`
//! - [`RawFile`]: headerless PCM; rate and width must be supplied
//!
//! Samples are kept per channel as plain integers. 16-bit audio is signed;
//! 8-bit audio keeps whatever byte value the file holds.

use crate::error::{AudioError, ConfigError, Result};
use crate::packetiser::PacketInfo;
use crate::{bitio, Sample};
use std::path::Path;
use tracing::info;

/// Read access to the audio channels of one file or clip.
pub trait AudioSource {
    /// Number of channels.
    fn get_audio_stream_num(&self) -> usize;

    /// Sample rate of a channel, if the format records one.
    fn get_audio_stream_sample_rate(&self, channel: usize) -> Option<f64>;

    /// Sample width in bits of a channel, if the format records one.
    fn get_audio_stream_sample_width(&self, channel: usize) -> Option<u32>;

    /// All samples of a channel.
    fn get_audio_stream_data(&self, channel: usize) -> Result<Vec<Sample>>;

    /// Recorded packet boundaries of a channel, for packet-based streaming.
    fn get_packet_info(&self, _channel: usize) -> Option<Vec<PacketInfo>> {
        None
    }
}

/// Format details a caller can supply for formats that lack a header.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AudioHints {
    pub channels: usize,
    pub sample_rate: Option<f64>,
    pub sample_width: Option<u32>,
}

/// In-memory audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    sample_rate: f64,
    sample_width: u32,
    channels: Vec<Vec<Sample>>,
    packets: Option<Vec<PacketInfo>>,
}

impl AudioClip {
    /// Single-channel clip.
    pub fn mono(sample_rate: f64, sample_width: u32, data: Vec<Sample>) -> Self {
        Self {
            sample_rate,
            sample_width,
            channels: vec![data],
            packets: None,
        }
    }

    /// Clip with one sample vector per channel.
    pub fn multi(sample_rate: f64, sample_width: u32, channels: Vec<Vec<Sample>>) -> Self {
        Self {
            sample_rate,
            sample_width,
            channels,
            packets: None,
        }
    }

    /// Attach packet boundaries, applied to every channel.
    pub fn with_packets(mut self, packets: Vec<PacketInfo>) -> Self {
        self.packets = Some(packets);
        self
    }

    fn channel(&self, channel: usize) -> Result<&[Sample]> {
        self.channels
            .get(channel)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                AudioError::ChannelOutOfRange {
                    channel,
                    channels: self.channels.len(),
                }
                .into()
            })
    }
}

impl AudioSource for AudioClip {
    fn get_audio_stream_num(&self) -> usize {
        self.channels.len()
    }

    fn get_audio_stream_sample_rate(&self, _channel: usize) -> Option<f64> {
        Some(self.sample_rate)
    }

    fn get_audio_stream_sample_width(&self, _channel: usize) -> Option<u32> {
        Some(self.sample_width)
    }

    fn get_audio_stream_data(&self, channel: usize) -> Result<Vec<Sample>> {
        self.channel(channel).map(<[Sample]>::to_vec)
    }

    fn get_packet_info(&self, channel: usize) -> Option<Vec<PacketInfo>> {
        if channel < self.channels.len() {
            self.packets.clone()
        } else {
            None
        }
    }
}

/// WAV file decoded into memory.
#[derive(Debug, Clone)]
pub struct WavFile {
    spec: hound::WavSpec,
    channels: Vec<Vec<Sample>>,
}

impl WavFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = hound::WavReader::open(path.as_ref()).map_err(AudioError::from)?;
        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int {
            return Err(AudioError::UnsupportedWidth(u32::from(spec.bits_per_sample)).into());
        }

        let interleaved = reader
            .samples::<i32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(AudioError::from)?;

        Ok(Self {
            spec,
            channels: deinterleave(&interleaved, usize::from(spec.channels)),
        })
    }
}

impl AudioSource for WavFile {
    fn get_audio_stream_num(&self) -> usize {
        self.channels.len()
    }

    fn get_audio_stream_sample_rate(&self, _channel: usize) -> Option<f64> {
        Some(f64::from(self.spec.sample_rate))
    }

    fn get_audio_stream_sample_width(&self, _channel: usize) -> Option<u32> {
        Some(u32::from(self.spec.bits_per_sample))
    }

    fn get_audio_stream_data(&self, channel: usize) -> Result<Vec<Sample>> {
        self.channels.get(channel).cloned().ok_or_else(|| {
            AudioError::ChannelOutOfRange {
                channel,
                channels: self.channels.len(),
            }
            .into()
        })
    }
}

/// Headerless PCM: interleaved little-endian 16-bit or unsigned 8-bit.
#[derive(Debug, Clone)]
pub struct RawFile {
    sample_rate: Option<f64>,
    sample_width: u32,
    channels: Vec<Vec<Sample>>,
}

impl RawFile {
    /// Read a raw file.
    ///
    /// # Errors
    /// - `ConfigError::MissingKey("sample_width")` if no width is supplied
    /// - `AudioError::UnsupportedWidth` for widths other than 8 and 16
    pub fn open(path: impl AsRef<Path>, hints: AudioHints) -> Result<Self> {
        let sample_width = hints.sample_width.ok_or_else(|| ConfigError::MissingKey {
            key: "sample_width".to_string(),
        })?;
        let bytes = std::fs::read(path.as_ref()).map_err(AudioError::from)?;

        let interleaved = match sample_width {
            8 => bitio::octets_to_samples(&bytes),
            16 => bitio::bytes_to_samples(&bytes),
            other => return Err(AudioError::UnsupportedWidth(other).into()),
        };

        Ok(Self {
            sample_rate: hints.sample_rate,
            sample_width,
            channels: deinterleave(&interleaved, hints.channels.max(1)),
        })
    }
}

impl AudioSource for RawFile {
    fn get_audio_stream_num(&self) -> usize {
        self.channels.len()
    }

    fn get_audio_stream_sample_rate(&self, _channel: usize) -> Option<f64> {
        self.sample_rate
    }

    fn get_audio_stream_sample_width(&self, _channel: usize) -> Option<u32> {
        Some(self.sample_width)
    }

    fn get_audio_stream_data(&self, channel: usize) -> Result<Vec<Sample>> {
        self.channels.get(channel).cloned().ok_or_else(|| {
            AudioError::ChannelOutOfRange {
                channel,
                channels: self.channels.len(),
            }
            .into()
        })
    }
}

fn deinterleave(interleaved: &[Sample], channels: usize) -> Vec<Vec<Sample>> {
    let channels = channels.max(1);
    let mut out = vec![Vec::with_capacity(interleaved.len() / channels); channels];
    for frame in interleaved.chunks(channels) {
        for (ch, &sample) in frame.iter().enumerate() {
            out[ch].push(sample);
        }
    }
    out
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav"))
}

/// Open an audio file, choosing the reader from the extension.
///
/// `.wav` files are decoded with `hound`; anything else is raw PCM and
/// needs `hints.sample_width`.
pub fn open_audio(path: impl AsRef<Path>, hints: AudioHints) -> Result<Box<dyn AudioSource>> {
    let path = path.as_ref();
    if is_wav(path) {
        Ok(Box::new(WavFile::open(path)?))
    } else {
        Ok(Box::new(RawFile::open(path, hints)?))
    }
}

/// Write mono samples to a WAV or raw file, choosing by extension.
pub fn write_audio(
    path: impl AsRef<Path>,
    sample_rate: f64,
    sample_width: u32,
    data: &[Sample],
) -> Result<()> {
    let path = path.as_ref();
    if sample_width != 8 && sample_width != 16 {
        return Err(AudioError::UnsupportedWidth(sample_width).into());
    }
    info!(path = %path.display(), samples = data.len(), "writing audio file");

    if is_wav(path) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: sample_rate.round() as u32,
            bits_per_sample: sample_width as u16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).map_err(AudioError::from)?;
        for &sample in data {
            if sample_width == 16 {
                writer.write_sample(sample as i16).map_err(AudioError::from)?;
            } else {
                writer.write_sample(sample as i8).map_err(AudioError::from)?;
            }
        }
        writer.finalize().map_err(AudioError::from)?;
    } else {
        let bytes = if sample_width == 16 {
            bitio::samples_to_bytes(data)
        } else {
            bitio::samples_to_octets(data)
        };
        std::fs::write(path, bytes).map_err(AudioError::from)?;
    }
    Ok(())
}
