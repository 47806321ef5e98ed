//! File-backed streams on a named device endpoint.
//!
//! A source plays an audio file (or in-memory clip) into the endpoint one
//! frame per tick, looping as configured. A sink collects whatever the
//! endpoint holds, frame by frame, and writes it to its file on destroy.

use super::{EofAction, LoopCounter, Operation, Stream, StreamCore, StreamId, StreamState, StreamType};
use crate::audio::AudioHints;
use crate::error::{ConfigError, Result};
use crate::link::LinkStatistics;
use crate::packetiser::Packetiser;
use crate::scheduler::{DriftCorrector, TimerHandle, TimerSlot};
use crate::schema::{self, ConfigMap, ParamDefault, ParamKind, ParamSpec};
use crate::sim::{Notification, SimContext};
use crate::Sample;
use serde::Deserialize;
use tracing::{debug, info};

pub const INTERFACE: &str = "file";

const SPECS: &[ParamSpec] = &[
    ParamSpec::required("filename", ParamKind::any_string()),
    ParamSpec::required("endpoint", ParamKind::any_string()),
    ParamSpec::optional("channels", ParamKind::int_at_least(1)).with_default(ParamDefault::Int(1)),
    ParamSpec::optional("channel", ParamKind::int_at_least(0)).with_default(ParamDefault::Int(0)),
    ParamSpec::optional("sample_rate", ParamKind::number_at_least(0.0)),
    ParamSpec::optional(
        "sample_width",
        ParamKind::IntChoice {
            choices: &[8, 16, 24, 32],
        },
    ),
    ParamSpec::optional("frame_size", ParamKind::int_at_least(1)).with_default(ParamDefault::Int(1)),
    ParamSpec::optional("delay", ParamKind::number_at_least(0.0))
        .with_default(ParamDefault::Number(0.0)),
    ParamSpec::optional("loop", ParamKind::int_at_least(1)).with_default(ParamDefault::Int(1)),
];

#[derive(Debug, Clone, Deserialize)]
struct FileConfig {
    filename: String,
    endpoint: String,
    channels: usize,
    channel: usize,
    sample_rate: Option<f64>,
    sample_width: Option<u32>,
    frame_size: usize,
    delay: f64,
    #[serde(rename = "loop")]
    loops: u32,
}

/// Samples a source plays, either sliced on demand or as recorded packets.
#[derive(Debug, Clone)]
pub(crate) enum SourceAudio {
    Slices { data: Vec<Sample>, sent: usize },
    Packets(Packetiser),
}

impl SourceAudio {
    /// Next chunk of at most `len` samples (or the next recorded packet).
    ///
    /// `None` is end of file.
    pub(crate) fn next_chunk(&mut self, len: usize) -> Option<Vec<Sample>> {
        match self {
            SourceAudio::Slices { data, sent } => {
                if *sent >= data.len() {
                    return None;
                }
                let end = (*sent + len.max(1)).min(data.len());
                let chunk = data[*sent..end].to_vec();
                *sent = end;
                Some(chunk)
            }
            SourceAudio::Packets(packetiser) => packetiser.next_packet().map(<[Sample]>::to_vec),
        }
    }

    pub(crate) fn rewind(&mut self) {
        match self {
            SourceAudio::Slices { sent, .. } => *sent = 0,
            SourceAudio::Packets(packetiser) => packetiser.rewind(),
        }
    }
}

/// Audio of a source after format resolution.
#[derive(Debug, Clone)]
pub(crate) struct LoadedSource {
    pub(crate) audio: SourceAudio,
    pub(crate) sample_rate: f64,
    pub(crate) sample_width: u32,
}

/// Open `filename` and pick one channel.
///
/// A configured sample rate overrides the file's; the sample width always
/// comes from the file when it records one.
pub(crate) fn load_source(
    ctx: &SimContext,
    filename: &str,
    channels: usize,
    channel: usize,
    sample_rate: Option<f64>,
    sample_width: Option<u32>,
) -> Result<LoadedSource> {
    let audio = ctx.load_audio(
        filename,
        AudioHints {
            channels,
            sample_rate,
            sample_width,
        },
    )?;

    let available = audio.get_audio_stream_num();
    if channel >= available {
        return Err(ConfigError::Inconsistent {
            key: "channel".to_string(),
            reason: format!("channels:{} channel:{} inconsistency", available, channel),
        }
        .into());
    }

    let sample_rate = sample_rate
        .or_else(|| audio.get_audio_stream_sample_rate(channel))
        .ok_or_else(|| ConfigError::MissingKey {
            key: "sample_rate".to_string(),
        })?;
    let sample_width = audio
        .get_audio_stream_sample_width(channel)
        .or(sample_width)
        .ok_or_else(|| ConfigError::MissingKey {
            key: "sample_width".to_string(),
        })?;

    let data = audio.get_audio_stream_data(channel)?;
    let audio = match audio.get_packet_info(channel) {
        Some(packets) if !packets.is_empty() => {
            SourceAudio::Packets(Packetiser::new(data, packets))
        }
        _ => SourceAudio::Slices { data, sent: 0 },
    };

    Ok(LoadedSource {
        audio,
        sample_rate,
        sample_width,
    })
}

pub(crate) fn required<T>(value: Option<T>, key: &str) -> std::result::Result<T, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingKey {
        key: key.to_string(),
    })
}

/// File-backed source or sink.
#[derive(Debug)]
pub struct FileStream {
    core: StreamCore,
    cfg: FileConfig,
    sample_rate: f64,
    sample_width: u32,
    source: Option<SourceAudio>,
    captured: Vec<Sample>,
    loops: LoopCounter,
    drift: DriftCorrector,
}

impl FileStream {
    pub fn construct(
        id: StreamId,
        stream_type: StreamType,
        params: &ConfigMap,
        ctx: &SimContext,
    ) -> Result<Box<dyn Stream>> {
        let cfg: FileConfig = schema::parse(SPECS, params)?;

        let (source, sample_rate, sample_width) = match stream_type {
            StreamType::Source => {
                let loaded = load_source(
                    ctx,
                    &cfg.filename,
                    cfg.channels,
                    cfg.channel,
                    cfg.sample_rate,
                    cfg.sample_width,
                )?;
                (Some(loaded.audio), loaded.sample_rate, loaded.sample_width)
            }
            StreamType::Sink => (
                None,
                required(cfg.sample_rate, "sample_rate")?,
                required(cfg.sample_width, "sample_width")?,
            ),
        };
        if sample_rate <= 0.0 {
            return Err(ConfigError::Inconsistent {
                key: "sample_rate".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }

        Ok(Box::new(Self {
            core: StreamCore::new(id, INTERFACE, stream_type),
            loops: LoopCounter::new(cfg.loops),
            cfg,
            sample_rate,
            sample_width,
            source,
            captured: Vec::new(),
            drift: DriftCorrector::new(),
        }))
    }

    fn frame_period(&mut self) -> f64 {
        self.drift
            .next_period(self.cfg.frame_size as f64 / self.sample_rate)
    }

    fn begin_streaming(&mut self, ctx: &mut SimContext) {
        self.drift.reset();
        match self.core.stream_type() {
            StreamType::Source => {
                if let Some(source) = self.source.as_mut() {
                    source.rewind();
                }
                self.core.arm(ctx, TimerSlot::Transmit, 0.0);
            }
            StreamType::Sink => {
                let period = self.frame_period();
                self.core.arm(ctx, TimerSlot::Receive, period);
            }
        }
    }

    fn transmit(&mut self, ctx: &mut SimContext) -> Result<()> {
        let Some(source) = self.source.as_mut() else {
            return Ok(());
        };

        match source.next_chunk(self.cfg.frame_size) {
            Some(chunk) => {
                self.core.insert(ctx, &chunk)?;
                let period = self
                    .drift
                    .next_period(chunk.len().max(1) as f64 / self.sample_rate);
                self.core.arm(ctx, TimerSlot::Transmit, period);
                Ok(())
            }
            None => self.end_of_file(ctx),
        }
    }

    fn receive(&mut self, ctx: &mut SimContext) -> Result<()> {
        let stats = self.core.buffer_stats(ctx)?;
        let frames = stats.used / self.cfg.frame_size;
        if frames > 0 {
            let data = self.core.extract(ctx, frames * self.cfg.frame_size)?;
            debug!(stream = %self.core.id(), samples = data.len(), "file sink received");
            self.captured.extend(data);
        }

        let period = self.frame_period();
        self.core.arm(ctx, TimerSlot::Receive, period);
        Ok(())
    }

    fn end_of_file(&mut self, ctx: &mut SimContext) -> Result<()> {
        match self.loops.on_eof() {
            EofAction::Restart => {
                info!(stream = %self.core.id(), remaining = self.loops.remaining(), "replaying file");
                self.stop(ctx)?;
                self.core.begin(Operation::Start)?;
                self.core.commit(Operation::Start);
                self.begin_streaming(ctx);
            }
            EofAction::Finished => {
                info!(stream = %self.core.id(), filename = %self.cfg.filename, "end of file");
                ctx.notify(Notification::EndOfFile {
                    stream: self.core.id(),
                });
            }
            EofAction::Ignored => {}
        }
        Ok(())
    }
}

impl Stream for FileStream {
    fn id(&self) -> StreamId {
        self.core.id()
    }

    fn interface(&self) -> &'static str {
        self.core.interface()
    }

    fn stream_type(&self) -> StreamType {
        self.core.stream_type()
    }

    fn state(&self) -> StreamState {
        self.core.state()
    }

    fn create(&mut self, ctx: &mut SimContext) -> Result<()> {
        self.core.begin(Operation::Create)?;
        self.core.open(ctx, &self.cfg.endpoint)?;
        self.core.commit(Operation::Create);
        Ok(())
    }

    fn config(&mut self, _ctx: &mut SimContext, params: &ConfigMap) -> Result<()> {
        self.core.begin(Operation::Config)?;
        schema::validate(&[], params)?;
        self.core.commit(Operation::Config);
        Ok(())
    }

    fn start(&mut self, ctx: &mut SimContext) -> Result<()> {
        self.core.begin(Operation::Start)?;
        self.loops.rearm();
        self.core.commit(Operation::Start);

        if self.core.stream_type() == StreamType::Source && self.cfg.delay > 0.0 {
            info!(stream = %self.core.id(), delay = self.cfg.delay, "delaying start");
            self.core.arm(ctx, TimerSlot::Loop, self.cfg.delay);
        } else {
            self.begin_streaming(ctx);
        }
        Ok(())
    }

    fn stop(&mut self, ctx: &mut SimContext) -> Result<()> {
        if !self.core.begin(Operation::Stop)? {
            return Ok(());
        }
        self.core.cancel_all(ctx);
        self.core.commit(Operation::Stop);
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut SimContext) -> Result<()> {
        self.core.begin(Operation::Destroy)?;
        if self.core.stream_type() == StreamType::Sink {
            let data = std::mem::take(&mut self.captured);
            ctx.save_capture(&self.cfg.filename, self.sample_rate, self.sample_width, data)?;
        }
        self.release(ctx)?;
        self.core.commit(Operation::Destroy);
        Ok(())
    }

    fn release(&mut self, ctx: &mut SimContext) -> Result<()> {
        self.core.release(ctx)
    }

    fn on_timer(&mut self, ctx: &mut SimContext, slot: TimerSlot, handle: TimerHandle) -> Result<()> {
        if !self.core.fired(slot, handle) || !self.core.is_started() {
            return Ok(());
        }
        match slot {
            TimerSlot::Loop => {
                self.begin_streaming(ctx);
                Ok(())
            }
            TimerSlot::Transmit => self.transmit(ctx),
            TimerSlot::Receive => self.receive(ctx),
        }
    }

    fn statistics(&self) -> Option<LinkStatistics> {
        None
    }
}
