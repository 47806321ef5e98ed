//! Simulated Bluetooth SCO streams.
//!
//! A SCO link carries one packet every `tesco` timeslots of 625 µs in each
//! direction. A source stream pushes each chunk of its audio through a
//! [`LinkInjector`] (never-scheduled bursts, PER/BER, majority vote,
//! metadata) and writes the result to the link's from-air endpoint. A sink
//! stream polls the to-air endpoint once per packet period, discards backlog,
//! validates the metadata and collects or forwards the payload.
//!
//! # Links
//!
//! A source and a sink may share one link. The first stream creates the link
//! (tag `service_tag`, or 100 plus the number of links so far); a second
//! stream joins it through the `stream` key naming the first stream, or by
//! giving the same `service_tag`. A link never carries two streams of the
//! same type.
//!
//! # Timing
//!
//! The transmit period is `(1e6 + wallclock_accuracy) / 1e6 * 625 µs * tesco`,
//! the receive period `(1e6 + wallclock_accuracy) / 1e6 * data_length /
//! sample_rate`, both drift-corrected to the 1 µs timer resolution. The
//! first transmit fires as soon as the source starts; the first receive one
//! period after the sink starts.

use super::data::forward;
use super::file::{load_source, required, SourceAudio};
use super::{
    Backing, EofAction, LoopCounter, Operation, Stream, StreamCore, StreamId, StreamState, StreamType,
};
use crate::bitio;
use crate::error::{ConfigError, ResourceError, Result};
use crate::link::metadata::{StandardHeader, STANDARD_HEADER_BYTES, SYNC_WORD};
use crate::link::{LinkErrorConfig, LinkInjector, LinkStatistics, MetadataFormat};
use crate::scheduler::{wallclock_scaled, DriftCorrector, TimerHandle, TimerSlot};
use crate::schema::{self, ConfigMap, ParamDefault, ParamKind, ParamSpec};
use crate::sim::{Notification, SimContext};
use crate::transport::{sco_from_air, sco_to_air};
use crate::Sample;
use serde::Deserialize;
use tracing::{debug, info, warn};

pub const INTERFACE: &str = "sco";

/// Platforms the SCO stream is known to work on.
pub const PLATFORMS: &[&str] = &["crescendo", "stre", "streplus", "mora"];

/// Bluetooth baseband timeslot.
pub const TIMESLOT_DURATION: f64 = 625e-6;

/// First automatically assigned service tag.
pub const SERVICE_TAG_BASE: u32 = 100;

const SAMPLE_RATE_DEFAULT: f64 = 8000.0;

/// Samples carried by one packet at `sample_rate` every `tesco` slots.
pub fn packet_samples(sample_rate: f64, tesco: u16) -> usize {
    // slot length in integer microseconds: 8 kHz at tesco 6 must give 30, not 29
    (sample_rate * f64::from(tesco) * 625.0 / 1e6) as usize
}

const FILE_SPECS: &[ParamSpec] = &[
    ParamSpec::required("backing", ParamKind::Str { choices: &["file"] }),
    ParamSpec::required("filename", ParamKind::any_string()),
    ParamSpec::optional("channels", ParamKind::int_at_least(1)).with_default(ParamDefault::Int(1)),
    ParamSpec::optional("channel", ParamKind::int_at_least(0)).with_default(ParamDefault::Int(0)),
    ParamSpec::optional("sample_rate", ParamKind::number_at_least(0.0)),
    ParamSpec::optional("sample_width", ParamKind::IntChoice { choices: &[8, 16] }),
    ParamSpec::optional("frame_size", ParamKind::int_at_least(1)).with_default(ParamDefault::Int(1)),
    ParamSpec::optional("delay", ParamKind::number_at_least(0.0))
        .with_default(ParamDefault::Number(0.0)),
    ParamSpec::optional("loop", ParamKind::int_at_least(1)).with_default(ParamDefault::Int(1)),
];

const DATA_SPECS: &[ParamSpec] = &[
    ParamSpec::required("backing", ParamKind::Str { choices: &["data"] }),
    ParamSpec::optional("sample_rate", ParamKind::number_at_least(0.0)),
    ParamSpec::optional("sample_width", ParamKind::IntChoice { choices: &[8, 16] }),
    ParamSpec::optional("frame_size", ParamKind::int_at_least(1)).with_default(ParamDefault::Int(1)),
    ParamSpec::optional("consume_target", ParamKind::int_at_least(0))
        .nullable()
        .with_default(ParamDefault::Null),
];

const LINK_SPECS: &[ParamSpec] = &[
    ParamSpec::optional("seed", ParamKind::int_at_least(0))
        .nullable()
        .with_default(ParamDefault::Null),
    ParamSpec::optional("packet_number", ParamKind::int_at_least(1))
        .with_default(ParamDefault::Int(1)),
    ParamSpec::optional("per", ParamKind::percent()).with_default(ParamDefault::Number(0.0)),
    ParamSpec::optional("ber", ParamKind::percent()).with_default(ParamDefault::Number(0.0)),
    ParamSpec::optional("crc_error", ParamKind::percent()).with_default(ParamDefault::Number(0.0)),
    ParamSpec::optional("nothing_received_error", ParamKind::percent())
        .with_default(ParamDefault::Number(0.0)),
    ParamSpec::optional("never_scheduled_error", ParamKind::percent())
        .with_default(ParamDefault::Number(0.0)),
    ParamSpec::optional("never_scheduled_error_packets", ParamKind::int_at_least(2))
        .with_default(ParamDefault::Int(2)),
    ParamSpec::optional("data_error", ParamKind::Bool).with_default(ParamDefault::Bool(true)),
    ParamSpec::optional("metadata_enable", ParamKind::Bool).with_default(ParamDefault::Bool(false)),
    ParamSpec::optional(
        "metadata_format",
        ParamKind::Str {
            choices: &["standard", "zeagle"],
        },
    )
    .with_default(ParamDefault::Str("standard")),
    ParamSpec::optional("stream", ParamKind::int_at_least(0))
        .nullable()
        .with_default(ParamDefault::Null),
    ParamSpec::optional("service_tag", ParamKind::int_at_least(0))
        .nullable()
        .with_default(ParamDefault::Null),
    ParamSpec::optional(
        "tesco",
        ParamKind::IntChoice {
            choices: &[2, 4, 6, 8, 10, 12, 14, 16, 18],
        },
    )
    .with_default(ParamDefault::Int(6)),
    ParamSpec::optional("wesco", ParamKind::int_at_least(0)).with_default(ParamDefault::Int(0)),
    ParamSpec::optional("air_packet_length", ParamKind::int_at_least(1))
        .nullable()
        .with_default(ParamDefault::Null),
    ParamSpec::optional("wallclock_accuracy", ParamKind::any_number())
        .with_default(ParamDefault::Number(0.0)),
];

const RUNTIME_SPECS: &[ParamSpec] =
    &[ParamSpec::optional("consume_target", ParamKind::int_at_least(0)).nullable()];

fn default_one() -> u32 {
    1
}

fn default_channels() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
struct ScoConfig {
    backing: Backing,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default = "default_channels")]
    channels: usize,
    #[serde(default)]
    channel: usize,
    sample_rate: Option<f64>,
    sample_width: Option<u32>,
    #[serde(default)]
    delay: f64,
    #[serde(rename = "loop", default = "default_one")]
    loops: u32,
    #[serde(default)]
    consume_target: Option<StreamId>,

    seed: Option<u64>,
    packet_number: u32,
    per: f64,
    ber: f64,
    crc_error: f64,
    nothing_received_error: f64,
    never_scheduled_error: f64,
    never_scheduled_error_packets: u32,
    data_error: bool,
    metadata_enable: bool,
    metadata_format: MetadataFormat,
    stream: Option<StreamId>,
    service_tag: Option<u32>,
    tesco: u16,
    wesco: u16,
    air_packet_length: Option<usize>,
    wallclock_accuracy: f64,
}

impl ScoConfig {
    fn link_errors(&self) -> LinkErrorConfig {
        LinkErrorConfig {
            seed: self.seed,
            packet_number: self.packet_number,
            per: self.per,
            ber: self.ber,
            never_scheduled_error: self.never_scheduled_error,
            never_scheduled_error_packets: self.never_scheduled_error_packets,
            data_error: self.data_error,
            metadata_enable: self.metadata_enable,
            metadata_format: self.metadata_format,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RuntimeConfig {
    #[serde(default)]
    consume_target: Option<StreamId>,
}

/// One simulated SCO connection shared by at most one source and one sink.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoLink {
    pub service_tag: u32,
    /// Link interval in timeslots
    pub tesco: u16,
    /// Retransmission window in timeslots
    pub wesco: u16,
    /// Payload bytes carried per packet
    pub air_packet_length: usize,
    members: Vec<(StreamId, StreamType)>,
}

impl ScoLink {
    pub fn new(service_tag: u32, tesco: u16, wesco: u16, air_packet_length: usize) -> Self {
        Self {
            service_tag,
            tesco,
            wesco,
            air_packet_length,
            members: Vec::new(),
        }
    }

    /// Streams currently attached.
    pub fn members(&self) -> &[(StreamId, StreamType)] {
        &self.members
    }

    pub fn has_member(&self, id: StreamId) -> bool {
        self.members.iter().any(|&(m, _)| m == id)
    }

    /// Check that a stream of `stream_type` may attach.
    pub fn check_join(&self, stream_type: StreamType) -> std::result::Result<(), ConfigError> {
        if self.members.iter().any(|&(_, t)| t == stream_type) {
            return Err(ConfigError::Inconsistent {
                key: "stream".to_string(),
                reason: format!(
                    "trying to start two sco {} streams on link {}",
                    stream_type, self.service_tag
                ),
            });
        }
        Ok(())
    }

    pub fn join(&mut self, id: StreamId, stream_type: StreamType) -> std::result::Result<(), ConfigError> {
        self.check_join(stream_type)?;
        self.members.push((id, stream_type));
        Ok(())
    }

    pub fn leave(&mut self, id: StreamId) {
        self.members.retain(|&(m, _)| m != id);
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// SCO source or sink.
#[derive(Debug)]
pub struct ScoStream {
    core: StreamCore,
    cfg: ScoConfig,
    sample_rate: f64,
    sample_width: u32,
    source: Option<SourceAudio>,
    injector: Option<LinkInjector>,
    captured: Vec<Sample>,
    consume_target: Option<StreamId>,
    loops: LoopCounter,
    drift: DriftCorrector,
    link: Option<ScoLink>,
}

impl ScoStream {
    pub fn construct(
        id: StreamId,
        stream_type: StreamType,
        params: &ConfigMap,
        ctx: &SimContext,
    ) -> Result<Box<dyn Stream>> {
        let backing = schema::discriminant(params, "backing", &["file", "data"])?;
        let specs = match backing {
            "file" => [FILE_SPECS, LINK_SPECS].concat(),
            _ => [DATA_SPECS, LINK_SPECS].concat(),
        };
        let cfg: ScoConfig = schema::parse(&specs, params)?;
        if cfg.crc_error > 0.0 || cfg.nothing_received_error > 0.0 {
            debug!(
                crc_error = cfg.crc_error,
                nothing_received_error = cfg.nothing_received_error,
                "crc_error and nothing_received_error have no effect; use per and ber"
            );
        }

        if stream_type == StreamType::Sink
            && cfg.metadata_enable
            && cfg.metadata_format == MetadataFormat::Zeagle
        {
            return Err(ConfigError::Inconsistent {
                key: "metadata_format".to_string(),
                reason: "sco sinks only parse standard metadata".to_string(),
            }
            .into());
        }

        let (source, sample_rate, sample_width) = match (cfg.backing, stream_type) {
            (Backing::File, StreamType::Source) => {
                let filename = required(cfg.filename.as_deref(), "filename")?;
                let loaded = load_source(
                    ctx,
                    filename,
                    cfg.channels,
                    cfg.channel,
                    cfg.sample_rate,
                    cfg.sample_width,
                )?;
                if loaded.sample_width != 8 && loaded.sample_width != 16 {
                    return Err(ConfigError::InvalidChoice {
                        key: "sample_width".to_string(),
                        value: loaded.sample_width.to_string(),
                        choices: "8|16".to_string(),
                    }
                    .into());
                }
                (Some(loaded.audio), loaded.sample_rate, loaded.sample_width)
            }
            (_, StreamType::Sink) => (
                None,
                required(cfg.sample_rate, "sample_rate")?,
                required(cfg.sample_width, "sample_width")?,
            ),
            (Backing::Data, StreamType::Source) => (
                None,
                cfg.sample_rate.unwrap_or(SAMPLE_RATE_DEFAULT),
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
            consume_target: cfg.consume_target,
            loops: LoopCounter::new(if cfg.backing == Backing::File { cfg.loops } else { 1 }),
            cfg,
            sample_rate,
            sample_width,
            source,
            injector: None,
            captured: Vec::new(),
            drift: DriftCorrector::new(),
            link: None,
        }))
    }

    fn bytes_per_sample(&self) -> usize {
        (self.sample_width / 8).max(1) as usize
    }

    fn tesco(&self) -> u16 {
        self.link.as_ref().map_or(self.cfg.tesco, |l| l.tesco)
    }

    /// Samples per source packet.
    fn payload_samples(&self) -> usize {
        packet_samples(self.sample_rate, self.tesco())
    }

    /// Payload samples per sink packet.
    fn sink_data_length(&self) -> usize {
        let air = self
            .link
            .as_ref()
            .map_or(0, |l| l.air_packet_length);
        air / self.bytes_per_sample()
    }

    /// Metadata words in front of each sink packet.
    fn metadata_length(&self) -> usize {
        if self.cfg.metadata_enable {
            STANDARD_HEADER_BYTES / self.bytes_per_sample()
        } else {
            0
        }
    }

    fn default_air_packet_length(&self) -> usize {
        packet_samples(self.sample_rate, self.cfg.tesco) * self.bytes_per_sample()
    }

    /// Find or make the link this stream attaches to.
    fn resolve_link(&self, ctx: &SimContext) -> Result<ScoLink> {
        let tag = match self.cfg.stream {
            Some(parent) => ctx
                .sco_link_of(parent)
                .ok_or(ResourceError::UnknownInstance(parent.0))?,
            None => self
                .cfg
                .service_tag
                .unwrap_or(SERVICE_TAG_BASE + ctx.sco_link_count() as u32),
        };

        let link = match ctx.sco_link(tag) {
            Some(existing) => existing.clone(),
            None => ScoLink::new(
                tag,
                self.cfg.tesco,
                self.cfg.wesco,
                self.cfg
                    .air_packet_length
                    .unwrap_or_else(|| self.default_air_packet_length()),
            ),
        };
        link.check_join(self.core.stream_type())?;
        Ok(link)
    }

    fn begin_streaming(&mut self, ctx: &mut SimContext) {
        self.drift.reset();
        match self.core.stream_type() {
            StreamType::Source => {
                if let Some(injector) = self.injector.as_mut() {
                    injector.reset();
                }
                if let Some(source) = self.source.as_mut() {
                    source.rewind();
                    self.core.arm(ctx, TimerSlot::Transmit, 0.0);
                }
            }
            StreamType::Sink => {
                let period = self.receive_period();
                self.core.arm(ctx, TimerSlot::Receive, period);
            }
        }
    }

    fn transmit_period(&mut self) -> f64 {
        let nominal = TIMESLOT_DURATION * f64::from(self.tesco());
        self.drift
            .next_period(wallclock_scaled(nominal, self.cfg.wallclock_accuracy))
    }

    fn receive_period(&mut self) -> f64 {
        let nominal = self.sink_data_length() as f64 / self.sample_rate;
        self.drift
            .next_period(wallclock_scaled(nominal, self.cfg.wallclock_accuracy))
    }

    /// Run samples through the link and write what comes out.
    fn send(&mut self, ctx: &mut SimContext, samples: &[Sample]) -> Result<()> {
        let Some(injector) = self.injector.as_mut() else {
            return Ok(());
        };
        let packet = injector.generate_packet(samples, self.sample_width);
        if !packet.is_empty() {
            self.core.insert(ctx, &packet)?;
        }
        Ok(())
    }

    fn transmit(&mut self, ctx: &mut SimContext) -> Result<()> {
        let len = self.payload_samples();
        let Some(source) = self.source.as_mut() else {
            return Ok(());
        };

        match source.next_chunk(len) {
            Some(chunk) => {
                self.send(ctx, &chunk)?;
                let period = self.transmit_period();
                self.core.arm(ctx, TimerSlot::Transmit, period);
                Ok(())
            }
            None => self.end_of_file(ctx),
        }
    }

    fn receive(&mut self, ctx: &mut SimContext) -> Result<()> {
        let data_length = self.sink_data_length();
        let total = data_length + self.metadata_length();

        let stats = self.core.buffer_stats(ctx)?;
        let mut used = stats.used;
        debug!(expected = total, available = used, space = stats.free, "sco data");

        let mut data = Vec::new();
        if used < total {
            warn!(available = used, expected = total, "sco data not enough available");
        } else {
            if used > total {
                warn!(available = used, expected = total, "sco data more than enough available");
                if used % total != 0 {
                    warn!(available = used, expected = total, "sco data available is not a multiple of expected");
                }
                while used >= 2 * total {
                    self.core.extract(ctx, total)?;
                    used -= total;
                }
            }
            let packet = self.core.extract(ctx, total)?;
            data = self.check_packet(packet, data_length);
        }

        if !data.is_empty() {
            match self.cfg.backing {
                Backing::File => self.captured.extend(data),
                Backing::Data => forward(ctx, self.core.id(), self.consume_target, data),
            }
        }

        let period = self.receive_period();
        self.core.arm(ctx, TimerSlot::Receive, period);
        Ok(())
    }

    /// Strip and validate metadata of a received packet.
    ///
    /// # Returns
    /// The payload, or an empty vector when the packet is rejected.
    fn check_packet(&self, mut packet: Vec<Sample>, data_length: usize) -> Vec<Sample> {
        if self.cfg.metadata_enable {
            let header_len = self.metadata_length();
            let header = if packet.len() < header_len {
                None
            } else if self.sample_width == 8 {
                StandardHeader::from_bytes(&bitio::samples_to_octets(&packet[..header_len]))
            } else {
                StandardHeader::from_samples(&packet)
            };
            let Some(header) = header else {
                warn!(length = packet.len(), "received packet length less than metadata packet size");
                return Vec::new();
            };

            if header.sync_word != SYNC_WORD {
                warn!("received invalid metadata sync word:{:#06x}", header.sync_word);
                return Vec::new();
            }
            let expected_bytes = data_length * self.bytes_per_sample();
            if usize::from(header.payload_length) != expected_bytes {
                warn!(
                    packet_length = header.payload_length,
                    expected = expected_bytes,
                    "received invalid metadata packet_length"
                );
                return Vec::new();
            }
            packet.drain(..header_len);
        }

        if packet.len() != data_length {
            warn!(
                data_length = packet.len(),
                expected = data_length,
                "received invalid data_length"
            );
            return Vec::new();
        }
        packet
    }

    /// Drop whatever is still queued on the to-air endpoint.
    fn flush(&mut self, ctx: &mut SimContext) -> Result<()> {
        let used = self.core.buffer_stats(ctx)?.used;
        if used > 0 {
            self.core.extract(ctx, used)?;
            debug!(stream = %self.core.id(), discarded = used, "sco sink flushed");
        }
        Ok(())
    }

    fn end_of_file(&mut self, ctx: &mut SimContext) -> Result<()> {
        match self.loops.on_eof() {
            EofAction::Restart => {
                info!(stream = %self.core.id(), remaining = self.loops.remaining(), "replaying sco audio");
                self.stop(ctx)?;
                self.core.begin(Operation::Start)?;
                self.core.commit(Operation::Start);
                self.begin_streaming(ctx);
            }
            EofAction::Finished => {
                info!(stream = %self.core.id(), "sco end of file");
                ctx.notify(Notification::EndOfFile {
                    stream: self.core.id(),
                });
            }
            EofAction::Ignored => {}
        }
        Ok(())
    }

    fn is_data_source(&self) -> bool {
        self.core.stream_type() == StreamType::Source && self.cfg.backing == Backing::Data
    }
}

impl Stream for ScoStream {
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

        let mut link = self.resolve_link(ctx)?;
        if self.core.stream_type() == StreamType::Sink
            && link.air_packet_length / self.bytes_per_sample() == 0
        {
            return Err(ConfigError::Inconsistent {
                key: "air_packet_length".to_string(),
                reason: "shorter than one sample".to_string(),
            }
            .into());
        }

        let endpoint = match self.core.stream_type() {
            StreamType::Source => sco_from_air(link.service_tag),
            StreamType::Sink => sco_to_air(link.service_tag),
        };
        self.core.open(ctx, &endpoint)?;

        link.join(self.core.id(), self.core.stream_type())?;
        info!(
            service_tag = link.service_tag,
            tesco = link.tesco,
            air_packet_length = link.air_packet_length,
            "sco link attached"
        );
        ctx.put_sco_link(link.clone());
        self.link = Some(link);

        if self.core.stream_type() == StreamType::Source {
            let payload_bytes = self.payload_samples() * self.bytes_per_sample();
            let air = self.link.as_ref().map_or(0, |l| l.air_packet_length);
            if payload_bytes != air {
                warn!(payload_bytes, air_packet_length = air, "sco source payload does not fill the air packet");
            }
            self.injector = Some(LinkInjector::new(self.cfg.link_errors(), self.tesco()));
        }

        self.core.commit(Operation::Create);
        Ok(())
    }

    fn config(&mut self, _ctx: &mut SimContext, params: &ConfigMap) -> Result<()> {
        self.core.begin(Operation::Config)?;
        let runtime: RuntimeConfig = schema::parse(RUNTIME_SPECS, params)?;
        if runtime.consume_target.is_some() {
            self.consume_target = runtime.consume_target;
        }
        self.core.commit(Operation::Config);
        Ok(())
    }

    fn start(&mut self, ctx: &mut SimContext) -> Result<()> {
        self.core.begin(Operation::Start)?;
        self.loops.rearm();
        // a delayed start is a new session too
        if let Some(injector) = self.injector.as_mut() {
            injector.reset();
        }
        self.core.commit(Operation::Start);

        if self.core.stream_type() == StreamType::Source && self.cfg.delay > 0.0 {
            info!(delay = self.cfg.delay, "delaying start");
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

        if let Some(injector) = &self.injector {
            let stats = injector.statistics();
            info!(
                packets = stats.sent_packets,
                per = stats.sent_per,
                ber = stats.sent_ber,
                crc_errors = stats.sent_crc_error,
                nothing_received_errors = stats.sent_nothing_received_error,
                never_scheduled_errors = stats.sent_never_scheduled_error,
                seed = injector.seed(),
                "sco packets sent"
            );
        }

        self.core.cancel_all(ctx);
        if self.core.stream_type() == StreamType::Sink {
            self.flush(ctx)?;
        }
        self.core.commit(Operation::Stop);
        Ok(())
    }

    fn destroy(&mut self, ctx: &mut SimContext) -> Result<()> {
        self.core.begin(Operation::Destroy)?;

        if self.core.stream_type() == StreamType::Sink && self.cfg.backing == Backing::File {
            if let Some(filename) = self.cfg.filename.as_deref() {
                let data = std::mem::take(&mut self.captured);
                ctx.save_capture(filename, self.sample_rate, self.sample_width, data)?;
            }
        }

        self.release(ctx)?;
        self.core.commit(Operation::Destroy);
        Ok(())
    }

    fn release(&mut self, ctx: &mut SimContext) -> Result<()> {
        self.core.cancel_all(ctx);
        self.core.close(ctx)?;
        if let Some(link) = self.link.take() {
            ctx.leave_sco_link(link.service_tag, self.core.id());
        }
        Ok(())
    }

    fn consume(&mut self, ctx: &mut SimContext, input: usize, data: &[Sample]) -> Result<()> {
        if input == 0 && self.is_data_source() && self.core.is_started() {
            self.send(ctx, data)?;
        }
        Ok(())
    }

    fn eof_detected(&mut self, ctx: &mut SimContext, input: usize) -> Result<()> {
        if input == 0 && self.is_data_source() {
            self.end_of_file(ctx)?;
        }
        Ok(())
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
        self.injector.as_ref().map(LinkInjector::statistics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioClip;
    use crate::error::Error;
    use crate::schema::config_map;
    use crate::transport::LoopbackDevice;
    use serde_json::json;

    fn ctx() -> SimContext {
        let mut ctx = SimContext::new(LoopbackDevice::new().with_sco_link(100, 1024));
        ctx.add_clip("speech", AudioClip::mono(8000.0, 16, (0..300).collect()));
        ctx
    }

    fn build(ctx: &SimContext, id: usize, stream_type: StreamType, params: serde_json::Value) -> Result<Box<dyn Stream>> {
        ScoStream::construct(StreamId(id), stream_type, &config_map(params), ctx)
    }

    #[test]
    fn test_link_join_and_duplicate_type() {
        let mut link = ScoLink::new(100, 6, 0, 60);
        link.join(StreamId(0), StreamType::Source).unwrap();
        link.join(StreamId(1), StreamType::Sink).unwrap();
        assert!(link.join(StreamId(2), StreamType::Source).is_err());
        link.leave(StreamId(0));
        assert!(link.check_join(StreamType::Source).is_ok());
    }

    #[test]
    fn test_backing_is_required() {
        let ctx = ctx();
        let err = build(&ctx, 0, StreamType::Source, json!({"filename": "speech"}))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(ConfigError::MissingKey { ref key }) if key == "backing"));
    }

    #[test]
    fn test_file_only_keys_rejected_for_data() {
        let ctx = ctx();
        let err = build(
            &ctx,
            0,
            StreamType::Source,
            json!({"backing": "data", "sample_width": 16, "loop": 2}),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config(ConfigError::UnknownKey { ref key }) if key == "loop"));
    }

    #[test]
    fn test_percentages_validated() {
        let ctx = ctx();
        let err = build(
            &ctx,
            0,
            StreamType::Source,
            json!({"backing": "file", "filename": "speech", "ber": -1}),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config(ConfigError::OutOfRange { ref key, .. }) if key == "ber"));
    }

    #[test]
    fn test_zeagle_sink_rejected() {
        let ctx = ctx();
        let result = build(
            &ctx,
            0,
            StreamType::Sink,
            json!({
                "backing": "data",
                "sample_rate": 8000,
                "sample_width": 16,
                "metadata_enable": true,
                "metadata_format": "zeagle"
            }),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_create_fails_without_endpoint() {
        let mut ctx = ctx();
        let mut stream = build(
            &ctx,
            0,
            StreamType::Source,
            json!({"backing": "file", "filename": "speech", "service_tag": 7}),
        )
        .unwrap();
        let err = stream.create(&mut ctx).unwrap_err();
        assert!(matches!(err, Error::Resource(ResourceError::EndpointUnavailable(_))));
        assert_eq!(stream.state(), StreamState::Instantiated);
        assert_eq!(ctx.sco_link_count(), 0);
    }

    #[test]
    fn test_payload_and_air_packet_length() {
        let mut ctx = ctx();
        let mut source = build(
            &ctx,
            0,
            StreamType::Source,
            json!({"backing": "file", "filename": "speech"}),
        )
        .unwrap();
        source.create(&mut ctx).unwrap();

        let link = ctx.sco_link(100).unwrap();
        assert_eq!(link.tesco, 6);
        assert_eq!(link.air_packet_length, 60);
        assert_eq!(link.members(), &[(StreamId(0), StreamType::Source)]);
    }

    #[test]
    fn test_second_stream_joins_parent_link() {
        let mut ctx = ctx();
        let mut source = build(
            &ctx,
            0,
            StreamType::Source,
            json!({"backing": "file", "filename": "speech"}),
        )
        .unwrap();
        source.create(&mut ctx).unwrap();

        let mut sink = build(
            &ctx,
            1,
            StreamType::Sink,
            json!({"backing": "data", "sample_rate": 8000, "sample_width": 16, "stream": 0}),
        )
        .unwrap();
        sink.create(&mut ctx).unwrap();
        assert_eq!(ctx.sco_link(100).unwrap().members().len(), 2);

        let mut second_source = build(
            &ctx,
            2,
            StreamType::Source,
            json!({"backing": "file", "filename": "speech", "stream": 0}),
        )
        .unwrap();
        let err = second_source.create(&mut ctx).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::Inconsistent { ref key, .. }) if key == "stream"));
    }

    #[test]
    fn test_packet_samples() {
        assert_eq!(packet_samples(8000.0, 6), 30);
        assert_eq!(packet_samples(16000.0, 6), 60);
        assert_eq!(packet_samples(8000.0, 2), 10);
    }

    fn sink_with_metadata(enabled: bool) -> ScoStream {
        let cfg = schema::parse(
            &[DATA_SPECS, LINK_SPECS].concat(),
            &config_map(json!({"backing": "data", "metadata_enable": enabled})),
        )
        .unwrap();
        ScoStream {
            core: StreamCore::new(StreamId(9), INTERFACE, StreamType::Sink),
            cfg,
            sample_rate: 8000.0,
            sample_width: 16,
            source: None,
            injector: None,
            captured: Vec::new(),
            consume_target: None,
            loops: LoopCounter::new(1),
            drift: DriftCorrector::new(),
            link: Some(ScoLink::new(100, 6, 0, 60)),
        }
    }

    #[test]
    fn test_check_packet_standard() {
        let sink = sink_with_metadata(true);
        assert_eq!(sink.sink_data_length(), 30);
        assert_eq!(sink.metadata_length(), 5);

        let mut good = vec![0x5C5C, 5, 60, 0, 0];
        good.extend(std::iter::repeat(3).take(30));
        assert_eq!(sink.check_packet(good.clone(), 30), vec![3; 30]);

        let mut bad_sync = good.clone();
        bad_sync[0] = 0x1234;
        assert!(sink.check_packet(bad_sync, 30).is_empty());

        let mut bad_len = good.clone();
        bad_len[2] = 58;
        assert!(sink.check_packet(bad_len, 30).is_empty());

        assert!(sink.check_packet(vec![0x5C5C, 5], 30).is_empty());
    }

    #[test]
    fn test_check_packet_without_metadata() {
        let sink = sink_with_metadata(false);
        assert_eq!(sink.metadata_length(), 0);
        assert_eq!(sink.check_packet(vec![1; 30], 30), vec![1; 30]);
        assert!(sink.check_packet(vec![1; 29], 30).is_empty());
    }
}
