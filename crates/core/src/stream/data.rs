//! Data-backed streams: samples exchanged with other streams at run time.
//!
//! A data source writes whatever it is handed through `consume` into its
//! endpoint and reports end of file when `eof_detected` arrives. A data sink
//! polls its endpoint once per frame period and forwards each batch of whole
//! frames, either to another stream as a consume event or to the owner as a
//! data notification.

use super::file::required;
use super::{EofAction, LoopCounter, Operation, Stream, StreamCore, StreamId, StreamState, StreamType};
use crate::error::Result;
use crate::scheduler::{DriftCorrector, TimerHandle, TimerSlot};
use crate::schema::{self, ConfigMap, ParamDefault, ParamKind, ParamSpec};
use crate::sim::{Event, Notification, SimContext};
use crate::Sample;
use serde::Deserialize;
use tracing::{debug, info};

pub const INTERFACE: &str = "data";

const SPECS: &[ParamSpec] = &[
    ParamSpec::required("endpoint", ParamKind::any_string()),
    ParamSpec::optional("sample_rate", ParamKind::number_at_least(0.0)),
    ParamSpec::required(
        "sample_width",
        ParamKind::IntChoice {
            choices: &[8, 16, 24, 32],
        },
    ),
    ParamSpec::optional("frame_size", ParamKind::int_at_least(1)).with_default(ParamDefault::Int(1)),
    ParamSpec::optional("consume_target", ParamKind::int_at_least(0))
        .nullable()
        .with_default(ParamDefault::Null),
];

const RUNTIME_SPECS: &[ParamSpec] =
    &[ParamSpec::optional("consume_target", ParamKind::int_at_least(0)).nullable()];

#[derive(Debug, Clone, Deserialize)]
struct DataConfig {
    endpoint: String,
    sample_rate: Option<f64>,
    frame_size: usize,
    consume_target: Option<StreamId>,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimeConfig {
    #[serde(default)]
    consume_target: Option<StreamId>,
}

/// Data-backed source or sink.
#[derive(Debug)]
pub struct DataStream {
    core: StreamCore,
    cfg: DataConfig,
    sample_rate: f64,
    eof: LoopCounter,
    drift: DriftCorrector,
}

impl DataStream {
    pub fn construct(
        id: StreamId,
        stream_type: StreamType,
        params: &ConfigMap,
        _ctx: &SimContext,
    ) -> Result<Box<dyn Stream>> {
        let cfg: DataConfig = schema::parse(SPECS, params)?;
        let sample_rate = match stream_type {
            StreamType::Sink => required(cfg.sample_rate.filter(|&r| r > 0.0), "sample_rate")?,
            StreamType::Source => cfg.sample_rate.unwrap_or(0.0),
        };

        Ok(Box::new(Self {
            core: StreamCore::new(id, INTERFACE, stream_type),
            cfg,
            sample_rate,
            eof: LoopCounter::new(1),
            drift: DriftCorrector::new(),
        }))
    }

    fn frame_period(&mut self) -> f64 {
        self.drift
            .next_period(self.cfg.frame_size as f64 / self.sample_rate)
    }

    fn receive(&mut self, ctx: &mut SimContext) -> Result<()> {
        let stats = self.core.buffer_stats(ctx)?;
        let frames = stats.used / self.cfg.frame_size;
        if frames > 0 {
            let data = self.core.extract(ctx, frames * self.cfg.frame_size)?;
            debug!(stream = %self.core.id(), samples = data.len(), "data sink received");
            forward(ctx, self.core.id(), self.cfg.consume_target, data);
        }

        let period = self.frame_period();
        self.core.arm(ctx, TimerSlot::Receive, period);
        Ok(())
    }
}

/// Hand received samples on: to `target` as a consume event, or to the
/// owner of the simulation.
pub(crate) fn forward(ctx: &mut SimContext, from: StreamId, target: Option<StreamId>, data: Vec<Sample>) {
    match target {
        Some(target) => ctx.post(Event::Consume {
            stream: target,
            input: 0,
            data,
        }),
        None => ctx.notify(Notification::Data { stream: from, data }),
    }
}

impl Stream for DataStream {
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
        let runtime: RuntimeConfig = schema::parse(RUNTIME_SPECS, params)?;
        if runtime.consume_target.is_some() {
            self.cfg.consume_target = runtime.consume_target;
        }
        self.core.commit(Operation::Config);
        Ok(())
    }

    fn start(&mut self, ctx: &mut SimContext) -> Result<()> {
        self.core.begin(Operation::Start)?;
        self.eof.rearm();
        self.drift.reset();
        self.core.commit(Operation::Start);

        if self.core.stream_type() == StreamType::Sink {
            let period = self.frame_period();
            self.core.arm(ctx, TimerSlot::Receive, period);
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
        self.release(ctx)?;
        self.core.commit(Operation::Destroy);
        Ok(())
    }

    fn release(&mut self, ctx: &mut SimContext) -> Result<()> {
        self.core.release(ctx)
    }

    fn consume(&mut self, ctx: &mut SimContext, input: usize, data: &[Sample]) -> Result<()> {
        if input != 0 || self.core.stream_type() != StreamType::Source || !self.core.is_started() {
            debug!(stream = %self.core.id(), input, "consume ignored");
            return Ok(());
        }
        self.core.insert(ctx, data)?;
        Ok(())
    }

    fn eof_detected(&mut self, ctx: &mut SimContext, input: usize) -> Result<()> {
        if input != 0 || self.core.stream_type() != StreamType::Source {
            return Ok(());
        }
        if self.eof.on_eof() == EofAction::Finished {
            info!(stream = %self.core.id(), "end of data");
            ctx.notify(Notification::EndOfFile {
                stream: self.core.id(),
            });
        }
        Ok(())
    }

    fn on_timer(&mut self, ctx: &mut SimContext, slot: TimerSlot, handle: TimerHandle) -> Result<()> {
        if !self.core.fired(slot, handle) || !self.core.is_started() {
            return Ok(());
        }
        match slot {
            TimerSlot::Receive => self.receive(ctx),
            TimerSlot::Transmit | TimerSlot::Loop => Ok(()),
        }
    }
}
