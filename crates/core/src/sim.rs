//! Simulation context and the event dispatch loop.
//!
//! [`SimContext`] is everything a stream may touch while it runs: the
//! scheduler, the virtual device, in-memory audio clips, captured sink
//! output, the instance registry and the SCO link table. It is passed
//! explicitly to every stream operation.
//!
//! [`Simulation`] owns the context, the stream instances and the factory. It
//! drives virtual time: each popped [`Event`] is dispatched to its stream by
//! one `match`, and runs to completion before the next one is popped.
//! Anything a stream reports to the outside world is queued as a
//! [`Notification`].
//!
//! # Example
//! ```
//! use scosim_core::audio::AudioClip;
//! use scosim_core::schema::config_map;
//! use scosim_core::transport::LoopbackDevice;
//! use scosim_core::{Notification, Simulation, StreamType};
//! use serde_json::json;
//!
//! let mut sim = Simulation::new(LoopbackDevice::new().with_sco_link(100, 1024));
//! sim.add_clip("speech", AudioClip::mono(8000.0, 16, vec![0; 240]));
//!
//! let source = sim
//!     .get_instance(
//!         "sco",
//!         StreamType::Source,
//!         &config_map(json!({"backing": "file", "filename": "speech", "seed": 1})),
//!     )
//!     .unwrap();
//! sim.create(source).unwrap();
//! sim.config(source, &Default::default()).unwrap();
//! sim.start(source).unwrap();
//! sim.run_for(0.1).unwrap();
//!
//! assert_eq!(
//!     sim.take_notifications(),
//!     vec![Notification::EndOfFile { stream: source }]
//! );
//! assert_eq!(sim.statistics(source).unwrap().sent_packets, 8);
//! ```

use crate::audio::{open_audio, write_audio, AudioClip, AudioHints, AudioSource};
use crate::error::{ResourceError, Result};
use crate::factory::StreamFactory;
use crate::link::LinkStatistics;
use crate::scheduler::{Scheduler, TimerSlot};
use crate::schema::ConfigMap;
use crate::stream::sco::ScoLink;
use crate::stream::{Stream, StreamId, StreamState, StreamType};
use crate::transport::VirtualTransport;
use crate::Sample;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Messages delivered to streams through the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A timer owned by `stream` fired
    Timer { stream: StreamId, slot: TimerSlot },
    /// Samples handed to `stream` on one of its inputs
    Consume {
        stream: StreamId,
        input: usize,
        data: Vec<Sample>,
    },
    /// The producer feeding `input` of `stream` has finished
    EofDetected { stream: StreamId, input: usize },
}

/// Messages from streams to the owner of the simulation.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A source played its last loop, or a data source saw end of data
    EndOfFile { stream: StreamId },
    /// A data sink received samples and has no consume target
    Data { stream: StreamId, data: Vec<Sample> },
}

/// Shared state visible to streams.
pub struct SimContext {
    pub scheduler: Scheduler<Event>,
    pub transport: Box<dyn VirtualTransport>,
    output_dir: Option<PathBuf>,
    clips: HashMap<String, AudioClip>,
    captures: HashMap<String, Vec<Sample>>,
    instances: BTreeMap<&'static str, Vec<StreamId>>,
    sco_links: BTreeMap<u32, ScoLink>,
    notifications: Vec<Notification>,
}

impl SimContext {
    pub fn new(transport: impl VirtualTransport + 'static) -> Self {
        Self {
            scheduler: Scheduler::new(),
            transport: Box::new(transport),
            output_dir: None,
            clips: HashMap::new(),
            captures: HashMap::new(),
            instances: BTreeMap::new(),
            sco_links: BTreeMap::new(),
            notifications: Vec::new(),
        }
    }

    /// Current virtual time in seconds.
    pub fn now(&self) -> f64 {
        self.scheduler.now()
    }

    /// Queue `event` for the current instant.
    pub fn post(&mut self, event: Event) {
        self.scheduler.post(event);
    }

    pub fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    /// Directory that relative sink filenames are written under.
    pub fn set_output_dir(&mut self, dir: impl Into<PathBuf>) {
        self.output_dir = Some(dir.into());
    }

    /// Make `clip` available to file-backed sources under `name`.
    ///
    /// Clips shadow files of the same name.
    pub fn add_clip(&mut self, name: &str, clip: AudioClip) {
        self.clips.insert(name.to_string(), clip);
    }

    /// Open audio by name: an in-memory clip, else a file on disk.
    pub fn load_audio(&self, name: &str, hints: AudioHints) -> Result<Box<dyn AudioSource>> {
        match self.clips.get(name) {
            Some(clip) => Ok(Box::new(clip.clone())),
            None => open_audio(name, hints),
        }
    }

    /// Write what a sink received to `name` and keep a copy.
    pub fn save_capture(
        &mut self,
        name: &str,
        sample_rate: f64,
        sample_width: u32,
        data: Vec<Sample>,
    ) -> Result<()> {
        let path = match &self.output_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        };
        write_audio(&path, sample_rate, sample_width, &data)?;
        self.captures.insert(name.to_string(), data);
        Ok(())
    }

    /// Samples saved by a sink under `name`.
    pub fn capture(&self, name: &str) -> Option<&[Sample]> {
        self.captures.get(name).map(Vec::as_slice)
    }

    pub fn register_instance(&mut self, interface: &'static str, id: StreamId) {
        self.instances.entry(interface).or_default().push(id);
    }

    pub fn unregister_instance(&mut self, interface: &'static str, id: StreamId) {
        if let Some(ids) = self.instances.get_mut(interface) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                self.instances.remove(interface);
            }
        }
    }

    /// Live instances of one interface, in creation order.
    pub fn instances(&self, interface: &str) -> &[StreamId] {
        self.instances.get(interface).map_or(&[], Vec::as_slice)
    }

    pub fn sco_link(&self, service_tag: u32) -> Option<&ScoLink> {
        self.sco_links.get(&service_tag)
    }

    pub fn sco_link_count(&self) -> usize {
        self.sco_links.len()
    }

    /// Service tag of the link `stream` is attached to.
    pub fn sco_link_of(&self, stream: StreamId) -> Option<u32> {
        self.sco_links
            .values()
            .find(|link| link.has_member(stream))
            .map(|link| link.service_tag)
    }

    /// Insert or replace a link.
    pub fn put_sco_link(&mut self, link: ScoLink) {
        self.sco_links.insert(link.service_tag, link);
    }

    /// Detach `stream`; the link goes away with its last member.
    pub fn leave_sco_link(&mut self, service_tag: u32, stream: StreamId) {
        if let Some(link) = self.sco_links.get_mut(&service_tag) {
            link.leave(stream);
            if link.is_empty() {
                info!(service_tag, "sco link removed");
                self.sco_links.remove(&service_tag);
            }
        }
    }
}

/// Stream instances, their context and the virtual clock.
pub struct Simulation {
    factory: StreamFactory,
    ctx: SimContext,
    streams: BTreeMap<StreamId, Box<dyn Stream>>,
    next_id: usize,
}

impl Simulation {
    /// Simulation with the built-in stream kinds.
    pub fn new(transport: impl VirtualTransport + 'static) -> Self {
        Self::with_factory(StreamFactory::with_builtin(), transport)
    }

    pub fn with_factory(factory: StreamFactory, transport: impl VirtualTransport + 'static) -> Self {
        Self {
            factory,
            ctx: SimContext::new(transport),
            streams: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub fn factory(&self) -> &StreamFactory {
        &self.factory
    }

    pub fn context(&self) -> &SimContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut SimContext {
        &mut self.ctx
    }

    pub fn add_clip(&mut self, name: &str, clip: AudioClip) {
        self.ctx.add_clip(name, clip);
    }

    /// Construct a stream of `interface` and register it.
    ///
    /// # Errors
    /// Unknown interface, unsupported stream type, or invalid configuration.
    pub fn get_instance(
        &mut self,
        interface: &str,
        stream_type: StreamType,
        params: &ConfigMap,
    ) -> Result<StreamId> {
        let id = StreamId(self.next_id);
        let stream = self
            .factory
            .instantiate(interface, stream_type, id, params, &self.ctx)?;
        self.next_id += 1;

        self.ctx.register_instance(stream.interface(), id);
        debug!(stream = %id, interface = stream.interface(), %stream_type, "instance registered");
        self.streams.insert(id, stream);
        Ok(id)
    }

    /// Unregister a stream and release whatever it still holds.
    pub fn put_instance(&mut self, id: StreamId) -> Result<()> {
        let mut stream = self
            .streams
            .remove(&id)
            .ok_or(ResourceError::UnknownInstance(id.0))?;
        self.ctx.unregister_instance(stream.interface(), id);
        if !matches!(stream.state(), StreamState::Instantiated | StreamState::Destroyed) {
            warn!(stream = %id, state = ?stream.state(), "releasing a stream that was not destroyed");
            stream.release(&mut self.ctx)?;
        }
        Ok(())
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<(&mut Box<dyn Stream>, &mut SimContext)> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(ResourceError::UnknownInstance(id.0))?;
        Ok((stream, &mut self.ctx))
    }

    pub fn create(&mut self, id: StreamId) -> Result<()> {
        let (stream, ctx) = self.stream_mut(id)?;
        stream.create(ctx)
    }

    pub fn config(&mut self, id: StreamId, params: &ConfigMap) -> Result<()> {
        let (stream, ctx) = self.stream_mut(id)?;
        stream.config(ctx, params)
    }

    pub fn start(&mut self, id: StreamId) -> Result<()> {
        let (stream, ctx) = self.stream_mut(id)?;
        stream.start(ctx)
    }

    pub fn stop(&mut self, id: StreamId) -> Result<()> {
        let (stream, ctx) = self.stream_mut(id)?;
        stream.stop(ctx)
    }

    pub fn destroy(&mut self, id: StreamId) -> Result<()> {
        let (stream, ctx) = self.stream_mut(id)?;
        stream.destroy(ctx)
    }

    pub fn state(&self, id: StreamId) -> Option<StreamState> {
        self.streams.get(&id).map(|s| s.state())
    }

    pub fn statistics(&self, id: StreamId) -> Option<LinkStatistics> {
        self.streams.get(&id).and_then(|s| s.statistics())
    }

    /// Hand samples to input `input` of `id` at the current instant.
    pub fn consume(&mut self, id: StreamId, input: usize, data: Vec<Sample>) {
        self.ctx.post(Event::Consume {
            stream: id,
            input,
            data,
        });
    }

    /// Signal end of data on input `input` of `id`.
    pub fn eof(&mut self, id: StreamId, input: usize) {
        self.ctx.post(Event::EofDetected { stream: id, input });
    }

    pub fn now(&self) -> f64 {
        self.ctx.now()
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.ctx.take_notifications()
    }

    /// Dispatch every event due at or before `at`, then move the clock to
    /// `at`.
    ///
    /// # Returns
    /// Number of events dispatched.
    pub fn run_until(&mut self, at: f64) -> Result<usize> {
        let mut dispatched = 0;
        while self.step_until(at)? {
            dispatched += 1;
        }
        self.ctx.scheduler.advance_to(at);
        Ok(dispatched)
    }

    /// Run for `duration` seconds of virtual time.
    pub fn run_for(&mut self, duration: f64) -> Result<usize> {
        let at = self.now() + duration;
        self.run_until(at)
    }

    /// Dispatch the next pending event, whenever it is due.
    ///
    /// # Returns
    /// `false` if nothing was pending.
    pub fn step(&mut self) -> Result<bool> {
        self.step_until(f64::MAX)
    }

    fn step_until(&mut self, limit: f64) -> Result<bool> {
        let Some((handle, event)) = self.ctx.scheduler.pop_until(limit) else {
            return Ok(false);
        };

        let target = match &event {
            Event::Timer { stream, .. }
            | Event::Consume { stream, .. }
            | Event::EofDetected { stream, .. } => *stream,
        };
        let Some(stream) = self.streams.get_mut(&target) else {
            debug!(stream = %target, ?event, "event for a stream that no longer exists");
            return Ok(true);
        };

        let ctx = &mut self.ctx;
        match event {
            Event::Timer { slot, .. } => stream.on_timer(ctx, slot, handle)?,
            Event::Consume { input, data, .. } => stream.consume(ctx, input, &data)?,
            Event::EofDetected { input, .. } => stream.eof_detected(ctx, input)?,
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::schema::config_map;
    use crate::transport::LoopbackDevice;
    use serde_json::json;

    fn sim() -> Simulation {
        Simulation::new(
            LoopbackDevice::new()
                .with_endpoint("in", 256)
                .with_endpoint("out", 256)
                .with_route("in", "out"),
        )
    }

    #[test]
    fn test_instances_registered_by_interface() {
        let mut sim = sim();
        let a = sim
            .get_instance(
                "data",
                StreamType::Source,
                &config_map(json!({"endpoint": "in", "sample_width": 16})),
            )
            .unwrap();
        let b = sim
            .get_instance(
                "data",
                StreamType::Sink,
                &config_map(json!({"endpoint": "out", "sample_width": 16, "sample_rate": 1000})),
            )
            .unwrap();
        assert_eq!(sim.context().instances("data"), &[a, b]);

        sim.put_instance(a).unwrap();
        assert_eq!(sim.context().instances("data"), &[b]);
        assert!(sim.put_instance(a).is_err());
    }

    #[test]
    fn test_unknown_interface() {
        let mut sim = sim();
        let err = sim
            .get_instance("usb", StreamType::Source, &ConfigMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::Resource(ResourceError::UnknownInterface(_))));
    }

    #[test]
    fn test_data_pipeline_notifies_sink_output() {
        let mut sim = sim();
        let source = sim
            .get_instance(
                "data",
                StreamType::Source,
                &config_map(json!({"endpoint": "in", "sample_width": 16})),
            )
            .unwrap();
        let sink = sim
            .get_instance(
                "data",
                StreamType::Sink,
                &config_map(json!({
                    "endpoint": "out",
                    "sample_width": 16,
                    "sample_rate": 1000,
                    "frame_size": 4
                })),
            )
            .unwrap();
        for id in [source, sink] {
            sim.create(id).unwrap();
            sim.config(id, &ConfigMap::new()).unwrap();
            sim.start(id).unwrap();
        }

        sim.consume(source, 0, (1..=10).collect());
        sim.run_for(0.01).unwrap();

        let notes = sim.take_notifications();
        assert_eq!(
            notes,
            vec![Notification::Data {
                stream: sink,
                data: (1..=8).collect()
            }]
        );
    }

    #[test]
    fn test_events_for_dropped_streams_are_skipped() {
        let mut sim = sim();
        sim.consume(StreamId(42), 0, vec![1]);
        assert!(sim.step().unwrap());
        assert!(!sim.step().unwrap());
    }

    #[test]
    fn test_clock_advances_to_limit() {
        let mut sim = sim();
        assert_eq!(sim.run_until(0.5).unwrap(), 0);
        assert!((sim.now() - 0.5).abs() < 1e-9);
    }
}
