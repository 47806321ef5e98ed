//! Stream lifecycle contract and the shared plumbing of all stream kinds.
//!
//! Every stream moves through the same states:
//!
//! ```text
//! Instantiated -> Created -> Configured -> Started <-> Stopped -> Destroyed
//!                              ^    |
//!                              +----+ (config may repeat)
//! ```
//!
//! Stream kinds implement [`Stream`]; they hold a [`StreamCore`] for the
//! lifecycle, timer handles and transport port, so that the kind modules only
//! contain what is specific to them.

pub mod data;
pub mod file;
pub mod sco;

use crate::buffer::{buffer_stats, BufferStats};
use crate::error::{LifecycleError, Result};
use crate::link::LinkStatistics;
use crate::scheduler::{TimerHandle, TimerSlot, OwnedTimers};
use crate::schema::ConfigMap;
use crate::sim::{Event, SimContext};
use crate::transport::Port;
use crate::Sample;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Identifier of a stream instance within one simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub usize);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a stream, seen from the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    /// Produces data into the device
    Source,
    /// Consumes data from the device
    Sink,
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Source => write!(f, "source"),
            StreamType::Sink => write!(f, "sink"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Constructed by the factory, no resources yet
    Instantiated,
    Created,
    Configured,
    Started,
    Stopped,
    Destroyed,
}

/// Where a stream's samples come from or go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backing {
    /// Audio file (or in-memory clip)
    File,
    /// Samples exchanged with other streams at run time
    Data,
}

/// Lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Config,
    Start,
    Stop,
    Destroy,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Config => "config",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Destroy => "destroy",
        }
    }

    fn target(self) -> StreamState {
        match self {
            Operation::Create => StreamState::Created,
            Operation::Config => StreamState::Configured,
            Operation::Start => StreamState::Started,
            Operation::Stop => StreamState::Stopped,
            Operation::Destroy => StreamState::Destroyed,
        }
    }
}

/// Lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    state: StreamState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: StreamState::Instantiated,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Check whether `op` may run now.
    ///
    /// # Returns
    /// - `Ok(true)`: proceed, then [`Lifecycle::commit`]
    /// - `Ok(false)`: nothing to do (stop while already stopped)
    ///
    /// # Errors
    /// `LifecycleError::InvalidTransition` for any other transition.
    pub fn begin(&self, op: Operation) -> Result<bool> {
        use StreamState::*;

        let allowed = match op {
            Operation::Create => self.state == Instantiated,
            Operation::Config => matches!(self.state, Created | Configured),
            Operation::Start => matches!(self.state, Configured | Stopped),
            Operation::Stop if self.state == Stopped => return Ok(false),
            Operation::Stop => self.state == Started,
            Operation::Destroy => self.state == Stopped,
        };

        if allowed {
            Ok(true)
        } else {
            Err(LifecycleError::InvalidTransition {
                from: self.state,
                operation: op.name(),
            }
            .into())
        }
    }

    pub fn commit(&mut self, op: Operation) {
        self.state = op.target();
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// What an end of file means for a looping stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EofAction {
    /// Loops remain: replay from the beginning
    Restart,
    /// Last loop done: notify the owner
    Finished,
    /// Completion was already reported
    Ignored,
}

/// Remaining-loop counter of a file-backed source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopCounter {
    loops: u32,
    remaining: u32,
    finished: bool,
}

impl LoopCounter {
    pub fn new(loops: u32) -> Self {
        Self {
            loops: loops.max(1),
            remaining: loops.max(1),
            finished: false,
        }
    }

    /// Re-arm for a new user-initiated start.
    pub fn rearm(&mut self) {
        self.remaining = self.loops;
        self.finished = false;
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn on_eof(&mut self) -> EofAction {
        if self.finished {
            return EofAction::Ignored;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining > 0 {
            EofAction::Restart
        } else {
            self.finished = true;
            EofAction::Finished
        }
    }
}

/// Contract every stream kind implements.
///
/// Lifecycle methods are invoked by the simulation; `consume`,
/// `eof_detected` and `on_timer` are invoked by its event loop. None of them
/// may block.
pub trait Stream {
    fn id(&self) -> StreamId;

    /// Interface name the stream was registered under.
    fn interface(&self) -> &'static str;

    fn stream_type(&self) -> StreamType;

    fn state(&self) -> StreamState;

    /// Allocate transport resources.
    fn create(&mut self, ctx: &mut SimContext) -> Result<()>;

    /// Apply run-time configuration.
    fn config(&mut self, ctx: &mut SimContext, params: &ConfigMap) -> Result<()>;

    /// Arm timers and reset statistics.
    fn start(&mut self, ctx: &mut SimContext) -> Result<()>;

    /// Cancel every owned timer. A no-op when already stopped.
    fn stop(&mut self, ctx: &mut SimContext) -> Result<()>;

    /// Release transport resources.
    fn destroy(&mut self, ctx: &mut SimContext) -> Result<()>;

    /// Give back everything the stream holds (timers, endpoint, link
    /// membership) without a state transition. Used by `destroy` and when
    /// a stream is put back before it was destroyed.
    fn release(&mut self, ctx: &mut SimContext) -> Result<()>;

    /// Data pushed into the stream by another stream.
    fn consume(&mut self, _ctx: &mut SimContext, _input: usize, _data: &[Sample]) -> Result<()> {
        Ok(())
    }

    /// Upstream end of data.
    fn eof_detected(&mut self, _ctx: &mut SimContext, _input: usize) -> Result<()> {
        Ok(())
    }

    /// One of the stream's timers fired.
    fn on_timer(&mut self, ctx: &mut SimContext, slot: TimerSlot, handle: TimerHandle) -> Result<()>;

    /// Link statistics of the current or last session, for streams that
    /// keep them.
    fn statistics(&self) -> Option<LinkStatistics> {
        None
    }
}

/// Identity, lifecycle, timers and transport port of one stream.
#[derive(Debug)]
pub struct StreamCore {
    id: StreamId,
    interface: &'static str,
    stream_type: StreamType,
    lifecycle: Lifecycle,
    timers: OwnedTimers,
    port: Option<Port>,
}

impl StreamCore {
    pub fn new(id: StreamId, interface: &'static str, stream_type: StreamType) -> Self {
        Self {
            id,
            interface,
            stream_type,
            lifecycle: Lifecycle::new(),
            timers: OwnedTimers::new(),
            port: None,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn interface(&self) -> &'static str {
        self.interface
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn state(&self) -> StreamState {
        self.lifecycle.state()
    }

    pub fn is_started(&self) -> bool {
        self.state() == StreamState::Started
    }

    pub fn begin(&self, op: Operation) -> Result<bool> {
        self.lifecycle.begin(op)
    }

    /// Record a completed transition.
    pub fn commit(&mut self, op: Operation) {
        self.lifecycle.commit(op);
        info!(
            stream = %self.id,
            interface = self.interface,
            stream_type = %self.stream_type,
            state = ?self.state(),
            "stream {}",
            op.name()
        );
    }

    /// Arm `slot` to fire after `period` seconds.
    pub fn arm(&mut self, ctx: &mut SimContext, slot: TimerSlot, period: f64) -> TimerHandle {
        let event = Event::Timer {
            stream: self.id,
            slot,
        };
        self.timers.arm(&mut ctx.scheduler, slot, period, event)
    }

    /// Accept a fired timer. Stale handles return `false`.
    pub fn fired(&mut self, slot: TimerSlot, handle: TimerHandle) -> bool {
        self.timers.fired(slot, handle)
    }

    pub fn cancel_all(&mut self, ctx: &mut SimContext) {
        self.timers.cancel_all(&mut ctx.scheduler);
    }

    pub fn is_armed(&self, slot: TimerSlot) -> bool {
        self.timers.is_armed(slot)
    }

    /// Open a device endpoint.
    pub fn open(&mut self, ctx: &mut SimContext, endpoint: &str) -> Result<()> {
        self.port = Some(ctx.transport.open(endpoint)?);
        Ok(())
    }

    /// Close the endpoint, if open.
    pub fn close(&mut self, ctx: &mut SimContext) -> Result<()> {
        if let Some(port) = self.port.take() {
            ctx.transport.close(port)?;
        }
        Ok(())
    }

    /// Cancel every timer and close the endpoint.
    pub fn release(&mut self, ctx: &mut SimContext) -> Result<()> {
        self.cancel_all(ctx);
        self.close(ctx)
    }

    /// Write to the endpoint. Without an open port nothing is written.
    pub fn insert(&self, ctx: &mut SimContext, data: &[Sample]) -> Result<usize> {
        match self.port {
            Some(port) => ctx.transport.insert(port.write, data),
            None => Ok(0),
        }
    }

    pub fn extract(&self, ctx: &mut SimContext, count: usize) -> Result<Vec<Sample>> {
        match self.port {
            Some(port) => ctx.transport.extract(port.read, count),
            None => Ok(Vec::new()),
        }
    }

    /// Used and free space of the endpoint, in samples.
    pub fn buffer_stats(&self, ctx: &SimContext) -> Result<BufferStats> {
        let Some(port) = self.port else {
            return Ok(BufferStats { used: 0, free: 0 });
        };
        let read = ctx.transport.get_handle_offset(port.read)?;
        let write = ctx.transport.get_handle_offset(port.write)?;
        let size = ctx.transport.get_buffer_size(port.read)?;
        let width = ctx.transport.get_handle_sample_size(port.read)?;
        Ok(buffer_stats(read, write, size, width))
    }
}
