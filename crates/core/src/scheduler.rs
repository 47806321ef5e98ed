//! Virtual-time event scheduler.
//!
//! A single cooperative queue keyed by virtual time. Nothing here touches a
//! wall clock: time only moves forward when an event is popped.
//!
//! # Implementation
//!
//! Uses a priority queue (min-heap) keyed by `(due, sequence)`. Virtual time is
//! kept in integer nanoseconds so that events scheduled for the same instant
//! fire in insertion order and never reorder due to float rounding.
//!
//! Cancellation is lazy: a cancelled handle is dropped from the pending set
//! and its heap entry is discarded when it reaches the top.
//!
//! # Drift correction
//!
//! Device timers have microsecond resolution, so a nominal period such as
//! 1/48000 s cannot be represented exactly. [`compute_period`] truncates the
//! period to the resolution and carries the truncated part into the next
//! period, so the long-run rate matches the nominal one.

use std::collections::{BinaryHeap, HashSet};

/// Timer resolution of the simulated device (1 µs).
pub const TIMER_RESOLUTION: f64 = 1e-6;

const NANOS_PER_SEC: f64 = 1e9;

/// Opaque identifier of a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Logical timer slots a stream may own. At most one handle per slot is
/// pending at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerSlot {
    /// Source packet transmission
    Transmit,
    /// Sink packet reception
    Receive,
    /// Delayed start and loop restart
    Loop,
}

impl TimerSlot {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            TimerSlot::Transmit => 0,
            TimerSlot::Receive => 1,
            TimerSlot::Loop => 2,
        }
    }
}

/// An event with scheduled firing time.
#[derive(Debug)]
struct Scheduled<E> {
    due: u64,
    seq: u64,
    event: E,
}

// Implement ordering for the heap (min-heap: earliest due first, then FIFO)
impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Cooperative virtual-time scheduler.
///
/// # Thread Safety
/// Not thread-safe; the whole simulation runs on one thread.
#[derive(Debug)]
pub struct Scheduler<E> {
    now: u64,
    next_seq: u64,
    queue: BinaryHeap<Scheduled<E>>,
    pending: HashSet<u64>,
}

impl<E> Scheduler<E> {
    /// Create a scheduler with virtual time at zero.
    pub fn new() -> Self {
        Self {
            now: 0,
            next_seq: 0,
            queue: BinaryHeap::new(),
            pending: HashSet::new(),
        }
    }

    /// Current virtual time in seconds.
    pub fn now(&self) -> f64 {
        self.now as f64 / NANOS_PER_SEC
    }

    /// Current virtual time in nanoseconds.
    pub fn now_nanos(&self) -> u64 {
        self.now
    }

    /// Schedule `event` to fire `period` seconds from now.
    pub fn add_relative(&mut self, period: f64, event: E) -> TimerHandle {
        let due = self.now.saturating_add(secs_to_nanos(period));
        self.push(due, event)
    }

    /// Schedule `event` at an absolute virtual time in seconds.
    ///
    /// Times in the past fire at the current instant.
    pub fn add_absolute(&mut self, at: f64, event: E) -> TimerHandle {
        let due = secs_to_nanos(at).max(self.now);
        self.push(due, event)
    }

    /// Queue `event` for the current instant, after anything already due now.
    pub fn post(&mut self, event: E) -> TimerHandle {
        self.push(self.now, event)
    }

    /// Cancel a pending event.
    ///
    /// # Returns
    /// `true` if the handle was pending. Cancelling a fired or already
    /// cancelled handle is a no-op returning `false`.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.pending.remove(&handle.0)
    }

    /// Check whether a handle is still waiting to fire.
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.pending.contains(&handle.0)
    }

    /// Number of events waiting to fire.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Virtual time (seconds) of the earliest pending event.
    pub fn next_due(&mut self) -> Option<f64> {
        self.discard_cancelled();
        self.queue.peek().map(|s| s.due as f64 / NANOS_PER_SEC)
    }

    /// Pop the next event due at or before `limit` seconds, advancing virtual
    /// time to its due time.
    ///
    /// # Returns
    /// - `Some((handle, event))` if an event is due within the limit
    /// - `None` if the queue is empty or the next event is later
    pub fn pop_until(&mut self, limit: f64) -> Option<(TimerHandle, E)> {
        let limit = secs_to_nanos(limit);
        self.discard_cancelled();

        if self.queue.peek()?.due > limit {
            return None;
        }
        let scheduled = self.queue.pop()?;
        self.pending.remove(&scheduled.seq);
        self.now = self.now.max(scheduled.due);
        Some((TimerHandle(scheduled.seq), scheduled.event))
    }

    /// Move virtual time forward without firing anything.
    ///
    /// Time never moves backwards.
    pub fn advance_to(&mut self, at: f64) {
        self.now = self.now.max(secs_to_nanos(at));
    }

    fn push(&mut self, due: u64, event: E) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(seq);
        self.queue.push(Scheduled { due, seq, event });
        TimerHandle(seq)
    }

    fn discard_cancelled(&mut self) {
        while let Some(top) = self.queue.peek() {
            if self.pending.contains(&top.seq) {
                break;
            }
            self.queue.pop();
        }
    }
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles a stream owns, one per [`TimerSlot`].
///
/// Arming a slot cancels whatever was pending in it, so a stream never holds
/// more than one handle per slot.
#[derive(Debug, Default, Clone)]
pub struct OwnedTimers {
    slots: [Option<TimerHandle>; TimerSlot::COUNT],
}

impl OwnedTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `event` in `slot`, replacing any pending handle there.
    pub fn arm<E>(
        &mut self,
        scheduler: &mut Scheduler<E>,
        slot: TimerSlot,
        period: f64,
        event: E,
    ) -> TimerHandle {
        self.cancel(scheduler, slot);
        let handle = scheduler.add_relative(period, event);
        self.slots[slot.index()] = Some(handle);
        handle
    }

    /// Acknowledge a fired event.
    ///
    /// # Returns
    /// `true` if `handle` is the one currently tracked for `slot`; the slot is
    /// then cleared. A stale handle returns `false` and must be ignored.
    pub fn fired(&mut self, slot: TimerSlot, handle: TimerHandle) -> bool {
        let entry = &mut self.slots[slot.index()];
        if *entry == Some(handle) {
            *entry = None;
            true
        } else {
            false
        }
    }

    /// Cancel the handle pending in `slot`, if any.
    pub fn cancel<E>(&mut self, scheduler: &mut Scheduler<E>, slot: TimerSlot) {
        if let Some(handle) = self.slots[slot.index()].take() {
            scheduler.cancel(handle);
        }
    }

    /// Cancel every owned handle.
    pub fn cancel_all<E>(&mut self, scheduler: &mut Scheduler<E>) {
        for slot in [TimerSlot::Transmit, TimerSlot::Receive, TimerSlot::Loop] {
            self.cancel(scheduler, slot);
        }
    }

    pub fn is_armed(&self, slot: TimerSlot) -> bool {
        self.slots[slot.index()].is_some()
    }
}

/// Compute the next timer period given a carried remainder.
///
/// # Arguments
/// - `period`: nominal period in seconds
/// - `remainder`: remainder carried from the previous tick
/// - `resolution`: timer resolution in seconds (e.g. 1e-6)
///
/// # Returns
/// `(period', remainder')` where `period'` is `period + remainder` truncated
/// to the resolution and `remainder'` is the truncated part.
pub fn compute_period(period: f64, remainder: f64, resolution: f64) -> (f64, f64) {
    let total = (period + remainder) * NANOS_PER_SEC;
    let step = (resolution * NANOS_PER_SEC).max(1.0);
    // Sub-picosecond slack keeps exact multiples from truncating one step low
    let steps = ((total + 1e-3) / step).floor();
    let truncated = steps * step;
    let carried = (total - truncated).max(0.0);
    (truncated / NANOS_PER_SEC, carried / NANOS_PER_SEC)
}

/// Period generator that carries the truncation remainder between ticks.
#[derive(Debug, Default, Clone, Copy)]
pub struct DriftCorrector {
    remainder: f64,
}

impl DriftCorrector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next period for a nominal `period`, at [`TIMER_RESOLUTION`].
    pub fn next_period(&mut self, period: f64) -> f64 {
        let (next, remainder) = compute_period(period, self.remainder, TIMER_RESOLUTION);
        self.remainder = remainder;
        next
    }

    pub fn reset(&mut self) {
        self.remainder = 0.0;
    }
}

/// Scale a nominal period by a wallclock accuracy in parts per million.
pub fn wallclock_scaled(period: f64, accuracy_ppm: f64) -> f64 {
    (1e6 + accuracy_ppm) / 1e6 * period
}

fn secs_to_nanos(secs: f64) -> u64 {
    (secs * NANOS_PER_SEC).round().max(0.0) as u64
}
