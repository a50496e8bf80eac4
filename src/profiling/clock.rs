//! Submitter-side clock
//!
//! All host wall-time deltas and the timeline's process-start reference come
//! from a [`HostClock`]. The production clock is monotonic; tests drive a
//! [`ManualClock`] so timestamps are deterministic.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic tick source with tick to nanosecond conversion
pub trait HostClock: Send + Sync + fmt::Debug {
    fn now_ticks(&self) -> u64;

    fn ticks_to_ns(&self, ticks: u64) -> u64;

    fn now_ns(&self) -> u64 {
        self.ticks_to_ns(self.now_ticks())
    }
}

/// `Instant`-backed clock; one tick is one nanosecond since construction
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for MonotonicClock {
    fn now_ticks(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn ticks_to_ns(&self, ticks: u64) -> u64 {
        ticks
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    ticks: AtomicU64,
    ns_per_tick: u64,
}

impl ManualClock {
    pub fn new(start_ticks: u64) -> Self {
        Self::with_tick_ns(start_ticks, 1)
    }

    /// Clock whose ticks are `ns_per_tick` nanoseconds long
    pub fn with_tick_ns(start_ticks: u64, ns_per_tick: u64) -> Self {
        ManualClock {
            ticks: AtomicU64::new(start_ticks),
            ns_per_tick: ns_per_tick.max(1),
        }
    }

    pub fn set(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl HostClock for ManualClock {
    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn ticks_to_ns(&self, ticks: u64) -> u64 {
        ticks.saturating_mul(self.ns_per_tick)
    }
}

/// Measures one host-side call from creation until [`HostSpan::finish`]
#[derive(Debug, Clone, Copy)]
pub struct HostSpan {
    start_ticks: u64,
}

impl HostSpan {
    pub fn begin(clock: &dyn HostClock) -> Self {
        HostSpan {
            start_ticks: clock.now_ticks(),
        }
    }

    pub fn start_ticks(&self) -> u64 {
        self.start_ticks
    }

    /// Returns `(start, end)` in ticks
    pub fn finish(self, clock: &dyn HostClock) -> (u64, u64) {
        (self.start_ticks, clock.now_ticks())
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Small positive id for the calling thread, stable for its lifetime
///
/// Used as the timeline track of host calls; queues use negative ids.
pub fn host_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}
