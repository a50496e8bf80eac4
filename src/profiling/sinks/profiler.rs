//! Bridge to an external profiler's clock domains
//!
//! An external profiler needs device timestamps expressed in its own clock.
//! For every queue the bridge derives a [`ClockSyncContext`] once, from the
//! first record seen on that queue, and translates all later device
//! timestamps on the queue by the same fixed offset. A queue whose clock
//! domain cannot be created is remembered as failed and its records are
//! dropped from this sink only.

use std::collections::HashMap;

use super::TraceSink;
use crate::error::{ShimError, ShimResult};
use crate::profiling::record::CompletionRecord;

pub type ClockDomainId = u64;

/// Interval translated into the profiler's clock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilerInterval<'a> {
    pub domain: ClockDomainId,
    pub queue: usize,
    /// Stable per-submission id so overlapping intervals nest correctly
    pub id: u64,
    pub name: &'a str,
    pub begin_ns: u64,
    pub end_ns: u64,
}

/// An external profiler that groups intervals by clock domain
pub trait ProfilerDomain: Send {
    fn create_clock_domain(&mut self, queue: usize) -> ShimResult<ClockDomainId>;

    fn emit_interval(&mut self, interval: &ProfilerInterval<'_>) -> ShimResult<()>;
}

/// Fixed host/device correspondence for one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSyncContext {
    pub domain: ClockDomainId,
    /// Host clock at the reference point (ns)
    pub host_reference_ns: u64,
    /// Device clock at the same reference point (ns)
    pub device_reference_ns: u64,
}

impl ClockSyncContext {
    /// Map a device timestamp into host time
    pub fn translate(&self, device_ns: u64) -> u64 {
        let shifted = i128::from(self.host_reference_ns) + i128::from(device_ns)
            - i128::from(self.device_reference_ns);
        shifted.clamp(0, i128::from(u64::MAX)) as u64
    }
}

pub struct ProfilerBridgeSink {
    domain: Box<dyn ProfilerDomain>,
    /// `None` marks a queue whose clock domain could not be created
    contexts: HashMap<usize, Option<ClockSyncContext>>,
    dropped: u64,
}

impl ProfilerBridgeSink {
    pub fn new(domain: Box<dyn ProfilerDomain>) -> Self {
        ProfilerBridgeSink {
            domain,
            contexts: HashMap::new(),
            dropped: 0,
        }
    }

    /// Records dropped because their queue has no clock domain
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn context(&self, queue: usize) -> Option<ClockSyncContext> {
        self.contexts.get(&queue).copied().flatten()
    }

    fn context_for(&mut self, record: &CompletionRecord) -> Option<ClockSyncContext> {
        if let Some(known) = self.contexts.get(&record.queue) {
            return *known;
        }

        let derived = match self.domain.create_clock_domain(record.queue) {
            Ok(domain) => Some(ClockSyncContext {
                domain,
                host_reference_ns: record.host_queued_ns,
                device_reference_ns: record.device.queued,
            }),
            Err(err) => {
                tracing::warn!(
                    queue = record.queue,
                    error = %err,
                    "no clock domain for queue, profiler intervals for it are dropped"
                );
                None
            }
        };
        self.contexts.insert(record.queue, derived);
        derived
    }
}

impl TraceSink for ProfilerBridgeSink {
    fn name(&self) -> &'static str {
        "profiler"
    }

    fn on_completion(&mut self, record: &CompletionRecord) -> ShimResult<()> {
        let Some(context) = self.context_for(record) else {
            self.dropped += 1;
            return Ok(());
        };

        let interval = ProfilerInterval {
            domain: context.domain,
            queue: record.queue,
            id: record.enqueue_counter,
            name: &record.key,
            begin_ns: context.translate(record.device.started),
            end_ns: context.translate(record.device.ended),
        };
        self.domain.emit_interval(&interval)
    }
}

/// Publishes intervals as structured `tracing` events
#[derive(Debug, Default)]
pub struct TracingDomain {
    next_domain: ClockDomainId,
}

impl TracingDomain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfilerDomain for TracingDomain {
    fn create_clock_domain(&mut self, queue: usize) -> ShimResult<ClockDomainId> {
        if queue == 0 {
            return Err(ShimError::ClockDomain {
                queue,
                reason: "null queue".to_string(),
            });
        }
        self.next_domain += 1;
        tracing::debug!(queue, domain = self.next_domain, "clock domain created");
        Ok(self.next_domain)
    }

    fn emit_interval(&mut self, interval: &ProfilerInterval<'_>) -> ShimResult<()> {
        tracing::info!(
            target: "clshim::profiler",
            domain = interval.domain,
            queue = interval.queue,
            id = interval.id,
            operation = interval.name,
            begin_ns = interval.begin_ns,
            end_ns = interval.end_ns,
            "interval"
        );
        Ok(())
    }
}
