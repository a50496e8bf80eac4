//! Completion tracking, aggregation and fan-out
//!
//! [`TelemetryEngine`] owns the pending registry, the statistics store, the
//! trace sinks and the variant selector. A drain feeds each completion record
//! to the device-time statistics, every sink and, when the operation was a
//! variant dispatch, the selector.

use crate::backend::CompletionSource;
use crate::error::ShimResult;

use super::pending::{DrainOutcome, PendingOperation, PendingOperationRegistry};
use super::sinks::{TraceSink, TraceSinkSet};
use super::stats::{AggregateStatsStore, StatSide};
use super::variant::VariantSelector;

#[derive(Debug)]
pub struct TelemetryEngine {
    pub registry: PendingOperationRegistry,
    pub stats: AggregateStatsStore,
    pub sinks: TraceSinkSet,
    pub variants: VariantSelector,
    /// Whether device deltas go to the statistics store
    device_stats: bool,
}

impl TelemetryEngine {
    pub fn new(variant_warmup: u32, device_stats: bool) -> Self {
        TelemetryEngine {
            registry: PendingOperationRegistry::new(),
            stats: AggregateStatsStore::new(),
            sinks: TraceSinkSet::new(),
            variants: VariantSelector::new(variant_warmup),
            device_stats,
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn TraceSink>) {
        self.sinks.push(sink);
    }

    /// Start tracking a submission
    pub fn track(
        &mut self,
        source: &dyn CompletionSource,
        operation: PendingOperation,
    ) -> ShimResult<bool> {
        self.registry.register(source, operation)
    }

    /// Process every entry that is complete or invalid right now
    pub fn drain(&mut self, source: &dyn CompletionSource) -> DrainOutcome {
        let outcome = self.registry.drain(source);
        for record in &outcome.records {
            if self.device_stats {
                self.stats
                    .record(&record.key, StatSide::Backend, record.device_delta());
            }
            self.sinks.notify(record);
            if let Some(tag) = &record.variant {
                if let Err(err) = self.variants.on_completion(tag, record.device_delta()) {
                    tracing::warn!(key = %record.key, error = %err, "variant bookkeeping failed");
                }
            }
        }
        outcome
    }

    /// Wait for everything in flight, then drain it
    ///
    /// Blocks on the backend. Handles still tracked afterwards (the wait
    /// failed or some completed abnormally) are released without records.
    pub fn finish(&mut self, source: &dyn CompletionSource) -> DrainOutcome {
        if let Err(err) = self.registry.wait_all(source) {
            tracing::warn!(error = %err, "waiting for outstanding operations failed");
        }
        let outcome = self.drain(source);
        if !self.registry.is_empty() {
            let abandoned = self.registry.abandon_all(source);
            tracing::warn!(abandoned, "operations still pending at shutdown");
        }
        self.sinks.flush();
        outcome
    }
}
