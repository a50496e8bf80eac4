//! In-flight operations awaiting completion
//!
//! Records live in an arena (`slots` plus a free list); `by_handle` maps a
//! completion handle value to its arena slot and `order` keeps registration
//! order so a drain visits entries FIFO. The registry owns exactly one
//! retaining reference per entry and gives it back at most once: on observed
//! completion or abnormal termination. Handles the backend no longer
//! recognizes are dropped without a release.

use std::collections::HashMap;

use crate::backend::ffi::cl_event;
use crate::backend::{CompletionSource, HandleStatus};
use crate::error::ShimResult;

use super::record::CompletionRecord;
use super::variant::VariantTag;

/// Metadata kept for one submitted operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub key: String,
    /// Completion handle value (a `cl_event`)
    pub handle: usize,
    /// Submitting queue (a `cl_command_queue`)
    pub queue: usize,
    /// Host clock at submission (ns)
    pub submit_ns: u64,
    pub enqueue_counter: u64,
    pub variant: Option<VariantTag>,
}

impl PendingOperation {
    pub fn new(key: impl Into<String>, handle: usize, queue: usize, submit_ns: u64) -> Self {
        PendingOperation {
            key: key.into(),
            handle,
            queue,
            submit_ns,
            enqueue_counter: 0,
            variant: None,
        }
    }

    pub fn with_enqueue_counter(mut self, counter: u64) -> Self {
        self.enqueue_counter = counter;
        self
    }

    pub fn with_variant(mut self, tag: VariantTag) -> Self {
        self.variant = Some(tag);
        self
    }
}

/// Result of one drain pass
#[derive(Debug, Default)]
pub struct DrainOutcome {
    /// Completions with device timing, in registration order
    pub records: Vec<CompletionRecord>,
    /// Entries that completed but produced no record
    pub completed_without_timing: usize,
    /// Entries that terminated abnormally
    pub failed: usize,
    /// Entries whose handle became invalid
    pub invalid: usize,
    /// Entries left in the registry
    pub still_pending: usize,
}

impl DrainOutcome {
    pub fn removed(&self) -> usize {
        self.records.len() + self.completed_without_timing + self.failed + self.invalid
    }
}

#[derive(Debug, Default)]
pub struct PendingOperationRegistry {
    slots: Vec<Option<PendingOperation>>,
    free: Vec<usize>,
    by_handle: HashMap<usize, usize>,
    order: Vec<usize>,
    anomalies: u64,
}

impl PendingOperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    pub fn contains(&self, handle: usize) -> bool {
        self.by_handle.contains_key(&handle)
    }

    /// Invalid handles observed so far
    pub fn anomaly_count(&self) -> u64 {
        self.anomalies
    }

    /// Pending operations in registration order
    pub fn iter(&self) -> impl Iterator<Item = &PendingOperation> {
        self.order
            .iter()
            .filter_map(move |&index| self.slots[index].as_ref())
    }

    /// Track `operation`, retaining its handle through `source`
    ///
    /// Returns `Ok(false)` when the handle is already tracked; the existing
    /// entry keeps the only reference the registry holds.
    pub fn register(
        &mut self,
        source: &dyn CompletionSource,
        operation: PendingOperation,
    ) -> ShimResult<bool> {
        if self.by_handle.contains_key(&operation.handle) {
            tracing::warn!(
                key = %operation.key,
                handle = operation.handle,
                "completion handle registered twice, keeping first registration"
            );
            return Ok(false);
        }

        source.retain(operation.handle as cl_event)?;

        let handle = operation.handle;
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(operation);
                index
            }
            None => {
                self.slots.push(Some(operation));
                self.slots.len() - 1
            }
        };
        self.by_handle.insert(handle, index);
        self.order.push(index);
        Ok(true)
    }

    /// One non-blocking FIFO pass over every entry
    pub fn drain(&mut self, source: &dyn CompletionSource) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();
        let mut removed = Vec::new();

        for &index in &self.order {
            let Some(operation) = self.slots[index].as_ref() else {
                continue;
            };
            let handle = operation.handle as cl_event;

            match source.execution_status(handle) {
                HandleStatus::Pending => {
                    outcome.still_pending += 1;
                    continue;
                }
                HandleStatus::Complete => match source.device_timestamps(handle) {
                    Ok(device) => {
                        tracing::trace!(
                            key = %operation.key,
                            device_ns = device.start_to_end(),
                            "operation complete"
                        );
                        outcome.records.push(CompletionRecord {
                            key: operation.key.clone(),
                            queue: operation.queue,
                            enqueue_counter: operation.enqueue_counter,
                            host_queued_ns: operation.submit_ns,
                            device,
                            variant: operation.variant,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(
                            key = %operation.key,
                            error = %err,
                            "operation complete but profiling data unavailable"
                        );
                        outcome.completed_without_timing += 1;
                    }
                },
                HandleStatus::Failed(code) => {
                    tracing::warn!(
                        key = %operation.key,
                        status = code,
                        "operation terminated abnormally"
                    );
                    outcome.failed += 1;
                }
                HandleStatus::Invalid(code) => {
                    self.anomalies += 1;
                    tracing::warn!(
                        key = %operation.key,
                        handle = operation.handle,
                        status = code,
                        "tracked completion handle is no longer valid, dropping it"
                    );
                    outcome.invalid += 1;
                    removed.push(index);
                    continue;
                }
            }

            if let Err(err) = source.release(handle) {
                tracing::warn!(key = %operation.key, error = %err, "release failed");
            }
            removed.push(index);
        }

        for &index in &removed {
            self.remove_slot(index);
        }
        if !removed.is_empty() {
            self.order.retain(|&index| self.slots[index].is_some());
        }
        outcome
    }

    /// Block until every tracked handle completes
    pub fn wait_all(&self, source: &dyn CompletionSource) -> ShimResult<()> {
        let handles: Vec<cl_event> = self.iter().map(|op| op.handle as cl_event).collect();
        source.wait(&handles)
    }

    /// Release every tracked handle without producing records
    pub fn abandon_all(&mut self, source: &dyn CompletionSource) -> usize {
        let handles: Vec<usize> = self.iter().map(|op| op.handle).collect();
        for &handle in &handles {
            if let Err(err) = source.release(handle as cl_event) {
                tracing::warn!(handle, error = %err, "release failed while abandoning");
            }
        }
        self.slots.clear();
        self.free.clear();
        self.by_handle.clear();
        self.order.clear();
        handles.len()
    }

    fn remove_slot(&mut self, index: usize) {
        if let Some(operation) = self.slots[index].take() {
            self.by_handle.remove(&operation.handle);
            self.free.push(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ffi::{CL_INVALID_EVENT, CL_OUT_OF_RESOURCES};
    use crate::backend::DeviceTimestamps;
    use crate::error::ShimError;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy)]
    enum Fake {
        Pending,
        Complete(u64),
        Failed,
        Invalid,
    }

    #[derive(Default)]
    struct FakeSource {
        events: Mutex<HashMap<usize, Fake>>,
        retained: Mutex<Vec<usize>>,
        released: Mutex<Vec<usize>>,
    }

    impl FakeSource {
        fn set(&self, handle: usize, state: Fake) {
            self.events.lock().unwrap().insert(handle, state);
        }

        fn released(&self) -> Vec<usize> {
            self.released.lock().unwrap().clone()
        }
    }

    impl CompletionSource for FakeSource {
        fn execution_status(&self, handle: cl_event) -> HandleStatus {
            match self.events.lock().unwrap().get(&(handle as usize)) {
                Some(Fake::Pending) => HandleStatus::Pending,
                Some(Fake::Complete(_)) => HandleStatus::Complete,
                Some(Fake::Failed) => HandleStatus::Failed(CL_OUT_OF_RESOURCES),
                Some(Fake::Invalid) | None => HandleStatus::Invalid(CL_INVALID_EVENT),
            }
        }

        fn device_timestamps(&self, handle: cl_event) -> ShimResult<DeviceTimestamps> {
            match self.events.lock().unwrap().get(&(handle as usize)) {
                Some(Fake::Complete(duration)) => Ok(DeviceTimestamps {
                    queued: 1_000,
                    submitted: 1_100,
                    started: 1_200,
                    ended: 1_200 + duration,
                }),
                _ => Err(ShimError::InvalidHandle(handle as usize)),
            }
        }

        fn retain(&self, handle: cl_event) -> ShimResult<()> {
            if matches!(self.events.lock().unwrap().get(&(handle as usize)), Some(Fake::Invalid)) {
                return Err(ShimError::BackendCall {
                    call: "clRetainEvent",
                    code: CL_INVALID_EVENT,
                });
            }
            self.retained.lock().unwrap().push(handle as usize);
            Ok(())
        }

        fn release(&self, handle: cl_event) -> ShimResult<()> {
            self.released.lock().unwrap().push(handle as usize);
            Ok(())
        }

        fn wait(&self, handles: &[cl_event]) -> ShimResult<()> {
            let mut events = self.events.lock().unwrap();
            for &handle in handles {
                events.insert(handle as usize, Fake::Complete(1));
            }
            Ok(())
        }
    }

    fn op(key: &str, handle: usize) -> PendingOperation {
        PendingOperation::new(key, handle, 0xa0, 10)
    }

    #[test]
    fn test_register_retains_once() {
        let source = FakeSource::default();
        source.set(1, Fake::Pending);
        let mut registry = PendingOperationRegistry::new();

        assert!(registry.register(&source, op("k", 1)).unwrap());
        assert!(!registry.register(&source, op("k", 1)).unwrap());
        assert_eq!(registry.len(), 1);
        assert_eq!(source.retained.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_retain_registers_nothing() {
        let source = FakeSource::default();
        source.set(9, Fake::Invalid);
        let mut registry = PendingOperationRegistry::new();
        assert!(registry.register(&source, op("k", 9)).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain_mixed_states() {
        let source = FakeSource::default();
        let mut registry = PendingOperationRegistry::new();
        for (handle, state) in [
            (1, Fake::Complete(500)),
            (2, Fake::Pending),
            (3, Fake::Invalid),
            (4, Fake::Failed),
        ] {
            source.set(handle, Fake::Pending);
            registry.register(&source, op(&format!("op{handle}"), handle)).unwrap();
            source.set(handle, state);
        }

        let outcome = registry.drain(&source);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].key, "op1");
        assert_eq!(outcome.records[0].device_delta(), 500);
        assert_eq!(outcome.invalid, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.still_pending, 1);
        assert_eq!(outcome.removed(), 3);

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(2));
        assert_eq!(registry.anomaly_count(), 1);
        // Invalid handles are never released
        assert_eq!(source.released(), vec![1, 4]);
    }

    #[test]
    fn test_late_completion_does_not_block_on_earlier_pending() {
        let source = FakeSource::default();
        let mut registry = PendingOperationRegistry::new();
        source.set(1, Fake::Pending);
        source.set(2, Fake::Pending);
        registry.register(&source, op("slow", 1)).unwrap();
        registry.register(&source, op("fast", 2)).unwrap();
        source.set(2, Fake::Complete(7));

        let outcome = registry.drain(&source);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].key, "fast");
        assert!(registry.contains(1));
    }

    #[test]
    fn test_slots_are_reused_and_order_kept() {
        let source = FakeSource::default();
        let mut registry = PendingOperationRegistry::new();
        for handle in 1..=3 {
            source.set(handle, Fake::Pending);
            registry.register(&source, op(&format!("op{handle}"), handle)).unwrap();
        }
        source.set(1, Fake::Complete(1));
        registry.drain(&source);

        source.set(4, Fake::Pending);
        registry.register(&source, op("op4", 4)).unwrap();
        let keys: Vec<&str> = registry.iter().map(|op| op.key.as_str()).collect();
        assert_eq!(keys, vec!["op2", "op3", "op4"]);
        assert_eq!(registry.slots.len(), 3);
    }

    #[test]
    fn test_wait_all_then_drain_empties_registry() {
        let source = FakeSource::default();
        let mut registry = PendingOperationRegistry::new();
        for handle in 1..=3 {
            source.set(handle, Fake::Pending);
            registry.register(&source, op("k", handle)).unwrap();
        }
        registry.wait_all(&source).unwrap();
        let outcome = registry.drain(&source);
        assert_eq!(outcome.records.len(), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_abandon_all_releases_each_handle_once() {
        let source = FakeSource::default();
        let mut registry = PendingOperationRegistry::new();
        for handle in 1..=2 {
            source.set(handle, Fake::Pending);
            registry.register(&source, op("k", handle)).unwrap();
        }
        assert_eq!(registry.abandon_all(&source), 2);
        assert!(registry.is_empty());
        assert_eq!(source.released(), vec![1, 2]);
    }
}
