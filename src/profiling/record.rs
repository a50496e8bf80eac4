//! Normalized records handed to statistics, sinks and the selector

use crate::backend::DeviceTimestamps;

use super::variant::VariantTag;

/// One observed completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    /// Display key, possibly qualified with a variant label
    pub key: String,
    /// Submission queue the operation was enqueued on
    pub queue: usize,
    /// Stable per-submission id, used as the interval id by sinks
    pub enqueue_counter: u64,
    /// Host clock reading at submission (ns)
    pub host_queued_ns: u64,
    pub device: DeviceTimestamps,
    pub variant: Option<VariantTag>,
}

impl CompletionRecord {
    /// Device execution time (start to end), the backend-side statistic
    pub fn device_delta(&self) -> u64 {
        self.device.start_to_end()
    }
}

/// One timed API call on the submitting thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCallRecord<'a> {
    pub name: &'a str,
    /// Shim-assigned id of the calling thread, see [`host_thread_id`]
    ///
    /// [`host_thread_id`]: crate::profiling::clock::host_thread_id
    pub thread: u64,
    /// Host clock reading at call entry (ns)
    pub start_ns: u64,
    pub duration_ns: u64,
}
