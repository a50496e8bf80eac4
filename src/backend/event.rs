//! Completion handle queries
//!
//! The telemetry engine never talks to the dispatch table directly; it goes
//! through [`CompletionSource`], which the table implements by calling the
//! backend's event entry points.

use std::ffi::c_void;
use std::mem;
use std::ptr;

use serde::Serialize;

use super::dispatch::DispatchTable;
use super::ffi::*;
use crate::error::{check_status, ShimResult};

/// Execution state of a completion handle, as seen by one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    /// The operation finished successfully
    Complete,
    /// Queued, submitted or running
    Pending,
    /// The operation terminated abnormally with this status
    Failed(cl_int),
    /// The status query itself failed; the backend no longer knows the handle
    Invalid(cl_int),
}

/// Device-side timestamps of a completed operation (ns)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceTimestamps {
    pub queued: u64,
    pub submitted: u64,
    pub started: u64,
    pub ended: u64,
}

impl DeviceTimestamps {
    pub fn queued_to_submit(&self) -> u64 {
        self.submitted.saturating_sub(self.queued)
    }

    pub fn submit_to_start(&self) -> u64 {
        self.started.saturating_sub(self.submitted)
    }

    /// Execution time, the value fed to device statistics
    pub fn start_to_end(&self) -> u64 {
        self.ended.saturating_sub(self.started)
    }

    pub fn is_ordered(&self) -> bool {
        self.queued <= self.submitted && self.submitted <= self.started && self.started <= self.ended
    }
}

/// Backend operations the pending registry relies on
pub trait CompletionSource {
    /// Non-blocking status poll
    fn execution_status(&self, handle: cl_event) -> HandleStatus;

    /// Profiling timestamps of a complete handle
    fn device_timestamps(&self, handle: cl_event) -> ShimResult<DeviceTimestamps>;

    fn retain(&self, handle: cl_event) -> ShimResult<()>;

    fn release(&self, handle: cl_event) -> ShimResult<()>;

    /// Block until every handle completes
    fn wait(&self, handles: &[cl_event]) -> ShimResult<()>;
}

impl DispatchTable {
    fn profiling_value(&self, handle: cl_event, param: cl_profiling_info) -> ShimResult<u64> {
        let mut value: cl_ulong = 0;
        // SAFETY: the output buffer is a live cl_ulong of the advertised size.
        let status = unsafe {
            (self.clGetEventProfilingInfo)(
                handle,
                param,
                mem::size_of::<cl_ulong>(),
                &mut value as *mut cl_ulong as *mut c_void,
                ptr::null_mut(),
            )
        };
        check_status("clGetEventProfilingInfo", status)?;
        Ok(value)
    }
}

impl CompletionSource for DispatchTable {
    fn execution_status(&self, handle: cl_event) -> HandleStatus {
        let mut execution: cl_int = CL_QUEUED;
        // SAFETY: the output buffer is a live cl_int of the advertised size.
        let status = unsafe {
            (self.clGetEventInfo)(
                handle,
                CL_EVENT_COMMAND_EXECUTION_STATUS,
                mem::size_of::<cl_int>(),
                &mut execution as *mut cl_int as *mut c_void,
                ptr::null_mut(),
            )
        };

        if status != CL_SUCCESS {
            HandleStatus::Invalid(status)
        } else if execution == CL_COMPLETE {
            HandleStatus::Complete
        } else if execution < 0 {
            HandleStatus::Failed(execution)
        } else {
            HandleStatus::Pending
        }
    }

    fn device_timestamps(&self, handle: cl_event) -> ShimResult<DeviceTimestamps> {
        Ok(DeviceTimestamps {
            queued: self.profiling_value(handle, CL_PROFILING_COMMAND_QUEUED)?,
            submitted: self.profiling_value(handle, CL_PROFILING_COMMAND_SUBMIT)?,
            started: self.profiling_value(handle, CL_PROFILING_COMMAND_START)?,
            ended: self.profiling_value(handle, CL_PROFILING_COMMAND_END)?,
        })
    }

    fn retain(&self, handle: cl_event) -> ShimResult<()> {
        // SAFETY: plain handle argument, no pointers dereferenced by the shim.
        check_status("clRetainEvent", unsafe { (self.clRetainEvent)(handle) })
    }

    fn release(&self, handle: cl_event) -> ShimResult<()> {
        // SAFETY: plain handle argument, no pointers dereferenced by the shim.
        check_status("clReleaseEvent", unsafe { (self.clReleaseEvent)(handle) })
    }

    fn wait(&self, handles: &[cl_event]) -> ShimResult<()> {
        if handles.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = handles.len(), "blocking on outstanding completion handles");
        // SAFETY: the slice outlives the call and its length is passed along.
        let status = unsafe { (self.clWaitForEvents)(handles.len() as cl_uint, handles.as_ptr()) };
        check_status("clWaitForEvents", status)
    }
}
