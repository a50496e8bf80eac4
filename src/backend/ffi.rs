//! OpenCL FFI types and constants
//!
//! Only the subset of the API the shim calls or virtualizes is declared here.
//! Nothing is linked at build time: every entry point is resolved at run time
//! into a [`DispatchTable`](super::dispatch::DispatchTable).

#![allow(non_camel_case_types)]

use std::ffi::{c_char, c_void};

pub type cl_int = i32;
pub type cl_uint = u32;
pub type cl_ulong = u64;
pub type cl_bool = cl_uint;
pub type cl_bitfield = cl_ulong;

pub type cl_platform_id = *mut c_void;
pub type cl_device_id = *mut c_void;
pub type cl_context = *mut c_void;
pub type cl_command_queue = *mut c_void;
pub type cl_mem = *mut c_void;
pub type cl_program = *mut c_void;
pub type cl_kernel = *mut c_void;
pub type cl_event = *mut c_void;

pub type cl_device_type = cl_bitfield;
pub type cl_mem_flags = cl_bitfield;
pub type cl_command_queue_properties = cl_bitfield;
pub type cl_queue_properties = cl_bitfield;
pub type cl_context_properties = isize;
pub type cl_device_partition_property = isize;

pub type cl_platform_info = cl_uint;
pub type cl_device_info = cl_uint;
pub type cl_context_info = cl_uint;
pub type cl_command_queue_info = cl_uint;
pub type cl_program_build_info = cl_uint;
pub type cl_kernel_info = cl_uint;
pub type cl_event_info = cl_uint;
pub type cl_profiling_info = cl_uint;

/// Context error notification callback
pub type ContextNotifyFn =
    unsafe extern "C" fn(errinfo: *const c_char, private_info: *const c_void, cb: usize, user_data: *mut c_void);

/// Program build completion callback
pub type ProgramNotifyFn = unsafe extern "C" fn(program: cl_program, user_data: *mut c_void);

/// Event status callback
pub type EventNotifyFn =
    unsafe extern "C" fn(event: cl_event, event_command_status: cl_int, user_data: *mut c_void);

// Status codes
pub const CL_SUCCESS: cl_int = 0;
pub const CL_OUT_OF_RESOURCES: cl_int = -5;
pub const CL_PROFILING_INFO_NOT_AVAILABLE: cl_int = -7;
pub const CL_INVALID_VALUE: cl_int = -30;
pub const CL_INVALID_EVENT: cl_int = -58;
pub const CL_INVALID_OPERATION: cl_int = -59;

// Command execution status
pub const CL_COMPLETE: cl_int = 0x0;
pub const CL_RUNNING: cl_int = 0x1;
pub const CL_SUBMITTED: cl_int = 0x2;
pub const CL_QUEUED: cl_int = 0x3;

// cl_event_info
pub const CL_EVENT_COMMAND_QUEUE: cl_event_info = 0x11D0;
pub const CL_EVENT_COMMAND_EXECUTION_STATUS: cl_event_info = 0x11D3;

// cl_profiling_info
pub const CL_PROFILING_COMMAND_QUEUED: cl_profiling_info = 0x1280;
pub const CL_PROFILING_COMMAND_SUBMIT: cl_profiling_info = 0x1281;
pub const CL_PROFILING_COMMAND_START: cl_profiling_info = 0x1282;
pub const CL_PROFILING_COMMAND_END: cl_profiling_info = 0x1283;

// cl_platform_info
pub const CL_PLATFORM_NAME: cl_platform_info = 0x0902;

pub const CL_TRUE: cl_bool = 1;
pub const CL_FALSE: cl_bool = 0;
