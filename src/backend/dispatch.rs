//! Virtual dispatch table
//!
//! [`DispatchTable`] holds one typed function pointer per virtualized entry
//! point. A table is never partially initialized: every slot starts on a stub
//! that logs the call and returns `CL_INVALID_OPERATION` (object-returning
//! entry points also write `errcode_ret` and return null), and resolution only
//! ever replaces a stub with a real symbol. Callers can therefore invoke any
//! slot at any time, including before the backend is loaded and after every
//! backend candidate has been rejected.
//!
//! The table is generated by `dispatch_table!` so that the struct, the stubs,
//! the entry catalog and the resolution routine can never drift apart.

use std::ffi::{c_char, c_void};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::ffi::*;
use super::loader::SymbolSource;
use crate::error::{ShimError, ShimResult};

/// Whether a backend must export an entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    /// Missing symbol rejects the backend candidate
    Required,
    /// Missing symbol leaves the slot on its stub
    Optional,
}

/// Static description of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySpec {
    pub name: &'static str,
    pub kind: EntryKind,
}

/// Resolution outcome for one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchEntry {
    pub name: &'static str,
    pub kind: EntryKind,
    /// Address of the resolved backend symbol, `None` when the slot is a stub
    pub address: Option<usize>,
}

impl DispatchEntry {
    pub fn is_resolved(&self) -> bool {
        self.address.is_some()
    }
}

/// Per-slot record of how a table was built
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolutionReport {
    /// Description of the symbol source the table was resolved from
    pub library: String,
    pub entries: Vec<DispatchEntry>,
}

impl ResolutionReport {
    /// Report for a table that never saw a backend
    pub fn unresolved() -> Self {
        ResolutionReport {
            library: String::from("<stub>"),
            entries: DispatchTable::ENTRIES
                .iter()
                .map(|spec| DispatchEntry {
                    name: spec.name,
                    kind: spec.kind,
                    address: None,
                })
                .collect(),
        }
    }

    pub fn entry(&self, name: &str) -> Option<&DispatchEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn is_resolved(&self, name: &str) -> bool {
        self.entry(name).is_some_and(DispatchEntry::is_resolved)
    }

    pub fn resolved_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_resolved()).count()
    }

    /// Optional entry points the backend does not export
    pub fn missing_optional(&self) -> impl Iterator<Item = &DispatchEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.kind == EntryKind::Optional && !entry.is_resolved())
    }
}

static STUB_CALLS: AtomicU64 = AtomicU64::new(0);

/// Number of calls that landed on a stub since process start
pub fn stub_call_count() -> u64 {
    STUB_CALLS.load(Ordering::Relaxed)
}

// Must not panic, see STUB_DISPATCH
fn report_stub_call(name: &'static str) {
    STUB_CALLS.fetch_add(1, Ordering::Relaxed);
    tracing::error!(
        entry_point = name,
        "call through an unresolved dispatch slot, returning CL_INVALID_OPERATION"
    );
}

/// Stub body shared by entry points returning an object handle
unsafe fn fail_object(errcode_ret: *mut cl_int) -> *mut c_void {
    if !errcode_ret.is_null() {
        *errcode_ret = CL_INVALID_OPERATION;
    }
    ptr::null_mut()
}

fn lookup(
    source: &dyn SymbolSource,
    name: &'static str,
    kind: EntryKind,
) -> ShimResult<Option<NonNull<c_void>>> {
    match source.symbol(name) {
        Some(symbol) => {
            tracing::trace!(entry_point = name, address = ?symbol, "resolved");
            Ok(Some(symbol))
        }
        None if kind == EntryKind::Required => Err(ShimError::MissingRequiredEntryPoint {
            name,
            library: source.describe().to_string(),
        }),
        None => {
            tracing::debug!(
                entry_point = name,
                library = source.describe(),
                "optional entry point not exported, keeping stub"
            );
            Ok(None)
        }
    }
}

macro_rules! dispatch_table {
    ($(
        $kind:ident fn $name:ident($($arg:ident: $ty:ty),* $(,)?) -> $ret:ty => $stub:expr;
    )*) => {
        /// Typed function pointers for every virtualized entry point
        #[allow(non_snake_case)]
        #[derive(Clone, Copy)]
        pub struct DispatchTable {
            $( pub $name: unsafe extern "C" fn($($ty),*) -> $ret, )*
        }

        #[allow(non_snake_case, unused_variables)]
        mod stubs {
            use super::*;

            $(
                pub(super) unsafe extern "C" fn $name($($arg: $ty),*) -> $ret {
                    report_stub_call(stringify!($name));
                    $stub
                }
            )*
        }

        impl DispatchTable {
            /// Every slot, in declaration order
            pub const ENTRIES: &'static [EntrySpec] = &[
                $( EntrySpec { name: stringify!($name), kind: EntryKind::$kind }, )*
            ];

            /// A table whose every slot is a stub
            pub const fn stubbed() -> Self {
                DispatchTable {
                    $( $name: stubs::$name, )*
                }
            }

            /// Resolve every slot from `source`
            ///
            /// Fails on the first missing required entry point; the caller
            /// moves on to its next candidate.
            pub fn resolve(source: &dyn SymbolSource) -> ShimResult<(Self, ResolutionReport)> {
                let mut table = Self::stubbed();
                let mut entries = Vec::with_capacity(Self::ENTRIES.len());
                $(
                    let found = lookup(source, stringify!($name), EntryKind::$kind)?;
                    if let Some(symbol) = found {
                        // SAFETY: the backend exports this symbol under the entry
                        // point's name, so its ABI is the one declared for the slot.
                        table.$name = unsafe {
                            std::mem::transmute::<*mut c_void, unsafe extern "C" fn($($ty),*) -> $ret>(
                                symbol.as_ptr(),
                            )
                        };
                    }
                    entries.push(DispatchEntry {
                        name: stringify!($name),
                        kind: EntryKind::$kind,
                        address: found.map(|symbol| symbol.as_ptr() as usize),
                    });
                )*
                let report = ResolutionReport {
                    library: source.describe().to_string(),
                    entries,
                };
                Ok((table, report))
            }

            /// Current address of a slot, `None` for unknown names
            pub fn slot_address(&self, name: &str) -> Option<usize> {
                match name {
                    $( stringify!($name) => Some(self.$name as usize), )*
                    _ => None,
                }
            }

            /// Whether a slot still points at its stub
            pub fn is_stub(&self, name: &str) -> bool {
                match name {
                    $( stringify!($name) => self.$name as usize == stubs::$name as usize, )*
                    _ => false,
                }
            }
        }
    };
}

dispatch_table! {
    Required fn clGetPlatformIDs(
        num_entries: cl_uint,
        platforms: *mut cl_platform_id,
        num_platforms: *mut cl_uint,
    ) -> cl_int => CL_INVALID_OPERATION;

    Required fn clGetPlatformInfo(
        platform: cl_platform_id,
        param_name: cl_platform_info,
        param_value_size: usize,
        param_value: *mut c_void,
        param_value_size_ret: *mut usize,
    ) -> cl_int => CL_INVALID_OPERATION;

    Required fn clGetDeviceIDs(
        platform: cl_platform_id,
        device_type: cl_device_type,
        num_entries: cl_uint,
        devices: *mut cl_device_id,
        num_devices: *mut cl_uint,
    ) -> cl_int => CL_INVALID_OPERATION;

    Required fn clGetDeviceInfo(
        device: cl_device_id,
        param_name: cl_device_info,
        param_value_size: usize,
        param_value: *mut c_void,
        param_value_size_ret: *mut usize,
    ) -> cl_int => CL_INVALID_OPERATION;

    Optional fn clCreateSubDevices(
        in_device: cl_device_id,
        properties: *const cl_device_partition_property,
        num_devices: cl_uint,
        out_devices: *mut cl_device_id,
        num_devices_ret: *mut cl_uint,
    ) -> cl_int => CL_INVALID_OPERATION;

    Optional fn clRetainDevice(device: cl_device_id) -> cl_int => CL_INVALID_OPERATION;

    Optional fn clReleaseDevice(device: cl_device_id) -> cl_int => CL_INVALID_OPERATION;

    Required fn clCreateContext(
        properties: *const cl_context_properties,
        num_devices: cl_uint,
        devices: *const cl_device_id,
        pfn_notify: Option<ContextNotifyFn>,
        user_data: *mut c_void,
        errcode_ret: *mut cl_int,
    ) -> cl_context => fail_object(errcode_ret);

    Required fn clRetainContext(context: cl_context) -> cl_int => CL_INVALID_OPERATION;

    Required fn clReleaseContext(context: cl_context) -> cl_int => CL_INVALID_OPERATION;

    Required fn clGetContextInfo(
        context: cl_context,
        param_name: cl_context_info,
        param_value_size: usize,
        param_value: *mut c_void,
        param_value_size_ret: *mut usize,
    ) -> cl_int => CL_INVALID_OPERATION;

    Required fn clCreateCommandQueue(
        context: cl_context,
        device: cl_device_id,
        properties: cl_command_queue_properties,
        errcode_ret: *mut cl_int,
    ) -> cl_command_queue => fail_object(errcode_ret);

    Optional fn clCreateCommandQueueWithProperties(
        context: cl_context,
        device: cl_device_id,
        properties: *const cl_queue_properties,
        errcode_ret: *mut cl_int,
    ) -> cl_command_queue => fail_object(errcode_ret);

    Required fn clRetainCommandQueue(command_queue: cl_command_queue) -> cl_int => CL_INVALID_OPERATION;

    Required fn clReleaseCommandQueue(command_queue: cl_command_queue) -> cl_int => CL_INVALID_OPERATION;

    Required fn clGetCommandQueueInfo(
        command_queue: cl_command_queue,
        param_name: cl_command_queue_info,
        param_value_size: usize,
        param_value: *mut c_void,
        param_value_size_ret: *mut usize,
    ) -> cl_int => CL_INVALID_OPERATION;

    Required fn clCreateBuffer(
        context: cl_context,
        flags: cl_mem_flags,
        size: usize,
        host_ptr: *mut c_void,
        errcode_ret: *mut cl_int,
    ) -> cl_mem => fail_object(errcode_ret);

    Required fn clRetainMemObject(memobj: cl_mem) -> cl_int => CL_INVALID_OPERATION;

    Required fn clReleaseMemObject(memobj: cl_mem) -> cl_int => CL_INVALID_OPERATION;

    Required fn clCreateProgramWithSource(
        context: cl_context,
        count: cl_uint,
        strings: *const *const c_char,
        lengths: *const usize,
        errcode_ret: *mut cl_int,
    ) -> cl_program => fail_object(errcode_ret);

    Required fn clBuildProgram(
        program: cl_program,
        num_devices: cl_uint,
        device_list: *const cl_device_id,
        options: *const c_char,
        pfn_notify: Option<ProgramNotifyFn>,
        user_data: *mut c_void,
    ) -> cl_int => CL_INVALID_OPERATION;

    Required fn clGetProgramBuildInfo(
        program: cl_program,
        device: cl_device_id,
        param_name: cl_program_build_info,
        param_value_size: usize,
        param_value: *mut c_void,
        param_value_size_ret: *mut usize,
    ) -> cl_int => CL_INVALID_OPERATION;

    Required fn clRetainProgram(program: cl_program) -> cl_int => CL_INVALID_OPERATION;

    Required fn clReleaseProgram(program: cl_program) -> cl_int => CL_INVALID_OPERATION;

    Required fn clCreateKernel(
        program: cl_program,
        kernel_name: *const c_char,
        errcode_ret: *mut cl_int,
    ) -> cl_kernel => fail_object(errcode_ret);

    Required fn clSetKernelArg(
        kernel: cl_kernel,
        arg_index: cl_uint,
        arg_size: usize,
        arg_value: *const c_void,
    ) -> cl_int => CL_INVALID_OPERATION;

    Required fn clGetKernelInfo(
        kernel: cl_kernel,
        param_name: cl_kernel_info,
        param_value_size: usize,
        param_value: *mut c_void,
        param_value_size_ret: *mut usize,
    ) -> cl_int => CL_INVALID_OPERATION;

    Required fn clRetainKernel(kernel: cl_kernel) -> cl_int => CL_INVALID_OPERATION;

    Required fn clReleaseKernel(kernel: cl_kernel) -> cl_int => CL_INVALID_OPERATION;

    Required fn clWaitForEvents(num_events: cl_uint, event_list: *const cl_event) -> cl_int
        => CL_INVALID_OPERATION;

    Required fn clGetEventInfo(
        event: cl_event,
        param_name: cl_event_info,
        param_value_size: usize,
        param_value: *mut c_void,
        param_value_size_ret: *mut usize,
    ) -> cl_int => CL_INVALID_OPERATION;

    Optional fn clSetEventCallback(
        event: cl_event,
        command_exec_callback_type: cl_int,
        pfn_notify: Option<EventNotifyFn>,
        user_data: *mut c_void,
    ) -> cl_int => CL_INVALID_OPERATION;

    Required fn clRetainEvent(event: cl_event) -> cl_int => CL_INVALID_OPERATION;

    Required fn clReleaseEvent(event: cl_event) -> cl_int => CL_INVALID_OPERATION;

    Required fn clGetEventProfilingInfo(
        event: cl_event,
        param_name: cl_profiling_info,
        param_value_size: usize,
        param_value: *mut c_void,
        param_value_size_ret: *mut usize,
    ) -> cl_int => CL_INVALID_OPERATION;

    Required fn clFlush(command_queue: cl_command_queue) -> cl_int => CL_INVALID_OPERATION;

    Required fn clFinish(command_queue: cl_command_queue) -> cl_int => CL_INVALID_OPERATION;

    Required fn clEnqueueReadBuffer(
        command_queue: cl_command_queue,
        buffer: cl_mem,
        blocking_read: cl_bool,
        offset: usize,
        size: usize,
        ptr: *mut c_void,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const cl_event,
        event: *mut cl_event,
    ) -> cl_int => CL_INVALID_OPERATION;

    Required fn clEnqueueWriteBuffer(
        command_queue: cl_command_queue,
        buffer: cl_mem,
        blocking_write: cl_bool,
        offset: usize,
        size: usize,
        ptr: *const c_void,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const cl_event,
        event: *mut cl_event,
    ) -> cl_int => CL_INVALID_OPERATION;

    Optional fn clEnqueueFillBuffer(
        command_queue: cl_command_queue,
        buffer: cl_mem,
        pattern: *const c_void,
        pattern_size: usize,
        offset: usize,
        size: usize,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const cl_event,
        event: *mut cl_event,
    ) -> cl_int => CL_INVALID_OPERATION;

    Required fn clEnqueueNDRangeKernel(
        command_queue: cl_command_queue,
        kernel: cl_kernel,
        work_dim: cl_uint,
        global_work_offset: *const usize,
        global_work_size: *const usize,
        local_work_size: *const usize,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const cl_event,
        event: *mut cl_event,
    ) -> cl_int => CL_INVALID_OPERATION;

    Optional fn clEnqueueMarkerWithWaitList(
        command_queue: cl_command_queue,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const cl_event,
        event: *mut cl_event,
    ) -> cl_int => CL_INVALID_OPERATION;

    Required fn clGetExtensionFunctionAddress(func_name: *const c_char) -> *mut c_void
        => ptr::null_mut();

    Optional fn clGetExtensionFunctionAddressForPlatform(
        platform: cl_platform_id,
        func_name: *const c_char,
    ) -> *mut c_void => ptr::null_mut();

    Optional fn clGetDeviceAndHostTimer(
        device: cl_device_id,
        device_timestamp: *mut cl_ulong,
        host_timestamp: *mut cl_ulong,
    ) -> cl_int => CL_INVALID_OPERATION;

    Optional fn clGetHostTimer(device: cl_device_id, host_timestamp: *mut cl_ulong) -> cl_int
        => CL_INVALID_OPERATION;
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::stubbed()
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stubs = Self::ENTRIES
            .iter()
            .filter(|spec| self.is_stub(spec.name))
            .count();
        f.debug_struct("DispatchTable")
            .field("slots", &Self::ENTRIES.len())
            .field("stub_slots", &stubs)
            .finish()
    }
}

/// Table used before a backend is loaded
///
/// Its stubs only log and count, even in debug builds. They are called
/// through `extern "C"` slots, where a panic aborts the host process, so
/// they never assert.
pub static STUB_DISPATCH: DispatchTable = DispatchTable::stubbed();
