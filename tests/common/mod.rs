//! Common test utilities for clshim integration tests
//!
//! Provides an in-process fake OpenCL backend: a set of `extern "C"`
//! functions backed by one global state, exposed to the shim through
//! [`FakeLibrary`], a [`SymbolSource`]. Tests touching the fake must be
//! `#[serial]` and call [`reset`] first.

#![allow(dead_code)]

pub mod tempfile_helpers;

use std::collections::{HashMap, HashSet};
use std::ffi::{c_char, c_void, CStr};
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex, MutexGuard};

use clshim::backend::ffi::*;
use clshim::backend::{DeviceTimestamps, DispatchTable, SymbolSource};
use clshim::profiling::ManualClock;
use clshim::{Intercept, ShimConfig, ShimResult};
use once_cell::sync::Lazy;

pub use serial_test::serial;

/// Platform handle reported by the fake `clGetPlatformIDs`
pub const FAKE_PLATFORM: usize = 0x77;

/// How a fake completion handle behaves when polled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBehavior {
    /// Reports complete from the given poll on (1 = first poll)
    CompleteOnPoll(u32),
    /// Running until waited on
    Never,
    /// Retain works, every status query fails with `CL_INVALID_EVENT`
    InvalidOnPoll,
    /// Terminates abnormally with this (negative) status
    Fail(cl_int),
    /// Complete, but profiling queries fail
    NoProfiling,
}

#[derive(Debug, Clone)]
struct FakeEvent {
    behavior: EventBehavior,
    timestamps: DeviceTimestamps,
    polls: u32,
    retains: u32,
    releases: u32,
    waited: bool,
}

impl FakeEvent {
    fn execution_status(&self) -> Result<cl_int, cl_int> {
        match self.behavior {
            EventBehavior::CompleteOnPoll(n) if self.waited || self.polls >= n => Ok(CL_COMPLETE),
            EventBehavior::CompleteOnPoll(_) => Ok(CL_QUEUED),
            EventBehavior::Never if self.waited => Ok(CL_COMPLETE),
            EventBehavior::Never => Ok(CL_RUNNING),
            EventBehavior::InvalidOnPoll => Err(CL_INVALID_EVENT),
            EventBehavior::Fail(code) => Ok(code),
            EventBehavior::NoProfiling => Ok(CL_COMPLETE),
        }
    }
}

/// Retain/release/poll counters of one fake handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventCounts {
    pub polls: u32,
    pub retains: u32,
    pub releases: u32,
}

#[derive(Debug, Default)]
struct FakeState {
    events: HashMap<usize, FakeEvent>,
    extensions: HashMap<String, usize>,
    generic_lookups: u32,
    platform_lookups: u32,
    finish_calls: u32,
}

static FAKE: Lazy<Mutex<FakeState>> = Lazy::new(|| Mutex::new(FakeState::default()));

// The fake entry points run inside extern "C" frames, where a panic aborts
fn state() -> MutexGuard<'static, FakeState> {
    FAKE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Forget every fake handle and extension
pub fn reset() {
    *state() = FakeState::default();
}

/// Register a fake completion handle and return it
pub fn add_event(handle: usize, behavior: EventBehavior, timestamps: DeviceTimestamps) -> cl_event {
    state().events.insert(
        handle,
        FakeEvent {
            behavior,
            timestamps,
            polls: 0,
            retains: 0,
            releases: 0,
            waited: false,
        },
    );
    handle as cl_event
}

/// Device timestamps whose execution takes `duration` ns
pub fn timed(queued: u64, duration: u64) -> DeviceTimestamps {
    DeviceTimestamps {
        queued,
        submitted: queued + 10,
        started: queued + 20,
        ended: queued + 20 + duration,
    }
}

pub fn event_counts(handle: usize) -> EventCounts {
    state()
        .events
        .get(&handle)
        .map(|event| EventCounts {
            polls: event.polls,
            retains: event.retains,
            releases: event.releases,
        })
        .unwrap_or_default()
}

/// Make `name` resolvable as an extension at `address`
pub fn add_extension(name: &str, address: usize) {
    state().extensions.insert(name.to_string(), address);
}

/// `(generic, for_platform)` extension lookups seen by the backend
pub fn extension_lookups() -> (u32, u32) {
    let state = state();
    (state.generic_lookups, state.platform_lookups)
}

pub fn finish_calls() -> u32 {
    state().finish_calls
}

unsafe extern "C" fn fake_get_platform_ids(
    num_entries: cl_uint,
    platforms: *mut cl_platform_id,
    num_platforms: *mut cl_uint,
) -> cl_int {
    if !platforms.is_null() && num_entries > 0 {
        *platforms = FAKE_PLATFORM as cl_platform_id;
    }
    if !num_platforms.is_null() {
        *num_platforms = 1;
    }
    CL_SUCCESS
}

unsafe extern "C" fn fake_get_event_info(
    event: cl_event,
    param_name: cl_event_info,
    param_value_size: usize,
    param_value: *mut c_void,
    param_value_size_ret: *mut usize,
) -> cl_int {
    if param_name != CL_EVENT_COMMAND_EXECUTION_STATUS
        || param_value.is_null()
        || param_value_size < mem::size_of::<cl_int>()
    {
        return CL_INVALID_VALUE;
    }
    let mut state = state();
    let Some(fake) = state.events.get_mut(&(event as usize)) else {
        return CL_INVALID_EVENT;
    };
    fake.polls += 1;
    match fake.execution_status() {
        Ok(status) => {
            *(param_value as *mut cl_int) = status;
            if !param_value_size_ret.is_null() {
                *param_value_size_ret = mem::size_of::<cl_int>();
            }
            CL_SUCCESS
        }
        Err(code) => code,
    }
}

unsafe extern "C" fn fake_get_event_profiling_info(
    event: cl_event,
    param_name: cl_profiling_info,
    param_value_size: usize,
    param_value: *mut c_void,
    _param_value_size_ret: *mut usize,
) -> cl_int {
    if param_value.is_null() || param_value_size < mem::size_of::<cl_ulong>() {
        return CL_INVALID_VALUE;
    }
    let state = state();
    let Some(fake) = state.events.get(&(event as usize)) else {
        return CL_INVALID_EVENT;
    };
    if fake.behavior == EventBehavior::NoProfiling {
        return CL_PROFILING_INFO_NOT_AVAILABLE;
    }
    let value = match param_name {
        CL_PROFILING_COMMAND_QUEUED => fake.timestamps.queued,
        CL_PROFILING_COMMAND_SUBMIT => fake.timestamps.submitted,
        CL_PROFILING_COMMAND_START => fake.timestamps.started,
        CL_PROFILING_COMMAND_END => fake.timestamps.ended,
        _ => return CL_INVALID_VALUE,
    };
    *(param_value as *mut cl_ulong) = value;
    CL_SUCCESS
}

unsafe extern "C" fn fake_retain_event(event: cl_event) -> cl_int {
    match state().events.get_mut(&(event as usize)) {
        Some(fake) => {
            fake.retains += 1;
            CL_SUCCESS
        }
        None => CL_INVALID_EVENT,
    }
}

unsafe extern "C" fn fake_release_event(event: cl_event) -> cl_int {
    match state().events.get_mut(&(event as usize)) {
        Some(fake) => {
            fake.releases += 1;
            CL_SUCCESS
        }
        None => CL_INVALID_EVENT,
    }
}

unsafe extern "C" fn fake_wait_for_events(num_events: cl_uint, event_list: *const cl_event) -> cl_int {
    if num_events == 0 || event_list.is_null() {
        return CL_INVALID_VALUE;
    }
    let handles = std::slice::from_raw_parts(event_list, num_events as usize);
    let mut state = state();
    let mut status = CL_SUCCESS;
    for &handle in handles {
        match state.events.get_mut(&(handle as usize)) {
            Some(fake) => {
                fake.waited = true;
                if matches!(fake.behavior, EventBehavior::Fail(_)) {
                    // CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST
                    status = -14;
                }
            }
            None => status = CL_INVALID_EVENT,
        }
    }
    status
}

unsafe extern "C" fn fake_finish(_command_queue: cl_command_queue) -> cl_int {
    state().finish_calls += 1;
    CL_SUCCESS
}

unsafe fn extension_address(func_name: *const c_char) -> *mut c_void {
    if func_name.is_null() {
        return ptr::null_mut();
    }
    let name = CStr::from_ptr(func_name).to_string_lossy();
    match state().extensions.get(name.as_ref()) {
        Some(&address) => address as *mut c_void,
        None => ptr::null_mut(),
    }
}

unsafe extern "C" fn fake_get_extension_function_address(func_name: *const c_char) -> *mut c_void {
    state().generic_lookups += 1;
    extension_address(func_name)
}

unsafe extern "C" fn fake_get_extension_function_address_for_platform(
    platform: cl_platform_id,
    func_name: *const c_char,
) -> *mut c_void {
    state().platform_lookups += 1;
    if platform as usize != FAKE_PLATFORM {
        return ptr::null_mut();
    }
    extension_address(func_name)
}

/// Never called; stands in for entry points the tests do not exercise
unsafe extern "C" fn unused_entry() {}

/// Fake backend library handing out the functions above
pub struct FakeLibrary {
    name: String,
    missing: HashSet<String>,
}

impl FakeLibrary {
    /// Exports every entry point, including the optional ones
    pub fn complete(name: &str) -> Self {
        FakeLibrary {
            name: name.to_string(),
            missing: HashSet::new(),
        }
    }

    /// Drop `names` from the exported set
    pub fn without(mut self, names: &[&str]) -> Self {
        self.missing.extend(names.iter().map(|name| name.to_string()));
        self
    }

    /// Exports only what an OpenCL 1.1 implementation would
    pub fn opencl_1_1(name: &str) -> Self {
        Self::complete(name).without(&[
            "clCreateSubDevices",
            "clRetainDevice",
            "clReleaseDevice",
            "clCreateCommandQueueWithProperties",
            "clEnqueueFillBuffer",
            "clEnqueueMarkerWithWaitList",
            "clGetExtensionFunctionAddressForPlatform",
            "clGetDeviceAndHostTimer",
            "clGetHostTimer",
        ])
    }

    pub fn boxed(self) -> ShimResult<Box<dyn SymbolSource>> {
        Ok(Box::new(self))
    }
}

impl SymbolSource for FakeLibrary {
    fn describe(&self) -> &str {
        &self.name
    }

    fn symbol(&self, name: &str) -> Option<NonNull<c_void>> {
        if self.missing.contains(name) {
            return None;
        }
        let address = match name {
            "clGetPlatformIDs" => fake_get_platform_ids as usize,
            "clGetEventInfo" => fake_get_event_info as usize,
            "clGetEventProfilingInfo" => fake_get_event_profiling_info as usize,
            "clRetainEvent" => fake_retain_event as usize,
            "clReleaseEvent" => fake_release_event as usize,
            "clWaitForEvents" => fake_wait_for_events as usize,
            "clFinish" => fake_finish as usize,
            "clGetExtensionFunctionAddress" => fake_get_extension_function_address as usize,
            "clGetExtensionFunctionAddressForPlatform" => {
                fake_get_extension_function_address_for_platform as usize
            }
            _ if DispatchTable::ENTRIES.iter().any(|spec| spec.name == name) => unused_entry as usize,
            _ => return None,
        };
        NonNull::new(address as *mut c_void)
    }
}

/// Intercept over a complete fake backend with a manual clock at tick 1000
pub fn fake_intercept(config: ShimConfig) -> (Intercept, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000));
    let shim = Intercept::with_sources(
        config,
        vec![FakeLibrary::complete("fake-opencl").boxed()],
        clock.clone(),
    )
    .expect("valid configuration");
    (shim, clock)
}

/// Non-null queue handle for tests
pub fn queue(value: usize) -> cl_command_queue {
    value as cl_command_queue
}
