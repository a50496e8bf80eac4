//! The process-wide intercept
//!
//! [`Intercept`] owns the resolved dispatch table and, behind one mutex, all
//! mutable shim state: the extension cache, the enqueue counter and the
//! telemetry engine. Every public method takes the lock for its whole
//! duration; private helpers that receive `&mut InterceptState` run with the
//! lock already held and must never take it again.
//!
//! Per-entry-point wrappers use it in a fixed pattern:
//!
//! ```no_run
//! use clshim::backend::ffi::{cl_command_queue, cl_event, cl_int};
//! use clshim::intercept;
//!
//! # unsafe fn wrapper(queue: cl_command_queue, event: cl_event) -> cl_int {
//! let shim = intercept::global().expect("initialized");
//! shim.check_timing_events();
//! let counter = shim.next_enqueue_counter();
//! let start = shim.host_timestamp();
//! let status = (shim.dispatch().clFinish)(queue);
//! shim.update_host_timing("clFinish", start, shim.host_timestamp());
//! shim.add_timing_event("clFinish", queue, event, start, counter, None);
//! status
//! # }
//! ```

use std::ffi::c_void;
use std::fs::File;
use std::io::Write;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::OnceCell;

use crate::backend::ffi::{cl_command_queue, cl_event, cl_platform_id};
use crate::backend::{
    load_backend, select_backend, stub_call_count, DispatchTable, ExtensionCache,
    LoadedBackend, ResolutionReport, SymbolSource, STUB_DISPATCH,
};
use crate::config::ShimConfig;
use crate::error::ShimResult;
use crate::profiling::{
    host_thread_id, DrainOutcome, HostCallRecord, HostClock, HostSpan, MonotonicClock,
    PendingOperation, ProfilerBridgeSink, StatSide, TelemetryEngine, TextReportSink, TimelineSink,
    TraceSink, TracingDomain, VariantChoice, VariantGroupId, VariantSpec, VariantTag,
};

struct InterceptState {
    /// Keeps the backend library loaded while the table points into it
    _backend: Option<Box<dyn SymbolSource>>,
    extensions: ExtensionCache,
    telemetry: TelemetryEngine,
    enqueue_counter: u64,
    shut_down: bool,
}

pub struct Intercept {
    config: ShimConfig,
    clock: Arc<dyn HostClock>,
    /// Host time the timeline is relative to (ns)
    start_ns: u64,
    table: DispatchTable,
    report: ResolutionReport,
    state: Mutex<InterceptState>,
}

impl std::fmt::Debug for Intercept {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Intercept")
            .field("library", &self.report.library)
            .field("table", &self.table)
            .field("config", &self.config)
            .finish()
    }
}

impl Intercept {
    /// Load the configured backend and set up telemetry
    ///
    /// Only an invalid configuration is an error. When no backend candidate
    /// resolves, the intercept keeps the stub table for the rest of the
    /// process and every call through it reports `CL_INVALID_OPERATION`.
    pub fn initialize(config: ShimConfig) -> ShimResult<Self> {
        config.validate()?;
        let loaded = load_backend(config.library_override.as_deref());
        Ok(Self::assemble(config, loaded, Arc::new(MonotonicClock::new())))
    }

    /// Like [`Intercept::initialize`] with explicit symbol sources and clock
    pub fn with_sources<I>(config: ShimConfig, candidates: I, clock: Arc<dyn HostClock>) -> ShimResult<Self>
    where
        I: IntoIterator<Item = ShimResult<Box<dyn SymbolSource>>>,
    {
        config.validate()?;
        let loaded = select_backend(candidates);
        Ok(Self::assemble(config, loaded, clock))
    }

    fn assemble(config: ShimConfig, loaded: ShimResult<LoadedBackend>, clock: Arc<dyn HostClock>) -> Self {
        let (backend, table, report) = match loaded {
            Ok(loaded) => (Some(loaded.source), loaded.table, loaded.report),
            Err(err) => {
                tracing::error!(error = %err, "no usable backend, every entry point stays a stub");
                (None, DispatchTable::stubbed(), ResolutionReport::unresolved())
            }
        };

        let start_ns = clock.now_ns();
        let mut telemetry = TelemetryEngine::new(config.variant_warmup, config.device_timing);
        for sink in build_sinks(&config, start_ns) {
            telemetry.add_sink(sink);
        }

        Intercept {
            config,
            clock,
            start_ns,
            table,
            report,
            state: Mutex::new(InterceptState {
                _backend: backend,
                extensions: ExtensionCache::new(),
                telemetry,
                enqueue_counter: 0,
                shut_down: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, InterceptState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("intercept lock poisoned, continuing with recovered state");
            poisoned.into_inner()
        })
    }

    /// The resolved table; stubs for anything the backend lacks
    pub fn dispatch(&self) -> &DispatchTable {
        &self.table
    }

    pub fn is_backend_loaded(&self) -> bool {
        !self.table.is_stub("clGetPlatformIDs")
    }

    pub fn resolution_report(&self) -> &ResolutionReport {
        &self.report
    }

    pub fn config(&self) -> &ShimConfig {
        &self.config
    }

    pub fn start_ns(&self) -> u64 {
        self.start_ns
    }

    /// Host clock reading for timing an API call
    pub fn host_timestamp(&self) -> u64 {
        self.clock.now_ticks()
    }

    /// Counter value for the enqueue being intercepted
    pub fn next_enqueue_counter(&self) -> u64 {
        let mut state = self.state();
        let counter = state.enqueue_counter;
        state.enqueue_counter += 1;
        counter
    }

    /// Look up an extension entry point, cached per platform
    pub fn resolve_extension(&self, platform: cl_platform_id, name: &str) -> ShimResult<NonNull<c_void>> {
        let mut state = self.state();
        state.extensions.resolve(&self.table, platform, name)
    }

    /// Record host wall time of one API call
    ///
    /// Feeds the submitter-side statistics when host timing is enabled and
    /// puts the call on the timeline, on the calling thread's track, when
    /// call logging is.
    pub fn update_host_timing(&self, name: &str, start_ticks: u64, end_ticks: u64) {
        let logs_calls = self.config.logs_calls();
        if !self.config.host_timing && !logs_calls {
            return;
        }
        let start_ns = self.clock.ticks_to_ns(start_ticks);
        let delta = self.clock.ticks_to_ns(end_ticks).saturating_sub(start_ns);

        let mut state = self.state();
        if self.config.host_timing {
            state.telemetry.stats.record(name, StatSide::Submitter, delta);
        }
        if logs_calls {
            state.telemetry.sinks.notify_call(&HostCallRecord {
                name,
                thread: host_thread_id(),
                start_ns,
                duration_ns: delta,
            });
        }
    }

    pub fn begin_call(&self) -> HostSpan {
        HostSpan::begin(self.clock.as_ref())
    }

    /// Record the host time of a call started with [`Intercept::begin_call`]
    pub fn end_call(&self, name: &str, span: HostSpan) {
        let (start, end) = span.finish(self.clock.as_ref());
        self.update_host_timing(name, start, end);
    }

    /// Track a submission until it completes
    ///
    /// Returns whether the operation is now tracked. A null event is never
    /// tracked, and nothing is once the intercept has shut down. Variant dispatches always are, since the selector depends on
    /// their completions; anything else needs a completion consumer and an
    /// enqueue counter inside the configured window.
    pub fn add_timing_event(
        &self,
        key: &str,
        queue: cl_command_queue,
        event: cl_event,
        submit_ticks: u64,
        enqueue_counter: u64,
        variant: Option<VariantTag>,
    ) -> bool {
        if event.is_null() {
            return false;
        }
        if variant.is_none() && !self.config.tracks_completions() {
            return false;
        }
        if variant.is_none() && !self.config.in_enqueue_window(enqueue_counter) {
            tracing::trace!(key, enqueue_counter, "outside enqueue window, not tracked");
            return false;
        }

        let mut state = self.state();
        if state.shut_down {
            tracing::debug!(key, "shim shut down, not tracking");
            return false;
        }

        let mut operation = PendingOperation::new(
            key,
            event as usize,
            queue as usize,
            self.clock.ticks_to_ns(submit_ticks),
        )
        .with_enqueue_counter(enqueue_counter);
        if let Some(tag) = variant {
            operation = operation.with_variant(tag);
        }
        match state.telemetry.track(&self.table, operation) {
            Ok(tracked) => tracked,
            Err(err) => {
                tracing::warn!(key, error = %err, "could not track submission");
                false
            }
        }
    }

    /// Non-blocking drain; returns the number of completion records produced
    pub fn check_timing_events(&self) -> usize {
        let mut state = self.state();
        Self::drain_locked(&mut state, &self.table).records.len()
    }

    fn drain_locked(state: &mut InterceptState, table: &DispatchTable) -> DrainOutcome {
        if state.telemetry.registry.is_empty() {
            return DrainOutcome::default();
        }
        state.telemetry.drain(table)
    }

    /// Block until every tracked operation completes, then drain
    ///
    /// Holds the lock while waiting on the backend.
    pub fn wait_for_pending(&self) -> usize {
        let mut state = self.state();
        if let Err(err) = state.telemetry.registry.wait_all(&self.table) {
            tracing::warn!(error = %err, "waiting for outstanding operations failed");
        }
        Self::drain_locked(&mut state, &self.table).records.len()
    }

    pub fn register_variant_group(&self, name: &str, variants: Vec<VariantSpec>) -> VariantGroupId {
        self.state().telemetry.variants.register_group(name, variants)
    }

    pub fn choose_variant(&self, group: VariantGroupId) -> ShimResult<Option<VariantChoice>> {
        self.state().telemetry.variants.choose_variant(group)
    }

    pub fn add_sink(&self, sink: Box<dyn TraceSink>) {
        self.state().telemetry.add_sink(sink);
    }

    pub fn pending_count(&self) -> usize {
        self.state().telemetry.registry.len()
    }

    /// Run `f` against the telemetry engine under the lock
    ///
    /// Recovers a poisoned lock like every other method, so this never
    /// returns an error.
    pub fn with_telemetry<R>(&self, f: impl FnOnce(&TelemetryEngine) -> R) -> ShimResult<R> {
        Ok(f(&self.state().telemetry))
    }

    /// Write the aggregate report after a non-blocking drain
    pub fn report(&self, out: &mut dyn Write) -> ShimResult<()> {
        let mut state = self.state();
        Self::drain_locked(&mut state, &self.table);
        Self::write_report_locked(&state, out)
    }

    fn write_report_locked(state: &InterceptState, out: &mut dyn Write) -> ShimResult<()> {
        state.telemetry.stats.write_report(out)?;
        let anomalies = state.telemetry.registry.anomaly_count();
        if anomalies > 0 {
            writeln!(out, "\nInvalid completion handles dropped: {anomalies}")?;
        }
        let stubs = stub_call_count();
        if stubs > 0 {
            writeln!(out, "Calls through unresolved entry points: {stubs}")?;
        }
        out.flush()?;
        Ok(())
    }

    /// Finish all tracked work and emit the configured reports
    ///
    /// Blocks on the backend for outstanding operations. Later calls are
    /// no-ops.
    pub fn shutdown(&self) {
        let mut state = self.state();
        if state.shut_down {
            return;
        }
        state.shut_down = true;

        let outcome = state.telemetry.finish(&self.table);
        tracing::debug!(records = outcome.records.len(), "final drain complete");

        if let Some(path) = &self.config.report_path {
            let written = File::create(path)
                .map_err(Into::into)
                .and_then(|mut file| Self::write_report_locked(&state, &mut file));
            if let Err(err) = written {
                tracing::warn!(path = %path.display(), error = %err, "could not write report");
            }
        }
        if self.config.report_to_stderr {
            let mut stderr = std::io::stderr().lock();
            if let Err(err) = Self::write_report_locked(&state, &mut stderr) {
                tracing::warn!(error = %err, "could not write report to stderr");
            }
        }
    }
}

fn build_sinks(config: &ShimConfig, start_ns: u64) -> Vec<Box<dyn TraceSink>> {
    let mut sinks: Vec<Box<dyn TraceSink>> = Vec::new();

    if config.device_timing_log {
        let out: Box<dyn Write + Send> = match &config.device_timing_log_path {
            Some(path) => match File::create(path) {
                Ok(file) => Box::new(file),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "device timing log unavailable, using stderr");
                    Box::new(std::io::stderr())
                }
            },
            None => Box::new(std::io::stderr()),
        };
        sinks.push(Box::new(TextReportSink::new(out)));
    }

    if let Some(path) = &config.timeline_path {
        let timeline = File::create(path)
            .map_err(Into::into)
            .and_then(|file| TimelineSink::new(Box::new(file), start_ns, config.timeline_stages))
            .map(|sink| sink.with_call_logging(config.timeline_call_logging));
        match timeline {
            Ok(sink) => sinks.push(Box::new(sink)),
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "timeline disabled"),
        }
    }

    if config.external_profiler {
        sinks.push(Box::new(ProfilerBridgeSink::new(Box::new(TracingDomain::new()))));
    }

    sinks
}

static GLOBAL: OnceCell<Intercept> = OnceCell::new();

/// The installed intercept, if any
pub fn global() -> Option<&'static Intercept> {
    GLOBAL.get()
}

/// Install the process-wide intercept; later calls return the first one
pub fn install_global(config: ShimConfig) -> ShimResult<&'static Intercept> {
    GLOBAL.get_or_try_init(|| Intercept::initialize(config))
}

/// Initialize logging and the intercept from `CLSHIM_*` variables
pub fn init_from_env() -> ShimResult<&'static Intercept> {
    crate::logging::init_logging_default();
    install_global(ShimConfig::from_env())
}

/// Dispatch table of the global intercept, or the stub table before one exists
pub fn dispatch() -> &'static DispatchTable {
    match GLOBAL.get() {
        Some(intercept) => intercept.dispatch(),
        None => &STUB_DISPATCH,
    }
}

/// Shut down the global intercept if one was installed
pub fn shutdown_global() {
    if let Some(intercept) = GLOBAL.get() {
        intercept.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ffi::CL_INVALID_OPERATION;
    use crate::profiling::ManualClock;
    use std::ptr;

    fn stub_only(config: ShimConfig) -> Intercept {
        Intercept::with_sources(config, Vec::new(), Arc::new(ManualClock::new(0))).unwrap()
    }

    #[test]
    fn test_no_backend_falls_back_to_stubs() {
        let shim = stub_only(ShimConfig::default());
        assert!(!shim.is_backend_loaded());
        assert_eq!(shim.resolution_report().resolved_count(), 0);
        let status = unsafe { (shim.dispatch().clFlush)(ptr::null_mut()) };
        assert_eq!(status, CL_INVALID_OPERATION);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ShimConfig::default().with_enqueue_window(3, 1);
        assert!(Intercept::with_sources(config, Vec::new(), Arc::new(ManualClock::new(0))).is_err());
    }

    #[test]
    fn test_enqueue_counter_increments() {
        let shim = stub_only(ShimConfig::default());
        assert_eq!(shim.next_enqueue_counter(), 0);
        assert_eq!(shim.next_enqueue_counter(), 1);
    }

    #[test]
    fn test_host_timing_only_when_enabled() {
        let clock = Arc::new(ManualClock::new(100));
        let shim = Intercept::with_sources(
            ShimConfig::default().with_host_timing(true),
            Vec::new(),
            clock.clone(),
        )
        .unwrap();
        let start = shim.host_timestamp();
        clock.advance(250);
        shim.update_host_timing("clFinish", start, shim.host_timestamp());

        let record = shim
            .with_telemetry(|t| t.stats.get("clFinish", StatSide::Submitter).copied())
            .unwrap()
            .unwrap();
        assert_eq!(record.total, 250);

        let quiet = stub_only(ShimConfig::default());
        quiet.update_host_timing("clFinish", 0, 10);
        assert!(quiet.with_telemetry(|t| t.stats.is_empty()).unwrap());
    }

    #[test]
    fn test_untracked_when_no_consumer() {
        let shim = stub_only(ShimConfig::default());
        assert!(!shim.add_timing_event("k", ptr::null_mut(), 0x10 as cl_event, 0, 0, None));
    }

    #[test]
    fn test_stub_backend_cannot_track() {
        // Retain goes through the stub and fails, so nothing is registered
        let shim = stub_only(ShimConfig::default().with_device_timing(true));
        assert!(!shim.add_timing_event("k", ptr::null_mut(), 0x10 as cl_event, 0, 0, None));
        assert_eq!(shim.pending_count(), 0);
    }

    #[test]
    fn test_report_on_empty_intercept() {
        let shim = stub_only(ShimConfig::default());
        let mut out = Vec::new();
        shim.report(&mut out).unwrap();
        shim.shutdown();
        shim.shutdown();
    }

    #[test]
    fn test_telemetry_readable_after_poisoned_lock() {
        let shim = stub_only(ShimConfig::default().with_host_timing(true));
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            shim.with_telemetry(|_| panic!("holder panicked")).ok();
        }));
        assert!(panicked.is_err());
        assert!(shim.state.is_poisoned());

        shim.update_host_timing("clFinish", 0, 10);
        let count = shim
            .with_telemetry(|t| t.stats.len(StatSide::Submitter))
            .expect("poisoned lock is recovered");
        assert_eq!(count, 1);
    }

    #[test]
    fn test_dispatch_before_install_is_stub_table() {
        if global().is_none() {
            assert!(dispatch().is_stub("clGetEventInfo"));
        }
    }
}
