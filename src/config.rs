//! Shim configuration
//!
//! Read once when the shim initializes. Every field has a `CLSHIM_*`
//! environment variable; builder methods cover programmatic setup.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{ShimError, ShimResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimConfig {
    /// Backend library to load instead of the platform candidates
    pub library_override: Option<PathBuf>,
    /// Aggregate host wall time of intercepted calls
    pub host_timing: bool,
    /// Track submissions and aggregate device execution time
    pub device_timing: bool,
    /// Log one line per completion
    pub device_timing_log: bool,
    /// Where per-completion lines go; stderr when unset
    pub device_timing_log_path: Option<PathBuf>,
    /// First enqueue counter that is tracked
    pub enqueue_window_min: u64,
    /// Last enqueue counter that is tracked
    pub enqueue_window_max: u64,
    /// Chrome trace-event timeline output
    pub timeline_path: Option<PathBuf>,
    /// Split timeline events into queued/submitted/execution stages
    pub timeline_stages: bool,
    /// Put every timed API call on the timeline, on its host thread's track
    pub timeline_call_logging: bool,
    /// Publish intervals to the external profiler bridge
    pub external_profiler: bool,
    /// Unsampled dispatches per variant group before exploration
    pub variant_warmup: u32,
    /// Aggregate report written at shutdown
    pub report_path: Option<PathBuf>,
    pub report_to_stderr: bool,
}

impl Default for ShimConfig {
    fn default() -> Self {
        ShimConfig {
            library_override: None,
            host_timing: false,
            device_timing: false,
            device_timing_log: false,
            device_timing_log_path: None,
            enqueue_window_min: 0,
            enqueue_window_max: u64::MAX,
            timeline_path: None,
            timeline_stages: false,
            timeline_call_logging: false,
            external_profiler: false,
            variant_warmup: 0,
            report_path: None,
            report_to_stderr: false,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    value != "0" && value.to_lowercase() != "false"
}

impl ShimConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from the process environment
    ///
    /// Environment variables:
    /// - `CLSHIM_LIBRARY`: backend library path
    /// - `CLSHIM_HOST_TIMING`: aggregate host call timing (0 or 1)
    /// - `CLSHIM_DEVICE_TIMING`: aggregate device timing (0 or 1)
    /// - `CLSHIM_DEVICE_TIMING_LOG`: log each completion (0 or 1)
    /// - `CLSHIM_DEVICE_TIMING_LOG_FILE`: destination for completion lines
    /// - `CLSHIM_DEVICE_TIMING_MIN_ENQUEUE`: first tracked enqueue counter
    /// - `CLSHIM_DEVICE_TIMING_MAX_ENQUEUE`: last tracked enqueue counter
    /// - `CLSHIM_TIMELINE_FILE`: Chrome trace output path
    /// - `CLSHIM_TIMELINE_STAGES`: emit per-stage timeline events (0 or 1)
    /// - `CLSHIM_TIMELINE_CALL_LOGGING`: host call events on the timeline (0 or 1)
    /// - `CLSHIM_EXTERNAL_PROFILER`: enable the profiler bridge (0 or 1)
    /// - `CLSHIM_VARIANT_WARMUP`: warm-up dispatches per variant group
    /// - `CLSHIM_REPORT_FILE`: aggregate report path
    /// - `CLSHIM_REPORT_TO_STDERR`: print the aggregate report to stderr (0 or 1)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`ShimConfig::from_env`] with a custom variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = ShimConfig::default();

        let path = |name: &str| lookup(name).filter(|v| !v.is_empty()).map(PathBuf::from);
        let flag = |name: &str, current: bool| lookup(name).map_or(current, |v| parse_flag(&v));
        let number = |name: &str| -> Option<u64> {
            let raw = lookup(name)?;
            match raw.trim().parse::<u64>() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(variable = name, value = %raw, "ignoring non-numeric setting");
                    None
                }
            }
        };

        config.library_override = path("CLSHIM_LIBRARY");
        config.host_timing = flag("CLSHIM_HOST_TIMING", config.host_timing);
        config.device_timing = flag("CLSHIM_DEVICE_TIMING", config.device_timing);
        config.device_timing_log = flag("CLSHIM_DEVICE_TIMING_LOG", config.device_timing_log);
        config.device_timing_log_path = path("CLSHIM_DEVICE_TIMING_LOG_FILE");
        if let Some(min) = number("CLSHIM_DEVICE_TIMING_MIN_ENQUEUE") {
            config.enqueue_window_min = min;
        }
        if let Some(max) = number("CLSHIM_DEVICE_TIMING_MAX_ENQUEUE") {
            config.enqueue_window_max = max;
        }
        config.timeline_path = path("CLSHIM_TIMELINE_FILE");
        config.timeline_stages = flag("CLSHIM_TIMELINE_STAGES", config.timeline_stages);
        config.timeline_call_logging =
            flag("CLSHIM_TIMELINE_CALL_LOGGING", config.timeline_call_logging);
        config.external_profiler = flag("CLSHIM_EXTERNAL_PROFILER", config.external_profiler);
        if let Some(warmup) = number("CLSHIM_VARIANT_WARMUP") {
            config.variant_warmup = warmup.min(u64::from(u32::MAX)) as u32;
        }
        config.report_path = path("CLSHIM_REPORT_FILE");
        config.report_to_stderr = flag("CLSHIM_REPORT_TO_STDERR", config.report_to_stderr);

        config
    }

    pub fn with_library_override(mut self, path: impl AsRef<Path>) -> Self {
        self.library_override = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_host_timing(mut self, enabled: bool) -> Self {
        self.host_timing = enabled;
        self
    }

    pub fn with_device_timing(mut self, enabled: bool) -> Self {
        self.device_timing = enabled;
        self
    }

    /// Log each completion, to `path` or stderr
    pub fn with_device_timing_log(mut self, path: Option<PathBuf>) -> Self {
        self.device_timing_log = true;
        self.device_timing_log_path = path;
        self
    }

    pub fn with_enqueue_window(mut self, min: u64, max: u64) -> Self {
        self.enqueue_window_min = min;
        self.enqueue_window_max = max;
        self
    }

    pub fn with_timeline(mut self, path: impl AsRef<Path>, stages: bool) -> Self {
        self.timeline_path = Some(path.as_ref().to_path_buf());
        self.timeline_stages = stages;
        self
    }

    /// Requires a timeline path to have any effect
    pub fn with_timeline_call_logging(mut self, enabled: bool) -> Self {
        self.timeline_call_logging = enabled;
        self
    }

    pub fn with_external_profiler(mut self, enabled: bool) -> Self {
        self.external_profiler = enabled;
        self
    }

    pub fn with_variant_warmup(mut self, warmup: u32) -> Self {
        self.variant_warmup = warmup;
        self
    }

    pub fn with_report_path(mut self, path: impl AsRef<Path>) -> Self {
        self.report_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_report_to_stderr(mut self, enabled: bool) -> Self {
        self.report_to_stderr = enabled;
        self
    }

    /// Whether host calls go to the timeline
    pub fn logs_calls(&self) -> bool {
        self.timeline_call_logging && self.timeline_path.is_some()
    }

    /// Whether submissions need to be tracked until completion
    pub fn tracks_completions(&self) -> bool {
        self.device_timing
            || self.device_timing_log
            || self.timeline_path.is_some()
            || self.external_profiler
    }

    /// Whether an enqueue counter falls inside the tracked window
    pub fn in_enqueue_window(&self, counter: u64) -> bool {
        counter >= self.enqueue_window_min && counter <= self.enqueue_window_max
    }

    pub fn validate(&self) -> ShimResult<()> {
        if self.enqueue_window_min > self.enqueue_window_max {
            return Err(ShimError::InvalidConfiguration(format!(
                "enqueue window is empty: min {} > max {}",
                self.enqueue_window_min, self.enqueue_window_max
            )));
        }
        for (name, path) in [
            ("library override", &self.library_override),
            ("timeline path", &self.timeline_path),
            ("report path", &self.report_path),
            ("device timing log path", &self.device_timing_log_path),
        ] {
            if path.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
                return Err(ShimError::InvalidConfiguration(format!("{name} is empty")));
            }
        }
        Ok(())
    }
}
