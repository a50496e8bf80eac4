//! Unified error handling for clshim
//!
//! Every fallible operation in the shim returns [`ShimResult`]. Errors are
//! categorized so callers can tell apart the one class that may fail shim
//! initialization (backend resolution) from telemetry failures, which are
//! always logged and swallowed so an application call never fails because
//! diagnostics failed.

use std::fmt;

use crate::backend::ffi::cl_int;

/// Unified error type for clshim
#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    // ========== Resolution Errors ==========
    /// A backend candidate could not be opened
    #[error("failed to load backend library '{path}': {reason}")]
    LibraryLoad { path: String, reason: String },

    /// A required entry point is missing from a backend candidate
    #[error("required entry point {name} missing from '{library}'")]
    MissingRequiredEntryPoint { name: &'static str, library: String },

    /// Every backend candidate was rejected
    #[error("no usable backend among {tried} candidate(s)")]
    NoUsableBackend { tried: usize },

    /// An extension entry point could not be resolved
    #[error("extension entry point not supported: {0}")]
    ExtensionUnsupported(String),

    // ========== Backend Errors ==========
    /// A backend call returned a failure status
    #[error("{call} failed with status {code}")]
    BackendCall { call: &'static str, code: cl_int },

    /// A tracked completion handle is no longer known to the backend
    #[error("invalid completion handle {0:#x}")]
    InvalidHandle(usize),

    // ========== Telemetry Errors ==========
    /// The profiler could not create a clock domain for a queue
    #[error("clock domain unavailable for queue {queue:#x}: {reason}")]
    ClockDomain { queue: usize, reason: String },

    /// A trace sink could not accept a record
    #[error("trace sink '{sink}' failed: {reason}")]
    Sink { sink: &'static str, reason: String },

    /// Unknown variant group
    #[error("unknown variant group {0}")]
    UnknownVariantGroup(u64),

    // ========== Configuration Errors ==========
    /// Invalid shim configuration
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== I/O Errors ==========
    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeline or report serialization failed
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // ========== Internal Errors ==========
    /// Lock poisoned (a previous holder panicked)
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ShimError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ShimError::LibraryLoad { .. }
            | ShimError::MissingRequiredEntryPoint { .. }
            | ShimError::NoUsableBackend { .. }
            | ShimError::ExtensionUnsupported(_) => ErrorCategory::Resolution,

            ShimError::BackendCall { .. } | ShimError::InvalidHandle(_) => ErrorCategory::Backend,

            ShimError::ClockDomain { .. }
            | ShimError::Sink { .. }
            | ShimError::UnknownVariantGroup(_)
            | ShimError::Io(_)
            | ShimError::Json(_) => ErrorCategory::Telemetry,

            ShimError::InvalidConfiguration(_) => ErrorCategory::Configuration,

            ShimError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Whether this error rejects a backend candidate during initialization
    pub fn rejects_candidate(&self) -> bool {
        matches!(
            self,
            ShimError::LibraryLoad { .. } | ShimError::MissingRequiredEntryPoint { .. }
        )
    }

    /// Telemetry errors never propagate to the application
    pub fn is_telemetry(&self) -> bool {
        matches!(self.category(), ErrorCategory::Telemetry)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Backend library or entry point resolution
    Resolution,
    /// The backend reported a failure
    Backend,
    /// Statistics, sinks, or the variant selector
    Telemetry,
    /// Invalid configuration
    Configuration,
    /// Indicates a bug in the shim
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Resolution => write!(f, "Resolution"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Telemetry => write!(f, "Telemetry"),
            ErrorCategory::Configuration => write!(f, "Configuration"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ShimError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ShimError::LockPoisoned(err.to_string())
    }
}

/// Result type for clshim operations
pub type ShimResult<T> = std::result::Result<T, ShimError>;

/// Map a backend status code to a result
pub fn check_status(call: &'static str, code: cl_int) -> ShimResult<()> {
    if code == crate::backend::ffi::CL_SUCCESS {
        Ok(())
    } else {
        Err(ShimError::BackendCall { call, code })
    }
}
