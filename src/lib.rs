//! clshim - OpenCL interception shim
//!
//! Sits between an application and the real OpenCL implementation. The shim
//! resolves the backend's entry points into an always-callable dispatch table
//! and tracks asynchronous submissions until they complete, turning their
//! profiling timestamps into aggregate statistics, a per-completion log, a
//! Chrome trace timeline and intervals for an external profiler. On top of
//! the completion data it picks the fastest of several precompiled kernel
//! variants.

#![allow(clippy::too_many_arguments)] // Wrapper entry points mirror the C API
#![allow(clippy::missing_safety_doc)] // FFI contracts documented at module level
#![allow(clippy::type_complexity)]

pub mod backend;
pub mod config;
pub mod error;
pub mod intercept;
pub mod logging;
pub mod profiling;

pub use backend::{DispatchTable, ResolutionReport, SymbolSource};
pub use config::ShimConfig;
pub use error::{ErrorCategory, ShimError, ShimResult};
pub use intercept::{dispatch, Intercept};
pub use profiling::{AggregateStatsStore, StatSide, VariantSelector, VariantSpec};
