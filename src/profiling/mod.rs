//! Asynchronous completion telemetry
//!
//! # Modules
//!
//! - [`clock`] - Submitter-side clock abstraction
//! - [`pending`] - Registry of in-flight operations and the drain pass
//! - [`stats`] - Aggregate host and device timing statistics
//! - [`sinks`] - Text report, JSON timeline and external profiler bridge
//! - [`variant`] - Explore-then-exploit kernel variant selection
//! - [`engine`] - Ties the above together for one drain
//!
//! # Example
//!
//! ```rust
//! use clshim::profiling::{AggregateStatsStore, StatSide};
//!
//! let mut stats = AggregateStatsStore::new();
//! stats.record("clEnqueueNDRangeKernel( gemm )", StatSide::Backend, 1_250);
//! stats.record("clEnqueueNDRangeKernel( gemm )", StatSide::Backend, 1_100);
//!
//! let record = stats.get("clEnqueueNDRangeKernel( gemm )", StatSide::Backend).unwrap();
//! assert_eq!(record.count, 2);
//! assert_eq!(record.min, 1_100);
//! ```

pub mod clock;
pub mod engine;
pub mod pending;
pub mod record;
pub mod sinks;
pub mod stats;
pub mod variant;

pub use clock::{host_thread_id, HostClock, HostSpan, ManualClock, MonotonicClock};
pub use engine::TelemetryEngine;
pub use pending::{DrainOutcome, PendingOperation, PendingOperationRegistry};
pub use record::{CompletionRecord, HostCallRecord};
pub use sinks::{
    ProfilerBridgeSink, ProfilerDomain, SharedBuffer, TextReportSink, TimelineSink, TraceSink,
    TraceSinkSet, TracingDomain,
};
pub use stats::{AggregateStatsStore, StatRecord, StatRow, StatSide};
pub use variant::{
    SelectionPhase, VariantChoice, VariantGroup, VariantGroupId, VariantSelector, VariantSpec,
    VariantTag,
};
