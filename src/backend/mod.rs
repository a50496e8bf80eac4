//! OpenCL backend access
//!
//! Everything the shim knows about the real implementation lives here: the
//! FFI declarations, the dispatch table and how it is resolved, lazy
//! extension lookup and the completion handle queries used by telemetry.

pub mod dispatch;
pub mod event;
pub mod extension;
pub mod ffi;
pub mod loader;

pub use dispatch::{
    stub_call_count, DispatchEntry, DispatchTable, EntryKind, EntrySpec, ResolutionReport,
    STUB_DISPATCH,
};
pub use event::{CompletionSource, DeviceTimestamps, HandleStatus};
pub use extension::ExtensionCache;
pub use loader::{
    candidate_paths, load_backend, platform_candidates, select_backend, BackendLibrary,
    LoadedBackend, SymbolSource,
};
