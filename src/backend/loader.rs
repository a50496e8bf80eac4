//! Backend library discovery and symbol lookup

use std::ffi::{c_void, CString};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use libloading::{Library, Symbol};

use super::dispatch::{DispatchTable, ResolutionReport};
use crate::error::{ShimError, ShimResult};

/// Anything that can hand out entry point addresses by name
///
/// Implemented by [`BackendLibrary`] for real shared libraries and by
/// in-process fakes in tests.
pub trait SymbolSource: Send + Sync {
    /// Human readable origin, used in logs and resolution reports
    fn describe(&self) -> &str;

    /// Address of `name`, or `None` when the source does not export it
    fn symbol(&self, name: &str) -> Option<NonNull<c_void>>;
}

/// A backend shared library opened with `libloading`
pub struct BackendLibrary {
    library: Library,
    path: String,
}

impl BackendLibrary {
    /// Open a backend library from a path or a bare library name
    pub fn open(path: impl AsRef<Path>) -> ShimResult<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "opening backend candidate");

        // SAFETY: loading a library runs its initializers. Candidates are the
        // platform's compute API loaders or a path the user explicitly chose.
        let library = unsafe { Library::new(path) }.map_err(|e| ShimError::LibraryLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            library,
            path: path.display().to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl SymbolSource for BackendLibrary {
    fn describe(&self) -> &str {
        &self.path
    }

    fn symbol(&self, name: &str) -> Option<NonNull<c_void>> {
        let c_name = CString::new(name).ok()?;
        // SAFETY: the symbol is read as a raw address and never called here;
        // the dispatch table gives it a type keyed by the same name.
        let symbol: Symbol<'_, *mut c_void> =
            unsafe { self.library.get(c_name.as_bytes_with_nul()) }.ok()?;
        NonNull::new(*symbol)
    }
}

impl std::fmt::Debug for BackendLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendLibrary").field("path", &self.path).finish()
    }
}

/// Platform default backend locations, in search order
pub fn platform_candidates() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let mut paths = vec![PathBuf::from("real_OpenCL.dll")];
        if let Some(root) = std::env::var_os("SystemRoot") {
            paths.push(PathBuf::from(root).join("System32").join("OpenCL.dll"));
        }
        paths
    }
    #[cfg(target_os = "macos")]
    {
        vec![PathBuf::from(
            "/System/Library/Frameworks/OpenCL.framework/OpenCL",
        )]
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        [
            "real_libOpenCL.so",
            "/usr/lib/x86_64-linux-gnu/libOpenCL.so.1",
            "/usr/lib64/libOpenCL.so.1",
            "/usr/lib/libOpenCL.so.1",
            "libOpenCL.so.1",
            "libOpenCL.so",
        ]
        .iter()
        .map(PathBuf::from)
        .collect()
    }
}

/// Candidate list for initialization
///
/// An override path replaces the platform list entirely.
pub fn candidate_paths(override_path: Option<&Path>) -> Vec<PathBuf> {
    match override_path {
        Some(path) => vec![path.to_path_buf()],
        None => platform_candidates(),
    }
}

/// A backend whose required entry points all resolved
pub struct LoadedBackend {
    /// Keeps the library mapped for as long as the table is in use
    pub source: Box<dyn SymbolSource>,
    pub table: DispatchTable,
    pub report: ResolutionReport,
}

impl std::fmt::Debug for LoadedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedBackend")
            .field("source", &self.source.describe())
            .field("resolved", &self.report.resolved_count())
            .finish()
    }
}

/// Try candidates in order and keep the first one that resolves
///
/// Candidates that fail to open or lack a required entry point are logged and
/// skipped. Opening is lazy: later candidates are never touched once one wins.
pub fn select_backend<I>(candidates: I) -> ShimResult<LoadedBackend>
where
    I: IntoIterator<Item = ShimResult<Box<dyn SymbolSource>>>,
{
    let mut tried = 0;
    for candidate in candidates {
        tried += 1;
        let source = match candidate {
            Ok(source) => source,
            Err(err) => {
                tracing::debug!(error = %err, "backend candidate unavailable");
                continue;
            }
        };

        match DispatchTable::resolve(source.as_ref()) {
            Ok((table, report)) => {
                tracing::info!(
                    library = source.describe(),
                    resolved = report.resolved_count(),
                    slots = report.entries.len(),
                    "backend selected"
                );
                return Ok(LoadedBackend {
                    source,
                    table,
                    report,
                });
            }
            Err(err) if err.rejects_candidate() => {
                tracing::warn!(error = %err, "backend candidate rejected");
            }
            Err(err) => return Err(err),
        }
    }
    Err(ShimError::NoUsableBackend { tried })
}

/// Open and resolve the configured backend
pub fn load_backend(override_path: Option<&Path>) -> ShimResult<LoadedBackend> {
    let paths = candidate_paths(override_path);
    select_backend(paths.into_iter().map(|path| {
        BackendLibrary::open(&path).map(|library| Box::new(library) as Box<dyn SymbolSource>)
    }))
}
