//! Lazily resolved extension entry points
//!
//! Extensions are looked up on first use through the backend's
//! `clGetExtensionFunctionAddressForPlatform` when it exports one, falling
//! back to the generic `clGetExtensionFunctionAddress`. Hits and misses are
//! both cached per (platform, name), so a given extension costs at most one
//! backend lookup per platform.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::ptr::NonNull;

use super::dispatch::DispatchTable;
use super::ffi::cl_platform_id;
use crate::error::{ShimError, ShimResult};

const FOR_PLATFORM: &str = "clGetExtensionFunctionAddressForPlatform";

#[derive(Debug, Default)]
pub struct ExtensionCache {
    entries: HashMap<(usize, String), Option<usize>>,
    backend_lookups: u64,
}

impl ExtensionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `name` for `platform`, consulting the backend at most once
    pub fn resolve(
        &mut self,
        table: &DispatchTable,
        platform: cl_platform_id,
        name: &str,
    ) -> ShimResult<NonNull<c_void>> {
        let key = (platform as usize, name.to_string());
        let address = match self.entries.get(&key) {
            Some(cached) => *cached,
            None => {
                let found = self.lookup(table, platform, name)?;
                self.entries.insert(key, found);
                found
            }
        };

        address
            .and_then(|address| NonNull::new(address as *mut c_void))
            .ok_or_else(|| ShimError::ExtensionUnsupported(name.to_string()))
    }

    /// Resolve `name` and reinterpret it as the function pointer type `F`
    ///
    /// # Safety
    ///
    /// `F` must be the exact function pointer type of the extension.
    pub unsafe fn resolve_as<F: Copy>(
        &mut self,
        table: &DispatchTable,
        platform: cl_platform_id,
        name: &str,
    ) -> ShimResult<F> {
        if std::mem::size_of::<F>() != std::mem::size_of::<*mut c_void>() {
            return Err(ShimError::ExtensionUnsupported(format!(
                "{name} (requested type is not pointer sized)"
            )));
        }
        let address = self.resolve(table, platform, name)?;
        Ok(std::mem::transmute_copy::<*mut c_void, F>(&address.as_ptr()))
    }

    /// Cached outcome without touching the backend
    ///
    /// `None` when never looked up, `Some(None)` for a cached miss.
    pub fn cached(&self, platform: cl_platform_id, name: &str) -> Option<Option<usize>> {
        self.entries
            .get(&(platform as usize, name.to_string()))
            .copied()
    }

    /// Number of lookups that reached the backend
    pub fn backend_lookups(&self) -> u64 {
        self.backend_lookups
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lookup(
        &mut self,
        table: &DispatchTable,
        platform: cl_platform_id,
        name: &str,
    ) -> ShimResult<Option<usize>> {
        let c_name =
            CString::new(name).map_err(|_| ShimError::ExtensionUnsupported(name.to_string()))?;
        self.backend_lookups += 1;

        let use_platform_lookup = !platform.is_null() && !table.is_stub(FOR_PLATFORM);
        // SAFETY: both slots are either resolved backend functions or stubs,
        // and `c_name` outlives the call.
        let address = unsafe {
            if use_platform_lookup {
                (table.clGetExtensionFunctionAddressForPlatform)(platform, c_name.as_ptr())
            } else {
                (table.clGetExtensionFunctionAddress)(c_name.as_ptr())
            }
        };

        if address.is_null() {
            tracing::debug!(extension = name, platform = ?platform, "extension not exported");
            Ok(None)
        } else {
            tracing::trace!(extension = name, platform = ?platform, ?address, "extension resolved");
            Ok(Some(address as usize))
        }
    }
}
