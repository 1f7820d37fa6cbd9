//! Shared linear memory handed between the controller and workers.
//!
//! [`SharedLinearMemory`] wraps a Wasmtime [`SharedMemory`]. Cloning it
//! clones a reference, never the bytes: every clone, and every instance
//! initialized against it, observes the same linear memory.
//!
//! No locking happens here. Keeping concurrent writers apart is the job of
//! whatever the work descriptors describe (disjoint ranges, atomics).

use tracing::debug;
use wasmtime::{MemoryType, SharedMemory};

use wasm_handoff_common::{HandoffError, HostFunctionError, MemoryConfig};

use crate::WasmEngine;
use crate::module::MemoryImport;

/// A growable linear memory shared by reference.
#[derive(Clone)]
pub struct SharedLinearMemory {
    inner: SharedMemory,
}

impl SharedLinearMemory {
    /// Create a shared memory with the given page limits.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine does not support shared memory or
    /// the limits are invalid.
    pub fn new(
        engine: &WasmEngine,
        initial_pages: u32,
        maximum_pages: u32,
    ) -> Result<Self, HandoffError> {
        if !engine.supports_shared_memory() {
            return Err(HandoffError::invalid_config(
                "shared memory requires `wasm_threads` to be enabled",
            ));
        }

        let ty = MemoryType::shared(initial_pages, maximum_pages);
        let inner = SharedMemory::new(engine.inner(), ty).map_err(|e| {
            HandoffError::invalid_config(format!("Failed to create shared memory: {e}"))
        })?;

        debug!(initial_pages, maximum_pages, "Shared memory created");

        Ok(Self { inner })
    }

    /// Create a shared memory from a [`MemoryConfig`].
    ///
    /// # Errors
    ///
    /// See [`SharedLinearMemory::new`].
    pub fn from_config(engine: &WasmEngine, config: &MemoryConfig) -> Result<Self, HandoffError> {
        Self::new(engine, config.initial_pages, config.maximum_pages)
    }

    /// Create a shared memory shaped exactly like a module's import.
    ///
    /// # Errors
    ///
    /// Returns an error if the import is not a shared 32-bit memory.
    pub fn for_import(engine: &WasmEngine, import: &MemoryImport) -> Result<Self, HandoffError> {
        let ty = &import.ty;
        if !ty.is_shared() || ty.is_64() {
            return Err(HandoffError::incompatible_memory(format!(
                "import {}::{} is not a shared 32-bit memory",
                import.module, import.name
            )));
        }
        let maximum = ty.maximum().unwrap_or(ty.minimum());
        let (Ok(initial), Ok(maximum)) = (u32::try_from(ty.minimum()), u32::try_from(maximum))
        else {
            return Err(HandoffError::incompatible_memory(
                "import limits exceed 32-bit page counts",
            ));
        };
        Self::new(engine, initial, maximum)
    }

    /// Check that this memory can satisfy a module's memory import.
    ///
    /// The import must be shared; the current size must cover the declared
    /// minimum and the maximum must not exceed the declared maximum.
    ///
    /// # Errors
    ///
    /// Returns [`HandoffError::IncompatibleMemory`] describing the mismatch.
    pub fn check_import(&self, import: &MemoryImport) -> Result<(), HandoffError> {
        let declared = &import.ty;
        let supplied = self.inner.ty();

        if !declared.is_shared() {
            return Err(HandoffError::incompatible_memory(format!(
                "module imports {}::{} as unshared memory",
                import.module, import.name
            )));
        }

        if declared.is_64() != supplied.is_64() {
            return Err(HandoffError::incompatible_memory(
                "index type differs between module and memory",
            ));
        }

        let size = self.size_pages();
        if size < declared.minimum() {
            return Err(HandoffError::incompatible_memory(format!(
                "memory has {size} pages, module requires at least {}",
                declared.minimum()
            )));
        }

        if let Some(declared_max) = declared.maximum() {
            match supplied.maximum() {
                Some(max) if max <= declared_max => {}
                Some(max) => {
                    return Err(HandoffError::incompatible_memory(format!(
                        "memory maximum {max} pages exceeds module maximum {declared_max}"
                    )));
                }
                None => {
                    return Err(HandoffError::incompatible_memory(
                        "memory is unbounded, module declares a maximum",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Current size in pages.
    pub fn size_pages(&self) -> u64 {
        self.inner.size()
    }

    /// Current size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.inner.data_size()
    }

    /// Maximum size in pages, if bounded.
    pub fn maximum_pages(&self) -> Option<u64> {
        self.inner.ty().maximum()
    }

    /// Grow by `delta` pages, returning the previous size in pages.
    ///
    /// # Errors
    ///
    /// Returns an error if growing would exceed the maximum.
    pub fn grow(&self, delta: u64) -> Result<u64, HandoffError> {
        self.inner.grow(delta).map_err(|e| {
            HandoffError::invalid_config(format!("Failed to grow shared memory: {e}"))
        })
    }

    /// Copy `len` bytes starting at `offset` out of the memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds.
    #[allow(unsafe_code)]
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, HostFunctionError> {
        let data = self.inner.data();
        let end = checked_end(offset, len, data.len())?;

        let mut out = vec![0u8; len];
        // SAFETY: bounds checked above; `UnsafeCell<u8>` has the layout of `u8`.
        // Concurrent writers may race, which the work contract must rule out.
        unsafe {
            std::ptr::copy_nonoverlapping(
                std::cell::UnsafeCell::raw_get(data[offset..end].as_ptr()),
                out.as_mut_ptr(),
                len,
            );
        }
        Ok(out)
    }

    /// Copy `bytes` into the memory at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds.
    #[allow(unsafe_code)]
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), HostFunctionError> {
        let data = self.inner.data();
        let end = checked_end(offset, bytes.len(), data.len())?;

        // SAFETY: bounds checked above; writes go through `UnsafeCell`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                std::cell::UnsafeCell::raw_get(data[offset..end].as_ptr()),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Read a little-endian `u32` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds.
    pub fn read_u32(&self, offset: usize) -> Result<u32, HostFunctionError> {
        let bytes = self.read(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write a little-endian `u32` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds.
    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), HostFunctionError> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Get the inner Wasmtime shared memory.
    pub fn inner(&self) -> &SharedMemory {
        &self.inner
    }
}

impl std::fmt::Debug for SharedLinearMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLinearMemory")
            .field("size_pages", &self.size_pages())
            .field("maximum_pages", &self.maximum_pages())
            .finish()
    }
}

fn checked_end(offset: usize, len: usize, size: usize) -> Result<usize, HostFunctionError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(end),
        _ => Err(HostFunctionError::OutOfBounds { offset, len, size }),
    }
}
