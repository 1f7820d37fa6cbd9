//! WebAssembly module compilation and introspection.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's [`Module`]
//! that handles compilation, AOT serialization, and the import/export
//! inspection the handoff shim relies on.
//!
//! # Compilation Strategies
//!
//! - **JIT**: Compile from Wasm bytes at runtime (slower cold start)
//! - **AOT**: Pre-compile and serialize to disk (fast cold start)

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::time::Instant;

use tracing::{debug, info, instrument};
use wasmtime::{Engine, ExternType, MemoryType, Module};

use wasm_handoff_common::HandoffError;

/// A compiled WebAssembly module.
///
/// The content hash identifies the module family: a location must resolve
/// to bindings of the same family as the module carried by a handoff.
///
/// # Thread Safety
///
/// `CompiledModule` is cheap to clone and can be shared across workers.
#[derive(Clone)]
pub struct CompiledModule {
    /// The compiled Wasmtime module.
    inner: Module,

    /// Hash of the original Wasm bytes.
    content_hash: String,

    /// When this module was compiled.
    compiled_at: Instant,
}

/// A memory import declared by a module.
#[derive(Debug, Clone)]
pub struct MemoryImport {
    /// Import module name (e.g. `env`).
    pub module: String,
    /// Import field name (e.g. `memory`).
    pub name: String,
    /// Declared memory type.
    pub ty: MemoryType,
}

impl CompiledModule {
    /// Compile a module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails (e.g., invalid Wasm).
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, HandoffError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            HandoffError::compilation_failed(format!("Module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Compile a module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, HandoffError> {
        let start = Instant::now();

        let module = Module::new(engine, wat).map_err(|e| {
            HandoffError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(wat.as_bytes());

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Read and compile a `.wasm` file, or load a `.cwasm` AOT artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or compiled.
    pub fn from_file(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, HandoffError> {
        let path = path.as_ref();
        if path.extension().is_some_and(|ext| ext == "cwasm") {
            return Self::from_precompiled(engine, path);
        }

        let bytes = std::fs::read(path)?;
        Self::from_bytes(engine, &bytes)
    }

    /// Load a pre-compiled module from disk.
    ///
    /// # Safety
    ///
    /// This deserializes pre-compiled machine code. Only load artifacts
    /// that were produced by [`CompiledModule::serialize`] with the same
    /// Wasmtime version and engine settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact cannot be loaded or is incompatible.
    #[allow(unsafe_code)]
    #[instrument(skip(engine, path))]
    pub fn from_precompiled(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, HandoffError> {
        let path = path.as_ref();
        let start = Instant::now();

        // SAFETY: artifacts come from our own `compile` command
        let module = unsafe { Module::deserialize_file(engine, path) }.map_err(|e| {
            HandoffError::compilation_failed(format!(
                "Failed to load precompiled module from {}: {e}",
                path.display()
            ))
        })?;

        // Filename convention: {hash}.cwasm
        let content_hash = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        debug!(
            path = %path.display(),
            content_hash = %content_hash,
            duration_us = start.elapsed().as_micros(),
            "Precompiled module loaded"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Serialize the compiled module for AOT caching.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn serialize(&self) -> Result<Vec<u8>, HandoffError> {
        self.inner.serialize().map_err(|e| {
            HandoffError::compilation_failed(format!("Module serialization failed: {e}"))
        })
    }

    /// Get the content hash of the original Wasm bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Get the inner Wasmtime module.
    pub fn as_module(&self) -> &Module {
        &self.inner
    }

    /// Find the memory import named `module::name`.
    pub fn memory_import(&self, module: &str, name: &str) -> Option<MemoryImport> {
        self.inner.imports().find_map(|import| match import.ty() {
            ExternType::Memory(ty) if import.module() == module && import.name() == name => {
                Some(MemoryImport {
                    module: import.module().to_string(),
                    name: import.name().to_string(),
                    ty,
                })
            }
            _ => None,
        })
    }

    /// Check that `name` is exported as a function.
    pub fn has_function_export(&self, name: &str) -> bool {
        self.inner
            .exports()
            .any(|e| e.name() == name && matches!(e.ty(), ExternType::Func(_)))
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), HandoffError> {
        if bytes.len() < 8 {
            return Err(HandoffError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(HandoffError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
