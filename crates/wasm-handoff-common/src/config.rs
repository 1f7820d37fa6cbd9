//! Configuration structures for wasm-handoff.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (threads, fuel, caching)
//! - [`WorkerConfig`]: Per-worker settings (entry point, memory import, thread)
//! - [`MemoryConfig`]: Shape of controller-created shared memory

use serde::{Deserialize, Serialize};

/// Size of a WebAssembly page in bytes.
pub const WASM_PAGE_SIZE: usize = 65_536;

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for wasm-handoff.
/// It can be loaded from files (TOML, JSON).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Worker context configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Shared memory configuration.
    #[serde(default)]
    pub memory: MemoryConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine shared by the
/// controller and every worker it spawns.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable the threads proposal (shared memories and atomics).
    ///
    /// Workers cannot share linear memory without it.
    #[serde(default = "defaults::wasm_threads")]
    pub wasm_threads: bool,

    /// Enable fuel metering.
    ///
    /// When enabled, each worker store is given `worker.max_fuel` units.
    #[serde(default = "defaults::consume_fuel")]
    pub consume_fuel: bool,

    /// Optimize generated code for speed rather than size.
    #[serde(default = "defaults::cranelift_opt_speed")]
    pub cranelift_opt_speed: bool,

    /// Directory for the Wasmtime compilation cache.
    ///
    /// Created on engine start. `wasm-handoff compile` also writes
    /// `{hash}.cwasm` artifacts here by default.
    #[serde(default)]
    pub cache_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wasm_threads: defaults::wasm_threads(),
            consume_fuel: defaults::consume_fuel(),
            cranelift_opt_speed: defaults::cranelift_opt_speed(),
            cache_dir: None,
        }
    }
}

/// Worker context configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Name of the exported function invoked with the work descriptor.
    #[serde(default = "defaults::entry_point")]
    pub entry_point: String,

    /// Import module under which the shared memory is provided.
    #[serde(default = "defaults::memory_import_module")]
    pub memory_import_module: String,

    /// Import name under which the shared memory is provided.
    #[serde(default = "defaults::memory_import_name")]
    pub memory_import_name: String,

    /// Fuel given to each worker store when metering is enabled.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Prefix for worker OS thread names.
    #[serde(default = "defaults::thread_name_prefix")]
    pub thread_name_prefix: String,

    /// Worker thread stack size in kilobytes.
    #[serde(default = "defaults::stack_size_kb")]
    pub stack_size_kb: usize,

    /// Let guest WASI stdout/stderr through to the host.
    #[serde(default = "defaults::inherit_stdio")]
    pub inherit_stdio: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            entry_point: defaults::entry_point(),
            memory_import_module: defaults::memory_import_module(),
            memory_import_name: defaults::memory_import_name(),
            max_fuel: defaults::max_fuel(),
            thread_name_prefix: defaults::thread_name_prefix(),
            stack_size_kb: defaults::stack_size_kb(),
            inherit_stdio: defaults::inherit_stdio(),
        }
    }
}

impl WorkerConfig {
    /// Stack size in bytes.
    pub fn stack_size(&self) -> usize {
        self.stack_size_kb * 1024
    }
}

/// Shape of shared memory created by the controller.
///
/// Shared memories must declare a maximum, so both limits are required.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Initial size in 64 KiB pages.
    #[serde(default = "defaults::initial_pages")]
    pub initial_pages: u32,

    /// Maximum size in 64 KiB pages.
    #[serde(default = "defaults::maximum_pages")]
    pub maximum_pages: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            initial_pages: defaults::initial_pages(),
            maximum_pages: defaults::maximum_pages(),
        }
    }
}

impl MemoryConfig {
    /// Maximum size in bytes.
    pub fn maximum_bytes(&self) -> usize {
        self.maximum_pages as usize * WASM_PAGE_SIZE
    }

    /// Returns `true` if the limits describe a valid shared memory.
    pub fn is_valid(&self) -> bool {
        self.initial_pages <= self.maximum_pages && self.maximum_pages <= 65_536
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn wasm_threads() -> bool {
        true
    }

    pub const fn consume_fuel() -> bool {
        false
    }

    pub const fn cranelift_opt_speed() -> bool {
        true
    }

    pub fn entry_point() -> String {
        "worker_entry_point".to_string()
    }

    pub fn memory_import_module() -> String {
        "env".to_string()
    }

    pub fn memory_import_name() -> String {
        "memory".to_string()
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub fn thread_name_prefix() -> String {
        "handoff-worker".to_string()
    }

    pub const fn stack_size_kb() -> usize {
        2048
    }

    pub const fn inherit_stdio() -> bool {
        true
    }

    pub const fn initial_pages() -> u32 {
        1
    }

    pub const fn maximum_pages() -> u32 {
        16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert!(config.engine.wasm_threads);
        assert!(!config.engine.consume_fuel);
        assert!(config.engine.cache_dir.is_none());

        assert_eq!(config.worker.entry_point, "worker_entry_point");
        assert_eq!(config.worker.memory_import_module, "env");
        assert_eq!(config.worker.memory_import_name, "memory");
        assert_eq!(config.worker.max_fuel, 10_000_000);
        assert_eq!(config.worker.stack_size(), 2048 * 1024);

        assert_eq!(config.memory.initial_pages, 1);
        assert_eq!(config.memory.maximum_pages, 16);
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.worker.entry_point, deserialized.worker.entry_point);
        assert_eq!(
            config.memory.maximum_pages,
            deserialized.memory.maximum_pages
        );
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"worker": {"entry_point": "run_job"}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.worker.entry_point, "run_job");
        assert_eq!(config.worker.memory_import_name, "memory");
        assert!(config.engine.wasm_threads);
    }

    #[test]
    fn test_memory_config_validity() {
        assert!(MemoryConfig::default().is_valid());
        assert_eq!(MemoryConfig::default().maximum_bytes(), 16 * WASM_PAGE_SIZE);

        let inverted = MemoryConfig {
            initial_pages: 4,
            maximum_pages: 2,
        };
        assert!(!inverted.is_valid());
    }
}
