//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the foundation of the runtime. It is:
//! - Thread-safe and shared between the controller and all workers
//! - Configured with the threads proposal so linear memory can be shared
//! - Set up for async execution so entry points may await host calls

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use wasmtime::{Config, Engine, OptLevel};

use wasm_handoff_common::{EngineConfig, HandoffError};

/// Thread-safe WebAssembly engine wrapper.
///
/// A module and the shared memory it runs against must come from the same
/// engine, so the controller creates one `WasmEngine` and hands clones of
/// it to every worker it spawns.
///
/// # Example
///
/// ```ignore
/// use wasm_handoff_common::EngineConfig;
/// use wasm_handoff_core::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the Wasmtime configuration is rejected.
    pub fn new(config: &EngineConfig) -> Result<Self, HandoffError> {
        let mut wasmtime_config = Config::new();

        // Entry points may call async host functions
        wasmtime_config.async_support(true);

        // Shared memories and atomics
        wasmtime_config.wasm_threads(config.wasm_threads);

        wasmtime_config.consume_fuel(config.consume_fuel);

        wasmtime_config.cranelift_opt_level(if config.cranelift_opt_speed {
            OptLevel::Speed
        } else {
            OptLevel::SpeedAndSize
        });

        if let Some(ref cache_dir) = config.cache_dir {
            let cache_config = write_cache_config(Path::new(cache_dir))?;
            wasmtime_config.cache_config_load(&cache_config).map_err(|e| {
                HandoffError::invalid_config(format!("Failed to enable module cache: {e}"))
            })?;
            debug!(cache_dir = %cache_dir, "Compilation cache enabled");
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            HandoffError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!(
            wasm_threads = config.wasm_threads,
            consume_fuel = config.consume_fuel,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check if shared memories are supported by this engine.
    pub fn supports_shared_memory(&self) -> bool {
        self.config.wasm_threads
    }

    /// Check if fuel metering is enabled.
    pub fn is_fuel_enabled(&self) -> bool {
        self.config.consume_fuel
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("wasm_threads", &self.config.wasm_threads)
            .field("consume_fuel", &self.config.consume_fuel)
            .finish_non_exhaustive()
    }
}

/// Name of the Wasmtime cache configuration written into the cache directory.
const CACHE_CONFIG_FILE: &str = "wasmtime-cache.toml";

/// Write a Wasmtime cache configuration pointing at `cache_dir`.
fn write_cache_config(cache_dir: &Path) -> Result<PathBuf, HandoffError> {
    std::fs::create_dir_all(cache_dir)?;
    let directory = std::fs::canonicalize(cache_dir)?;

    // Written as a TOML literal string, which has no escapes.
    let Some(literal) = directory.to_str().filter(|d| !d.contains('\'')) else {
        return Err(HandoffError::invalid_config(format!(
            "cache directory {} cannot be used by the module cache",
            directory.display()
        )));
    };

    let path = directory.join(CACHE_CONFIG_FILE);
    std::fs::write(&path, format!("[cache]\nenabled = true\ndirectory = '{literal}'\n"))?;
    Ok(path)
}
