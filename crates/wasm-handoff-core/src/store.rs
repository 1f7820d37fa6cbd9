//! Per-worker execution context and store management.
//!
//! This module provides:
//! - [`WorkerContext`]: Per-worker state accessible from host functions
//! - [`LogEntry`] and [`LogLevel`]: Structured logging from guest code
//! - [`ExecutionMetrics`]: Performance metrics for the single execution

use std::time::{Duration, Instant};

use wasmtime::Store;
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1::WasiP1Ctx;

use crate::{SharedLinearMemory, WasmEngine};
use wasm_handoff_common::{HandoffError, WorkerConfig};

/// Per-worker execution context.
///
/// Created once per worker context and dropped when it terminates. Host
/// functions reach it through [`wasmtime::Caller::data_mut`].
pub struct WorkerContext {
    /// WASI preview1 context.
    wasi: WasiP1Ctx,

    /// Identifier of the owning worker.
    pub worker_id: String,

    /// The shared memory this worker was initialized against.
    memory: Option<SharedLinearMemory>,

    /// Logs collected from guest code.
    pub logs: Vec<LogEntry>,

    /// Execution metrics.
    pub metrics: ExecutionMetrics,

    /// Context creation time.
    start_time: Instant,
}

/// A single log entry from guest code.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level (debug, info, warn, error).
    pub level: LogLevel,

    /// Log message content.
    pub message: String,

    /// Timestamp when the log was recorded.
    pub timestamp: Instant,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages.
    Info,
    /// Warning messages.
    Warn,
    /// Error messages.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Execution performance metrics.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    /// Fuel consumed during execution.
    pub fuel_consumed: u64,

    /// Time spent instantiating against the shared memory.
    pub init_duration: Option<Duration>,

    /// Total duration from context creation to completion.
    pub duration: Option<Duration>,
}

impl WorkerContext {
    /// Create a new worker context.
    ///
    /// # Arguments
    ///
    /// * `worker_id` - Identifier of the owning worker (for tracing)
    /// * `inherit_stdio` - Pass guest WASI stdout/stderr through to the host
    pub fn new(worker_id: String, inherit_stdio: bool) -> Self {
        let mut builder = WasiCtxBuilder::new();
        if inherit_stdio {
            builder.inherit_stdout().inherit_stderr();
        }

        Self {
            wasi: builder.build_p1(),
            worker_id,
            memory: None,
            logs: Vec::new(),
            metrics: ExecutionMetrics::default(),
            start_time: Instant::now(),
        }
    }

    /// Add a log entry.
    pub fn log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry {
            level,
            message,
            timestamp: Instant::now(),
        });
    }

    /// Bind the shared memory this context runs against.
    pub fn bind_memory(&mut self, memory: SharedLinearMemory) {
        self.memory = Some(memory);
    }

    /// The shared memory, once bound.
    pub fn memory(&self) -> Option<&SharedLinearMemory> {
        self.memory.as_ref()
    }

    /// WASI preview1 context.
    pub fn wasi_mut(&mut self) -> &mut WasiP1Ctx {
        &mut self.wasi
    }

    /// Get elapsed time since the context was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finalize metrics after execution.
    pub fn finalize_metrics(&mut self) {
        self.metrics.duration = Some(self.start_time.elapsed());
    }
}

/// Create a new Wasmtime store for a worker.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &WorkerConfig,
    worker_id: String,
) -> Result<Store<WorkerContext>, HandoffError> {
    let context = WorkerContext::new(worker_id, config.inherit_stdio);
    let mut store = Store::new(engine.inner(), context);

    if engine.is_fuel_enabled() {
        store
            .set_fuel(config.max_fuel)
            .map_err(|e| HandoffError::invalid_config(format!("Failed to set fuel: {e}")))?;
    }

    Ok(store)
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<WorkerContext>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Calculate fuel consumed.
pub fn calculate_fuel_consumed(initial_fuel: u64, store: &Store<WorkerContext>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}
