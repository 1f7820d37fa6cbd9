//! Host function registration for Wasmtime linkers.
//!
//! This module provides functions to register host functions on the linker
//! a worker instantiates its module with. The linker is built once per
//! module family and shared by every worker resolving to it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};
use wasm_handoff_common::HandoffError;
use wasm_handoff_core::store::WorkerContext;
use wasm_handoff_core::{InstanceRunner, available_parallelism, is_worker_thread};
use wasmtime::{Caller, Engine, Linker};

use crate::logging::{LoggingHost, level_from_i32};

/// Build an [`InstanceRunner`] with every standard host function registered.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn create_instance_runner(engine: Arc<Engine>) -> Result<InstanceRunner, HandoffError> {
    let mut runner = InstanceRunner::new(engine);
    register_all(runner.linker_mut())?;
    Ok(runner)
}

/// Register all standard host functions on a worker linker.
///
/// This registers the following host functions:
/// - `env::log` - Logging function for guest code
/// - `env::sleep_ms` - Asynchronous sleep
/// - `env::is_worker` - Worker context probe
/// - `env::available_parallelism` - Host parallelism hint
/// - `wasi_snapshot_preview1::*` - WASI preview1
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(linker: &mut Linker<WorkerContext>) -> Result<(), HandoffError> {
    register_logging(linker)?;
    register_sleep(linker)?;
    register_is_worker(linker)?;
    register_parallelism(linker)?;
    register_wasi(linker)?;
    Ok(())
}

/// Register the logging host function.
///
/// Registers `env::log(level: i32, ptr: i32, len: i32)` which allows guest
/// code to emit logs at various levels (debug, info, warn, error).
///
/// # Memory Protocol
///
/// The guest passes:
/// - `level`: Log level (0=debug, 1=info, 2=warn, 3=error)
/// - `ptr`: Pointer to the message string in the shared memory
/// - `len`: Length of the message in bytes (UTF-8)
pub fn register_logging(linker: &mut Linker<WorkerContext>) -> Result<(), HandoffError> {
    linker
        .func_wrap(
            "env",
            "log",
            |mut caller: Caller<'_, WorkerContext>, level: i32, ptr: i32, len: i32| {
                let (Ok(offset), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
                    warn!(ptr, len, "Invalid pointer or length (negative value)");
                    return;
                };

                let Some(memory) = caller.data().memory() else {
                    warn!("No shared memory bound to worker");
                    return;
                };

                let message = match memory.read(offset, len) {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(e) => {
                        warn!(error = %e, "Log message out of bounds");
                        return;
                    }
                };

                LoggingHost::log(caller.data_mut(), level_from_i32(level), &message);
            },
        )
        .map_err(|e| {
            HandoffError::invalid_config(format!("Failed to register log function: {e}"))
        })?;

    Ok(())
}

/// Register the asynchronous sleep host function.
///
/// Registers `env::sleep_ms(ms: i64)`. The worker's entry point is suspended
/// on the worker runtime until the delay elapses; negative delays return
/// immediately.
pub fn register_sleep(linker: &mut Linker<WorkerContext>) -> Result<(), HandoffError> {
    linker
        .func_wrap_async(
            "env",
            "sleep_ms",
            |caller: Caller<'_, WorkerContext>, (ms,): (i64,)| {
                let worker_id = caller.data().worker_id.clone();
                Box::new(async move {
                    let ms = u64::try_from(ms).unwrap_or(0);
                    trace!(worker_id = %worker_id, ms, "Guest sleeping");
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                })
            },
        )
        .map_err(|e| {
            HandoffError::invalid_config(format!("Failed to register sleep function: {e}"))
        })?;

    Ok(())
}

/// Register the worker probe.
///
/// Registers `env::is_worker() -> i32`, returning 1 when the calling code
/// runs inside a worker context and 0 otherwise.
pub fn register_is_worker(linker: &mut Linker<WorkerContext>) -> Result<(), HandoffError> {
    linker
        .func_wrap("env", "is_worker", || -> i32 { i32::from(is_worker_thread()) })
        .map_err(|e| {
            HandoffError::invalid_config(format!("Failed to register is_worker function: {e}"))
        })?;

    Ok(())
}

/// Register the parallelism hint.
///
/// Registers `env::available_parallelism() -> i32`, the number of workers
/// the host can run at once (at least 1, saturating at `i32::MAX`).
pub fn register_parallelism(linker: &mut Linker<WorkerContext>) -> Result<(), HandoffError> {
    linker
        .func_wrap("env", "available_parallelism", || -> i32 {
            parallelism_hint(available_parallelism())
        })
        .map_err(|e| {
            HandoffError::invalid_config(format!(
                "Failed to register available_parallelism function: {e}"
            ))
        })?;

    Ok(())
}

fn parallelism_hint(parallelism: usize) -> i32 {
    i32::try_from(parallelism).unwrap_or(i32::MAX)
}

/// Register WASI preview1 (`wasi_snapshot_preview1`).
///
/// Modules built for `wasm32-wasip1-threads` import WASI alongside their
/// shared memory.
pub fn register_wasi(linker: &mut Linker<WorkerContext>) -> Result<(), HandoffError> {
    wasmtime_wasi::preview1::add_to_linker_async(linker, |ctx: &mut WorkerContext| {
        ctx.wasi_mut()
    })
    .map_err(|e| HandoffError::invalid_config(format!("Failed to register WASI: {e}")))
}
