//! WebAssembly instance lifecycle inside a worker.
//!
//! This module provides [`InstanceRunner`], which holds the host interface
//! (a [`Linker`]) for one module family and drives the two stages a worker
//! goes through:
//!
//! 1. Initialize: link the supplied shared memory as the module's memory
//!    import and instantiate
//! 2. Execute: call the entry point with the work descriptor and await it

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};
use wasmtime::{Engine, Instance, Linker, Store, Trap};

use crate::store::{WorkerContext, calculate_fuel_consumed, get_remaining_fuel};
use crate::{CompiledModule, SharedLinearMemory, WorkDescriptor};
use wasm_handoff_common::{HandoffError, WorkerConfig};

/// Instance lifecycle manager.
///
/// # Thread Safety
///
/// `InstanceRunner` is shared between workers behind an `Arc`. Each worker
/// uses its own [`Store`] and its own copy of the linker, so memory
/// definitions never leak between workers.
pub struct InstanceRunner {
    engine: Arc<Engine>,
    linker: Linker<WorkerContext>,
}

impl InstanceRunner {
    /// Create a new instance runner with an empty host interface.
    pub fn new(engine: Arc<Engine>) -> Self {
        let linker = Linker::new(&engine);
        Self { engine, linker }
    }

    /// Get a mutable reference to the linker.
    ///
    /// Use this to register host functions.
    pub fn linker_mut(&mut self) -> &mut Linker<WorkerContext> {
        &mut self.linker
    }

    /// Instantiate `module` against the supplied shared memory.
    ///
    /// No memory is allocated here: the module must import its memory as
    /// `config.memory_import_module::config.memory_import_name`, and that
    /// import is satisfied with `memory`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The module does not import a memory under the configured name
    /// - The memory does not fit the import
    /// - Instantiation fails
    #[instrument(skip_all, fields(content_hash = %module.content_hash()))]
    pub async fn initialize(
        &self,
        store: &mut Store<WorkerContext>,
        module: &CompiledModule,
        memory: &SharedLinearMemory,
        config: &WorkerConfig,
    ) -> Result<Instance, HandoffError> {
        let start = Instant::now();

        let import = module
            .memory_import(&config.memory_import_module, &config.memory_import_name)
            .ok_or_else(|| {
                HandoffError::incompatible_memory(format!(
                    "module does not import memory {}::{}",
                    config.memory_import_module, config.memory_import_name
                ))
            })?;

        memory.check_import(&import)?;

        let mut linker = self.linker.clone();
        linker.allow_shadowing(true);
        linker
            .define(
                &*store,
                &import.module,
                &import.name,
                memory.inner().clone(),
            )
            .map_err(|e| {
                HandoffError::initialization_failed(format!("Failed to link shared memory: {e}"))
            })?;

        store.data_mut().bind_memory(memory.clone());

        debug!("Instantiating module against shared memory");

        let instance = linker
            .instantiate_async(&mut *store, module.as_module())
            .await
            .map_err(|e| {
                HandoffError::initialization_failed(format!("Instantiation failed: {e}"))
            })?;

        store.data_mut().metrics.init_duration = Some(start.elapsed());
        debug!(
            duration_us = start.elapsed().as_micros(),
            "Module instantiated"
        );

        Ok(instance)
    }

    /// Invoke `entry_point` with the work descriptor and await completion.
    ///
    /// The returned future resolves only once the call has fully finished,
    /// including any async host functions it awaited.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry point is missing or has the wrong
    /// signature, if fuel runs out, or if the call traps.
    #[instrument(skip(self, store, instance, work), fields(work = work.handle()))]
    pub async fn execute(
        &self,
        store: &mut Store<WorkerContext>,
        instance: &Instance,
        entry_point: &str,
        work: WorkDescriptor,
    ) -> Result<(), HandoffError> {
        let start = Instant::now();
        let initial_fuel = get_remaining_fuel(store).unwrap_or(0);

        let func = instance
            .get_typed_func::<i32, ()>(&mut *store, entry_point)
            .map_err(|_| HandoffError::EntryPointNotFound {
                name: entry_point.to_string(),
            })?;

        debug!("Executing entry point");

        let result = func.call_async(&mut *store, work.into_entry_arg()).await;

        let fuel_consumed = calculate_fuel_consumed(initial_fuel, store);
        store.data_mut().metrics.fuel_consumed = fuel_consumed;
        store.data_mut().finalize_metrics();

        let duration = start.elapsed();

        match result {
            Ok(()) => {
                info!(
                    duration_ms = duration.as_millis(),
                    fuel_consumed = fuel_consumed,
                    "Entry point completed"
                );
                Ok(())
            }
            Err(trap) => {
                if is_out_of_fuel(&trap) {
                    warn!(
                        duration_ms = duration.as_millis(),
                        fuel_consumed = fuel_consumed,
                        "Execution terminated: fuel exhausted"
                    );
                    return Err(HandoffError::FuelExhausted);
                }

                let (message, code) = extract_trap_info(&trap);
                error!(
                    duration_ms = duration.as_millis(),
                    trap_message = %message,
                    "Entry point trapped"
                );
                Err(HandoffError::trap(message, code))
            }
        }
    }

    /// Get the engine reference.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

/// Extract human-readable trap information.
fn extract_trap_info(error: &wasmtime::Error) -> (String, Option<String>) {
    let message = format!("{error:#}");
    let code = error.downcast_ref::<Trap>().map(|trap| format!("{trap:?}"));
    (message, code)
}

/// Check if an error is due to fuel exhaustion.
fn is_out_of_fuel(error: &wasmtime::Error) -> bool {
    error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
}

impl std::fmt::Debug for InstanceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRunner").finish_non_exhaustive()
    }
}
