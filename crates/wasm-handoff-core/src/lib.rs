//! Worker handoff runtime over shared WebAssembly linear memory.
//!
//! This crate provides everything between a controller posting a unit of
//! work and an isolated worker context running it:
//! - [`WasmEngine`]: Wasmtime engine with the threads proposal enabled
//! - [`CompiledModule`]: Compiled module image shared with workers
//! - [`SharedLinearMemory`]: Linear memory shared by reference
//! - [`HandoffMessage`]: The `(location, module, memory, work)` tuple
//! - [`WorkerShim`]: The one-shot handler running inside a worker
//! - [`WorkerSpawner`] / [`WorkerHandle`]: Worker contexts and their results
//! - [`fault_channel`]: Controller-visible failure reporting
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐   post(HandoffMessage)   ┌──────────────────────────┐
//! │          Controller          │ ───────────────────────▶ │  Worker context (thread) │
//! │  - CompiledModule            │                          │  WorkerShim::on_handoff  │
//! │  - SharedLinearMemory ◀──────┼──── shared by reference ─┼─▶ resolve → init → run   │
//! │  - FaultObserver     ◀───────┼──── WorkerFault ─────────┤                          │
//! │  - WorkerHandle::join ◀──────┼──── Result<(), Fault> ───┤  → Terminated            │
//! └──────────────────────────────┘                          └──────────────────────────┘
//! ```

pub mod engine;
pub mod fault;
pub mod handoff;
pub mod instance;
pub mod memory;
pub mod module;
pub mod resolver;
pub mod shim;
pub mod store;
pub mod worker;

pub use engine::WasmEngine;
pub use fault::{FaultObserver, FaultReporter, WorkerFault, fault_channel};
pub use handoff::{HandoffMessage, WorkDescriptor};
pub use instance::InstanceRunner;
pub use memory::SharedLinearMemory;
pub use module::{CompiledModule, MemoryImport};
pub use resolver::{BindingRegistry, Bindings, ModuleResolver};
pub use shim::{WorkerShim, WorkerState};
pub use store::{ExecutionMetrics, LogEntry, LogLevel, WorkerContext};
pub use worker::{
    WorkerHandle, WorkerSpawner, available_parallelism, current_worker_id, is_worker_thread,
};
