//! End-to-end tests for worker handoff.
//!
//! These tests drive real worker contexts:
//! - Spawning a worker and posting the handoff message
//! - Resolution, initialization against shared memory, execution
//! - Fault reporting and termination

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_test::{assert_err, assert_ok};
use wasm_handoff_common::{EngineConfig, FailureKind, HandoffError, WorkerConfig};
use wasm_handoff_core::{
    BindingRegistry, CompiledModule, FaultObserver, HandoffMessage, SharedLinearMemory,
    WasmEngine, WorkDescriptor, WorkerSpawner, WorkerState, available_parallelism,
    fault_channel,
};
use wasm_handoff_host::create_instance_runner;

struct Harness {
    engine: WasmEngine,
    registry: Arc<BindingRegistry>,
    spawner: WorkerSpawner,
    faults: FaultObserver,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(EngineConfig::default(), WorkerConfig::default())
    }

    fn with_config(engine_config: EngineConfig, worker_config: WorkerConfig) -> Self {
        let engine = WasmEngine::new(&engine_config).unwrap();
        let runner = create_instance_runner(Arc::new(engine.inner().clone())).unwrap();
        let registry = Arc::new(BindingRegistry::new(engine.clone(), Arc::new(runner)));
        let (reporter, faults) = fault_channel();
        let spawner = WorkerSpawner::new(engine.clone(), registry.clone(), worker_config, reporter);

        Self {
            engine,
            registry,
            spawner,
            faults,
        }
    }

    /// Compile `wat` and register it under `location`.
    fn module(&self, location: &str, wat: &str) -> Arc<CompiledModule> {
        let module = Arc::new(CompiledModule::from_wat(self.engine.inner(), wat).unwrap());
        self.registry.register(location, &module);
        module
    }

    fn memory(&self, initial: u32, maximum: u32) -> SharedLinearMemory {
        SharedLinearMemory::new(&self.engine, initial, maximum).unwrap()
    }
}

// ============================================================================
// Test: Successful Handoff
// ============================================================================

#[tokio::test]
async fn test_successful_handoff() {
    let wat = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (func (export "worker_entry_point") (param $work i32)
                (i32.store (local.get $work) (i32.const 42))
            )
        )
    "#;

    let mut h = Harness::new();
    let module = h.module("app", wat);
    let memory = h.memory(1, 1);

    let handle = h
        .spawner
        .spawn_with(HandoffMessage::new("app", module, memory.clone(), WorkDescriptor::new(64)))
        .unwrap();

    handle.terminated().await;
    assert_eq!(handle.state(), WorkerState::Terminated);
    assert_ok!(handle.join().await);

    assert_eq!(memory.read_u32(64).unwrap(), 42);
    assert!(h.faults.drain().is_empty());
}

// ============================================================================
// Test: Exactly-Once Handoff
// ============================================================================

#[tokio::test]
async fn test_second_post_is_rejected() {
    let wat = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (func (export "worker_entry_point") (param $work i32)
                (drop (i32.atomic.rmw.add (local.get $work) (i32.const 1)))
            )
        )
    "#;

    let mut h = Harness::new();
    let module = h.module("app", wat);
    let memory = h.memory(1, 1);

    let handle = h.spawner.spawn().unwrap();
    handle
        .post(HandoffMessage::new("app", module.clone(), memory.clone(), WorkDescriptor::new(0)))
        .unwrap();

    let err = assert_err!(handle.post(HandoffMessage::new(
        "app",
        module,
        memory.clone(),
        WorkDescriptor::new(0)
    )));
    assert!(matches!(err, HandoffError::AlreadyHandedOff { .. }));
    assert!(err.kind().is_none());

    handle.join().await.unwrap();
    assert_eq!(memory.read_u32(0).unwrap(), 1);
    assert!(h.faults.drain().is_empty());
}

#[tokio::test]
async fn test_join_without_post() {
    let h = Harness::new();
    let handle = h.spawner.spawn().unwrap();

    assert_ok!(handle.join().await);
}

// ============================================================================
// Test: Execution Fault
// ============================================================================

#[tokio::test]
async fn test_trap_is_reported_once() {
    let wat = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (func (export "worker_entry_point") (param i32)
                unreachable
            )
        )
    "#;

    let mut h = Harness::new();
    let module = h.module("app", wat);

    let handle = h
        .spawner
        .spawn_with(HandoffMessage::new("app", module, h.memory(1, 1), WorkDescriptor::new(0)))
        .unwrap();
    let worker_id = handle.id().to_string();

    handle.terminated().await;
    assert_eq!(handle.state(), WorkerState::Terminated);

    let fault = handle.join().await.unwrap_err();
    assert_eq!(fault.kind(), FailureKind::Execution);
    assert!(matches!(fault.error(), HandoffError::Trap { .. }));

    let reported = h.faults.drain();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].worker_id(), worker_id);
}

#[tokio::test]
async fn test_fuel_exhaustion() {
    let wat = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (func (export "worker_entry_point") (param i32)
                (loop $spin (br $spin))
            )
        )
    "#;

    let engine_config = EngineConfig {
        consume_fuel: true,
        ..Default::default()
    };
    let worker_config = WorkerConfig {
        max_fuel: 10_000,
        ..Default::default()
    };
    let mut h = Harness::with_config(engine_config, worker_config);
    let module = h.module("app", wat);

    let handle = h
        .spawner
        .spawn_with(HandoffMessage::new("app", module, h.memory(1, 1), WorkDescriptor::new(0)))
        .unwrap();

    let fault = handle.join().await.unwrap_err();
    assert_eq!(fault.kind(), FailureKind::Execution);
    assert!(matches!(fault.error(), HandoffError::FuelExhausted));
    assert_eq!(h.faults.drain().len(), 1);
}

// ============================================================================
// Test: Initialization Fault
// ============================================================================

#[tokio::test]
async fn test_incompatible_memory() {
    let wat = r#"
        (module
            (import "env" "memory" (memory 1 4 shared))
            (func (export "worker_entry_point") (param i32))
        )
    "#;

    let mut h = Harness::new();
    let module = h.module("app", wat);

    let handle = h
        .spawner
        .spawn_with(HandoffMessage::new("app", module, h.memory(1, 8), WorkDescriptor::new(0)))
        .unwrap();

    let fault = handle.join().await.unwrap_err();
    assert_eq!(fault.kind(), FailureKind::Initialization);
    assert!(fault.error().is_incompatible_memory());
    assert_eq!(h.faults.drain().len(), 1);
}

#[tokio::test]
async fn test_unshared_memory_import() {
    let wat = r#"
        (module
            (import "env" "memory" (memory 1))
            (func (export "worker_entry_point") (param i32))
        )
    "#;

    let mut h = Harness::new();
    let module = h.module("app", wat);

    let handle = h
        .spawner
        .spawn_with(HandoffMessage::new("app", module, h.memory(1, 1), WorkDescriptor::new(0)))
        .unwrap();

    let fault = handle.join().await.unwrap_err();
    assert_eq!(fault.kind(), FailureKind::Initialization);
    assert_eq!(h.faults.drain().len(), 1);
}

#[tokio::test]
async fn test_missing_entry_point() {
    let wat = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (func (export "main") (param i32))
        )
    "#;

    let mut h = Harness::new();
    let module = h.module("app", wat);

    let handle = h
        .spawner
        .spawn_with(HandoffMessage::new("app", module, h.memory(1, 1), WorkDescriptor::new(0)))
        .unwrap();

    let fault = handle.join().await.unwrap_err();
    assert!(matches!(
        fault.error(),
        HandoffError::EntryPointNotFound { name } if name == "worker_entry_point"
    ));
    assert_eq!(h.faults.drain().len(), 1);
}

// ============================================================================
// Test: Resolution Fault
// ============================================================================

#[tokio::test]
async fn test_unknown_location() {
    let wat = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (func (export "worker_entry_point") (param i32))
        )
    "#;

    let mut h = Harness::new();
    let module = h.module("app", wat);

    let handle = h
        .spawner
        .spawn_with(HandoffMessage::new(
            "elsewhere",
            module,
            h.memory(1, 1),
            WorkDescriptor::new(0),
        ))
        .unwrap();

    let fault = handle.join().await.unwrap_err();
    assert_eq!(fault.kind(), FailureKind::Resolution);
    assert_eq!(h.faults.drain().len(), 1);
}

#[tokio::test]
async fn test_module_from_another_family() {
    let registered = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (func (export "worker_entry_point") (param i32))
        )
    "#;
    let posted = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (func (export "worker_entry_point") (param i32) nop)
        )
    "#;

    let mut h = Harness::new();
    h.module("app", registered);
    let other = Arc::new(CompiledModule::from_wat(h.engine.inner(), posted).unwrap());

    let handle = h
        .spawner
        .spawn_with(HandoffMessage::new("app", other, h.memory(1, 1), WorkDescriptor::new(0)))
        .unwrap();

    let fault = handle.join().await.unwrap_err();
    assert_eq!(fault.kind(), FailureKind::Resolution);
    assert!(matches!(fault.error(), HandoffError::FamilyMismatch { .. }));
}

#[tokio::test]
async fn test_resolve_precompiled_file() {
    let wat = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (func (export "worker_entry_point") (param $work i32)
                (i32.store (local.get $work) (i32.const 9))
            )
        )
    "#;

    let mut h = Harness::new();
    let compiled = CompiledModule::from_wat(h.engine.inner(), wat).unwrap();

    let dir = std::env::temp_dir().join(format!("wasm-handoff-it-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.cwasm", compiled.content_hash()));
    std::fs::write(&path, compiled.serialize().unwrap()).unwrap();

    // The controller and the worker load the same artifact independently.
    let module = Arc::new(CompiledModule::from_file(h.engine.inner(), &path).unwrap());
    let location = format!("file://{}", path.display());
    let memory = h.memory(1, 1);

    let handle = h
        .spawner
        .spawn_with(HandoffMessage::new(
            location.as_str(),
            module,
            memory.clone(),
            WorkDescriptor::new(8),
        ))
        .unwrap();

    handle.join().await.unwrap();
    assert_eq!(memory.read_u32(8).unwrap(), 9);
    assert!(h.registry.module(&location).is_some());
    assert!(h.faults.drain().is_empty());

    std::fs::remove_dir_all(&dir).ok();
}

// ============================================================================
// Test: Shared Memory
// ============================================================================

#[tokio::test]
async fn test_controller_and_worker_share_memory() {
    // Reads the input at `work` and writes twice its value right after it.
    let wat = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (func (export "worker_entry_point") (param $work i32)
                (i32.store
                    (i32.add (local.get $work) (i32.const 4))
                    (i32.mul (i32.load (local.get $work)) (i32.const 2)))
            )
        )
    "#;

    let mut h = Harness::new();
    let module = h.module("app", wat);
    let memory = h.memory(1, 1);
    memory.write_u32(128, 21).unwrap();

    let handle = h
        .spawner
        .spawn_with(HandoffMessage::new("app", module, memory.clone(), WorkDescriptor::new(128)))
        .unwrap();

    handle.join().await.unwrap();
    assert_eq!(memory.read_u32(132).unwrap(), 42);
    assert!(h.faults.drain().is_empty());
}

#[tokio::test]
async fn test_many_workers_one_memory() {
    let wat = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (func (export "worker_entry_point") (param $work i32)
                (drop (i32.atomic.rmw.add (i32.const 0) (i32.const 1)))
                (i32.store (local.get $work) (local.get $work))
            )
        )
    "#;

    let mut h = Harness::new();
    let module = h.module("app", wat);
    let memory = h.memory(1, 1);

    let slots: Vec<u32> = (1..=4).map(|i| i * 16).collect();
    let handles: Vec<_> = slots
        .iter()
        .map(|&slot| {
            h.spawner
                .spawn_with(HandoffMessage::new(
                    "app",
                    module.clone(),
                    memory.clone(),
                    WorkDescriptor::new(slot),
                ))
                .unwrap()
        })
        .collect();

    for handle in handles {
        handle.join().await.unwrap();
    }

    assert_eq!(memory.read_u32(0).unwrap(), 4);
    for slot in slots {
        assert_eq!(memory.read_u32(slot as usize).unwrap(), slot);
    }
    assert!(h.faults.drain().is_empty());
}

// ============================================================================
// Test: Host Functions
// ============================================================================

#[tokio::test]
async fn test_async_entry_point_is_awaited() {
    let wat = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (import "env" "sleep_ms" (func $sleep (param i64)))
            (func (export "worker_entry_point") (param $work i32)
                (call $sleep (i64.const 50))
                (i32.store (local.get $work) (i32.const 1))
            )
        )
    "#;

    let mut h = Harness::new();
    let module = h.module("app", wat);
    let memory = h.memory(1, 1);

    let start = Instant::now();
    let handle = h
        .spawner
        .spawn_with(HandoffMessage::new("app", module, memory.clone(), WorkDescriptor::new(32)))
        .unwrap();

    handle.join().await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(memory.read_u32(32).unwrap(), 1);
    assert!(h.faults.drain().is_empty());
}

#[tokio::test]
async fn test_is_worker_inside_context() {
    let wat = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (import "env" "is_worker" (func $is_worker (result i32)))
            (func (export "worker_entry_point") (param $work i32)
                (i32.store (local.get $work) (call $is_worker))
            )
        )
    "#;

    let mut h = Harness::new();
    let module = h.module("app", wat);
    let memory = h.memory(1, 1);

    let handle = h
        .spawner
        .spawn_with(HandoffMessage::new("app", module, memory.clone(), WorkDescriptor::new(4)))
        .unwrap();

    handle.join().await.unwrap();
    assert_eq!(memory.read_u32(4).unwrap(), 1);
}

#[tokio::test]
async fn test_available_parallelism_visible_to_guest() {
    let wat = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (import "env" "available_parallelism" (func $parallelism (result i32)))
            (func (export "worker_entry_point") (param $work i32)
                (i32.store (local.get $work) (call $parallelism))
            )
        )
    "#;

    let mut h = Harness::new();
    let module = h.module("app", wat);
    let memory = h.memory(1, 1);

    let handle = h
        .spawner
        .spawn_with(HandoffMessage::new("app", module, memory.clone(), WorkDescriptor::new(12)))
        .unwrap();

    handle.join().await.unwrap();
    let expected = u32::try_from(available_parallelism()).unwrap_or(u32::MAX);
    assert_eq!(memory.read_u32(12).unwrap(), expected.min(i32::MAX as u32));
    assert!(h.faults.drain().is_empty());
}

#[tokio::test]
async fn test_guest_logging_reads_shared_memory() {
    let wat = r#"
        (module
            (import "env" "memory" (memory 1 1 shared))
            (import "env" "log" (func $log (param i32 i32 i32)))
            (func (export "worker_entry_point") (param $work i32)
                (call $log (i32.const 1) (local.get $work) (i32.const 5))
                (call $log (i32.const 3) (i32.const 70000) (i32.const 5))
            )
        )
    "#;

    let mut h = Harness::new();
    let module = h.module("app", wat);
    let memory = h.memory(1, 1);
    memory.write(256, b"hello").unwrap();

    let handle = h
        .spawner
        .spawn_with(HandoffMessage::new("app", module, memory, WorkDescriptor::new(256)))
        .unwrap();

    // An out-of-bounds message is dropped, not a fault.
    handle.join().await.unwrap();
    assert!(h.faults.drain().is_empty());
}
