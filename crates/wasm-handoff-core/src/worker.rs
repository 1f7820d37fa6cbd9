//! Worker execution contexts.
//!
//! Each worker is a dedicated OS thread driving its own current-thread
//! tokio runtime. The controller talks to it only through channels:
//! a one-shot mailbox for the handoff message, a watch channel for the
//! lifecycle state, and a one-shot completion result. Failures are also
//! published on the shared fault channel.
//!
//! A context accepts one message and then ends, whatever the outcome.

use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::shim::{WorkerShim, WorkerState};
use crate::{FaultReporter, HandoffMessage, ModuleResolver, WasmEngine, WorkerFault};
use wasm_handoff_common::{HandoffError, WorkerConfig};

thread_local! {
    static CURRENT_WORKER: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Returns `true` when called from inside a worker context.
pub fn is_worker_thread() -> bool {
    CURRENT_WORKER.with(|w| w.borrow().is_some())
}

/// Identifier of the worker running on the current thread.
pub fn current_worker_id() -> Option<String> {
    CURRENT_WORKER.with(|w| w.borrow().clone())
}

/// Number of workers the host can run in parallel.
///
/// Falls back to 1 when the platform cannot tell.
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Spawns worker contexts that share an engine, resolver and fault channel.
#[derive(Clone)]
pub struct WorkerSpawner {
    engine: WasmEngine,
    resolver: Arc<dyn ModuleResolver>,
    config: WorkerConfig,
    faults: FaultReporter,
}

impl WorkerSpawner {
    /// Create a spawner.
    pub fn new(
        engine: WasmEngine,
        resolver: Arc<dyn ModuleResolver>,
        config: WorkerConfig,
        faults: FaultReporter,
    ) -> Self {
        Self {
            engine,
            resolver,
            config,
            faults,
        }
    }

    /// Spawn a new worker context waiting for its handoff message.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS thread cannot be created.
    pub fn spawn(&self) -> Result<WorkerHandle, HandoffError> {
        let id = Uuid::new_v4().to_string();
        let shim = WorkerShim::new(
            id.clone(),
            self.engine.clone(),
            self.resolver.clone(),
            self.config.clone(),
            self.faults.clone(),
        );
        let state = shim.subscribe();

        let (mailbox_tx, mailbox_rx) = oneshot::channel();
        let (completion_tx, completion_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name(format!("{}-{}", self.config.thread_name_prefix, &id[..8]))
            .stack_size(self.config.stack_size())
            .spawn(move || run_context(shim, mailbox_rx, completion_tx))?;

        debug!(worker_id = %id, "Worker spawned");

        Ok(WorkerHandle {
            id,
            mailbox: Mutex::new(Some(mailbox_tx)),
            state,
            completion: completion_rx,
            thread: Some(thread),
        })
    }

    /// Spawn a worker and post `message` to it.
    ///
    /// # Errors
    ///
    /// Returns an error if spawning or posting fails.
    pub fn spawn_with(&self, message: HandoffMessage) -> Result<WorkerHandle, HandoffError> {
        let handle = self.spawn()?;
        handle.post(message)?;
        Ok(handle)
    }
}

impl std::fmt::Debug for WorkerSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSpawner")
            .field("entry_point", &self.config.entry_point)
            .finish_non_exhaustive()
    }
}

/// Controller-side handle to one worker context.
pub struct WorkerHandle {
    id: String,
    mailbox: Mutex<Option<oneshot::Sender<HandoffMessage>>>,
    state: watch::Receiver<WorkerState>,
    completion: oneshot::Receiver<Result<(), WorkerFault>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Worker identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Latest observed lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Post the handoff message.
    ///
    /// Only the first call delivers anything; later calls return
    /// [`HandoffError::AlreadyHandedOff`] and drop their message.
    ///
    /// # Errors
    ///
    /// Returns an error if a message was already posted or the context is
    /// gone.
    pub fn post(&self, message: HandoffMessage) -> Result<(), HandoffError> {
        let Some(mailbox) = self.mailbox.lock().take() else {
            return Err(HandoffError::AlreadyHandedOff {
                worker_id: self.id.clone(),
            });
        };

        mailbox
            .send(message)
            .map_err(|_| HandoffError::WorkerUnavailable {
                worker_id: self.id.clone(),
            })
    }

    /// Wait until the context reaches `Terminated`.
    pub async fn terminated(&self) {
        let mut state = self.state.clone();
        // The sender is dropped only after `Terminated` has been published.
        let _ = state.wait_for(|s| s.is_terminated()).await;
    }

    /// Wait for the context to end and return its completion result.
    ///
    /// Joining a worker that was never posted a message ends it without
    /// running anything and returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns the fault the worker raised, which was also published on the
    /// fault channel.
    pub async fn join(mut self) -> Result<(), WorkerFault> {
        drop(self.mailbox.lock().take());

        let result = match (&mut self.completion).await {
            Ok(result) => result,
            Err(_) => Err(WorkerFault::new(
                self.id.clone(),
                HandoffError::worker_aborted("context ended without a result"),
            )),
        };

        if let Some(thread) = self.thread.take() {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!(worker_id = %self.id, "Failed to join worker thread");
            }
        }

        result
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Thread body of a worker context.
fn run_context(
    shim: WorkerShim,
    mailbox: oneshot::Receiver<HandoffMessage>,
    completion: oneshot::Sender<Result<(), WorkerFault>>,
) {
    CURRENT_WORKER.with(|w| *w.borrow_mut() = Some(shim.worker_id().to_string()));

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let fault = shim.fail(HandoffError::initialization_failed(format!(
                "Failed to start worker runtime: {e}"
            )));
            finish(&shim, completion, Err(fault));
            return;
        }
    };

    shim.advance(WorkerState::AwaitingHandoff);

    let span = info_span!("worker", worker_id = %shim.worker_id());
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(
            async {
                // Dropping the handle without posting ends the context quietly.
                let message = mailbox.await.ok()?;
                Some(shim.on_handoff(message).await)
            }
            .instrument(span),
        )
    }));

    // Anything the entry point left running dies with the runtime.
    drop(runtime);

    let result = match outcome {
        Ok(Some(result)) => result,
        // No message was ever posted: nothing ran, nothing failed.
        Ok(None) => Ok(()),
        Err(panic) => Err(shim.fail(HandoffError::worker_aborted(panic_message(
            panic.as_ref(),
        )))),
    };

    finish(&shim, completion, result);
}

fn finish(
    shim: &WorkerShim,
    completion: oneshot::Sender<Result<(), WorkerFault>>,
    result: Result<(), WorkerFault>,
) {
    shim.advance(WorkerState::Terminated);
    debug!(worker_id = %shim.worker_id(), "Worker terminated");

    // The controller may have dropped its handle; the fault channel
    // already carries any failure.
    let _ = completion.send(result);

    CURRENT_WORKER.with(|w| w.borrow_mut().take());
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_a_worker_thread() {
        assert!(!is_worker_thread());
        assert!(current_worker_id().is_none());
    }

    #[test]
    fn test_available_parallelism() {
        assert!(available_parallelism() >= 1);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "worker panicked: boom");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "worker panicked: bang");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(3_u8);
        assert_eq!(panic_message(boxed.as_ref()), "worker panicked");
    }
}
