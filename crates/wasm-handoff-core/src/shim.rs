//! Worker entry shim.
//!
//! [`WorkerShim::on_handoff`] is the single thing a worker context does:
//! resolve the location, initialize the module against the supplied shared
//! memory, run the entry point with the work descriptor, and report the
//! outcome. Every failure, whatever the stage, takes the same path: logged,
//! published once on the fault channel, returned as `Err`.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, instrument, warn};

use crate::store::create_store;
use crate::{FaultReporter, HandoffMessage, ModuleResolver, WasmEngine, WorkerFault};
use wasm_handoff_common::{HandoffError, WorkerConfig};

/// Lifecycle of a worker context.
///
/// `Spawned → AwaitingHandoff → Initializing → Executing → {Completed |
/// Failed} → Terminated`. There is no way back, and `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// The context exists but is not yet listening.
    Spawned,
    /// Waiting for the one handoff message.
    AwaitingHandoff,
    /// Resolving the location and instantiating.
    Initializing,
    /// Running the entry point.
    Executing,
    /// The entry point finished without fault.
    Completed,
    /// A fault was raised and reported.
    Failed,
    /// The context is gone.
    Terminated,
}

impl WorkerState {
    /// Whether the machine may move from `self` to `next`.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::{
            AwaitingHandoff, Completed, Executing, Failed, Initializing, Spawned, Terminated,
        };

        matches!(
            (self, next),
            (Spawned, AwaitingHandoff | Failed)
                | (AwaitingHandoff, Initializing | Terminated)
                | (Initializing, Executing | Failed)
                | (Executing, Completed | Failed)
                | (Completed | Failed, Terminated)
        )
    }

    /// Returns `true` once the context has ended.
    pub fn is_terminated(self) -> bool {
        self == WorkerState::Terminated
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Spawned => "spawned",
            WorkerState::AwaitingHandoff => "awaiting-handoff",
            WorkerState::Initializing => "initializing",
            WorkerState::Executing => "executing",
            WorkerState::Completed => "completed",
            WorkerState::Failed => "failed",
            WorkerState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// The per-context handler for the one handoff message.
pub struct WorkerShim {
    worker_id: String,
    engine: WasmEngine,
    resolver: Arc<dyn ModuleResolver>,
    config: WorkerConfig,
    faults: FaultReporter,
    state: watch::Sender<WorkerState>,
}

impl WorkerShim {
    /// Create a shim in the `Spawned` state.
    pub fn new(
        worker_id: String,
        engine: WasmEngine,
        resolver: Arc<dyn ModuleResolver>,
        config: WorkerConfig,
        faults: FaultReporter,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Spawned);
        Self {
            worker_id,
            engine,
            resolver,
            config,
            faults,
            state,
        }
    }

    /// Identifier of the owning worker.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Move to `next`, refusing transitions the machine does not allow.
    pub fn advance(&self, next: WorkerState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                warn!(
                    worker_id = %self.worker_id,
                    from = %current,
                    to = %next,
                    "Ignoring invalid worker state transition"
                );
                false
            }
        })
    }

    /// Handle the handoff message.
    ///
    /// Only a shim in `AwaitingHandoff` accepts a message. In any other
    /// state the message is dropped unrun, nothing is published and the
    /// state is left as it was.
    ///
    /// # Errors
    ///
    /// Returns the [`WorkerFault`] that was also published on the fault
    /// channel, or a rejection wrapping [`HandoffError::WorkerUnavailable`]
    /// (not yet listening) or [`HandoffError::AlreadyHandedOff`].
    #[instrument(skip_all, fields(worker_id = %self.worker_id, location = %message.location))]
    pub async fn on_handoff(&self, message: HandoffMessage) -> Result<(), WorkerFault> {
        if !self.advance(WorkerState::Initializing) {
            return Err(self.reject());
        }

        match self.run(message).await {
            Ok(()) => {
                self.advance(WorkerState::Completed);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn reject(&self) -> WorkerFault {
        let worker_id = self.worker_id.clone();
        let error = if self.state() == WorkerState::Spawned {
            HandoffError::WorkerUnavailable { worker_id }
        } else {
            HandoffError::AlreadyHandedOff { worker_id }
        };
        warn!(worker_id = %self.worker_id, error = %error, "Handoff rejected");
        WorkerFault::new(self.worker_id.clone(), error)
    }

    /// Log, publish and record a failure.
    pub fn fail(&self, error: HandoffError) -> WorkerFault {
        let fault = WorkerFault::new(self.worker_id.clone(), error);

        error!(
            worker_id = %self.worker_id,
            kind = %fault.kind(),
            error = %fault.error(),
            "Worker failed"
        );

        if !self.faults.report(fault.clone()) {
            warn!(worker_id = %self.worker_id, "Fault observer is gone");
        }
        self.advance(WorkerState::Failed);

        fault
    }

    async fn run(&self, message: HandoffMessage) -> Result<(), HandoffError> {
        let HandoffMessage {
            location,
            module,
            memory,
            work,
        } = message;

        let bindings = self.resolver.resolve(&location).await?;
        bindings.verify_family(&module)?;

        let mut store = create_store(&self.engine, &self.config, self.worker_id.clone())?;
        let instance = bindings
            .runner()
            .initialize(&mut store, &module, &memory, &self.config)
            .await?;

        self.advance(WorkerState::Executing);

        let entry_point = bindings.entry_point().unwrap_or(&self.config.entry_point);
        bindings
            .runner()
            .execute(&mut store, &instance, entry_point, work)
            .await?;

        debug!(
            guest_logs = store.data().logs.len(),
            fuel_consumed = store.data().metrics.fuel_consumed,
            "Handoff completed"
        );

        Ok(())
    }
}

impl std::fmt::Debug for WorkerShim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerShim")
            .field("worker_id", &self.worker_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
