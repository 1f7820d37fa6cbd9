//! Controller-visible fault channel.
//!
//! Workers have no return channel besides their completion result, so each
//! failure is also published on a [`FaultReporter`] the controller handed
//! to the spawner. The controller reads them from the paired
//! [`FaultObserver`]. One failed worker produces exactly one fault.

use std::sync::Arc;

use tokio::sync::mpsc;

use wasm_handoff_common::{FailureKind, HandoffError};

/// A failure raised inside a worker context.
#[derive(Debug, Clone)]
pub struct WorkerFault {
    worker_id: String,
    kind: FailureKind,
    error: Arc<HandoffError>,
}

impl WorkerFault {
    /// Wrap an error raised by worker `worker_id`.
    pub fn new(worker_id: impl Into<String>, error: HandoffError) -> Self {
        let kind = error.kind().unwrap_or(FailureKind::Execution);
        Self {
            worker_id: worker_id.into(),
            kind,
            error: Arc::new(error),
        }
    }

    /// The worker that failed.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Lifecycle stage of the failure.
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// The underlying error.
    pub fn error(&self) -> &HandoffError {
        &self.error
    }
}

impl std::fmt::Display for WorkerFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "worker {} failed during {}: {}",
            self.worker_id, self.kind, self.error
        )
    }
}

impl std::error::Error for WorkerFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

/// Create a connected reporter/observer pair.
///
/// The channel is unbounded so that a failing worker never blocks on its
/// report. Faults queue until read: a long-lived controller should keep
/// draining the [`FaultObserver`], or drop it, in which case reports are
/// discarded.
pub fn fault_channel() -> (FaultReporter, FaultObserver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FaultReporter { tx }, FaultObserver { rx })
}

/// Sending half, cloned into every worker.
#[derive(Debug, Clone)]
pub struct FaultReporter {
    tx: mpsc::UnboundedSender<WorkerFault>,
}

impl FaultReporter {
    /// Publish a fault. Returns `false` if the observer is gone.
    pub fn report(&self, fault: WorkerFault) -> bool {
        self.tx.send(fault).is_ok()
    }
}

/// Receiving half, held by the controller.
#[derive(Debug)]
pub struct FaultObserver {
    rx: mpsc::UnboundedReceiver<WorkerFault>,
}

impl FaultObserver {
    /// Wait for the next fault. Returns `None` once every reporter is gone.
    pub async fn recv(&mut self) -> Option<WorkerFault> {
        self.rx.recv().await
    }

    /// Take a fault if one is already queued.
    pub fn try_recv(&mut self) -> Option<WorkerFault> {
        self.rx.try_recv().ok()
    }

    /// Take every queued fault.
    pub fn drain(&mut self) -> Vec<WorkerFault> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_kind_from_error() {
        let fault = WorkerFault::new("w1", HandoffError::resolution_failed("app", "missing"));
        assert_eq!(fault.kind(), FailureKind::Resolution);
        assert_eq!(fault.worker_id(), "w1");
        assert!(fault.to_string().contains("during resolution"));
    }

    #[test]
    fn test_fault_source() {
        use std::error::Error;

        let fault = WorkerFault::new("w1", HandoffError::FuelExhausted);
        assert!(fault.source().is_some());
        assert!(matches!(fault.error(), HandoffError::FuelExhausted));
    }

    #[tokio::test]
    async fn test_channel_delivers_in_order() {
        let (reporter, mut observer) = fault_channel();
        let other = reporter.clone();

        assert!(reporter.report(WorkerFault::new("a", HandoffError::FuelExhausted)));
        assert!(other.report(WorkerFault::new("b", HandoffError::FuelExhausted)));

        assert_eq!(observer.recv().await.unwrap().worker_id(), "a");
        assert_eq!(observer.drain().len(), 1);
        assert!(observer.try_recv().is_none());

        drop(reporter);
        drop(other);
        assert!(observer.recv().await.is_none());
    }

    #[test]
    fn test_report_without_observer() {
        let (reporter, observer) = fault_channel();
        drop(observer);
        assert!(!reporter.report(WorkerFault::new("a", HandoffError::FuelExhausted)));
    }
}
