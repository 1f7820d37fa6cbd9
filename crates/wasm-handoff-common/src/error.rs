//! Error types for wasm-handoff.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`HandoffError`]: Top-level errors for the handoff protocol
//! - [`HostFunctionError`]: Errors from host function implementations
//! - [`FailureKind`]: The stage of the worker lifecycle a failure belongs to

use std::io;

use thiserror::Error;

/// Top-level handoff errors.
///
/// These errors cover everything that can go wrong between a controller
/// posting a handoff message and the worker context terminating.
#[derive(Error, Debug)]
pub enum HandoffError {
    /// The module location could not be resolved to bindings.
    #[error("Resolution failed for '{location}': {reason}")]
    ResolutionFailed {
        /// The location that failed to resolve.
        location: String,
        /// Description of the resolution failure.
        reason: String,
    },

    /// The resolved bindings belong to a different module family.
    #[error("Module family mismatch: location resolves to {expected}, message carries {actual}")]
    FamilyMismatch {
        /// Content hash the location resolves to.
        expected: String,
        /// Content hash of the module carried by the message.
        actual: String,
    },

    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The supplied shared memory does not fit the module's memory import.
    #[error("Incompatible memory: {reason}")]
    IncompatibleMemory {
        /// Description of the mismatch.
        reason: String,
    },

    /// Instantiating the module against the supplied memory failed.
    #[error("Initialization failed: {reason}")]
    InitializationFailed {
        /// Description of the initialization failure.
        reason: String,
    },

    /// The designated entry point is missing or has the wrong signature.
    #[error("Entry point '{name}' not found")]
    EntryPointNotFound {
        /// Name of the entry point export.
        name: String,
    },

    /// A WebAssembly trap occurred while executing the entry point.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
        /// Trap code if available.
        code: Option<String>,
    },

    /// Execution exhausted the configured fuel limit.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// The worker panicked or vanished before reporting a result.
    #[error("Worker aborted: {reason}")]
    WorkerAborted {
        /// Description of how the worker ended.
        reason: String,
    },

    /// A handoff message was already posted to this worker.
    #[error("Worker {worker_id} already received its handoff message")]
    AlreadyHandedOff {
        /// The worker that rejected the message.
        worker_id: String,
    },

    /// The worker context is gone and cannot accept a message.
    #[error("Worker {worker_id} is no longer accepting messages")]
    WorkerUnavailable {
        /// The worker that is gone.
        worker_id: String,
    },

    /// A host function returned an error.
    #[error("Host function error: {0}")]
    HostFunction(#[from] HostFunctionError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Errors from host function implementations.
#[derive(Error, Debug)]
pub enum HostFunctionError {
    /// A guest pointer/length pair fell outside linear memory.
    #[error("Memory access out of bounds: offset {offset}, len {len}, size {size}")]
    OutOfBounds {
        /// Start offset requested.
        offset: usize,
        /// Number of bytes requested.
        len: usize,
        /// Current size of the memory in bytes.
        size: usize,
    },

    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },
}

/// Lifecycle stage a worker failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The location could not be loaded or linked.
    Resolution,
    /// The module and memory could not be instantiated together.
    Initialization,
    /// The entry point faulted.
    Execution,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Resolution => write!(f, "resolution"),
            FailureKind::Initialization => write!(f, "initialization"),
            FailureKind::Execution => write!(f, "execution"),
        }
    }
}

impl HandoffError {
    /// Create a new `ResolutionFailed` error.
    pub fn resolution_failed(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ResolutionFailed {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `IncompatibleMemory` error.
    pub fn incompatible_memory(reason: impl Into<String>) -> Self {
        Self::IncompatibleMemory {
            reason: reason.into(),
        }
    }

    /// Create a new `InitializationFailed` error.
    pub fn initialization_failed(reason: impl Into<String>) -> Self {
        Self::InitializationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Trap {
            message: message.into(),
            code,
        }
    }

    /// Create a new `WorkerAborted` error.
    pub fn worker_aborted(reason: impl Into<String>) -> Self {
        Self::WorkerAborted {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// The lifecycle stage this error belongs to when raised inside a worker.
    ///
    /// Errors that never occur inside a worker (posting errors) map to
    /// `None`.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::ResolutionFailed { .. } | Self::FamilyMismatch { .. } => {
                Some(FailureKind::Resolution)
            }
            Self::CompilationFailed { .. }
            | Self::IncompatibleMemory { .. }
            | Self::InitializationFailed { .. }
            | Self::EntryPointNotFound { .. }
            | Self::InvalidConfig { .. }
            | Self::Io(_) => Some(FailureKind::Initialization),
            Self::Trap { .. }
            | Self::FuelExhausted
            | Self::WorkerAborted { .. }
            | Self::HostFunction(_) => Some(FailureKind::Execution),
            Self::AlreadyHandedOff { .. } | Self::WorkerUnavailable { .. } => None,
        }
    }

    /// Returns `true` if this error was caused by a memory mismatch.
    pub fn is_incompatible_memory(&self) -> bool {
        matches!(self, Self::IncompatibleMemory { .. })
    }
}
