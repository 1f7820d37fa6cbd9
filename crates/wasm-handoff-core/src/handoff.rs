//! The handoff message a controller posts to a worker.
//!
//! A [`HandoffMessage`] is the ordered tuple `(location, module, memory,
//! work)`. It is built by the controller, posted once, and consumed by the
//! worker's entry shim.

use std::sync::Arc;

use crate::{CompiledModule, SharedLinearMemory};

/// Opaque handle identifying one unit of work.
///
/// The value is meaningful only to the guest: typically a pointer into the
/// shared memory (or an index into a guest-side registry) from which the
/// entry point reconstructs the job. The descriptor is neither `Clone` nor
/// `Copy`; invoking the entry point consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct WorkDescriptor(u32);

impl WorkDescriptor {
    /// Wrap a guest handle.
    pub fn new(handle: u32) -> Self {
        Self(handle)
    }

    /// Peek at the raw handle without consuming it.
    pub fn handle(&self) -> u32 {
        self.0
    }

    /// Consume the descriptor, yielding the `i32` argument for the entry
    /// point (same bits as the handle).
    #[allow(clippy::cast_possible_wrap)]
    pub fn into_entry_arg(self) -> i32 {
        self.0 as i32
    }
}

impl From<u32> for WorkDescriptor {
    fn from(handle: u32) -> Self {
        Self::new(handle)
    }
}

/// The four-part message a worker receives exactly once.
#[derive(Debug)]
pub struct HandoffMessage {
    /// Where the worker resolves its bindings from.
    pub location: String,

    /// Precompiled module image.
    pub module: Arc<CompiledModule>,

    /// Linear memory shared by reference with the controller.
    pub memory: SharedLinearMemory,

    /// The unit of work for the entry point.
    pub work: WorkDescriptor,
}

impl HandoffMessage {
    /// Build a handoff message.
    pub fn new(
        location: impl Into<String>,
        module: Arc<CompiledModule>,
        memory: SharedLinearMemory,
        work: WorkDescriptor,
    ) -> Self {
        Self {
            location: location.into(),
            module,
            memory,
            work,
        }
    }
}
