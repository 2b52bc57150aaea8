//! Codelets: passive, device-polymorphic procedure descriptors (spec.md §3
//! "Codelet").

use std::sync::Arc;

use bitflags::bitflags;

use crate::error::RuntimeError;

bitflags! {
    /// The `where` bitmask: worker kinds a codelet can run on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WorkerKind: u8 {
        const CPU    = 0b001;
        const CUDA   = 0b010;
        const OPENCL = 0b100;
    }
}

/// Inputs handed to a codelet implementation when it runs.
pub struct TaskContext<'a> {
    /// Per-binding list of raw, writable plane views, in binding order.
    /// Single-plane interfaces (vector/matrix/other) hand back one entry;
    /// CSR hands back three, in `nzval`/`colind`/`rowptr` order.
    pub buffers: &'a mut [Vec<&'a mut [u8]>],
    /// The opaque argument blob copied at submission, if any.
    pub arg: Option<&'a [u8]>,
    /// This alias's rank within its combined worker (0 for non-parallel tasks).
    pub rank: usize,
    /// Parallel task size (1 for non-parallel tasks).
    pub task_size: usize,
}

pub type ImplFn = Arc<dyn Fn(&mut TaskContext) -> Result<(), RuntimeError> + Send + Sync>;

/// Per-kind registered implementations. A codelet may register more than one
/// implementation for a given kind (spec.md §3); the scheduler picks one via
/// `Job::chosen_impl`.
#[derive(Clone)]
pub struct Implementations {
    pub kind: WorkerKind,
    pub functions: Vec<ImplFn>,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CodeletFlags: u8 {
        /// Performance-model-only execution for capacity planning
        /// (spec.md §6 persisted-state note); not exercised by this
        /// CPU-only reference backend but kept as a flag bit so policies
        /// can branch on it without a breaking change later.
        const SIMGRID_EXECUTE = 0b001;
    }
}

pub struct Codelet {
    pub name: &'static str,
    pub where_: WorkerKind,
    pub implementations: Vec<Implementations>,
    pub nbuffers: usize,
    pub modes: Vec<crate::task::AccessMode>,
    pub flags: CodeletFlags,
}

impl Codelet {
    pub fn implementation_for(&self, kind: WorkerKind, idx: usize) -> Option<&ImplFn> {
        self.implementations
            .iter()
            .find(|i| i.kind == kind)
            .and_then(|i| i.functions.get(idx))
    }

    pub fn supports(&self, kind: WorkerKind) -> bool {
        self.where_.intersects(kind)
    }
}
