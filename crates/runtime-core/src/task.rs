//! Tasks: immutable-after-submission descriptions of work (spec.md §3
//! "Task", §4.2 "Submission").
//!
//! Grounded loosely on the teacher's `src/main/core/work/task.rs`, which
//! pairs an immutable C-interop `Task` struct with mutable scheduling state
//! kept alongside it — the same split this spec draws explicitly between
//! `Task` and `Job`.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::codelet::Codelet;
use crate::data::handle::HandleId;

bitflags! {
    /// Access modes, bitmask values stable across releases (spec.md §6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMode: u8 {
        const R       = 1;
        const W       = 2;
        const RW      = 3;
        const SCRATCH = 4;
        const REDUX   = 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Sequential,
    Spmd,
    Forkjoin,
}

pub type TaskId = u64;
pub type JobId = u64;

pub struct BufferBinding {
    pub handle: HandleId,
    pub mode: AccessMode,
}

/// A task callback; boxed since kernels and completion hooks are arbitrary
/// user closures captured at submission time.
pub type Callback = Box<dyn FnOnce() + Send>;

pub struct Task {
    pub id: TaskId,
    pub codelet: Option<Arc<Codelet>>,
    pub buffers: Vec<BufferBinding>,
    pub arg: Option<Vec<u8>>,
    pub synchronous: bool,
    pub priority: i32,
    pub deadline: Option<std::time::Instant>,
    pub tag: Option<u64>,
    pub sched_ctx: crate::context::ContextId,
    pub task_type: TaskType,
    /// `k` for FORKJOIN/SPMD tasks; 1 for SEQUENTIAL.
    pub task_size: usize,
    pub task_deps: Vec<TaskId>,
    pub tag_deps: Vec<u64>,
    /// Drained exactly once, by `handle_job_termination`, after the job
    /// reaches `Terminated` (spec.md §4.2). A `Mutex` rather than
    /// `&mut` access because the task is shared behind `Arc` with its job.
    pub on_complete: Mutex<Vec<Callback>>,
}

impl Task {
    /// Checks the structural invariants spec.md §6 lists: `cl != NULL ⇒
    /// nbuffers ≤ cl->nbuffers`.
    pub fn buffer_count_is_valid(&self) -> bool {
        match &self.codelet {
            Some(cl) => self.buffers.len() <= cl.nbuffers,
            None => true,
        }
    }
}
