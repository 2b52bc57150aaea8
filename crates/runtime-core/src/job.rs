//! Jobs: the mutable runtime shadow of a submitted task (spec.md §3 "Job",
//! §4.2 "Submission"/"Execution hand-off"/"Parallel tasks").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::sync::{BusyBarrier, PartyBarrier};
use crate::task::{JobId, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Ready,
    Fetching,
    Executing,
    Terminated,
}

/// A job's state carries the counters spec.md §5 lists as lock-free atomics
/// (`remaining_deps`, `active_task_alias_count`, the busy-barrier) plus the
/// handful of fields that do need a lock because they change together
/// (state transitions, successor list).
pub struct Job {
    pub id: JobId,
    pub task: Arc<Task>,

    pub remaining_deps: AtomicUsize,
    /// Number of buffer fetches this job is waiting on and the number that
    /// have completed so far; the job is fetch-ready when the two are equal
    /// (spec.md §4.1 "Concurrency").
    pub buffers_totransfer: AtomicUsize,
    pub buffers_transferred: AtomicUsize,

    pub state: Mutex<JobState>,
    done_cond: Condvar,

    pub chosen_impl: AtomicUsize,
    /// Worker id this job was dispatched to; for parallel tasks, the id of
    /// the first worker of the combined worker.
    pub chosen_worker: AtomicUsize,

    /// `task_size - 1` parties beyond rank 0 participate; `None` for
    /// SEQUENTIAL tasks.
    pub before_work: Option<PartyBarrier>,
    pub after_work: Option<PartyBarrier>,
    pub active_task_alias_count: AtomicUsize,
    pub busy_barrier: Option<BusyBarrier>,

    /// Jobs whose `remaining_deps` this job's termination will decrement.
    pub successors: Mutex<Vec<Weak<Job>>>,
}

impl Job {
    pub fn new(id: JobId, task: Arc<Task>, initial_deps: usize) -> Self {
        let task_size = task.task_size;
        let parallel = task_size > 1;
        Self {
            id,
            task,
            remaining_deps: AtomicUsize::new(initial_deps),
            buffers_totransfer: AtomicUsize::new(0),
            buffers_transferred: AtomicUsize::new(0),
            state: Mutex::new(if initial_deps == 0 { JobState::Ready } else { JobState::Submitted }),
            done_cond: Condvar::new(),
            chosen_impl: AtomicUsize::new(0),
            chosen_worker: AtomicUsize::new(usize::MAX),
            before_work: parallel.then(|| PartyBarrier::new(task_size)),
            after_work: parallel.then(|| PartyBarrier::new(task_size)),
            active_task_alias_count: AtomicUsize::new(0),
            busy_barrier: parallel.then(|| BusyBarrier::new(task_size)),
            successors: Mutex::new(Vec::new()),
        }
    }

    /// Finalizes the job's initial dependency count once every explicit,
    /// tag-based, and handle-based dependency has been resolved (spec.md
    /// §4.2 "Submission"). Must be called exactly once, before the job is
    /// reachable from any policy or successor list other than the one
    /// being built by the caller.
    pub fn set_initial_deps(&self, n: usize) {
        self.remaining_deps.store(n, Ordering::Release);
        *self.state.lock().unwrap() = if n == 0 { JobState::Ready } else { JobState::Submitted };
    }

    /// Decrements `remaining_deps`; returns true exactly once, the instant
    /// it reaches zero (spec.md §8 invariant 3).
    pub fn decrement_dep(&self) -> bool {
        let prev = self.remaining_deps.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "remaining_deps decremented past zero");
        if prev == 1 {
            *self.state.lock().unwrap() = JobState::Ready;
            true
        } else {
            false
        }
    }

    pub fn set_transfer_count(&self, n: usize) {
        self.buffers_totransfer.store(n, Ordering::Release);
        if n == 0 {
            *self.state.lock().unwrap() = JobState::Executing;
        } else {
            *self.state.lock().unwrap() = JobState::Fetching;
        }
    }

    /// Called from a transfer-completion callback. Returns true exactly
    /// once the job's fetches are all complete and it is ready to execute.
    pub fn on_transfer_complete(&self) -> bool {
        let done = self.buffers_transferred.fetch_add(1, Ordering::AcqRel) + 1;
        let total = self.buffers_totransfer.load(Ordering::Acquire);
        if done == total {
            *self.state.lock().unwrap() = JobState::Executing;
            true
        } else {
            false
        }
    }

    pub fn claim_rank(&self) -> usize {
        self.active_task_alias_count.fetch_add(1, Ordering::AcqRel)
    }

    pub fn mark_terminated(&self) {
        let mut state = self.state.lock().unwrap();
        *state = JobState::Terminated;
        self.done_cond.notify_all();
    }

    pub fn wait_for_termination(&self) {
        let guard = self.state.lock().unwrap();
        let _unused = self
            .done_cond
            .wait_while(guard, |s| *s != JobState::Terminated)
            .unwrap();
    }

    pub fn is_terminated(&self) -> bool {
        *self.state.lock().unwrap() == JobState::Terminated
    }
}
