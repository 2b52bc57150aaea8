//! Workers and the per-worker driver loop (spec.md §3 "Worker", §4.6
//! "Worker Driver Loop").
//!
//! Grounded on the teacher's per-host worker thread
//! (`src/main/core/worker.rs`): one OS thread per worker, a thread-local
//! handle to "this worker's" state, created at startup and joined at
//! shutdown, never spawned on the hot path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::codelet::{TaskContext, WorkerKind};
use crate::context::SchedulingContext;
use crate::data::coherence::DataManager;
use crate::job::Job;
use crate::memory::NodeId;
use crate::task::{AccessMode, TaskType};

pub type WorkerId = usize;

enum WakeState {
    Idle,
    Signalled,
}

/// A worker's identity and ready-signal condition variable (spec.md §3
/// "Worker"). The driver loop owns the OS thread; `WorkerHandle` is the
/// `Arc`-shared handle policies and the runtime use to address it.
pub struct WorkerHandle {
    pub id: WorkerId,
    pub kind: WorkerKind,
    pub node: NodeId,
    wake: Mutex<WakeState>,
    cv: Condvar,
    pub running: AtomicBool,
    /// Diagnostics only (spec.md's supplemented "object counters").
    pub tasks_executed: AtomicU64,
}

impl WorkerHandle {
    pub fn new(id: WorkerId, kind: WorkerKind, node: NodeId) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            node,
            wake: Mutex::new(WakeState::Idle),
            cv: Condvar::new(),
            running: AtomicBool::new(true),
            tasks_executed: AtomicU64::new(0),
        })
    }

    /// Wakes this worker if it is parked (§4.4 `push_task`: "clear the bit
    /// and signal that worker").
    pub fn signal(&self) {
        let mut state = self.wake.lock().unwrap();
        *state = WakeState::Signalled;
        self.cv.notify_one();
    }

    /// Parks until signalled or shut down.
    fn wait_for_signal(&self) {
        let state = self.wake.lock().unwrap();
        let mut state = self
            .cv
            .wait_while(state, |s| matches!(s, WakeState::Idle) && self.running.load(Ordering::Acquire))
            .unwrap();
        *state = WakeState::Idle;
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.cv.notify_all();
    }
}

/// State a worker's driver loop carries across iterations for a task that
/// is between "popped" and "ready to execute" (spec.md §4.6 suspension
/// points: input fetch parks the task without blocking the worker thread).
struct InFlight {
    job: Arc<Job>,
    rank: usize,
}

/// Runs one worker's driver loop (spec.md §4.6) until `handle.running` goes
/// false. Intended to be the body of the worker's dedicated OS thread.
pub fn worker_loop(handle: Arc<WorkerHandle>, ctx: Arc<SchedulingContext>, data: Arc<DataManager>) {
    let mut in_flight: Option<InFlight> = None;

    while handle.running.load(Ordering::Acquire) {
        if let Some(flight) = in_flight.take() {
            if flight.job.buffers_transferred.load(Ordering::Acquire) == flight.job.buffers_totransfer.load(Ordering::Acquire) {
                run_and_terminate(&handle, &data, flight.job, flight.rank);
                continue;
            } else {
                in_flight = Some(flight);
            }
        }

        data.drive_quantum();

        if in_flight.is_some() {
            // still waiting on this task's transfers; don't ask for more
            // work yet (one in-flight task per worker).
            continue;
        }

        let popped = ctx.policy.lock().unwrap().pop_task(&handle);
        let (job, rank) = match popped {
            Some(pair) => pair,
            None => {
                handle.wait_for_signal();
                continue;
            }
        };

        // every bundled policy (`EagerPolicy`, `TreePolicy`) only ever
        // returns rank-claiming pops for jobs it already checked against
        // `handle.kind`, so this mismatch is unreachable for them; it's
        // checked anyway since `SchedulerPolicy` is a public trait other
        // policies could implement without that guarantee.
        debug_assert!(job.task.codelet.as_ref().map(|c| c.supports(handle.kind)).unwrap_or(true));

        if rank == 0 {
            ctx.policy.lock().unwrap().pre_exec_hook(&job);
            let n = data.begin_fetch(&job, handle.node);
            if n == 0 {
                run_and_terminate(&handle, &data, job, rank);
            } else {
                in_flight = Some(InFlight { job, rank });
            }
        } else {
            run_and_terminate(&handle, &data, job, rank);
        }
    }
}

fn run_and_terminate(handle: &Arc<WorkerHandle>, data: &Arc<DataManager>, job: Arc<Job>, rank: usize) {
    execute_job(handle, data, &job, rank);
    if job.task.task_size > 1 {
        if let Some(busy) = &job.busy_barrier {
            if !busy.leave() {
                return;
            }
        }
    }
    handle_job_termination(data, &job);
}

fn execute_job(handle: &Arc<WorkerHandle>, data: &Arc<DataManager>, job: &Arc<Job>, rank: usize) {
    if let Some(before) = &job.before_work {
        before.arrive_and_wait();
    }

    let should_run = match job.task.task_type {
        TaskType::Sequential | TaskType::Spmd => true,
        TaskType::Forkjoin => rank == 0,
    };

    if should_run {
        if let Some(codelet) = &job.task.codelet {
            let idx = job.chosen_impl.load(Ordering::Acquire);
            if let Some(func) = codelet.implementation_for(handle.kind, idx) {
                let mut planes = data.borrow_job_buffers(job, handle.node);
                let mut refs: Vec<Vec<&mut [u8]>> = planes
                    .iter_mut()
                    .map(|binding| binding.iter_mut().map(|p| p.as_mut_slice()).collect())
                    .collect();
                let mut tctx = TaskContext {
                    buffers: &mut refs,
                    arg: job.task.arg.as_deref(),
                    rank,
                    task_size: job.task.task_size,
                };
                if let Err(err) = func(&mut tctx) {
                    log::warn!("worker {}: job {} kernel failed: {err}", handle.id, job.id);
                }
            } else {
                log::error!("worker {}: no implementation for job {} on {:?}", handle.id, job.id, handle.kind);
            }
        }
        handle.tasks_executed.fetch_add(1, Ordering::Relaxed);
    }

    if let Some(after) = &job.after_work {
        after.arrive_and_wait();
    }
}

/// Commits outputs, scans successor edges, and invokes completion
/// callbacks (spec.md §4.2 "Execution hand-off").
fn handle_job_termination(data: &Arc<DataManager>, job: &Arc<Job>) {
    data.commit_job_outputs(job);
    job.mark_terminated();

    let successors = job.successors.lock().unwrap().clone();
    for weak in successors {
        if let Some(successor) = weak.upgrade() {
            if successor.decrement_dep() {
                data.push_ready_job(successor);
            }
        }
    }

    let mut callbacks = job.task.on_complete.lock().unwrap();
    for cb in callbacks.drain(..) {
        cb();
    }
}

/// Maps `(handle, mode)` pairs to the binding access kind the coherence
/// layer needs; re-exported here since the worker loop's `borrow_job_buffers`
/// call site is the natural place callers look for it.
pub fn access_mode_allows_write(mode: AccessMode) -> bool {
    mode.intersects(AccessMode::W | AccessMode::RW | AccessMode::SCRATCH | AccessMode::REDUX)
}

pub fn worker_registry_index(workers: &HashMap<WorkerId, Arc<WorkerHandle>>, id: WorkerId) -> Option<Arc<WorkerHandle>> {
    workers.get(&id).cloned()
}
