//! The scheduler policy interface (spec.md §4.3).

use std::sync::Arc;

use crate::error::Result;
use crate::job::Job;
use crate::worker::WorkerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTypeKind {
    /// The eager central policy: a flat list, no tree traversal.
    List,
    /// A scheduler-tree policy (§4.5).
    Tree,
}

/// A policy is a fixed vtable, per spec.md §4.3. `push_task` returns `Ok(())`
/// on acceptance (there is no reason for a policy to reject a task it was
/// handed once `task_submit` has already verified a worker exists for it).
pub trait SchedulerPolicy: Send {
    fn init_sched(&mut self) {}
    fn deinit_sched(&mut self) {}

    fn add_workers(&mut self, workers: &[Arc<WorkerHandle>]);
    fn remove_workers(&mut self, workers: &[Arc<WorkerHandle>]);

    fn push_task(&mut self, job: Arc<Job>) -> Result<()>;

    /// Called by a worker's driver loop; `None` means "no task right now".
    /// For a parallel task the returned rank is this worker's claimed
    /// `active_task_alias_count` slot (spec.md §4.6): the policy claims it
    /// atomically as part of the same pop so concurrent pops of the same
    /// front-of-queue job can't race on "is this the last alias to leave".
    fn pop_task(&mut self, worker: &Arc<WorkerHandle>) -> Option<(Arc<Job>, usize)>;

    fn pre_exec_hook(&mut self, _job: &Arc<Job>) {}
    fn post_exec_hook(&mut self, _job: &Arc<Job>) {}

    /// Drains every task currently held by the policy, e.g. for shutdown or
    /// migrating work off a context being torn down.
    fn pop_every_task(&mut self) -> Vec<Arc<Job>>;

    fn policy_name(&self) -> &'static str;
    fn worker_type(&self) -> WorkerTypeKind;
}
