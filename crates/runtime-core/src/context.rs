//! Scheduling contexts: a named workers-plus-policy bundle (spec.md §3
//! "Scheduling Context").

use std::sync::{Arc, Mutex};

use crate::codelet::WorkerKind;
use crate::sched::policy::SchedulerPolicy;
use crate::worker::WorkerHandle;

pub type ContextId = u32;

/// Root context created at `init`, per spec.md §3.
pub const GLOBAL_CONTEXT: ContextId = 0;

/// Cost-aggregation parameters a scheduler-tree policy uses when combining
/// `estimated_*` queries across a heterogeneous worker set (spec.md §4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfModelArch {
    pub kinds: WorkerKind,
}

pub struct SchedulingContext {
    pub id: ContextId,
    pub name: String,
    pub workers: Mutex<Vec<Arc<WorkerHandle>>>,
    pub policy: Mutex<Box<dyn SchedulerPolicy>>,
    pub perf_model_arch: PerfModelArch,
    pub parent: Option<ContextId>,
}

impl SchedulingContext {
    pub fn new(id: ContextId, name: String, policy: Box<dyn SchedulerPolicy>, parent: Option<ContextId>) -> Self {
        Self {
            id,
            name,
            workers: Mutex::new(Vec::new()),
            policy: Mutex::new(policy),
            perf_model_arch: PerfModelArch::default(),
            parent,
        }
    }

    pub fn add_workers(&self, new_workers: &[Arc<WorkerHandle>]) {
        let mut workers = self.workers.lock().unwrap();
        workers.extend(new_workers.iter().cloned());
        self.policy.lock().unwrap().add_workers(new_workers);
    }

    pub fn remove_workers(&self, removed: &[Arc<WorkerHandle>]) {
        let mut workers = self.workers.lock().unwrap();
        workers.retain(|w| !removed.iter().any(|r| r.id == w.id));
        self.policy.lock().unwrap().remove_workers(removed);
    }

    pub fn can_execute(&self, where_: WorkerKind) -> bool {
        self.workers.lock().unwrap().iter().any(|w| where_.intersects(w.kind))
    }
}
