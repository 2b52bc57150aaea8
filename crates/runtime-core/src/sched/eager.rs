//! The eager central policy (spec.md §4.4): one global FIFO, one
//! waiting-worker bit-set, a single mutex protecting both.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

use crate::error::Result;
use crate::job::Job;
use crate::sched::policy::{SchedulerPolicy, WorkerTypeKind};
use crate::worker::{WorkerHandle, WorkerId};

struct State {
    queue: VecDeque<Arc<Job>>,
    /// "Waiters" bit-set: true for a worker currently parked in `pop_task`.
    waiters: HashMap<WorkerId, bool>,
}

pub struct EagerPolicy {
    state: std::sync::Mutex<State>,
    workers: std::sync::Mutex<HashMap<WorkerId, Arc<WorkerHandle>>>,
    /// Racy length hint read without the lock as `pop_task`'s fast path
    /// (spec.md §4.4); correctness never depends on it being fresh since
    /// the locked recheck is authoritative. Cache-padded since every idle
    /// worker spins on this line.
    ntasks: CachePadded<AtomicUsize>,
}

impl EagerPolicy {
    pub fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(State {
                queue: VecDeque::new(),
                waiters: HashMap::new(),
            }),
            workers: std::sync::Mutex::new(HashMap::new()),
            ntasks: CachePadded::new(AtomicUsize::new(0)),
        }
    }
}

impl Default for EagerPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerPolicy for EagerPolicy {
    fn add_workers(&mut self, workers: &[Arc<WorkerHandle>]) {
        let mut registry = self.workers.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        for w in workers {
            registry.insert(w.id, Arc::clone(w));
            state.waiters.insert(w.id, false);
        }
    }

    fn remove_workers(&mut self, workers: &[Arc<WorkerHandle>]) {
        let mut registry = self.workers.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        for w in workers {
            registry.remove(&w.id);
            state.waiters.remove(&w.id);
        }
    }

    /// Appends `t`, then wakes eligible parked workers (spec.md §4.4): for
    /// a sequential task, at most one; for a parallel task of size `k`, up
    /// to `k` (one per alias it will eventually claim), since there is no
    /// pre-selected combined-worker set in this reference policy — any `k`
    /// compatible workers may claim the `k` ranks at pop time.
    fn push_task(&mut self, job: Arc<Job>) -> Result<()> {
        let registry = self.workers.lock().unwrap();
        let mut state = self.state.lock().unwrap();

        let want_wakes = job.task.task_size.max(1);
        let kind = job.task.codelet.as_ref().map(|c| c.where_);
        state.queue.push_back(job);
        self.ntasks.fetch_add(1, Ordering::Release);

        let mut woken = 0;
        let mut to_signal = Vec::new();
        for (&id, waiting) in state.waiters.iter_mut() {
            if woken >= want_wakes {
                break;
            }
            if !*waiting {
                continue;
            }
            let compatible = kind.map(|k| registry.get(&id).map(|w| k.intersects(w.kind)).unwrap_or(false)).unwrap_or(true);
            if compatible {
                *waiting = false;
                to_signal.push(id);
                woken += 1;
            }
        }
        drop(state);
        for id in to_signal {
            if let Some(w) = registry.get(&id) {
                w.signal();
            }
        }
        Ok(())
    }

    /// Racy fast path then a locked recheck (spec.md §4.4). Front-of-queue
    /// jobs with `task_size > 1` stay in the queue until every rank has
    /// been claimed, so concurrent pops by the other aliases still see it.
    fn pop_task(&mut self, worker: &Arc<WorkerHandle>) -> Option<(Arc<Job>, usize)> {
        if self.ntasks.load(Ordering::Acquire) == 0 {
            // racy fast path; the locked check below is authoritative.
            return None;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(front) = state.queue.front() {
            let compatible = front.task.codelet.as_ref().map(|c| c.supports(worker.kind)).unwrap_or(true);
            if compatible {
                if front.task.task_size > 1 {
                    let job = Arc::clone(front);
                    let rank = job.claim_rank();
                    if rank + 1 >= job.task.task_size {
                        state.queue.pop_front();
                        self.ntasks.fetch_sub(1, Ordering::Release);
                    }
                    return Some((job, rank));
                } else {
                    let job = state.queue.pop_front()?;
                    self.ntasks.fetch_sub(1, Ordering::Release);
                    return Some((job, 0));
                }
            }
        }

        if let Some(idx) = state
            .queue
            .iter()
            .position(|j| j.task.codelet.as_ref().map(|c| c.supports(worker.kind)).unwrap_or(true))
        {
            let job = state.queue.remove(idx).unwrap();
            self.ntasks.fetch_sub(1, Ordering::Release);
            return Some((job, 0));
        }

        state.waiters.insert(worker.id, true);
        None
    }

    fn pop_every_task(&mut self) -> Vec<Arc<Job>> {
        self.ntasks.store(0, Ordering::Release);
        self.state.lock().unwrap().queue.drain(..).collect()
    }

    fn policy_name(&self) -> &'static str {
        "eager"
    }

    fn worker_type(&self) -> WorkerTypeKind {
        WorkerTypeKind::List
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codelet::{Codelet, CodeletFlags, WorkerKind};
    use crate::memory::HOST_NODE;
    use crate::task::{Task, TaskType};

    fn cpu_job(id: u64) -> Arc<Job> {
        let codelet = Arc::new(Codelet {
            name: "noop",
            where_: WorkerKind::CPU,
            implementations: Vec::new(),
            nbuffers: 0,
            modes: Vec::new(),
            flags: CodeletFlags::empty(),
        });
        let task = Arc::new(Task {
            id,
            codelet: Some(codelet),
            buffers: Vec::new(),
            arg: None,
            synchronous: false,
            priority: 0,
            deadline: None,
            tag: None,
            sched_ctx: crate::context::GLOBAL_CONTEXT,
            task_type: TaskType::Sequential,
            task_size: 1,
            task_deps: Vec::new(),
            tag_deps: Vec::new(),
            on_complete: std::sync::Mutex::new(Vec::new()),
        });
        Arc::new(Job::new(id, task, 0))
    }

    /// spec.md §8 scenario C: 4 idle workers (all waiters bits set), push
    /// one task, exactly one worker's waiters bit is cleared.
    #[test]
    fn push_wakes_exactly_one_idle_worker() {
        let mut policy = EagerPolicy::new();
        let handles: Vec<_> = (0..4).map(|id| WorkerHandle::new(id, WorkerKind::CPU, HOST_NODE)).collect();
        policy.add_workers(&handles);

        for h in &handles {
            assert!(policy.pop_task(h).is_none());
        }
        {
            let state = policy.state.lock().unwrap();
            assert_eq!(state.waiters.values().filter(|&&w| w).count(), 4);
        }

        policy.push_task(cpu_job(1)).unwrap();

        let state = policy.state.lock().unwrap();
        assert_eq!(state.waiters.values().filter(|&&w| !w).count(), 1);
        assert_eq!(state.waiters.values().filter(|&&w| w).count(), 3);
    }
}
