//! The public runtime API (spec.md §6 "External Interfaces").
//!
//! `init`/`shutdown` bound all process-wide state, per spec.md §9 "Global
//! state": no other call is meaningful outside that window, except
//! `task_create` which only builds an inert record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crate::codelet::Codelet;
use crate::config::RuntimeConfig;
use crate::context::{ContextId, SchedulingContext, GLOBAL_CONTEXT};
use crate::data::coherence::{ContextRegistry, DataManager};
use crate::data::handle::{HandleId, Interface};
use crate::error::{Result, RuntimeError};
use crate::job::Job;
use crate::memory::{HostNode, NodeBuffer, NodeId, NodeOps, HOST_NODE};
use crate::sched::eager::EagerPolicy;
use crate::sched::policy::SchedulerPolicy;
use crate::sched::tree::TreePolicy;
use crate::task::{AccessMode, BufferBinding, Callback, JobId, Task, TaskId, TaskType};
use crate::worker::{worker_loop, WorkerHandle, WorkerId};

#[derive(Default)]
struct ObjectCounters {
    handles_created: AtomicU64,
    handles_freed: AtomicU64,
    tasks_submitted: AtomicU64,
}

/// A read-only diagnostics snapshot (SPEC_FULL.md "Supplemented features").
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub live_handles: u64,
    pub tasks_submitted: u64,
    pub jobs_terminated: u64,
    pub live_jobs: usize,
}

/// A builder for a not-yet-submitted task (spec.md §6 `task_create`).
pub struct TaskBuilder {
    codelet: Option<Arc<Codelet>>,
    buffers: Vec<BufferBinding>,
    arg: Option<Vec<u8>>,
    synchronous: bool,
    priority: i32,
    deadline: Option<std::time::Instant>,
    tag: Option<u64>,
    sched_ctx: ContextId,
    task_type: TaskType,
    task_size: usize,
    task_deps: Vec<TaskId>,
    tag_deps: Vec<u64>,
    on_complete: Vec<Callback>,
}

impl TaskBuilder {
    pub fn new(codelet: Arc<Codelet>) -> Self {
        Self {
            codelet: Some(codelet),
            buffers: Vec::new(),
            arg: None,
            synchronous: false,
            priority: 0,
            deadline: None,
            tag: None,
            sched_ctx: GLOBAL_CONTEXT,
            task_type: TaskType::Sequential,
            task_size: 1,
            task_deps: Vec::new(),
            tag_deps: Vec::new(),
            on_complete: Vec::new(),
        }
    }

    pub fn buffer(mut self, handle: HandleId, mode: AccessMode) -> Self {
        self.buffers.push(BufferBinding { handle, mode });
        self
    }

    pub fn arg(mut self, bytes: Vec<u8>) -> Self {
        self.arg = Some(bytes);
        self
    }

    pub fn synchronous(mut self, v: bool) -> Self {
        self.synchronous = v;
        self
    }

    pub fn sched_ctx(mut self, ctx: ContextId) -> Self {
        self.sched_ctx = ctx;
        self
    }

    pub fn parallel(mut self, task_type: TaskType, task_size: usize) -> Self {
        self.task_type = task_type;
        self.task_size = task_size;
        self
    }

    pub fn depends_on_task(mut self, id: TaskId) -> Self {
        self.task_deps.push(id);
        self
    }

    pub fn depends_on_tag(mut self, tag: u64) -> Self {
        self.tag_deps.push(tag);
        self
    }

    pub fn tag(mut self, tag: u64) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn on_complete(mut self, cb: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete.push(Box::new(cb));
        self
    }
}

pub struct Runtime {
    nodes: Vec<Arc<dyn NodeOps>>,
    data: Arc<DataManager>,
    contexts: Arc<ContextRegistry>,
    workers: Mutex<HashMap<WorkerId, Arc<WorkerHandle>>>,
    worker_threads: Mutex<Vec<JoinHandle<()>>>,
    next_task_id: AtomicU64,
    next_job_id: AtomicU64,
    next_context_id: AtomicU32,
    next_worker_id: AtomicUsize,
    /// Job for each submitted task, looked up when resolving explicit
    /// task-dependency lists (spec.md §4.2).
    jobs_by_task: Mutex<HashMap<TaskId, Arc<Job>>>,
    jobs_by_id: Mutex<HashMap<JobId, Arc<Job>>>,
    tags: Mutex<HashMap<u64, Vec<Weak<Job>>>>,
    pinned_allocs: Mutex<HashMap<usize, NodeBuffer>>,
    counters: ObjectCounters,
    pub config: RuntimeConfig,
}

impl Runtime {
    /// `init(config?)` (spec.md §6). Installs `env_logger` if no logger is
    /// already installed, reads `RuntimeConfig` from the environment if
    /// `config` is `None`, and starts the configured CPU workers under the
    /// global context.
    pub fn init(config: Option<RuntimeConfig>) -> Arc<Self> {
        let _unused = env_logger::try_init();
        let config = config.unwrap_or_else(RuntimeConfig::from_env);

        let host_cap = config.limit_cpu_mem;
        let nodes: Vec<Arc<dyn NodeOps>> = vec![Arc::new(HostNode::new(HOST_NODE, host_cap))];

        let contexts: Arc<ContextRegistry> = Arc::new(Mutex::new(HashMap::new()));
        let data = Arc::new(DataManager::new(nodes.clone(), Arc::clone(&contexts)));

        let global_policy_name = config.sched.clone().unwrap_or_else(|| "eager".to_string());
        let global_policy = make_policy(&global_policy_name, GLOBAL_CONTEXT);
        contexts.lock().unwrap().insert(
            GLOBAL_CONTEXT,
            Arc::new(SchedulingContext::new(GLOBAL_CONTEXT, "global".to_string(), global_policy, None)),
        );

        let runtime = Arc::new(Self {
            nodes,
            data,
            contexts,
            workers: Mutex::new(HashMap::new()),
            worker_threads: Mutex::new(Vec::new()),
            next_task_id: AtomicU64::new(1),
            next_job_id: AtomicU64::new(1),
            next_context_id: AtomicU32::new(GLOBAL_CONTEXT + 1),
            next_worker_id: AtomicUsize::new(0),
            jobs_by_task: Mutex::new(HashMap::new()),
            jobs_by_id: Mutex::new(HashMap::new()),
            tags: Mutex::new(HashMap::new()),
            pinned_allocs: Mutex::new(HashMap::new()),
            counters: ObjectCounters::default(),
            config,
        });

        let ncpu = runtime.config.ncpu.unwrap_or(1).max(1);
        runtime.spawn_cpu_workers(ncpu, GLOBAL_CONTEXT);
        log::info!("runtime initialized with {ncpu} CPU worker(s)");
        runtime
    }

    fn spawn_cpu_workers(self: &Arc<Self>, n: usize, ctx_id: ContextId) {
        let ctx = self.contexts.lock().unwrap().get(&ctx_id).cloned().expect("context must exist");
        let mut handles = Vec::with_capacity(n);
        for _ in 0..n {
            let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
            let handle = WorkerHandle::new(id, crate::codelet::WorkerKind::CPU, HOST_NODE);
            handles.push(Arc::clone(&handle));
            self.workers.lock().unwrap().insert(id, Arc::clone(&handle));

            let data = Arc::clone(&self.data);
            let ctx_for_thread = Arc::clone(&ctx);
            let thread_handle = std::thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker_loop(handle, ctx_for_thread, data))
                .expect("failed to spawn worker thread");
            self.worker_threads.lock().unwrap().push(thread_handle);
        }
        ctx.add_workers(&handles);
    }

    /// `shutdown()`: broadcasts all worker condition variables, joins every
    /// worker thread (whose `deinit` drains pending requests as it exits),
    /// per spec.md §4.6 "Cancellation".
    pub fn shutdown(&self) {
        for w in self.workers.lock().unwrap().values() {
            w.shutdown();
        }
        let handles: Vec<_> = self.worker_threads.lock().unwrap().drain(..).collect();
        for h in handles {
            let _unused = h.join();
        }
        log::info!("runtime shut down");
    }

    // ---- data ----------------------------------------------------------

    pub fn data_register(&self, interface: Interface, node: NodeId, planes: Vec<NodeBuffer>) -> HandleId {
        self.counters.handles_created.fetch_add(1, Ordering::Relaxed);
        self.data.register(interface, node, planes)
    }

    /// `register_vector(h, node, addr, n, elemsize)`.
    ///
    /// # Safety
    /// `addr` must be valid for `n * elemsize` bytes for the handle's
    /// lifetime.
    pub unsafe fn register_vector(&self, node: NodeId, addr: *mut u8, n: usize, elemsize: usize) -> HandleId {
        let buf = NodeBuffer::from_raw(addr, n * elemsize);
        self.data_register(Interface::Vector { len: n, elem_size: elemsize }, node, vec![buf])
    }

    /// # Safety
    /// `addr` must be valid for `rows * cols * elemsize` bytes.
    pub unsafe fn register_matrix(&self, node: NodeId, addr: *mut u8, rows: usize, cols: usize, elemsize: usize) -> HandleId {
        let buf = NodeBuffer::from_raw(addr, rows * cols * elemsize);
        self.data_register(Interface::Matrix { rows, cols, elem_size: elemsize }, node, vec![buf])
    }

    /// # Safety
    /// `nzval`/`colind`/`rowptr` must be valid for the byte sizes the CSR
    /// interface's `plane_byte_sizes()` computes from `nrows`/`nnz`/`elemsize`.
    pub unsafe fn register_csr(
        &self,
        node: NodeId,
        nzval: *mut u8,
        colind: *mut u8,
        rowptr: *mut u8,
        nrows: usize,
        nnz: usize,
        elemsize: usize,
    ) -> HandleId {
        let interface = Interface::Csr { nrows, nnz, elem_size: elemsize };
        let sizes = interface.plane_byte_sizes();
        let planes = vec![
            NodeBuffer::from_raw(nzval, sizes[0]),
            NodeBuffer::from_raw(colind, sizes[1]),
            NodeBuffer::from_raw(rowptr, sizes[2]),
        ];
        self.data_register(interface, node, planes)
    }

    pub fn data_unregister(&self, handle: HandleId) -> Result<()> {
        self.counters.handles_freed.fetch_add(1, Ordering::Relaxed);
        self.data.unregister(handle, true)
    }

    pub fn data_partition(&self, handle: HandleId, children: Vec<Interface>) -> Result<Vec<HandleId>> {
        self.data.partition(handle, children)
    }

    pub fn data_unpartition(&self, handle: HandleId, target_node: NodeId) -> Result<()> {
        self.data.unpartition(handle, target_node)
    }

    pub fn data_get_sub_data(&self, handle: HandleId, depth: usize, idx: usize) -> Result<HandleId> {
        if depth != 1 {
            return Err(RuntimeError::InvalidHandle("data_get_sub_data only supports one partition level"));
        }
        self.data.sub_handle(handle, idx)
    }

    /// The node currently holding the OWNER replica of `handle`, if any.
    pub fn data_owner_node(&self, handle: HandleId) -> Result<Option<NodeId>> {
        self.data.owner_node(handle)
    }

    pub fn acquire(&self, handle: HandleId, mode: AccessMode) -> Result<()> {
        self.data.acquire(handle, mode, HOST_NODE)
    }

    pub fn release(&self, handle: HandleId) -> Result<()> {
        self.data.release(handle)
    }

    pub fn with_host_bytes<R>(&self, handle: HandleId, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.data.with_host_bytes(handle, HOST_NODE, f)
    }

    /// `malloc(size)` (pinned host memory).
    pub fn malloc(&self, size: usize) -> Result<*mut u8> {
        let buf = self.nodes[HOST_NODE as usize].allocate(size)?;
        let ptr = buf.as_ptr();
        self.pinned_allocs.lock().unwrap().insert(ptr as usize, buf);
        Ok(ptr)
    }

    pub fn free(&self, ptr: *mut u8) {
        if let Some(buf) = self.pinned_allocs.lock().unwrap().remove(&(ptr as usize)) {
            self.nodes[HOST_NODE as usize].free(buf);
        }
    }

    // ---- tasks -----------------------------------------------------------

    pub fn task_create(&self, codelet: Arc<Codelet>) -> (TaskId, TaskBuilder) {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        (id, TaskBuilder::new(codelet))
    }

    /// `task_submit(t)`: returns `Ok(())` on acceptance, `Err(NoDevice)`
    /// (ENODEV) if no worker in the task's context can run its codelet
    /// (spec.md §8 scenario E — checked, and rejected, before any
    /// enqueueing).
    pub fn task_submit(self: &Arc<Self>, id: TaskId, builder: TaskBuilder) -> Result<JobId> {
        let ctx = self
            .contexts
            .lock()
            .unwrap()
            .get(&builder.sched_ctx)
            .cloned()
            .ok_or(RuntimeError::InvalidState("unknown scheduling context"))?;

        if let Some(codelet) = &builder.codelet {
            if !ctx.can_execute(codelet.where_) {
                return Err(RuntimeError::NoDevice);
            }
        }

        let task = Arc::new(Task {
            id,
            codelet: builder.codelet,
            buffers: builder.buffers,
            arg: builder.arg,
            synchronous: builder.synchronous,
            priority: builder.priority,
            deadline: builder.deadline,
            tag: builder.tag,
            sched_ctx: builder.sched_ctx,
            task_type: builder.task_type,
            task_size: builder.task_size.max(1),
            task_deps: builder.task_deps,
            tag_deps: builder.tag_deps,
            on_complete: Mutex::new(builder.on_complete),
        });
        if !task.buffer_count_is_valid() {
            return Err(RuntimeError::InvalidState("task has more buffers than its codelet declares"));
        }

        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        // created with a placeholder dep count of 0: `record_access` below
        // needs a real `Arc<Job>` to register as the handle's new
        // last-writer/reader, so the final count is only known — and set
        // via `set_initial_deps` — once every dependency source has run.
        let job = Arc::new(Job::new(job_id, Arc::clone(&task), 0));

        let mut deps: Vec<Arc<Job>> = Vec::new();
        {
            let jobs_by_task = self.jobs_by_task.lock().unwrap();
            for dep_id in &task.task_deps {
                if let Some(dep_job) = jobs_by_task.get(dep_id) {
                    if !dep_job.is_terminated() {
                        deps.push(Arc::clone(dep_job));
                    }
                }
            }
        }
        {
            let tags = self.tags.lock().unwrap();
            for tag in &task.tag_deps {
                if let Some(jobs) = tags.get(tag) {
                    for w in jobs {
                        if let Some(j) = w.upgrade() {
                            if !j.is_terminated() {
                                deps.push(j);
                            }
                        }
                    }
                }
            }
        }
        for binding in &task.buffers {
            if binding.mode.contains(AccessMode::SCRATCH) {
                continue;
            }
            for w in self.data.record_access(binding.handle, &job, binding.mode)? {
                if let Some(j) = w.upgrade() {
                    deps.push(j);
                }
            }
        }

        job.set_initial_deps(deps.len());
        for dep in deps {
            dep.successors.lock().unwrap().push(Arc::downgrade(&job));
        }

        if let Some(tag) = task.tag {
            self.tags.lock().unwrap().entry(tag).or_default().push(Arc::downgrade(&job));
        }

        self.jobs_by_task.lock().unwrap().insert(id, Arc::clone(&job));
        self.jobs_by_id.lock().unwrap().insert(job_id, Arc::clone(&job));
        self.counters.tasks_submitted.fetch_add(1, Ordering::Relaxed);

        if job.remaining_deps.load(Ordering::Acquire) == 0 {
            ctx.policy.lock().unwrap().push_task(Arc::clone(&job))?;
        }

        if task.synchronous {
            job.wait_for_termination();
        }

        Ok(job_id)
    }

    pub fn task_wait(&self, job_id: JobId) -> Result<()> {
        let job = self
            .jobs_by_id
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .ok_or(RuntimeError::InvalidState("unknown job"))?;
        job.wait_for_termination();
        Ok(())
    }

    /// `task_wait_for_all()`.
    pub fn task_wait_for_all(&self) {
        let jobs: Vec<_> = self.jobs_by_id.lock().unwrap().values().cloned().collect();
        for job in jobs {
            job.wait_for_termination();
        }
    }

    // ---- scheduling contexts --------------------------------------------

    pub fn sched_ctx_create(&self, policy_name: &str, name: &str) -> ContextId {
        let id = self.next_context_id.fetch_add(1, Ordering::Relaxed);
        let policy = make_policy(policy_name, id);
        self.contexts
            .lock()
            .unwrap()
            .insert(id, Arc::new(SchedulingContext::new(id, name.to_string(), policy, Some(GLOBAL_CONTEXT))));
        id
    }

    pub fn sched_ctx_delete(&self, id: ContextId) {
        if id == GLOBAL_CONTEXT {
            return;
        }
        if let Some(ctx) = self.contexts.lock().unwrap().remove(&id) {
            let orphaned = ctx.policy.lock().unwrap().pop_every_task();
            if let Some(global) = self.contexts.lock().unwrap().get(&GLOBAL_CONTEXT) {
                for job in orphaned {
                    let _unused = global.policy.lock().unwrap().push_task(job);
                }
            }
        }
    }

    pub fn sched_ctx_add_workers(&self, ctx_id: ContextId, worker_ids: &[WorkerId]) {
        let ctx = self.contexts.lock().unwrap().get(&ctx_id).cloned();
        let Some(ctx) = ctx else { return };
        let workers = self.workers.lock().unwrap();
        let handles: Vec<_> = worker_ids.iter().filter_map(|id| workers.get(id).cloned()).collect();
        ctx.add_workers(&handles);
    }

    pub fn stats(&self) -> Stats {
        Stats {
            live_handles: self.counters.handles_created.load(Ordering::Relaxed)
                - self.counters.handles_freed.load(Ordering::Relaxed),
            tasks_submitted: self.counters.tasks_submitted.load(Ordering::Relaxed),
            jobs_terminated: self.data.jobs_terminated(),
            live_jobs: self.jobs_by_id.lock().unwrap().len(),
        }
    }
}

fn make_policy(name: &str, ctx: ContextId) -> Box<dyn SchedulerPolicy> {
    match name {
        "tree" => Box::new(TreePolicy::new(ctx)),
        _ => Box::new(EagerPolicy::new()),
    }
}
