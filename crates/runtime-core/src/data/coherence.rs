//! The data handle & coherency manager (spec.md §4.1).
//!
//! Owns the handle arena and every memory node, and is the single writer of
//! replica state (spec.md §9 "Callback-driven transfer completion"): the
//! handle's own mutex, not a global lock, serializes concurrent access to
//! one handle, while distinct handles proceed fully in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::context::{ContextId, SchedulingContext};
use crate::data::handle::{HandleId, HandleRecord, Interface, PartitionState, ReplicaState};
use crate::error::{fatal_invariant, Result, RuntimeError};
use crate::job::Job;
use crate::memory::{NodeBuffer, NodeId, NodeOps};
use crate::task::AccessMode;

pub type ContextRegistry = Mutex<HashMap<ContextId, Arc<SchedulingContext>>>;

struct HandleSlot {
    record: Mutex<HandleRecord>,
    /// Notified whenever a job that touched this handle terminates, so
    /// `unregister`'s blocking wait (spec.md §4.1) doesn't need to poll.
    idle_cond: Condvar,
}

pub struct DataManager {
    nodes: Vec<Arc<dyn NodeOps>>,
    handles: Mutex<HashMap<HandleId, Arc<HandleSlot>>>,
    next_handle: AtomicU64,
    contexts: Arc<ContextRegistry>,
    /// Diagnostics only (`Runtime::stats()`); incremented once per job in
    /// `commit_job_outputs`, the one place every job's termination passes
    /// through regardless of which worker or policy ran it.
    jobs_terminated: AtomicU64,
}

/// A transient, unsynchronized view onto one buffer binding's bytes for the
/// duration of a kernel invocation. Built from the raw pointer the owning
/// node allocated; safe because the dependency tracker in
/// `data::handle::HandleRecord::record_access` guarantees no other job holds
/// a conflicting view concurrently (spec.md §8 invariant 2).
pub struct BufferView {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: see `BufferView` doc comment — exclusivity is a scheduling
// invariant, not something the type system here can express, mirroring the
// teacher's `SyncSendPointer` (`src/main/utility/mod.rs`).
unsafe impl Send for BufferView {}

impl BufferView {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see type doc comment.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl DataManager {
    pub fn new(nodes: Vec<Arc<dyn NodeOps>>, contexts: Arc<ContextRegistry>) -> Self {
        Self {
            nodes,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            contexts,
            jobs_terminated: AtomicU64::new(0),
        }
    }

    pub fn jobs_terminated(&self) -> u64 {
        self.jobs_terminated.load(Ordering::Relaxed)
    }

    fn node(&self, id: NodeId) -> &Arc<dyn NodeOps> {
        self.nodes
            .get(id as usize)
            .unwrap_or_else(|| fatal_invariant(&format!("unknown memory node {id}")))
    }

    fn slot(&self, id: HandleId) -> Result<Arc<HandleSlot>> {
        self.handles
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(RuntimeError::InvalidHandle("unknown or already-unregistered handle"))
    }

    /// `register(interface, initial_node) → handle` (spec.md §4.1). `planes`
    /// must already hold the caller's buffer for each of
    /// `interface.plane_byte_sizes()`.
    pub fn register(&self, interface: Interface, initial_node: NodeId, planes: Vec<NodeBuffer>) -> HandleId {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let num_nodes = self.nodes.len();
        let mut record = HandleRecord::new(id, interface, initial_node, num_nodes);
        record.replicas[initial_node as usize].planes = planes.into_iter().map(Some).collect();
        self.handles.lock().unwrap().insert(
            id,
            Arc::new(HandleSlot {
                record: Mutex::new(record),
                idle_cond: Condvar::new(),
            }),
        );
        id
    }

    /// `unregister(handle)` (spec.md §4.1): blocks until every job that
    /// touched the handle has terminated, then frees runtime-allocated
    /// replicas (optionally reconciling ownership back to `home_node`
    /// first).
    pub fn unregister(&self, id: HandleId, reconcile_home: bool) -> Result<()> {
        let slot = self.slot(id)?;
        {
            let mut record = slot.record.lock().unwrap();
            loop {
                let busy = record
                    .last_writer
                    .as_ref()
                    .and_then(Weak::upgrade)
                    .map(|j| !j.is_terminated())
                    .unwrap_or(false)
                    || record
                        .pending_readers
                        .iter()
                        .filter_map(Weak::upgrade)
                        .any(|j| !j.is_terminated());
                if !busy {
                    break;
                }
                record = slot.idle_cond.wait(record).unwrap();
            }

            if reconcile_home {
                self.reconcile_ownership(&mut record, record.home_node);
            }

            for (node_idx, replica) in record.replicas.iter_mut().enumerate() {
                for plane in replica.planes.iter_mut() {
                    if let Some(buf) = plane.take() {
                        if buf.owned_by_runtime {
                            self.node(node_idx as NodeId).free(buf);
                        }
                    }
                }
                replica.state = ReplicaState::Invalid;
            }
        }
        self.handles.lock().unwrap().remove(&id);
        Ok(())
    }

    /// Records this job's access to `handle` and returns the jobs it must
    /// wait for (spec.md §4.2 "Data-use dependencies").
    pub fn record_access(&self, id: HandleId, job: &Arc<Job>, mode: AccessMode) -> Result<Vec<Weak<Job>>> {
        let slot = self.slot(id)?;
        let mut record = slot.record.lock().unwrap();
        record.check_plain()?;
        Ok(record.record_access(job, mode))
    }

    /// Called once a job referencing `handle` has terminated, so a blocked
    /// `unregister` can recheck.
    pub fn notify_handle_idle(&self, id: HandleId) {
        if let Ok(slot) = self.slot(id) {
            slot.idle_cond.notify_all();
        }
    }

    /// Picks a source replica and performs the copy for one R/RW binding
    /// (spec.md §4.1 step 2): cheapest transfer cost, ties by smaller node
    /// id. The CPU-only backend has uniform transfer cost between any two
    /// host nodes, so "cheapest" degenerates to "smallest id among OWNER or
    /// SHARED replicas".
    fn choose_source(record: &HandleRecord) -> Option<NodeId> {
        record
            .replicas
            .iter()
            .position(|r| r.state == ReplicaState::Owner)
            .or_else(|| record.replicas.iter().position(|r| r.state == ReplicaState::Shared))
            .map(|i| i as NodeId)
    }

    fn ensure_replica_storage(&self, record: &mut HandleRecord, node: NodeId) -> Result<()> {
        let sizes = record.interface.plane_byte_sizes();
        record.ensure_node(node, sizes.len());
        let replica = &mut record.replicas[node as usize];
        if !replica.is_allocated() {
            let mut planes = Vec::with_capacity(sizes.len());
            for size in sizes {
                planes.push(Some(self.node(node).allocate(size)?));
            }
            replica.planes = planes;
        }
        Ok(())
    }

    fn copy_replica(&self, record: &mut HandleRecord, src_node: NodeId, dst_node: NodeId) {
        if src_node == dst_node {
            return;
        }
        if !self.node(dst_node).can_direct_access(src_node) {
            // stage through host RAM; the CPU-only backend never hits this,
            // but the staging hop is still modelled so a device backend can
            // reuse this path unchanged.
            self.copy_replica(record, src_node, crate::memory::HOST_NODE);
            self.copy_replica(record, crate::memory::HOST_NODE, dst_node);
            return;
        }
        let num_planes = record.replicas[src_node as usize].planes.len();
        for plane_idx in 0..num_planes {
            let src_info = record.replicas[src_node as usize].planes[plane_idx]
                .as_ref()
                .map(|b| (b.as_ptr(), b.len));
            let dst_info = record.replicas[dst_node as usize].planes[plane_idx]
                .as_ref()
                .map(|b| (b.as_ptr(), b.len));
            if let (Some((src_ptr, src_len)), Some((dst_ptr, dst_len))) = (src_info, dst_info) {
                debug_assert_eq!(src_len, dst_len);
                // SAFETY: the two buffers were allocated independently by
                // their owning nodes (never aliasing) and are not
                // concurrently accessed elsewhere — guaranteed by the
                // handle's serialization primitive being held here.
                unsafe { std::ptr::copy_nonoverlapping(src_ptr, dst_ptr, dst_len.min(src_len)) };
            }
        }
    }

    /// Invalidates every replica of `record` except `keep`.
    fn invalidate_others(&self, record: &mut HandleRecord, keep: NodeId) {
        for (idx, replica) in record.replicas.iter_mut().enumerate() {
            if idx as NodeId != keep && replica.state != ReplicaState::Invalid {
                replica.state = ReplicaState::Invalid;
            }
        }
    }

    fn reconcile_ownership(&self, record: &mut HandleRecord, target: NodeId) {
        if record.owner_node() == Some(target) {
            return;
        }
        if let Some(src) = record.owner_node().or_else(|| Self::choose_source(record)) {
            let _unused = self.ensure_replica_storage(record, target);
            self.copy_replica(record, src, target);
        }
        self.invalidate_others(record, target);
        record.replicas[target as usize].state = ReplicaState::Owner;
    }

    /// Begins fetching every input/inout buffer binding of `job` onto
    /// `executing_node` (spec.md §4.1 "Coherence protocol on task input
    /// fetch"). The CPU-only backend performs copies synchronously, so the
    /// "async copy completion callback" fires inline; a device backend
    /// would instead hand the copy to its async engine and call
    /// `Job::on_transfer_complete` from a completion thread. Returns the
    /// number of bindings still pending (0 means the job is execute-ready
    /// immediately).
    pub fn begin_fetch(&self, job: &Arc<Job>, executing_node: NodeId) -> usize {
        job.set_transfer_count(job.task.buffers.len());
        for binding in &job.task.buffers {
            let Ok(slot) = self.slot(binding.handle) else {
                fatal_invariant("fetch_input referenced an unregistered handle");
            };
            let mut record = slot.record.lock().unwrap();
            self.fetch_one(&mut record, binding.mode, executing_node);
            drop(record);
            // synchronous backend: every copy above has already completed,
            // so the completion callback fires inline here. A backend with
            // a real async transfer engine would instead call this from
            // the copy's completion handler.
            job.on_transfer_complete();
        }
        job.buffers_totransfer.load(Ordering::Acquire) - job.buffers_transferred.load(Ordering::Acquire)
    }

    fn fetch_one(&self, record: &mut HandleRecord, mode: AccessMode, executing_node: NodeId) {
        if mode.contains(AccessMode::SCRATCH) {
            let _unused = self.ensure_replica_storage(record, executing_node);
            return;
        }

        let needs_input = mode.intersects(AccessMode::R | AccessMode::RW);
        let is_write = mode.intersects(AccessMode::W | AccessMode::RW | AccessMode::REDUX);

        record.ensure_node(executing_node, record.interface.plane_byte_sizes().len());
        if needs_input && record.replicas[executing_node as usize].state == ReplicaState::Invalid {
            if let Some(src) = Self::choose_source(record) {
                let _unused = self.ensure_replica_storage(record, executing_node);
                self.copy_replica(record, src, executing_node);
                record.replicas[executing_node as usize].state =
                    if is_write { ReplicaState::Owner } else { ReplicaState::Shared };
            }
        } else if is_write {
            let _unused = self.ensure_replica_storage(record, executing_node);
        }

        if is_write {
            self.invalidate_others(record, executing_node);
            record.replicas[executing_node as usize].state = ReplicaState::Owner;
        } else if record.replicas[executing_node as usize].state == ReplicaState::Invalid {
            record.replicas[executing_node as usize].state = ReplicaState::Shared;
        }
    }

    /// Hands back a raw, exclusive view of every plane of each buffer
    /// binding's bytes on `node`, in binding order, for the duration of
    /// kernel execution — one entry per binding, one `BufferView` per plane
    /// (three for CSR's `nzval`/`colind`/`rowptr`, one otherwise).
    pub fn borrow_job_buffers(&self, job: &Arc<Job>, node: NodeId) -> Vec<Vec<BufferView>> {
        let mut views = Vec::with_capacity(job.task.buffers.len());
        for binding in &job.task.buffers {
            let Ok(slot) = self.slot(binding.handle) else {
                fatal_invariant("execute referenced an unregistered handle");
            };
            let record = slot.record.lock().unwrap();
            let replica = &record.replicas[node as usize];
            let planes: Vec<BufferView> = replica
                .planes
                .iter()
                .filter_map(|p| p.as_ref())
                .map(|plane| BufferView {
                    ptr: plane.as_ptr(),
                    len: plane.len,
                })
                .collect();
            if planes.is_empty() {
                fatal_invariant("borrowed buffer with no allocated replica");
            }
            views.push(planes);
        }
        views
    }

    /// Records the runtime-visible effects of completing a job: clears
    /// outgoing-transfer pins, and wakes anything blocked in `unregister`.
    pub fn commit_job_outputs(&self, job: &Arc<Job>) {
        for binding in &job.task.buffers {
            self.notify_handle_idle(binding.handle);
        }
        self.jobs_terminated.fetch_add(1, Ordering::Relaxed);
    }

    /// Routes a newly-ready successor job back into its scheduling context
    /// (spec.md §4.2 "Execution hand-off": "for each whose counter reached
    /// zero calls `push_task`").
    pub fn push_ready_job(&self, job: Arc<Job>) {
        let ctx = {
            let contexts = self.contexts.lock().unwrap();
            contexts.get(&job.task.sched_ctx).cloned()
        };
        match ctx {
            Some(ctx) => {
                if let Err(err) = ctx.policy.lock().unwrap().push_task(job) {
                    log::error!("push_task failed for newly-ready job: {err}");
                }
            }
            None => fatal_invariant("job referenced an unknown scheduling context"),
        }
    }

    /// One quantum of the transfer engine. The CPU-only backend performs
    /// copies synchronously inside `begin_fetch`, so there is no background
    /// queue to drive; kept as an explicit no-op call site (spec.md §4.6)
    /// so a backend with a real async engine has a natural place to plug
    /// in without reshaping the driver loop.
    pub fn drive_quantum(&self) {}

    /// `partition(handle, filter) → nothing` (spec.md §4.1): children's
    /// interfaces are "disjoint views into the parent's memory", so a
    /// single-plane child (Vector/Matrix/Other) is a zero-copy raw-pointer
    /// view into the parent's own home-node buffer — any write a child task
    /// makes is a write to the parent's bytes directly, which is what makes
    /// `unpartition` a value-identity when nothing wrote to the children
    /// (spec.md §8 invariant). A CSR child can't be a raw view, since its
    /// `rowptr` plane must be renumbered relative to the row block, so it
    /// gets its own allocation and a real copy instead.
    pub fn partition(&self, id: HandleId, children_interfaces: Vec<Interface>) -> Result<Vec<HandleId>> {
        let slot = self.slot(id)?;
        let mut record = slot.record.lock().unwrap();
        record.check_plain()?;
        self.reconcile_ownership(&mut record, record.home_node);

        let home = record.home_node;
        let num_nodes = self.nodes.len();
        let mut child_ids = Vec::with_capacity(children_interfaces.len());
        let mut plane_offset = 0usize;
        let mut row_offset = 0usize;

        for child_interface in children_interfaces {
            let child_id = self.next_handle.fetch_add(1, Ordering::Relaxed);
            let mut child_record = HandleRecord::new(child_id, child_interface.clone(), home, num_nodes);
            child_record.parent = Some(id);

            match &child_interface {
                Interface::Csr { nrows, elem_size, .. } => {
                    self.materialize_csr_child(&record, &mut child_record, home, row_offset, *nrows, *elem_size)?;
                    row_offset += nrows;
                }
                _ => {
                    let size = child_interface.plane_byte_sizes()[0];
                    let parent_buf = record.replicas[home as usize]
                        .planes
                        .first()
                        .and_then(|p| p.as_ref())
                        .unwrap_or_else(|| fatal_invariant("partition: parent has no storage on its home node"));
                    debug_assert!(plane_offset + size <= parent_buf.len);
                    // SAFETY: each child gets a disjoint, non-overlapping
                    // byte range within the parent's single allocation;
                    // `owned_by_runtime=false` so freeing a child never
                    // frees the parent's storage.
                    let view = unsafe { NodeBuffer::from_raw(parent_buf.as_ptr().add(plane_offset), size) };
                    child_record.replicas[home as usize].planes = vec![Some(view)];
                    child_record.replicas[home as usize].state = ReplicaState::Owner;
                    plane_offset += size;
                }
            }

            self.handles.lock().unwrap().insert(
                child_id,
                Arc::new(HandleSlot {
                    record: Mutex::new(child_record),
                    idle_cond: Condvar::new(),
                }),
            );
            child_ids.push(child_id);
        }
        record.partition = PartitionState::Partitioned(child_ids.clone());
        Ok(child_ids)
    }

    /// Copies one contiguous row block `[row_start, row_start+nrows)` of a
    /// parent CSR handle into a freshly allocated, independent child
    /// replica, renumbering `rowptr` relative to the block's own `nnz`
    /// start.
    fn materialize_csr_child(
        &self,
        parent: &HandleRecord,
        child: &mut HandleRecord,
        home: NodeId,
        row_start: usize,
        nrows: usize,
        elem_size: usize,
    ) -> Result<()> {
        let parent_replica = &parent.replicas[home as usize];
        let nzval_buf = parent_replica
            .planes
            .first()
            .and_then(|p| p.as_ref())
            .unwrap_or_else(|| fatal_invariant("partition: CSR parent missing nzval plane"));
        let colind_buf = parent_replica
            .planes
            .get(1)
            .and_then(|p| p.as_ref())
            .unwrap_or_else(|| fatal_invariant("partition: CSR parent missing colind plane"));
        let rowptr_buf = parent_replica
            .planes
            .get(2)
            .and_then(|p| p.as_ref())
            .unwrap_or_else(|| fatal_invariant("partition: CSR parent missing rowptr plane"));

        let read_u32 = |buf: &NodeBuffer, idx: usize| -> u32 {
            let bytes = buf.as_slice();
            u32::from_ne_bytes(bytes[idx * 4..idx * 4 + 4].try_into().unwrap())
        };

        let nnz_start = read_u32(rowptr_buf, row_start) as usize;
        let nnz_end = read_u32(rowptr_buf, row_start + nrows) as usize;
        let nnz_local = nnz_end - nnz_start;

        let nzval_child = self.node(home).allocate(nnz_local * elem_size)?;
        let colind_child = self.node(home).allocate(nnz_local * 4)?;
        let mut rowptr_child = self.node(home).allocate((nrows + 1) * 4)?;

        // SAFETY: `nnz_local * elem_size`/`nnz_local * 4` bytes starting at
        // `nnz_start` lie within the parent's own plane, which covers the
        // whole matrix; the freshly allocated child buffers are exactly
        // that size and not aliased by anything else yet.
        unsafe {
            std::ptr::copy_nonoverlapping(
                nzval_buf.as_ptr().add(nnz_start * elem_size),
                nzval_child.as_ptr(),
                nnz_local * elem_size,
            );
            std::ptr::copy_nonoverlapping(colind_buf.as_ptr().add(nnz_start * 4), colind_child.as_ptr(), nnz_local * 4);
        }
        {
            let dst = rowptr_child.as_mut_slice();
            for i in 0..=nrows {
                let v = read_u32(rowptr_buf, row_start + i) - nnz_start as u32;
                dst[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes());
            }
        }

        child.replicas[home as usize].planes = vec![Some(nzval_child), Some(colind_child), Some(rowptr_child)];
        child.replicas[home as usize].state = ReplicaState::Owner;
        Ok(())
    }

    /// `unpartition(handle, target_node)` (spec.md §4.1): blocks on each
    /// child the same way `unregister` does (spec.md §9 open question:
    /// unpartition must wait out any task still touching a child), frees
    /// the children's own storage, then reconciles the parent's (already
    /// up to date — see `partition`'s doc comment) bytes onto `target_node`.
    pub fn unpartition(&self, id: HandleId, target_node: NodeId) -> Result<()> {
        let slot = self.slot(id)?;
        let child_ids = {
            let mut record = slot.record.lock().unwrap();
            match std::mem::replace(&mut record.partition, PartitionState::Reconciling) {
                PartitionState::Partitioned(children) => children,
                other => {
                    record.partition = other;
                    return Err(RuntimeError::InvalidHandle("unpartition called on a non-partitioned handle"));
                }
            }
        };

        for &child in &child_ids {
            self.unregister_blocking_only(child)?;
        }

        for &child in &child_ids {
            if let Some(child_slot) = self.handles.lock().unwrap().remove(&child) {
                let mut child_record = child_slot.record.lock().unwrap();
                for (node_idx, replica) in child_record.replicas.iter_mut().enumerate() {
                    for plane in replica.planes.iter_mut() {
                        if let Some(buf) = plane.take() {
                            if buf.owned_by_runtime {
                                self.node(node_idx as NodeId).free(buf);
                            }
                        }
                    }
                }
            }
        }

        let mut record = slot.record.lock().unwrap();
        self.reconcile_ownership(&mut record, target_node);
        record.partition = PartitionState::Plain;
        Ok(())
    }

    fn unregister_blocking_only(&self, id: HandleId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut record = slot.record.lock().unwrap();
        loop {
            let busy = record
                .last_writer
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|j| !j.is_terminated())
                .unwrap_or(false)
                || record
                    .pending_readers
                    .iter()
                    .filter_map(Weak::upgrade)
                    .any(|j| !j.is_terminated());
            if !busy {
                return Ok(());
            }
            record = slot.idle_cond.wait(record).unwrap();
        }
    }

    /// `acquire(handle, mode)`/`release(handle)` (spec.md §4.1): synchronous
    /// main-thread coherence, bypassing the task/job machinery entirely.
    pub fn acquire(&self, id: HandleId, mode: AccessMode, node: NodeId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut record = slot.record.lock().unwrap();
        record.check_plain()?;
        self.fetch_one(&mut record, mode, node);
        Ok(())
    }

    pub fn release(&self, id: HandleId) -> Result<()> {
        self.slot(id)?;
        Ok(())
    }

    /// `data_get_sub_data(h, depth=1, idx)`.
    pub fn sub_handle(&self, id: HandleId, idx: usize) -> Result<HandleId> {
        let slot = self.slot(id)?;
        let record = slot.record.lock().unwrap();
        match &record.partition {
            PartitionState::Partitioned(children) => children
                .get(idx)
                .copied()
                .ok_or(RuntimeError::InvalidHandle("sub-data index out of range")),
            _ => Err(RuntimeError::InvalidHandle("handle is not partitioned")),
        }
    }

    pub fn owner_node(&self, id: HandleId) -> Result<Option<NodeId>> {
        let slot = self.slot(id)?;
        Ok(slot.record.lock().unwrap().owner_node())
    }

    pub fn with_host_bytes<R>(&self, id: HandleId, node: NodeId, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let slot = self.slot(id)?;
        let record = slot.record.lock().unwrap();
        let plane = record.replicas[node as usize]
            .planes
            .first()
            .and_then(|p| p.as_ref())
            .ok_or(RuntimeError::InvalidHandle("handle has no allocated replica on that node"))?;
        Ok(f(plane.as_slice()))
    }
}
