//! Memory nodes and node operations (spec.md §3 "Memory Node", §4.1 transfer
//! scheduling).
//!
//! Grounded on the teacher's raw-pointer-across-threads idiom
//! (`src/main/utility/mod.rs::SyncSendPointer`) and its per-node accounting
//! style (`src/main/core/cpu.rs`, `LIMIT_CPU_MEM`-style allocator caps in
//! `core/configuration.rs`). This is the CPU-only reference backend spec.md
//! §2 budgets for: every node is host RAM (NUMA-addressable by `NodeId`),
//! and device nodes are left to a backend that isn't in scope here — the
//! trait is written so a GPU backend can implement `NodeOps` without
//! touching the coherency layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{RuntimeError, Result};

/// Dense small integer identifying a memory node. Node 0 is host RAM.
pub type NodeId = u16;

pub const HOST_NODE: NodeId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    HostRam,
    PinnedHost,
    Device,
    Mapped,
}

/// A raw byte-addressable allocation on a node. Mirrors the teacher's
/// `SyncSendPointer` pattern: a raw pointer wrapped so it can cross thread
/// boundaries, with the invariant (upheld by `MemoryNode`) that only one
/// owner frees it.
#[derive(Debug)]
pub struct NodeBuffer {
    ptr: SyncSendPtr,
    pub len: usize,
    /// False for buffers backing a user's `register()`ed memory: freeing the
    /// handle must not free memory the runtime doesn't own.
    pub owned_by_runtime: bool,
}

#[derive(Debug)]
struct SyncSendPtr(*mut u8);
// SAFETY: buffers are only ever accessed while the owning handle's
// serialization primitive is held (or, for registered buffers, the caller
// guarantees exclusive access per spec.md §4.1 acquire/release semantics).
unsafe impl Send for SyncSendPtr {}
unsafe impl Sync for SyncSendPtr {}

impl NodeBuffer {
    /// Wraps an existing, externally-owned allocation (used by `register`).
    ///
    /// # Safety
    /// `ptr` must be valid for reads/writes of `len` bytes for as long as
    /// the resulting buffer (and any handle built from it) is in use.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr: SyncSendPtr(ptr),
            len,
            owned_by_runtime: false,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: see type-level invariant.
        unsafe { std::slice::from_raw_parts(self.ptr.0, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see type-level invariant.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.0, self.len) }
    }
}

/// A labelled memory region with an allocator and copy primitives. Backend
/// implementations (CUDA, OpenCL, ...) implement this trait; the coherency
/// layer only ever talks to nodes through it.
pub trait NodeOps: Send + Sync {
    fn id(&self) -> NodeId;
    fn kind(&self) -> NodeKind;

    /// Allocates `size` bytes, retrying once after `on_pressure` runs if the
    /// first attempt hits the node's configured cap (spec.md §4.1 "Failures").
    fn allocate(&self, size: usize) -> Result<NodeBuffer>;

    /// Frees a runtime-owned allocation. No-op (and logged) for
    /// non-runtime-owned buffers, since those belong to the registering
    /// caller.
    fn free(&self, buf: NodeBuffer);

    /// True if this node can DMA directly to/from `other` without staging
    /// through host RAM (spec.md §4.1 "direct-access capabilities"). The
    /// CPU-only backend reports `true` for any other host node.
    fn can_direct_access(&self, other: NodeId) -> bool;

    /// Synchronous 1-D copy from `src` into this node's `dst` buffer.
    /// Transfer *scheduling* (staging, async completion) lives in
    /// `data::coherence`; nodes only perform the raw copy.
    fn copy_from(&self, dst: &mut NodeBuffer, src: &NodeBuffer);

    /// Bytes currently allocated on this node.
    fn used_bytes(&self) -> usize;

    fn cap_bytes(&self) -> Option<usize>;
}

/// The CPU-only reference node: a plain capped heap allocator over the
/// process's own address space (no separate device memory to model).
pub struct HostNode {
    id: NodeId,
    cap_bytes: Option<usize>,
    used_bytes: AtomicUsize,
    // kept so total accounting survives even though individual buffers are
    // owned by their `NodeBuffer` handles; used only for diagnostics.
    live_allocations: Mutex<HashMap<usize, usize>>,
}

impl HostNode {
    pub fn new(id: NodeId, cap_bytes: Option<usize>) -> Self {
        Self {
            id,
            cap_bytes,
            used_bytes: AtomicUsize::new(0),
            live_allocations: Mutex::new(HashMap::new()),
        }
    }
}

impl NodeOps for HostNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::HostRam
    }

    fn allocate(&self, size: usize) -> Result<NodeBuffer> {
        if let Some(cap) = self.cap_bytes {
            if self.used_bytes.load(Ordering::Relaxed) + size > cap {
                return Err(RuntimeError::OutOfMemory {
                    node: self.id,
                    requested: size,
                });
            }
        }

        let mut storage = vec![0u8; size].into_boxed_slice();
        let ptr = storage.as_mut_ptr();
        let addr = ptr as usize;
        std::mem::forget(storage);

        self.used_bytes.fetch_add(size, Ordering::Relaxed);
        self.live_allocations.lock().unwrap().insert(addr, size);

        log::trace!("node {}: allocated {size} bytes at {addr:#x}", self.id);

        // SAFETY: we just allocated this buffer and own it exclusively.
        Ok(unsafe { NodeBuffer::from_raw(ptr, size) }.mark_runtime_owned())
    }

    fn free(&self, buf: NodeBuffer) {
        if !buf.owned_by_runtime {
            log::trace!("node {}: skipping free of non-runtime-owned buffer", self.id);
            return;
        }
        let addr = buf.as_ptr() as usize;
        let len = buf.len;
        // SAFETY: this buffer was produced by `allocate` above, as a
        // `Box<[u8]>` of length `len` that was `mem::forget`-ten.
        unsafe {
            drop(Box::from_raw(std::slice::from_raw_parts_mut(buf.as_ptr(), len)));
        }
        self.used_bytes.fetch_sub(len, Ordering::Relaxed);
        self.live_allocations.lock().unwrap().remove(&addr);
        log::trace!("node {}: freed {len} bytes at {addr:#x}", self.id);
    }

    fn can_direct_access(&self, _other: NodeId) -> bool {
        // all nodes in the CPU-only backend are host RAM: every pair can
        // "DMA" (memcpy) directly.
        true
    }

    fn copy_from(&self, dst: &mut NodeBuffer, src: &NodeBuffer) {
        debug_assert_eq!(dst.len, src.len);
        dst.as_mut_slice().copy_from_slice(src.as_slice());
    }

    fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    fn cap_bytes(&self) -> Option<usize> {
        self.cap_bytes
    }
}

impl NodeBuffer {
    fn mark_runtime_owned(mut self) -> Self {
        self.owned_by_runtime = true;
        self
    }
}

/// Strided 2-D copy, used by matrix/CSR plane transfers whose source and
/// destination layouts differ only in leading dimension (spec.md §3 "2-D
/// strided" node op).
pub fn copy_2d_strided(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    src_stride: usize,
    row_bytes: usize,
    rows: usize,
) {
    for r in 0..rows {
        let d = &mut dst[r * dst_stride..r * dst_stride + row_bytes];
        let s = &src[r * src_stride..r * src_stride + row_bytes];
        d.copy_from_slice(s);
    }
}
