//! Data handles, per-node replicas, and interface descriptors (spec.md §3
//! "Data Handle", §9 "Handle graph cycles & ownership").
//!
//! Handles live in a flat arena (`DataManager::handles`) indexed by
//! `HandleId`, with parent/child partition links as indices rather than
//! real pointers/`Rc` cycles — the Design Notes call this out explicitly,
//! and it mirrors the teacher's own preference for index-based graphs over
//! reference cycles (`src/main/network/graph/mod.rs` keeps a `petgraph`
//! graph and hands out node indices rather than sharing `Rc<RefCell<_>>`
//! nodes directly).

use std::sync::Weak;

use crate::error::{RuntimeError, Result};
use crate::job::Job;
use crate::memory::{NodeBuffer, NodeId};
use crate::task::AccessMode;

pub type HandleId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Invalid,
    Shared,
    Owner,
}

/// A handle's materialization on one memory node. A replica may span
/// several byte "planes" (e.g. CSR's `nzval`/`colind`/`rowptr`); all planes
/// of a replica share one coherence state, since spec.md's protocol
/// operates at handle granularity.
pub struct Replica {
    pub state: ReplicaState,
    pub planes: Vec<Option<NodeBuffer>>,
    /// Count of in-flight outgoing transfers reading from this replica.
    /// Non-zero pins it against invalidation (spec.md §3 invariant).
    pub outgoing_transfers: u32,
}

impl Replica {
    fn invalid(num_planes: usize) -> Self {
        Self {
            state: ReplicaState::Invalid,
            planes: (0..num_planes).map(|_| None).collect(),
            outgoing_transfers: 0,
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.planes.iter().any(|p| p.is_some())
    }
}

/// Type-tagged interface descriptor (spec.md §3).
#[derive(Debug, Clone)]
pub enum Interface {
    Vector { len: usize, elem_size: usize },
    Matrix { rows: usize, cols: usize, elem_size: usize },
    Csr { nrows: usize, nnz: usize, elem_size: usize },
    /// Catch-all for interface kinds this reference backend doesn't give a
    /// dedicated variant to (spec.md's "block of blocks, …"): callers
    /// describe their own plane layout directly.
    Other { planes: Vec<usize> },
}

impl Interface {
    /// Byte size of each storage "plane" this interface needs per replica.
    pub fn plane_byte_sizes(&self) -> Vec<usize> {
        match self {
            Interface::Vector { len, elem_size } => vec![len * elem_size],
            Interface::Matrix { rows, cols, elem_size } => vec![rows * cols * elem_size],
            Interface::Csr { nrows, nnz, elem_size } => vec![
                nnz * elem_size,       // nzval
                nnz * 4,               // colind (u32)
                (nrows + 1) * 4,       // rowptr (u32)
            ],
            Interface::Other { planes } => planes.clone(),
        }
    }
}

#[derive(Clone)]
pub enum PartitionState {
    Plain,
    Partitioned(Vec<HandleId>),
    Reconciling,
}

pub struct HandleRecord {
    pub id: HandleId,
    pub interface: Interface,
    /// Replicas indexed by `NodeId`; grows lazily as nodes are touched.
    pub replicas: Vec<Replica>,
    pub home_node: NodeId,
    pub partition: PartitionState,
    pub parent: Option<HandleId>,
    /// The most recent job submitted with a conflicting (W/RW/SCRATCH/REDUX)
    /// access, if it hasn't terminated yet — every later access must depend
    /// on it (spec.md §4.2 "sequential consistency per handle").
    pub last_writer: Option<Weak<Job>>,
    /// Jobs submitted with R access since `last_writer`, that may run
    /// concurrently with each other but must complete before the next
    /// conflicting access (spec.md §8 invariant 2).
    pub pending_readers: Vec<Weak<Job>>,
}

impl HandleRecord {
    pub fn new(id: HandleId, interface: Interface, initial_node: NodeId, num_nodes: usize) -> Self {
        let num_planes = interface.plane_byte_sizes().len();
        let mut replicas: Vec<Replica> = (0..num_nodes).map(|_| Replica::invalid(num_planes)).collect();
        // the registering node starts as OWNER with no runtime-allocated
        // storage of its own — its "storage" is filled in by the caller of
        // `register` directly.
        replicas[initial_node as usize].state = ReplicaState::Owner;
        Self {
            id,
            interface,
            replicas,
            home_node: initial_node,
            partition: PartitionState::Plain,
            parent: None,
            last_writer: None,
            pending_readers: Vec::new(),
        }
    }

    /// Records a new access to this handle and returns the jobs the new
    /// access must wait on (spec.md §4.2). Call this once per submitted
    /// task binding, in submission order.
    pub fn record_access(&mut self, job: &std::sync::Arc<Job>, mode: AccessMode) -> Vec<Weak<Job>> {
        let mut deps: Vec<Weak<Job>> = Vec::new();
        if let Some(w) = &self.last_writer {
            if w.upgrade().map(|j| !j.is_terminated()).unwrap_or(false) {
                deps.push(w.clone());
            }
        }

        let conflicting = mode.intersects(AccessMode::W | AccessMode::RW | AccessMode::SCRATCH | AccessMode::REDUX);
        if conflicting {
            for r in self.pending_readers.drain(..) {
                if r.upgrade().map(|j| !j.is_terminated()).unwrap_or(false) {
                    deps.push(r);
                }
            }
            self.last_writer = Some(std::sync::Arc::downgrade(job));
        } else {
            self.pending_readers.push(std::sync::Arc::downgrade(job));
        }

        deps
    }

    pub fn ensure_node(&mut self, node: NodeId, num_planes: usize) {
        let idx = node as usize;
        if idx >= self.replicas.len() {
            self.replicas.resize_with(idx + 1, || Replica::invalid(num_planes));
        }
    }

    pub fn owner_node(&self) -> Option<NodeId> {
        self.replicas
            .iter()
            .position(|r| r.state == ReplicaState::Owner)
            .map(|i| i as NodeId)
    }

    pub fn check_plain(&self) -> Result<()> {
        match self.partition {
            PartitionState::Plain => Ok(()),
            PartitionState::Partitioned(_) => {
                Err(RuntimeError::InvalidHandle("handle is partitioned; access its sub-handles"))
            }
            PartitionState::Reconciling => Err(RuntimeError::InvalidHandle("handle is reconciling a partition")),
        }
    }
}
