//! Stable error kinds surfaced by the runtime (spec.md §7).
//!
//! These are the only error variants callers should need to match on; new
//! internal failure modes should be folded into one of these rather than
//! adding variants, since the set is meant to stay stable across releases.

use thiserror::Error;

use crate::memory::NodeId;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No worker can execute this task: `codelet.where ∩ context.workers == ∅`.
    #[error("no device available to run this task (context has no worker of a compatible kind)")]
    NoDevice,

    /// A memory node's allocator is exhausted even after attempting eviction.
    #[error("out of memory on node {node:?} (requested {requested} bytes)")]
    OutOfMemory { node: NodeId, requested: usize },

    /// Use-after-unregister, wrong interface kind, or access while partitioned.
    #[error("invalid handle use: {0}")]
    InvalidHandle(&'static str),

    /// Double-submit, submit-after-shutdown, barrier misuse, and similar
    /// misuse of the runtime's state machine.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// A user kernel signalled failure (return value, or explicit API call).
    #[error("kernel aborted: {0}")]
    AbortKernel(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Logs a structured message and aborts the process. Used for invariant
/// violations that spec.md §7 classifies as fatal (replica state
/// inconsistency, scheduler-tree parent mismatch): recovery across an
/// invariant break is not attempted, matching the teacher's
/// `debug_assert!`-and-abort treatment of corrupted internal state
/// (`src/main/core/work/task.rs`'s magic-number guard).
#[track_caller]
pub fn fatal_invariant(what: &str) -> ! {
    log::error!("fatal invariant violation: {what} (at {})", std::panic::Location::caller());
    std::process::abort()
}
