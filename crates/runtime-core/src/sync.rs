//! Reusable synchronization primitives for parallel-task execution (spec.md
//! §4.2 "Parallel tasks").
//!
//! Adapted from the teacher's `Mutex`/`Condvar` count-down latch
//! (`src/lib/scheduler/src/sync/count_down_latch.rs`). That latch supports
//! cloning counters/waiters across generations because the teacher reuses
//! one latch pair across many simulation rounds; a job's before/after-work
//! barriers are simpler — the party count (`task_size`) is fixed at job
//! creation and the barrier is used exactly once — so this is a
//! single-generation version of the same design rather than a re-export.

use std::sync::{Condvar, Mutex};

/// A one-shot barrier for exactly `parties` threads. `arrive_and_wait`
/// blocks until all parties have called it once.
#[derive(Debug)]
pub struct PartyBarrier {
    state: Mutex<usize>,
    parties: usize,
    cond: Condvar,
}

impl PartyBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            state: Mutex::new(0),
            parties,
            cond: Condvar::new(),
        }
    }

    /// Blocks the calling thread until `parties` calls have been made in
    /// total. Returns `true` to exactly one caller (the one that observed
    /// the barrier complete), mirroring `std::sync::Barrier`'s leader
    /// election, so callers can pick a single thread to do post-barrier
    /// cleanup.
    pub fn arrive_and_wait(&self) -> bool {
        let mut arrived = self.state.lock().unwrap();
        *arrived += 1;
        if *arrived == self.parties {
            self.cond.notify_all();
            true
        } else {
            let _unused = self.cond.wait_while(arrived, |n| *n < self.parties).unwrap();
            false
        }
    }
}

/// A counter that must be driven to zero by exactly as many decrements as
/// its initial value, used for the post-execution "busy barrier" (spec.md
/// §4.2): the rank-0 worker may only retire a parallel job's memory once
/// every alias has left its blocking wait.
#[derive(Debug)]
pub struct BusyBarrier {
    state: Mutex<usize>,
    cond: Condvar,
}

impl BusyBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            state: Mutex::new(parties),
            cond: Condvar::new(),
        }
    }

    /// Called by each alias as it exits. Returns `true` to the caller that
    /// drives the count to zero.
    pub fn leave(&self) -> bool {
        let mut remaining = self.state.lock().unwrap();
        *remaining = remaining.checked_sub(1).expect("BusyBarrier::leave called more times than parties");
        let done = *remaining == 0;
        if done {
            self.cond.notify_all();
        }
        done
    }

    /// Blocks until every alias has called `leave`.
    pub fn wait_until_empty(&self) {
        let guard = self.state.lock().unwrap();
        let _unused = self.cond.wait_while(guard, |n| *n > 0).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn party_barrier_releases_all() {
        let barrier = Arc::new(PartyBarrier::new(4));
        let leaders: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || barrier.arrive_and_wait())
            })
            .collect();
        let leader_count = leaders.into_iter().map(|h| h.join().unwrap()).filter(|&b| b).count();
        assert_eq!(leader_count, 1);
    }

    #[test]
    fn busy_barrier_fires_once() {
        let barrier = Arc::new(BusyBarrier::new(3));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || barrier.leave())
            })
            .collect();
        let done_count = handles.into_iter().map(|h| h.join().unwrap()).filter(|&b| b).count();
        assert_eq!(done_count, 1);
    }
}
