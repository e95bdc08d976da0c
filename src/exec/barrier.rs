//! Sense-reversing phase barrier (spec §4.5 "Leader election at barrier").
//!
//! The worker that completes the last arrival for a round becomes the
//! "coordinator" for that round: it alone is given the chance to run a
//! serial action (`wait_with_leader_action`) before the round's generation
//! is published and the rest of the pool is released. This mirrors the
//! `n_active`/`node_n` pair from spec §4.5, collapsed into two atomics.

use std::sync::atomic::{AtomicUsize, Ordering};

pub struct PhaseBarrier {
    n_threads: usize,
    count: AtomicUsize,
    generation: AtomicUsize,
}

impl PhaseBarrier {
    pub fn new(n_threads: usize) -> Self {
        Self { n_threads, count: AtomicUsize::new(0), generation: AtomicUsize::new(0) }
    }

    /// Plain rendezvous: every worker blocks until all `n_threads` arrive.
    pub fn wait(&self) {
        self.wait_with_leader_action(|| {})
    }

    /// Rendezvous where the last arrival (and only the last arrival) runs
    /// `action` before the round is published — used for INIT/FINALIZE,
    /// which the spec requires exactly one worker to execute per node.
    pub fn wait_with_leader_action(&self, action: impl FnOnce()) {
        let gen = self.generation.load(Ordering::SeqCst);
        let prev = self.count.fetch_add(1, Ordering::SeqCst);
        if prev + 1 == self.n_threads {
            action();
            self.count.store(0, Ordering::SeqCst);
            self.generation.fetch_add(1, Ordering::SeqCst);
        } else {
            while self.generation.load(Ordering::SeqCst) == gen {
                std::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn leader_action_runs_exactly_once_per_round() {
        let barrier = PhaseBarrier::new(4);
        let hits = AtomicI32::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                let barrier = &barrier;
                let hits = &hits;
                s.spawn(|| barrier.wait_with_leader_action(|| { hits.fetch_add(1, Ordering::SeqCst); }));
            }
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
