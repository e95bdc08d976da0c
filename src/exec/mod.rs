//! L5: graph executor (spec §4.5 "Executor").
//!
//! Workers are real OS threads parked for the lifetime of one `run()` call,
//! synchronized by [`PhaseBarrier`] rather than `rayon` — the protocol
//! (leader election, INIT/COMPUTE/FINALIZE, `(ith, nth)` row partitioning)
//! is specified precisely enough that a generic work-stealing pool would
//! hide rather than express it. Workers share the context through a raw
//! pointer for the duration of the scope, the way distributed inference
//! engines split one allocation across per-device worker threads.

mod barrier;
pub mod planner;

pub use barrier::PhaseBarrier;

use crate::context::{Context, TensorId};
use crate::errors::GgmxResult;
use crate::kernels;
use crate::sys;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Compute,
    Finalize,
}

/// Per-worker descriptor handed to a kernel (spec §4.5 `compute_params`).
/// `wdata`/`wsize` address this node's slice of the aggregated scratch
/// buffer (sized by [`planner::aggregate_scratch`]); kernels that need no
/// scratch simply ignore them. `wdata` is null when `wsize` is 0.
#[derive(Debug, Clone, Copy)]
pub struct ComputeParams {
    pub phase: Phase,
    pub ith: usize,
    pub nth: usize,
    pub wsize: usize,
    pub wdata: *mut u8,
}

/// Wrapper asserting a raw pointer may cross the scoped-thread boundary.
/// Sound here because the executor only ever hands out disjoint byte ranges
/// of the buffer it points into (see `Executor::run`'s worker loop).
#[derive(Clone, Copy)]
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}

pub struct Executor {
    n_threads: usize,
    external_blas: bool,
}

impl Executor {
    pub fn new(n_threads: usize) -> Self {
        Self { n_threads: n_threads.max(1), external_blas: false }
    }

    /// Enables the external-BLAS/GPU fast path for MUL_MAT nodes (spec §6
    /// "External BLAS/GPU hooks") — collapses their task count to 1.
    pub fn with_external_blas(mut self, enabled: bool) -> Self {
        self.external_blas = enabled;
        self
    }

    /// Runs every node of an already topologically sorted `graph` to
    /// completion. Graph execution ends when every worker has observed
    /// `node_n >= graph.len()`.
    pub fn run(&self, ctx: &mut Context, graph: &[TensorId]) -> GgmxResult<()> {
        sys::warn_if_numa_balancing_enabled();
        let topology = sys::numa_topology();

        if self.n_threads == 1 {
            let mut scratch = vec![0u8; planner::aggregate_scratch(ctx, graph, 1)];
            let scratch_ptr = scratch.as_mut_ptr();
            for &node in graph {
                let task_count = planner::task_count(ctx.tensor(node).op, 1, self.external_blas);
                let wsize = planner::scratch_bytes(ctx, node, task_count);
                let wdata = if wsize > 0 { scratch_ptr } else { std::ptr::null_mut() };
                let params = |phase| ComputeParams { phase, ith: 0, nth: task_count, wsize, wdata };
                kernels::run_phase(ctx, node, params(Phase::Init))?;
                kernels::run_phase(ctx, node, params(Phase::Compute))?;
                kernels::run_phase(ctx, node, params(Phase::Finalize))?;
            }
            return Ok(());
        }

        let barrier = PhaseBarrier::new(self.n_threads);
        let node_n = AtomicUsize::new(0);
        let n_threads = self.n_threads;
        let external_blas = self.external_blas;
        let first_err: std::sync::Mutex<Option<crate::errors::GgmxError>> = std::sync::Mutex::new(None);
        let mut scratch = vec![0u8; planner::aggregate_scratch(ctx, graph, n_threads)];
        let scratch_ptr = SendPtr(scratch.as_mut_ptr());

        std::thread::scope(|scope| {
            for ith in 0..n_threads {
                let barrier = &barrier;
                let node_n = &node_n;
                let topology = &topology;
                let first_err = &first_err;
                let ctx_ptr = SendPtr(ctx as *mut Context);
                let scratch_ptr = scratch_ptr;

                scope.spawn(move || {
                    pin_to_numa_node(&topology, ith, n_threads);
                    loop {
                        let idx = node_n.load(Ordering::SeqCst);
                        if idx >= graph.len() {
                            break;
                        }
                        let node = graph[idx];
                        // SAFETY: every worker reads the same node's header
                        // (small, Copy-ish fields) and writes only its own
                        // `(ith, nth)` row strip of the output payload, a
                        // partition enforced by the kernel's own row-range
                        // arithmetic. The two barrier rounds below ensure no
                        // worker observes a node before FINALIZE of the
                        // previous one has completed (happens-before via
                        // SeqCst). The scratch buffer is sized once up front
                        // to the whole graph's maximum per-node requirement,
                        // so every node's `wdata` points at the same base;
                        // kernels that touch it partition by `(ith, nth)`
                        // exactly as they do for payload rows.
                        let ctx_ref = unsafe { &mut *ctx_ptr.0 };
                        let op = ctx_ref.tensor(node).op;
                        let task_count = planner::task_count(op, n_threads, external_blas);
                        let wsize = planner::scratch_bytes(ctx_ref, node, task_count);
                        let wdata = if wsize > 0 { scratch_ptr.0 } else { std::ptr::null_mut() };

                        barrier.wait_with_leader_action(|| {
                            if let Err(e) = kernels::run_phase(ctx_ref, node, ComputeParams { phase: Phase::Init, ith: 0, nth: task_count, wsize, wdata }) {
                                *first_err.lock().unwrap() = Some(e);
                            }
                        });

                        if ith < task_count {
                            if let Err(e) = kernels::run_phase(ctx_ref, node, ComputeParams { phase: Phase::Compute, ith, nth: task_count, wsize, wdata }) {
                                *first_err.lock().unwrap() = Some(e);
                            }
                        }

                        barrier.wait_with_leader_action(|| {
                            if let Err(e) = kernels::run_phase(ctx_ref, node, ComputeParams { phase: Phase::Finalize, ith: 0, nth: task_count, wsize, wdata }) {
                                *first_err.lock().unwrap() = Some(e);
                            }
                            node_n.store(idx + 1, Ordering::SeqCst);
                        });
                    }
                });
            }
        });

        match first_err.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(target_os = "linux")]
fn pin_to_numa_node(topology: &sys::NumaTopology, ith: usize, n_threads: usize) {
    if topology.node_count() < 2 {
        return;
    }
    let node = topology.node_for_worker(ith, n_threads);
    tracing::debug!(ith, node, "numa affinity assigned (advisory; no cpuset applied)");
}

#[cfg(not(target_os = "linux"))]
fn pin_to_numa_node(_topology: &sys::NumaTopology, _ith: usize, _n_threads: usize) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::graph::Builder;
    use crate::types::ElemType;

    #[test]
    fn single_and_multi_threaded_runs_agree() {
        for n_threads in [1, 4] {
            let mut ctx = Context::init(1 << 16, None, false).unwrap();
            let a = ctx.new_tensor(ElemType::F32, [8, 1, 1, 1], true).unwrap();
            let b = ctx.new_tensor(ElemType::F32, [8, 1, 1, 1], true).unwrap();
            ctx.payload_f32_mut(a).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
            ctx.payload_f32_mut(b).unwrap().copy_from_slice(&[8.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0]);
            let mut bld = Builder::new(&mut ctx, false);
            let c = bld.add(a, b).unwrap();
            let exec = Executor::new(n_threads);
            exec.run(&mut ctx, &[a, b, c]).unwrap();
            assert_eq!(ctx.payload_f32(c).unwrap(), &[9.0; 8]);
        }
    }
}
