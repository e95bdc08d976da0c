//! Per-node task-count and scratch-size planning (spec §4.5 "For each node
//! the planner sets").

use crate::context::{Context, TensorId};
use crate::types::{ElemType, OpTag};

/// How many workers may run this node's COMPUTE phase in parallel.
pub fn task_count(op: OpTag, n_threads: usize, external_blas_applies: bool) -> usize {
    if op.is_view_like() {
        return 1;
    }
    if op == OpTag::MulMat && external_blas_applies {
        return 1;
    }
    n_threads.max(1)
}

/// Conservative upper bound on temporary bytes this node's kernel needs,
/// aggregated across workers (spec §4.5 "scratch requirement").
pub fn scratch_bytes(ctx: &Context, node: TensorId, n_threads: usize) -> usize {
    let header = ctx.tensor(node);
    match header.op {
        OpTag::MulMat => {
            let Some(a) = header.src[0] else { return 0 };
            let lhs = ctx.tensor(a);
            if !lhs.elem_type.is_quantized() {
                return 0;
            }
            let dot_type = lhs.elem_type.dot_type().unwrap_or(ElemType::F32);
            let block_bytes = dot_type.block_size();
            let rhs_elements: usize = header.shape.iter().product();
            block_bytes * rhs_elements / dot_type.block_len().max(1)
        }
        OpTag::FlashAttn => {
            const UNROLL: usize = 32;
            let m = header.shape[1];
            let rounded = round_up(m, UNROLL);
            2 * rounded * n_threads * std::mem::size_of::<f32>()
        }
        _ => 0,
    }
}

fn round_up(x: usize, align: usize) -> usize {
    (x + align - 1) / align * align
}

/// Total scratch to reserve for a whole graph run: the maximum single-node
/// requirement plus one cache line of padding per worker.
pub fn aggregate_scratch(ctx: &Context, graph: &[TensorId], n_threads: usize) -> usize {
    const CACHE_LINE: usize = 64;
    let max_node = graph.iter().map(|&t| scratch_bytes(ctx, t, n_threads)).max().unwrap_or(0);
    max_node + CACHE_LINE * n_threads
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn view_like_ops_are_single_task() {
        assert_eq!(task_count(OpTag::View, 8, false), 1);
        assert_eq!(task_count(OpTag::Scale, 8, false), 1);
    }

    #[test]
    fn elementwise_ops_use_all_threads() {
        assert_eq!(task_count(OpTag::Add, 8, false), 8);
    }

    #[test]
    fn external_blas_collapses_mul_mat_to_one_task() {
        assert_eq!(task_count(OpTag::MulMat, 8, true), 1);
    }

    #[test]
    fn dense_mul_mat_needs_no_scratch() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [4, 4, 1, 1], true).unwrap();
        let b = ctx.new_tensor(ElemType::F32, [4, 4, 1, 1], true).unwrap();
        let c = ctx.new_tensor(ElemType::F32, [4, 4, 1, 1], true).unwrap();
        ctx.set_op(c, OpTag::MulMat, [Some(a), Some(b)], [None; 4]);
        assert_eq!(scratch_bytes(&ctx, c, 4), 0);
    }
}
