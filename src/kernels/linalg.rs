//! MUL_MAT and OUT_PROD (spec §4.4 "Linear algebra").
//!
//! `a`'s element type decides the path: dense `F32` dots straight off the
//! payload, a quantized type dispatches through `quant::dispatch` — the
//! activation row is quantized to `a`'s companion `dot_type` on the fly and
//! the two sides are dotted with the codec's own `vec_dot` kernel, matching
//! the way a quantized weight matrix is actually multiplied (spec §4.2
//! "Dispatch table").

use super::row_range;
use crate::context::{Context, TensorId};
use crate::errors::GgmxResult;
use crate::exec::{ComputeParams, Phase};
use crate::numeric;
use crate::quant;

/// `c[i2,i3] = a[i2,i3]^T @ b[i2,i3]` per spec §4.4 `mul_mat` shape rule:
/// `a: [k, m, s2, s3]`, `b: [k, n, s2, s3]`, `c: [m, n, s2, s3]`. Rows of
/// `c` (the `n` dimension) are partitioned across workers.
pub fn mul_mat(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (a_id, b_id, k, m, n, batches, a_type) = {
        let h = ctx.tensor(node);
        let a_id = h.src[0].expect("MulMat has lhs");
        let b_id = h.src[1].expect("MulMat has rhs");
        let a = ctx.tensor(a_id);
        (a_id, b_id, a.shape[0], a.shape[1], h.shape[1], h.shape[2] * h.shape[3], a.elem_type)
    };
    let b = ctx.payload_f32(b_id).map(|s| s.to_vec()).unwrap_or_default();
    let total_rows = n * batches;
    let (lo, hi) = row_range(total_rows, params.ith, params.nth);

    if a_type.is_quantized() {
        let entry = quant::dispatch::entry(a_type).expect("quantized ElemType has a dispatch entry");
        let vec_dot = entry.vec_dot.expect("mul_mat requires a vec_dot kernel for this weight type");
        let dot_type = a_type.dot_type().expect("quantized mul_mat weight has a companion dot type");
        let dot_entry = quant::dispatch::entry(dot_type).expect("dot_type has a dispatch entry");
        let nblocks = quant::check_block_aligned(k, a_type.block_len())?;
        quant::check_even_blocks(nblocks)?;
        let a_bytes = ctx.payload(a_id).map(|s| s.to_vec()).unwrap_or_default();
        let a_row_bytes = nblocks * a_type.block_size();
        // This worker's exclusive slice of the executor's scratch buffer
        // (spec §4.5 "scratch requirement"), big enough for one quantized
        // activation row; falls back to a private allocation if the planner
        // under-sized it for this row.
        let chunk = if params.nth > 0 { params.wsize / params.nth } else { params.wsize };
        let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
        for row in lo..hi {
            let batch = row / n;
            let j = row % n;
            let b_batch = &b[batch * k * n..(batch + 1) * k * n];
            let b_row = &b_batch[j * k..(j + 1) * k];
            let b_row_q = (dot_entry.quantize_reference)(b_row);
            let b_row_bytes: &[u8] = if !params.wdata.is_null() && b_row_q.len() <= chunk {
                // SAFETY: workers partition this node's COMPUTE phase by
                // `(ith, nth)` and each only ever touches the
                // `[ith*chunk, (ith+1)*chunk)` byte range of the buffer.
                let region =
                    unsafe { std::slice::from_raw_parts_mut(params.wdata.add(params.ith * chunk), b_row_q.len()) };
                region.copy_from_slice(&b_row_q);
                region
            } else {
                &b_row_q
            };
            for i in 0..m {
                let a_row = &a_bytes[(batch * m + i) * a_row_bytes..(batch * m + i + 1) * a_row_bytes];
                dst[batch * m * n + j * m + i] = vec_dot(k, a_row, b_row_bytes);
            }
        }
        return Ok(());
    }

    let a = ctx.payload_f32(a_id).map(|s| s.to_vec()).unwrap_or_default();
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for row in lo..hi {
        let batch = row / n;
        let j = row % n;
        let a_batch = &a[batch * k * m..(batch + 1) * k * m];
        let b_batch = &b[batch * k * n..(batch + 1) * k * n];
        let b_row = &b_batch[j * k..(j + 1) * k];
        for i in 0..m {
            let a_row = &a_batch[i * k..(i + 1) * k];
            dst[batch * m * n + j * m + i] = numeric::dot(a_row, b_row);
        }
    }
    Ok(())
}

/// `c = a @ b^T` (spec §4.4 `out_prod`), used by MUL_MAT's backward rule.
pub fn out_prod(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (a_id, b_id, m, n) = {
        let h = ctx.tensor(node);
        let a_id = h.src[0].expect("OutProd has lhs");
        let b_id = h.src[1].expect("OutProd has rhs");
        (a_id, b_id, h.shape[0], h.shape[1])
    };
    let a = ctx.payload_f32(a_id).map(|s| s.to_vec()).unwrap_or_default();
    let b = ctx.payload_f32(b_id).map(|s| s.to_vec()).unwrap_or_default();
    let (lo, hi) = row_range(n, params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for j in lo..hi {
        for i in 0..m {
            dst[j * m + i] = a[i] * b[j];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::types::{ElemType, OpTag};

    #[test]
    fn mul_mat_computes_dot_products() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [2, 2, 1, 1], true).unwrap();
        let b = ctx.new_tensor(ElemType::F32, [2, 1, 1, 1], true).unwrap();
        ctx.payload_f32_mut(a).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        ctx.payload_f32_mut(b).unwrap().copy_from_slice(&[1.0, 1.0]);
        let c = ctx.new_tensor(ElemType::F32, [2, 1, 1, 1], true).unwrap();
        ctx.set_op(c, OpTag::MulMat, [Some(a), Some(b)], [None; 4]);
        mul_mat(&mut ctx, c, ComputeParams { phase: Phase::Compute, ith: 0, nth: 1, wsize: 0, wdata: std::ptr::null_mut() }).unwrap();
        assert_eq!(ctx.payload_f32(c).unwrap(), &[3.0, 7.0]);
    }
}
