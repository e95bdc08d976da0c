//! L6: per-operator kernels (spec §4.5 "Partitioning discipline").
//!
//! Every kernel is reached through [`run_phase`], which matches on the
//! node's `OpTag` and only does work during the phase(s) that op actually
//! needs — most ops are COMPUTE-only, a few (view-like) need none at all.
//! Operand reads are copied out (`to_vec`) before the destination slice is
//! borrowed mutably, since a tensor's own payload may alias one of its
//! operands (in-place ops) and the borrow checker cannot see through the
//! arena's byte-offset indirection.

mod advanced;
mod custom;
mod linalg;
mod norm;
mod softmax;

use crate::context::{Context, TensorId};
use crate::errors::GgmxResult;
use crate::exec::{ComputeParams, Phase};
use crate::numeric;
use crate::types::OpTag;

/// `dr = ceil(nr/nth); ir0 = dr*ith; ir1 = min(ir0+dr, nr)` (spec §4.5
/// "Partitioning discipline").
pub(crate) fn row_range(nr: usize, ith: usize, nth: usize) -> (usize, usize) {
    let dr = (nr + nth.max(1) - 1) / nth.max(1);
    let ir0 = (dr * ith).min(nr);
    let ir1 = (ir0 + dr).min(nr);
    (ir0, ir1)
}

fn decompose(flat: usize, shape: [usize; 4]) -> [usize; 4] {
    let mut idx = [0usize; 4];
    let mut rem = flat;
    for k in 0..4 {
        idx[k] = rem % shape[k].max(1);
        rem /= shape[k].max(1);
    }
    idx
}

fn recompose(idx: [usize; 4], shape: [usize; 4]) -> usize {
    let mut flat = 0;
    let mut mult = 1;
    for k in 0..4 {
        flat += idx[k] * mult;
        mult *= shape[k].max(1);
    }
    flat
}

/// Maps a flat index over `lhs_shape` to its broadcast counterpart over
/// `rhs_shape` (spec §4.4 broadcasting: rhs axis divides lhs axis).
pub(crate) fn broadcast_index(flat: usize, lhs_shape: [usize; 4], rhs_shape: [usize; 4]) -> usize {
    let idx = decompose(flat, lhs_shape);
    let ridx = [
        idx[0] % rhs_shape[0].max(1),
        idx[1] % rhs_shape[1].max(1),
        idx[2] % rhs_shape[2].max(1),
        idx[3] % rhs_shape[3].max(1),
    ];
    recompose(ridx, rhs_shape)
}

pub fn run_phase(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    let op = ctx.tensor(node).op;
    match op {
        OpTag::None => Ok(()),

        // No-op shape/view ops: the header already aliases the right bytes.
        OpTag::View | OpTag::Reshape | OpTag::Permute | OpTag::Transpose => Ok(()),

        OpTag::Dup | OpTag::Cont | OpTag::Cpy => unary(ctx, node, params, |dst, a| numeric::copy(dst, a)),
        OpTag::Neg => unary(ctx, node, params, numeric::neg),
        OpTag::Abs => unary(ctx, node, params, numeric::abs),
        OpTag::Sgn => unary(ctx, node, params, numeric::sgn),
        OpTag::Step => unary(ctx, node, params, numeric::step),
        OpTag::Tanh => unary(ctx, node, params, numeric::tanh),
        OpTag::Elu => unary(ctx, node, params, numeric::elu),
        OpTag::Relu => unary(ctx, node, params, numeric::relu),
        OpTag::Sqr => unary(ctx, node, params, numeric::sqr),
        OpTag::Sqrt => unary(ctx, node, params, numeric::sqrt),
        OpTag::Log => unary(ctx, node, params, numeric::log),
        OpTag::Gelu => unary_elemwise(ctx, node, params, numeric::gelu),
        OpTag::GeluQuick => unary_elemwise(ctx, node, params, numeric::gelu_quick),
        OpTag::Silu => unary_elemwise(ctx, node, params, numeric::silu),

        OpTag::SiluBack => binary_same_shape(ctx, node, params, |dst, a, dy| {
            for i in 0..dst.len() {
                dst[i] = numeric::silu_backward(a[i], dy[i]);
            }
        }),

        OpTag::Add | OpTag::Add1 => broadcast_binary(ctx, node, params, numeric::add),
        OpTag::Sub => broadcast_binary(ctx, node, params, numeric::sub),
        OpTag::Mul => broadcast_binary(ctx, node, params, numeric::mul),
        OpTag::Div => broadcast_binary(ctx, node, params, numeric::div),

        OpTag::Acc | OpTag::Set => view_write(ctx, node, params, op == OpTag::Acc),

        OpTag::Sum => reduce_scalar(ctx, node, params, |a| numeric::sum(a)),
        OpTag::Mean => reduce_scalar(ctx, node, params, |a| numeric::sum(a) / a.len().max(1) as f32),
        OpTag::SumRows => reduce_rows(ctx, node, params, numeric::sum),
        OpTag::Argmax => argmax(ctx, node, params),

        OpTag::Repeat => repeat(ctx, node, params),
        OpTag::RepeatBack => repeat_back(ctx, node, params),
        OpTag::GetRows => get_rows(ctx, node, params),
        OpTag::GetRowsBack => get_rows_back(ctx, node, params),
        OpTag::Diag => diag(ctx, node, params),
        OpTag::DiagMaskInf => diag_mask(ctx, node, params, f32::NEG_INFINITY),
        OpTag::DiagMaskZero => diag_mask(ctx, node, params, 0.0),

        OpTag::Norm => norm::norm(ctx, node, params),
        OpTag::NormBack => norm::norm_back(ctx, node, params),
        OpTag::RmsNorm => norm::rms_norm(ctx, node, params),
        OpTag::RmsNormBack => norm::rms_norm_back(ctx, node, params),

        OpTag::MulMat => linalg::mul_mat(ctx, node, params),
        OpTag::OutProd => linalg::out_prod(ctx, node, params),
        OpTag::Scale => scale(ctx, node, params),

        OpTag::SoftMax => softmax::soft_max(ctx, node, params),
        OpTag::SoftMaxBack => softmax::soft_max_back(ctx, node, params),

        OpTag::Rope => advanced::rope(ctx, node, params),
        OpTag::RopeBack => advanced::rope_back(ctx, node, params),
        OpTag::Alibi => advanced::alibi(ctx, node, params),
        OpTag::Clamp => advanced::clamp(ctx, node, params),
        OpTag::Conv1d => advanced::conv_1d(ctx, node, params),
        OpTag::Conv2d => advanced::conv_2d(ctx, node, params),
        OpTag::FlashAttn => advanced::flash_attn(ctx, node, params),
        OpTag::FlashFf => advanced::flash_ff(ctx, node, params),
        OpTag::FlashAttnBack => advanced::flash_attn_back(ctx, node, params),
        OpTag::WinPart => advanced::win_part(ctx, node, params),
        OpTag::WinUnpart => advanced::win_unpart(ctx, node, params),

        OpTag::MapUnary => custom::map_unary(ctx, node, params),
        OpTag::MapBinary => custom::map_binary(ctx, node, params),
        OpTag::MapCustom1 => custom::map_custom1(ctx, node, params),
        OpTag::MapCustom2 => custom::map_custom2(ctx, node, params),
        OpTag::MapCustom3 => custom::map_custom3(ctx, node, params),

        OpTag::CrossEntropyLoss => custom::cross_entropy_loss(ctx, node, params),
        OpTag::CrossEntropyLossBack => custom::cross_entropy_loss_back(ctx, node, params),
    }
}

fn unary(ctx: &mut Context, node: TensorId, params: ComputeParams, f: fn(&mut [f32], &[f32])) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let src = ctx.tensor(node).src[0].expect("unary op has one operand");
    let a = ctx.payload_f32(src).map(|s| s.to_vec()).unwrap_or_default();
    let (lo, hi) = row_range(a.len(), params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    f(&mut dst[lo..hi], &a[lo..hi]);
    Ok(())
}

fn unary_elemwise(ctx: &mut Context, node: TensorId, params: ComputeParams, f: fn(f32) -> f32) -> GgmxResult<()> {
    unary(ctx, node, params, move |dst, a| {
        for i in 0..dst.len() {
            dst[i] = f(a[i]);
        }
    })
}

fn binary_same_shape(ctx: &mut Context, node: TensorId, params: ComputeParams, f: fn(&mut [f32], &[f32], &[f32])) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (s0, s1) = {
        let h = ctx.tensor(node);
        (h.src[0].expect("binary op has lhs"), h.src[1].expect("binary op has rhs"))
    };
    let a = ctx.payload_f32(s0).map(|s| s.to_vec()).unwrap_or_default();
    let b = ctx.payload_f32(s1).map(|s| s.to_vec()).unwrap_or_default();
    let (lo, hi) = row_range(a.len(), params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    f(&mut dst[lo..hi], &a[lo..hi], &b[lo..hi]);
    Ok(())
}

fn broadcast_binary(ctx: &mut Context, node: TensorId, params: ComputeParams, f: fn(&mut [f32], &[f32], &[f32])) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (s0, s1, lhs_shape, rhs_shape) = {
        let h = ctx.tensor(node);
        let s0 = h.src[0].expect("binary op has lhs");
        let s1 = h.src[1].expect("binary op has rhs");
        (s0, s1, ctx.tensor(s0).shape, ctx.tensor(s1).shape)
    };
    let a = ctx.payload_f32(s0).map(|s| s.to_vec()).unwrap_or_default();
    let b = ctx.payload_f32(s1).map(|s| s.to_vec()).unwrap_or_default();
    let (lo, hi) = row_range(a.len(), params.ith, params.nth);
    let gathered: Vec<f32> = (lo..hi).map(|i| b[broadcast_index(i, lhs_shape, rhs_shape)]).collect();
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    f(&mut dst[lo..hi], &a[lo..hi], &gathered);
    Ok(())
}

/// ACC/SET write `src1` into `src0`'s storage at `OpParams::View { offset }`
/// (byte offset converted to an `f32` element offset). ACC adds; SET
/// overwrites.
fn view_write(ctx: &mut Context, node: TensorId, params: ComputeParams, accumulate: bool) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let offset_elems = match *ctx.op_params(node) {
        crate::graph::OpParams::View { offset } => offset / std::mem::size_of::<f32>(),
        _ => 0,
    };
    let src1 = ctx.tensor(node).src[1].expect("ACC/SET has a value operand");
    let b = ctx.payload_f32(src1).map(|s| s.to_vec()).unwrap_or_default();
    let (lo, hi) = row_range(b.len(), params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for (k, i) in (lo..hi).enumerate() {
        let d = offset_elems + i;
        if d >= dst.len() {
            break;
        }
        if accumulate {
            dst[d] += b[k];
        } else {
            dst[d] = b[k];
        }
    }
    Ok(())
}

fn reduce_scalar(ctx: &mut Context, node: TensorId, params: ComputeParams, f: fn(&[f32]) -> f32) -> GgmxResult<()> {
    if params.phase != Phase::Compute || params.ith != 0 {
        return Ok(());
    }
    let src = ctx.tensor(node).src[0].expect("reduction has one operand");
    let a = ctx.payload_f32(src).map(|s| s.to_vec()).unwrap_or_default();
    if let Some(dst) = ctx.payload_f32_mut(node) {
        dst[0] = f(&a);
    }
    Ok(())
}

fn reduce_rows(ctx: &mut Context, node: TensorId, params: ComputeParams, f: fn(&[f32]) -> f32) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (src, row_len) = {
        let h = ctx.tensor(node);
        let src = h.src[0].expect("reduction has one operand");
        (src, ctx.tensor(src).shape[0])
    };
    let a = ctx.payload_f32(src).map(|s| s.to_vec()).unwrap_or_default();
    let nr = row_len.max(1);
    let n_rows = a.len() / nr;
    let (lo, hi) = row_range(n_rows, params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for r in lo..hi {
        dst[r] = f(&a[r * nr..(r + 1) * nr]);
    }
    Ok(())
}

fn argmax(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (src, row_len) = {
        let h = ctx.tensor(node);
        let src = h.src[0].expect("Argmax has one operand");
        (src, ctx.tensor(src).shape[0])
    };
    let a = ctx.payload_f32(src).map(|s| s.to_vec()).unwrap_or_default();
    let nr = row_len.max(1);
    let n_rows = a.len() / nr;
    let (lo, hi) = row_range(n_rows, params.ith, params.nth);
    let Some(bytes) = ctx.payload_mut(node) else { return Ok(()) };
    let dst: &mut [i32] = bytemuck::cast_slice_mut(bytes);
    for r in lo..hi {
        dst[r] = numeric::argmax(&a[r * nr..(r + 1) * nr]) as i32;
    }
    Ok(())
}

fn repeat(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (src, src_shape, dst_shape) = {
        let h = ctx.tensor(node);
        let src = h.src[0].expect("Repeat has one operand");
        (src, ctx.tensor(src).shape, h.shape)
    };
    let a = ctx.payload_f32(src).map(|s| s.to_vec()).unwrap_or_default();
    let n: usize = dst_shape.iter().product();
    let (lo, hi) = row_range(n, params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for i in lo..hi {
        dst[i] = a[broadcast_index(i, dst_shape, src_shape)];
    }
    Ok(())
}

fn repeat_back(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute || params.ith != 0 {
        return Ok(());
    }
    let (src, src_shape, dst_shape) = {
        let h = ctx.tensor(node);
        let src = h.src[0].expect("RepeatBack has one operand");
        (src, ctx.tensor(src).shape, h.shape)
    };
    let a = ctx.payload_f32(src).map(|s| s.to_vec()).unwrap_or_default();
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    dst.fill(0.0);
    for i in 0..a.len() {
        let d = broadcast_index(i, src_shape, dst_shape);
        dst[d] += a[i];
    }
    Ok(())
}

fn get_rows(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (m, idx, row_len) = {
        let h = ctx.tensor(node);
        let m = h.src[0].expect("GetRows has source matrix");
        let idx = h.src[1].expect("GetRows has index tensor");
        (m, idx, ctx.tensor(m).shape[0])
    };
    let matrix = ctx.payload_f32(m).map(|s| s.to_vec()).unwrap_or_default();
    let indices = ctx.payload_f32(idx).map(|s| s.to_vec()).unwrap_or_default();
    let (lo, hi) = row_range(indices.len(), params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for r in lo..hi {
        let src_row = indices[r] as usize;
        dst[r * row_len..(r + 1) * row_len].copy_from_slice(&matrix[src_row * row_len..(src_row + 1) * row_len]);
    }
    Ok(())
}

fn get_rows_back(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute || params.ith != 0 {
        return Ok(());
    }
    let (grad, idx, row_len) = {
        let h = ctx.tensor(node);
        let grad = h.src[0].expect("GetRowsBack has grad operand");
        let idx = h.src[1].expect("GetRowsBack has index tensor");
        (grad, idx, h.shape[0])
    };
    let grad_rows = ctx.payload_f32(grad).map(|s| s.to_vec()).unwrap_or_default();
    let indices = ctx.payload_f32(idx).map(|s| s.to_vec()).unwrap_or_default();
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    dst.fill(0.0);
    for (r, &ix) in indices.iter().enumerate() {
        let target = ix as usize;
        for c in 0..row_len {
            dst[target * row_len + c] += grad_rows[r * row_len + c];
        }
    }
    Ok(())
}

fn diag(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let src = ctx.tensor(node).src[0].expect("Diag has one operand");
    let a = ctx.payload_f32(src).map(|s| s.to_vec()).unwrap_or_default();
    let n = a.len();
    let (lo, hi) = row_range(n, params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    dst.fill(0.0);
    for i in lo..hi {
        dst[i * n + i] = a[i];
    }
    Ok(())
}

fn diag_mask(ctx: &mut Context, node: TensorId, params: ComputeParams, masked_value: f32) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (src, n_past, n_cols, n_rows) = {
        let h = ctx.tensor(node);
        let src = h.src[0].expect("diag mask has one operand");
        let n_past = match *ctx.op_params(node) {
            crate::graph::OpParams::DiagMask { n_past } => n_past,
            _ => 0,
        };
        (src, n_past, h.shape[0], h.shape[1])
    };
    let a = ctx.payload_f32(src).map(|s| s.to_vec()).unwrap_or_default();
    let (lo, hi) = row_range(n_rows, params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for r in lo..hi {
        for c in 0..n_cols {
            let i = r * n_cols + c;
            dst[i] = if c > n_past + r { masked_value } else { a[i] };
        }
    }
    Ok(())
}

fn scale(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (src, v) = {
        let h = ctx.tensor(node);
        let src = h.src[0].expect("Scale has one operand");
        let v = match *ctx.op_params(node) {
            crate::graph::OpParams::Scale(v) => v,
            _ => 1.0,
        };
        (src, v)
    };
    let a = ctx.payload_f32(src).map(|s| s.to_vec()).unwrap_or_default();
    let (lo, hi) = row_range(a.len(), params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    numeric::scale(&mut dst[lo..hi], &a[lo..hi], v);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::graph::Builder;
    use crate::types::ElemType;

    fn run_single(ctx: &mut Context, node: TensorId) {
        run_phase(ctx, node, ComputeParams { phase: Phase::Init, ith: 0, nth: 1, wsize: 0, wdata: std::ptr::null_mut() }).unwrap();
        run_phase(ctx, node, ComputeParams { phase: Phase::Compute, ith: 0, nth: 1, wsize: 0, wdata: std::ptr::null_mut() }).unwrap();
        run_phase(ctx, node, ComputeParams { phase: Phase::Finalize, ith: 0, nth: 1, wsize: 0, wdata: std::ptr::null_mut() }).unwrap();
    }

    #[test]
    fn add_computes_elementwise_sum() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        let b = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        ctx.payload_f32_mut(a).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        ctx.payload_f32_mut(b).unwrap().copy_from_slice(&[10.0, 10.0, 10.0, 10.0]);
        let mut bld = Builder::new(&mut ctx, false);
        let c = bld.add(a, b).unwrap();
        run_single(&mut ctx, c);
        assert_eq!(ctx.payload_f32(c).unwrap(), &[11.0, 12.0, 13.0, 14.0]);
    }

    #[test]
    fn sum_rows_reduces_each_row() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [2, 2, 1, 1], true).unwrap();
        ctx.payload_f32_mut(a).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let mut bld = Builder::new(&mut ctx, false);
        let s = bld.sum_rows(a).unwrap();
        run_single(&mut ctx, s);
        assert_eq!(ctx.payload_f32(s).unwrap(), &[3.0, 7.0]);
    }

    #[test]
    fn scale_multiplies_every_element() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        ctx.payload_f32_mut(a).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let mut bld = Builder::new(&mut ctx, false);
        let s = bld.scale(a, 2.0).unwrap();
        run_single(&mut ctx, s);
        assert_eq!(ctx.payload_f32(s).unwrap(), &[2.0, 4.0, 6.0, 8.0]);
    }
}
