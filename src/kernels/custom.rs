//! Escape-hatch and training-loss kernels (spec §4.4 "Escape hatches" /
//! "Training").

use super::row_range;
use crate::context::{Context, TensorId};
use crate::errors::GgmxResult;
use crate::exec::{ComputeParams, Phase};
use crate::graph::OpParams;

pub fn map_unary(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (src, f) = {
        let h = ctx.tensor(node);
        let src = h.src[0].expect("MapUnary has one operand");
        let f = match *ctx.op_params(node) {
            OpParams::MapUnary(f) => f,
            _ => |x: f32| x,
        };
        (src, f)
    };
    let a = ctx.payload_f32(src).map(|s| s.to_vec()).unwrap_or_default();
    let (lo, hi) = row_range(a.len(), params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for i in lo..hi {
        dst[i] = f(a[i]);
    }
    Ok(())
}

pub fn map_binary(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (s0, s1, f) = {
        let h = ctx.tensor(node);
        let s0 = h.src[0].expect("MapBinary has lhs");
        let s1 = h.src[1].expect("MapBinary has rhs");
        let f = match *ctx.op_params(node) {
            OpParams::MapBinary(f) => f,
            _ => |x: f32, _: f32| x,
        };
        (s0, s1, f)
    };
    let a = ctx.payload_f32(s0).map(|s| s.to_vec()).unwrap_or_default();
    let b = ctx.payload_f32(s1).map(|s| s.to_vec()).unwrap_or_default();
    let (lo, hi) = row_range(a.len(), params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for i in lo..hi {
        dst[i] = f(a[i], b[i % b.len().max(1)]);
    }
    Ok(())
}

pub fn map_custom1(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute || params.ith != 0 {
        return Ok(());
    }
    let (src, f) = {
        let h = ctx.tensor(node);
        let src = h.src[0].expect("MapCustom1 has one operand");
        let f = match *ctx.op_params(node) {
            OpParams::MapCustom1(f) => f,
            _ => (|_: &mut [f32], _: &[f32]| {}) as fn(&mut [f32], &[f32]),
        };
        (src, f)
    };
    let a = ctx.payload_f32(src).map(|s| s.to_vec()).unwrap_or_default();
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    f(dst, &a);
    Ok(())
}

pub fn map_custom2(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute || params.ith != 0 {
        return Ok(());
    }
    let (s0, s1, f) = {
        let h = ctx.tensor(node);
        let s0 = h.src[0].expect("MapCustom2 has lhs");
        let s1 = h.src[1].expect("MapCustom2 has rhs");
        let f = match *ctx.op_params(node) {
            OpParams::MapCustom2(f) => f,
            _ => (|_: &mut [f32], _: &[f32], _: &[f32]| {}) as fn(&mut [f32], &[f32], &[f32]),
        };
        (s0, s1, f)
    };
    let a = ctx.payload_f32(s0).map(|s| s.to_vec()).unwrap_or_default();
    let b = ctx.payload_f32(s1).map(|s| s.to_vec()).unwrap_or_default();
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    f(dst, &a, &b);
    Ok(())
}

pub fn map_custom3(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute || params.ith != 0 {
        return Ok(());
    }
    let (s0, s1, s2, f) = {
        let h = ctx.tensor(node);
        let s0 = h.src[0].expect("MapCustom3 has first operand");
        let s1 = h.src[1].expect("MapCustom3 has second operand");
        let s2 = h.opt[0].expect("MapCustom3 has third operand");
        let f = match *ctx.op_params(node) {
            OpParams::MapCustom3(f) => f,
            _ => (|_: &mut [f32], _: &[f32], _: &[f32], _: &[f32]| {}) as fn(&mut [f32], &[f32], &[f32], &[f32]),
        };
        (s0, s1, s2, f)
    };
    let a = ctx.payload_f32(s0).map(|s| s.to_vec()).unwrap_or_default();
    let b = ctx.payload_f32(s1).map(|s| s.to_vec()).unwrap_or_default();
    let c = ctx.payload_f32(s2).map(|s| s.to_vec()).unwrap_or_default();
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    f(dst, &a, &b, &c);
    Ok(())
}

/// `-mean(log_softmax(logits))` dotted with a one-hot/soft `target`
/// distribution, reduced to a scalar.
pub fn cross_entropy_loss(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute || params.ith != 0 {
        return Ok(());
    }
    let (logits_id, target_id, row_len) = {
        let h = ctx.tensor(node);
        let logits_id = h.src[0].expect("CrossEntropyLoss has logits");
        let target_id = h.src[1].expect("CrossEntropyLoss has target");
        (logits_id, target_id, ctx.tensor(logits_id).shape[0])
    };
    let logits = ctx.payload_f32(logits_id).map(|s| s.to_vec()).unwrap_or_default();
    let target = ctx.payload_f32(target_id).map(|s| s.to_vec()).unwrap_or_default();
    let nr = row_len.max(1);
    let n_rows = logits.len() / nr;
    let mut total = 0.0f32;
    for r in 0..n_rows {
        let row = &logits[r * nr..(r + 1) * nr];
        let t = &target[r * nr..(r + 1) * nr];
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let denom: f32 = row.iter().map(|x| (x - max).exp()).sum();
        let log_denom = denom.ln() + max;
        for c in 0..nr {
            total -= t[c] * (row[c] - log_denom);
        }
    }
    if let Some(dst) = ctx.payload_f32_mut(node) {
        dst[0] = total / n_rows.max(1) as f32;
    }
    Ok(())
}

/// `d(logits) = (softmax(logits) - target) * grad_output / n_rows`.
pub fn cross_entropy_loss_back(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (logits_id, target_id, grad_id, row_len) = {
        let h = ctx.tensor(node);
        let logits_id = h.src[0].expect("CrossEntropyLossBack has logits");
        let target_id = h.src[1].expect("CrossEntropyLossBack has target");
        let grad_id = h.opt[0].expect("CrossEntropyLossBack has grad_output");
        (logits_id, target_id, grad_id, ctx.tensor(logits_id).shape[0])
    };
    let logits = ctx.payload_f32(logits_id).map(|s| s.to_vec()).unwrap_or_default();
    let target = ctx.payload_f32(target_id).map(|s| s.to_vec()).unwrap_or_default();
    let grad_output = ctx.payload_f32(grad_id).map(|s| s[0]).unwrap_or(1.0);
    let nr = row_len.max(1);
    let n_rows = logits.len() / nr;
    let (lo, hi) = row_range(n_rows, params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for r in lo..hi {
        let row = &logits[r * nr..(r + 1) * nr];
        let t = &target[r * nr..(r + 1) * nr];
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let denom: f32 = row.iter().map(|x| (x - max).exp()).sum();
        for c in 0..nr {
            let softmax_c = (row[c] - max).exp() / denom;
            dst[r * nr + c] = (softmax_c - t[c]) * grad_output / n_rows.max(1) as f32;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::graph::Builder;
    use crate::types::ElemType;

    #[test]
    fn map_unary_applies_function_pointer() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        ctx.payload_f32_mut(a).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let mut bld = Builder::new(&mut ctx, false);
        let out = bld.map_unary(a, |x| x * x).unwrap();
        map_unary(&mut ctx, out, ComputeParams { phase: Phase::Compute, ith: 0, nth: 1, wsize: 0, wdata: std::ptr::null_mut() }).unwrap();
        assert_eq!(ctx.payload_f32(out).unwrap(), &[1.0, 4.0, 9.0, 16.0]);
    }

    #[test]
    fn cross_entropy_loss_is_zero_for_confident_correct_prediction() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let logits = ctx.new_tensor(ElemType::F32, [2, 1, 1, 1], true).unwrap();
        let target = ctx.new_tensor(ElemType::F32, [2, 1, 1, 1], true).unwrap();
        ctx.payload_f32_mut(logits).unwrap().copy_from_slice(&[20.0, -20.0]);
        ctx.payload_f32_mut(target).unwrap().copy_from_slice(&[1.0, 0.0]);
        let mut bld = Builder::new(&mut ctx, false);
        let loss = bld.cross_entropy_loss(logits, target).unwrap();
        cross_entropy_loss(&mut ctx, loss, ComputeParams { phase: Phase::Compute, ith: 0, nth: 1, wsize: 0, wdata: std::ptr::null_mut() }).unwrap();
        assert!(ctx.payload_f32(loss).unwrap()[0] < 1e-6);
    }
}
