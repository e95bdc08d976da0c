//! NORM / RMS_NORM and their backward rule (spec §4.4 "Normalization").

use super::row_range;
use crate::context::{Context, TensorId};
use crate::errors::GgmxResult;
use crate::exec::{ComputeParams, Phase};

const EPS: f32 = 1e-5;
const RMS_EPS: f32 = 1e-6;

/// Per-row (mean, variance) standardization: `(x - mean) / sqrt(var + eps)`.
pub fn norm(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (src, row_len) = {
        let h = ctx.tensor(node);
        let src = h.src[0].expect("Norm has one operand");
        (src, ctx.tensor(src).shape[0])
    };
    let a = ctx.payload_f32(src).map(|s| s.to_vec()).unwrap_or_default();
    let nr = row_len.max(1);
    let n_rows = a.len() / nr;
    let (lo, hi) = row_range(n_rows, params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for r in lo..hi {
        let row = &a[r * nr..(r + 1) * nr];
        let mean = row.iter().sum::<f32>() / nr as f32;
        let var = row.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / nr as f32;
        let inv_std = 1.0 / (var + EPS).sqrt();
        for c in 0..nr {
            dst[r * nr + c] = (row[c] - mean) * inv_std;
        }
    }
    Ok(())
}

/// RMS normalization: `x / sqrt(mean(x^2) + eps)` — no mean subtraction.
pub fn rms_norm(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (src, row_len) = {
        let h = ctx.tensor(node);
        let src = h.src[0].expect("RmsNorm has one operand");
        (src, ctx.tensor(src).shape[0])
    };
    let a = ctx.payload_f32(src).map(|s| s.to_vec()).unwrap_or_default();
    let nr = row_len.max(1);
    let n_rows = a.len() / nr;
    let (lo, hi) = row_range(n_rows, params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for r in lo..hi {
        let row = &a[r * nr..(r + 1) * nr];
        let ms = row.iter().map(|x| x * x).sum::<f32>() / nr as f32;
        let inv_rms = 1.0 / (ms + RMS_EPS).sqrt();
        for c in 0..nr {
            dst[r * nr + c] = row[c] * inv_rms;
        }
    }
    Ok(())
}

/// Adjoint of NORM's `(x - mean) * inv_std`. With `y = (x - mean) * inv_std`,
/// the standard layer-norm backward rule per row is:
/// `dx = inv_std * (dy - mean(dy) - y * mean(dy * y))`.
pub fn norm_back(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (a_id, dy_id, row_len) = {
        let h = ctx.tensor(node);
        let a_id = h.src[0].expect("NormBack has operand");
        let dy_id = h.src[1].expect("NormBack has upstream grad");
        (a_id, dy_id, ctx.tensor(a_id).shape[0])
    };
    let a = ctx.payload_f32(a_id).map(|s| s.to_vec()).unwrap_or_default();
    let dy = ctx.payload_f32(dy_id).map(|s| s.to_vec()).unwrap_or_default();
    let nr = row_len.max(1);
    let n_rows = a.len() / nr;
    let (lo, hi) = row_range(n_rows, params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for r in lo..hi {
        let x = &a[r * nr..(r + 1) * nr];
        let g = &dy[r * nr..(r + 1) * nr];
        let mean = x.iter().sum::<f32>() / nr as f32;
        let var = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / nr as f32;
        let inv_std = 1.0 / (var + EPS).sqrt();
        let mean_g = g.iter().sum::<f32>() / nr as f32;
        let mean_gy = x
            .iter()
            .zip(g)
            .map(|(xi, gi)| (xi - mean) * inv_std * gi)
            .sum::<f32>()
            / nr as f32;
        for c in 0..nr {
            let y = (x[c] - mean) * inv_std;
            dst[r * nr + c] = inv_std * (g[c] - mean_g - y * mean_gy);
        }
    }
    Ok(())
}

/// `dx = dy * inv_rms - x * mean(dy * x) * inv_rms^3` per row (adjoint of
/// RMS_NORM, derived by differentiating `x * inv_rms` with `inv_rms` itself
/// a function of `x` through `mean(x^2)`).
pub fn rms_norm_back(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (a_id, dy_id, row_len) = {
        let h = ctx.tensor(node);
        let a_id = h.src[0].expect("RmsNormBack has operand");
        let dy_id = h.src[1].expect("RmsNormBack has upstream grad");
        (a_id, dy_id, ctx.tensor(a_id).shape[0])
    };
    let a = ctx.payload_f32(a_id).map(|s| s.to_vec()).unwrap_or_default();
    let dy = ctx.payload_f32(dy_id).map(|s| s.to_vec()).unwrap_or_default();
    let nr = row_len.max(1);
    let n_rows = a.len() / nr;
    let (lo, hi) = row_range(n_rows, params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for r in lo..hi {
        let x = &a[r * nr..(r + 1) * nr];
        let g = &dy[r * nr..(r + 1) * nr];
        let ms = x.iter().map(|v| v * v).sum::<f32>() / nr as f32;
        let inv_rms = 1.0 / (ms + RMS_EPS).sqrt();
        let mean_gx = x.iter().zip(g).map(|(xi, gi)| xi * gi).sum::<f32>() / nr as f32;
        for c in 0..nr {
            dst[r * nr + c] = g[c] * inv_rms - x[c] * mean_gx * inv_rms.powi(3);
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
    fn rms_norm_scales_to_unit_rms() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        ctx.payload_f32_mut(a).unwrap().copy_from_slice(&[2.0, 2.0, 2.0, 2.0]);
        let out = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        ctx.set_op(out, OpTag::RmsNorm, [Some(a), None], [None; 4]);
        rms_norm(&mut ctx, out, ComputeParams { phase: Phase::Compute, ith: 0, nth: 1, wsize: 0, wdata: std::ptr::null_mut() }).unwrap();
        for v in ctx.payload_f32(out).unwrap() {
            assert!((v - 1.0).abs() < 1e-3);
        }
    }
}
