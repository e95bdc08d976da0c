//! SOFT_MAX and its backward rule (spec §4.4 "Softmax family").

use super::row_range;
use crate::context::{Context, TensorId};
use crate::errors::GgmxResult;
use crate::exec::{ComputeParams, Phase};

pub fn soft_max(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (src, row_len) = {
        let h = ctx.tensor(node);
        let src = h.src[0].expect("SoftMax has one operand");
        (src, ctx.tensor(src).shape[0])
    };
    let a = ctx.payload_f32(src).map(|s| s.to_vec()).unwrap_or_default();
    let nr = row_len.max(1);
    let n_rows = a.len() / nr;
    let (lo, hi) = row_range(n_rows, params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for r in lo..hi {
        let row = &a[r * nr..(r + 1) * nr];
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut denom = 0.0f32;
        for c in 0..nr {
            let e = (row[c] - max).exp();
            dst[r * nr + c] = e;
            denom += e;
        }
        for c in 0..nr {
            dst[r * nr + c] /= denom;
        }
    }
    Ok(())
}

/// `dx_i = y_i * (dy_i - sum_j(dy_j * y_j))` per row, the standard softmax
/// Jacobian-vector product.
pub fn soft_max_back(ctx: &mut Context, node: TensorId, params: ComputeParams) -> GgmxResult<()> {
    if params.phase != Phase::Compute {
        return Ok(());
    }
    let (y_id, dy_id, row_len) = {
        let h = ctx.tensor(node);
        let y_id = h.src[0].expect("SoftMaxBack has softmax output");
        let dy_id = h.src[1].expect("SoftMaxBack has upstream grad");
        (y_id, dy_id, ctx.tensor(y_id).shape[0])
    };
    let y = ctx.payload_f32(y_id).map(|s| s.to_vec()).unwrap_or_default();
    let dy = ctx.payload_f32(dy_id).map(|s| s.to_vec()).unwrap_or_default();
    let nr = row_len.max(1);
    let n_rows = y.len() / nr;
    let (lo, hi) = row_range(n_rows, params.ith, params.nth);
    let Some(dst) = ctx.payload_f32_mut(node) else { return Ok(()) };
    for r in lo..hi {
        let yr = &y[r * nr..(r + 1) * nr];
        let dyr = &dy[r * nr..(r + 1) * nr];
        let dot: f32 = yr.iter().zip(dyr).map(|(yi, dyi)| yi * dyi).sum();
        for c in 0..nr {
            dst[r * nr + c] = yr[c] * (dyr[c] - dot);
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
    fn soft_max_rows_sum_to_one() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [4, 2, 1, 1], true).unwrap();
        ctx.payload_f32_mut(a).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0]);
        let mut bld = Builder::new(&mut ctx, false);
        let out = bld.soft_max(a).unwrap();
        soft_max(&mut ctx, out, ComputeParams { phase: Phase::Compute, ith: 0, nth: 1, wsize: 0, wdata: std::ptr::null_mut() }).unwrap();
        let out_data = ctx.payload_f32(out).unwrap();
        assert!((out_data[0..4].iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!((out_data[4..8].iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }
}
