//! L4: reverse-mode adjoint construction (spec §4.4 "Backward rules exist
//! exactly for the subset §4.4 names").
//!
//! Like the forward builder, this only *extends* the graph with new nodes
//! that compute gradients — nothing here touches tensor payloads. The
//! executor runs both halves together in one topological pass.

use crate::context::TensorId;
use crate::errors::{GgmxError, GgmxResult, GraphError};
use crate::graph::{Builder, OpParams};
use crate::types::OpTag;

fn topo_order(bld: &Builder, root: TensorId) -> Vec<TensorId> {
    let mut visited = vec![false; bld.ctx.len()];
    let mut order = Vec::new();
    let mut stack = vec![(root, false)];

    while let Some((t, expanded)) = stack.pop() {
        if visited[t.index()] {
            continue;
        }
        if expanded {
            visited[t.index()] = true;
            order.push(t);
            continue;
        }
        stack.push((t, true));
        let h = bld.ctx.tensor(t);
        for s in h.src.iter().chain(h.opt.iter()).flatten() {
            if !visited[s.index()] {
                stack.push((*s, false));
            }
        }
    }
    order
}

fn accumulate(bld: &mut Builder, owner: TensorId, contribution: TensorId) -> GgmxResult<()> {
    let existing = bld.ctx.tensor(owner).grad;
    let combined = match existing {
        Some(g) => bld.add(g, contribution)?,
        None => contribution,
    };
    bld.ctx.set_grad(owner, combined);
    Ok(())
}

/// Seeds `loss`'s gradient with a ones tensor and appends backward nodes in
/// reverse topological order. Fails fast (rather than silently skipping) on
/// any op outside the supported subset, per spec §7 `UnsupportedBackward`.
pub fn build_backward(bld: &mut Builder, loss: TensorId) -> GgmxResult<()> {
    let (et, shape) = {
        let h = bld.ctx.tensor(loss);
        (h.elem_type, h.shape)
    };
    let ones = bld.ctx.new_tensor(et, shape, true)?;
    if let Some(buf) = bld.ctx.payload_f32_mut(ones) {
        buf.fill(1.0);
    }
    bld.ctx.set_grad(loss, ones);

    let order = topo_order(bld, loss);
    for &t in order.iter().rev() {
        let Some(dy) = bld.ctx.tensor(t).grad else { continue };
        propagate(bld, t, dy)?;
    }
    Ok(())
}

fn propagate(bld: &mut Builder, t: TensorId, dy: TensorId) -> GgmxResult<()> {
    let header = bld.ctx.tensor(t).clone();
    let op = header.op;
    let src0 = header.src[0];
    let src1 = header.src[1];
    let params = *bld.ctx.op_params(t);

    match op {
        OpTag::None => {}

        OpTag::Dup | OpTag::Cont | OpTag::Cpy => {
            if let Some(a) = src0 {
                accumulate(bld, a, dy)?;
            }
        }

        OpTag::Neg => {
            let a = src0.expect("Neg has one operand");
            let g = bld.neg(dy)?;
            accumulate(bld, a, g)?;
        }

        OpTag::Abs => {
            let a = src0.expect("Abs has one operand");
            let s = bld.sgn(a)?;
            let g = bld.mul(dy, s)?;
            accumulate(bld, a, g)?;
        }

        OpTag::Sqr => {
            let a = src0.expect("Sqr has one operand");
            let two_a = bld.scale(a, 2.0)?;
            let g = bld.mul(dy, two_a)?;
            accumulate(bld, a, g)?;
        }

        OpTag::Sqrt => {
            let a = src0.expect("Sqrt has one operand");
            let two_sqrt_a = bld.scale(t, 2.0)?;
            let g = bld.div(dy, two_sqrt_a)?;
            accumulate(bld, a, g)?;
        }

        OpTag::Log => {
            let a = src0.expect("Log has one operand");
            let g = bld.div(dy, a)?;
            accumulate(bld, a, g)?;
        }

        OpTag::Tanh => {
            let a = src0.expect("Tanh has one operand");
            let y2 = bld.sqr(t)?;
            let neg_y2 = bld.neg(y2)?;
            let one = bld.ctx.new_tensor(header.elem_type, header.shape, true)?;
            if let Some(buf) = bld.ctx.payload_f32_mut(one) {
                buf.fill(1.0);
            }
            let deriv = bld.add(neg_y2, one)?;
            let g = bld.mul(dy, deriv)?;
            accumulate(bld, a, g)?;
        }

        OpTag::Relu => {
            let a = src0.expect("Relu has one operand");
            let s = bld.step(a)?;
            let g = bld.mul(dy, s)?;
            accumulate(bld, a, g)?;
        }

        OpTag::Silu => {
            let a = src0.expect("Silu has one operand");
            let g = bld.silu_back(a, dy)?;
            accumulate(bld, a, g)?;
        }

        OpTag::Sum => {
            let a = src0.expect("Sum has one operand");
            let target_shape = bld.ctx.tensor(a).shape;
            let g = bld.repeat(dy, target_shape)?;
            accumulate(bld, a, g)?;
        }

        OpTag::SumRows => {
            let a = src0.expect("SumRows has one operand");
            let target_shape = bld.ctx.tensor(a).shape;
            let g = bld.repeat(dy, target_shape)?;
            accumulate(bld, a, g)?;
        }

        OpTag::Mean => {
            let a = src0.expect("Mean has one operand");
            let target_shape = bld.ctx.tensor(a).shape;
            let n: usize = target_shape.iter().product();
            let scaled = bld.scale(dy, 1.0 / n.max(1) as f32)?;
            let g = bld.repeat(scaled, target_shape)?;
            accumulate(bld, a, g)?;
        }

        OpTag::Add | OpTag::Add1 => {
            let a = src0.expect("Add has lhs");
            accumulate(bld, a, dy)?;
            if let Some(b) = src1 {
                accumulate(bld, b, dy)?;
            }
        }

        OpTag::Sub => {
            let a = src0.expect("Sub has lhs");
            accumulate(bld, a, dy)?;
            if let Some(b) = src1 {
                let g = bld.neg(dy)?;
                accumulate(bld, b, g)?;
            }
        }

        OpTag::Mul => {
            let a = src0.expect("Mul has lhs");
            let b = src1.expect("Mul has rhs");
            let ga = bld.mul(dy, b)?;
            let gb = bld.mul(dy, a)?;
            accumulate(bld, a, ga)?;
            accumulate(bld, b, gb)?;
        }

        OpTag::Div => {
            let a = src0.expect("Div has lhs");
            let b = src1.expect("Div has rhs");
            let ga = bld.div(dy, b)?;
            let a_over_b2 = bld.div(t, b)?;
            let neg = bld.neg(a_over_b2)?;
            let gb = bld.mul(dy, neg)?;
            accumulate(bld, a, ga)?;
            accumulate(bld, b, gb)?;
        }

        OpTag::MulMat => {
            // c = MUL_MAT(a, b); da += OUT_PROD(b, dc); db += MUL_MAT(dc, a)
            let a = src0.expect("MulMat has lhs");
            let b = src1.expect("MulMat has rhs");
            let ga = bld.out_prod(b, dy)?;
            let gb = bld.mul_mat(dy, a)?;
            accumulate(bld, a, ga)?;
            accumulate(bld, b, gb)?;
        }

        OpTag::Norm => {
            let a = src0.expect("Norm has one operand");
            let g = bld.norm_back(a, dy)?;
            accumulate(bld, a, g)?;
        }

        OpTag::RmsNorm => {
            let a = src0.expect("RmsNorm has one operand");
            let g = bld.rms_norm_back(a, dy)?;
            accumulate(bld, a, g)?;
        }

        OpTag::FlashAttn => {
            let q = src0.expect("FlashAttn has q");
            let k = src1.expect("FlashAttn has k");
            let v = header.opt[0].expect("FlashAttn has v");
            let g = bld.flash_attn_back(q, k, v, dy)?;
            accumulate(bld, q, g)?;
        }

        OpTag::SoftMax => {
            let a = src0.expect("SoftMax has one operand");
            let g = bld.soft_max_back(t, dy)?;
            accumulate(bld, a, g)?;
        }

        OpTag::View | OpTag::Reshape | OpTag::Permute | OpTag::Transpose => {
            let a = src0.expect("view-like op has one operand");
            let src_shape = bld.ctx.tensor(a).shape;
            let g = bld.reshape(dy, src_shape)?;
            accumulate(bld, a, g)?;
        }

        OpTag::GetRows => {
            let m = src0.expect("GetRows has source matrix");
            let idx = src1.expect("GetRows has index tensor");
            let target_shape = bld.ctx.tensor(m).shape;
            let g = bld.get_rows_back(dy, idx, target_shape)?;
            accumulate(bld, m, g)?;
        }

        OpTag::DiagMaskInf | OpTag::DiagMaskZero => {
            let a = src0.expect("diag mask has one operand");
            let n_past = match params {
                OpParams::DiagMask { n_past } => n_past,
                _ => 0,
            };
            let g = bld.diag_mask_zero(dy, n_past)?;
            accumulate(bld, a, g)?;
        }

        OpTag::Rope => {
            let a = src0.expect("Rope has one operand");
            let (n_dims, mode, n_ctx) = match params {
                OpParams::Rope { n_dims, mode, n_ctx } => (n_dims, mode, n_ctx),
                _ => (0, 0, 0),
            };
            let g = bld.rope_back(dy, n_dims, mode, n_ctx)?;
            accumulate(bld, a, g)?;
        }

        OpTag::CrossEntropyLoss => {
            let logits = src0.expect("CrossEntropyLoss has logits");
            let target = src1.expect("CrossEntropyLoss has target");
            let g = bld.cross_entropy_loss_back(logits, target, dy)?;
            accumulate(bld, logits, g)?;
        }

        other => {
            return Err(GgmxError::Graph(GraphError::UnsupportedBackward { op: other }));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::types::ElemType;

    #[test]
    fn add_propagates_gradient_to_both_operands() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        let b = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        let mut bld = Builder::new(&mut ctx, true);
        bld.mark_param(a);
        bld.mark_param(b);
        let c = bld.add(a, b).unwrap();
        let sum = bld.sum(c).unwrap();
        build_backward(&mut bld, sum).unwrap();
        assert!(bld.ctx.tensor(a).grad.is_some());
        assert!(bld.ctx.tensor(b).grad.is_some());
    }

    #[test]
    fn unsupported_op_reports_error() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [4, 4, 1, 1], true).unwrap();
        let mut bld = Builder::new(&mut ctx, true);
        bld.mark_param(a);
        let w = bld.win_part(a, 2).unwrap();
        let sum = bld.sum(w).unwrap();
        assert!(build_backward(&mut bld, sum).is_err());
    }
}
