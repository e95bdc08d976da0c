//! Operator constructors (spec §4.4 "Graph builder").
//!
//! Each constructor validates operand shapes/types, decides whether the
//! result can alias operand A in place, allocates the result through the
//! context, and records `op`/`src`/`params`. A gradient tensor is allocated
//! automatically whenever any source tensor is itself a parameter or
//! already carries a gradient.

use super::params::OpParams;
use super::shape;
use crate::context::{Context, TensorId};
use crate::errors::{GgmxError, GgmxResult, GraphError};
use crate::types::{ElemType, OpTag};

/// Wraps a [`Context`] with the graph-construction policy (in-place
/// eligibility, gradient propagation). `training` mirrors the source's
/// `ctx->grads != NULL`: when `false`, every eligible unary/binary op is
/// freed to alias its first operand in place.
pub struct Builder<'a> {
    pub ctx: &'a mut Context,
    pub training: bool,
}

impl<'a> Builder<'a> {
    pub fn new(ctx: &'a mut Context, training: bool) -> Self {
        Self { ctx, training }
    }

    fn needs_grad(&self, t: TensorId) -> bool {
        let h = self.ctx.tensor(t);
        h.is_param || h.grad.is_some()
    }

    fn can_inplace(&self, a: TensorId) -> bool {
        !self.training || !self.needs_grad(a)
    }

    fn finalize(
        &mut self,
        result: TensorId,
        op: OpTag,
        src: [Option<TensorId>; 2],
        opt: [Option<TensorId>; 4],
        params: OpParams,
    ) -> GgmxResult<TensorId> {
        self.ctx.set_op(result, op, src, opt);
        self.ctx.set_op_params(result, params);
        let any_grad = src.iter().chain(opt.iter()).flatten().any(|&s| self.needs_grad(s));
        if any_grad && self.training {
            let (et, shape) = {
                let h = self.ctx.tensor(result);
                (h.elem_type, h.shape)
            };
            let g = self.ctx.new_tensor(et, shape, true)?;
            self.ctx.set_grad(result, g);
        }
        Ok(result)
    }

    fn alloc_result(&mut self, base: TensorId, elem_type: ElemType, shape: [usize; 4], inplace: bool) -> GgmxResult<TensorId> {
        if inplace && self.can_inplace(base) {
            Ok(self.ctx.view_tensor(base))
        } else {
            Ok(self.ctx.new_tensor(elem_type, shape, true)?)
        }
    }

    // --------------------------------------------------------- unary ------

    fn unary(&mut self, op: OpTag, a: TensorId) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.alloc_result(a, et, shape, true)?;
        self.finalize(result, op, [Some(a), None], [None; 4], OpParams::None)
    }

    pub fn dup(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        self.unary(OpTag::Dup, a)
    }
    pub fn neg(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        self.unary(OpTag::Neg, a)
    }
    pub fn abs(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        self.unary(OpTag::Abs, a)
    }
    pub fn sgn(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        self.unary(OpTag::Sgn, a)
    }
    pub fn step(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        self.unary(OpTag::Step, a)
    }
    pub fn tanh(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        self.unary(OpTag::Tanh, a)
    }
    pub fn elu(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        self.unary(OpTag::Elu, a)
    }
    pub fn relu(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        self.unary(OpTag::Relu, a)
    }
    pub fn gelu(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        self.unary(OpTag::Gelu, a)
    }
    pub fn gelu_quick(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        self.unary(OpTag::GeluQuick, a)
    }
    pub fn silu(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        self.unary(OpTag::Silu, a)
    }
    pub fn sqr(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        self.unary(OpTag::Sqr, a)
    }
    pub fn sqrt(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        self.unary(OpTag::Sqrt, a)
    }
    pub fn log(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        self.unary(OpTag::Log, a)
    }

    pub fn silu_back(&mut self, a: TensorId, dy: TensorId) -> GgmxResult<TensorId> {
        self.binary_same_shape(OpTag::SiluBack, a, dy)
    }

    // -------------------------------------------------------- binary ------

    fn binary_same_shape(&mut self, op: OpTag, a: TensorId, b: TensorId) -> GgmxResult<TensorId> {
        let (et, shape_a) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let shape_b = self.ctx.tensor(b).shape;
        if shape_a != shape_b {
            return Err(GgmxError::Graph(GraphError::ShapeMismatch {
                op,
                expected: shape_a.to_vec(),
                found: shape_b.to_vec(),
            }));
        }
        let result = self.alloc_result(a, et, shape_a, true)?;
        self.finalize(result, op, [Some(a), Some(b)], [None; 4], OpParams::None)
    }

    fn binary_broadcast(&mut self, op: OpTag, a: TensorId, b: TensorId) -> GgmxResult<TensorId> {
        let (et, shape_a) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let shape_b = self.ctx.tensor(b).shape;
        let out_shape = shape::broadcast_binary(op, shape_a, shape_b)?;
        let result = self.alloc_result(a, et, out_shape, true)?;
        self.finalize(result, op, [Some(a), Some(b)], [None; 4], OpParams::None)
    }

    pub fn add(&mut self, a: TensorId, b: TensorId) -> GgmxResult<TensorId> {
        self.binary_broadcast(OpTag::Add, a, b)
    }
    pub fn add1(&mut self, a: TensorId, b: TensorId) -> GgmxResult<TensorId> {
        self.binary_broadcast(OpTag::Add1, a, b)
    }
    pub fn sub(&mut self, a: TensorId, b: TensorId) -> GgmxResult<TensorId> {
        self.binary_broadcast(OpTag::Sub, a, b)
    }
    pub fn mul(&mut self, a: TensorId, b: TensorId) -> GgmxResult<TensorId> {
        self.binary_broadcast(OpTag::Mul, a, b)
    }
    pub fn div(&mut self, a: TensorId, b: TensorId) -> GgmxResult<TensorId> {
        self.binary_broadcast(OpTag::Div, a, b)
    }

    /// Accumulates `b` into `a` at byte `offset`, returning a view of `a`.
    pub fn acc(&mut self, a: TensorId, b: TensorId, offset: usize) -> GgmxResult<TensorId> {
        let result = self.ctx.view_tensor(a);
        self.finalize(result, OpTag::Acc, [Some(a), Some(b)], [None; 4], OpParams::View { offset })
    }

    // ------------------------------------------------------ reductions ----

    pub fn sum(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        let et = self.ctx.tensor(a).elem_type;
        let result = self.ctx.new_tensor(et, shape::reduce_scalar(), true)?;
        self.finalize(result, OpTag::Sum, [Some(a), None], [None; 4], OpParams::None)
    }

    pub fn sum_rows(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape::reduce_rows(shape), true)?;
        self.finalize(result, OpTag::SumRows, [Some(a), None], [None; 4], OpParams::None)
    }

    pub fn mean(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        let et = self.ctx.tensor(a).elem_type;
        let result = self.ctx.new_tensor(et, shape::reduce_scalar(), true)?;
        self.finalize(result, OpTag::Mean, [Some(a), None], [None; 4], OpParams::None)
    }

    pub fn argmax(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        let shape = self.ctx.tensor(a).shape;
        let result = self.ctx.new_tensor(ElemType::I32, shape::reduce_rows(shape), true)?;
        self.finalize(result, OpTag::Argmax, [Some(a), None], [None; 4], OpParams::None)
    }

    // -------------------------------------------------------- shape ops ---

    pub fn repeat(&mut self, a: TensorId, target_shape: [usize; 4]) -> GgmxResult<TensorId> {
        let (et, src_shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        shape::repeat(src_shape, target_shape)?;
        let result = self.ctx.new_tensor(et, target_shape, true)?;
        self.finalize(result, OpTag::Repeat, [Some(a), None], [None; 4], OpParams::None)
    }

    pub fn repeat_back(&mut self, grad: TensorId, target_shape: [usize; 4]) -> GgmxResult<TensorId> {
        let et = self.ctx.tensor(grad).elem_type;
        let result = self.ctx.new_tensor(et, target_shape, true)?;
        self.finalize(result, OpTag::RepeatBack, [Some(grad), None], [None; 4], OpParams::None)
    }

    pub fn reshape(&mut self, a: TensorId, new_shape: [usize; 4]) -> GgmxResult<TensorId> {
        let (et, old_shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let nelem_old: usize = old_shape.iter().product();
        let nelem_new: usize = new_shape.iter().product();
        if nelem_old != nelem_new {
            return Err(GgmxError::Graph(GraphError::ShapeMismatch {
                op: OpTag::Reshape,
                expected: old_shape.to_vec(),
                found: new_shape.to_vec(),
            }));
        }
        let result = self.ctx.view_tensor(a);
        {
            let h = self.ctx.tensor_mut(result);
            h.shape = new_shape;
            h.rank = new_shape.iter().rev().position(|&d| d != 1).map(|p| 4 - p).unwrap_or(1).max(1);
            h.strides = crate::context::Tensor::contiguous_strides(et, &new_shape);
        }
        self.finalize(result, OpTag::Reshape, [Some(a), None], [None; 4], OpParams::None)
    }

    pub fn view(&mut self, a: TensorId, shape: [usize; 4], offset: usize) -> GgmxResult<TensorId> {
        let et = self.ctx.tensor(a).elem_type;
        let result = self.ctx.view_tensor(a);
        {
            let h = self.ctx.tensor_mut(result);
            h.shape = shape;
            h.rank = shape.iter().rev().position(|&d| d != 1).map(|p| 4 - p).unwrap_or(1).max(1);
            h.strides = crate::context::Tensor::contiguous_strides(et, &shape);
        }
        self.finalize(result, OpTag::View, [Some(a), None], [None; 4], OpParams::View { offset })
    }

    pub fn permute(&mut self, a: TensorId, axes: [usize; 4]) -> GgmxResult<TensorId> {
        let result = self.ctx.view_tensor(a);
        {
            let (shape, strides) = {
                let h = self.ctx.tensor(a);
                (h.shape, h.strides)
            };
            let h = self.ctx.tensor_mut(result);
            for i in 0..4 {
                h.shape[axes[i]] = shape[i];
                h.strides[axes[i]] = strides[i];
            }
        }
        self.finalize(result, OpTag::Permute, [Some(a), None], [None; 4], OpParams::Permute(axes))
    }

    pub fn transpose(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        self.permute(a, [1, 0, 2, 3])
    }

    pub fn cont(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::Cont, [Some(a), None], [None; 4], OpParams::None)
    }

    /// Copies `a`'s data into `b`'s storage; returns a view of `b`.
    pub fn cpy(&mut self, a: TensorId, b: TensorId) -> GgmxResult<TensorId> {
        let result = self.ctx.view_tensor(b);
        self.finalize(result, OpTag::Cpy, [Some(a), Some(b)], [None; 4], OpParams::None)
    }

    // -------------------------------------------------------- indexing ----

    pub fn get_rows(&mut self, m: TensorId, idx: TensorId) -> GgmxResult<TensorId> {
        let shape_m = self.ctx.tensor(m).shape;
        let shape_idx = self.ctx.tensor(idx).shape;
        let result = self.ctx.new_tensor(ElemType::F32, shape::get_rows(shape_m, shape_idx), true)?;
        self.finalize(result, OpTag::GetRows, [Some(m), Some(idx)], [None; 4], OpParams::None)
    }

    pub fn get_rows_back(&mut self, grad: TensorId, idx: TensorId, target_shape: [usize; 4]) -> GgmxResult<TensorId> {
        let result = self.ctx.new_tensor(ElemType::F32, target_shape, true)?;
        self.finalize(result, OpTag::GetRowsBack, [Some(grad), Some(idx)], [None; 4], OpParams::None)
    }

    pub fn diag(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let n = shape[0];
        let result = self.ctx.new_tensor(et, [n, n, shape[2], shape[3]], true)?;
        self.finalize(result, OpTag::Diag, [Some(a), None], [None; 4], OpParams::None)
    }

    pub fn diag_mask_inf(&mut self, a: TensorId, n_past: usize) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.alloc_result(a, et, shape, true)?;
        self.finalize(result, OpTag::DiagMaskInf, [Some(a), None], [None; 4], OpParams::DiagMask { n_past })
    }

    pub fn diag_mask_zero(&mut self, a: TensorId, n_past: usize) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.alloc_result(a, et, shape, true)?;
        self.finalize(result, OpTag::DiagMaskZero, [Some(a), None], [None; 4], OpParams::DiagMask { n_past })
    }

    pub fn set(&mut self, a: TensorId, b: TensorId, offset: usize) -> GgmxResult<TensorId> {
        let result = self.ctx.view_tensor(a);
        self.finalize(result, OpTag::Set, [Some(a), Some(b)], [None; 4], OpParams::View { offset })
    }

    // ---------------------------------------------------- normalization ---

    pub fn norm(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::Norm, [Some(a), None], [None; 4], OpParams::None)
    }

    pub fn rms_norm(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::RmsNorm, [Some(a), None], [None; 4], OpParams::None)
    }

    pub fn rms_norm_back(&mut self, a: TensorId, dy: TensorId) -> GgmxResult<TensorId> {
        self.binary_same_shape(OpTag::RmsNormBack, a, dy)
    }

    pub fn norm_back(&mut self, a: TensorId, dy: TensorId) -> GgmxResult<TensorId> {
        self.binary_same_shape(OpTag::NormBack, a, dy)
    }

    // ---------------------------------------------------- linear algebra --

    pub fn mul_mat(&mut self, a: TensorId, b: TensorId) -> GgmxResult<TensorId> {
        let shape_a = self.ctx.tensor(a).shape;
        let shape_b = self.ctx.tensor(b).shape;
        let out_shape = shape::mul_mat(shape_a, shape_b)?;
        let result = self.ctx.new_tensor(ElemType::F32, out_shape, true)?;
        self.finalize(result, OpTag::MulMat, [Some(a), Some(b)], [None; 4], OpParams::None)
    }

    pub fn out_prod(&mut self, a: TensorId, b: TensorId) -> GgmxResult<TensorId> {
        let shape_a = self.ctx.tensor(a).shape;
        let shape_b = self.ctx.tensor(b).shape;
        let out_shape = shape::out_prod(shape_a, shape_b)?;
        let result = self.ctx.new_tensor(ElemType::F32, out_shape, true)?;
        self.finalize(result, OpTag::OutProd, [Some(a), Some(b)], [None; 4], OpParams::None)
    }

    pub fn scale(&mut self, a: TensorId, v: f32) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.alloc_result(a, et, shape, true)?;
        self.finalize(result, OpTag::Scale, [Some(a), None], [None; 4], OpParams::Scale(v))
    }

    // --------------------------------------------------------- softmax ----

    pub fn soft_max(&mut self, a: TensorId) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::SoftMax, [Some(a), None], [None; 4], OpParams::None)
    }

    pub fn soft_max_back(&mut self, a: TensorId, dy: TensorId) -> GgmxResult<TensorId> {
        self.binary_same_shape(OpTag::SoftMaxBack, a, dy)
    }

    // ------------------------------------------------------- positional ---

    pub fn rope(&mut self, a: TensorId, n_dims: usize, mode: u32, n_ctx: usize) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::Rope, [Some(a), None], [None; 4], OpParams::Rope { n_dims, mode, n_ctx })
    }

    pub fn rope_back(&mut self, dy: TensorId, n_dims: usize, mode: u32, n_ctx: usize) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(dy);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::RopeBack, [Some(dy), None], [None; 4], OpParams::Rope { n_dims, mode, n_ctx })
    }

    pub fn alibi(&mut self, a: TensorId, n_head: usize, bias_max: f32) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::Alibi, [Some(a), None], [None; 4], OpParams::Alibi { n_head, bias_max })
    }

    pub fn clamp(&mut self, a: TensorId, min: f32, max: f32) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::Clamp, [Some(a), None], [None; 4], OpParams::Clamp { min, max })
    }

    // ------------------------------------------------------ convolution ---

    pub fn conv_1d(&mut self, input: TensorId, kernel: TensorId, stride: usize, padding: usize, dilation: usize) -> GgmxResult<TensorId> {
        let in_shape = self.ctx.tensor(input).shape;
        let k_shape = self.ctx.tensor(kernel).shape;
        let out_len = shape::conv1d_out_len(in_shape[0], k_shape[0], stride, padding, dilation);
        let out_shape = [out_len, k_shape[2], in_shape[2], in_shape[3]];
        let result = self.ctx.new_tensor(ElemType::F32, out_shape, true)?;
        self.finalize(
            result,
            OpTag::Conv1d,
            [Some(input), Some(kernel)],
            [None; 4],
            OpParams::Conv1d { stride, padding, dilation },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn conv_2d(
        &mut self,
        input: TensorId,
        kernel: TensorId,
        stride: (usize, usize),
        padding: (usize, usize),
        dilation: (usize, usize),
    ) -> GgmxResult<TensorId> {
        let in_shape = self.ctx.tensor(input).shape;
        let k_shape = self.ctx.tensor(kernel).shape;
        let out_shape = shape::conv2d(in_shape, (k_shape[0], k_shape[1]), k_shape[3], stride, padding, dilation);
        let result = self.ctx.new_tensor(ElemType::F32, out_shape, true)?;
        self.finalize(
            result,
            OpTag::Conv2d,
            [Some(input), Some(kernel)],
            [None; 4],
            OpParams::Conv2d { stride, padding, dilation },
        )
    }

    // -------------------------------------------------------- attention ---

    pub fn flash_attn(&mut self, q: TensorId, k: TensorId, v: TensorId, causal: bool) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(q);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::FlashAttn, [Some(q), Some(k)], [Some(v), None, None, None], OpParams::FlashAttn { causal })
    }

    pub fn flash_ff(&mut self, a: TensorId, b0: TensorId, b1: TensorId, c0: TensorId, c1: TensorId) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::FlashFf, [Some(a), Some(b0)], [Some(b1), Some(c0), Some(c1), None], OpParams::None)
    }

    pub fn flash_attn_back(&mut self, q: TensorId, k: TensorId, v: TensorId, d: TensorId) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(q);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::FlashAttnBack, [Some(q), Some(k)], [Some(v), Some(d), None, None], OpParams::None)
    }

    // ------------------------------------------------------------ window --

    pub fn win_part(&mut self, a: TensorId, window: usize) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape::win_part(shape, window), true)?;
        self.finalize(result, OpTag::WinPart, [Some(a), None], [None; 4], OpParams::WinPart { window })
    }

    pub fn win_unpart(&mut self, a: TensorId, window: usize, out_w: usize, out_h: usize) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape::win_unpart(shape, window, out_w, out_h), true)?;
        self.finalize(result, OpTag::WinUnpart, [Some(a), None], [None; 4], OpParams::WinPart { window })
    }

    // ------------------------------------------------------ escape hatches

    pub fn map_unary(&mut self, a: TensorId, f: fn(f32) -> f32) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::MapUnary, [Some(a), None], [None; 4], OpParams::MapUnary(f))
    }

    pub fn map_binary(&mut self, a: TensorId, b: TensorId, f: fn(f32, f32) -> f32) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::MapBinary, [Some(a), Some(b)], [None; 4], OpParams::MapBinary(f))
    }

    pub fn map_custom1(&mut self, a: TensorId, f: fn(&mut [f32], &[f32])) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::MapCustom1, [Some(a), None], [None; 4], OpParams::MapCustom1(f))
    }

    pub fn map_custom2(&mut self, a: TensorId, b: TensorId, f: fn(&mut [f32], &[f32], &[f32])) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::MapCustom2, [Some(a), Some(b)], [None; 4], OpParams::MapCustom2(f))
    }

    pub fn map_custom3(
        &mut self,
        a: TensorId,
        b: TensorId,
        c: TensorId,
        f: fn(&mut [f32], &[f32], &[f32], &[f32]),
    ) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(a);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(result, OpTag::MapCustom3, [Some(a), Some(b)], [Some(c), None, None, None], OpParams::MapCustom3(f))
    }

    // -------------------------------------------------------- training ----

    pub fn cross_entropy_loss(&mut self, logits: TensorId, target: TensorId) -> GgmxResult<TensorId> {
        let et = self.ctx.tensor(logits).elem_type;
        let result = self.ctx.new_tensor(et, shape::reduce_scalar(), true)?;
        self.finalize(result, OpTag::CrossEntropyLoss, [Some(logits), Some(target)], [None; 4], OpParams::None)
    }

    pub fn cross_entropy_loss_back(&mut self, logits: TensorId, target: TensorId, grad_output: TensorId) -> GgmxResult<TensorId> {
        let (et, shape) = {
            let h = self.ctx.tensor(logits);
            (h.elem_type, h.shape)
        };
        let result = self.ctx.new_tensor(et, shape, true)?;
        self.finalize(
            result,
            OpTag::CrossEntropyLossBack,
            [Some(logits), Some(target)],
            [Some(grad_output), None, None, None],
            OpParams::None,
        )
    }

    /// Marks `t` as a trainable leaf (spec §3 "`is_param` flag").
    pub fn mark_param(&mut self, t: TensorId) {
        self.ctx.set_param(t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn add_broadcasts_and_matches_lhs_shape() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [4, 3, 1, 1], true).unwrap();
        let b = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        let mut b_ = Builder::new(&mut ctx, false);
        let c = b_.add(a, b).unwrap();
        assert_eq!(b_.ctx.tensor(c).shape, [4, 3, 1, 1]);
    }

    #[test]
    fn mul_mat_scenario_2() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [2, 2, 1, 1], true).unwrap();
        let b = ctx.new_tensor(ElemType::F32, [2, 2, 1, 1], true).unwrap();
        ctx.payload_f32_mut(a).unwrap().copy_from_slice(&[1.0, 3.0, 2.0, 4.0]);
        ctx.payload_f32_mut(b).unwrap().copy_from_slice(&[5.0, 7.0, 6.0, 8.0]);
        let mut bld = Builder::new(&mut ctx, false);
        let c = bld.mul_mat(a, b).unwrap();
        assert_eq!(bld.ctx.tensor(c).shape, [2, 2, 1, 1]);
    }

    #[test]
    fn training_mode_allocates_gradients() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        let mut bld = Builder::new(&mut ctx, true);
        bld.mark_param(a);
        let b = bld.relu(a).unwrap();
        assert!(bld.ctx.tensor(b).grad.is_some());
    }

    #[test]
    fn non_training_unary_reuses_operand_payload() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        ctx.payload_f32_mut(a).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let mut bld = Builder::new(&mut ctx, false);
        let b = bld.relu(a).unwrap();
        assert_eq!(bld.ctx.payload_f32(b).unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }
}
