//! `OpParams` — fixed-size, non-arena operator parameters (spec §9 "Option
//! tensors as parameter carriers" redesign). Replaces the source's practice
//! of smuggling scalars through tiny I32/F32 option tensors, except where a
//! parameter is genuinely tensor-valued (e.g. `SET`'s destination view,
//! which stays a source tensor since it addresses another tensor's data).

use std::fmt;

#[derive(Clone, Copy)]
pub enum OpParams {
    None,
    Scale(f32),
    /// Byte offset for VIEW/RESHAPE-family ops into the source payload.
    View { offset: usize },
    Permute([usize; 4]),
    DiagMask { n_past: usize },
    Rope { n_dims: usize, mode: u32, n_ctx: usize },
    Alibi { n_head: usize, bias_max: f32 },
    Clamp { min: f32, max: f32 },
    Conv1d { stride: usize, padding: usize, dilation: usize },
    Conv2d { stride: (usize, usize), padding: (usize, usize), dilation: (usize, usize) },
    FlashAttn { causal: bool },
    WinPart { window: usize },
    MapUnary(fn(f32) -> f32),
    MapBinary(fn(f32, f32) -> f32),
    MapCustom1(fn(&mut [f32], &[f32])),
    MapCustom2(fn(&mut [f32], &[f32], &[f32])),
    MapCustom3(fn(&mut [f32], &[f32], &[f32], &[f32])),
}

impl fmt::Debug for OpParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpParams::None => write!(f, "None"),
            OpParams::Scale(v) => f.debug_tuple("Scale").field(v).finish(),
            OpParams::View { offset } => f.debug_struct("View").field("offset", offset).finish(),
            OpParams::Permute(axes) => f.debug_tuple("Permute").field(axes).finish(),
            OpParams::DiagMask { n_past } => f.debug_struct("DiagMask").field("n_past", n_past).finish(),
            OpParams::Rope { n_dims, mode, n_ctx } => f
                .debug_struct("Rope")
                .field("n_dims", n_dims)
                .field("mode", mode)
                .field("n_ctx", n_ctx)
                .finish(),
            OpParams::Alibi { n_head, bias_max } => {
                f.debug_struct("Alibi").field("n_head", n_head).field("bias_max", bias_max).finish()
            }
            OpParams::Clamp { min, max } => f.debug_struct("Clamp").field("min", min).field("max", max).finish(),
            OpParams::Conv1d { stride, padding, dilation } => f
                .debug_struct("Conv1d")
                .field("stride", stride)
                .field("padding", padding)
                .field("dilation", dilation)
                .finish(),
            OpParams::Conv2d { stride, padding, dilation } => f
                .debug_struct("Conv2d")
                .field("stride", stride)
                .field("padding", padding)
                .field("dilation", dilation)
                .finish(),
            OpParams::FlashAttn { causal } => f.debug_struct("FlashAttn").field("causal", causal).finish(),
            OpParams::WinPart { window } => f.debug_struct("WinPart").field("window", window).finish(),
            OpParams::MapUnary(_) => write!(f, "MapUnary(<fn>)"),
            OpParams::MapBinary(_) => write!(f, "MapBinary(<fn>)"),
            OpParams::MapCustom1(_) => write!(f, "MapCustom1(<fn>)"),
            OpParams::MapCustom2(_) => write!(f, "MapCustom2(<fn>)"),
            OpParams::MapCustom3(_) => write!(f, "MapCustom3(<fn>)"),
        }
    }
}
