//! Closed type enums shared across the engine (spec §3 "Tensor", §4.4
//! "Operator set").

use serde::{Deserialize, Serialize};

/// Element type of a tensor payload (spec §3).
///
/// Each variant knows its block length `B` (elements per block) and block
/// byte size `S` — for non-quantized types `B == 1` and `S` is the scalar
/// width.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2_K,
    Q3_K,
    Q4_K,
    Q5_K,
    Q6_K,
    Q8_K,
    I8,
    I16,
    I32,
}

impl ElemType {
    /// Number of source elements packed per block (spec §4.2).
    pub const fn block_len(self) -> usize {
        use ElemType::*;
        match self {
            F32 | F16 | I8 | I16 | I32 => 1,
            Q4_0 | Q4_1 | Q5_0 | Q5_1 | Q8_0 | Q8_1 => 32,
            Q2_K | Q3_K | Q4_K | Q5_K | Q6_K | Q8_K => 256,
        }
    }

    /// Size in bytes of one block's on-the-wire record (spec §4.2 table).
    pub const fn block_size(self) -> usize {
        use ElemType::*;
        match self {
            F32 | I32 => 4,
            F16 | I16 => 2,
            I8 => 1,
            Q4_0 => 18,
            Q4_1 => 20,
            Q5_0 => 22,
            Q5_1 => 24,
            Q8_0 => 34,
            Q8_1 => 40,
            // K-family super-blocks: see quant::k_quants for the authoritative
            // field layout of each.
            Q2_K => 2 + 2 + 16 + 64,
            Q3_K => 32 + 12 + 2 + 64,
            Q4_K => 2 + 2 + 12 + 128,
            Q5_K => 2 + 2 + 12 + 32 + 128,
            Q6_K => 128 + 64 + 16 + 2,
            Q8_K => 4 + 256 + 16 * 2,
        }
    }

    pub const fn is_quantized(self) -> bool {
        self.block_len() > 1
    }

    /// The companion activation-quantization type `D(T)` this weight type's
    /// dot-product kernel expects on the right-hand side (spec §4.2 "Dot
    /// product kernels").
    pub const fn dot_type(self) -> Option<ElemType> {
        use ElemType::*;
        match self {
            Q4_0 | Q4_1 | Q5_0 | Q5_1 | Q8_0 => Some(Q8_0),
            Q8_1 => Some(Q8_1),
            Q2_K | Q3_K | Q4_K | Q5_K | Q6_K => Some(Q8_K),
            _ => None,
        }
    }
}

/// Tag identifying the operator that produced a tensor, or `None` for a leaf
/// (spec §3 "Operation tag").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpTag {
    None,
    // Elementwise unary
    Dup,
    Neg,
    Abs,
    Sgn,
    Step,
    Tanh,
    Elu,
    Relu,
    Gelu,
    GeluQuick,
    Silu,
    SiluBack,
    Sqr,
    Sqrt,
    Log,
    // Elementwise binary
    Add,
    Add1,
    Acc,
    Sub,
    Mul,
    Div,
    // Reductions
    Sum,
    SumRows,
    Mean,
    Argmax,
    // Shape ops
    Repeat,
    RepeatBack,
    Reshape,
    View,
    Permute,
    Transpose,
    Cont,
    Cpy,
    // Indexing
    GetRows,
    GetRowsBack,
    Diag,
    DiagMaskInf,
    DiagMaskZero,
    Set,
    // Normalization
    Norm,
    NormBack,
    RmsNorm,
    RmsNormBack,
    // Linear algebra
    MulMat,
    OutProd,
    Scale,
    // Softmax family
    SoftMax,
    SoftMaxBack,
    // Positional
    Rope,
    RopeBack,
    Alibi,
    Clamp,
    // Convolution
    Conv1d,
    Conv2d,
    // Attention
    FlashAttn,
    FlashFf,
    FlashAttnBack,
    // Window ops
    WinPart,
    WinUnpart,
    // Escape hatches
    MapUnary,
    MapBinary,
    MapCustom1,
    MapCustom2,
    MapCustom3,
    // Training
    CrossEntropyLoss,
    CrossEntropyLossBack,
}

impl OpTag {
    /// Whether this op is a "no-op" shape op for task-count planning
    /// purposes (spec §4.5 "task count").
    pub fn is_view_like(self) -> bool {
        use OpTag::*;
        matches!(
            self,
            View | Reshape
                | Permute
                | Transpose
                | Cont
                | Dup
                | Cpy
                | GetRows
                | Diag
                | DiagMaskZero
                | Scale
                | Set
                | Alibi
                | Clamp
        )
    }
}
