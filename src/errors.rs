//! Crate-wide error types (see spec §7 "Error handling design").
//!
//! The builder and arena surface `Result`; the executor never returns an
//! error for an already-planned graph — a malformed graph is a caller bug
//! and is asserted against during planning instead.

use thiserror::Error;

use crate::types::OpTag;

/// Errors from arena/context allocation (§4.3, §7 `ArenaExhausted` /
/// `NoContextSlot`).
#[derive(Error, Debug)]
pub enum ArenaError {
    #[error("context pool exhausted: all context slots are in use")]
    OutOfSlots,
    #[error("arena out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("scratch buffer not configured")]
    NoScratch,
    #[error("scratch save/restore stack is already at its nesting limit")]
    ScratchStackFull,
}

/// Errors raised while building the operator graph (§7 `ShapeMismatch`).
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("shape mismatch in {op:?}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        op: OpTag,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("element type mismatch in {op:?}: {lhs:?} vs {rhs:?}")]
    TypeMismatch {
        op: OpTag,
        lhs: crate::types::ElemType,
        rhs: crate::types::ElemType,
    },
    #[error("rank {rank} out of bounds [1,4] for {op:?}")]
    RankOutOfBounds { op: OpTag, rank: usize },
    #[error("{op:?} does not define a backward rule")]
    UnsupportedBackward { op: OpTag },
    #[error("dangling tensor id {0:?}")]
    DanglingTensor(crate::context::TensorId),
}

/// Errors from the quantization codec (block-layout / length preconditions).
#[derive(Error, Debug)]
pub enum QuantError {
    #[error("input length {len} is not a multiple of block length {block_len}")]
    NotBlockAligned { len: usize, block_len: usize },
    #[error("block count {0} must be even for this dot-product kernel")]
    OddBlockCount(usize),
}

/// Errors from binary graph import/export (§6, §7 `InvalidGraphFile`).
#[derive(Error, Debug)]
pub enum IoError {
    #[error("bad magic number: expected 0x{expected:08x}, found 0x{found:08x}")]
    BadMagic { expected: u32, found: u32 },
    #[error("unsupported graph file version {0}")]
    UnsupportedVersion(u32),
    #[error("argument index {0} refers past the end of the leaf/node table")]
    DanglingArgIndex(i32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome of an optimizer step (§4.6, §7 `OptimizerConvergence`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerConvergence {
    Ok,
    DidNotConverge,
    NoContext,
    InvalidWolfe,
    Fail,
    MinimumStep,
    MaximumStep,
    MaximumIterations,
}

/// Umbrella error type returned by fallible, caller-facing entry points.
#[derive(Error, Debug)]
pub enum GgmxError {
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Quant(#[from] QuantError),
    #[error(transparent)]
    Io(#[from] IoError),
}

pub type GgmxResult<T> = Result<T, GgmxError>;
