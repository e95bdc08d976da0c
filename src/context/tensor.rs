//! Tensor header (spec §3 "Tensor").

use super::{BoundedName, TensorId};
use crate::types::{ElemType, OpTag};

#[derive(Debug, Clone, Copy, Default)]
pub struct PerfCounters {
    pub cycles: u64,
    pub time_us: u64,
    pub calls: u64,
}

/// Metadata for one tensor. Payload bytes live in the owning `Context`'s
/// arena, addressed separately by `TensorId` (spec §9 "arena indices").
#[derive(Debug, Clone)]
pub struct Tensor {
    pub elem_type: ElemType,
    pub rank: usize,
    pub shape: [usize; 4],
    pub strides: [usize; 4],
    pub op: OpTag,
    pub src: [Option<TensorId>; 2],
    pub opt: [Option<TensorId>; 4],
    pub grad: Option<TensorId>,
    pub is_param: bool,
    pub name: BoundedName,
    pub task_count: usize,
    pub perf: PerfCounters,
}

impl Tensor {
    pub fn new(elem_type: ElemType, rank: usize, shape: [usize; 4]) -> Self {
        assert!((1..=4).contains(&rank), "rank {rank} out of bounds [1,4]");
        let strides = Self::contiguous_strides(elem_type, &shape);
        Self {
            elem_type,
            rank,
            shape,
            strides,
            op: OpTag::None,
            src: [None, None],
            opt: [None, None, None, None],
            grad: None,
            is_param: false,
            name: BoundedName::empty(),
            task_count: 0,
            perf: PerfCounters::default(),
        }
    }

    /// stride[0] = S(T); stride[1] = stride[0]·shape[0]/B(T); stride[k>1] =
    /// stride[k-1]·shape[k-1] (spec §3 "Strides").
    pub fn contiguous_strides(elem_type: ElemType, shape: &[usize; 4]) -> [usize; 4] {
        let block_len = elem_type.block_len();
        let block_size = elem_type.block_size();
        let mut strides = [0usize; 4];
        strides[0] = block_size;
        strides[1] = strides[0] * shape[0] / block_len;
        for k in 2..4 {
            strides[k] = strides[k - 1] * shape[k - 1];
        }
        strides
    }

    pub fn nelements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Byte size = max(shape[3]·stride[3], nelements·S(T)/B(T)) (spec §3
    /// "Invariants").
    pub fn byte_size(&self) -> usize {
        let dense = self.nelements() * self.elem_type.block_size() / self.elem_type.block_len();
        let strided = self.shape[3] * self.strides[3];
        dense.max(strided)
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.iter().all(|&d| d == 1)
    }

    pub fn is_contiguous(&self) -> bool {
        self.strides == Self::contiguous_strides(self.elem_type, &self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_strides_chain_correctly() {
        let t = Tensor::new(ElemType::F32, 2, [4, 3, 1, 1]);
        assert_eq!(t.strides, [4, 16, 48, 48]);
        assert_eq!(t.byte_size(), 48);
    }

    #[test]
    fn quantized_stride0_is_block_size_not_elem_size() {
        let t = Tensor::new(ElemType::Q4_0, 1, [64, 1, 1, 1]);
        assert_eq!(t.strides[0], 18);
        assert_eq!(t.byte_size(), 18 * 2);
    }
}
