//! Shape inference helpers (spec §4.4 "Shape inference rules").

use crate::errors::GraphError;
use crate::types::OpTag;

/// ADD/SUB/MUL/DIV: broadcast allowed on axes 1..3 where the rhs axis
/// divides the lhs axis; result matches the lhs shape.
pub fn broadcast_binary(op: OpTag, lhs: [usize; 4], rhs: [usize; 4]) -> Result<[usize; 4], GraphError> {
    if lhs[0] != rhs[0] {
        return Err(GraphError::ShapeMismatch {
            op,
            expected: lhs.to_vec(),
            found: rhs.to_vec(),
        });
    }
    for axis in 1..4 {
        if lhs[axis] % rhs[axis] != 0 {
            return Err(GraphError::ShapeMismatch {
                op,
                expected: lhs.to_vec(),
                found: rhs.to_vec(),
            });
        }
    }
    Ok(lhs)
}

/// MUL_MAT(A[K,M,b2,b3], B[K,N,b2,b3]) -> C[M,N,b2,b3].
pub fn mul_mat(a: [usize; 4], b: [usize; 4]) -> Result<[usize; 4], GraphError> {
    if a[0] != b[0] || (b[2] % a[2] != 0 && a[2] % b[2] != 0) || (b[3] % a[3] != 0 && a[3] % b[3] != 0) {
        return Err(GraphError::ShapeMismatch {
            op: OpTag::MulMat,
            expected: a.to_vec(),
            found: b.to_vec(),
        });
    }
    Ok([a[1], b[1], b[2].max(a[2]), b[3].max(a[3])])
}

/// OUT_PROD(A[K,M], B[K,N]) -> C[M,N].
pub fn out_prod(a: [usize; 4], b: [usize; 4]) -> Result<[usize; 4], GraphError> {
    if a[0] != b[0] {
        return Err(GraphError::ShapeMismatch { op: OpTag::OutProd, expected: a.to_vec(), found: b.to_vec() });
    }
    Ok([a[1], b[1], 1, 1])
}

/// GET_ROWS(M[K,R], idx[R']) -> [K,R'].
pub fn get_rows(m: [usize; 4], idx: [usize; 4]) -> [usize; 4] {
    [m[0], idx[0], m[2], m[3]]
}

/// REPEAT requires each target axis to be an integer multiple of the
/// source's matching axis.
pub fn repeat(src: [usize; 4], target: [usize; 4]) -> Result<[usize; 4], GraphError> {
    for axis in 0..4 {
        if target[axis] % src[axis] != 0 {
            return Err(GraphError::ShapeMismatch {
                op: OpTag::Repeat,
                expected: target.to_vec(),
                found: src.to_vec(),
            });
        }
    }
    Ok(target)
}

pub fn reduce_rows(src: [usize; 4]) -> [usize; 4] {
    [1, src[1], src[2], src[3]]
}

pub fn reduce_scalar() -> [usize; 4] {
    [1, 1, 1, 1]
}

pub fn conv1d_out_len(in_len: usize, kernel: usize, stride: usize, padding: usize, dilation: usize) -> usize {
    let eff_kernel = (kernel - 1) * dilation + 1;
    (in_len + 2 * padding - eff_kernel) / stride + 1
}

pub fn conv2d(
    input: [usize; 4],
    kernel_hw: (usize, usize),
    out_channels: usize,
    stride: (usize, usize),
    padding: (usize, usize),
    dilation: (usize, usize),
) -> [usize; 4] {
    let ow = conv1d_out_len(input[0], kernel_hw.0, stride.0, padding.0, dilation.0);
    let oh = conv1d_out_len(input[1], kernel_hw.1, stride.1, padding.1, dilation.1);
    [ow, oh, out_channels, input[3]]
}

/// WIN_PART splits an [W,H,C,1] tensor into non-overlapping `window`×`window`
/// patches, stacking them along axis 3.
pub fn win_part(src: [usize; 4], window: usize) -> [usize; 4] {
    let nw = (src[0] / window) * (src[1] / window);
    [window, window, src[2], nw]
}

pub fn win_unpart(src: [usize; 4], window: usize, out_w: usize, out_h: usize) -> [usize; 4] {
    let _ = (src, window);
    [out_w, out_h, src[2], 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_mat_matches_spec_scenario_2() {
        let c = mul_mat([2, 2, 1, 1], [2, 2, 1, 1]).unwrap();
        assert_eq!(c, [2, 2, 1, 1]);
    }

    #[test]
    fn broadcast_rejects_non_dividing_axes() {
        assert!(broadcast_binary(OpTag::Add, [4, 5, 1, 1], [4, 3, 1, 1]).is_err());
    }

    #[test]
    fn repeat_requires_integer_multiple() {
        assert!(repeat([2, 1, 1, 1], [2, 4, 1, 1]).is_ok());
        assert!(repeat([2, 1, 1, 1], [2, 3, 1, 1]).is_err());
    }
}
