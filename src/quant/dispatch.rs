//! Type-indexed dispatch table (spec §4.2 "Dispatch table").
//!
//! Maps an [`ElemType`] to its quantize/dequantize/dot functions so callers
//! don't need a match arm per type at the call site — the executor's
//! `MUL_MAT` kernel looks up the weight type once per tensor and calls
//! through the returned table for every row.

use crate::errors::QuantError;
use crate::types::ElemType;

use super::{k_quants, legacy};

pub type QuantizeFn = fn(&[f32]) -> Vec<u8>;
pub type DequantizeFn = fn(&[u8], usize) -> Vec<f32>;
pub type VecDotFn = fn(usize, &[u8], &[u8]) -> f32;

/// Entry for one quantized [`ElemType`].
///
/// `quantize_reference` is the deterministic encoder used by round-trip
/// tests; this engine has no separate fast-path encoder (spec §1 treats
/// hand-tuned SIMD kernels as an external concern), so `quantize` aliases it.
pub struct QuantEntry {
    pub elem_type: ElemType,
    pub dequantize: DequantizeFn,
    pub quantize: QuantizeFn,
    pub quantize_reference: QuantizeFn,
    /// Companion activation type this entry's `vec_dot` expects on the rhs.
    pub dot_type: Option<ElemType>,
    pub vec_dot: Option<VecDotFn>,
}

pub fn entry(t: ElemType) -> Option<QuantEntry> {
    use ElemType::*;
    Some(match t {
        Q4_0 => QuantEntry {
            elem_type: t,
            dequantize: legacy::dequantize_q4_0,
            quantize: legacy::quantize_reference_q4_0,
            quantize_reference: legacy::quantize_reference_q4_0,
            dot_type: Some(Q8_0),
            vec_dot: Some(legacy::vec_dot_q4_0_q8_0),
        },
        Q4_1 => QuantEntry {
            elem_type: t,
            dequantize: legacy::dequantize_q4_1,
            quantize: legacy::quantize_reference_q4_1,
            quantize_reference: legacy::quantize_reference_q4_1,
            dot_type: Some(Q8_1),
            vec_dot: Some(legacy::vec_dot_q4_1_q8_1),
        },
        Q5_0 => QuantEntry {
            elem_type: t,
            dequantize: legacy::dequantize_q5_0,
            quantize: legacy::quantize_reference_q5_0,
            quantize_reference: legacy::quantize_reference_q5_0,
            dot_type: Some(Q8_0),
            vec_dot: Some(legacy::vec_dot_q5_0_q8_0),
        },
        Q5_1 => QuantEntry {
            elem_type: t,
            dequantize: legacy::dequantize_q5_1,
            quantize: legacy::quantize_reference_q5_1,
            quantize_reference: legacy::quantize_reference_q5_1,
            dot_type: Some(Q8_1),
            vec_dot: Some(legacy::vec_dot_q5_1_q8_1),
        },
        Q8_0 => QuantEntry {
            elem_type: t,
            dequantize: legacy::dequantize_q8_0,
            quantize: legacy::quantize_reference_q8_0,
            quantize_reference: legacy::quantize_reference_q8_0,
            dot_type: Some(Q8_0),
            vec_dot: Some(legacy::vec_dot_q8_0_q8_0),
        },
        Q8_1 => QuantEntry {
            elem_type: t,
            dequantize: legacy::dequantize_q8_1,
            quantize: legacy::quantize_reference_q8_1,
            quantize_reference: legacy::quantize_reference_q8_1,
            dot_type: Some(Q8_1),
            vec_dot: None,
        },
        Q2_K => QuantEntry {
            elem_type: t,
            dequantize: k_quants::dequantize_q2_k,
            quantize: k_quants::quantize_reference_q2_k,
            quantize_reference: k_quants::quantize_reference_q2_k,
            dot_type: Some(Q8_K),
            vec_dot: Some(k_quants::vec_dot_q2_k_q8_k),
        },
        Q3_K => QuantEntry {
            elem_type: t,
            dequantize: k_quants::dequantize_q3_k,
            quantize: k_quants::quantize_reference_q3_k,
            quantize_reference: k_quants::quantize_reference_q3_k,
            dot_type: Some(Q8_K),
            vec_dot: Some(k_quants::vec_dot_q3_k_q8_k),
        },
        Q4_K => QuantEntry {
            elem_type: t,
            dequantize: k_quants::dequantize_q4_k,
            quantize: k_quants::quantize_reference_q4_k,
            quantize_reference: k_quants::quantize_reference_q4_k,
            dot_type: Some(Q8_K),
            vec_dot: Some(k_quants::vec_dot_q4_k_q8_k),
        },
        Q5_K => QuantEntry {
            elem_type: t,
            dequantize: k_quants::dequantize_q5_k,
            quantize: k_quants::quantize_reference_q5_k,
            quantize_reference: k_quants::quantize_reference_q5_k,
            dot_type: Some(Q8_K),
            vec_dot: Some(k_quants::vec_dot_q5_k_q8_k),
        },
        Q6_K => QuantEntry {
            elem_type: t,
            dequantize: k_quants::dequantize_q6_k,
            quantize: k_quants::quantize_reference_q6_k,
            quantize_reference: k_quants::quantize_reference_q6_k,
            dot_type: Some(Q8_K),
            vec_dot: Some(k_quants::vec_dot_q6_k_q8_k),
        },
        Q8_K => QuantEntry {
            elem_type: t,
            dequantize: k_quants::dequantize_q8_k,
            quantize: k_quants::quantize_reference_q8_k,
            quantize_reference: k_quants::quantize_reference_q8_k,
            dot_type: Some(Q8_K),
            vec_dot: None,
        },
        F32 | F16 | I8 | I16 | I32 => return None,
    })
}

/// Dequantizes `len` elements of `t`-typed `bytes`, or copies them through
/// unchanged if `t` isn't quantized (`F32`/`I*` are stored densely already).
pub fn dequantize_to_f32(t: ElemType, bytes: &[u8], len: usize) -> Result<Vec<f32>, QuantError> {
    super::check_block_aligned(len, t.block_len())?;
    match entry(t) {
        Some(e) => Ok((e.dequantize)(bytes, len)),
        None => {
            // Dense, unquantized storage: read back raw f32 words.
            let mut out = Vec::with_capacity(len);
            for i in 0..len {
                out.push(super::read_f32(bytes, i * 4));
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_quantized_type_has_an_entry() {
        for t in [
            ElemType::Q4_0,
            ElemType::Q4_1,
            ElemType::Q5_0,
            ElemType::Q5_1,
            ElemType::Q8_0,
            ElemType::Q8_1,
            ElemType::Q2_K,
            ElemType::Q3_K,
            ElemType::Q4_K,
            ElemType::Q5_K,
            ElemType::Q6_K,
            ElemType::Q8_K,
        ] {
            let e = entry(t).unwrap_or_else(|| panic!("missing dispatch entry for {t:?}"));
            assert_eq!(e.elem_type, t);
        }
    }

    #[test]
    fn dense_types_have_no_entry() {
        assert!(entry(ElemType::F32).is_none());
        assert!(entry(ElemType::I32).is_none());
    }
}
