//! L1: quantization codec (spec §4.2).
//!
//! Thirteen block-quantized types. The six "legacy" types (block length 32)
//! live in [`legacy`]; the seven "K" super-block types (block length 256)
//! live in [`k_quants`]. [`dispatch`] exposes a type-indexed table so callers
//! can pair a quantized weight type with its companion activation type
//! without a conditional at the call site (spec §4.2 "Dispatch table").

pub mod dispatch;
pub mod k_quants;
pub mod legacy;

use crate::errors::QuantError;
use crate::numeric::f16;

pub(crate) fn check_block_aligned(len: usize, block_len: usize) -> Result<usize, QuantError> {
    if len % block_len != 0 {
        return Err(QuantError::NotBlockAligned { len, block_len });
    }
    Ok(len / block_len)
}

pub(crate) fn check_even_blocks(nblocks: usize) -> Result<(), QuantError> {
    if nblocks % 2 != 0 {
        return Err(QuantError::OddBlockCount(nblocks));
    }
    Ok(())
}

#[inline]
pub(crate) fn read_f16(bytes: &[u8], off: usize) -> f16 {
    f16::from_bits(u16::from_le_bytes([bytes[off], bytes[off + 1]]))
}

#[inline]
pub(crate) fn write_f16(bytes: &mut [u8], off: usize, v: f16) {
    bytes[off..off + 2].copy_from_slice(&v.to_bits().to_le_bytes());
}

#[inline]
pub(crate) fn read_f32(bytes: &[u8], off: usize) -> f32 {
    f32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
}

#[inline]
pub(crate) fn write_f32(bytes: &mut [u8], off: usize, v: f32) {
    bytes[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Returns `(max_abs_value, value_at_argmax)` used by the symmetric
/// quantizers (spec §4.2 "Q4_0: d = max(|x|)·sign(arg-max)/−8").
pub(crate) fn amax_signed(x: &[f32]) -> f32 {
    let mut amax = 0.0f32;
    let mut val = 0.0f32;
    for &v in x {
        if v.abs() > amax {
            amax = v.abs();
            val = v;
        }
    }
    val
}

#[cfg(test)]
mod tests {
    use super::legacy::*;

    /// Spec §8 scenario 1: Q4_0 round-trip bound.
    #[test]
    fn q4_0_roundtrip_within_bound() {
        let x: Vec<f32> = (1..=32)
            .map(|i| if i % 2 == 1 { i as f32 } else { -(i as f32) })
            .collect();
        let encoded = quantize_reference_q4_0(&x);
        let decoded = dequantize_q4_0(&encoded, 32);
        let max_abs = x.iter().fold(0.0f32, |a, &b| a.max(b.abs()));
        let bound = max_abs / 8.0;
        for (orig, rt) in x.iter().zip(decoded.iter()) {
            assert!(
                (orig - rt).abs() <= bound + 1e-4,
                "orig={orig} rt={rt} bound={bound}"
            );
        }
    }
}
