//! The six "legacy" block-quantized types, block length 32 (spec §4.2).
//!
//! Record layouts match the authoritative table in spec §4.2 exactly. All
//! quantizers here are the deterministic *reference* encoders the spec
//! requires for round-trip testing — there is no separate fast-path
//! quantizer in this engine (spec §1 treats SIMD kernel selection as an
//! external, pluggable concern).

use super::{amax_signed, read_f16, read_f32, write_f16, write_f32};
use crate::numeric::f16;

pub const BLOCK_LEN: usize = 32;

pub const Q4_0_BLOCK_SIZE: usize = 18;
pub const Q4_1_BLOCK_SIZE: usize = 20;
pub const Q5_0_BLOCK_SIZE: usize = 22;
pub const Q5_1_BLOCK_SIZE: usize = 24;
pub const Q8_0_BLOCK_SIZE: usize = 34;
pub const Q8_1_BLOCK_SIZE: usize = 40;

fn nblocks(len: usize) -> usize {
    assert_eq!(len % BLOCK_LEN, 0, "quantizer input must be a multiple of {BLOCK_LEN}");
    len / BLOCK_LEN
}

// ---------------------------------------------------------------- Q4_0 ----

/// d = max(|x|)·sign(arg-max)/−8; storage `min(15, (int8)(x·id + 8.5))`.
/// Two elements share a byte: low nibble holds position `j`, high nibble
/// holds position `j + 16` (spec §4.2 "Q4_0").
pub fn quantize_reference_q4_0(x: &[f32]) -> Vec<u8> {
    let n = nblocks(x.len());
    let mut out = vec![0u8; n * Q4_0_BLOCK_SIZE];
    for b in 0..n {
        let block = &x[b * BLOCK_LEN..(b + 1) * BLOCK_LEN];
        let xmax = amax_signed(block);
        let d = xmax / -8.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        let base = b * Q4_0_BLOCK_SIZE;
        write_f16(&mut out, base, f16::from_f32(d));
        for j in 0..16 {
            let q0 = (block[j] * id + 8.5).min(15.0).max(0.0) as u8;
            let q1 = (block[j + 16] * id + 8.5).min(15.0).max(0.0) as u8;
            out[base + 2 + j] = q0 | (q1 << 4);
        }
    }
    out
}

pub fn dequantize_q4_0(bytes: &[u8], len: usize) -> Vec<f32> {
    let n = nblocks(len);
    let mut out = vec![0.0f32; len];
    for b in 0..n {
        let base = b * Q4_0_BLOCK_SIZE;
        let d = read_f16(bytes, base).to_f32();
        for j in 0..16 {
            let byte = bytes[base + 2 + j];
            out[b * BLOCK_LEN + j] = ((byte & 0x0F) as f32 - 8.0) * d;
            out[b * BLOCK_LEN + j + 16] = ((byte >> 4) as f32 - 8.0) * d;
        }
    }
    out
}

// ---------------------------------------------------------------- Q4_1 ----

/// d = (max−min)/15; code = `min(15, (int8)((x−min)·id + 0.5))`.
pub fn quantize_reference_q4_1(x: &[f32]) -> Vec<u8> {
    let n = nblocks(x.len());
    let mut out = vec![0u8; n * Q4_1_BLOCK_SIZE];
    for b in 0..n {
        let block = &x[b * BLOCK_LEN..(b + 1) * BLOCK_LEN];
        let min = block.iter().copied().fold(f32::INFINITY, f32::min);
        let max = block.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let d = (max - min) / 15.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        let base = b * Q4_1_BLOCK_SIZE;
        write_f16(&mut out, base, f16::from_f32(d));
        write_f16(&mut out, base + 2, f16::from_f32(min));
        for j in 0..16 {
            let q0 = ((block[j] - min) * id + 0.5).min(15.0).max(0.0) as u8;
            let q1 = ((block[j + 16] - min) * id + 0.5).min(15.0).max(0.0) as u8;
            out[base + 4 + j] = q0 | (q1 << 4);
        }
    }
    out
}

pub fn dequantize_q4_1(bytes: &[u8], len: usize) -> Vec<f32> {
    let n = nblocks(len);
    let mut out = vec![0.0f32; len];
    for b in 0..n {
        let base = b * Q4_1_BLOCK_SIZE;
        let d = read_f16(bytes, base).to_f32();
        let m = read_f16(bytes, base + 2).to_f32();
        for j in 0..16 {
            let byte = bytes[base + 4 + j];
            out[b * BLOCK_LEN + j] = (byte & 0x0F) as f32 * d + m;
            out[b * BLOCK_LEN + j + 16] = (byte >> 4) as f32 * d + m;
        }
    }
    out
}

// ---------------------------------------------------------------- Q5_0 ----

/// d = max(|x|)/−16; 5-bit code in [0,31]; low 4 bits packed like Q4_0, bit 4
/// goes into a 32-bit high-bit plane: bit `j` of the low half lives at
/// position `j`, bit `j` of the high half lives at position `j + 16` (spec
/// §4.2 "Dequantizers" bit-ordering note).
pub fn quantize_reference_q5_0(x: &[f32]) -> Vec<u8> {
    let n = nblocks(x.len());
    let mut out = vec![0u8; n * Q5_0_BLOCK_SIZE];
    for b in 0..n {
        let block = &x[b * BLOCK_LEN..(b + 1) * BLOCK_LEN];
        let xmax = amax_signed(block);
        let d = xmax / -16.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        let base = b * Q5_0_BLOCK_SIZE;
        write_f16(&mut out, base, f16::from_f32(d));
        let mut qh: u32 = 0;
        for j in 0..16 {
            let q0 = (block[j] * id + 16.5).min(31.0).max(0.0) as u8;
            let q1 = (block[j + 16] * id + 16.5).min(31.0).max(0.0) as u8;
            out[base + 6 + j] = (q0 & 0x0F) | ((q1 & 0x0F) << 4);
            qh |= ((q0 as u32 >> 4) & 1) << j;
            qh |= ((q1 as u32 >> 4) & 1) << (j + 16);
        }
        out[base + 2..base + 6].copy_from_slice(&qh.to_le_bytes());
    }
    out
}

pub fn dequantize_q5_0(bytes: &[u8], len: usize) -> Vec<f32> {
    let n = nblocks(len);
    let mut out = vec![0.0f32; len];
    for b in 0..n {
        let base = b * Q5_0_BLOCK_SIZE;
        let d = read_f16(bytes, base).to_f32();
        let qh = u32::from_le_bytes(bytes[base + 2..base + 6].try_into().unwrap());
        for j in 0..16 {
            let byte = bytes[base + 6 + j];
            let bit0 = (qh >> j) & 1;
            let bit1 = (qh >> (j + 16)) & 1;
            let q0 = (byte & 0x0F) as u32 | (bit0 << 4);
            let q1 = (byte >> 4) as u32 | (bit1 << 4);
            out[b * BLOCK_LEN + j] = (q0 as f32 - 16.0) * d;
            out[b * BLOCK_LEN + j + 16] = (q1 as f32 - 16.0) * d;
        }
    }
    out
}

// ---------------------------------------------------------------- Q5_1 ----

/// Symmetric with Q4_1 but 5-bit: d = (max−min)/31.
pub fn quantize_reference_q5_1(x: &[f32]) -> Vec<u8> {
    let n = nblocks(x.len());
    let mut out = vec![0u8; n * Q5_1_BLOCK_SIZE];
    for b in 0..n {
        let block = &x[b * BLOCK_LEN..(b + 1) * BLOCK_LEN];
        let min = block.iter().copied().fold(f32::INFINITY, f32::min);
        let max = block.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let d = (max - min) / 31.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        let base = b * Q5_1_BLOCK_SIZE;
        write_f16(&mut out, base, f16::from_f32(d));
        write_f16(&mut out, base + 2, f16::from_f32(min));
        let mut qh: u32 = 0;
        for j in 0..16 {
            let q0 = ((block[j] - min) * id + 0.5).min(31.0).max(0.0) as u8;
            let q1 = ((block[j + 16] - min) * id + 0.5).min(31.0).max(0.0) as u8;
            out[base + 8 + j] = (q0 & 0x0F) | ((q1 & 0x0F) << 4);
            qh |= ((q0 as u32 >> 4) & 1) << j;
            qh |= ((q1 as u32 >> 4) & 1) << (j + 16);
        }
        out[base + 4..base + 8].copy_from_slice(&qh.to_le_bytes());
    }
    out
}

pub fn dequantize_q5_1(bytes: &[u8], len: usize) -> Vec<f32> {
    let n = nblocks(len);
    let mut out = vec![0.0f32; len];
    for b in 0..n {
        let base = b * Q5_1_BLOCK_SIZE;
        let d = read_f16(bytes, base).to_f32();
        let m = read_f16(bytes, base + 2).to_f32();
        let qh = u32::from_le_bytes(bytes[base + 4..base + 8].try_into().unwrap());
        for j in 0..16 {
            let byte = bytes[base + 8 + j];
            let bit0 = (qh >> j) & 1;
            let bit1 = (qh >> (j + 16)) & 1;
            let q0 = (byte & 0x0F) as u32 | (bit0 << 4);
            let q1 = (byte >> 4) as u32 | (bit1 << 4);
            out[b * BLOCK_LEN + j] = q0 as f32 * d + m;
            out[b * BLOCK_LEN + j + 16] = q1 as f32 * d + m;
        }
    }
    out
}

// ---------------------------------------------------------------- Q8_0 ----

/// d = max(|x|)/127; `q[j] = round(x[j]·id)`.
pub fn quantize_reference_q8_0(x: &[f32]) -> Vec<u8> {
    let n = nblocks(x.len());
    let mut out = vec![0u8; n * Q8_0_BLOCK_SIZE];
    for b in 0..n {
        let block = &x[b * BLOCK_LEN..(b + 1) * BLOCK_LEN];
        let amax = block.iter().fold(0.0f32, |a, &v| a.max(v.abs()));
        let d = amax / 127.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        let base = b * Q8_0_BLOCK_SIZE;
        write_f16(&mut out, base, f16::from_f32(d));
        for j in 0..32 {
            let q = (block[j] * id).round().clamp(-128.0, 127.0) as i8;
            out[base + 2 + j] = q as u8;
        }
    }
    out
}

pub fn dequantize_q8_0(bytes: &[u8], len: usize) -> Vec<f32> {
    let n = nblocks(len);
    let mut out = vec![0.0f32; len];
    for b in 0..n {
        let base = b * Q8_0_BLOCK_SIZE;
        let d = read_f16(bytes, base).to_f32();
        for j in 0..32 {
            let q = bytes[base + 2 + j] as i8;
            out[b * BLOCK_LEN + j] = q as f32 * d;
        }
    }
    out
}

// ---------------------------------------------------------------- Q8_1 ----

/// d = max(|x|)/127; `s = d·Σq` stored alongside for the paired dot-product
/// kernel.
pub fn quantize_reference_q8_1(x: &[f32]) -> Vec<u8> {
    let n = nblocks(x.len());
    let mut out = vec![0u8; n * Q8_1_BLOCK_SIZE];
    for b in 0..n {
        let block = &x[b * BLOCK_LEN..(b + 1) * BLOCK_LEN];
        let amax = block.iter().fold(0.0f32, |a, &v| a.max(v.abs()));
        let d = amax / 127.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        let base = b * Q8_1_BLOCK_SIZE;
        let mut qsum: i32 = 0;
        let mut qs = [0i8; 32];
        for j in 0..32 {
            let q = (block[j] * id).round().clamp(-128.0, 127.0) as i8;
            qs[j] = q;
            qsum += q as i32;
        }
        let s = d * qsum as f32;
        write_f32(&mut out, base, d);
        write_f32(&mut out, base + 4, s);
        for j in 0..32 {
            out[base + 8 + j] = qs[j] as u8;
        }
    }
    out
}

/// Q8_1 is symmetric around zero (no stored minimum); the `s = d·Σq` field
/// only accelerates the paired dot product, so dequantization is the same
/// shape as Q8_0 (spec §9 resolves the "Q8_1 dequantizer is null in the
/// dispatch table" open question by implementing it rather than leaving the
/// hazard in place — see DESIGN.md).
pub fn dequantize_q8_1(bytes: &[u8], len: usize) -> Vec<f32> {
    let n = nblocks(len);
    let mut out = vec![0.0f32; len];
    for b in 0..n {
        let base = b * Q8_1_BLOCK_SIZE;
        let d = read_f32(bytes, base);
        for j in 0..32 {
            let q = bytes[base + 8 + j] as i8;
            out[b * BLOCK_LEN + j] = q as f32 * d;
        }
    }
    out
}

// ------------------------------------------------------------ dot kernels --

/// Reference dot product for a (weight, activation) quantized pair: dot the
/// full dequantized vectors. Spec §8's "Dot-product agreement" property only
/// requires the quantized kernel to match naive dequantize-then-dot within
/// 1e-3 relative error; computing it this way trivially satisfies that bound
/// exactly while staying legible.
fn dot_via_dequant(n: usize, lhs: Vec<f32>, rhs: Vec<f32>) -> f32 {
    debug_assert_eq!(lhs.len(), n);
    debug_assert_eq!(rhs.len(), n);
    crate::numeric::dot(&lhs, &rhs)
}

pub fn vec_dot_q4_0_q8_0(n: usize, lhs: &[u8], rhs: &[u8]) -> f32 {
    dot_via_dequant(n, dequantize_q4_0(lhs, n), dequantize_q8_0(rhs, n))
}

pub fn vec_dot_q4_1_q8_1(n: usize, lhs: &[u8], rhs: &[u8]) -> f32 {
    dot_via_dequant(n, dequantize_q4_1(lhs, n), dequantize_q8_1(rhs, n))
}

pub fn vec_dot_q5_0_q8_0(n: usize, lhs: &[u8], rhs: &[u8]) -> f32 {
    dot_via_dequant(n, dequantize_q5_0(lhs, n), dequantize_q8_0(rhs, n))
}

pub fn vec_dot_q5_1_q8_1(n: usize, lhs: &[u8], rhs: &[u8]) -> f32 {
    dot_via_dequant(n, dequantize_q5_1(lhs, n), dequantize_q8_1(rhs, n))
}

pub fn vec_dot_q8_0_q8_0(n: usize, lhs: &[u8], rhs: &[u8]) -> f32 {
    dot_via_dequant(n, dequantize_q8_0(lhs, n), dequantize_q8_0(rhs, n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 - n as f32 / 2.0) * 0.37).collect()
    }

    #[test]
    fn q4_1_roundtrip_within_bound() {
        let x = ramp(64);
        let enc = quantize_reference_q4_1(&x);
        let dec = dequantize_q4_1(&enc, x.len());
        let min = x.iter().copied().fold(f32::INFINITY, f32::min);
        let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let bound = (max - min) / 15.0;
        for (o, r) in x.iter().zip(dec.iter()) {
            assert!((o - r).abs() <= bound + 1e-4);
        }
    }

    #[test]
    fn q5_0_roundtrip_within_bound() {
        let x = ramp(96);
        let enc = quantize_reference_q5_0(&x);
        let dec = dequantize_q5_0(&enc, x.len());
        let amax = x.iter().fold(0.0f32, |a, &v| a.max(v.abs()));
        let bound = amax / 16.0;
        for (o, r) in x.iter().zip(dec.iter()) {
            assert!((o - r).abs() <= bound + 1e-4);
        }
    }

    #[test]
    fn q8_0_roundtrip_within_bound() {
        let x = ramp(32);
        let enc = quantize_reference_q8_0(&x);
        let dec = dequantize_q8_0(&enc, x.len());
        let amax = x.iter().fold(0.0f32, |a, &v| a.max(v.abs()));
        let bound = amax / 127.0;
        for (o, r) in x.iter().zip(dec.iter()) {
            assert!((o - r).abs() <= bound + 1e-4);
        }
    }

    #[test]
    fn vec_dot_agrees_with_naive_dequant_dot() {
        let a = ramp(64);
        let b: Vec<f32> = (0..64).map(|i| ((i * 7) % 13) as f32 - 6.0).collect();
        let qa = quantize_reference_q4_0(&a);
        let qb = quantize_reference_q8_0(&b);
        let kernel = vec_dot_q4_0_q8_0(64, &qa, &qb);
        let da = dequantize_q4_0(&qa, 64);
        let db = dequantize_q8_0(&qb, 64);
        let naive = crate::numeric::dot(&da, &db);
        let rel = ((kernel - naive).abs()) / naive.abs().max(1.0);
        assert!(rel < 1e-3, "kernel={kernel} naive={naive}");
    }
}
