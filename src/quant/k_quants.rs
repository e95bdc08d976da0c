//! The seven "K" super-block quantized types, block length 256 (spec §4.2).
//!
//! Each super-block splits its 256 elements into equal-size groups, each
//! with its own affine (or symmetric) scale, and stores per-group codes
//! packed to the type's bit width. Per-group scale (and, where present,
//! minimum) are themselves quantized against a single f16/f32 super-block
//! scaler so the whole block fits its fixed byte budget. This mirrors the
//! two-level scaling ggml's K-quants use; the bit-packing here is this
//! engine's own scheme rather than a byte-for-byte port.

use super::{read_f16, read_f32, write_f16, write_f32};
use crate::numeric::f16;

pub const SUPER_BLOCK_LEN: usize = 256;

pub const Q2_K_BLOCK_SIZE: usize = 84;
pub const Q3_K_BLOCK_SIZE: usize = 110;
pub const Q4_K_BLOCK_SIZE: usize = 144;
pub const Q5_K_BLOCK_SIZE: usize = 176;
pub const Q6_K_BLOCK_SIZE: usize = 210;
pub const Q8_K_BLOCK_SIZE: usize = 292;

fn nsuper(len: usize) -> usize {
    assert_eq!(
        len % SUPER_BLOCK_LEN,
        0,
        "K-quantizer input must be a multiple of {SUPER_BLOCK_LEN}"
    );
    len / SUPER_BLOCK_LEN
}

/// LSB-first bit-packs `codes` (each `< 2^bits`) into bytes.
fn pack_codes(codes: &[u32], bits: u32) -> Vec<u8> {
    let total_bits = codes.len() * bits as usize;
    let mut out = vec![0u8; (total_bits + 7) / 8];
    let mut pos = 0usize;
    for &c in codes {
        for b in 0..bits {
            if (c >> b) & 1 == 1 {
                out[(pos + b as usize) / 8] |= 1 << ((pos + b as usize) % 8);
            }
        }
        pos += bits as usize;
    }
    out
}

fn unpack_codes(bytes: &[u8], bits: u32, count: usize) -> Vec<u32> {
    let mut out = Vec::with_capacity(count);
    let mut pos = 0usize;
    for _ in 0..count {
        let mut c = 0u32;
        for b in 0..bits {
            let byte = bytes[(pos + b as usize) / 8];
            let bit = (byte >> ((pos + b as usize) % 8)) & 1;
            c |= (bit as u32) << b;
        }
        out.push(c);
        pos += bits as usize;
    }
    out
}

/// Sign-extends the low `bits` bits of `code` to `i32`.
fn sign_extend(code: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((code << shift) as i32) >> shift
}

fn quantize_unsigned(v: f32, levels: u32) -> u32 {
    v.round().clamp(0.0, levels as f32) as u32
}

// ---------------------------------------------------------------- Q2_K ----
// 16 groups of 16. 2-bit codes. Per-group scale (4-bit unsigned) and
// minimum (4-bit signed), both scaled against block-wide `d`/`dmin`.

pub fn quantize_reference_q2_k(x: &[f32]) -> Vec<u8> {
    const NG: usize = 16;
    const GLEN: usize = 16;
    let nsb = nsuper(x.len());
    let mut out = vec![0u8; nsb * Q2_K_BLOCK_SIZE];
    for sb in 0..nsb {
        let block = &x[sb * SUPER_BLOCK_LEN..(sb + 1) * SUPER_BLOCK_LEN];
        let mut scale_g = [0f32; NG];
        let mut min_g = [0f32; NG];
        for g in 0..NG {
            let grp = &block[g * GLEN..(g + 1) * GLEN];
            let mn = grp.iter().copied().fold(f32::INFINITY, f32::min);
            let mx = grp.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            scale_g[g] = (mx - mn) / 3.0;
            min_g[g] = mn;
        }
        let d = scale_g.iter().cloned().fold(0.0f32, f32::max) / 15.0;
        let dmin = min_g.iter().fold(0.0f32, |a, &v| a.max(v.abs())) / 8.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        let idmin = if dmin != 0.0 { 1.0 / dmin } else { 0.0 };

        let base = sb * Q2_K_BLOCK_SIZE;
        write_f16(&mut out, base, f16::from_f32(d));
        write_f16(&mut out, base + 2, f16::from_f32(dmin));

        let mut codes = Vec::with_capacity(SUPER_BLOCK_LEN);
        for g in 0..NG {
            let scale_code = quantize_unsigned(scale_g[g] * id, 15);
            let min_code = (min_g[g] * idmin).round().clamp(-8.0, 7.0) as i32 as u32 & 0x0F;
            out[base + 4 + g] = (scale_code as u8 & 0x0F) | ((min_code as u8 & 0x0F) << 4);

            let sg = scale_code as f32 * d;
            let mg = sign_extend(min_code, 4) as f32 * dmin;
            let grp = &block[g * GLEN..(g + 1) * GLEN];
            for &v in grp {
                let c = if sg != 0.0 {
                    ((v - mg) / sg).round().clamp(0.0, 3.0) as u32
                } else {
                    0
                };
                codes.push(c);
            }
        }
        let packed = pack_codes(&codes, 2);
        out[base + 4 + NG..base + 4 + NG + packed.len()].copy_from_slice(&packed);
    }
    out
}

pub fn dequantize_q2_k(bytes: &[u8], len: usize) -> Vec<f32> {
    const NG: usize = 16;
    const GLEN: usize = 16;
    let nsb = nsuper(len);
    let mut out = vec![0f32; len];
    for sb in 0..nsb {
        let base = sb * Q2_K_BLOCK_SIZE;
        let d = read_f16(bytes, base).to_f32();
        let dmin = read_f16(bytes, base + 2).to_f32();
        let codes = unpack_codes(&bytes[base + 4 + NG..base + Q2_K_BLOCK_SIZE], 2, SUPER_BLOCK_LEN);
        for g in 0..NG {
            let byte = bytes[base + 4 + g];
            let scale_g = (byte & 0x0F) as f32 * d;
            let min_g = sign_extend((byte >> 4) as u32, 4) as f32 * dmin;
            for j in 0..GLEN {
                let c = codes[g * GLEN + j];
                out[sb * SUPER_BLOCK_LEN + g * GLEN + j] = c as f32 * scale_g + min_g;
            }
        }
    }
    out
}

// ---------------------------------------------------------------- Q3_K ----
// 16 groups of 16. 3-bit symmetric codes (zero point 4). Per-group scale
// only (6-bit unsigned), scaled against block-wide `d`.

pub fn quantize_reference_q3_k(x: &[f32]) -> Vec<u8> {
    const NG: usize = 16;
    const GLEN: usize = 16;
    let nsb = nsuper(x.len());
    let mut out = vec![0u8; nsb * Q3_K_BLOCK_SIZE];
    for sb in 0..nsb {
        let block = &x[sb * SUPER_BLOCK_LEN..(sb + 1) * SUPER_BLOCK_LEN];
        let mut scale_g = [0f32; NG];
        for g in 0..NG {
            let grp = &block[g * GLEN..(g + 1) * GLEN];
            let amax = grp.iter().fold(0f32, |a, &v| a.max(v.abs()));
            scale_g[g] = amax / 4.0;
        }
        let d = scale_g.iter().cloned().fold(0.0f32, f32::max) / 63.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };

        let base = sb * Q3_K_BLOCK_SIZE;
        write_f16(&mut out, base, f16::from_f32(d));

        let scale_codes: Vec<u32> = scale_g.iter().map(|&s| quantize_unsigned(s * id, 63)).collect();
        let packed_scales = pack_codes(&scale_codes, 6);
        out[base + 2..base + 2 + packed_scales.len()].copy_from_slice(&packed_scales);

        let mut codes = Vec::with_capacity(SUPER_BLOCK_LEN);
        for g in 0..NG {
            let sg = scale_codes[g] as f32 * d;
            let grp = &block[g * GLEN..(g + 1) * GLEN];
            for &v in grp {
                let c = if sg != 0.0 {
                    (v / sg + 4.0).round().clamp(0.0, 7.0) as u32
                } else {
                    4
                };
                codes.push(c);
            }
        }
        let packed_codes = pack_codes(&codes, 3);
        let codes_off = base + 2 + 12;
        out[codes_off..codes_off + packed_codes.len()].copy_from_slice(&packed_codes);
    }
    out
}

pub fn dequantize_q3_k(bytes: &[u8], len: usize) -> Vec<f32> {
    const NG: usize = 16;
    const GLEN: usize = 16;
    let nsb = nsuper(len);
    let mut out = vec![0f32; len];
    for sb in 0..nsb {
        let base = sb * Q3_K_BLOCK_SIZE;
        let d = read_f16(bytes, base).to_f32();
        let scale_codes = unpack_codes(&bytes[base + 2..base + 14], 6, NG);
        let codes = unpack_codes(&bytes[base + 14..base + Q3_K_BLOCK_SIZE], 3, SUPER_BLOCK_LEN);
        for g in 0..NG {
            let sg = scale_codes[g] as f32 * d;
            for j in 0..GLEN {
                let c = codes[g * GLEN + j] as f32 - 4.0;
                out[sb * SUPER_BLOCK_LEN + g * GLEN + j] = c * sg;
            }
        }
    }
    out
}

// ---------------------------------------------------------------- Q4_K ----
// 8 groups of 32. 4-bit affine codes. Per-group scale and minimum, each
// 6-bit, scaled against block-wide `d`/`dmin`.

pub fn quantize_reference_q4_k(x: &[f32]) -> Vec<u8> {
    const NG: usize = 8;
    const GLEN: usize = 32;
    let nsb = nsuper(x.len());
    let mut out = vec![0u8; nsb * Q4_K_BLOCK_SIZE];
    for sb in 0..nsb {
        let block = &x[sb * SUPER_BLOCK_LEN..(sb + 1) * SUPER_BLOCK_LEN];
        let mut scale_g = [0f32; NG];
        let mut min_g = [0f32; NG];
        for g in 0..NG {
            let grp = &block[g * GLEN..(g + 1) * GLEN];
            let mn = grp.iter().copied().fold(f32::INFINITY, f32::min);
            let mx = grp.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            scale_g[g] = (mx - mn) / 15.0;
            min_g[g] = mn;
        }
        let d = scale_g.iter().cloned().fold(0.0f32, f32::max) / 63.0;
        let dmin = min_g.iter().fold(0.0f32, |a, &v| a.max(v.abs())) / 32.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        let idmin = if dmin != 0.0 { 1.0 / dmin } else { 0.0 };

        let base = sb * Q4_K_BLOCK_SIZE;
        write_f16(&mut out, base, f16::from_f32(d));
        write_f16(&mut out, base + 2, f16::from_f32(dmin));

        let mut header_codes = Vec::with_capacity(NG * 2);
        let mut scale_codes = [0u32; NG];
        let mut min_codes = [0u32; NG];
        for g in 0..NG {
            scale_codes[g] = quantize_unsigned(scale_g[g] * id, 63);
            min_codes[g] = (min_g[g] * idmin).round().clamp(-32.0, 31.0) as i32 as u32 & 0x3F;
            header_codes.push(scale_codes[g]);
            header_codes.push(min_codes[g]);
        }
        let packed_header = pack_codes(&header_codes, 6);
        out[base + 4..base + 4 + packed_header.len()].copy_from_slice(&packed_header);

        let mut codes = Vec::with_capacity(SUPER_BLOCK_LEN);
        for g in 0..NG {
            let sg = scale_codes[g] as f32 * d;
            let mg = sign_extend(min_codes[g], 6) as f32 * dmin;
            let grp = &block[g * GLEN..(g + 1) * GLEN];
            for &v in grp {
                let c = if sg != 0.0 {
                    ((v - mg) / sg).round().clamp(0.0, 15.0) as u32
                } else {
                    0
                };
                codes.push(c);
            }
        }
        let packed_codes = pack_codes(&codes, 4);
        let off = base + 4 + 12;
        out[off..off + packed_codes.len()].copy_from_slice(&packed_codes);
    }
    out
}

pub fn dequantize_q4_k(bytes: &[u8], len: usize) -> Vec<f32> {
    const NG: usize = 8;
    const GLEN: usize = 32;
    let nsb = nsuper(len);
    let mut out = vec![0f32; len];
    for sb in 0..nsb {
        let base = sb * Q4_K_BLOCK_SIZE;
        let d = read_f16(bytes, base).to_f32();
        let dmin = read_f16(bytes, base + 2).to_f32();
        let header = unpack_codes(&bytes[base + 4..base + 16], 6, NG * 2);
        let codes = unpack_codes(&bytes[base + 16..base + Q4_K_BLOCK_SIZE], 4, SUPER_BLOCK_LEN);
        for g in 0..NG {
            let sg = header[g * 2] as f32 * d;
            let mg = sign_extend(header[g * 2 + 1], 6) as f32 * dmin;
            for j in 0..GLEN {
                let c = codes[g * GLEN + j];
                out[sb * SUPER_BLOCK_LEN + g * GLEN + j] = c as f32 * sg + mg;
            }
        }
    }
    out
}

// ---------------------------------------------------------------- Q5_K ----
// Identical group/header scheme to Q4_K, but 5-bit element codes.

pub fn quantize_reference_q5_k(x: &[f32]) -> Vec<u8> {
    const NG: usize = 8;
    const GLEN: usize = 32;
    let nsb = nsuper(x.len());
    let mut out = vec![0u8; nsb * Q5_K_BLOCK_SIZE];
    for sb in 0..nsb {
        let block = &x[sb * SUPER_BLOCK_LEN..(sb + 1) * SUPER_BLOCK_LEN];
        let mut scale_g = [0f32; NG];
        let mut min_g = [0f32; NG];
        for g in 0..NG {
            let grp = &block[g * GLEN..(g + 1) * GLEN];
            let mn = grp.iter().copied().fold(f32::INFINITY, f32::min);
            let mx = grp.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            scale_g[g] = (mx - mn) / 31.0;
            min_g[g] = mn;
        }
        let d = scale_g.iter().cloned().fold(0.0f32, f32::max) / 63.0;
        let dmin = min_g.iter().fold(0.0f32, |a, &v| a.max(v.abs())) / 32.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        let idmin = if dmin != 0.0 { 1.0 / dmin } else { 0.0 };

        let base = sb * Q5_K_BLOCK_SIZE;
        write_f16(&mut out, base, f16::from_f32(d));
        write_f16(&mut out, base + 2, f16::from_f32(dmin));

        let mut header_codes = Vec::with_capacity(NG * 2);
        let mut scale_codes = [0u32; NG];
        let mut min_codes = [0u32; NG];
        for g in 0..NG {
            scale_codes[g] = quantize_unsigned(scale_g[g] * id, 63);
            min_codes[g] = (min_g[g] * idmin).round().clamp(-32.0, 31.0) as i32 as u32 & 0x3F;
            header_codes.push(scale_codes[g]);
            header_codes.push(min_codes[g]);
        }
        let packed_header = pack_codes(&header_codes, 6);
        out[base + 4..base + 4 + packed_header.len()].copy_from_slice(&packed_header);

        let mut codes = Vec::with_capacity(SUPER_BLOCK_LEN);
        for g in 0..NG {
            let sg = scale_codes[g] as f32 * d;
            let mg = sign_extend(min_codes[g], 6) as f32 * dmin;
            let grp = &block[g * GLEN..(g + 1) * GLEN];
            for &v in grp {
                let c = if sg != 0.0 {
                    ((v - mg) / sg).round().clamp(0.0, 31.0) as u32
                } else {
                    0
                };
                codes.push(c);
            }
        }
        let packed_codes = pack_codes(&codes, 5);
        let off = base + 4 + 12;
        out[off..off + packed_codes.len()].copy_from_slice(&packed_codes);
    }
    out
}

pub fn dequantize_q5_k(bytes: &[u8], len: usize) -> Vec<f32> {
    const NG: usize = 8;
    const GLEN: usize = 32;
    let nsb = nsuper(len);
    let mut out = vec![0f32; len];
    for sb in 0..nsb {
        let base = sb * Q5_K_BLOCK_SIZE;
        let d = read_f16(bytes, base).to_f32();
        let dmin = read_f16(bytes, base + 2).to_f32();
        let header = unpack_codes(&bytes[base + 4..base + 16], 6, NG * 2);
        let codes = unpack_codes(&bytes[base + 16..base + Q5_K_BLOCK_SIZE], 5, SUPER_BLOCK_LEN);
        for g in 0..NG {
            let sg = header[g * 2] as f32 * d;
            let mg = sign_extend(header[g * 2 + 1], 6) as f32 * dmin;
            for j in 0..GLEN {
                let c = codes[g * GLEN + j];
                out[sb * SUPER_BLOCK_LEN + g * GLEN + j] = c as f32 * sg + mg;
            }
        }
    }
    out
}

// ---------------------------------------------------------------- Q6_K ----
// 16 groups of 16. 6-bit symmetric codes (zero point 32). Per-group signed
// i8 scale, scaled against block-wide `d`.

pub fn quantize_reference_q6_k(x: &[f32]) -> Vec<u8> {
    const NG: usize = 16;
    const GLEN: usize = 16;
    let nsb = nsuper(x.len());
    let mut out = vec![0u8; nsb * Q6_K_BLOCK_SIZE];
    for sb in 0..nsb {
        let block = &x[sb * SUPER_BLOCK_LEN..(sb + 1) * SUPER_BLOCK_LEN];
        let mut scale_g = [0f32; NG];
        for g in 0..NG {
            let grp = &block[g * GLEN..(g + 1) * GLEN];
            let amax = grp.iter().fold(0f32, |a, &v| a.max(v.abs()));
            scale_g[g] = amax / 32.0;
        }
        let d = scale_g.iter().cloned().fold(0.0f32, f32::max) / 127.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };

        let base = sb * Q6_K_BLOCK_SIZE;
        write_f16(&mut out, base, f16::from_f32(d));

        let mut scale_codes = [0i8; NG];
        for g in 0..NG {
            scale_codes[g] = (scale_g[g] * id).round().clamp(-128.0, 127.0) as i8;
            out[base + 2 + g] = scale_codes[g] as u8;
        }

        let mut codes = Vec::with_capacity(SUPER_BLOCK_LEN);
        for g in 0..NG {
            let sg = scale_codes[g] as f32 * d;
            let grp = &block[g * GLEN..(g + 1) * GLEN];
            for &v in grp {
                let c = if sg != 0.0 {
                    (v / sg + 32.0).round().clamp(0.0, 63.0) as u32
                } else {
                    32
                };
                codes.push(c);
            }
        }
        let packed = pack_codes(&codes, 6);
        let off = base + 2 + NG;
        out[off..off + packed.len()].copy_from_slice(&packed);
    }
    out
}

pub fn dequantize_q6_k(bytes: &[u8], len: usize) -> Vec<f32> {
    const NG: usize = 16;
    const GLEN: usize = 16;
    let nsb = nsuper(len);
    let mut out = vec![0f32; len];
    for sb in 0..nsb {
        let base = sb * Q6_K_BLOCK_SIZE;
        let d = read_f16(bytes, base).to_f32();
        let codes = unpack_codes(&bytes[base + 2 + NG..base + Q6_K_BLOCK_SIZE], 6, SUPER_BLOCK_LEN);
        for g in 0..NG {
            let scale_code = bytes[base + 2 + g] as i8;
            let sg = scale_code as f32 * d;
            for j in 0..GLEN {
                let c = codes[g * GLEN + j] as f32 - 32.0;
                out[sb * SUPER_BLOCK_LEN + g * GLEN + j] = c * sg;
            }
        }
    }
    out
}

// ---------------------------------------------------------------- Q8_K ----
// Single super-block scale, 8-bit codes stored verbatim, plus per-group
// (16-wide) sums of the quantized codes for dot-product bias correction.

pub fn quantize_reference_q8_k(x: &[f32]) -> Vec<u8> {
    const NG: usize = 16;
    const GLEN: usize = 16;
    let nsb = nsuper(x.len());
    let mut out = vec![0u8; nsb * Q8_K_BLOCK_SIZE];
    for sb in 0..nsb {
        let block = &x[sb * SUPER_BLOCK_LEN..(sb + 1) * SUPER_BLOCK_LEN];
        let amax = block.iter().fold(0f32, |a, &v| a.max(v.abs()));
        let d = amax / 127.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };

        let base = sb * Q8_K_BLOCK_SIZE;
        write_f32(&mut out, base, d);

        let mut qs = [0i8; SUPER_BLOCK_LEN];
        for (j, &v) in block.iter().enumerate() {
            qs[j] = (v * id).round().clamp(-128.0, 127.0) as i8;
        }
        for (j, &q) in qs.iter().enumerate() {
            out[base + 4 + j] = q as u8;
        }
        for g in 0..NG {
            let sum: i32 = qs[g * GLEN..(g + 1) * GLEN].iter().map(|&q| q as i32).sum();
            let off = base + 4 + SUPER_BLOCK_LEN + g * 2;
            out[off..off + 2].copy_from_slice(&(sum as i16).to_le_bytes());
        }
    }
    out
}

pub fn dequantize_q8_k(bytes: &[u8], len: usize) -> Vec<f32> {
    let nsb = nsuper(len);
    let mut out = vec![0f32; len];
    for sb in 0..nsb {
        let base = sb * Q8_K_BLOCK_SIZE;
        let d = read_f32(bytes, base);
        for j in 0..SUPER_BLOCK_LEN {
            let q = bytes[base + 4 + j] as i8;
            out[sb * SUPER_BLOCK_LEN + j] = q as f32 * d;
        }
    }
    out
}

// ------------------------------------------------------------ dot kernels --

fn dot_via_dequant(lhs: Vec<f32>, rhs: Vec<f32>) -> f32 {
    crate::numeric::dot(&lhs, &rhs)
}

macro_rules! k_dot {
    ($fn_name:ident, $deq_lhs:path) => {
        pub fn $fn_name(n: usize, lhs: &[u8], rhs: &[u8]) -> f32 {
            dot_via_dequant($deq_lhs(lhs, n), dequantize_q8_k(rhs, n))
        }
    };
}

k_dot!(vec_dot_q2_k_q8_k, dequantize_q2_k);
k_dot!(vec_dot_q3_k_q8_k, dequantize_q3_k);
k_dot!(vec_dot_q4_k_q8_k, dequantize_q4_k);
k_dot!(vec_dot_q5_k_q8_k, dequantize_q5_k);
k_dot!(vec_dot_q6_k_q8_k, dequantize_q6_k);

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 - n as f32 / 2.0) * 0.29).collect()
    }

    #[test]
    fn q2_k_roundtrip_is_bounded() {
        let x = ramp(256);
        let enc = quantize_reference_q2_k(&x);
        let dec = dequantize_q2_k(&enc, x.len());
        let amax = x.iter().fold(0f32, |a, &v| a.max(v.abs()));
        for (o, r) in x.iter().zip(dec.iter()) {
            assert!((o - r).abs() <= amax + 1e-3, "orig={o} rt={r}");
        }
    }

    #[test]
    fn q4_k_roundtrip_is_tighter_than_q2_k() {
        let x = ramp(256);
        let enc4 = quantize_reference_q4_k(&x);
        let dec4 = dequantize_q4_k(&enc4, x.len());
        let enc2 = quantize_reference_q2_k(&x);
        let dec2 = dequantize_q2_k(&enc2, x.len());
        let err4: f32 = x.iter().zip(dec4.iter()).map(|(o, r)| (o - r).abs()).sum();
        let err2: f32 = x.iter().zip(dec2.iter()).map(|(o, r)| (o - r).abs()).sum();
        assert!(err4 < err2, "4-bit total error {err4} should beat 2-bit {err2}");
    }

    #[test]
    fn q6_k_roundtrip_is_bounded() {
        let x = ramp(512);
        let enc = quantize_reference_q6_k(&x);
        let dec = dequantize_q6_k(&enc, x.len());
        let amax = x.iter().fold(0f32, |a, &v| a.max(v.abs()));
        for (o, r) in x.iter().zip(dec.iter()) {
            assert!((o - r).abs() <= amax * 0.1 + 1e-3, "orig={o} rt={r}");
        }
    }

    #[test]
    fn q8_k_roundtrip_is_tight() {
        let x = ramp(256);
        let enc = quantize_reference_q8_k(&x);
        let dec = dequantize_q8_k(&enc, x.len());
        let amax = x.iter().fold(0f32, |a, &v| a.max(v.abs()));
        let bound = amax / 127.0;
        for (o, r) in x.iter().zip(dec.iter()) {
            assert!((o - r).abs() <= bound + 1e-4);
        }
    }

    #[test]
    fn pack_unpack_roundtrip_all_widths() {
        for bits in 1..=7u32 {
            let levels = (1u32 << bits) - 1;
            let codes: Vec<u32> = (0..50).map(|i| (i * 7) % (levels + 1)).collect();
            let packed = pack_codes(&codes, bits);
            let unpacked = unpack_codes(&packed, bits, codes.len());
            assert_eq!(codes, unpacked);
        }
    }
}
