//! L0: numeric primitives (spec §4.1).
//!
//! Free-standing element-wise and reduction routines over contiguous `f32`
//! spans, plus the FP16-rounded lookup tables for GELU/SiLU/exp that
//! downstream quantization tests depend on for determinism.

pub use half::f16;
use std::sync::OnceLock;

/// 65,536-entry FP16→FP16 table, built once at first use (spec §4.1, §9
/// "Global numeric tables" redesign: a process-wide `OnceLock` instead of a
/// per-context initialization check).
struct Tables {
    gelu: Box<[f16; 65536]>,
    gelu_quick: Box<[f16; 65536]>,
    silu: Box<[f16; 65536]>,
    exp: Box<[f16; 65536]>,
}

static TABLES: OnceLock<Tables> = OnceLock::new();

fn tables() -> &'static Tables {
    TABLES.get_or_init(|| {
        tracing::debug!("building GELU/SiLU/exp FP16 lookup tables (65536 entries each)");
        let mut gelu = Box::new([f16::ZERO; 65536]);
        let mut gelu_quick = Box::new([f16::ZERO; 65536]);
        let mut silu = Box::new([f16::ZERO; 65536]);
        let mut exp = Box::new([f16::ZERO; 65536]);
        for bits in 0u32..65536 {
            let x = f16::from_bits(bits as u16);
            let xf = x.to_f32();
            gelu[bits as usize] = f16::from_f32(gelu_exact(xf));
            gelu_quick[bits as usize] = f16::from_f32(gelu_quick_exact(xf));
            silu[bits as usize] = f16::from_f32(silu_exact(xf));
            exp[bits as usize] = f16::from_f32(xf.exp());
        }
        Tables {
            gelu,
            gelu_quick,
            silu,
            exp,
        }
    })
}

fn gelu_exact(x: f32) -> f32 {
    0.5 * x * (1.0 + ((2.0f32 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x * x * x)).tanh())
}

fn gelu_quick_exact(x: f32) -> f32 {
    x * (1.0 / (1.0 + (-1.702 * x).exp()))
}

fn silu_exact(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Rounds `x` to FP16 (round-to-nearest-even, the `half` crate's default
/// conversion), looks it up in the table, and expands back to `f32`. This
/// trades accuracy for determinism across platforms, as spec §4.1 mandates.
fn table_lookup(x: f32, table: &[f16; 65536]) -> f32 {
    let bits = f16::from_f32(x).to_bits();
    table[bits as usize].to_f32()
}

pub fn gelu(x: f32) -> f32 {
    table_lookup(x, &tables().gelu)
}

pub fn gelu_quick(x: f32) -> f32 {
    table_lookup(x, &tables().gelu_quick)
}

pub fn silu(x: f32) -> f32 {
    table_lookup(x, &tables().silu)
}

pub fn silu_backward(x: f32, dy: f32) -> f32 {
    let s = silu(x);
    let sigma = if x.abs() < 1e-20 {
        0.5
    } else {
        s / x
    };
    dy * (sigma * (1.0 + x * (1.0 - sigma)))
}

pub fn exp_f16(x: f32) -> f32 {
    table_lookup(x, &tables().exp)
}

// --- element-wise routines (spec §4.1 "Mandatory routines") ---

pub fn add(dst: &mut [f32], a: &[f32], b: &[f32]) {
    for ((d, &x), &y) in dst.iter_mut().zip(a).zip(b) {
        *d = x + y;
    }
}

pub fn sub(dst: &mut [f32], a: &[f32], b: &[f32]) {
    for ((d, &x), &y) in dst.iter_mut().zip(a).zip(b) {
        *d = x - y;
    }
}

pub fn mul(dst: &mut [f32], a: &[f32], b: &[f32]) {
    for ((d, &x), &y) in dst.iter_mut().zip(a).zip(b) {
        *d = x * y;
    }
}

pub fn div(dst: &mut [f32], a: &[f32], b: &[f32]) {
    for ((d, &x), &y) in dst.iter_mut().zip(a).zip(b) {
        *d = x / y;
    }
}

pub fn neg(dst: &mut [f32], a: &[f32]) {
    for (d, &x) in dst.iter_mut().zip(a) {
        *d = -x;
    }
}

pub fn sqr(dst: &mut [f32], a: &[f32]) {
    for (d, &x) in dst.iter_mut().zip(a) {
        *d = x * x;
    }
}

pub fn sqrt(dst: &mut [f32], a: &[f32]) {
    for (d, &x) in dst.iter_mut().zip(a) {
        *d = x.sqrt();
    }
}

pub fn log(dst: &mut [f32], a: &[f32]) {
    for (d, &x) in dst.iter_mut().zip(a) {
        *d = x.ln();
    }
}

pub fn abs(dst: &mut [f32], a: &[f32]) {
    for (d, &x) in dst.iter_mut().zip(a) {
        *d = x.abs();
    }
}

pub fn sgn(dst: &mut [f32], a: &[f32]) {
    for (d, &x) in dst.iter_mut().zip(a) {
        *d = if x > 0.0 {
            1.0
        } else if x < 0.0 {
            -1.0
        } else {
            0.0
        };
    }
}

pub fn step(dst: &mut [f32], a: &[f32]) {
    for (d, &x) in dst.iter_mut().zip(a) {
        *d = if x > 0.0 { 1.0 } else { 0.0 };
    }
}

pub fn relu(dst: &mut [f32], a: &[f32]) {
    for (d, &x) in dst.iter_mut().zip(a) {
        *d = x.max(0.0);
    }
}

pub fn tanh(dst: &mut [f32], a: &[f32]) {
    for (d, &x) in dst.iter_mut().zip(a) {
        *d = x.tanh();
    }
}

pub fn elu(dst: &mut [f32], a: &[f32]) {
    for (d, &x) in dst.iter_mut().zip(a) {
        *d = if x > 0.0 { x } else { x.exp() - 1.0 };
    }
}

pub fn scale(dst: &mut [f32], a: &[f32], v: f32) {
    for (d, &x) in dst.iter_mut().zip(a) {
        *d = x * v;
    }
}

/// `y += x * v` (spec §4.1 "mad").
pub fn mad(y: &mut [f32], x: &[f32], v: f32) {
    for (yi, &xi) in y.iter_mut().zip(x) {
        *yi += xi * v;
    }
}

/// Dot product, accumulated in `f64` then cast down (spec §4.1 "Reduction
/// orderings").
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let acc: f64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| x as f64 * y as f64)
        .sum();
    acc as f32
}

/// Pairwise-halving tree sum: deterministic regardless of how the caller
/// chooses to chunk the input across threads (spec §4.1, §5 "Determinism").
pub fn sum(a: &[f32]) -> f32 {
    fn rec(a: &[f64]) -> f64 {
        match a.len() {
            0 => 0.0,
            1 => a[0],
            n => {
                let mid = n / 2;
                rec(&a[..mid]) + rec(&a[mid..])
            }
        }
    }
    let widened: Vec<f64> = a.iter().map(|&x| x as f64).collect();
    rec(&widened) as f32
}

pub fn max(a: &[f32]) -> f32 {
    a.iter().copied().fold(f32::NEG_INFINITY, f32::max)
}

pub fn argmax(a: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_v = f32::NEG_INFINITY;
    for (i, &v) in a.iter().enumerate() {
        if v > best_v {
            best_v = v;
            best = i;
        }
    }
    best
}

pub fn norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

pub fn copy(dst: &mut [f32], a: &[f32]) {
    dst.copy_from_slice(a);
}

pub fn set(dst: &mut [f32], v: f32) {
    for d in dst.iter_mut() {
        *d = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gelu_table_is_monotonic_near_zero() {
        assert!(gelu(1.0) > gelu(0.0));
        assert!(gelu(0.0).abs() < 1e-3);
    }

    #[test]
    fn pairwise_sum_matches_naive_within_tolerance() {
        let data: Vec<f32> = (0..1000).map(|i| (i as f32).sin()).collect();
        let naive: f32 = data.iter().sum();
        assert!((sum(&data) - naive).abs() < 1e-2);
    }

    #[test]
    fn argmax_picks_first_max() {
        assert_eq!(argmax(&[1.0, 5.0, 5.0, 2.0]), 1);
    }
}
