//! Numbered end-to-end scenarios (spec §8).

use ggmx::context::Context;
use ggmx::exec::Executor;
use ggmx::graph::Builder;
use ggmx::quant;
use ggmx::types::ElemType;

#[test]
fn scenario_1_q4_0_encode_decode_within_bound() {
    let x: Vec<f32> = (1..=32).map(|i| if i % 2 == 0 { -(i as f32) } else { i as f32 }).collect();
    let encoded = quant::legacy::quantize_reference_q4_0(&x);
    let decoded = quant::legacy::dequantize_q4_0(&encoded, x.len());
    let max_abs = x.iter().cloned().fold(0.0f32, |acc, v| acc.max(v.abs()));
    let bound = max_abs / 8.0;
    for (orig, got) in x.iter().zip(decoded.iter()) {
        assert!((orig - got).abs() <= bound, "{orig} vs {got} exceeds bound {bound}");
    }
}

#[test]
fn scenario_2_matmul_on_f32() {
    let mut ctx = Context::init(1 << 16, None, false).unwrap();
    // a's row i is A's i-th row, b's row j is B's j-th column, so
    // dot(a_i, b_j) lands on MUL_MAT's [m,n] output at index j*m+i.
    let a = ctx.new_tensor(ElemType::F32, [2, 2, 1, 1], true).unwrap();
    ctx.payload_f32_mut(a).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    let b = ctx.new_tensor(ElemType::F32, [2, 2, 1, 1], true).unwrap();
    ctx.payload_f32_mut(b).unwrap().copy_from_slice(&[5.0, 7.0, 6.0, 8.0]);

    let mut bld = Builder::new(&mut ctx, false);
    let c = bld.mul_mat(a, b).unwrap();
    Executor::new(1).run(&mut ctx, &[c]).unwrap();

    let out = ctx.payload_f32(c).unwrap();
    assert!((out[0] - 19.0).abs() < 1e-6);
    assert!((out[1] - 43.0).abs() < 1e-6);
    assert!((out[2] - 22.0).abs() < 1e-6);
    assert!((out[3] - 50.0).abs() < 1e-6);
}

#[test]
fn scenario_3_softmax_shape() {
    let mut ctx = Context::init(1 << 16, None, false).unwrap();
    let x = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
    ctx.payload_f32_mut(x).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    let mut bld = Builder::new(&mut ctx, false);
    let out = bld.soft_max(x).unwrap();
    Executor::new(1).run(&mut ctx, &[out]).unwrap();

    let y = ctx.payload_f32(out).unwrap();
    let sum: f32 = y.iter().sum();
    assert!((sum - 1.0).abs() < 1e-6);
    for w in y.windows(2) {
        assert!(w[1] > w[0]);
    }
}

#[test]
fn scenario_4_rms_norm() {
    let mut ctx = Context::init(1 << 16, None, false).unwrap();
    let x = ctx.new_tensor(ElemType::F32, [2, 1, 1, 1], true).unwrap();
    ctx.payload_f32_mut(x).unwrap().copy_from_slice(&[3.0, 4.0]);
    let mut bld = Builder::new(&mut ctx, false);
    let out = bld.rms_norm(x).unwrap();
    Executor::new(1).run(&mut ctx, &[out]).unwrap();

    let scale = 1.0 / 12.5f32.sqrt();
    let y = ctx.payload_f32(out).unwrap();
    assert!((y[0] - 3.0 * scale).abs() < 1e-3);
    assert!((y[1] - 4.0 * scale).abs() < 1e-3);
}

#[test]
fn scenario_5_graph_import_round_trip() {
    let mut ctx = Context::init(1 << 16, None, false).unwrap();
    let x = ctx.new_tensor(ElemType::F32, [2, 1, 1, 1], true).unwrap();
    ctx.set_name(x, "x");
    ctx.payload_f32_mut(x).unwrap().copy_from_slice(&[0.5, -0.5]);
    let b = ctx.new_tensor(ElemType::F32, [2, 1, 1, 1], true).unwrap();
    ctx.set_name(b, "b");
    ctx.payload_f32_mut(b).unwrap().copy_from_slice(&[1.0, 1.0]);
    let mut bld = Builder::new(&mut ctx, false);
    let added = bld.add(x, b).unwrap();
    let y = bld.gelu(added).unwrap();
    Executor::new(1).run(&mut ctx, &[added, y]).unwrap();
    let original = ctx.payload_f32(y).unwrap().to_vec();

    let mut buf = Vec::new();
    ggmx::io::export_graph(&ctx, &[x, b], &[added, y], 0, &mut buf).unwrap();

    let mut ctx2 = Context::init(1 << 16, None, false).unwrap();
    let mut cursor = std::io::Cursor::new(buf);
    let (_leaves2, nodes2) = ggmx::io::import_graph(&mut ctx2, &mut cursor).unwrap();
    Executor::new(1).run(&mut ctx2, &nodes2).unwrap();
    let reimported = ctx2.payload_f32(*nodes2.last().unwrap()).unwrap();

    assert_eq!(original, reimported);
}

#[test]
fn scenario_6_thread_determinism_on_mlp() {
    fn build_and_run(n_threads: usize) -> Vec<f32> {
        let mut ctx = Context::init(1 << 20, None, false).unwrap();
        let x = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        ctx.payload_f32_mut(x).unwrap().copy_from_slice(&[0.1, 0.2, 0.3, 0.4]);

        let w1 = ctx.new_tensor(ElemType::F32, [4, 8, 1, 1], true).unwrap();
        let w2 = ctx.new_tensor(ElemType::F32, [8, 8, 1, 1], true).unwrap();
        let w3 = ctx.new_tensor(ElemType::F32, [8, 4, 1, 1], true).unwrap();
        for (i, w) in [w1, w2, w3].into_iter().enumerate() {
            let buf = ctx.payload_f32_mut(w).unwrap();
            for (j, v) in buf.iter_mut().enumerate() {
                *v = ((i * 97 + j * 13) % 23) as f32 / 23.0 - 0.5;
            }
        }

        let mut bld = Builder::new(&mut ctx, false);
        let h1 = bld.mul_mat(w1, x).unwrap();
        let a1 = bld.relu(h1).unwrap();
        let h2 = bld.mul_mat(w2, a1).unwrap();
        let a2 = bld.relu(h2).unwrap();
        let h3 = bld.mul_mat(w3, a2).unwrap();
        let out = bld.soft_max(h3).unwrap();

        Executor::new(n_threads).run(&mut ctx, &[h1, a1, h2, a2, h3, out]).unwrap();
        ctx.payload_f32(out).unwrap().to_vec()
    }

    let single = build_and_run(1);
    let multi = build_and_run(4);
    assert_eq!(single, multi);
}
