//! Binary graph export/import, text dump, and GraphViz export (spec §6
//! "Persistence & introspection").
//!
//! The binary format is a flat, self-describing snapshot of a computation
//! graph: header, leaf table, node table. Leaves carry their payload bytes
//! inline; nodes carry only their shape and the indices of their operands,
//! since a node's value is recomputed by the executor rather than replayed
//! from the file.

use std::io::{Read, Write};

use crate::context::{Context, Tensor, TensorId};
use crate::errors::{GgmxResult, IoError};
use crate::types::{ElemType, OpTag};

const MAGIC: u32 = 0x67676D66;
const VERSION: u32 = 1;

/// Node-reference indices `>= N_MAX` refer to `nodes[idx - N_MAX]` rather
/// than `leaves[idx]` (spec §6 "argument indices").
const N_MAX: i32 = 4096;

fn elem_type_to_u32(t: ElemType) -> u32 {
    t as u32
}

fn elem_type_from_u32(v: u32) -> Option<ElemType> {
    use ElemType::*;
    const TABLE: [ElemType; 17] =
        [F32, F16, Q4_0, Q4_1, Q5_0, Q5_1, Q8_0, Q8_1, Q2_K, Q3_K, Q4_K, Q5_K, Q6_K, Q8_K, I8, I16, I32];
    TABLE.get(v as usize).copied()
}

fn op_tag_to_u32(op: OpTag) -> u32 {
    op as u32
}

fn op_tag_from_u32(v: u32) -> Option<OpTag> {
    use OpTag::*;
    const TABLE: [OpTag; 67] = [
        None, Dup, Neg, Abs, Sgn, Step, Tanh, Elu, Relu, Gelu, GeluQuick, Silu, SiluBack, Sqr, Sqrt, Log,
        Add, Add1, Acc, Sub, Mul, Div, Sum, SumRows, Mean, Argmax, Repeat, RepeatBack, Reshape, View,
        Permute, Transpose, Cont, Cpy, GetRows, GetRowsBack, Diag, DiagMaskInf, DiagMaskZero, Set, Norm,
        NormBack, RmsNorm, RmsNormBack, MulMat, OutProd, Scale, SoftMax, SoftMaxBack, Rope, RopeBack, Alibi,
        Clamp, Conv1d, Conv2d, FlashAttn, FlashFf, FlashAttnBack, WinPart, WinUnpart, MapUnary, MapBinary,
        MapCustom1, MapCustom2, MapCustom3, CrossEntropyLoss, CrossEntropyLossBack,
    ];
    TABLE.get(v as usize).copied()
}

fn write_u32(w: &mut impl Write, v: u32) -> GgmxResult<()> {
    w.write_all(&v.to_le_bytes()).map_err(IoError::from)?;
    Ok(())
}

fn write_u64(w: &mut impl Write, v: u64) -> GgmxResult<()> {
    w.write_all(&v.to_le_bytes()).map_err(IoError::from)?;
    Ok(())
}

fn write_i32(w: &mut impl Write, v: i32) -> GgmxResult<()> {
    w.write_all(&v.to_le_bytes()).map_err(IoError::from)?;
    Ok(())
}

fn read_u32(r: &mut impl Read) -> GgmxResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(IoError::from)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> GgmxResult<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(IoError::from)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i32(r: &mut impl Read) -> GgmxResult<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(IoError::from)?;
    Ok(i32::from_le_bytes(buf))
}

fn write_header(w: &mut impl Write, t: &Tensor) -> GgmxResult<()> {
    write_u32(w, elem_type_to_u32(t.elem_type))?;
    write_u32(w, op_tag_to_u32(t.op))?;
    write_u32(w, t.rank as u32)?;
    for k in 0..4 {
        write_u64(w, t.shape[k] as u64)?;
        write_u64(w, t.strides[k] as u64)?;
    }
    let name_bytes = t.name.as_str().as_bytes();
    let mut name_buf = [0u8; 64];
    let n = name_bytes.len().min(64);
    name_buf[..n].copy_from_slice(&name_bytes[..n]);
    w.write_all(&name_buf).map_err(IoError::from)?;
    Ok(())
}

struct RawHeader {
    elem_type: ElemType,
    op: OpTag,
    rank: usize,
    shape: [usize; 4],
    strides: [usize; 4],
    name: String,
}

fn read_header(r: &mut impl Read) -> GgmxResult<RawHeader> {
    let elem_type_raw = read_u32(r)?;
    let op_raw = read_u32(r)?;
    let rank = read_u32(r)? as usize;
    let mut shape = [0usize; 4];
    let mut strides = [0usize; 4];
    for k in 0..4 {
        shape[k] = read_u64(r)? as usize;
        strides[k] = read_u64(r)? as usize;
    }
    let mut name_buf = [0u8; 64];
    r.read_exact(&mut name_buf).map_err(IoError::from)?;
    let end = name_buf.iter().position(|&b| b == 0).unwrap_or(64);
    let name = String::from_utf8_lossy(&name_buf[..end]).into_owned();

    let elem_type = elem_type_from_u32(elem_type_raw)
        .ok_or(IoError::UnsupportedVersion(elem_type_raw))?;
    let op = op_tag_from_u32(op_raw).ok_or(IoError::UnsupportedVersion(op_raw))?;
    Ok(RawHeader { elem_type, op, rank, shape, strides, name })
}

/// Writes `graph` (already in post-order, as produced by a topological
/// visit of the root) plus its leaves to `w` per spec §6's byte layout.
pub fn export_graph(
    ctx: &Context,
    leaves: &[TensorId],
    nodes: &[TensorId],
    size_eval: u64,
    w: &mut impl Write,
) -> GgmxResult<()> {
    write_u32(w, MAGIC)?;
    write_u32(w, VERSION)?;
    write_u32(w, leaves.len() as u32)?;
    write_u32(w, nodes.len() as u32)?;
    write_u64(w, size_eval)?;

    for &id in leaves {
        let t = ctx.tensor(id);
        write_header(w, t)?;
        let payload = ctx.payload(id).unwrap_or(&[]);
        w.write_all(payload).map_err(IoError::from)?;
    }

    let node_pos: std::collections::HashMap<TensorId, usize> =
        nodes.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let leaf_pos: std::collections::HashMap<TensorId, usize> =
        leaves.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let arg_index = |id: Option<TensorId>| -> i32 {
        match id {
            None => -1,
            Some(t) => match node_pos.get(&t) {
                Some(&pos) => pos as i32 + N_MAX,
                None => leaf_pos.get(&t).map(|&pos| pos as i32).unwrap_or(-1),
            },
        }
    };

    for &id in nodes {
        let t = ctx.tensor(id);
        write_header(w, t)?;
        for s in t.src {
            write_i32(w, arg_index(s))?;
        }
        for o in t.opt {
            write_i32(w, arg_index(o))?;
        }
    }
    Ok(())
}

/// Reads a graph file written by [`export_graph`], allocating fresh tensors
/// in `ctx`. Returns `(leaves, nodes)` in file order.
pub fn import_graph(ctx: &mut Context, r: &mut impl Read) -> GgmxResult<(Vec<TensorId>, Vec<TensorId>)> {
    let magic = read_u32(r)?;
    if magic != MAGIC {
        return Err(IoError::BadMagic { expected: MAGIC, found: magic }.into());
    }
    let version = read_u32(r)?;
    if version != VERSION {
        return Err(IoError::UnsupportedVersion(version).into());
    }
    let n_leafs = read_u32(r)? as usize;
    let n_nodes = read_u32(r)? as usize;
    let _size_eval = read_u64(r)?;

    let mut leaves = Vec::with_capacity(n_leafs);
    for _ in 0..n_leafs {
        let h = read_header(r)?;
        let id = ctx.new_tensor(h.elem_type, h.shape, true)?;
        ctx.tensor_mut(id).rank = h.rank;
        ctx.tensor_mut(id).strides = h.strides;
        ctx.set_name(id, &h.name);
        let nbytes = ctx.tensor(id).byte_size();
        let mut payload = vec![0u8; nbytes];
        r.read_exact(&mut payload).map_err(IoError::from)?;
        if let Some(dst) = ctx.payload_mut(id) {
            dst.copy_from_slice(&payload);
        }
        leaves.push(id);
    }

    struct PendingNode {
        id: TensorId,
        op: OpTag,
        args: [i32; 6],
    }
    let mut pending = Vec::with_capacity(n_nodes);
    for _ in 0..n_nodes {
        let h = read_header(r)?;
        let id = ctx.new_tensor(h.elem_type, h.shape, true)?;
        ctx.tensor_mut(id).rank = h.rank;
        ctx.tensor_mut(id).strides = h.strides;
        ctx.set_name(id, &h.name);
        let mut args = [0i32; 6];
        for a in &mut args {
            *a = read_i32(r)?;
        }
        pending.push(PendingNode { id, op: h.op, args });
    }

    let resolve = |idx: i32, leaves: &[TensorId], nodes: &[TensorId]| -> GgmxResult<Option<TensorId>> {
        if idx < 0 {
            return Ok(None);
        }
        if idx >= N_MAX {
            let pos = (idx - N_MAX) as usize;
            return nodes.get(pos).copied().map(Some).ok_or(IoError::DanglingArgIndex(idx).into());
        }
        leaves.get(idx as usize).copied().map(Some).ok_or(IoError::DanglingArgIndex(idx).into())
    };

    let nodes: Vec<TensorId> = pending.iter().map(|p| p.id).collect();
    for p in &pending {
        let mut src = [None, None];
        for (i, s) in src.iter_mut().enumerate() {
            *s = resolve(p.args[i], &leaves, &nodes)?;
        }
        let mut opt = [None, None, None, None];
        for (i, o) in opt.iter_mut().enumerate() {
            *o = resolve(p.args[2 + i], &leaves, &nodes)?;
        }
        ctx.set_op(p.id, p.op, src, opt);
    }

    Ok((leaves, nodes))
}

/// Newline-delimited operator table with per-node timing, matching spec §6
/// "Text dump" (`graph_print`).
pub fn graph_print(ctx: &Context, nodes: &[TensorId]) -> String {
    let mut out = String::new();
    out.push_str(&format!("{:<4} {:<20} {:<16} {:>10} {:>8}\n", "idx", "name", "op", "us/call", "calls"));
    for (i, &id) in nodes.iter().enumerate() {
        let t = ctx.tensor(id);
        let per_call = if t.perf.calls > 0 { t.perf.time_us / t.perf.calls } else { 0 };
        out.push_str(&format!(
            "{:<4} {:<20} {:<16} {:>10} {:>8}\n",
            i,
            t.name.as_str(),
            format!("{:?}", t.op),
            per_call,
            t.perf.calls
        ));
    }
    out
}

/// GraphViz DOT export per spec §6: parameters yellow, gradients green,
/// leaves pink.
pub fn graph_dump_dot(ctx: &Context, leaves: &[TensorId], nodes: &[TensorId]) -> String {
    let mut out = String::new();
    out.push_str("digraph G {\n  rankdir=TB;\n  node [style=filled];\n");

    let grad_targets: std::collections::HashSet<TensorId> =
        nodes.iter().chain(leaves).filter_map(|&id| ctx.tensor(id).grad).collect();

    for &id in leaves {
        let t = ctx.tensor(id);
        out.push_str(&format!(
            "  n{} [label=\"{}\\n{:?}\" fillcolor=pink];\n",
            id.index(),
            t.name.as_str(),
            t.shape
        ));
    }
    for &id in nodes {
        let t = ctx.tensor(id);
        let color = if t.is_param {
            "gold"
        } else if grad_targets.contains(&id) {
            "palegreen"
        } else {
            "lightgrey"
        };
        out.push_str(&format!(
            "  n{} [label=\"{}\\n{:?}\" fillcolor={}];\n",
            id.index(),
            t.name.as_str(),
            t.op,
            color
        ));
        for s in t.src.iter().chain(t.opt.iter()).flatten() {
            out.push_str(&format!("  n{} -> n{};\n", s.index(), id.index()));
        }
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Builder;
    use crate::types::ElemType;

    #[test]
    fn export_then_import_round_trips_shape_and_payload() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        ctx.set_name(a, "a");
        ctx.payload_f32_mut(a).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let b = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        ctx.set_name(b, "b");
        ctx.payload_f32_mut(b).unwrap().copy_from_slice(&[5.0, 6.0, 7.0, 8.0]);
        let mut bld = Builder::new(&mut ctx, false);
        let c = bld.add(a, b).unwrap();

        let leaves = vec![a, b];
        let nodes = vec![c];
        let mut buf = Vec::new();
        export_graph(&ctx, &leaves, &nodes, 0, &mut buf).unwrap();

        let mut ctx2 = Context::init(1 << 16, None, false).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (leaves2, nodes2) = import_graph(&mut ctx2, &mut cursor).unwrap();

        assert_eq!(leaves2.len(), 2);
        assert_eq!(nodes2.len(), 1);
        assert_eq!(ctx2.payload_f32(leaves2[0]).unwrap(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ctx2.tensor(nodes2[0]).op, OpTag::Add);
        assert_eq!(ctx2.tensor(nodes2[0]).src[0], Some(leaves2[0]));
        assert_eq!(ctx2.tensor(nodes2[0]).src[1], Some(leaves2[1]));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut ctx = Context::init(1 << 12, None, false).unwrap();
        let mut buf = Vec::new();
        write_u32(&mut buf, 0xdeadbeef).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let err = import_graph(&mut ctx, &mut cursor).unwrap_err();
        assert!(matches!(err, crate::errors::GgmxError::Io(IoError::BadMagic { .. })));
    }

    #[test]
    fn graph_print_lists_one_row_per_node() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let a = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        let b = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        let mut bld = Builder::new(&mut ctx, false);
        let c = bld.add(a, b).unwrap();
        let text = graph_print(&ctx, &[c]);
        assert!(text.contains("Add"));
    }
}
