//! L2: context & tensor arena (spec §3 "Context (arena)", §4.3).
//!
//! A [`Context`] owns one bump-allocated primary region and an optional
//! scratch region. Tensors are small headers pushed into `Context::tensors`;
//! their payload lives at a byte offset into one of the two regions, never
//! behind a Rust reference — this is the arena-index redesign from spec §9
//! ("Cyclic/shared references"), which sidesteps reference-count cycles
//! entirely.

mod name;
mod tensor;

pub use name::BoundedName;
pub use tensor::{PerfCounters, Tensor};

use crate::graph::OpParams;

use std::sync::Mutex;

use crate::errors::ArenaError;
use crate::types::{ElemType, OpTag};

/// Index into a [`Context`]'s tensor vector. Never dereferenced directly —
/// always resolved through the owning `Context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u32);

impl TensorId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

const MAX_CONTEXTS: usize = 64;
static CONTEXT_SLOTS: Mutex<usize> = Mutex::new(0);

#[derive(Debug, Clone, Copy)]
enum Region {
    Primary,
    Scratch,
}

#[derive(Debug, Clone, Copy)]
enum Payload {
    None,
    Owned { region: Region, offset: usize, len: usize },
    View { of: TensorId },
}

struct Entry {
    header: Tensor,
    payload: Payload,
    /// Non-tensor operator parameters (spec §9 "Option tensors as parameter
    /// carriers" redesign) — replaces the source's I32/F32 option-tensor
    /// smuggling except where a parameter is genuinely tensor-valued.
    params: OpParams,
}

/// Saved scratch configuration for one level of `scratch_save`/`scratch_load`
/// nesting (spec §4.3 "a two-level stack").
#[derive(Clone, Copy)]
struct ScratchSnapshot {
    pos: usize,
    no_alloc: bool,
}

/// Bump-allocated arena owning tensor headers and (by default) their
/// payloads. Not `Send`/`Sync`: graph building is single-threaded per
/// context (spec §1 Non-goals, §5 "Context arena: not thread-safe for
/// mutation").
pub struct Context {
    primary: Vec<u8>,
    primary_pos: usize,
    scratch: Option<Vec<u8>>,
    scratch_pos: usize,
    scratch_stack: Vec<ScratchSnapshot>,
    no_alloc: bool,
    entries: Vec<Entry>,
    released: bool,
}

const ALIGN: usize = 16;

fn align_up(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}

impl Context {
    /// Reserves an aligned `mem_size`-byte region (owned, unless `buffer` is
    /// supplied) and registers the context against the global slot pool.
    /// Lazily touches the numeric tables and NUMA probe on the very first
    /// call (spec §4.3 "First-ever call lazily initializes ...").
    pub fn init(mem_size: usize, buffer: Option<Vec<u8>>, no_alloc: bool) -> Result<Self, ArenaError> {
        {
            let mut slots = CONTEXT_SLOTS.lock().expect("context slot mutex poisoned");
            if *slots >= MAX_CONTEXTS {
                return Err(ArenaError::OutOfSlots);
            }
            *slots += 1;
        }
        ensure_global_init();

        let primary = match buffer {
            Some(b) => b,
            None => {
                let mut v = Vec::new();
                v.try_reserve_exact(mem_size).map_err(|_| ArenaError::OutOfMemory {
                    requested: mem_size,
                    available: 0,
                })?;
                v.resize(mem_size, 0);
                v
            }
        };

        tracing::debug!(mem_size, no_alloc, "context initialized");

        Ok(Self {
            primary,
            primary_pos: 0,
            scratch: None,
            scratch_pos: 0,
            scratch_stack: Vec::with_capacity(2),
            no_alloc,
            entries: Vec::new(),
            released: false,
        })
    }

    /// Attaches a scratch region callers can redirect payload allocations
    /// into (spec §3 "Scratch region").
    pub fn set_scratch(&mut self, buf: Vec<u8>) {
        self.scratch = Some(buf);
        self.scratch_pos = 0;
    }

    /// Releases the context's slot. Live tensor ids become dangling; callers
    /// must not dereference them afterward (spec §4.3 "free").
    pub fn free(mut self) {
        self.released = true;
        let mut slots = CONTEXT_SLOTS.lock().expect("context slot mutex poisoned");
        *slots = slots.saturating_sub(1);
    }

    fn bump_primary(&mut self, len: usize) -> Result<usize, ArenaError> {
        let start = align_up(self.primary_pos, ALIGN);
        let end = start + len;
        if end > self.primary.len() {
            let requested = end - self.primary_pos;
            let available = self.primary.len().saturating_sub(self.primary_pos);
            tracing::warn!(requested, available, "context out of memory (primary region)");
            return Err(ArenaError::OutOfMemory { requested, available });
        }
        self.primary_pos = end;
        Ok(start)
    }

    fn bump_scratch(&mut self, len: usize) -> Result<usize, ArenaError> {
        let buf = self.scratch.as_ref().ok_or(ArenaError::NoScratch)?;
        let start = align_up(self.scratch_pos, ALIGN);
        let end = start + len;
        if end > buf.len() {
            let requested = end - self.scratch_pos;
            let available = buf.len().saturating_sub(self.scratch_pos);
            tracing::warn!(requested, available, "context out of memory (scratch region)");
            return Err(ArenaError::OutOfMemory { requested, available });
        }
        self.scratch_pos = end;
        Ok(start)
    }

    /// Appends a new tensor header, optionally reserving payload bytes
    /// (spec §4.3 "new_tensor"). Pass `with_data = false` under `no_alloc`
    /// (or while planning) to skip payload reservation entirely.
    pub fn new_tensor(
        &mut self,
        elem_type: ElemType,
        shape: [usize; 4],
        with_data: bool,
    ) -> Result<TensorId, ArenaError> {
        let rank = shape.iter().rev().position(|&d| d != 1).map(|p| 4 - p).unwrap_or(1).max(1);
        let header = Tensor::new(elem_type, rank, shape);

        let payload = if with_data && !self.no_alloc {
            let nbytes = header.byte_size();
            if self.scratch.is_some() {
                let off = self.bump_scratch(nbytes)?;
                Payload::Owned { region: Region::Scratch, offset: off, len: nbytes }
            } else {
                let off = self.bump_primary(nbytes)?;
                Payload::Owned { region: Region::Primary, offset: off, len: nbytes }
            }
        } else {
            Payload::None
        };

        self.entries.push(Entry { header, payload, params: OpParams::None });
        Ok(TensorId((self.entries.len() - 1) as u32))
    }

    /// Returns a new header aliasing `src`'s payload (spec §4.3
    /// "view_tensor"). Strides are copied from the source.
    pub fn view_tensor(&mut self, src: TensorId) -> TensorId {
        let header = self.entries[src.index()].header.clone();
        self.entries.push(Entry { header, payload: Payload::View { of: src }, params: OpParams::None });
        TensorId((self.entries.len() - 1) as u32)
    }

    /// Creates a new owning tensor with `src`'s shape and type (spec §4.3
    /// "dup_tensor").
    pub fn dup_tensor(&mut self, src: TensorId) -> Result<TensorId, ArenaError> {
        let (elem_type, shape) = {
            let h = &self.entries[src.index()].header;
            (h.elem_type, h.shape)
        };
        self.new_tensor(elem_type, shape, true)
    }

    pub fn set_name(&mut self, t: TensorId, s: &str) {
        self.entries[t.index()].header.name.set(s);
    }

    pub fn tensor(&self, t: TensorId) -> &Tensor {
        &self.entries[t.index()].header
    }

    pub fn tensor_mut(&mut self, t: TensorId) -> &mut Tensor {
        &mut self.entries[t.index()].header
    }

    fn payload_location(&self, t: TensorId) -> Option<(Region, usize, usize)> {
        match self.entries[t.index()].payload {
            Payload::None => None,
            Payload::Owned { region, offset, len } => Some((region, offset, len)),
            Payload::View { of } => self.payload_location(of),
        }
    }

    /// Raw payload bytes for `t`, or `None` for a header with no storage
    /// (e.g. planned-but-unallocated under `no_alloc`).
    pub fn payload(&self, t: TensorId) -> Option<&[u8]> {
        let (region, offset, len) = self.payload_location(t)?;
        let buf = match region {
            Region::Primary => &self.primary,
            Region::Scratch => self.scratch.as_ref().expect("scratch payload without scratch buffer"),
        };
        Some(&buf[offset..offset + len])
    }

    pub fn payload_mut(&mut self, t: TensorId) -> Option<&mut [u8]> {
        let (region, offset, len) = self.payload_location(t)?;
        let buf = match region {
            Region::Primary => &mut self.primary,
            Region::Scratch => self.scratch.as_mut().expect("scratch payload without scratch buffer"),
        };
        Some(&mut buf[offset..offset + len])
    }

    pub fn payload_f32(&self, t: TensorId) -> Option<&[f32]> {
        let bytes = self.payload(t)?;
        Some(bytemuck::cast_slice(bytes))
    }

    pub fn payload_f32_mut(&mut self, t: TensorId) -> Option<&mut [f32]> {
        let bytes = self.payload_mut(t)?;
        Some(bytemuck::cast_slice_mut(bytes))
    }

    /// Snapshots the current scratch offset and `no_alloc` flag. Supports
    /// one level of nesting (spec §4.3 "scratch_save/load").
    pub fn scratch_save(&mut self) -> Result<(), ArenaError> {
        if self.scratch_stack.len() >= 2 {
            return Err(ArenaError::ScratchStackFull);
        }
        self.scratch_stack.push(ScratchSnapshot { pos: self.scratch_pos, no_alloc: self.no_alloc });
        Ok(())
    }

    pub fn scratch_load(&mut self) {
        if let Some(snap) = self.scratch_stack.pop() {
            self.scratch_pos = snap.pos;
            self.no_alloc = snap.no_alloc;
        }
    }

    pub fn set_op(&mut self, t: TensorId, op: OpTag, src: [Option<TensorId>; 2], opt: [Option<TensorId>; 4]) {
        let h = &mut self.entries[t.index()].header;
        h.op = op;
        h.src = src;
        h.opt = opt;
    }

    pub fn set_grad(&mut self, t: TensorId, grad: TensorId) {
        self.entries[t.index()].header.grad = Some(grad);
    }

    pub fn set_param(&mut self, t: TensorId) {
        self.entries[t.index()].header.is_param = true;
    }

    pub fn set_op_params(&mut self, t: TensorId, params: OpParams) {
        self.entries[t.index()].params = params;
    }

    pub fn op_params(&self, t: TensorId) -> &OpParams {
        &self.entries[t.index()].params
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.released {
            let mut slots = CONTEXT_SLOTS.lock().expect("context slot mutex poisoned");
            *slots = slots.saturating_sub(1);
        }
    }
}

static GLOBAL_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_global_init() {
    GLOBAL_INIT.call_once(|| {
        let _ = crate::numeric::gelu(0.0);
        let topo = crate::sys::numa_topology();
        tracing::info!(nodes = topo.nodes.len(), "numa topology probed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tensor_allocates_within_primary_region() {
        let mut ctx = Context::init(4096, None, false).unwrap();
        let t = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        assert_eq!(ctx.tensor(t).rank, 1);
        assert_eq!(ctx.payload(t).unwrap().len(), 16);
    }

    #[test]
    fn out_of_memory_is_reported_with_byte_counts() {
        let mut ctx = Context::init(8, None, false).unwrap();
        let err = ctx.new_tensor(ElemType::F32, [1000, 1, 1, 1], true).unwrap_err();
        match err {
            ArenaError::OutOfMemory { requested, .. } => assert_eq!(requested, 4000),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn view_tensor_shares_payload() {
        let mut ctx = Context::init(4096, None, false).unwrap();
        let t = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        ctx.payload_f32_mut(t).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let view = ctx.view_tensor(t);
        assert_eq!(ctx.payload_f32(view).unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn scratch_save_restores_offset() {
        let mut ctx = Context::init(64, None, false).unwrap();
        ctx.set_scratch(vec![0u8; 64]);
        let _a = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        ctx.scratch_save().unwrap();
        let _b = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        assert_eq!(ctx.scratch_pos, 32);
        ctx.scratch_load();
        assert_eq!(ctx.scratch_pos, 16);
    }

    #[test]
    fn slot_pool_is_bounded() {
        let mut ctxs = Vec::new();
        for _ in 0..MAX_CONTEXTS {
            ctxs.push(Context::init(16, None, false).unwrap());
        }
        assert!(matches!(Context::init(16, None, false), Err(ArenaError::OutOfSlots)));
    }
}
