//! `ggmx` is a single-process tensor computation engine for neural-network
//! inference and lightweight training.
//!
//! Callers build a lazily-scheduled dataflow graph against a bump-allocated
//! [`Context`](context::Context), then hand the resulting execution graph to
//! an [`exec::Executor`] that runs operator kernels in topological order on a
//! barrier-synchronized worker pool.

pub mod errors;
pub mod types;
pub mod numeric;
pub mod quant;
pub mod context;
pub mod graph;
pub mod backward;
pub mod exec;
pub mod kernels;
pub mod optim;
pub mod io;
pub mod sys;

pub use context::{Context, Tensor, TensorId};
pub use errors::{GgmxError, GgmxResult};
pub use types::{ElemType, OpTag};
