//! L7: training optimizers (spec §4.6 "Optimizer (brief)").
//!
//! Both optimizers reuse the executor's arena for their working state:
//! Adam's `(m, v)` moment buffers and L-BFGS's `(s, y)` history pairs are
//! ordinary tensors allocated through the same [`Context`], so optimization
//! can resume across calls the way the source keeps everything in one
//! bump-allocated region. Contracts (spec §4.6): the loss tensor is scalar,
//! its gradient is seeded to 1.0 by [`crate::backward::build_backward`], and
//! convergence compares `|Δf|/|f|` against `eps_f`.

use crate::context::{Context, TensorId};
use crate::errors::{GgmxResult, OptimizerConvergence};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self { lr: 0.001, beta1: 0.9, beta2: 0.999, eps: 1e-8, weight_decay: 0.0 }
    }
}

/// ADAM with decoupled weight decay. Moment buffers live in the arena
/// alongside the parameters they shadow.
pub struct Adam {
    config: AdamConfig,
    step: u64,
    moments: Vec<(TensorId, TensorId, TensorId)>,
}

impl Adam {
    pub fn new(ctx: &mut Context, params: &[TensorId], config: AdamConfig) -> GgmxResult<Self> {
        let mut moments = Vec::with_capacity(params.len());
        for &p in params {
            let (et, shape) = {
                let h = ctx.tensor(p);
                (h.elem_type, h.shape)
            };
            let m = ctx.new_tensor(et, shape, true)?;
            let v = ctx.new_tensor(et, shape, true)?;
            if let Some(buf) = ctx.payload_f32_mut(m) {
                buf.fill(0.0);
            }
            if let Some(buf) = ctx.payload_f32_mut(v) {
                buf.fill(0.0);
            }
            moments.push((p, m, v));
        }
        Ok(Self { config, step: 0, moments })
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Applies one ADAM update using each parameter's current `.grad`
    /// tensor. Parameters without a gradient (never touched by the
    /// backward pass) are left untouched.
    pub fn step(&mut self, ctx: &mut Context) -> GgmxResult<OptimizerConvergence> {
        self.step += 1;
        let t = self.step as f32;
        let bc1 = 1.0 - self.config.beta1.powf(t);
        let bc2 = 1.0 - self.config.beta2.powf(t);

        for &(p, m, v) in &self.moments {
            let Some(g) = ctx.tensor(p).grad else { continue };
            let grad = ctx.payload_f32(g).map(|s| s.to_vec()).unwrap_or_default();
            let m_prev = ctx.payload_f32(m).map(|s| s.to_vec()).unwrap_or_default();
            let v_prev = ctx.payload_f32(v).map(|s| s.to_vec()).unwrap_or_default();
            let param_prev = ctx.payload_f32(p).map(|s| s.to_vec()).unwrap_or_default();

            let mut m_next = vec![0.0f32; m_prev.len()];
            let mut v_next = vec![0.0f32; v_prev.len()];
            let mut param_next = param_prev.clone();
            for i in 0..param_prev.len() {
                m_next[i] = self.config.beta1 * m_prev[i] + (1.0 - self.config.beta1) * grad[i];
                v_next[i] = self.config.beta2 * v_prev[i] + (1.0 - self.config.beta2) * grad[i] * grad[i];
                let m_hat = m_next[i] / bc1;
                let v_hat = v_next[i] / bc2;
                param_next[i] -= self.config.lr * (m_hat / (v_hat.sqrt() + self.config.eps) + self.config.weight_decay * param_prev[i]);
            }
            if let Some(buf) = ctx.payload_f32_mut(m) {
                buf.copy_from_slice(&m_next);
            }
            if let Some(buf) = ctx.payload_f32_mut(v) {
                buf.copy_from_slice(&v_next);
            }
            if let Some(buf) = ctx.payload_f32_mut(p) {
                buf.copy_from_slice(&param_next);
            }
        }
        Ok(OptimizerConvergence::Ok)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSearch {
    Armijo,
    Wolfe,
    StrongWolfe,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LbfgsConfig {
    pub history: usize,
    pub max_iterations: usize,
    pub eps_f: f32,
    pub past: usize,
    pub line_search: LineSearch,
    pub min_step: f32,
    pub max_step: f32,
    pub max_linesearch: usize,
    pub c1: f32,
    pub c2: f32,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            history: 8,
            max_iterations: 100,
            eps_f: 1e-5,
            past: 0,
            line_search: LineSearch::Wolfe,
            min_step: 1e-20,
            max_step: 1e20,
            max_linesearch: 40,
            c1: 1e-4,
            c2: 0.9,
        }
    }
}

/// Closure contract for [`Lbfgs::minimize`]: given the current parameter
/// values already written into `ctx`, recompute the forward pass, run
/// [`crate::backward::build_backward`], and return the scalar loss. The
/// closure is responsible for leaving each parameter's `.grad` tensor
/// populated with the fresh gradient.
pub type EvalFn<'a> = dyn FnMut(&mut Context) -> GgmxResult<f32> + 'a;

/// L-BFGS with two-loop recursion and backtracking line search (spec §4.6).
/// History pairs `(s, y)` are arena tensors shadowing the parameter vector's
/// shape, capped at `config.history` entries (oldest dropped first).
pub struct Lbfgs {
    config: LbfgsConfig,
    params: Vec<TensorId>,
    history: Vec<(Vec<f32>, Vec<f32>)>,
    past_losses: Vec<f32>,
}

impl Lbfgs {
    pub fn new(params: &[TensorId], config: LbfgsConfig) -> Self {
        Self { config, params: params.to_vec(), history: Vec::new(), past_losses: Vec::new() }
    }

    fn flatten(&self, ctx: &Context, grads: bool) -> Vec<f32> {
        let mut out = Vec::new();
        for &p in &self.params {
            let src = if grads { ctx.tensor(p).grad.unwrap_or(p) } else { p };
            out.extend(ctx.payload_f32(src).unwrap_or(&[]));
        }
        out
    }

    fn scatter_params(&self, ctx: &mut Context, flat: &[f32]) {
        let mut offset = 0;
        for &p in &self.params {
            let len = ctx.payload_f32(p).map(|s| s.len()).unwrap_or(0);
            if let Some(buf) = ctx.payload_f32_mut(p) {
                buf.copy_from_slice(&flat[offset..offset + len]);
            }
            offset += len;
        }
    }

    fn two_loop_direction(&self, grad: &[f32]) -> Vec<f32> {
        let mut q = grad.to_vec();
        let mut alphas = vec![0.0f32; self.history.len()];
        for (i, (s, y)) in self.history.iter().enumerate().rev() {
            let rho = 1.0 / dot(y, s).max(1e-20);
            let alpha = rho * dot(s, &q);
            alphas[i] = alpha;
            for (qi, yi) in q.iter_mut().zip(y) {
                *qi -= alpha * yi;
            }
        }
        let gamma = self
            .history
            .last()
            .map(|(s, y)| dot(s, y) / dot(y, y).max(1e-20))
            .unwrap_or(1.0);
        for qi in q.iter_mut() {
            *qi *= gamma;
        }
        for (i, (s, y)) in self.history.iter().enumerate() {
            let rho = 1.0 / dot(y, s).max(1e-20);
            let beta = rho * dot(y, &q);
            for (qi, si) in q.iter_mut().zip(s) {
                *qi += si * (alphas[i] - beta);
            }
        }
        for qi in q.iter_mut() {
            *qi = -*qi;
        }
        q
    }

    /// Runs backtracking line search along `direction` starting at `x0`
    /// with loss `f0`, gradient `g0`. Returns `(step, x_new, f_new, g_new)`.
    fn line_search(
        &self,
        ctx: &mut Context,
        eval: &mut EvalFn,
        x0: &[f32],
        f0: f32,
        g0: &[f32],
        direction: &[f32],
    ) -> GgmxResult<(f32, Vec<f32>, f32, Vec<f32>)> {
        let dg0 = dot(g0, direction);
        let mut step = 1.0f32;
        for _ in 0..self.config.max_linesearch {
            let x_trial: Vec<f32> = x0.iter().zip(direction).map(|(x, d)| x + step * d).collect();
            self.scatter_params(ctx, &x_trial);
            let f_trial = eval(ctx)?;
            let g_trial = self.flatten(ctx, true);
            let armijo_ok = f_trial <= f0 + self.config.c1 * step * dg0;
            let curvature_ok = match self.config.line_search {
                LineSearch::Armijo => true,
                LineSearch::Wolfe => dot(&g_trial, direction) >= self.config.c2 * dg0,
                LineSearch::StrongWolfe => dot(&g_trial, direction).abs() <= self.config.c2 * dg0.abs(),
            };
            if armijo_ok && curvature_ok {
                return Ok((step, x_trial, f_trial, g_trial));
            }
            step *= 0.5;
            if step < self.config.min_step {
                break;
            }
        }
        let x_trial: Vec<f32> = x0.iter().zip(direction).map(|(x, d)| x + step * d).collect();
        self.scatter_params(ctx, &x_trial);
        let f_trial = eval(ctx)?;
        let g_trial = self.flatten(ctx, true);
        Ok((step, x_trial, f_trial, g_trial))
    }

    /// Minimizes the scalar returned by `eval`, iterating at most
    /// `config.max_iterations` times.
    pub fn minimize(&mut self, ctx: &mut Context, mut eval: impl FnMut(&mut Context) -> GgmxResult<f32>) -> GgmxResult<OptimizerConvergence> {
        let eval: &mut EvalFn = &mut eval;
        let mut f = eval(ctx)?;
        let mut x = self.flatten(ctx, false);
        let mut g = self.flatten(ctx, true);

        for iter in 0..self.config.max_iterations {
            let direction = if self.history.is_empty() { g.iter().map(|v| -v).collect() } else { self.two_loop_direction(&g) };

            if dot(&g, &direction) >= 0.0 {
                return Ok(OptimizerConvergence::Fail);
            }

            let (step, x_new, f_new, g_new) = self.line_search(ctx, eval, &x, f, &g, &direction)?;
            if step <= self.config.min_step {
                return Ok(OptimizerConvergence::MinimumStep);
            }
            if step >= self.config.max_step {
                return Ok(OptimizerConvergence::MaximumStep);
            }

            let s: Vec<f32> = x_new.iter().zip(&x).map(|(a, b)| a - b).collect();
            let y: Vec<f32> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
            if dot(&y, &s) > 1e-10 {
                self.history.push((s, y));
                if self.history.len() > self.config.history {
                    self.history.remove(0);
                }
            }

            let rel_change = (f - f_new).abs() / f_new.abs().max(1e-12);
            x = x_new;
            f = f_new;
            g = g_new;

            if self.config.past > 0 {
                self.past_losses.push(f);
                if self.past_losses.len() > self.config.past {
                    self.past_losses.remove(0);
                }
                if self.past_losses.len() == self.config.past {
                    let oldest = self.past_losses[0];
                    if (oldest - f).abs() / f.abs().max(1e-12) < self.config.eps_f {
                        return Ok(OptimizerConvergence::Ok);
                    }
                }
            } else if rel_change < self.config.eps_f {
                return Ok(OptimizerConvergence::Ok);
            }

            if iter + 1 == self.config.max_iterations {
                return Ok(OptimizerConvergence::MaximumIterations);
            }
        }
        Ok(OptimizerConvergence::DidNotConverge)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::graph::Builder;
    use crate::types::ElemType;

    #[test]
    fn adam_reduces_parameter_toward_zero_gradient() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let p = ctx.new_tensor(ElemType::F32, [4, 1, 1, 1], true).unwrap();
        ctx.payload_f32_mut(p).unwrap().copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);
        let mut bld = Builder::new(&mut ctx, true);
        bld.mark_param(p);
        let sum = bld.sum(p).unwrap();
        crate::backward::build_backward(&mut bld, sum).unwrap();

        let grad_node = ctx.tensor(p).grad.unwrap();
        crate::exec::Executor::new(1).run(&mut ctx, &[p, sum, grad_node]).unwrap();

        let mut adam = Adam::new(&mut ctx, &[p], AdamConfig::default()).unwrap();
        let before = ctx.payload_f32(p).unwrap().to_vec();
        adam.step(&mut ctx).unwrap();
        let after = ctx.payload_f32(p).unwrap();
        for i in 0..4 {
            assert!(after[i] < before[i]);
        }
    }

    #[test]
    fn lbfgs_minimizes_quadratic_bowl() {
        let mut ctx = Context::init(1 << 16, None, false).unwrap();
        let p = ctx.new_tensor(ElemType::F32, [2, 1, 1, 1], true).unwrap();
        ctx.payload_f32_mut(p).unwrap().copy_from_slice(&[3.0, -4.0]);
        let grad = ctx.new_tensor(ElemType::F32, [2, 1, 1, 1], true).unwrap();
        ctx.set_grad(p, grad);

        let mut lbfgs = Lbfgs::new(&[p], LbfgsConfig { max_iterations: 50, eps_f: 1e-8, ..Default::default() });
        let result = lbfgs
            .minimize(&mut ctx, |ctx| {
                let x = ctx.payload_f32(p).unwrap().to_vec();
                let f = x.iter().map(|v| v * v).sum::<f32>();
                let g = ctx.payload_f32_mut(grad).unwrap();
                for i in 0..g.len() {
                    g[i] = 2.0 * x[i];
                }
                Ok(f)
            })
            .unwrap();
        assert_eq!(result, OptimizerConvergence::Ok);
        for v in ctx.payload_f32(p).unwrap() {
            assert!(v.abs() < 1e-2);
        }
    }
}
