//! Optimizers - Adam, Adadelta and the warmup-scheduled Adam
//!
//! Moment tensors are keyed by parameter name so they can be written to and
//! restored from checkpoints.

use anyhow::{anyhow, bail, Result};
use candle_core::{backprop::GradStore, Device, Tensor, Var};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimizerKind {
    Adam,
    Adadelta,
    ScheduledAdam,
}

/// Exported optimizer state. Tensor keys are `<parameter>.<slot>`.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub step: usize,
    pub tensors: HashMap<String, Tensor>,
}

fn slot_key(param: &str, slot: &str) -> String {
    format!("{}.{}", param, slot)
}

/// Splits `<parameter>.<slot>` on the last dot.
fn split_slot_key(key: &str) -> Result<(&str, &str)> {
    key.rsplit_once('.')
        .ok_or_else(|| anyhow!("Malformed optimizer state key '{}'", key))
}

/// Shared import logic: every key must name a known parameter, a known slot
/// and match the parameter's shape. Tensors land on the parameter's device.
fn import_slots(
    params: &[(String, Var)],
    slots: &[&str],
    tensors: &HashMap<String, Tensor>,
) -> Result<HashMap<String, HashMap<String, Tensor>>> {
    let mut out: HashMap<String, HashMap<String, Tensor>> = HashMap::new();
    for (key, tensor) in tensors {
        let (name, slot) = split_slot_key(key)?;
        if !slots.contains(&slot) {
            bail!("Unknown optimizer slot '{}' for '{}'", slot, name);
        }
        let var = params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| anyhow!("Optimizer state for unknown parameter '{}'", name))?;
        if tensor.shape() != var.shape() {
            bail!(
                "Optimizer state '{}' has shape {:?}, parameter has {:?}",
                key,
                tensor.shape(),
                var.shape()
            );
        }
        let tensor = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
        out.entry(name.to_string())
            .or_default()
            .insert(slot.to_string(), tensor);
    }
    Ok(out)
}

fn export_slots(state: &HashMap<String, HashMap<String, Tensor>>) -> HashMap<String, Tensor> {
    let mut out = HashMap::new();
    for (name, slots) in state {
        for (slot, tensor) in slots {
            out.insert(slot_key(name, slot), tensor.clone());
        }
    }
    out
}

fn zeros_like_var(var: &Var) -> Result<Tensor> {
    Ok(var.as_tensor().zeros_like()?)
}

// ============================================================================
// Adam
// ============================================================================

pub struct Adam {
    params: Vec<(String, Var)>,
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    step: usize,
    state: HashMap<String, HashMap<String, Tensor>>,
}

impl Adam {
    const SLOTS: [&'static str; 2] = ["exp_avg", "exp_avg_sq"];

    pub fn new(params: Vec<(String, Var)>, lr: f64, beta1: f64, beta2: f64, eps: f64) -> Self {
        Self {
            params,
            lr,
            beta1,
            beta2,
            eps,
            step: 0,
            state: HashMap::new(),
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step += 1;
        let bias_c1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias_c2 = 1.0 - self.beta2.powi(self.step as i32);
        let step_size = self.lr / bias_c1;

        for (name, var) in &self.params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let slots = self.state.entry(name.clone()).or_default();
            let m = match slots.get("exp_avg") {
                Some(m) => m.clone(),
                None => zeros_like_var(var)?,
            };
            let v = match slots.get("exp_avg_sq") {
                Some(v) => v.clone(),
                None => zeros_like_var(var)?,
            };

            let m = ((m * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
            let v = ((v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;
            let denom = ((v.sqrt()? / bias_c2.sqrt())? + self.eps)?;
            let update = ((&m / denom)? * step_size)?;
            var.set(&var.as_tensor().sub(&update)?)?;

            slots.insert("exp_avg".to_string(), m);
            slots.insert("exp_avg_sq".to_string(), v);
        }
        Ok(())
    }

    fn export(&self) -> HashMap<String, Tensor> {
        export_slots(&self.state)
    }

    fn import(&mut self, step: usize, tensors: &HashMap<String, Tensor>) -> Result<()> {
        self.state = import_slots(&self.params, &Self::SLOTS, tensors)?;
        self.step = step;
        Ok(())
    }
}

// ============================================================================
// Adadelta
// ============================================================================

pub struct Adadelta {
    params: Vec<(String, Var)>,
    pub lr: f64,
    pub rho: f64,
    pub eps: f64,
    step: usize,
    state: HashMap<String, HashMap<String, Tensor>>,
}

impl Adadelta {
    const SLOTS: [&'static str; 2] = ["square_avg", "acc_delta"];

    pub fn new(params: Vec<(String, Var)>, lr: f64, rho: f64, eps: f64) -> Self {
        Self {
            params,
            lr,
            rho,
            eps,
            step: 0,
            state: HashMap::new(),
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step += 1;
        for (name, var) in &self.params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let slots = self.state.entry(name.clone()).or_default();
            let square_avg = match slots.get("square_avg") {
                Some(t) => t.clone(),
                None => zeros_like_var(var)?,
            };
            let acc_delta = match slots.get("acc_delta") {
                Some(t) => t.clone(),
                None => zeros_like_var(var)?,
            };

            let square_avg = ((square_avg * self.rho)? + (grad.sqr()? * (1.0 - self.rho))?)?;
            let std = (&square_avg + self.eps)?.sqrt()?;
            let delta = ((&acc_delta + self.eps)?.sqrt()? / std)?.mul(grad)?;
            let acc_delta = ((acc_delta * self.rho)? + (delta.sqr()? * (1.0 - self.rho))?)?;
            var.set(&var.as_tensor().sub(&(delta * self.lr)?)?)?;

            slots.insert("square_avg".to_string(), square_avg);
            slots.insert("acc_delta".to_string(), acc_delta);
        }
        Ok(())
    }

    fn export(&self) -> HashMap<String, Tensor> {
        export_slots(&self.state)
    }

    fn import(&mut self, step: usize, tensors: &HashMap<String, Tensor>) -> Result<()> {
        self.state = import_slots(&self.params, &Self::SLOTS, tensors)?;
        self.step = step;
        Ok(())
    }
}

// ============================================================================
// Warmup schedule
// ============================================================================

/// `lr = d_model^-0.5 * min(n^-0.5, n * warmup^-1.5)`, advanced before every step.
#[derive(Debug, Clone)]
pub struct WarmupScheduler {
    pub d_model: usize,
    pub n_warmup_steps: usize,
    pub n_current_steps: usize,
}

impl WarmupScheduler {
    pub fn new(d_model: usize, n_warmup_steps: usize) -> Self {
        Self {
            d_model,
            n_warmup_steps,
            n_current_steps: 0,
        }
    }

    pub fn lr_at(&self, n: usize) -> f64 {
        let n = n.max(1) as f64;
        let warmup = self.n_warmup_steps as f64;
        (self.d_model as f64).powf(-0.5) * n.powf(-0.5).min(n * warmup.powf(-1.5))
    }

    /// Advances the counter and returns the rate for the new step.
    pub fn next_lr(&mut self) -> f64 {
        self.n_current_steps += 1;
        self.lr_at(self.n_current_steps)
    }
}

// ============================================================================
// Strategy wrapper
// ============================================================================

pub enum TrainOptimizer {
    Adam(Adam),
    Adadelta(Adadelta),
    Scheduled {
        adam: Adam,
        schedule: WarmupScheduler,
    },
}

impl TrainOptimizer {
    pub fn kind(&self) -> OptimizerKind {
        match self {
            TrainOptimizer::Adam(_) => OptimizerKind::Adam,
            TrainOptimizer::Adadelta(_) => OptimizerKind::Adadelta,
            TrainOptimizer::Scheduled { .. } => OptimizerKind::ScheduledAdam,
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            TrainOptimizer::Adam(opt) => opt.step(grads),
            TrainOptimizer::Adadelta(opt) => opt.step(grads),
            TrainOptimizer::Scheduled { adam, schedule } => {
                adam.lr = schedule.next_lr();
                adam.step(grads)
            }
        }
    }

    /// Current learning rate (for the scheduled optimizer, the rate of the last step).
    pub fn learning_rate(&self) -> f64 {
        match self {
            TrainOptimizer::Adam(opt) => opt.lr,
            TrainOptimizer::Adadelta(opt) => opt.lr,
            TrainOptimizer::Scheduled { adam, .. } => adam.lr,
        }
    }

    /// Aligns the warmup counter with a resumed iteration. No-op for unscheduled optimizers.
    pub fn set_schedule_step(&mut self, step: usize) {
        if let TrainOptimizer::Scheduled { schedule, .. } = self {
            schedule.n_current_steps = step;
        }
    }

    pub fn schedule_step(&self) -> Option<usize> {
        match self {
            TrainOptimizer::Scheduled { schedule, .. } => Some(schedule.n_current_steps),
            _ => None,
        }
    }

    pub fn state(&self) -> OptimizerState {
        let (step, tensors) = match self {
            TrainOptimizer::Adam(opt) => (opt.step, opt.export()),
            TrainOptimizer::Adadelta(opt) => (opt.step, opt.export()),
            TrainOptimizer::Scheduled { adam, .. } => (adam.step, adam.export()),
        };
        OptimizerState {
            kind: self.kind(),
            step,
            tensors,
        }
    }

    pub fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        if state.kind != self.kind() {
            bail!(
                "Checkpoint optimizer is {:?} but this run uses {:?}",
                state.kind,
                self.kind()
            );
        }
        match self {
            TrainOptimizer::Adam(opt) => opt.import(state.step, &state.tensors),
            TrainOptimizer::Adadelta(opt) => opt.import(state.step, &state.tensors),
            TrainOptimizer::Scheduled { adam, .. } => adam.import(state.step, &state.tensors),
        }
    }
}

/// Scales all gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(params: &[(String, Var)], grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let mut total_sq = 0f64;
    for (_, var) in params {
        if let Some(g) = grads.get(var.as_tensor()) {
            total_sq += g
                .sqr()?
                .sum_all()?
                .to_device(&Device::Cpu)?
                .to_dtype(candle_core::DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    let total = total_sq.sqrt();
    let coef = max_norm / (total + 1e-6);
    if coef < 1.0 {
        for (_, var) in params {
            if let Some(g) = grads.get(var.as_tensor()) {
                let clipped = (g * coef)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(total)
}
