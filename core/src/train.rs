//! Training loop that keeps parameters and running statistics apart.
//!
//! After initialization the variables are split into the `params`
//! collection and everything else. Each step merges them for reading, runs
//! the objective with only `batch_stats` mutable, applies gradient descent
//! to the parameters and carries the returned statistics forward as-is.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::apply::{self, apply_step, Mutability, BATCH_STATS, PARAMS};
use crate::checkpoint::Checkpoint;
use crate::config::TrainConfig;
use crate::error::{StoreError, TreeError};
use crate::init::Initializer;
use crate::layers::{Batch, Objective, Regressor};
use crate::partition::{merge, split, update_collections};
use crate::tree::{Array, VariableTree};

// ---------------------------------------------------------------------------
// Optimizer
// ---------------------------------------------------------------------------

/// Plain gradient descent with an explicit learning rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sgd {
    learning_rate: f64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Sgd { learning_rate }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// `params - learning_rate * grads`, leaf by leaf. Both trees must have
    /// the same structure and shapes.
    pub fn update(&self, params: &VariableTree, grads: &VariableTree) -> Result<VariableTree, TreeError> {
        let lr = self.learning_rate;
        params.try_zip_leaves(grads, |_, p, g| p.zip_map(g, |p, g| p - lr * g))
    }
}

// ---------------------------------------------------------------------------
// TrainState
// ---------------------------------------------------------------------------

/// Parameters and non-trainable state, kept in separate trees.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrainState {
    pub step: u64,
    /// Holds only the `params` collection.
    pub params: VariableTree,
    /// Every other collection.
    pub state: VariableTree,
}

impl TrainState {
    /// Split freshly initialized variables. Fails with `KeyNotFound` if
    /// there is no `params` collection.
    pub fn from_variables(variables: VariableTree) -> Result<Self, TreeError> {
        let (params, state) = split(variables, PARAMS)?;
        Ok(TrainState {
            step: 0,
            params,
            state,
        })
    }

    pub fn from_checkpoint(checkpoint: Checkpoint) -> Result<Self, TreeError> {
        let mut state = Self::from_variables(checkpoint.variables)?;
        state.step = checkpoint.step;
        Ok(state)
    }

    /// All variables merged back into one tree.
    pub fn variables(&self) -> Result<VariableTree, TreeError> {
        merge(self.params.clone(), self.state.clone())
    }

    pub fn to_checkpoint(&self) -> Result<Checkpoint, TreeError> {
        Ok(Checkpoint {
            step: self.step,
            variables: self.variables()?,
        })
    }
}

/// Metrics returned after each training step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Step count after this step.
    pub step: u64,
    pub loss: f64,
    /// L2 norm over all gradient leaves.
    pub grad_norm: f64,
}

/// Run one optimization step.
///
/// `state` is not modified; the caller decides whether to keep it. A step
/// whose loss, gradients or resulting variables are not finite fails with
/// `Diverged`, so the last state handed out is always finite.
pub fn train_step(
    objective: &Objective,
    state: &TrainState,
    batch: &Batch,
    opt: &Sgd,
) -> Result<(TrainState, StepMetrics), TreeError> {
    let variables = state.variables()?;
    let mutable = Mutability::collections([BATCH_STATS]);
    let (out, updates) = apply_step(objective, batch, &mutable, &variables)?;

    let grad_norm = out
        .grads
        .flatten()
        .values()
        .map(Array::sum_squares)
        .sum::<f64>()
        .sqrt();
    let params = opt.update(&state.params, &out.grads)?;
    let finite = |tree: &VariableTree| tree.flatten().values().all(Array::is_finite);
    if !(out.loss.is_finite() && grad_norm.is_finite() && finite(&params) && finite(&updates)) {
        return Err(TreeError::Diverged {
            step: state.step + 1,
            loss: out.loss,
            grad_norm,
        });
    }
    let next = TrainState {
        step: state.step + 1,
        params,
        state: update_collections(state.state.clone(), updates),
    };
    let metrics = StepMetrics {
        step: next.step,
        loss: out.loss,
        grad_norm,
    };
    Ok((next, metrics))
}

/// Mean squared error in evaluation mode. Nothing is written.
pub fn evaluate(model: &Regressor, variables: &VariableTree, batch: &Batch) -> Result<f64, TreeError> {
    let objective = Objective::new(model.with_running_average(true));
    Ok(apply::apply(&objective, batch, variables)?.loss)
}

// ---------------------------------------------------------------------------
// Synthetic data
// ---------------------------------------------------------------------------

/// Batches from a hidden affine map over shifted, scaled inputs.
///
/// Inputs are `shift + spread * z` with standard normal `z`; targets are
/// `z · weights + bias` plus Gaussian noise, so a batch-normalized dense
/// layer can fit them exactly.
#[derive(Debug, Clone)]
pub struct SyntheticRegression {
    rng: StdRng,
    weights: Array,
    bias: Array,
    shift: Array,
    spread: Array,
    noise: f64,
}

impl SyntheticRegression {
    pub fn new(seed: u64, features: usize, outputs: usize, noise: f64) -> Result<Self, TreeError> {
        let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed_da7a);
        let unit = Initializer::Uniform { low: -1.0, high: 1.0 };
        let weights = unit.sample(&[features, outputs], &mut rng)?;
        let bias = unit.sample(&[outputs], &mut rng)?;
        let shift = Initializer::Uniform { low: -3.0, high: 3.0 }.sample(&[features], &mut rng)?;
        let spread = Initializer::Uniform { low: 0.5, high: 4.0 }.sample(&[features], &mut rng)?;
        Ok(SyntheticRegression {
            rng,
            weights,
            bias,
            shift,
            spread,
            noise,
        })
    }

    pub fn from_config(config: &TrainConfig) -> Result<Self, TreeError> {
        Self::new(config.seed, config.features, config.outputs, config.noise)
    }

    /// Per-feature mean of the generated inputs.
    pub fn shift(&self) -> &Array {
        &self.shift
    }

    /// Per-feature standard deviation of the generated inputs.
    pub fn spread(&self) -> &Array {
        &self.spread
    }

    pub fn next_batch(&mut self, batch_size: usize) -> Result<Batch, TreeError> {
        let features = self.shift.len();
        let outputs = self.bias.len();
        let z = Initializer::Normal { stddev: 1.0 }.sample(&[batch_size, features], &mut self.rng)?;
        let inputs = z
            .zip_rows(&self.spread, |z, s| z * s)?
            .zip_rows(&self.shift, |x, m| x + m)?;
        let noise = Initializer::Normal { stddev: self.noise }.sample(&[batch_size, outputs], &mut self.rng)?;
        let targets = z
            .matmul(&self.weights)?
            .zip_rows(&self.bias, |y, b| y + b)?
            .zip_map(&noise, |y, e| y + e)?;
        Ok(Batch { inputs, targets })
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Owns the model, optimizer, data source and state of one run.
#[derive(Debug)]
pub struct Trainer {
    config: TrainConfig,
    objective: Objective,
    optimizer: Sgd,
    data: SyntheticRegression,
    state: TrainState,
}

impl Trainer {
    /// Initialize a fresh run from `config`.
    pub fn new(config: TrainConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let model = Regressor::new(config.outputs, config.momentum, config.epsilon);
        let mut data = SyntheticRegression::from_config(&config)?;
        let sample = data.next_batch(config.batch_size)?;
        let variables = apply::init(&model, config.seed, &sample.inputs)?;
        info!(
            seed = config.seed,
            params = variables.collection(PARAMS).map(|n| n.element_count()).unwrap_or(0),
            collections = ?variables.collection_names(),
            "initialized model"
        );
        let state = TrainState::from_variables(variables)?;
        Ok(Self::assemble(config, model, data, state))
    }

    /// Continue a run from a checkpoint. The data stream restarts from the
    /// configured seed.
    pub fn resume(config: TrainConfig, checkpoint: Checkpoint) -> Result<Self, StoreError> {
        config.validate()?;
        let model = Regressor::new(config.outputs, config.momentum, config.epsilon);
        let data = SyntheticRegression::from_config(&config)?;
        let state = TrainState::from_checkpoint(checkpoint)?;
        info!(step = state.step, "resumed from checkpoint");
        Ok(Self::assemble(config, model, data, state))
    }

    fn assemble(config: TrainConfig, model: Regressor, data: SyntheticRegression, state: TrainState) -> Self {
        Trainer {
            optimizer: Sgd::new(config.learning_rate),
            objective: Objective::new(model),
            config,
            data,
            state,
        }
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn model(&self) -> &Regressor {
        &self.objective.model
    }

    pub fn state(&self) -> &TrainState {
        &self.state
    }

    pub fn data(&self) -> &SyntheticRegression {
        &self.data
    }

    /// Draw a batch and take one step.
    pub fn step(&mut self) -> Result<StepMetrics, TreeError> {
        let batch = self.data.next_batch(self.config.batch_size)?;
        let (next, metrics) = train_step(&self.objective, &self.state, &batch, &self.optimizer)?;
        self.state = next;
        debug!(step = metrics.step, loss = metrics.loss, "train step");
        Ok(metrics)
    }

    /// Step until the configured total is reached.
    pub fn fit(&mut self) -> Result<Vec<StepMetrics>, TreeError> {
        let mut history = Vec::new();
        while self.state.step < self.config.steps {
            let metrics = self.step()?;
            let log_every = self.config.log_every;
            if log_every > 0 && (metrics.step % log_every == 0 || metrics.step == self.config.steps) {
                info!(
                    step = metrics.step,
                    loss = metrics.loss,
                    grad_norm = metrics.grad_norm,
                    "training progress"
                );
            }
            history.push(metrics);
        }
        Ok(history)
    }

    /// Evaluation-mode loss on a fresh batch.
    pub fn evaluate(&mut self) -> Result<f64, TreeError> {
        let batch = self.data.next_batch(self.config.batch_size)?;
        evaluate(&self.objective.model, &self.state.variables()?, &batch)
    }

    pub fn checkpoint(&self) -> Result<Checkpoint, TreeError> {
        self.state.to_checkpoint()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
