//! A small regression model: batch normalization followed by a dense layer.
//!
//! Batch norm owns both kinds of variables: `scale`/`bias` parameters and
//! `mean`/`var` running statistics. In training mode it normalizes with the
//! statistics of the current batch and folds them into the running averages;
//! in evaluation mode it normalizes with the running averages and writes
//! nothing.
//!
//! Variable layout:
//!
//! | Path | Shape |
//! |------|-------|
//! | `params/batch_norm/scale` | `[in]` |
//! | `params/batch_norm/bias` | `[in]` |
//! | `params/dense/kernel` | `[in, out]` |
//! | `params/dense/bias` | `[out]` |
//! | `batch_stats/batch_norm/mean` | `[in]` |
//! | `batch_stats/batch_norm/var` | `[in]` |

use serde::{Deserialize, Serialize};

use crate::apply::{Process, Scope, BATCH_STATS, PARAMS};
use crate::error::TreeError;
use crate::init::Initializer;
use crate::tree::{Array, Node, VariableTree};

// ---------------------------------------------------------------------------
// BatchNorm
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchNorm {
    /// Decay of the running averages.
    pub momentum: f64,
    pub epsilon: f64,
    /// Normalize with running averages instead of batch statistics.
    pub use_running_average: bool,
}

impl Default for BatchNorm {
    fn default() -> Self {
        BatchNorm {
            momentum: 0.9,
            epsilon: 1e-5,
            use_running_average: false,
        }
    }
}

/// Intermediate values of a batch-norm forward pass.
#[derive(Debug, Clone)]
pub struct BatchNormOutput {
    /// Input after centering and scaling, before the affine transform.
    pub normalized: Array,
    pub output: Array,
}

impl BatchNorm {
    pub const NAME: &'static str = "batch_norm";

    pub fn forward(&self, scope: &mut Scope, x: &Array) -> Result<BatchNormOutput, TreeError> {
        let (_, features) = x.dims2()?;
        let shape = [features];
        let scale = scope.param("batch_norm/scale", &shape, Initializer::Ones)?;
        let bias = scope.param("batch_norm/bias", &shape, Initializer::Zeros)?;
        let ra_mean = scope.variable(BATCH_STATS, "batch_norm/mean", || Array::zeros(&shape))?;
        let ra_var = scope.variable(BATCH_STATS, "batch_norm/var", || Array::ones(&shape))?;
        ra_mean.expect_shape(&shape)?;
        ra_var.expect_shape(&shape)?;

        let (mean, var) = if self.use_running_average {
            (ra_mean, ra_var)
        } else {
            let mean = x.mean_rows()?;
            let var = x.var_rows(&mean)?;
            if !scope.is_initializing() {
                let m = self.momentum;
                let next_mean = ra_mean.zip_map(&mean, |r, b| m * r + (1.0 - m) * b)?;
                let next_var = ra_var.zip_map(&var, |r, b| m * r + (1.0 - m) * b)?;
                scope.put("batch_stats/batch_norm/mean", next_mean)?;
                scope.put("batch_stats/batch_norm/var", next_var)?;
            }
            (mean, var)
        };

        let eps = self.epsilon;
        let normalized = x
            .zip_rows(&mean, |v, m| v - m)?
            .zip_rows(&var, |c, v| c / (v + eps).sqrt())?;
        let output = normalized
            .zip_rows(&scale, |n, s| n * s)?
            .zip_rows(&bias, |v, b| v + b)?;
        Ok(BatchNormOutput { normalized, output })
    }
}

// ---------------------------------------------------------------------------
// Dense
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    /// Number of output features.
    pub features: usize,
}

impl Dense {
    pub const NAME: &'static str = "dense";

    /// Returns `(output, kernel)`.
    pub fn forward(&self, scope: &mut Scope, x: &Array) -> Result<(Array, Array), TreeError> {
        let (_, inputs) = x.dims2()?;
        let kernel = scope.param("dense/kernel", &[inputs, self.features], Initializer::LecunNormal)?;
        let bias = scope.param("dense/bias", &[self.features], Initializer::Zeros)?;
        let output = x.matmul(&kernel)?.zip_rows(&bias, |v, b| v + b)?;
        Ok((output, kernel))
    }
}

// ---------------------------------------------------------------------------
// Regressor
// ---------------------------------------------------------------------------

/// Batch norm followed by a dense layer. Input `[n, in]`, output `[n, out]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Regressor {
    pub batch_norm: BatchNorm,
    pub dense: Dense,
}

/// Every intermediate of a forward pass needed for gradients.
#[derive(Debug, Clone)]
pub struct Forward {
    pub normalized: Array,
    pub hidden: Array,
    pub kernel: Array,
    pub output: Array,
}

impl Regressor {
    pub fn new(outputs: usize, momentum: f64, epsilon: f64) -> Self {
        Regressor {
            batch_norm: BatchNorm {
                momentum,
                epsilon,
                use_running_average: false,
            },
            dense: Dense { features: outputs },
        }
    }

    /// The same model switched between training and evaluation mode.
    pub fn with_running_average(mut self, use_running_average: bool) -> Self {
        self.batch_norm.use_running_average = use_running_average;
        self
    }

    pub fn forward(&self, scope: &mut Scope, x: &Array) -> Result<Forward, TreeError> {
        let bn = self.batch_norm.forward(scope, x)?;
        let (output, kernel) = self.dense.forward(scope, &bn.output)?;
        Ok(Forward {
            normalized: bn.normalized,
            hidden: bn.output,
            kernel,
            output,
        })
    }
}

impl Process<Array> for Regressor {
    type Output = Array;

    fn run(&self, scope: &mut Scope, inputs: &Array) -> Result<Array, TreeError> {
        Ok(self.forward(scope, inputs)?.output)
    }
}

// ---------------------------------------------------------------------------
// Objective
// ---------------------------------------------------------------------------

/// A batch of inputs `[n, in]` with regression targets `[n, out]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Array,
    pub targets: Array,
}

/// Mean squared error and its gradients with respect to `params`.
#[derive(Debug, Clone)]
pub struct LossAndGrads {
    pub loss: f64,
    /// Same structure as the `params` collection.
    pub grads: VariableTree,
}

/// Mean squared error of a `Regressor`, with closed-form gradients.
///
/// The normalized input does not depend on any parameter, so the gradient
/// of every parameter leaf follows directly from the chain rule through
/// the affine batch-norm output and the dense layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Objective {
    pub model: Regressor,
}

impl Objective {
    pub fn new(model: Regressor) -> Self {
        Objective { model }
    }
}

impl Process<Batch> for Objective {
    type Output = LossAndGrads;

    fn run(&self, scope: &mut Scope, batch: &Batch) -> Result<LossAndGrads, TreeError> {
        let fwd = self.model.forward(scope, &batch.inputs)?;
        batch.targets.expect_shape(fwd.output.shape())?;
        let (rows, cols) = fwd.output.dims2()?;
        let count = (rows * cols).max(1) as f64;

        let residual = fwd.output.zip_map(&batch.targets, |p, t| p - t)?;
        let loss = residual.sum_squares() / count;
        let d_out = residual.map(|r| 2.0 * r / count);

        let d_dense_bias = d_out.sum_rows()?;
        let d_kernel = fwd.hidden.transpose()?.matmul(&d_out)?;
        let d_hidden = d_out.matmul(&fwd.kernel.transpose()?)?;
        let d_scale = d_hidden.zip_map(&fwd.normalized, |g, n| g * n)?.sum_rows()?;
        let d_bn_bias = d_hidden.sum_rows()?;

        let mut grads = VariableTree::from_collection(PARAMS, Node::branch())?;
        grads.set(&format!("{}/batch_norm/scale", PARAMS), d_scale)?;
        grads.set(&format!("{}/batch_norm/bias", PARAMS), d_bn_bias)?;
        grads.set(&format!("{}/dense/kernel", PARAMS), d_kernel)?;
        grads.set(&format!("{}/dense/bias", PARAMS), d_dense_bias)?;
        Ok(LossAndGrads { loss, grads })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::{apply, apply_step, init, Mutability};
    use crate::partition::{merge, split};

    fn batch() -> Batch {
        Batch {
            inputs: Array::from_rows(&[
                vec![1.0, 10.0],
                vec![2.0, 20.0],
                vec![3.0, 30.0],
                vec![6.0, 0.0],
            ])
            .unwrap(),
            targets: Array::from_rows(&[vec![1.0], vec![0.0], vec![-1.0], vec![2.0]]).unwrap(),
        }
    }

    fn model() -> Regressor {
        Regressor::new(1, 0.9, 1e-5)
    }

    #[test]
    fn init_creates_expected_layout() {
        let variables = init(&model(), 0, &batch().inputs).unwrap();
        let paths: Vec<String> = variables.flatten().into_keys().collect();
        assert_eq!(
            paths,
            vec![
                "batch_stats/batch_norm/mean",
                "batch_stats/batch_norm/var",
                "params/batch_norm/bias",
                "params/batch_norm/scale",
                "params/dense/bias",
                "params/dense/kernel",
            ]
        );
        assert_eq!(variables.get_leaf("params/dense/kernel").unwrap().shape(), &[2, 1]);
        // Running statistics start untouched.
        assert_eq!(
            variables.get_leaf("batch_stats/batch_norm/mean").unwrap(),
            &Array::zeros(&[2])
        );
    }

    #[test]
    fn training_mode_updates_running_stats() {
        let variables = init(&model(), 0, &batch().inputs).unwrap();
        let mutable = Mutability::collections([BATCH_STATS]);
        let (_, updates) = apply_step(&model(), &batch().inputs, &mutable, &variables).unwrap();
        let mean = updates.get_leaf("batch_stats/batch_norm/mean").unwrap();
        // 0.9 * 0 + 0.1 * batch mean (3.0, 15.0)
        assert!((mean.data()[0] - 0.3).abs() < 1e-12);
        assert!((mean.data()[1] - 1.5).abs() < 1e-12);
        assert!(updates.get("params").is_err());
    }

    #[test]
    fn training_mode_requires_mutable_stats() {
        let variables = init(&model(), 0, &batch().inputs).unwrap();
        assert!(matches!(
            apply(&model(), &batch().inputs, &variables),
            Err(TreeError::ImmutableCollection(_))
        ));
    }

    #[test]
    fn eval_mode_reads_running_stats_only() {
        let variables = init(&model(), 0, &batch().inputs).unwrap();
        let eval = model().with_running_average(true);
        let out = apply(&eval, &batch().inputs, &variables).unwrap();
        assert_eq!(out.shape(), &[4, 1]);
        // mean 0, var 1: normalization is (nearly) the identity.
        let kernel = variables.get_leaf("params/dense/kernel").unwrap();
        let expected = batch().inputs.matmul(kernel).unwrap();
        assert!(out.max_abs_diff(&expected).unwrap() < 1e-3);
    }

    #[test]
    fn grads_mirror_params_structure() {
        let variables = init(&model(), 0, &batch().inputs).unwrap();
        let (params, _) = split(variables.clone(), PARAMS).unwrap();
        let mutable = Mutability::collections([BATCH_STATS]);
        let (out, _) = apply_step(&Objective::new(model()), &batch(), &mutable, &variables).unwrap();
        let structure_ok = params.try_zip_leaves(&out.grads, |_, p, g| {
            p.expect_shape(g.shape())?;
            Ok(p.clone())
        });
        assert!(structure_ok.is_ok());
        assert!(out.loss > 0.0);
    }

    #[test]
    fn grads_match_finite_differences() {
        let variables = init(&model(), 3, &batch().inputs).unwrap();
        let objective = Objective::new(model());
        let mutable = Mutability::collections([BATCH_STATS]);
        let (out, _) = apply_step(&objective, &batch(), &mutable, &variables).unwrap();

        let h = 1e-6;
        for (path, grad) in out.grads.flatten() {
            for i in 0..grad.len() {
                let bump = |delta: f64| {
                    let (params, rest) = split(variables.clone(), PARAMS).unwrap();
                    let params = params.map_leaves(|p, a| {
                        if p == path {
                            let mut data = a.data().to_vec();
                            data[i] += delta;
                            Array::new(a.shape().to_vec(), data).unwrap()
                        } else {
                            a.clone()
                        }
                    });
                    let perturbed = merge(params, rest).unwrap();
                    apply_step(&objective, &batch(), &mutable, &perturbed).unwrap().0.loss
                };
                let numeric = (bump(h) - bump(-h)) / (2.0 * h);
                let analytic = grad.data()[i];
                assert!(
                    (numeric - analytic).abs() < 1e-5,
                    "{}[{}]: numeric {} vs analytic {}",
                    path,
                    i,
                    numeric,
                    analytic
                );
            }
        }
    }

    #[test]
    fn target_shape_is_checked() {
        let variables = init(&model(), 0, &batch().inputs).unwrap();
        let mut bad = batch();
        bad.targets = Array::zeros(&[4, 2]);
        let mutable = Mutability::collections([BATCH_STATS]);
        assert!(matches!(
            apply_step(&Objective::new(model()), &bad, &mutable, &variables),
            Err(TreeError::ShapeMismatch { .. })
        ));
    }
}
