//! Softmax regression with input dropout, and a cross-entropy criterion.

use crate::error::TrainError;
use crate::training::Mode;
use crate::training::collaborators::{
    Criterion, LossOutput, Matrix, Model, StateDict, TensorState, expect_tensor,
};
use crate::training::rng::StreamRng;
use rand::{Rng, SeedableRng};

/// `logits = W · dropout(x) + b`.
///
/// Parameters are stored flat: the `classes × features` weight matrix in
/// row-major order, followed by the bias.
#[derive(Debug, Clone)]
pub struct SoftmaxRegression {
    num_features: usize,
    num_classes: usize,
    dropout: f64,
    params: Vec<f64>,
    grads: Vec<f64>,
    /// Inputs of the last train-mode forward pass, after dropout.
    cache: Option<Matrix>,
}

impl SoftmaxRegression {
    pub fn new(
        num_features: usize,
        num_classes: usize,
        dropout: f64,
        init_scale: f64,
        init_seed: u64,
    ) -> Self {
        let mut rng = StreamRng::seed_from_u64(init_seed);
        let n_weights = num_features * num_classes;
        let mut params: Vec<f64> = (0..n_weights)
            .map(|_| rng.gen_range(-1.0..1.0) * init_scale)
            .collect();
        params.extend(std::iter::repeat_n(0.0, num_classes));
        let grads = vec![0.0; params.len()];
        Self {
            num_features,
            num_classes,
            dropout,
            params,
            grads,
            cache: None,
        }
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn n_weights(&self) -> usize {
        self.num_features * self.num_classes
    }

    fn logits(&self, x: &[f64]) -> Vec<f64> {
        let (weights, bias) = self.params.split_at(self.n_weights());
        weights
            .chunks(self.num_features)
            .zip(bias)
            .map(|(row, b)| row.iter().zip(x).map(|(w, xi)| w * xi).sum::<f64>() + b)
            .collect()
    }
}

impl Model for SoftmaxRegression {
    fn forward(
        &mut self,
        inputs: &[Vec<f64>],
        mode: Mode,
        rng: &mut StreamRng,
    ) -> Result<Matrix, TrainError> {
        let keep = 1.0 - self.dropout;
        let mut seen = Vec::with_capacity(inputs.len());
        for row in inputs {
            if row.len() != self.num_features {
                return Err(TrainError::invalid_input(format!(
                    "input row has {} features, model expects {}",
                    row.len(),
                    self.num_features
                )));
            }
            let row = if mode.is_training() && self.dropout > 0.0 {
                row.iter()
                    .map(|&x| if rng.r#gen::<f64>() < self.dropout { 0.0 } else { x / keep })
                    .collect()
            } else {
                row.clone()
            };
            seen.push(row);
        }

        let logits = seen.iter().map(|x| self.logits(x)).collect();
        self.cache = mode.is_training().then_some(seen);
        Ok(logits)
    }

    fn backward(&mut self, grad_output: &[Vec<f64>]) -> Result<(), TrainError> {
        let inputs = self.cache.take().ok_or_else(|| {
            TrainError::invalid_input("backward called without a train-mode forward")
        })?;
        if inputs.len() != grad_output.len() {
            return Err(TrainError::invalid_input("gradient rows do not match the cached batch"));
        }
        let n_weights = self.n_weights();
        let (w_grad, b_grad) = self.grads.split_at_mut(n_weights);
        for (x, g) in inputs.iter().zip(grad_output) {
            for (c, &gc) in g.iter().enumerate().take(self.num_classes) {
                let row = &mut w_grad[c * self.num_features..(c + 1) * self.num_features];
                for (w, &xi) in row.iter_mut().zip(x) {
                    *w += gc * xi;
                }
                b_grad[c] += gc;
            }
        }
        Ok(())
    }

    fn params_and_grads(&mut self) -> (&mut [f64], &mut [f64]) {
        (&mut self.params, &mut self.grads)
    }

    fn state_dict(&self) -> StateDict {
        let (weights, bias) = self.params.split_at(self.n_weights());
        let mut state = StateDict::new();
        state.insert(
            "weight".into(),
            TensorState::new(vec![self.num_classes, self.num_features], weights.to_vec()),
        );
        state.insert("bias".into(), TensorState::new(vec![self.num_classes], bias.to_vec()));
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), TrainError> {
        let weight = expect_tensor(state, "weight", &[self.num_classes, self.num_features])?;
        let bias = expect_tensor(state, "bias", &[self.num_classes])?;
        if weight.values.len() != self.n_weights() || bias.values.len() != self.num_classes {
            return Err(TrainError::load("tensor data does not match its shape"));
        }
        let n_weights = self.n_weights();
        self.params[..n_weights].copy_from_slice(&weight.values);
        self.params[n_weights..].copy_from_slice(&bias.values);
        self.grads.fill(0.0);
        self.cache = None;
        Ok(())
    }
}

/// Mean negative log-likelihood of softmax(logits).
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropy;

impl Criterion for CrossEntropy {
    fn loss(&self, predictions: &[Vec<f64>], targets: &[usize]) -> Result<LossOutput, TrainError> {
        if predictions.len() != targets.len() || targets.is_empty() {
            return Err(TrainError::invalid_input(format!(
                "{} prediction rows for {} targets",
                predictions.len(),
                targets.len()
            )));
        }
        let n = targets.len() as f64;
        let mut total = 0.0;
        let mut grad = Vec::with_capacity(targets.len());
        for (logits, &target) in predictions.iter().zip(targets) {
            if target >= logits.len() {
                return Err(TrainError::invalid_input(format!(
                    "target class {target} out of range for {} logits",
                    logits.len()
                )));
            }
            let probs = softmax(logits);
            total -= probs[target].ln();
            let row = probs
                .iter()
                .enumerate()
                .map(|(c, p)| (p - if c == target { 1.0 } else { 0.0 }) / n)
                .collect();
            grad.push(row);
        }
        Ok(LossOutput {
            value: total / n,
            grad,
        })
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|z| (z - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let out = CrossEntropy.loss(&[vec![0.0, 0.0]], &[1]).unwrap();
        assert!((out.value - 2f64.ln()).abs() < 1e-12);
        assert!((out.grad[0][0] - 0.5).abs() < 1e-12);
        assert!((out.grad[0][1] + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_cross_entropy_rejects_bad_target() {
        assert!(CrossEntropy.loss(&[vec![0.0, 0.0]], &[2]).is_err());
    }

    #[test]
    fn test_eval_forward_does_not_touch_rng() {
        let mut model = SoftmaxRegression::new(2, 2, 0.5, 0.1, 1);
        let mut rng = StreamRng::seed_from_u64(5);
        let before = rng.clone();
        model.forward(&[vec![1.0, 2.0]], Mode::Validate, &mut rng).unwrap();
        assert_eq!(rng, before);
        assert!(model.backward(&[vec![0.1, -0.1]]).is_err());
    }

    #[test]
    fn test_backward_accumulates_outer_product() {
        let mut model = SoftmaxRegression::new(2, 2, 0.0, 0.0, 1);
        let mut rng = StreamRng::seed_from_u64(5);
        model.forward(&[vec![1.0, 2.0]], Mode::Train, &mut rng).unwrap();
        model.backward(&[vec![0.5, -0.5]]).unwrap();
        let (_, grads) = model.params_and_grads();
        assert_eq!(grads, &[0.5, 1.0, -0.5, -1.0, 0.5, -0.5]);
    }

    #[test]
    fn test_load_state_dict_shape_mismatch() {
        let source = SoftmaxRegression::new(3, 2, 0.0, 0.1, 1);
        let mut target = SoftmaxRegression::new(4, 2, 0.0, 0.1, 1);
        let err = target.load_state_dict(&source.state_dict()).unwrap_err();
        assert!(matches!(err, TrainError::Load(_)));
    }

    #[test]
    fn test_state_dict_roundtrip() {
        let source = SoftmaxRegression::new(3, 2, 0.0, 0.1, 1);
        let mut target = SoftmaxRegression::new(3, 2, 0.0, 0.1, 99);
        target.load_state_dict(&source.state_dict()).unwrap();
        assert_eq!(target.state_dict(), source.state_dict());
    }
}
