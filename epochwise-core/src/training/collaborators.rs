//! Contracts the driver expects from models, optimizers, criteria and data.

use crate::error::TrainError;
use crate::training::Mode;
use crate::training::rng::{LoaderRngs, StreamRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Row-major batch of vectors.
pub type Matrix = Vec<Vec<f64>>;

/// One batch of examples with integer class targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Matrix,
    pub targets: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// A named tensor in a state dict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorState {
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl TensorState {
    pub fn new(shape: Vec<usize>, values: Vec<f64>) -> Self {
        Self { shape, values }
    }

    pub fn scalar(value: f64) -> Self {
        Self {
            shape: Vec::new(),
            values: vec![value],
        }
    }
}

/// Exported parameters or optimizer state, keyed by name.
pub type StateDict = BTreeMap<String, TensorState>;

/// Fetch `name` from `state` and check its shape.
pub fn expect_tensor<'a>(
    state: &'a StateDict,
    name: &str,
    shape: &[usize],
) -> Result<&'a TensorState, TrainError> {
    let tensor = state
        .get(name)
        .ok_or_else(|| TrainError::load(format!("missing tensor '{name}'")))?;
    if tensor.shape != shape {
        return Err(TrainError::load(format!(
            "tensor '{name}' has shape {:?}, expected {:?}",
            tensor.shape, shape
        )));
    }
    Ok(tensor)
}

/// A trainable model with flat parameter and gradient buffers.
pub trait Model {
    /// Map a batch of inputs to one prediction row per example.
    ///
    /// `rng` is the device stream; it is only consumed by stochastic layers in
    /// train mode.
    fn forward(
        &mut self,
        inputs: &[Vec<f64>],
        mode: Mode,
        rng: &mut StreamRng,
    ) -> Result<Matrix, TrainError>;

    /// Accumulate gradients for the last train-mode forward pass.
    fn backward(&mut self, grad_output: &[Vec<f64>]) -> Result<(), TrainError>;

    /// Parameters and their gradients, equal length.
    fn params_and_grads(&mut self) -> (&mut [f64], &mut [f64]);

    fn state_dict(&self) -> StateDict;

    /// Fails with a load error when names or shapes do not match.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), TrainError>;
}

/// Updates a model's parameters from its gradients.
pub trait Optimizer {
    fn zero_grad(&mut self, model: &mut dyn Model) {
        model.params_and_grads().1.fill(0.0);
    }

    fn step(&mut self, model: &mut dyn Model) -> Result<(), TrainError>;

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), TrainError>;
}

/// Scalar loss plus its gradient with respect to the predictions.
#[derive(Debug, Clone, PartialEq)]
pub struct LossOutput {
    pub value: f64,
    pub grad: Matrix,
}

pub trait Criterion {
    fn loss(&self, predictions: &[Vec<f64>], targets: &[usize]) -> Result<LossOutput, TrainError>;
}

/// A finite, restartable sequence of batches.
pub trait DataSource {
    /// Total examples yielded by one pass.
    fn num_examples(&self) -> usize;

    /// Start a new pass. Shuffling and augmentation draw only from `rngs`.
    fn batches<'a>(&'a self, rngs: LoaderRngs<'a>) -> Box<dyn Iterator<Item = Batch> + 'a>;
}
