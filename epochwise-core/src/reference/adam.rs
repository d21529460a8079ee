//! Adam optimizer with exportable moment estimates.

use crate::error::TrainError;
use crate::training::collaborators::{Model, Optimizer, StateDict, TensorState};

#[derive(Debug, Clone)]
pub struct Adam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    step: u64,
    exp_avg: Vec<f64>,
    exp_avg_sq: Vec<f64>,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step: 0,
            exp_avg: Vec::new(),
            exp_avg_sq: Vec::new(),
        }
    }

    pub fn steps_taken(&self) -> u64 {
        self.step
    }
}

impl Optimizer for Adam {
    fn step(&mut self, model: &mut dyn Model) -> Result<(), TrainError> {
        let (params, grads) = model.params_and_grads();
        if self.exp_avg.is_empty() {
            self.exp_avg = vec![0.0; params.len()];
            self.exp_avg_sq = vec![0.0; params.len()];
        } else if self.exp_avg.len() != params.len() {
            return Err(TrainError::load(format!(
                "optimizer state covers {} parameters, model has {}",
                self.exp_avg.len(),
                params.len()
            )));
        }

        self.step += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias2 = 1.0 - self.beta2.powi(self.step as i32);
        for i in 0..params.len() {
            let g = grads[i];
            self.exp_avg[i] = self.beta1 * self.exp_avg[i] + (1.0 - self.beta1) * g;
            self.exp_avg_sq[i] = self.beta2 * self.exp_avg_sq[i] + (1.0 - self.beta2) * g * g;
            let m_hat = self.exp_avg[i] / bias1;
            let v_hat = self.exp_avg_sq[i] / bias2;
            params[i] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
        }
        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("lr".into(), TensorState::scalar(self.lr));
        state.insert("step".into(), TensorState::scalar(self.step as f64));
        state.insert(
            "exp_avg".into(),
            TensorState::new(vec![self.exp_avg.len()], self.exp_avg.clone()),
        );
        state.insert(
            "exp_avg_sq".into(),
            TensorState::new(vec![self.exp_avg_sq.len()], self.exp_avg_sq.clone()),
        );
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), TrainError> {
        let get = |name: &str| {
            state
                .get(name)
                .ok_or_else(|| TrainError::load(format!("missing optimizer tensor '{name}'")))
        };
        let lr = get("lr")?;
        let step = get("step")?;
        let exp_avg = get("exp_avg")?;
        let exp_avg_sq = get("exp_avg_sq")?;
        if exp_avg.shape != exp_avg_sq.shape || exp_avg.values.len() != exp_avg_sq.values.len() {
            return Err(TrainError::load("exp_avg and exp_avg_sq disagree in shape"));
        }
        let (Some(&lr), Some(&step)) = (lr.values.first(), step.values.first()) else {
            return Err(TrainError::load("optimizer scalars are empty"));
        };
        self.lr = lr;
        self.step = step as u64;
        self.exp_avg = exp_avg.values.clone();
        self.exp_avg_sq = exp_avg_sq.values.clone();
        Ok(())
    }
}
