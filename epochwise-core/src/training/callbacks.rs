//! Epoch-end callbacks: opt-in policies layered on top of the driver.
//!
//! Callbacks run after the epoch's checkpoint is saved, so stopping early
//! always leaves a resumable run behind.

use crate::training::metrics::Direction;
use crate::training::runner::EpochSummary;

/// Action a callback can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Trait for epoch-end callbacks.
pub trait EpochCallback {
    fn on_epoch_end(&mut self, summary: &EpochSummary) -> CallbackAction;
}

/// Stops after `patience` epochs without a strict improvement of the
/// validation value beyond `min_delta`.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    pub patience: usize,
    pub min_delta: f64,
    direction: Direction,
    counter: usize,
    best: Option<f64>,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64, direction: Direction) -> Self {
        Self {
            patience,
            min_delta,
            direction,
            counter: 0,
            best: None,
        }
    }

    /// Start from a resumed run's validation history.
    pub fn with_history(mut self, history: &[f64]) -> Self {
        for &value in history {
            self.observe(value);
        }
        self
    }

    fn observe(&mut self, value: f64) -> CallbackAction {
        let improved = match (self.best, self.direction) {
            (None, _) => true,
            (Some(best), Direction::Minimize) => value < best - self.min_delta,
            (Some(best), Direction::Maximize) => value > best + self.min_delta,
        };
        if improved {
            self.best = Some(value);
            self.counter = 0;
            return CallbackAction::Continue;
        }
        self.counter += 1;
        if self.counter >= self.patience {
            CallbackAction::Stop
        } else {
            CallbackAction::Continue
        }
    }
}

impl EpochCallback for EarlyStopping {
    fn on_epoch_end(&mut self, summary: &EpochSummary) -> CallbackAction {
        let action = self.observe(summary.val_value);
        if action == CallbackAction::Stop {
            tracing::info!(
                epoch = summary.epoch,
                patience = self.patience,
                "Early stopping: no improvement"
            );
        }
        action
    }
}
