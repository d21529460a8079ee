//! Per-metric accumulators and the metric registry.
//!
//! A [`Metric`] pairs a [`BatchMetric`] implementation (how to compute a value
//! from one batch) with the running statistics for that value: an
//! example-weighted epoch sum, an example-weighted log window, the finalized
//! per-mode history and the best validation value seen so far.

use crate::error::TrainError;
use crate::training::Mode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which way a metric improves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Lower is better (loss-like).
    Minimize,
    /// Higher is better (accuracy-like).
    Maximize,
}

impl Direction {
    /// Strict improvement test. Anything beats "no value yet"; ties never do.
    pub fn improves(self, candidate: f64, current: Option<f64>) -> bool {
        match current {
            None => true,
            Some(best) => match self {
                Self::Minimize => candidate < best,
                Self::Maximize => candidate > best,
            },
        }
    }
}

/// Everything a metric may look at for one batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchOutcome<'a> {
    pub step: usize,
    pub inputs: &'a [Vec<f64>],
    pub loss: f64,
    pub predictions: &'a [Vec<f64>],
    pub targets: &'a [usize],
}

impl BatchOutcome<'_> {
    pub fn batch_size(&self) -> usize {
        self.targets.len()
    }
}

/// A metric implementation that can be registered by name.
pub trait BatchMetric: Send {
    /// Value of the metric for a single batch.
    fn compute(&self, batch: &BatchOutcome<'_>) -> f64;

    fn direction(&self) -> Direction;

    /// Whether this metric is updated during passes of `mode`.
    fn tracks(&self, _mode: Mode) -> bool {
        true
    }

    /// Formatting used for live progress display.
    fn display(&self, value: f64) -> String {
        format!("{value:.5}")
    }
}

/// The criterion's loss, passed through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossMetric;

impl BatchMetric for LossMetric {
    fn compute(&self, batch: &BatchOutcome<'_>) -> f64 {
        batch.loss
    }

    fn direction(&self) -> Direction {
        Direction::Minimize
    }
}

/// Fraction of rows whose arg-max prediction equals the target class.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccuracyMetric;

impl BatchMetric for AccuracyMetric {
    fn compute(&self, batch: &BatchOutcome<'_>) -> f64 {
        if batch.targets.is_empty() {
            return 0.0;
        }
        let correct = batch
            .predictions
            .iter()
            .zip(batch.targets)
            .filter(|(row, target)| argmax(row) == Some(**target))
            .count();
        correct as f64 / batch.targets.len() as f64
    }

    fn direction(&self) -> Direction {
        Direction::Maximize
    }

    fn display(&self, value: f64) -> String {
        format!("{:.2}%", value * 100.0)
    }
}

/// Index of the largest element; the first one wins on ties.
pub fn argmax(row: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in row.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Finalized epoch values, one sequence per mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricHistory {
    #[serde(default)]
    pub train: Vec<f64>,
    #[serde(default)]
    pub validate: Vec<f64>,
}

impl MetricHistory {
    pub fn get(&self, mode: Mode) -> &[f64] {
        match mode {
            Mode::Train => &self.train,
            Mode::Validate => &self.validate,
        }
    }

    fn push(&mut self, mode: Mode, value: f64) {
        match mode {
            Mode::Train => self.train.push(value),
            Mode::Validate => self.validate.push(value),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.train.is_empty() && self.validate.is_empty()
    }
}

/// Serializable accumulator state of one metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricState {
    /// Example-weighted sum for the current epoch pass.
    pub epoch_avg: f64,
    /// Example-weighted sum since the last window flush.
    pub running_avg: f64,
    /// Examples accumulated into `epoch_avg`.
    pub num_examples: usize,
    /// Examples accumulated into `running_avg`.
    #[serde(default)]
    pub window_examples: usize,
    /// Best finalized validation value so far.
    pub best_value: Option<f64>,
    #[serde(default)]
    pub history: MetricHistory,
}

/// One named metric and its running statistics.
pub struct Metric {
    name: String,
    kind: Box<dyn BatchMetric>,
    state: MetricState,
}

impl std::fmt::Debug for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metric")
            .field("name", &self.name)
            .field("direction", &self.kind.direction())
            .field("state", &self.state)
            .finish()
    }
}

impl Metric {
    pub fn new(name: impl Into<String>, kind: Box<dyn BatchMetric>) -> Self {
        Self {
            name: name.into(),
            kind,
            state: MetricState::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.kind.direction()
    }

    pub fn tracks(&self, mode: Mode) -> bool {
        self.kind.tracks(mode)
    }

    pub fn state(&self) -> &MetricState {
        &self.state
    }

    pub fn history(&self) -> &MetricHistory {
        &self.state.history
    }

    pub fn best_value(&self) -> Option<f64> {
        self.state.best_value
    }

    pub(crate) fn restore_state(&mut self, state: MetricState) {
        self.state = state;
    }

    /// Compute this metric for a batch and record it.
    pub fn observe(&mut self, batch: &BatchOutcome<'_>) -> f64 {
        let value = self.kind.compute(batch);
        self.update(value, batch.batch_size())
    }

    pub fn display(&self, value: f64) -> String {
        self.kind.display(value)
    }

    /// Record one batch's value, weighted by its example count.
    pub fn update(&mut self, value: f64, batch_size: usize) -> f64 {
        let weighted = value * batch_size as f64;
        self.state.epoch_avg += weighted;
        self.state.running_avg += weighted;
        self.state.num_examples += batch_size;
        self.state.window_examples += batch_size;
        value
    }

    /// Flush the log window when `step_index` closes one.
    ///
    /// Steps are zero-based, so with `log_interval = 2` the window closes after
    /// steps 1, 3, 5, ...
    pub fn maybe_reset_window(&mut self, step_index: usize, log_interval: usize) -> Option<f64> {
        if log_interval == 0 || (step_index + 1) % log_interval != 0 {
            return None;
        }
        self.flush_window()
    }

    /// Average of whatever the window holds, then clear it.
    ///
    /// The divisor is the examples actually accumulated, so a short trailing
    /// window reports its own mean.
    pub fn flush_window(&mut self) -> Option<f64> {
        if self.state.window_examples == 0 {
            return None;
        }
        let avg = self.state.running_avg / self.state.window_examples as f64;
        self.state.running_avg = 0.0;
        self.state.window_examples = 0;
        Some(avg)
    }

    /// Close the epoch pass for `mode` and return the example-weighted mean.
    pub fn finalize_epoch(&mut self, mode: Mode) -> Result<f64, TrainError> {
        if self.state.num_examples == 0 {
            return Err(TrainError::Division {
                metric: self.name.clone(),
            });
        }
        let value = self.state.epoch_avg / self.state.num_examples as f64;
        self.state.history.push(mode, value);
        if mode == Mode::Validate && self.direction().improves(value, self.state.best_value) {
            self.state.best_value = Some(value);
        }
        self.state.epoch_avg = 0.0;
        self.state.num_examples = 0;
        Ok(value)
    }
}

type MetricFactory = Box<dyn Fn() -> Box<dyn BatchMetric> + Send + Sync>;

/// Name → implementation table used to build a tracker's metrics.
pub struct MetricRegistry {
    factories: BTreeMap<String, MetricFactory>,
}

impl MetricRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with `loss` and `accuracy`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("loss", || Box::new(LossMetric));
        registry.register("accuracy", || Box::new(AccuracyMetric));
        registry
    }

    /// Register (or replace) a metric implementation.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn BatchMetric> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Instantiate fresh metrics in the order given.
    pub fn build<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Metric>, TrainError> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                let factory = self
                    .factories
                    .get(name)
                    .ok_or_else(|| TrainError::UnknownMetric(name.to_string()))?;
                Ok(Metric::new(name, factory()))
            })
            .collect()
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
