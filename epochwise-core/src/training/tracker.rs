//! Metric tracker: per-batch and per-epoch orchestration of all metrics.

use crate::error::TrainError;
use crate::training::Mode;
use crate::training::metrics::{BatchOutcome, Direction, Metric, MetricRegistry, MetricState};
use crate::training::scalars::{NullScalarSink, ScalarEvent, ScalarKind, ScalarSink};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Display values for one batch, in metric declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressLine {
    entries: Vec<(String, String)>,
}

impl ProgressLine {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for ProgressLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

/// State of one metric inside a [`TrackerSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedMetricState {
    pub name: String,
    #[serde(flatten)]
    pub state: MetricState,
}

/// Serializable tracker state, embedded in every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    /// Last epoch started (equal to the last completed one at checkpoint time).
    pub epoch: usize,
    pub primary_metric: String,
    /// Best primary validation value accepted by `update_best_metric`.
    pub best_metric: Option<f64>,
    pub metrics: Vec<NamedMetricState>,
}

impl TrackerSnapshot {
    pub fn metric(&self, name: &str) -> Option<&MetricState> {
        self.metrics.iter().find(|m| m.name == name).map(|m| &m.state)
    }
}

/// Owns every metric of a run plus the epoch counter.
pub struct MetricTracker {
    metrics: Vec<Metric>,
    primary: usize,
    epoch: usize,
    log_interval: usize,
    /// Declared size of the pass in progress.
    num_examples: Option<usize>,
    examples_seen: usize,
    best_metric: Option<f64>,
    scalars: Box<dyn ScalarSink>,
}

impl fmt::Debug for MetricTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricTracker")
            .field("metrics", &self.metrics)
            .field("primary", &self.primary_metric())
            .field("epoch", &self.epoch)
            .field("log_interval", &self.log_interval)
            .field("best_metric", &self.best_metric)
            .finish()
    }
}

impl MetricTracker {
    /// Fresh tracker at epoch 0 (no epoch started yet).
    pub fn new(
        metrics: Vec<Metric>,
        primary: &str,
        log_interval: usize,
    ) -> Result<Self, TrainError> {
        if metrics.is_empty() {
            return Err(TrainError::config("at least one metric is required"));
        }
        if log_interval == 0 {
            return Err(TrainError::config("log_interval must be positive"));
        }
        let primary = metrics
            .iter()
            .position(|m| m.name() == primary)
            .ok_or_else(|| {
                TrainError::config(format!("primary metric '{primary}' is not tracked"))
            })?;
        Ok(Self {
            metrics,
            primary,
            epoch: 0,
            log_interval,
            num_examples: None,
            examples_seen: 0,
            best_metric: None,
            scalars: Box::new(NullScalarSink),
        })
    }

    /// Build metrics by name from `registry`.
    pub fn from_registry<S: AsRef<str>>(
        registry: &MetricRegistry,
        names: &[S],
        primary: &str,
        log_interval: usize,
    ) -> Result<Self, TrainError> {
        Self::new(registry.build(names)?, primary, log_interval)
    }

    /// Restoring constructor: `metrics` must name exactly the metrics in the
    /// snapshot, in any order.
    pub fn from_snapshot(
        mut metrics: Vec<Metric>,
        log_interval: usize,
        snapshot: TrackerSnapshot,
    ) -> Result<Self, TrainError> {
        if metrics.len() != snapshot.metrics.len() {
            return Err(TrainError::snapshot(format!(
                "snapshot has {} metrics, tracker declares {}",
                snapshot.metrics.len(),
                metrics.len()
            )));
        }
        for saved in snapshot.metrics {
            let metric = metrics
                .iter_mut()
                .find(|m| m.name() == saved.name)
                .ok_or_else(|| {
                    TrainError::snapshot(format!(
                        "snapshot metric '{}' is not declared",
                        saved.name
                    ))
                })?;
            metric.restore_state(saved.state);
        }
        let mut tracker = Self::new(metrics, &snapshot.primary_metric, log_interval)
            .map_err(|e| TrainError::snapshot(e.to_string()))?;
        tracker.epoch = snapshot.epoch;
        tracker.best_metric = snapshot.best_metric;
        Ok(tracker)
    }

    /// Send window and epoch scalars to `sink`.
    pub fn with_scalar_sink(mut self, sink: Box<dyn ScalarSink>) -> Self {
        self.scalars = sink;
        self
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn log_interval(&self) -> usize {
        self.log_interval
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.name() == name)
    }

    pub fn primary_metric(&self) -> &str {
        self.metrics[self.primary].name()
    }

    pub fn primary_direction(&self) -> Direction {
        self.metrics[self.primary].direction()
    }

    pub fn best_metric(&self) -> Option<f64> {
        self.best_metric
    }

    /// Declare the number of examples in the upcoming pass.
    pub fn set_num_examples(&mut self, n: usize) {
        self.num_examples = Some(n);
        self.examples_seen = 0;
    }

    pub fn next_epoch(&mut self) {
        self.epoch += 1;
    }

    /// Record one batch for every metric tracked in `mode`.
    pub fn batch_update(
        &mut self,
        batch: &BatchOutcome<'_>,
        mode: Mode,
    ) -> Result<ProgressLine, TrainError> {
        let num_examples = self.num_examples.ok_or(TrainError::PassNotStarted(mode))?;
        if self.epoch == 0 {
            return Err(TrainError::invalid_input(
                "next_epoch must be called before the first batch",
            ));
        }
        self.examples_seen += batch.batch_size();
        let global_step = ((self.epoch - 1) * num_examples + self.examples_seen) as u64;

        let mut line = ProgressLine::default();
        let mut flushed = Vec::new();
        for metric in self.metrics.iter_mut().filter(|m| m.tracks(mode)) {
            let value = metric.observe(batch);
            line.entries.push((metric.name().to_string(), metric.display(value)));
            if let Some(avg) = metric.maybe_reset_window(batch.step, self.log_interval) {
                flushed.push((metric.name().to_string(), avg));
            }
        }
        for (name, avg) in flushed {
            tracing::debug!(
                epoch = self.epoch,
                %mode,
                step = batch.step,
                metric = %name,
                value = avg,
                "window"
            );
            self.record(name, mode, ScalarKind::Window, global_step, avg)?;
        }
        Ok(line)
    }

    /// Finalize every metric tracked in `mode` and return the primary value.
    pub fn get_epoch_results(&mut self, mode: Mode) -> Result<f64, TrainError> {
        if let Some(declared) = self.num_examples
            && declared != self.examples_seen
        {
            tracing::warn!(
                epoch = self.epoch,
                %mode,
                declared,
                observed = self.examples_seen,
                "Pass size differs from the declared example count"
            );
        }
        let epoch_offset = self.epoch.saturating_sub(1) * self.num_examples.unwrap_or(0);
        let global_step = (epoch_offset + self.examples_seen) as u64;

        let mut results = Vec::new();
        for metric in self.metrics.iter_mut().filter(|m| m.tracks(mode)) {
            let window = metric.flush_window();
            let value = metric.finalize_epoch(mode)?;
            results.push((metric.name().to_string(), window, value));
        }

        let mut primary = None;
        let mut summary = ProgressLine::default();
        for (name, window, value) in results {
            if let Some(avg) = window {
                self.record(name.clone(), mode, ScalarKind::Window, global_step, avg)?;
            }
            self.record(name.clone(), mode, ScalarKind::Epoch, self.epoch as u64, value)?;
            if name == self.primary_metric() {
                primary = Some(value);
            }
            let shown = self.metric(&name).map(|m| m.display(value)).unwrap_or_default();
            summary.entries.push((name, shown));
        }
        self.num_examples = None;
        self.examples_seen = 0;

        tracing::info!(epoch = self.epoch, %mode, "{summary}");
        primary.ok_or_else(|| {
            TrainError::config(format!(
                "primary metric '{}' is not tracked in {mode} passes",
                self.primary_metric()
            ))
        })
    }

    /// Accept `value` as the new best when it strictly improves on the
    /// tracked best in the primary metric's direction.
    pub fn update_best_metric(&mut self, value: f64) -> bool {
        let is_best = self.primary_direction().improves(value, self.best_metric);
        if is_best {
            self.best_metric = Some(value);
        }
        is_best
    }

    /// Snapshot for checkpointing.
    pub fn json_repr(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            epoch: self.epoch,
            primary_metric: self.primary_metric().to_string(),
            best_metric: self.best_metric,
            metrics: self
                .metrics
                .iter()
                .map(|m| NamedMetricState {
                    name: m.name().to_string(),
                    state: m.state().clone(),
                })
                .collect(),
        }
    }

    fn record(
        &mut self,
        metric: String,
        mode: Mode,
        kind: ScalarKind,
        step: u64,
        value: f64,
    ) -> Result<(), TrainError> {
        self.scalars.record(ScalarEvent {
            metric,
            mode,
            kind,
            epoch: self.epoch,
            step,
            value,
            wall_time: Utc::now(),
        })
    }
}
