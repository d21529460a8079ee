//! Training loop driver.
//!
//! `INIT -> RESUME_OR_FRESH -> (TRAIN_PASS -> VALIDATE_PASS)* -> DONE`
//!
//! [`Trainer::resume_or_fresh`] builds a [`TrainingContext`], either from the
//! run's latest checkpoint or from the configured seed. [`Trainer::fit`] then
//! runs the configured number of epochs and saves a checkpoint after each
//! one. All mutable training state lives in the context and is passed by
//! reference through every pass.

use crate::config::TrainingConfig;
use crate::error::TrainError;
use crate::training::Mode;
use crate::training::callbacks::{CallbackAction, EpochCallback};
use crate::training::checkpoint::{
    CHECKPOINT_SCHEMA_VERSION, CheckpointBundle, CheckpointStore, validate_run_name,
};
use crate::training::collaborators::{Criterion, DataSource, Model, Optimizer};
use crate::training::metrics::{BatchOutcome, MetricRegistry};
use crate::training::rng::RngStreams;
use crate::training::scalars::ScalarSink;
use crate::training::tracker::{MetricTracker, ProgressLine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// How a context came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    Fresh,
    /// Restored from a checkpoint of the given completed epoch.
    Resumed { epoch: usize },
}

/// Everything the loop mutates, owned in one place.
pub struct TrainingContext<M, O, C> {
    pub run_name: String,
    pub model: M,
    pub optimizer: O,
    pub criterion: C,
    pub tracker: MetricTracker,
    pub rngs: RngStreams,
    pub start: StartKind,
}

impl<M: Model, O: Optimizer, C> TrainingContext<M, O, C> {
    /// First epoch the next `fit` call will run.
    pub fn start_epoch(&self) -> usize {
        self.tracker.epoch() + 1
    }

    /// Bundle for the epoch the tracker has just completed.
    pub fn checkpoint_bundle(&self) -> CheckpointBundle {
        CheckpointBundle {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            run_name: self.run_name.clone(),
            epoch: self.tracker.epoch(),
            model_state: self.model.state_dict(),
            optimizer_state: self.optimizer.state_dict(),
            rng_states: self.rngs.clone(),
            metric_snapshot: self.tracker.json_repr(),
            created_at: Some(Utc::now()),
        }
    }
}

/// Per-epoch outcome returned by [`Trainer::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Primary metric over the train pass.
    pub train_value: f64,
    /// Primary metric over the validation pass.
    pub val_value: f64,
    /// Whether this epoch was also written to the best slot.
    pub is_best: bool,
    pub elapsed_ms: u64,
}

/// Receives live per-batch display values. Nothing here is persisted.
pub trait ProgressSink {
    fn on_batch(&mut self, epoch: usize, mode: Mode, step: usize, line: &ProgressLine);

    fn on_pass_end(&mut self, _epoch: usize, _mode: Mode, _value: f64) {}
}

/// Emits progress as `trace` events.
#[derive(Debug, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_batch(&mut self, epoch: usize, mode: Mode, step: usize, line: &ProgressLine) {
        tracing::trace!(epoch, %mode, step, "{line}");
    }
}

/// The epoch-level state machine.
pub struct Trainer {
    config: TrainingConfig,
    store: CheckpointStore,
    registry: MetricRegistry,
    progress: Box<dyn ProgressSink>,
    callbacks: Vec<Box<dyn EpochCallback>>,
}

impl Trainer {
    pub fn new(config: TrainingConfig, store: CheckpointStore) -> Self {
        Self {
            config,
            store,
            registry: MetricRegistry::with_defaults(),
            progress: Box::new(TracingProgress),
            callbacks: Vec::new(),
        }
    }

    pub fn with_registry(mut self, registry: MetricRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_callback(mut self, callback: Box<dyn EpochCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Restore `run_name` from its latest checkpoint, or start it fresh.
    ///
    /// On resume the model, optimizer, all three random streams and the
    /// tracker are restored before any data is drawn, and `scalars` forgets
    /// whatever an interrupted epoch had already logged.
    pub fn resume_or_fresh<M, O, C>(
        &self,
        run_name: &str,
        mut model: M,
        mut optimizer: O,
        criterion: C,
        mut scalars: Box<dyn ScalarSink>,
    ) -> Result<TrainingContext<M, O, C>, TrainError>
    where
        M: Model,
        O: Optimizer,
        C: Criterion,
    {
        validate_run_name(run_name)?;
        let metrics = self.registry.build(&self.config.metrics)?;
        let mut rngs = RngStreams::seeded(self.config.seed);

        let (tracker, start) = match self.store.load(run_name)? {
            Some(bundle) => {
                if bundle.metric_snapshot.epoch != bundle.epoch {
                    return Err(TrainError::snapshot(format!(
                        "checkpoint epoch {} disagrees with metric snapshot epoch {}",
                        bundle.epoch, bundle.metric_snapshot.epoch
                    )));
                }
                if bundle.metric_snapshot.primary_metric != self.config.primary_metric {
                    return Err(TrainError::snapshot(format!(
                        "run '{run_name}' selects best by '{}', configured '{}'",
                        bundle.metric_snapshot.primary_metric, self.config.primary_metric
                    )));
                }
                model.load_state_dict(&bundle.model_state)?;
                optimizer.load_state_dict(&bundle.optimizer_state)?;
                bundle.restore_rng_state(&mut rngs);
                let epoch = bundle.epoch;
                let tracker = MetricTracker::from_snapshot(
                    metrics,
                    self.config.log_interval,
                    bundle.metric_snapshot,
                )?;
                tracing::info!(run = run_name, epoch, "Resuming from checkpoint");
                (tracker, StartKind::Resumed { epoch })
            }
            None => {
                let tracker = MetricTracker::new(
                    metrics,
                    &self.config.primary_metric,
                    self.config.log_interval,
                )?;
                tracing::info!(run = run_name, seed = self.config.seed, "Starting fresh run");
                (tracker, StartKind::Fresh)
            }
        };

        let completed = match start {
            StartKind::Fresh => 0,
            StartKind::Resumed { epoch } => epoch,
        };
        scalars.purge_after(completed)?;

        Ok(TrainingContext {
            run_name: run_name.to_string(),
            model,
            optimizer,
            criterion,
            tracker: tracker.with_scalar_sink(scalars),
            rngs,
            start,
        })
    }

    /// Run the configured number of epochs, checkpointing after each.
    pub fn fit<M, O, C>(
        &mut self,
        ctx: &mut TrainingContext<M, O, C>,
        train: &dyn DataSource,
        val: &dyn DataSource,
    ) -> Result<Vec<EpochSummary>, TrainError>
    where
        M: Model,
        O: Optimizer,
        C: Criterion,
    {
        let first = ctx.start_epoch();
        let last = first + self.config.epochs - 1;
        let mut summaries = Vec::with_capacity(self.config.epochs);

        for epoch in first..=last {
            let started = Instant::now();
            tracing::info!(run = %ctx.run_name, "Epoch [{epoch}/{last}]");
            ctx.tracker.next_epoch();
            debug_assert_eq!(ctx.tracker.epoch(), epoch);

            let train_value = self.run_pass(ctx, train, Mode::Train)?;
            let val_value = self.run_pass(ctx, val, Mode::Validate)?;

            let is_best = ctx.tracker.update_best_metric(val_value);
            let bundle = ctx.checkpoint_bundle();
            self.store.save(&bundle, &ctx.run_name, is_best)?;

            let summary = EpochSummary {
                epoch,
                train_value,
                val_value,
                is_best,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
            let stop = self
                .callbacks
                .iter_mut()
                .map(|cb| cb.on_epoch_end(&summary))
                .fold(false, |stop, action| stop || action == CallbackAction::Stop);
            summaries.push(summary);
            if stop {
                break;
            }
        }
        Ok(summaries)
    }

    /// Iterate `source` once in `mode` and return the pass's primary value.
    ///
    /// Gradients are only computed and applied in train mode.
    pub fn run_pass<M, O, C>(
        &mut self,
        ctx: &mut TrainingContext<M, O, C>,
        source: &dyn DataSource,
        mode: Mode,
    ) -> Result<f64, TrainError>
    where
        M: Model,
        O: Optimizer,
        C: Criterion,
    {
        let TrainingContext {
            model,
            optimizer,
            criterion,
            tracker,
            rngs,
            ..
        } = ctx;
        let epoch = tracker.epoch();
        tracker.set_num_examples(source.num_examples());

        let (loader_rngs, device_rng) = rngs.split();
        for (step, batch) in source.batches(loader_rngs).enumerate() {
            if batch.is_empty() {
                return Err(TrainError::invalid_input(format!(
                    "empty batch at epoch {epoch}, step {step} ({mode})"
                )));
            }
            if mode.is_training() {
                optimizer.zero_grad(model);
            }

            let predictions = model.forward(&batch.inputs, mode, device_rng)?;
            let loss = criterion.loss(&predictions, &batch.targets)?;
            if !loss.value.is_finite() {
                return Err(TrainError::NumericInstability {
                    epoch,
                    step,
                    mode,
                    value: loss.value,
                });
            }

            if mode.is_training() {
                model.backward(&loss.grad)?;
                optimizer.step(model)?;
            }

            let outcome = BatchOutcome {
                step,
                inputs: &batch.inputs,
                loss: loss.value,
                predictions: &predictions,
                targets: &batch.targets,
            };
            let line = tracker.batch_update(&outcome, mode)?;
            self.progress.on_batch(epoch, mode, step, &line);
        }

        let value = tracker.get_epoch_results(mode)?;
        self.progress.on_pass_end(epoch, mode, value);
        Ok(value)
    }
}
