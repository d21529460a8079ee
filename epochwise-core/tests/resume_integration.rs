//! End-to-end tests for interrupted and resumed training runs.

use epochwise_core::TrainError;
use epochwise_core::config::{SyntheticDataConfig, TrainingConfig};
use epochwise_core::reference::{
    Adam, CrossEntropy, InMemoryDataset, SoftmaxRegression, gaussian_clusters,
};
use epochwise_core::training::collaborators::{Criterion, LossOutput};
use epochwise_core::training::runner::StartKind;
use epochwise_core::training::scalars::{JsonlScalarSink, NullScalarSink, ScalarKind};
use epochwise_core::training::{
    CallbackAction, CheckpointStore, EpochCallback, EpochSummary, Mode, Slot, Trainer,
    TrainingContext,
};
use pretty_assertions::assert_eq;
use std::cell::Cell;
use std::path::Path;
use tempfile::TempDir;

const RUN: &str = "cluster-run";

fn training_config(epochs: usize) -> TrainingConfig {
    TrainingConfig {
        epochs,
        learning_rate: 0.05,
        batch_size: 16,
        log_interval: 3,
        seed: 11,
        ..TrainingConfig::default()
    }
}

fn datasets() -> (InMemoryDataset, InMemoryDataset) {
    let config = SyntheticDataConfig {
        train_examples: 70,
        val_examples: 30,
        num_features: 4,
        num_classes: 3,
        ..SyntheticDataConfig::default()
    };
    gaussian_clusters(&config, 16)
}

fn model() -> SoftmaxRegression {
    SoftmaxRegression::new(4, 3, 0.2, 0.1, 5)
}

type Ctx = TrainingContext<SoftmaxRegression, Adam, CrossEntropy>;

fn prepare(trainer: &Trainer) -> Ctx {
    trainer
        .resume_or_fresh(RUN, model(), Adam::new(0.05), CrossEntropy, Box::new(NullScalarSink))
        .unwrap()
}

/// One process lifetime: resume-or-fresh then `epochs` epochs.
fn invocation(dir: &Path, epochs: usize) -> (Ctx, Vec<EpochSummary>) {
    let (train, val) = datasets();
    let mut trainer = Trainer::new(training_config(epochs), CheckpointStore::new(dir));
    let mut ctx = prepare(&trainer);
    let summaries = trainer.fit(&mut ctx, &train, &val).unwrap();
    (ctx, summaries)
}

#[test]
fn fresh_start_begins_at_epoch_one_with_empty_history() {
    let dir = TempDir::new().unwrap();
    let trainer = Trainer::new(training_config(1), CheckpointStore::new(dir.path()));
    let ctx = prepare(&trainer);

    assert_eq!(ctx.start, StartKind::Fresh);
    assert_eq!(ctx.start_epoch(), 1);
    assert_eq!(ctx.tracker.best_metric(), None);
    for metric in ctx.tracker.metrics() {
        assert!(metric.history().is_empty(), "{} has history", metric.name());
    }
}

#[test]
fn resumed_run_matches_uninterrupted_run() {
    let straight = TempDir::new().unwrap();
    let (full, full_summaries) = invocation(straight.path(), 4);

    let split = TempDir::new().unwrap();
    let (_, first_half) = invocation(split.path(), 2);
    let (resumed, second_half) = invocation(split.path(), 2);

    assert_eq!(resumed.start, StartKind::Resumed { epoch: 2 });
    assert_eq!(resumed.tracker.epoch(), 4);

    for name in ["loss", "accuracy"] {
        let a = full.tracker.metric(name).unwrap();
        let b = resumed.tracker.metric(name).unwrap();
        assert_eq!(a.history(), b.history(), "history of {name}");
        assert_eq!(a.best_value(), b.best_value(), "best value of {name}");
    }
    assert_eq!(full.tracker.best_metric(), resumed.tracker.best_metric());

    let full_values: Vec<(f64, f64, bool)> = full_summaries
        .iter()
        .map(|s| (s.train_value, s.val_value, s.is_best))
        .collect();
    let split_values: Vec<(f64, f64, bool)> = first_half
        .iter()
        .chain(&second_half)
        .map(|s| (s.train_value, s.val_value, s.is_best))
        .collect();
    assert_eq!(full_values, split_values);

    let a = CheckpointStore::new(straight.path()).load(RUN).unwrap().unwrap();
    let b = CheckpointStore::new(split.path()).load(RUN).unwrap().unwrap();
    assert_eq!(a.epoch, 4);
    assert_eq!(a.model_state, b.model_state);
    assert_eq!(a.optimizer_state, b.optimizer_state);
    assert_eq!(a.rng_states, b.rng_states);
    assert_eq!(a.metric_snapshot, b.metric_snapshot);
}

#[test]
fn best_slot_tracks_only_improving_epochs() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(dir.path());
    let latest = store.slot_path(RUN, Slot::Latest).unwrap();
    let best = store.slot_path(RUN, Slot::Best).unwrap();

    let mut previous_best: Option<Vec<u8>> = None;
    for epoch in 1..=4 {
        let (_, summaries) = invocation(dir.path(), 1);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].epoch, epoch);

        let latest_bytes = std::fs::read(&latest).unwrap();
        let best_bytes = std::fs::read(&best).unwrap();
        if summaries[0].is_best {
            assert_eq!(best_bytes, latest_bytes);
        } else {
            assert_eq!(Some(&best_bytes), previous_best.as_ref());
        }
        previous_best = Some(best_bytes);
    }
    assert!(store.slot_exists(RUN, Slot::Best).unwrap());
}

#[test]
fn resume_with_mismatched_model_is_load_error() {
    let dir = TempDir::new().unwrap();
    invocation(dir.path(), 1);

    let trainer = Trainer::new(training_config(1), CheckpointStore::new(dir.path()));
    let wider = SoftmaxRegression::new(5, 3, 0.2, 0.1, 5);
    let err = trainer
        .resume_or_fresh(RUN, wider, Adam::new(0.05), CrossEntropy, Box::new(NullScalarSink))
        .err()
        .unwrap();
    assert!(matches!(err, TrainError::Load(_)), "{err}");
}

#[test]
fn resume_with_different_primary_metric_is_rejected() {
    let dir = TempDir::new().unwrap();
    invocation(dir.path(), 1);

    let config = TrainingConfig {
        primary_metric: "accuracy".into(),
        ..training_config(1)
    };
    let trainer = Trainer::new(config, CheckpointStore::new(dir.path()));
    let err = trainer
        .resume_or_fresh(RUN, model(), Adam::new(0.05), CrossEntropy, Box::new(NullScalarSink))
        .err()
        .unwrap();
    assert!(matches!(err, TrainError::Snapshot(_)), "{err}");
}

struct ExplodingLoss;

impl Criterion for ExplodingLoss {
    fn loss(&self, predictions: &[Vec<f64>], _targets: &[usize]) -> Result<LossOutput, TrainError> {
        Ok(LossOutput {
            value: f64::NAN,
            grad: predictions.iter().map(|row| vec![0.0; row.len()]).collect(),
        })
    }
}

#[test]
fn non_finite_loss_halts_without_checkpoint() {
    let dir = TempDir::new().unwrap();
    let (train, val) = datasets();
    let mut trainer = Trainer::new(training_config(2), CheckpointStore::new(dir.path()));
    let mut ctx = trainer
        .resume_or_fresh(RUN, model(), Adam::new(0.05), ExplodingLoss, Box::new(NullScalarSink))
        .unwrap();

    let err = trainer.fit(&mut ctx, &train, &val).unwrap_err();
    match err {
        TrainError::NumericInstability {
            epoch, step, mode, ..
        } => {
            assert_eq!((epoch, step, mode), (1, 0, Mode::Train));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!trainer.store().slot_exists(RUN, Slot::Latest).unwrap());
}

struct StopAfterFirst;

impl EpochCallback for StopAfterFirst {
    fn on_epoch_end(&mut self, _summary: &EpochSummary) -> CallbackAction {
        CallbackAction::Stop
    }
}

#[test]
fn stopping_callback_leaves_resumable_checkpoint() {
    let dir = TempDir::new().unwrap();
    let (train, val) = datasets();
    let mut trainer = Trainer::new(training_config(5), CheckpointStore::new(dir.path()))
        .with_callback(Box::new(StopAfterFirst));
    let mut ctx = prepare(&trainer);

    let summaries = trainer.fit(&mut ctx, &train, &val).unwrap();
    assert_eq!(summaries.len(), 1);

    let bundle = trainer.store().load(RUN).unwrap().unwrap();
    assert_eq!(bundle.epoch, 1);
}

#[test]
fn scalar_log_spans_resumed_invocations() {
    let ckpt = TempDir::new().unwrap();
    let logs = TempDir::new().unwrap();
    let (train, val) = datasets();

    for _ in 0..2 {
        let mut trainer = Trainer::new(training_config(1), CheckpointStore::new(ckpt.path()));
        let sink = JsonlScalarSink::new(logs.path(), RUN);
        let mut ctx = trainer
            .resume_or_fresh(RUN, model(), Adam::new(0.05), CrossEntropy, Box::new(sink))
            .unwrap();
        trainer.fit(&mut ctx, &train, &val).unwrap();
    }

    let events = JsonlScalarSink::new(logs.path(), RUN).read_all().unwrap();
    let epochs: Vec<(String, Mode, u64)> = events
        .iter()
        .filter(|e| e.kind == ScalarKind::Epoch)
        .map(|e| (e.metric.clone(), e.mode, e.step))
        .collect();
    assert_eq!(epochs.len(), 8);
    assert!(epochs.contains(&("loss".to_string(), Mode::Validate, 2)));

    let train_windows: Vec<u64> = events
        .iter()
        .filter(|e| e.kind == ScalarKind::Window && e.mode == Mode::Train && e.metric == "loss")
        .map(|e| e.step)
        .collect();
    assert!(train_windows.windows(2).all(|w| w[0] < w[1]), "{train_windows:?}");
    assert_eq!(train_windows.last().copied(), Some(140));
}

/// Cross-entropy that turns non-finite from its `fail_at`-th call on.
struct FailsAfter {
    calls: Cell<usize>,
    fail_at: usize,
}

impl Criterion for FailsAfter {
    fn loss(&self, predictions: &[Vec<f64>], targets: &[usize]) -> Result<LossOutput, TrainError> {
        let call = self.calls.get();
        self.calls.set(call + 1);
        let mut out = CrossEntropy.loss(predictions, targets)?;
        if call >= self.fail_at {
            out.value = f64::INFINITY;
        }
        Ok(out)
    }
}

#[test]
fn scalar_log_forgets_interrupted_epoch() {
    let ckpt = TempDir::new().unwrap();
    let logs = TempDir::new().unwrap();
    let (train, val) = datasets();
    let sink = || Box::new(JsonlScalarSink::new(logs.path(), RUN));

    let mut trainer = Trainer::new(training_config(1), CheckpointStore::new(ckpt.path()));
    let mut ctx = trainer
        .resume_or_fresh(RUN, model(), Adam::new(0.05), CrossEntropy, sink())
        .unwrap();
    trainer.fit(&mut ctx, &train, &val).unwrap();

    // Epoch 2 finishes its train pass (5 batches), then dies in validation.
    let failing = FailsAfter {
        calls: Cell::new(0),
        fail_at: 5,
    };
    let mut trainer = Trainer::new(training_config(1), CheckpointStore::new(ckpt.path()));
    let mut ctx = trainer
        .resume_or_fresh(RUN, model(), Adam::new(0.05), failing, sink())
        .unwrap();
    let err = trainer.fit(&mut ctx, &train, &val).unwrap_err();
    assert!(
        matches!(err, TrainError::NumericInstability { epoch: 2, mode: Mode::Validate, .. }),
        "{err}"
    );

    let mut trainer = Trainer::new(training_config(1), CheckpointStore::new(ckpt.path()));
    let mut ctx = trainer
        .resume_or_fresh(RUN, model(), Adam::new(0.05), CrossEntropy, sink())
        .unwrap();
    assert_eq!(ctx.start, StartKind::Resumed { epoch: 1 });
    trainer.fit(&mut ctx, &train, &val).unwrap();

    let events = JsonlScalarSink::new(logs.path(), RUN).read_all().unwrap();
    let train_loss = |kind: ScalarKind| -> Vec<(usize, u64)> {
        events
            .iter()
            .filter(|e| e.kind == kind && e.mode == Mode::Train && e.metric == "loss")
            .map(|e| (e.epoch, e.step))
            .collect()
    };
    assert_eq!(train_loss(ScalarKind::Epoch), vec![(1, 1), (2, 2)]);
    assert_eq!(
        train_loss(ScalarKind::Window),
        vec![(1, 48), (1, 70), (2, 118), (2, 140)]
    );
}
