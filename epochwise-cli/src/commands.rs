//! CLI subcommand handlers.

use anyhow::Context;
use epochwise_core::TrainConfig;
use epochwise_core::reference::{Adam, CrossEntropy, SoftmaxRegression, gaussian_clusters};
use epochwise_core::training::checkpoint::{CheckpointBundle, generate_run_name};
use epochwise_core::training::scalars::{JsonlScalarSink, NullScalarSink, ScalarSink};
use epochwise_core::training::{CheckpointStore, EarlyStopping, EpochSummary, Mode, Slot, Trainer};

/// Flags of the `train` subcommand that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct TrainOverrides {
    pub run_name: Option<String>,
    pub epochs: Option<usize>,
    pub seed: Option<u64>,
    pub lr: Option<f64>,
    pub no_scalars: bool,
}

pub fn apply_train_overrides(config: &mut TrainConfig, overrides: &TrainOverrides) {
    if let Some(name) = &overrides.run_name {
        config.checkpoint.run_name = Some(name.clone());
    }
    if let Some(epochs) = overrides.epochs {
        config.training.epochs = epochs;
    }
    if let Some(seed) = overrides.seed {
        config.training.seed = seed;
    }
    if let Some(lr) = overrides.lr {
        config.training.learning_rate = lr;
    }
    if overrides.no_scalars {
        config.scalars.enabled = false;
    }
}

/// Configured run name, or a fresh one built from the run prefix.
pub fn resolve_run_name(config: &TrainConfig) -> String {
    config
        .checkpoint
        .run_name
        .clone()
        .unwrap_or_else(|| generate_run_name(&config.checkpoint.run_prefix))
}

/// Train or resume the configured run against the synthetic cluster data.
pub fn handle_train(config: TrainConfig) -> anyhow::Result<()> {
    config.validate().context("Invalid configuration")?;

    let run_name = resolve_run_name(&config);
    let store = CheckpointStore::new(&config.checkpoint.dir);

    let (train, val) = gaussian_clusters(&config.data, config.training.batch_size);
    let model = SoftmaxRegression::new(
        config.data.num_features,
        config.data.num_classes,
        config.model.dropout,
        config.model.init_scale,
        config.model.init_seed,
    );
    let optimizer = Adam::new(config.training.learning_rate);
    let scalars: Box<dyn ScalarSink> = if config.scalars.enabled {
        Box::new(JsonlScalarSink::new(&config.scalars.dir, &run_name))
    } else {
        Box::new(NullScalarSink)
    };

    let mut trainer = Trainer::new(config.training.clone(), store);
    let mut ctx = trainer
        .resume_or_fresh(&run_name, model, optimizer, CrossEntropy, scalars)
        .with_context(|| format!("Failed to prepare run '{run_name}'"))?;

    if let Some(patience) = config.training.early_stopping_patience {
        let history = ctx
            .tracker
            .metric(ctx.tracker.primary_metric())
            .map(|m| m.history().get(Mode::Validate).to_vec())
            .unwrap_or_default();
        let stopping = EarlyStopping::new(patience, 0.0, ctx.tracker.primary_direction())
            .with_history(&history);
        trainer = trainer.with_callback(Box::new(stopping));
    }

    println!(
        "Run '{}': epochs {}..{} (checkpoints in {})",
        run_name,
        ctx.start_epoch(),
        ctx.start_epoch() + config.training.epochs - 1,
        trainer.store().root().display()
    );

    let summaries = trainer
        .fit(&mut ctx, &train, &val)
        .with_context(|| format!("Training run '{run_name}' failed"))?;
    print_summaries(ctx.tracker.primary_metric(), &summaries);
    if let Some(best) = ctx.tracker.best_metric() {
        println!("Best {}: {:.5}", ctx.tracker.primary_metric(), best);
    }
    Ok(())
}

fn print_summaries(primary: &str, summaries: &[EpochSummary]) {
    if summaries.is_empty() {
        println!("No epochs were run.");
        return;
    }
    println!(
        "{:>6}  {:>12}  {:>12}  {:>5}  {:>8}",
        "epoch",
        format!("train {primary}"),
        format!("val {primary}"),
        "best",
        "ms"
    );
    for s in summaries {
        println!(
            "{:>6}  {:>12.5}  {:>12.5}  {:>5}  {:>8}",
            s.epoch,
            s.train_value,
            s.val_value,
            if s.is_best { "*" } else { "" },
            s.elapsed_ms
        );
    }
}

/// Print the contents of one checkpoint slot.
pub fn handle_inspect(
    config: &TrainConfig,
    run_name: &str,
    best: bool,
    json: bool,
) -> anyhow::Result<()> {
    let slot = if best { Slot::Best } else { Slot::Latest };
    let bundle = load_inspected(config, run_name, slot)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&bundle.metric_snapshot)?);
        return Ok(());
    }
    print_bundle(&bundle, slot);
    Ok(())
}

fn load_inspected(
    config: &TrainConfig,
    run_name: &str,
    slot: Slot,
) -> anyhow::Result<CheckpointBundle> {
    CheckpointStore::new(&config.checkpoint.dir)
        .load_slot(run_name, slot)
        .with_context(|| format!("Failed to read {slot} checkpoint of '{run_name}'"))?
        .with_context(|| format!("Run '{run_name}' has no {slot} checkpoint"))
}

fn print_bundle(bundle: &CheckpointBundle, slot: Slot) {
    let snapshot = &bundle.metric_snapshot;
    println!("Run:            {}", bundle.run_name);
    println!("Slot:           {slot}");
    println!("Schema:         v{}", bundle.schema_version);
    println!("Epoch:          {}", bundle.epoch);
    if let Some(created) = bundle.created_at {
        println!("Saved at:       {}", created.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    match bundle.best_metric() {
        Some(best) => println!("Best {:<9} {:.5}", format!("{}:", snapshot.primary_metric), best),
        None => println!("Best {:<9} -", format!("{}:", snapshot.primary_metric)),
    }
    println!("Model tensors:  {}", bundle.model_state.len());
    for named in &snapshot.metrics {
        println!();
        println!("  {}", named.name);
        for mode in Mode::ALL {
            let values = named.state.history.get(mode);
            if values.is_empty() {
                continue;
            }
            let shown: Vec<String> = values.iter().map(|v| format!("{v:.5}")).collect();
            println!("    {:<9} {}", mode.to_string(), shown.join(" "));
        }
    }
}

/// List runs and the slots each one holds.
pub fn handle_runs(config: &TrainConfig) -> anyhow::Result<()> {
    let lines = run_lines(config)?;
    if lines.is_empty() {
        println!("No runs under {}", config.checkpoint.dir.display());
    }
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

fn run_lines(config: &TrainConfig) -> anyhow::Result<Vec<String>> {
    let store = CheckpointStore::new(&config.checkpoint.dir);
    let runs = store.list_runs().context("Failed to list runs")?;
    Ok(runs
        .into_iter()
        .map(|run| {
            let mut slots = Vec::new();
            if run.latest {
                slots.push(Slot::Latest.to_string());
            }
            if run.best {
                slots.push(Slot::Best.to_string());
            }
            format!("{:<40} {}", run.run_name, slots.join(", "))
        })
        .collect())
}
