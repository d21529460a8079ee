//! Configuration for epochwise.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> explicit config file -> environment. CLI flags are
//! applied by the caller on the extracted value.
//! The workspace file lives at `.epochwise/config.toml`.

use crate::error::TrainError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub scalars: ScalarsConfig,
    #[serde(default)]
    pub data: SyntheticDataConfig,
    #[serde(default)]
    pub model: ModelConfig,
}

/// Epoch loop and metric settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Epochs to run in this invocation, counted from the resume point.
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batches per live-logging window.
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    /// Seed for the shuffle, augmentation and device streams of a fresh run.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Metric names, resolved through the metric registry, in display order.
    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,
    /// Metric whose validation value selects the best checkpoint.
    #[serde(default = "default_primary_metric")]
    pub primary_metric: String,
    /// Stop after this many epochs without improvement. Off when unset.
    #[serde(default)]
    pub early_stopping_patience: Option<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            batch_size: default_batch_size(),
            log_interval: default_log_interval(),
            seed: default_seed(),
            metrics: default_metrics(),
            primary_metric: default_primary_metric(),
            early_stopping_patience: None,
        }
    }
}

fn default_epochs() -> usize {
    10
}

fn default_learning_rate() -> f64 {
    0.01
}

fn default_batch_size() -> usize {
    32
}

fn default_log_interval() -> usize {
    10
}

fn default_seed() -> u64 {
    42
}

fn default_metrics() -> Vec<String> {
    vec!["loss".to_string(), "accuracy".to_string()]
}

fn default_primary_metric() -> String {
    "loss".to_string()
}

/// Checkpoint storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
    /// Run to resume or create. A fresh name is generated when unset.
    #[serde(default)]
    pub run_name: Option<String>,
    #[serde(default = "default_run_prefix")]
    pub run_prefix: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            run_name: None,
            run_prefix: default_run_prefix(),
        }
    }
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".epochwise/checkpoints")
}

fn default_run_prefix() -> String {
    "run".to_string()
}

/// Scalar event log settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_scalars_dir")]
    pub dir: PathBuf,
}

impl Default for ScalarsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_scalars_dir(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_scalars_dir() -> PathBuf {
    PathBuf::from(".epochwise/runs")
}

/// Parameters of the built-in Gaussian-cluster dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticDataConfig {
    #[serde(default = "default_train_examples")]
    pub train_examples: usize,
    #[serde(default = "default_val_examples")]
    pub val_examples: usize,
    #[serde(default = "default_num_features")]
    pub num_features: usize,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Standard deviation of each cluster around its centre.
    #[serde(default = "default_cluster_spread")]
    pub cluster_spread: f64,
    /// Standard deviation of per-sample training jitter.
    #[serde(default = "default_augment_noise")]
    pub augment_noise: f64,
    /// Seed for generating the dataset itself, independent of the run seed.
    #[serde(default = "default_data_seed")]
    pub seed: u64,
}

impl Default for SyntheticDataConfig {
    fn default() -> Self {
        Self {
            train_examples: default_train_examples(),
            val_examples: default_val_examples(),
            num_features: default_num_features(),
            num_classes: default_num_classes(),
            cluster_spread: default_cluster_spread(),
            augment_noise: default_augment_noise(),
            seed: default_data_seed(),
        }
    }
}

fn default_train_examples() -> usize {
    600
}

fn default_val_examples() -> usize {
    150
}

fn default_num_features() -> usize {
    8
}

fn default_num_classes() -> usize {
    3
}

fn default_cluster_spread() -> f64 {
    1.0
}

fn default_augment_noise() -> f64 {
    0.05
}

fn default_data_seed() -> u64 {
    1234
}

/// Reference model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Input dropout probability during training.
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    #[serde(default = "default_init_scale")]
    pub init_scale: f64,
    #[serde(default = "default_init_seed")]
    pub init_seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dropout: default_dropout(),
            init_scale: default_init_scale(),
            init_seed: default_init_seed(),
        }
    }
}

fn default_dropout() -> f64 {
    0.1
}

fn default_init_scale() -> f64 {
    0.01
}

fn default_init_seed() -> u64 {
    7
}

impl TrainConfig {
    /// Reject settings the training loop cannot run with.
    pub fn validate(&self) -> Result<(), TrainError> {
        let t = &self.training;
        if t.epochs == 0 {
            return Err(TrainError::config("training.epochs must be positive"));
        }
        if t.batch_size == 0 {
            return Err(TrainError::config("training.batch_size must be positive"));
        }
        if t.log_interval == 0 {
            return Err(TrainError::config("training.log_interval must be positive"));
        }
        if !(t.learning_rate.is_finite() && t.learning_rate > 0.0) {
            return Err(TrainError::config("training.learning_rate must be a positive number"));
        }
        if t.metrics.is_empty() {
            return Err(TrainError::config("training.metrics must not be empty"));
        }
        if !t.metrics.contains(&t.primary_metric) {
            return Err(TrainError::config(format!(
                "training.primary_metric '{}' is not in training.metrics",
                t.primary_metric
            )));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(TrainError::config("model.dropout must be in [0, 1)"));
        }
        let d = &self.data;
        if d.num_classes < 2 || d.num_features == 0 {
            return Err(TrainError::config(
                "data needs at least two classes and one feature",
            ));
        }
        if d.train_examples == 0 || d.val_examples == 0 {
            return Err(TrainError::config("data splits must not be empty"));
        }
        if let Some(name) = &self.checkpoint.run_name {
            crate::training::checkpoint::validate_run_name(name)?;
        }
        Ok(())
    }

    /// Resolve relative storage directories against `workspace`.
    pub fn resolve_paths(&mut self, workspace: &Path) {
        if self.checkpoint.dir.is_relative() {
            self.checkpoint.dir = workspace.join(&self.checkpoint.dir);
        }
        if self.scalars.dir.is_relative() {
            self.scalars.dir = workspace.join(&self.scalars.dir);
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `EPOCHWISE_`)
/// 2. Explicit config file
/// 3. Workspace-local config (`.epochwise/config.toml`)
/// 4. User config (`~/.config/epochwise/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
) -> Result<TrainConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(TrainConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "epochwise", "epochwise") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".epochwise").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }

    // EPOCHWISE_TRAINING__EPOCHS, EPOCHWISE_CHECKPOINT__RUN_NAME, etc.
    figment = figment.merge(Env::prefixed("EPOCHWISE_").split("__"));

    figment.extract().map_err(Box::new)
}
