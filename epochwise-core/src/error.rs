//! Error types for the epochwise-core crate.

use crate::training::Mode;
use thiserror::Error;

/// Top-level error type for training operations.
#[derive(Debug, Error)]
pub enum TrainError {
    /// An epoch was finalized before any example was recorded.
    #[error("Division error: metric '{metric}' finalized with zero examples")]
    Division { metric: String },

    /// A checkpoint could not be applied to the live model or optimizer.
    #[error("Load error: {0}")]
    Load(String),

    #[error("Numeric instability: non-finite loss {value} at epoch {epoch}, step {step} ({mode})")]
    NumericInstability {
        epoch: usize,
        step: usize,
        mode: Mode,
        value: f64,
    },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Unsupported checkpoint schema version {found} (supported up to {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },

    /// `batch_update` was called without `set_num_examples` for the pass.
    #[error("Pass not started: call set_num_examples before updating metrics ({0})")]
    PassNotStarted(Mode),

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl TrainError {
    pub fn load(msg: impl Into<String>) -> Self {
        Self::Load(msg.into())
    }

    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::Snapshot(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
