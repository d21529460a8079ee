//! # epochwise-core
//!
//! Resumable supervised-training driver. An interrupted run continues from
//! its last completed epoch with model, optimizer, random streams and metric
//! history restored, so the continuation matches an uninterrupted run.

pub mod config;
pub mod error;
pub mod persistence;
pub mod reference;
pub mod training;

// Re-exports
pub use config::TrainConfig;
pub use error::TrainError;
pub use training::{CheckpointStore, MetricTracker, Mode, Trainer};
