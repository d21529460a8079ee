//! Training infrastructure: metric tracking, checkpoints, random streams and the epoch driver.

pub mod callbacks;
pub mod checkpoint;
pub mod collaborators;
pub mod metrics;
pub mod mode;
pub mod rng;
pub mod runner;
pub mod scalars;
pub mod tracker;

pub use callbacks::{CallbackAction, EarlyStopping, EpochCallback};
pub use checkpoint::{CheckpointBundle, CheckpointStore, Slot};
pub use collaborators::{Batch, Criterion, DataSource, Model, Optimizer, StateDict};
pub use metrics::{Direction, Metric, MetricRegistry};
pub use mode::Mode;
pub use rng::RngStreams;
pub use runner::{EpochSummary, Trainer, TrainingContext};
pub use scalars::{JsonlScalarSink, NullScalarSink, ScalarSink};
pub use tracker::MetricTracker;
