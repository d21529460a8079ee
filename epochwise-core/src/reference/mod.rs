//! Small concrete collaborators for the driver, used by the CLI and tests.

pub mod adam;
pub mod linear;
pub mod synthetic;

pub use adam::Adam;
pub use linear::{CrossEntropy, SoftmaxRegression};
pub use synthetic::{InMemoryDataset, gaussian_clusters};
