//! Pass mode shared by the tracker, the driver and the scalar log.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which pass of an epoch is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Train,
    Validate,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::Train, Mode::Validate];

    /// Whether gradients are computed and applied in this mode.
    pub fn is_training(self) -> bool {
        self == Mode::Train
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train => write!(f, "train"),
            Self::Validate => write!(f, "validate"),
        }
    }
}
