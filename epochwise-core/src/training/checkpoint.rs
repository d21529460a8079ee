//! Checkpoint bundles and the two-slot checkpoint store.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<run_name>/latest.json
//! <root>/<run_name>/best.json
//! ```
//!
//! Both slots hold the same JSON document format. Writes are atomic per slot.

use crate::error::TrainError;
use crate::persistence;
use crate::training::collaborators::StateDict;
use crate::training::rng::RngStreams;
use crate::training::tracker::TrackerSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// Current bundle schema. Bump when a field changes meaning; new optional
/// fields only need `#[serde(default)]`.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Everything needed to resume after a completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointBundle {
    pub schema_version: u32,
    pub run_name: String,
    /// Last completed epoch.
    pub epoch: usize,
    pub model_state: StateDict,
    pub optimizer_state: StateDict,
    pub rng_states: RngStreams,
    pub metric_snapshot: TrackerSnapshot,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl CheckpointBundle {
    /// Put the saved generator states back into the live streams.
    ///
    /// Must run before the first batch of the resumed run is drawn.
    pub fn restore_rng_state(&self, rngs: &mut RngStreams) {
        rngs.restore(&self.rng_states);
    }

    /// Best primary validation value recorded in the snapshot.
    pub fn best_metric(&self) -> Option<f64> {
        self.metric_snapshot.best_metric
    }
}

/// One of the two storage locations of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Latest,
    Best,
}

impl Slot {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Latest => "latest.json",
            Self::Best => "best.json",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Best => write!(f, "best"),
        }
    }
}

/// Result of a successful save.
#[derive(Debug, Clone)]
pub struct SavedCheckpoint {
    pub latest: PathBuf,
    pub best: Option<PathBuf>,
    pub size_bytes: u64,
}

/// Slot presence for one run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSlots {
    pub run_name: String,
    pub latest: bool,
    pub best: bool,
}

#[derive(Deserialize)]
struct SchemaHeader {
    schema_version: u32,
}

/// File-backed store with a "latest" and a "best" slot per run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_name: &str) -> Result<PathBuf, TrainError> {
        validate_run_name(run_name)?;
        Ok(self.root.join(run_name))
    }

    pub fn slot_path(&self, run_name: &str, slot: Slot) -> Result<PathBuf, TrainError> {
        Ok(self.run_dir(run_name)?.join(slot.file_name()))
    }

    pub fn slot_exists(&self, run_name: &str, slot: Slot) -> Result<bool, TrainError> {
        Ok(self.slot_path(run_name, slot)?.is_file())
    }

    /// Write `bundle` to "latest", and to "best" as well when `is_best`.
    ///
    /// The document is serialized once so both slots are byte-identical.
    pub fn save(
        &self,
        bundle: &CheckpointBundle,
        run_name: &str,
        is_best: bool,
    ) -> Result<SavedCheckpoint, TrainError> {
        if bundle.run_name != run_name {
            return Err(TrainError::invalid_input(format!(
                "bundle belongs to run '{}', not '{run_name}'",
                bundle.run_name
            )));
        }
        let bytes = serde_json::to_vec_pretty(bundle)?;
        let hash = format!("{:x}", Sha256::digest(&bytes));

        let latest = self.slot_path(run_name, Slot::Latest)?;
        persistence::atomic_write(&latest, &bytes)?;

        let best = if is_best {
            let path = self.slot_path(run_name, Slot::Best)?;
            persistence::atomic_write(&path, &bytes)?;
            Some(path)
        } else {
            None
        };

        tracing::info!(
            run = run_name,
            epoch = bundle.epoch,
            is_best,
            size_bytes = bytes.len(),
            hash = %&hash[..12],
            "Checkpoint saved"
        );
        Ok(SavedCheckpoint {
            latest,
            best,
            size_bytes: bytes.len() as u64,
        })
    }

    /// Bundle from the "latest" slot, or `None` when the run has none yet.
    pub fn load(&self, run_name: &str) -> Result<Option<CheckpointBundle>, TrainError> {
        self.load_slot(run_name, Slot::Latest)
    }

    pub fn load_slot(
        &self,
        run_name: &str,
        slot: Slot,
    ) -> Result<Option<CheckpointBundle>, TrainError> {
        let path = self.slot_path(run_name, slot)?;
        let Some(bytes) = persistence::read_optional(&path)? else {
            return Ok(None);
        };
        let header: SchemaHeader = serde_json::from_slice(&bytes)?;
        if header.schema_version > CHECKPOINT_SCHEMA_VERSION {
            return Err(TrainError::UnsupportedSchema {
                found: header.schema_version,
                supported: CHECKPOINT_SCHEMA_VERSION,
            });
        }
        let bundle: CheckpointBundle = serde_json::from_slice(&bytes)?;
        if bundle.run_name != run_name {
            return Err(TrainError::load(format!(
                "{} holds run '{}'",
                path.display(),
                bundle.run_name
            )));
        }
        tracing::debug!(run = run_name, %slot, epoch = bundle.epoch, "Checkpoint loaded");
        Ok(Some(bundle))
    }

    /// Every run directory under the root that holds at least one slot.
    pub fn list_runs(&self) -> Result<Vec<RunSlots>, TrainError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(run_name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let dir = entry.path();
            let latest = dir.join(Slot::Latest.file_name()).is_file();
            let best = dir.join(Slot::Best.file_name()).is_file();
            if latest || best {
                runs.push(RunSlots {
                    run_name,
                    latest,
                    best,
                });
            }
        }
        runs.sort_by(|a, b| a.run_name.cmp(&b.run_name));
        Ok(runs)
    }
}

/// Run names become a directory name, so they must be one plain component.
pub fn validate_run_name(run_name: &str) -> Result<(), TrainError> {
    let ok = !run_name.is_empty()
        && run_name != "."
        && run_name != ".."
        && run_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(TrainError::invalid_input(format!("invalid run name '{run_name}'")))
    }
}

/// `<prefix>-<UTC timestamp>-<8 hex chars>`.
pub fn generate_run_name(prefix: &str) -> String {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{stamp}-{}", &id[..8])
}
