//! Scalar event log for window and epoch values.

use crate::error::TrainError;
use crate::persistence;
use crate::training::Mode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Whether a scalar came from a log window or a finalized epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    Window,
    Epoch,
}

/// One logged value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub metric: String,
    pub mode: Mode,
    pub kind: ScalarKind,
    /// Epoch the value was produced in.
    pub epoch: usize,
    /// Example-count step for windows, epoch number for epochs.
    pub step: u64,
    pub value: f64,
    pub wall_time: DateTime<Utc>,
}

/// Destination for scalar events.
pub trait ScalarSink: Send {
    fn record(&mut self, event: ScalarEvent) -> Result<(), TrainError>;

    /// Drop every event of an epoch later than `epoch`.
    ///
    /// Called on resume from a checkpoint of `epoch` (0 for a fresh start), so
    /// values of an epoch that never completed are not kept next to its rerun.
    fn purge_after(&mut self, _epoch: usize) -> Result<(), TrainError> {
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullScalarSink;

impl ScalarSink for NullScalarSink {
    fn record(&mut self, _event: ScalarEvent) -> Result<(), TrainError> {
        Ok(())
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryScalarSink {
    pub events: Vec<ScalarEvent>,
}

impl ScalarSink for MemoryScalarSink {
    fn record(&mut self, event: ScalarEvent) -> Result<(), TrainError> {
        self.events.push(event);
        Ok(())
    }

    fn purge_after(&mut self, epoch: usize) -> Result<(), TrainError> {
        self.events.retain(|e| e.epoch <= epoch);
        Ok(())
    }
}

/// Appends JSON lines to `<dir>/<run_name>/scalars.jsonl`.
///
/// A resumed run keeps appending to the same file.
#[derive(Debug)]
pub struct JsonlScalarSink {
    path: PathBuf,
}

impl JsonlScalarSink {
    pub fn new(dir: &Path, run_name: &str) -> Self {
        Self {
            path: dir.join(run_name).join("scalars.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every event in the file.
    pub fn read_all(&self) -> Result<Vec<ScalarEvent>, TrainError> {
        let Some(bytes) = persistence::read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&bytes);
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(TrainError::from))
            .collect()
    }
}

impl ScalarSink for JsonlScalarSink {
    fn record(&mut self, event: ScalarEvent) -> Result<(), TrainError> {
        persistence::append_json_line(&self.path, &event)?;
        Ok(())
    }

    /// Rewrites the file atomically when anything has to go.
    fn purge_after(&mut self, epoch: usize) -> Result<(), TrainError> {
        let events = self.read_all()?;
        let total = events.len();
        let kept: Vec<ScalarEvent> = events.into_iter().filter(|e| e.epoch <= epoch).collect();
        if kept.len() == total {
            return Ok(());
        }
        let mut bytes = Vec::new();
        for event in &kept {
            serde_json::to_writer(&mut bytes, event)?;
            bytes.push(b'\n');
        }
        persistence::atomic_write(&self.path, &bytes)?;
        tracing::info!(
            path = %self.path.display(),
            epoch,
            dropped = total - kept.len(),
            "Dropped scalar events of unfinished epochs"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn event(value: f64) -> ScalarEvent {
        epoch_event(1, value)
    }

    fn epoch_event(epoch: usize, value: f64) -> ScalarEvent {
        ScalarEvent {
            metric: "loss".into(),
            mode: Mode::Train,
            kind: ScalarKind::Window,
            epoch,
            step: 20 * epoch as u64,
            value,
            wall_time: Utc::now(),
        }
    }

    #[test]
    fn test_jsonl_sink_appends() {
        let dir = TempDir::new().unwrap();
        let mut sink = JsonlScalarSink::new(dir.path(), "run-a");
        sink.record(event(0.5)).unwrap();
        sink.record(event(0.25)).unwrap();

        let events = sink.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].value, 0.25);
        assert!(sink.path().ends_with("run-a/scalars.jsonl"));
    }

    #[test]
    fn test_jsonl_sink_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlScalarSink::new(dir.path(), "never-written");
        assert!(sink.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_jsonl_purge_drops_later_epochs() {
        let dir = TempDir::new().unwrap();
        let mut sink = JsonlScalarSink::new(dir.path(), "run-b");
        for (epoch, value) in [(1, 0.9), (2, 0.7), (3, 0.6), (3, 0.5)] {
            sink.record(epoch_event(epoch, value)).unwrap();
        }

        sink.purge_after(2).unwrap();
        let values: Vec<f64> = sink.read_all().unwrap().iter().map(|e| e.value).collect();
        assert_eq!(values, vec![0.9, 0.7]);

        sink.record(epoch_event(3, 0.4)).unwrap();
        assert_eq!(sink.read_all().unwrap().len(), 3);
    }

    #[test]
    fn test_purge_without_file_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut sink = JsonlScalarSink::new(dir.path(), "fresh");
        sink.purge_after(0).unwrap();
        assert!(!sink.path().exists());
    }

    #[test]
    fn test_memory_purge_from_fresh_start_clears_all() {
        let mut sink = MemoryScalarSink::default();
        sink.record(epoch_event(1, 0.3)).unwrap();
        sink.purge_after(0).unwrap();
        assert!(sink.events.is_empty());
    }
}
