//! Per-operation state files enabling resume after crash or cancellation.
//!
//! A state file is a JSON document mapping the 64-bit symbolic-path hash of
//! every planned file to its status. Concurrent workers never touch the file
//! directly: updates flow over a channel into a single writer task that
//! collapses adjacent updates into one atomic rewrite.

use chrono::Utc;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::fsio;

/// Updates applied between disk flushes.
pub const FLUSH_EVERY: usize = 20;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("corrupt state file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("state encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("state writer task failed: {0}")]
    Writer(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Status of one planned file, serialized as `"pending"`, `"done"`, or
/// `"failed:<message>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Done,
    Failed(String),
}

impl Serialize for FileStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FileStatus::Pending => serializer.serialize_str("pending"),
            FileStatus::Done => serializer.serialize_str("done"),
            FileStatus::Failed(msg) => serializer.serialize_str(&format!("failed:{}", msg)),
        }
    }
}

impl<'de> Deserialize<'de> for FileStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "pending" => Ok(FileStatus::Pending),
            "done" => Ok(FileStatus::Done),
            other => match other.strip_prefix("failed:") {
                Some(msg) => Ok(FileStatus::Failed(msg.to_string())),
                None => Err(D::Error::custom(format!("unknown file status {:?}", raw))),
            },
        }
    }
}

/// The persisted operation record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationState {
    pub operation_type: String,
    pub timestamp: String,
    /// Remote URL for syncs, source location for moves.
    pub source: String,
    pub target_location: String,
    pub components: Vec<String>,
    /// Decimal 64-bit path-hash keys.
    pub files: BTreeMap<String, FileStatus>,
}

impl OperationState {
    pub fn new(
        operation_type: &str,
        source: &str,
        target_location: &str,
        components: Vec<String>,
    ) -> Self {
        OperationState {
            operation_type: operation_type.to_string(),
            timestamp: Utc::now().format("%Y%m%d_%H%M%S").to_string(),
            source: source.to_string(),
            target_location: target_location.to_string(),
            components,
            files: BTreeMap::new(),
        }
    }

    /// File name this state persists under: `operation_<op>_<ts>.json`.
    pub fn file_name(&self) -> String {
        format!("operation_{}_{}.json", self.operation_type, self.timestamp)
    }

    pub fn insert_pending(&mut self, hash: u64) {
        self.files.insert(hash.to_string(), FileStatus::Pending);
    }

    pub fn set(&mut self, hash: u64, status: FileStatus) {
        self.files.insert(hash.to_string(), status);
    }

    pub fn get(&self, hash: u64) -> Option<&FileStatus> {
        self.files.get(&hash.to_string())
    }

    /// Hashes still needing work: `pending` plus `failed`.
    pub fn remaining(&self) -> Vec<u64> {
        self.files
            .iter()
            .filter(|(_, status)| !matches!(status, FileStatus::Done))
            .filter_map(|(key, _)| key.parse().ok())
            .collect()
    }

    /// `(pending, done, failed)` counts.
    pub fn counts(&self) -> (u64, u64, u64) {
        let mut pending = 0;
        let mut done = 0;
        let mut failed = 0;
        for status in self.files.values() {
            match status {
                FileStatus::Pending => pending += 1,
                FileStatus::Done => done += 1,
                FileStatus::Failed(_) => failed += 1,
            }
        }
        (pending, done, failed)
    }

    /// Load a state file. Anything unparseable refuses to resume.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        fsio::write_atomic(path, &bytes)?;
        Ok(())
    }
}

/// A status update on its way to the writer task.
#[derive(Debug)]
pub enum StateUpdate {
    Set { hash: u64, status: FileStatus },
    Flush,
}

/// Serializes concurrent worker updates into batched atomic rewrites.
pub struct StateWriter {
    tx: mpsc::UnboundedSender<StateUpdate>,
    handle: tokio::task::JoinHandle<Result<OperationState, StateError>>,
}

impl StateWriter {
    /// Spawn the writer. The initial (all-pending) snapshot hits disk before
    /// the first update is accepted.
    pub fn spawn(mut state: OperationState, path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            state.save(&path)?;
            let mut dirty = 0usize;
            while let Some(update) = rx.recv().await {
                match update {
                    StateUpdate::Set { hash, status } => {
                        state.set(hash, status);
                        dirty += 1;
                        if dirty >= FLUSH_EVERY {
                            state.save(&path)?;
                            dirty = 0;
                        }
                    }
                    StateUpdate::Flush => {
                        if dirty > 0 {
                            state.save(&path)?;
                            dirty = 0;
                        }
                    }
                }
            }
            if dirty > 0 {
                state.save(&path)?;
            }
            debug!(path = %path.display(), "state writer finished");
            Ok(state)
        });
        StateWriter { tx, handle }
    }

    pub fn set(&self, hash: u64, status: FileStatus) {
        let _ = self.tx.send(StateUpdate::Set { hash, status });
    }

    pub fn flush(&self) {
        let _ = self.tx.send(StateUpdate::Flush);
    }

    /// Close the channel, wait for the final flush, and hand back the state.
    pub async fn finish(self) -> Result<OperationState, StateError> {
        drop(self.tx);
        self.handle
            .await
            .map_err(|e| StateError::Writer(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_round_trip() {
        for status in [
            FileStatus::Pending,
            FileStatus::Done,
            FileStatus::Failed("HTTP 500 for x".to_string()),
        ] {
            let json = serde_json::to_string(&status).unwrap();
            let back: FileStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(status, back);
        }
        assert_eq!(
            serde_json::to_string(&FileStatus::Failed("a:b".to_string())).unwrap(),
            "\"failed:a:b\""
        );
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!(serde_json::from_str::<FileStatus>("\"finished\"").is_err());
    }

    #[test]
    fn test_state_round_trip_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = OperationState::new("sync", "http://host/data", "Main", vec![]);
        state.insert_pending(1);
        state.insert_pending(2);
        state.set(2, FileStatus::Done);
        state.set(3, FileStatus::Failed("size mismatch".to_string()));

        let path = dir.path().join(state.file_name());
        state.save(&path).unwrap();
        let loaded = OperationState::load(&path).unwrap();
        assert_eq!(state, loaded);
        assert_eq!(loaded.counts(), (1, 1, 1));
        let mut remaining = loaded.remaining();
        remaining.sort_unstable();
        assert_eq!(remaining, vec![1, 3]);
    }

    #[test]
    fn test_corrupt_state_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("operation_sync_x.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            OperationState::load(&path),
            Err(StateError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_writer_flushes_and_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = OperationState::new("sync", "mock", "Main", vec![]);
        for hash in 0..5u64 {
            state.insert_pending(hash);
        }
        let path = dir.path().join(state.file_name());
        let writer = StateWriter::spawn(state, path.clone());

        // Initial snapshot reaches disk even before any update
        writer.flush();
        writer.set(0, FileStatus::Done);
        writer.set(1, FileStatus::Failed("boom".to_string()));
        let final_state = writer.finish().await.unwrap();
        assert_eq!(final_state.counts(), (3, 1, 1));

        let on_disk = OperationState::load(&path).unwrap();
        assert_eq!(on_disk, final_state);
    }
}
