//! Physical relocation of files between locations.
//!
//! Selection is either an explicit list of symbolic artist/album folders or
//! a size budget that moves whole albums until the budget is reached; an
//! album is never split across locations. Moves reuse the operation-state
//! machinery, so an interrupted move resumes like an interrupted sync.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::index::{path_hash, DatasetIndex};
use crate::locations::{split_symbolic, swap_location, LocationError, LocationRegistry};
use crate::sync::state::{FileStatus, OperationState, StateError, StateWriter};

#[derive(Error, Debug)]
pub enum MoverError {
    #[error("location error: {0}")]
    Location(#[from] LocationError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("folder {folder:?} is not under source location {source_location:?}")]
    FolderOutsideSource { folder: String, source_location: String },
    #[error("state file records a {0:?} operation, not a move")]
    WrongOperation(String),
    #[error("size budget must be positive, got {0}")]
    BadBudget(f64),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct MoveOutcome {
    pub moved_files: u64,
    pub moved_bytes: u64,
    pub failed: u64,
    pub cancelled: bool,
    pub state_file: Option<PathBuf>,
}

impl MoveOutcome {
    pub fn fully_done(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

#[derive(Debug, Clone)]
struct MoveItem {
    src_symbolic: String,
    src_abs: PathBuf,
    dst_abs: PathBuf,
    size: u64,
    hash: u64,
}

pub struct Mover<'a> {
    pub registry: &'a LocationRegistry,
    pub index: &'a DatasetIndex,
    pub meta_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl Mover<'_> {
    /// Move explicit folders (symbolic artist or album paths) from `source`
    /// to `target`.
    pub async fn move_folders(
        &self,
        source: &str,
        target: &str,
        folders: &[String],
    ) -> Result<MoveOutcome, MoverError> {
        for folder in folders {
            let (location, _) = split_symbolic(folder)?;
            if location != source {
                return Err(MoverError::FolderOutsideSource {
                    folder: folder.clone(),
                    source_location: source.to_string(),
                });
            }
        }

        let mut files = Vec::new();
        for track in self.index.tracks.values() {
            for (symbolic, size) in &track.file_sizes {
                let under = folders
                    .iter()
                    .any(|folder| symbolic.starts_with(&format!("{}/", folder)));
                if under {
                    files.push((symbolic.clone(), *size));
                }
            }
        }
        self.run(source, target, files).await
    }

    /// Move whole albums out of `source` until at least `gigabytes` have
    /// moved, never splitting an album. Albums go in lexicographic order for
    /// reproducibility.
    pub async fn balance(
        &self,
        source: &str,
        target: &str,
        gigabytes: f64,
    ) -> Result<MoveOutcome, MoverError> {
        if gigabytes <= 0.0 {
            return Err(MoverError::BadBudget(gigabytes));
        }
        let budget_bytes = (gigabytes * 1e9) as u64;
        let prefix = format!("{}/", source);

        let mut files = Vec::new();
        let mut planned_bytes = 0u64;
        for (album_path, track_paths) in &self.index.track_by_album {
            if !album_path.starts_with(&prefix) {
                continue;
            }
            if planned_bytes >= budget_bytes {
                break;
            }
            for track_path in track_paths {
                if let Some(track) = self.index.tracks.get(track_path) {
                    for (symbolic, size) in &track.file_sizes {
                        files.push((symbolic.clone(), *size));
                        planned_bytes += size;
                    }
                }
            }
            debug!(album = %album_path, planned_bytes, "album selected for balance");
        }
        self.run(source, target, files).await
    }

    /// Resume an interrupted move from its state file. Source paths come
    /// from the local index's hash lookup.
    pub async fn resume(&self, state_path: &Path) -> Result<MoveOutcome, MoverError> {
        let mut state = OperationState::load(state_path)?;
        if state.operation_type != "move" {
            return Err(MoverError::WrongOperation(state.operation_type));
        }
        let target = state.target_location.clone();

        let mut items = Vec::new();
        for hash in state.remaining() {
            let (symbolic, size) = match self.index.file_info_by_hash.get(&hash) {
                Some(info) => info.clone(),
                None => {
                    warn!(hash, "state entry no longer present in the index");
                    state.set(hash, FileStatus::Failed("no longer in index".to_string()));
                    continue;
                }
            };
            let src_abs = self.registry.resolve(&symbolic)?;
            let dst_abs = self.registry.resolve(&swap_location(&symbolic, &target)?)?;
            if !src_abs.exists() && dst_abs.exists() {
                // The move completed before the crash
                state.set(hash, FileStatus::Done);
                continue;
            }
            items.push(MoveItem {
                hash,
                src_symbolic: symbolic,
                src_abs,
                dst_abs,
                size,
            });
        }

        let writer = StateWriter::spawn(state, state_path.to_path_buf());
        let outcome = self.execute(items, writer, state_path.to_path_buf()).await?;
        Ok(outcome)
    }

    async fn run(
        &self,
        source: &str,
        target: &str,
        files: Vec<(String, u64)>,
    ) -> Result<MoveOutcome, MoverError> {
        if files.is_empty() {
            info!(source, target, "move: nothing selected");
            return Ok(MoveOutcome::default());
        }

        let mut items = Vec::new();
        let mut state = OperationState::new("move", source, target, vec![]);
        for (symbolic, size) in files {
            let hash = path_hash(&symbolic);
            state.insert_pending(hash);
            items.push(MoveItem {
                hash,
                src_abs: self.registry.resolve(&symbolic)?,
                dst_abs: self.registry.resolve(&swap_location(&symbolic, target)?)?,
                src_symbolic: symbolic,
                size,
            });
        }

        info!(files = items.len(), source, target, "move: executing");
        let state_path = self.meta_dir.join(state.file_name());
        let writer = StateWriter::spawn(state, state_path.clone());
        self.execute(items, writer, state_path).await
    }

    async fn execute(
        &self,
        items: Vec<MoveItem>,
        writer: StateWriter,
        state_path: PathBuf,
    ) -> Result<MoveOutcome, MoverError> {
        let mut outcome = MoveOutcome::default();
        let source_roots: Vec<PathBuf> = self
            .registry
            .iter()
            .map(|(_, root)| root.to_path_buf())
            .collect();

        for item in &items {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            match move_file(&item.src_abs, &item.dst_abs).await {
                Ok(()) => {
                    writer.set(item.hash, FileStatus::Done);
                    outcome.moved_files += 1;
                    outcome.moved_bytes += item.size;
                    if let Some(parent) = item.src_abs.parent() {
                        prune_empty_dirs(parent, &source_roots);
                    }
                }
                Err(e) => {
                    warn!(path = %item.src_symbolic, error = %e, "move failed");
                    writer.set(item.hash, FileStatus::Failed(e.to_string()));
                    outcome.failed += 1;
                }
            }
        }
        writer.flush();
        let final_state = writer.finish().await?;

        let (pending, done, failed) = final_state.counts();
        if pending == 0 && failed == 0 && !outcome.cancelled {
            std::fs::remove_file(&state_path)?;
            info!(moved = done, bytes = outcome.moved_bytes, "move complete");
        } else {
            warn!(
                state_file = %state_path.display(),
                remaining = pending + failed,
                "move incomplete; run resume against the state file"
            );
            outcome.state_file = Some(state_path);
        }
        Ok(outcome)
    }
}

/// Rename when source and target share a filesystem, copy-then-delete when
/// the rename fails with EXDEV. Any other rename failure is reported as is.
async fn move_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            tokio::fs::copy(src, dst).await?;
            tokio::fs::remove_file(src).await
        }
        Err(e) => Err(e),
    }
}

/// Remove now-empty directories up to (but excluding) any location root.
fn prune_empty_dirs(start: &Path, roots: &[PathBuf]) {
    let mut dir = start.to_path_buf();
    loop {
        if roots.iter().any(|root| dir == *root) {
            break;
        }
        if std::fs::remove_dir(&dir).is_err() {
            break;
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::builder::IndexBuilder;
    use crate::schema::DatasetSchema;
    use crate::META_DIR;

    fn write(root: &Path, rel: &str, bytes: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    fn fixture() -> (tempfile::TempDir, tempfile::TempDir, DatasetSchema) {
        let main = tempfile::tempdir().unwrap();
        let ssd = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(main.path().join(META_DIR)).unwrap();
        write(main.path(), "Artist/Album_One/One_instrumental.mp3", b"abcd");
        write(main.path(), "Artist/Album_One/Two_instrumental.mp3", b"abcd");
        write(main.path(), "Artist/Album_Two/Three_instrumental.mp3", b"abcd");
        let mut schema = DatasetSchema::new();
        schema
            .add_component("instrumental", "*_instrumental.mp3", false, None)
            .unwrap();
        (main, ssd, schema)
    }

    #[tokio::test]
    async fn test_move_folders_relocates_and_prunes() {
        let (main, ssd, schema) = fixture();
        let mut registry = LocationRegistry::load(main.path()).unwrap();
        registry.add("SSD", ssd.path()).unwrap();
        let index = IndexBuilder::new(&registry, &schema).build().unwrap();

        let mover = Mover {
            registry: &registry,
            index: &index,
            meta_dir: main.path().join(META_DIR),
            cancel: CancellationToken::new(),
        };
        let outcome = mover
            .move_folders("Main", "SSD", &["Main/Artist/Album_One".to_string()])
            .await
            .unwrap();

        assert!(outcome.fully_done());
        assert_eq!(outcome.moved_files, 2);
        assert_eq!(outcome.moved_bytes, 8);
        assert!(outcome.state_file.is_none());
        assert!(ssd.path().join("Artist/Album_One/One_instrumental.mp3").exists());
        assert!(!main.path().join("Artist/Album_One").exists());
        // The untouched album stays put
        assert!(main.path().join("Artist/Album_Two/Three_instrumental.mp3").exists());
    }

    #[tokio::test]
    async fn test_balance_never_splits_an_album() {
        let (main, ssd, schema) = fixture();
        let mut registry = LocationRegistry::load(main.path()).unwrap();
        registry.add("SSD", ssd.path()).unwrap();
        let index = IndexBuilder::new(&registry, &schema).build().unwrap();

        let mover = Mover {
            registry: &registry,
            index: &index,
            meta_dir: main.path().join(META_DIR),
            cancel: CancellationToken::new(),
        };
        // Budget of 5 bytes: Album_One alone (8 bytes) satisfies it
        let outcome = mover.balance("Main", "SSD", 5e-9).await.unwrap();

        assert!(outcome.fully_done());
        assert_eq!(outcome.moved_files, 2);
        assert_eq!(outcome.moved_bytes, 8);
        assert!(ssd.path().join("Artist/Album_One/Two_instrumental.mp3").exists());
        assert!(main.path().join("Artist/Album_Two/Three_instrumental.mp3").exists());
    }

    #[tokio::test]
    async fn test_move_folder_outside_source_rejected() {
        let (main, ssd, schema) = fixture();
        let mut registry = LocationRegistry::load(main.path()).unwrap();
        registry.add("SSD", ssd.path()).unwrap();
        let index = IndexBuilder::new(&registry, &schema).build().unwrap();

        let mover = Mover {
            registry: &registry,
            index: &index,
            meta_dir: main.path().join(META_DIR),
            cancel: CancellationToken::new(),
        };
        assert!(matches!(
            mover
                .move_folders("SSD", "Main", &["Main/Artist/Album_One".to_string()])
                .await,
            Err(MoverError::FolderOutsideSource { .. })
        ));
    }
}
