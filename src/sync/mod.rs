//! Selective parallel pull-synchronizer.
//!
//! A sync fetches the remote schema and index, intersects them with the
//! user's filters and the local dataset, and executes the resulting plan on
//! a bounded worker pool. Per-file failures never abort the run; they land
//! in the operation state file so `resume` can pick them up.

pub mod plan;
pub mod state;

pub use plan::{RemoteFile, SyncFilters, SyncPlan, WorkItem};
pub use state::{FileStatus, OperationState, StateWriter};

use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::index::{DatasetIndex, IndexError};
use crate::locations::{relative_part, swap_location, LocationError, LocationRegistry, MAIN_LOCATION};
use crate::schema::{DatasetSchema, SchemaError};
use crate::sync::state::StateError;
use crate::transport::{backoff_delay, RemoteStore, TransportError, RETRY_ATTEMPTS};
use crate::SCHEMA_FILE;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("location error: {0}")]
    Location(#[from] LocationError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("invalid filter: {0}")]
    Filter(String),
    #[error("state file records a {0:?} operation, not a sync")]
    WrongOperation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Performance and targeting knobs for one sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Worker pool size.
    pub parallel: usize,
    /// Location downloads land in.
    pub target_location: String,
    /// Re-download even when a local file already matches by size.
    pub force: bool,
    pub cancel: CancellationToken,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            parallel: 1,
            target_location: MAIN_LOCATION.to_string(),
            force: false,
            cancel: CancellationToken::new(),
        }
    }
}

/// What a sync run accomplished. `state_file` is `Some` exactly when there
/// is something left to resume.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub done: u64,
    pub skipped: u64,
    pub failed: u64,
    pub cancelled: bool,
    pub state_file: Option<PathBuf>,
}

impl SyncOutcome {
    /// True when every planned file ended `done` — the exit-code contract.
    pub fn fully_done(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

enum ItemOutcome {
    Done,
    Failed,
    Cancelled,
}

/// The puller: remote origin plus the local pieces it reconciles against.
pub struct Synchronizer<'a> {
    pub remote: Arc<dyn RemoteStore>,
    /// Label recorded in state files, normally the remote URL.
    pub source: String,
    pub registry: &'a LocationRegistry,
    /// The `.blackbird` directory holding schema and state files.
    pub meta_dir: PathBuf,
}

impl Synchronizer<'_> {
    /// Run a full sync: merge schema, plan, execute, conclude.
    pub async fn sync(
        &self,
        schema: &mut DatasetSchema,
        local_index: Option<&DatasetIndex>,
        filters: &SyncFilters,
        opts: &SyncOptions,
    ) -> Result<SyncOutcome, SyncError> {
        filters.validate()?;
        self.remote.check().await?;

        let remote_schema = DatasetSchema::from_slice(&self.remote.fetch_schema().await?)?;
        let remote_index = DatasetIndex::from_bytes(&self.remote.fetch_index().await?)?;

        let effective = schema.merge_remote(&remote_schema, filters.components.as_deref())?;
        schema.save(&self.meta_dir.join(SCHEMA_FILE))?;

        let local_view = local_index.map(|index| (index, opts.target_location.as_str()));
        let plan = plan::build_plan(
            &remote_index,
            self.registry,
            Some(&effective),
            filters,
            local_view,
            &opts.target_location,
            opts.force,
        )?;

        if plan.items.is_empty() {
            info!(preskipped = plan.preskipped, "sync: nothing to download");
            return Ok(SyncOutcome {
                skipped: plan.preskipped,
                ..Default::default()
            });
        }
        info!(
            planned = plan.items.len(),
            preskipped = plan.preskipped,
            parallel = opts.parallel,
            "sync: executing plan"
        );

        let mut state = OperationState::new("sync", &self.source, &opts.target_location, effective);
        for item in &plan.items {
            state.insert_pending(item.hash);
        }
        let state_path = self.meta_dir.join(state.file_name());
        let writer = StateWriter::spawn(state, state_path.clone());

        let (done, failed, cancelled) =
            execute(self.remote.as_ref(), &plan.items, &writer, opts).await;
        let final_state = writer.finish().await?;

        self.conclude(
            final_state,
            state_path,
            SyncOutcome {
                done,
                skipped: plan.preskipped,
                failed,
                cancelled,
                state_file: None,
            },
        )
    }

    /// Re-run the remaining entries of an interrupted operation. Files that
    /// appeared locally with the right size short-circuit to `done`.
    pub async fn resume(
        &self,
        state_path: &Path,
        opts: &SyncOptions,
    ) -> Result<SyncOutcome, SyncError> {
        let mut state = OperationState::load(state_path)?;
        if state.operation_type != "sync" {
            return Err(SyncError::WrongOperation(state.operation_type));
        }

        let remote_index = DatasetIndex::from_bytes(&self.remote.fetch_index().await?)?;
        let target = state.target_location.clone();

        let mut items = Vec::new();
        let mut skipped = 0u64;
        for hash in state.remaining() {
            let (symbolic, size) = match remote_index.file_info_by_hash.get(&hash) {
                Some(info) => info.clone(),
                None => {
                    warn!(hash, "state entry no longer present in remote index");
                    state.set(
                        hash,
                        FileStatus::Failed("no longer in remote index".to_string()),
                    );
                    continue;
                }
            };
            let local_symbolic = swap_location(&symbolic, &target)?;
            let local_abs = self.registry.resolve(&local_symbolic)?;
            if let Ok(metadata) = std::fs::metadata(&local_abs) {
                if metadata.len() == size {
                    state.set(hash, FileStatus::Done);
                    skipped += 1;
                    continue;
                }
            }
            items.push(WorkItem {
                hash,
                remote_symbolic: symbolic,
                local_symbolic,
                local_abs,
                expected_size: size,
            });
        }
        info!(
            remaining = items.len(),
            skipped, "resume: re-running state file"
        );

        let writer = StateWriter::spawn(state, state_path.to_path_buf());
        let (done, failed, cancelled) =
            execute(self.remote.as_ref(), &items, &writer, opts).await;
        let final_state = writer.finish().await?;

        self.conclude(
            final_state,
            state_path.to_path_buf(),
            SyncOutcome {
                done,
                skipped,
                failed,
                cancelled,
                state_file: None,
            },
        )
    }

    /// Decide the fate of the state file from the final on-disk statuses.
    fn conclude(
        &self,
        final_state: OperationState,
        state_path: PathBuf,
        mut outcome: SyncOutcome,
    ) -> Result<SyncOutcome, SyncError> {
        let (pending, done_total, failed_total) = final_state.counts();
        outcome.failed = failed_total;
        if pending == 0 && failed_total == 0 && !outcome.cancelled {
            std::fs::remove_file(&state_path)?;
            info!(
                done = done_total,
                skipped = outcome.skipped,
                "sync complete"
            );
        } else {
            warn!(
                state_file = %state_path.display(),
                remaining = pending + failed_total,
                "sync incomplete; run resume against the state file"
            );
            outcome.state_file = Some(state_path);
        }
        Ok(outcome)
    }
}

/// Drain the plan on a pool of `opts.parallel` workers. Returns
/// `(done, failed, cancelled)` for this run.
async fn execute(
    remote: &dyn RemoteStore,
    items: &[WorkItem],
    writer: &StateWriter,
    opts: &SyncOptions,
) -> (u64, u64, bool) {
    let cancel = &opts.cancel;
    let outcomes: Vec<ItemOutcome> = futures::stream::iter(items)
        .map(|item| process_item(remote, item, writer, cancel))
        .buffer_unordered(opts.parallel.max(1))
        .collect()
        .await;
    writer.flush();

    let mut done = 0;
    let mut failed = 0;
    let mut cancelled = false;
    for outcome in outcomes {
        match outcome {
            ItemOutcome::Done => done += 1,
            ItemOutcome::Failed => failed += 1,
            ItemOutcome::Cancelled => cancelled = true,
        }
    }
    (done, failed, cancelled)
}

/// Fetch one file: ensure parents, download with retry and size
/// verification, record the terminal status. Cancellation between attempts
/// leaves the entry `pending`.
async fn process_item(
    remote: &dyn RemoteStore,
    item: &WorkItem,
    writer: &StateWriter,
    cancel: &CancellationToken,
) -> ItemOutcome {
    if cancel.is_cancelled() {
        return ItemOutcome::Cancelled;
    }

    if let Some(parent) = item.local_abs.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            writer.set(item.hash, FileStatus::Failed(format!("create parent: {}", e)));
            return ItemOutcome::Failed;
        }
    }
    let wire_path = match relative_part(&item.remote_symbolic) {
        Ok(path) => path,
        Err(e) => {
            writer.set(item.hash, FileStatus::Failed(e.to_string()));
            return ItemOutcome::Failed;
        }
    };

    let mut last_error = String::new();
    for attempt in 1..=RETRY_ATTEMPTS {
        match remote.download(wire_path, &item.local_abs).await {
            Ok(written) if written == item.expected_size => {
                debug!(path = %item.local_symbolic, written, "downloaded");
                writer.set(item.hash, FileStatus::Done);
                return ItemOutcome::Done;
            }
            Ok(written) => {
                last_error = format!(
                    "size mismatch: got {} bytes, want {}",
                    written, item.expected_size
                );
                let _ = tokio::fs::remove_file(&item.local_abs).await;
            }
            Err(e) => {
                last_error = e.to_string();
                let _ = tokio::fs::remove_file(&item.local_abs).await;
            }
        }
        if attempt < RETRY_ATTEMPTS {
            tokio::select! {
                _ = tokio::time::sleep(backoff_delay(attempt)) => {}
                _ = cancel.cancelled() => return ItemOutcome::Cancelled,
            }
        }
    }

    warn!(path = %item.remote_symbolic, error = %last_error, "download failed after retries");
    writer.set(item.hash, FileStatus::Failed(last_error));
    ItemOutcome::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::path_hash;
    use crate::test_support::MockRemote;

    fn item_for(dir: &Path, symbolic: &str, size: u64) -> WorkItem {
        let rel = relative_part(symbolic).unwrap();
        WorkItem {
            hash: path_hash(symbolic),
            remote_symbolic: symbolic.to_string(),
            local_symbolic: symbolic.to_string(),
            local_abs: dir.join(rel),
            expected_size: size,
        }
    }

    fn writer_for(dir: &Path) -> (StateWriter, PathBuf) {
        let state = OperationState::new("sync", "mock", "Main", vec![]);
        let path = dir.join(state.file_name());
        (StateWriter::spawn(state, path.clone()), path)
    }

    #[tokio::test]
    async fn test_transient_fault_retried_to_success() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MockRemote::new();
        remote.insert_file("Artist/Album/One_instrumental.mp3", b"abcd");
        remote.fail_times("Artist/Album/One_instrumental.mp3", 2);

        let item = item_for(dir.path(), "Main/Artist/Album/One_instrumental.mp3", 4);
        let (writer, _) = writer_for(dir.path());
        let opts = SyncOptions::default();
        let (done, failed, cancelled) = execute(&remote, &[item], &writer, &opts).await;
        writer.finish().await.unwrap();

        assert_eq!((done, failed, cancelled), (1, 0, false));
        assert_eq!(remote.download_count(), 3);
        assert_eq!(
            std::fs::read(dir.path().join("Artist/Album/One_instrumental.mp3")).unwrap(),
            b"abcd"
        );
    }

    #[tokio::test]
    async fn test_permanent_fault_marks_failed_and_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MockRemote::new();
        remote.insert_file("Artist/Album/One_instrumental.mp3", b"abcd");
        remote.fail_always("Artist/Album/One_instrumental.mp3");

        let item = item_for(dir.path(), "Main/Artist/Album/One_instrumental.mp3", 4);
        let hash = item.hash;
        let (writer, state_path) = writer_for(dir.path());
        let opts = SyncOptions::default();
        let (done, failed, _) = execute(&remote, &[item], &writer, &opts).await;
        let final_state = writer.finish().await.unwrap();

        assert_eq!((done, failed), (0, 1));
        assert!(matches!(
            final_state.get(hash),
            Some(FileStatus::Failed(_))
        ));
        assert!(!dir.path().join("Artist/Album/One_instrumental.mp3").exists());
        assert!(state_path.exists());
    }

    #[tokio::test]
    async fn test_cancelled_items_stay_pending() {
        let dir = tempfile::tempdir().unwrap();
        let remote = MockRemote::new();
        remote.insert_file("Artist/Album/One_instrumental.mp3", b"abcd");

        let item = item_for(dir.path(), "Main/Artist/Album/One_instrumental.mp3", 4);
        let hash = item.hash;
        let mut state = OperationState::new("sync", "mock", "Main", vec![]);
        state.insert_pending(hash);
        let state_path = dir.path().join(state.file_name());
        let writer = StateWriter::spawn(state, state_path.clone());

        let opts = SyncOptions::default();
        opts.cancel.cancel();
        let (done, failed, cancelled) = execute(&remote, &[item], &writer, &opts).await;
        let final_state = writer.finish().await.unwrap();

        assert_eq!((done, failed, cancelled), (0, 0, true));
        assert_eq!(final_state.get(hash), Some(&FileStatus::Pending));
        assert_eq!(remote.download_count(), 0);
    }
}
