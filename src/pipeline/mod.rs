//! Bounded streaming pipeline: prefetch, user transform, upload.
//!
//! Prefetch workers pull filtered items out of the remote index and download
//! them into a work directory; a bounded queue in front of the user code
//! provides the backpressure that caps local disk usage at roughly
//! `queue_size` files. Results the user submits are uploaded by a second
//! worker pool, after which both local copies are deleted.
//!
//! `.pipeline_state.json` in the work directory records processed items and
//! uploads still in flight, so a restart resumes where the last run stopped.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fsio;
use crate::index::{DatasetIndex, IndexError};
use crate::locations::relative_part;
use crate::sync::plan::{select_remote_files, SyncFilters};
use crate::sync::SyncError;
use crate::transport::{backoff_delay, RemoteStore, TransportError, RETRY_ATTEMPTS};

pub const PIPELINE_STATE_FILE: &str = ".pipeline_state.json";

/// How long shutdown waits for each upload worker to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("filter error: {0}")]
    Sync(#[from] SyncError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("corrupt pipeline state {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },
    #[error("pipeline state encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("pipeline is shut down")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub work_dir: PathBuf,
    /// Download queue capacity; caps disk usage at about
    /// `queue_size × average_file_size`.
    pub queue_size: usize,
    pub prefetch_workers: usize,
    pub upload_workers: usize,
    pub cancel: CancellationToken,
}

impl PipelineOptions {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        PipelineOptions {
            work_dir: work_dir.into(),
            queue_size: 8,
            prefetch_workers: 4,
            upload_workers: 2,
            cancel: CancellationToken::new(),
        }
    }
}

/// One downloaded item handed to user code.
#[derive(Debug, Clone)]
pub struct PipelineItem {
    pub local_path: PathBuf,
    /// Server-relative path of the source file.
    pub remote_path: String,
    pub artist: String,
    pub base_name: String,
    pub component: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingUpload {
    remote_path: String,
    source_local: PathBuf,
    result_path: PathBuf,
    remote_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PipelineState {
    /// Wire paths fully handled (uploaded or skipped).
    processed: BTreeSet<String>,
    /// Results submitted but not yet uploaded.
    pending_uploads: Vec<PendingUpload>,
}

/// Pipeline state shared between user calls and upload workers; every
/// mutation is persisted before it is acted on.
struct SharedState {
    path: PathBuf,
    state: Mutex<PipelineState>,
}

impl SharedState {
    fn load(work_dir: &Path) -> Result<Self, PipelineError> {
        let path = work_dir.join(PIPELINE_STATE_FILE);
        let state = if path.exists() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes).map_err(|e| PipelineError::CorruptState {
                path: path.clone(),
                reason: e.to_string(),
            })?
        } else {
            PipelineState::default()
        };
        Ok(SharedState {
            path,
            state: Mutex::new(state),
        })
    }

    fn save_locked(&self, state: &PipelineState) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        fsio::write_atomic(&self.path, &bytes)?;
        Ok(())
    }

    fn snapshot(&self) -> PipelineState {
        self.state.lock().unwrap().clone()
    }

    fn mark_processed(&self, remote_path: &str) -> Result<(), PipelineError> {
        let mut state = self.state.lock().unwrap();
        state.processed.insert(remote_path.to_string());
        self.save_locked(&state)
    }

    fn add_pending(&self, job: &PendingUpload) -> Result<(), PipelineError> {
        let mut state = self.state.lock().unwrap();
        state.pending_uploads.push(job.clone());
        self.save_locked(&state)
    }

    /// An upload finished: drop the pending entry and mark its source done.
    fn complete_upload(&self, remote_path: &str) -> Result<(), PipelineError> {
        let mut state = self.state.lock().unwrap();
        state.pending_uploads.retain(|job| job.remote_path != remote_path);
        state.processed.insert(remote_path.to_string());
        self.save_locked(&state)
    }
}

#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub processed: u64,
    pub uploaded: u64,
    /// False when shutdown hit the drain timeout with uploads in flight.
    pub drained: bool,
}

/// The bounded producer/consumer pipeline handle.
pub struct DatasetPipeline {
    download_rx: mpsc::Receiver<PipelineItem>,
    upload_tx: Option<mpsc::UnboundedSender<PendingUpload>>,
    prefetch_handles: Vec<JoinHandle<()>>,
    upload_handles: Vec<JoinHandle<()>>,
    state: Arc<SharedState>,
    planned: BTreeSet<String>,
    uploaded: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl DatasetPipeline {
    /// Fetch the remote index, apply the filters, and spin up the worker
    /// pools. Items already processed by an earlier run are skipped; uploads
    /// that were pending are re-queued first.
    pub async fn start(
        remote: Arc<dyn RemoteStore>,
        filters: &SyncFilters,
        opts: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        std::fs::create_dir_all(&opts.work_dir)?;
        let state = Arc::new(SharedState::load(&opts.work_dir)?);

        let remote_index = DatasetIndex::from_bytes(&remote.fetch_index().await?)?;
        let files = select_remote_files(
            &remote_index,
            filters.components.as_deref(),
            filters,
            None,
        )?;

        let snapshot = state.snapshot();
        let mut planned = BTreeSet::new();
        let mut queue = VecDeque::new();
        for file in files {
            let wire = match relative_part(&file.symbolic) {
                Ok(wire) => wire.to_string(),
                Err(e) => {
                    warn!(path = %file.symbolic, error = %e, "skipping unaddressable remote file");
                    continue;
                }
            };
            planned.insert(wire.clone());
            if snapshot.processed.contains(&wire) {
                continue;
            }
            if snapshot
                .pending_uploads
                .iter()
                .any(|job| job.remote_path == wire)
            {
                continue;
            }
            queue.push_back((wire, file));
        }
        info!(
            planned = planned.len(),
            queued = queue.len(),
            resumed_uploads = snapshot.pending_uploads.len(),
            "pipeline started"
        );

        let queue = Arc::new(Mutex::new(queue));
        let (download_tx, download_rx) = mpsc::channel(opts.queue_size.max(1));
        let (upload_tx, upload_rx) = mpsc::unbounded_channel();
        let upload_rx = Arc::new(tokio::sync::Mutex::new(upload_rx));
        let uploaded = Arc::new(AtomicU64::new(0));

        for job in snapshot.pending_uploads {
            let _ = upload_tx.send(job);
        }

        let mut prefetch_handles = Vec::new();
        for _ in 0..opts.prefetch_workers.max(1) {
            prefetch_handles.push(tokio::spawn(prefetch_worker(
                remote.clone(),
                queue.clone(),
                opts.work_dir.clone(),
                download_tx.clone(),
                opts.cancel.clone(),
            )));
        }
        drop(download_tx);

        let mut upload_handles = Vec::new();
        for _ in 0..opts.upload_workers.max(1) {
            upload_handles.push(tokio::spawn(upload_worker(
                remote.clone(),
                upload_rx.clone(),
                state.clone(),
                uploaded.clone(),
            )));
        }

        Ok(DatasetPipeline {
            download_rx,
            upload_tx: Some(upload_tx),
            prefetch_handles,
            upload_handles,
            state,
            planned,
            uploaded,
            cancel: opts.cancel,
        })
    }

    /// Block until `count` items are ready. Fewer (possibly zero) items come
    /// back only when the stream is exhausted.
    pub async fn take(&mut self, count: usize) -> Vec<PipelineItem> {
        let mut items = Vec::with_capacity(count);
        while items.len() < count {
            match self.download_rx.recv().await {
                Some(item) => items.push(item),
                None => break,
            }
        }
        items
    }

    /// Queue a result for upload next to the source file on the remote. The
    /// enqueue never blocks; the upload queue is unbounded.
    pub fn submit_result(
        &self,
        item: PipelineItem,
        result_path: impl Into<PathBuf>,
        remote_name: &str,
    ) -> Result<(), PipelineError> {
        let job = PendingUpload {
            remote_path: item.remote_path,
            source_local: item.local_path,
            result_path: result_path.into(),
            remote_name: remote_name.to_string(),
        };
        self.state.add_pending(&job)?;
        self.upload_tx
            .as_ref()
            .ok_or(PipelineError::Closed)?
            .send(job)
            .map_err(|_| PipelineError::Closed)
    }

    /// Drop an item without producing a result: delete the local copy and
    /// mark it processed.
    pub async fn skip(&self, item: PipelineItem) -> Result<(), PipelineError> {
        let _ = tokio::fs::remove_file(&item.local_path).await;
        self.state.mark_processed(&item.remote_path)
    }

    /// Stop accepting downloads, drain in-flight uploads (bounded by a
    /// per-worker timeout), persist state, and report. The state file is
    /// removed only when every planned item was handled.
    pub async fn shutdown(mut self) -> Result<PipelineOutcome, PipelineError> {
        self.cancel.cancel();
        self.download_rx.close();
        for handle in self.prefetch_handles.drain(..) {
            let _ = handle.await;
        }

        drop(self.upload_tx.take());
        let mut drained = true;
        for handle in self.upload_handles.drain(..) {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("upload worker did not drain within the timeout");
                    drained = false;
                }
            }
        }

        let snapshot = self.state.snapshot();
        let complete = drained
            && snapshot.pending_uploads.is_empty()
            && self
                .planned
                .iter()
                .all(|wire| snapshot.processed.contains(wire));
        if complete {
            match std::fs::remove_file(&self.state.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            info!("pipeline drained; state file removed");
        } else {
            info!(
                pending_uploads = snapshot.pending_uploads.len(),
                "pipeline stopped with work remaining; state file kept"
            );
        }

        Ok(PipelineOutcome {
            processed: snapshot.processed.len() as u64,
            uploaded: self.uploaded.load(Ordering::Relaxed),
            drained,
        })
    }
}

/// Pull work items off the shared queue, download each with retry, and push
/// completed items onto the bounded channel (blocking there is the
/// backpressure).
async fn prefetch_worker(
    remote: Arc<dyn RemoteStore>,
    queue: Arc<Mutex<VecDeque<(String, crate::sync::plan::RemoteFile)>>>,
    work_dir: PathBuf,
    download_tx: mpsc::Sender<PipelineItem>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let next = queue.lock().unwrap().pop_front();
        let Some((wire, file)) = next else { break };

        let local = work_dir.join(&wire);
        if let Some(parent) = local.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(path = %wire, error = %e, "prefetch: cannot create parent");
                continue;
            }
        }

        match download_with_retry(remote.as_ref(), &wire, &local, file.size, &cancel).await {
            Ok(()) => {
                let item = PipelineItem {
                    local_path: local,
                    remote_path: wire,
                    artist: file.artist,
                    base_name: file.base_name,
                    component: file.component,
                    size: file.size,
                };
                if download_tx.send(item).await.is_err() {
                    // Consumer gone; stop producing
                    break;
                }
            }
            Err(Cancelled) => break,
            Err(Failed(error)) => {
                // Not marked processed: a restart retries it
                warn!(path = %wire, error = %error, "prefetch failed; item left for a later run");
            }
        }
    }
}

enum DownloadFailure {
    Cancelled,
    Failed(String),
}
use DownloadFailure::{Cancelled, Failed};

async fn download_with_retry(
    remote: &dyn RemoteStore,
    wire: &str,
    local: &Path,
    expected_size: u64,
    cancel: &CancellationToken,
) -> Result<(), DownloadFailure> {
    let mut last_error = String::new();
    for attempt in 1..=RETRY_ATTEMPTS {
        match remote.download(wire, local).await {
            Ok(written) if written == expected_size => {
                debug!(path = %wire, written, "prefetched");
                return Ok(());
            }
            Ok(written) => {
                last_error = format!("size mismatch: got {} bytes, want {}", written, expected_size);
                let _ = tokio::fs::remove_file(local).await;
            }
            Err(e) => {
                last_error = e.to_string();
                let _ = tokio::fs::remove_file(local).await;
            }
        }
        if attempt < RETRY_ATTEMPTS {
            tokio::select! {
                _ = tokio::time::sleep(backoff_delay(attempt)) => {}
                _ = cancel.cancelled() => return Err(Cancelled),
            }
        }
    }
    Err(Failed(last_error))
}

/// Upload submitted results, then delete both local files and mark the
/// source processed. A failed upload stays in `pending_uploads` for the next
/// run.
async fn upload_worker(
    remote: Arc<dyn RemoteStore>,
    jobs: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PendingUpload>>>,
    state: Arc<SharedState>,
    uploaded: Arc<AtomicU64>,
) {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else { break };

        let remote_target = match job.remote_path.rsplit_once('/') {
            Some((dir, _)) => format!("{}/{}", dir, job.remote_name),
            None => job.remote_name.clone(),
        };

        let mut last_error = String::new();
        let mut ok = false;
        for attempt in 1..=RETRY_ATTEMPTS {
            match remote.upload(&job.result_path, &remote_target).await {
                Ok(()) => {
                    ok = true;
                    break;
                }
                Err(e) => last_error = e.to_string(),
            }
            if attempt < RETRY_ATTEMPTS {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }

        if ok {
            let _ = tokio::fs::remove_file(&job.source_local).await;
            let _ = tokio::fs::remove_file(&job.result_path).await;
            if let Err(e) = state.complete_upload(&job.remote_path) {
                warn!(path = %job.remote_path, error = %e, "failed to persist upload completion");
            }
            uploaded.fetch_add(1, Ordering::Relaxed);
            debug!(path = %remote_target, "result uploaded");
        } else {
            warn!(path = %remote_target, error = %last_error, "upload failed; left pending");
        }
    }
}
