//! The dataset owner: composes the location registry, schema, and index and
//! exposes the engine API the CLI surface is built on. None of the parts
//! reach back up; mutation flows one way through this type.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::index::builder::IndexBuilder;
use crate::index::{DatasetIndex, IndexError, LocationStats, Track};
use crate::locations::{LocationError, LocationRegistry};
use crate::mover::{MoveOutcome, Mover, MoverError};
use crate::pipeline::{DatasetPipeline, PipelineError, PipelineOptions};
use crate::schema::{DatasetSchema, SchemaError};
use crate::sync::state::{OperationState, StateError};
use crate::sync::{SyncError, SyncFilters, SyncOptions, SyncOutcome, Synchronizer};
use crate::transport::RemoteStore;
use crate::{INDEX_FILE, META_DIR, SCHEMA_FILE};

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("location error: {0}")]
    Location(#[from] LocationError),
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("mover error: {0}")]
    Mover(#[from] MoverError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("resuming a sync operation requires the remote")]
    RemoteRequired,
    #[error("unknown operation type {0:?} in state file")]
    UnknownOperation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Constraints for `find_tracks`.
#[derive(Debug, Clone, Default)]
pub struct TrackQuery {
    /// Components the track must have.
    pub has: Vec<String>,
    /// Components the track must lack.
    pub missing: Vec<String>,
    pub artist: Option<String>,
    /// Album directory name.
    pub album: Option<String>,
}

/// What a `resume` ended up re-running.
#[derive(Debug)]
pub enum ResumeOutcome {
    Sync(SyncOutcome),
    Move(MoveOutcome),
}

impl ResumeOutcome {
    pub fn fully_done(&self) -> bool {
        match self {
            ResumeOutcome::Sync(outcome) => outcome.fully_done(),
            ResumeOutcome::Move(outcome) => outcome.fully_done(),
        }
    }
}

/// A dataset rooted at one primary directory, possibly spanning further
/// locations on other disks.
pub struct Dataset {
    root: PathBuf,
    registry: LocationRegistry,
    schema: DatasetSchema,
    index: DatasetIndex,
}

impl Dataset {
    /// Open (or initialize) the dataset under `root`. Creates `.blackbird/`
    /// and materializes the `Main` location on first use; a persisted index
    /// is loaded when present.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, DatasetError> {
        let root = root.into();
        std::fs::create_dir_all(root.join(META_DIR))?;

        let registry = LocationRegistry::load(&root)?;
        registry.save()?;

        let schema_path = root.join(META_DIR).join(SCHEMA_FILE);
        let schema = if schema_path.exists() {
            DatasetSchema::load(&schema_path)?
        } else {
            DatasetSchema::new()
        };

        let index_path = root.join(META_DIR).join(INDEX_FILE);
        let index = if index_path.exists() {
            DatasetIndex::load(&index_path)?
        } else {
            DatasetIndex::new()
        };

        Ok(Dataset {
            root,
            registry,
            schema,
            index,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &LocationRegistry {
        &self.registry
    }

    pub fn schema(&self) -> &DatasetSchema {
        &self.schema
    }

    pub fn index(&self) -> &DatasetIndex {
        &self.index
    }

    fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    fn schema_path(&self) -> PathBuf {
        self.meta_dir().join(SCHEMA_FILE)
    }

    fn index_path(&self) -> PathBuf {
        self.meta_dir().join(INDEX_FILE)
    }

    /// Walk every location, rebuild the index, and persist it.
    pub fn reindex(&mut self) -> Result<&DatasetIndex, DatasetError> {
        let built = IndexBuilder::new(&self.registry, &self.schema).build()?;
        built.save(&self.index_path())?;
        info!(
            tracks = built.tracks.len(),
            files = built.total_files,
            "reindexed"
        );
        self.index = built;
        Ok(&self.index)
    }

    pub fn stats_by_location(&self) -> &BTreeMap<String, LocationStats> {
        &self.index.stats_by_location
    }

    /// Tracks missing a component, for `stats --missing`.
    pub fn tracks_missing(&self, component: &str) -> Vec<&Track> {
        self.index.tracks_missing(component)
    }

    /// Tracks satisfying every constraint of the query.
    pub fn find_tracks(&self, query: &TrackQuery) -> Vec<&Track> {
        self.index
            .tracks
            .values()
            .filter(|track| query.has.iter().all(|c| track.has_component(c)))
            .filter(|track| query.missing.iter().all(|c| !track.has_component(c)))
            .filter(|track| {
                query
                    .artist
                    .as_deref()
                    .map(|a| track.artist == a)
                    .unwrap_or(true)
            })
            .filter(|track| {
                query
                    .album
                    .as_deref()
                    .map(|a| track.album_name() == a)
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Add a schema component and persist the schema.
    pub fn add_component(
        &mut self,
        name: &str,
        pattern: &str,
        multiple: bool,
        description: Option<String>,
    ) -> Result<(), DatasetError> {
        self.schema
            .add_component(name, pattern, multiple, description)?;
        self.schema.save(&self.schema_path())?;
        Ok(())
    }

    /// Replace the schema with one discovered from the files on disk across
    /// every location.
    pub fn discover_schema(
        &mut self,
        sample_artists: Option<usize>,
    ) -> Result<&DatasetSchema, DatasetError> {
        let mut merged = DatasetSchema::new();
        for (_, root) in self.registry.iter() {
            let discovered = DatasetSchema::discover(root, sample_artists)?;
            merged.merge_remote(&discovered, None)?;
        }
        merged.save(&self.schema_path())?;
        self.schema = merged;
        Ok(&self.schema)
    }

    pub fn add_location(&mut self, name: &str, path: &Path) -> Result<(), DatasetError> {
        self.registry.add(name, path)?;
        self.registry.save()?;
        Ok(())
    }

    /// Remove a location. Refused while the index still references it,
    /// unless forced.
    pub fn remove_location(&mut self, name: &str, force: bool) -> Result<(), DatasetError> {
        if !force && self.index.references_location(name) {
            return Err(LocationError::LocationInUse(name.to_string()).into());
        }
        self.registry.remove(name)?;
        self.registry.save()?;
        Ok(())
    }

    /// Pull a remote dataset into this one. On full success the local index
    /// is rebuilt.
    pub async fn sync_from(
        &mut self,
        remote: Arc<dyn RemoteStore>,
        source: &str,
        filters: &SyncFilters,
        opts: &SyncOptions,
    ) -> Result<SyncOutcome, DatasetError> {
        let meta_dir = self.meta_dir();
        let outcome = {
            let synchronizer = Synchronizer {
                remote,
                source: source.to_string(),
                registry: &self.registry,
                meta_dir,
            };
            synchronizer
                .sync(&mut self.schema, Some(&self.index), filters, opts)
                .await?
        };
        if outcome.fully_done() {
            self.reindex()?;
        }
        Ok(outcome)
    }

    /// A clone is a sync into a freshly-opened destination; the semantics
    /// are identical once the destination dataset exists.
    pub async fn clone_from(
        &mut self,
        remote: Arc<dyn RemoteStore>,
        source: &str,
        filters: &SyncFilters,
        opts: &SyncOptions,
    ) -> Result<SyncOutcome, DatasetError> {
        self.sync_from(remote, source, filters, opts).await
    }

    /// Re-run an interrupted operation from its state file. Sync resumes
    /// need the remote; move resumes work from the local index alone.
    pub async fn resume(
        &mut self,
        state_file: &Path,
        remote: Option<Arc<dyn RemoteStore>>,
        opts: &SyncOptions,
    ) -> Result<ResumeOutcome, DatasetError> {
        let state = OperationState::load(state_file)?;
        match state.operation_type.as_str() {
            "sync" => {
                let remote = remote.ok_or(DatasetError::RemoteRequired)?;
                let meta_dir = self.meta_dir();
                let outcome = {
                    let synchronizer = Synchronizer {
                        remote,
                        source: state.source.clone(),
                        registry: &self.registry,
                        meta_dir,
                    };
                    synchronizer.resume(state_file, opts).await?
                };
                if outcome.fully_done() {
                    self.reindex()?;
                }
                Ok(ResumeOutcome::Sync(outcome))
            }
            "move" => {
                let outcome = {
                    let mover = Mover {
                        registry: &self.registry,
                        index: &self.index,
                        meta_dir: self.meta_dir(),
                        cancel: opts.cancel.clone(),
                    };
                    mover.resume(state_file).await?
                };
                if outcome.fully_done() {
                    self.reindex()?;
                }
                Ok(ResumeOutcome::Move(outcome))
            }
            other => Err(DatasetError::UnknownOperation(other.to_string())),
        }
    }

    /// Move explicit folders between locations, then re-index.
    pub async fn move_folders(
        &mut self,
        source: &str,
        target: &str,
        folders: &[String],
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<MoveOutcome, DatasetError> {
        let outcome = {
            let mover = Mover {
                registry: &self.registry,
                index: &self.index,
                meta_dir: self.meta_dir(),
                cancel,
            };
            mover.move_folders(source, target, folders).await?
        };
        if outcome.fully_done() {
            self.reindex()?;
        }
        Ok(outcome)
    }

    /// Move whole albums until `gigabytes` have moved, then re-index.
    pub async fn balance(
        &mut self,
        source: &str,
        target: &str,
        gigabytes: f64,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<MoveOutcome, DatasetError> {
        let outcome = {
            let mover = Mover {
                registry: &self.registry,
                index: &self.index,
                meta_dir: self.meta_dir(),
                cancel,
            };
            mover.balance(source, target, gigabytes).await?
        };
        if outcome.fully_done() {
            self.reindex()?;
        }
        Ok(outcome)
    }

    /// Start a streaming pipeline over the remote. The pipeline operates on
    /// its own work directory and does not touch this dataset's locations.
    pub async fn pipeline(
        &self,
        remote: Arc<dyn RemoteStore>,
        filters: &SyncFilters,
        opts: PipelineOptions,
    ) -> Result<DatasetPipeline, DatasetError> {
        Ok(DatasetPipeline::start(remote, filters, opts).await?)
    }
}
