//! Work-plan construction: filter the remote index down to the files a run
//! must fetch and map each onto the local target location.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::debug;

use super::SyncError;
use crate::index::{path_hash, DatasetIndex};
use crate::locations::{swap_location, LocationRegistry};

/// User-facing selection of what to pull.
#[derive(Debug, Clone, Default)]
pub struct SyncFilters {
    /// Component names, or `None` for every component.
    pub components: Option<Vec<String>>,
    /// Glob expressions over artist names.
    pub artists: Option<Vec<String>>,
    /// Glob expressions over album names.
    pub albums: Option<Vec<String>>,
    /// Restrict to tracks whose local view lacks this component.
    pub missing_component: Option<String>,
    /// Deterministic slice of the sorted artist list, `(0, 1]`.
    pub proportion: Option<f64>,
    /// Slice start as a fraction of the artist list, `[0, 1)`.
    pub offset: f64,
}

impl SyncFilters {
    pub fn validate(&self) -> Result<(), SyncError> {
        if let Some(p) = self.proportion {
            if !(p > 0.0 && p <= 1.0) {
                return Err(SyncError::Filter(format!(
                    "proportion must be in (0, 1], got {}",
                    p
                )));
            }
        }
        if !(0.0..1.0).contains(&self.offset) {
            return Err(SyncError::Filter(format!(
                "offset must be in [0, 1), got {}",
                self.offset
            )));
        }
        Ok(())
    }
}

/// One remote file selected by the filters, with enough track context for
/// downstream consumers.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    /// Symbolic path as the remote index spells it.
    pub symbolic: String,
    pub size: u64,
    pub component: String,
    pub artist: String,
    pub album_path: String,
    pub base_name: String,
}

/// One unit of download work.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub remote_symbolic: String,
    pub local_symbolic: String,
    pub local_abs: PathBuf,
    pub expected_size: u64,
    /// `path_hash(remote_symbolic)` — the state-file key.
    pub hash: u64,
}

/// An executable plan: the items to fetch plus what was pre-skipped.
#[derive(Debug)]
pub struct SyncPlan {
    pub items: Vec<WorkItem>,
    pub preskipped: u64,
}

fn glob_set(expressions: &[String]) -> Result<GlobSet, SyncError> {
    let mut builder = GlobSetBuilder::new();
    for expr in expressions {
        builder.add(
            Glob::new(expr).map_err(|e| SyncError::Filter(format!("bad glob {:?}: {}", expr, e)))?,
        );
    }
    builder
        .build()
        .map_err(|e| SyncError::Filter(e.to_string()))
}

/// Artists surviving the artist globs and the proportion slice, in
/// lexicographic order.
pub(crate) fn selected_artists(
    remote: &DatasetIndex,
    filters: &SyncFilters,
) -> Result<BTreeSet<String>, SyncError> {
    let mut artists: Vec<&String> = remote.album_by_artist.keys().collect();

    if let Some(expressions) = &filters.artists {
        let set = glob_set(expressions)?;
        artists.retain(|artist| set.is_match(artist.as_str()));
    }

    if let Some(proportion) = filters.proportion {
        let n = artists.len();
        let start = ((filters.offset * n as f64).floor() as usize).min(n);
        let count = (proportion * n as f64).ceil() as usize;
        let end = (start + count).min(n);
        artists = artists[start..end].to_vec();
    }

    Ok(artists.into_iter().cloned().collect())
}

/// Walk the remote index and collect every file the filters select.
///
/// `local_view` carries the local index and target location for the
/// `missing_component` filter, which looks at what the local dataset would
/// hold for each remote track.
pub(crate) fn select_remote_files(
    remote: &DatasetIndex,
    components: Option<&[String]>,
    filters: &SyncFilters,
    local_view: Option<(&DatasetIndex, &str)>,
) -> Result<Vec<RemoteFile>, SyncError> {
    filters.validate()?;
    let artists = selected_artists(remote, filters)?;
    let album_globs = filters.albums.as_deref().map(glob_set).transpose()?;

    let mut out = Vec::new();
    for (track_path, track) in &remote.tracks {
        if !artists.contains(&track.artist) {
            continue;
        }
        if let Some(globs) = &album_globs {
            if !globs.is_match(track.album_name()) {
                continue;
            }
        }
        if let Some(missing) = &filters.missing_component {
            if let Some((local, target)) = local_view {
                let local_track_path = swap_location(track_path, target)?;
                if let Some(local_track) = local.tracks.get(&local_track_path) {
                    if local_track.has_component(missing) {
                        continue;
                    }
                }
            }
        }

        for (component, paths) in &track.files {
            if let Some(wanted) = components {
                if !wanted.iter().any(|name| name == component) {
                    continue;
                }
            }
            for path in paths {
                let size = match track.file_sizes.get(path) {
                    Some(size) => *size,
                    None => {
                        debug!(%path, "remote index misses a size entry; treating as 0");
                        0
                    }
                };
                out.push(RemoteFile {
                    symbolic: path.clone(),
                    size,
                    component: component.clone(),
                    artist: track.artist.clone(),
                    album_path: track.album_path.clone(),
                    base_name: track.base_name.clone(),
                });
            }
        }
    }

    out.sort_by(|a, b| a.symbolic.cmp(&b.symbolic));
    Ok(out)
}

/// Map selected remote files onto the local target location, pre-skipping
/// files already present with the right size. Identity is `(path, size)` —
/// no content hashing.
pub(crate) fn build_plan(
    remote: &DatasetIndex,
    registry: &LocationRegistry,
    components: Option<&[String]>,
    filters: &SyncFilters,
    local_view: Option<(&DatasetIndex, &str)>,
    target_location: &str,
    force: bool,
) -> Result<SyncPlan, SyncError> {
    let files = select_remote_files(remote, components, filters, local_view)?;

    let mut items = Vec::new();
    let mut preskipped = 0u64;
    for file in files {
        let local_symbolic = swap_location(&file.symbolic, target_location)?;
        let local_abs = registry.resolve(&local_symbolic)?;

        if !force {
            if let Ok(metadata) = std::fs::metadata(&local_abs) {
                if metadata.len() == file.size {
                    preskipped += 1;
                    continue;
                }
            }
        }

        items.push(WorkItem {
            hash: path_hash(&file.symbolic),
            remote_symbolic: file.symbolic,
            local_symbolic,
            local_abs,
            expected_size: file.size,
        });
    }

    debug!(
        planned = items.len(),
        preskipped, target_location, "sync plan built"
    );
    Ok(SyncPlan { items, preskipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Track;

    fn remote_with_artists(artists: &[&str]) -> DatasetIndex {
        let mut index = DatasetIndex::new();
        for artist in artists {
            let album_path = format!("Main/{}/Album", artist);
            let mut track = Track::new(artist, &album_path, None, "One");
            let file = format!("{}/One_instrumental.mp3", album_path);
            track
                .files
                .insert("instrumental".to_string(), vec![file.clone()]);
            track.file_sizes.insert(file, 4);
            index
                .album_by_artist
                .entry(artist.to_string())
                .or_default()
                .insert(album_path.clone());
            index
                .track_by_album
                .entry(album_path)
                .or_default()
                .insert(track.track_path());
            index.tracks.insert(track.track_path(), track);
        }
        index
    }

    #[test]
    fn test_proportion_full_and_rejected() {
        let remote = remote_with_artists(&["A", "B", "C", "D"]);
        let full = SyncFilters {
            proportion: Some(1.0),
            offset: 0.0,
            ..Default::default()
        };
        assert_eq!(selected_artists(&remote, &full).unwrap().len(), 4);

        let zero = SyncFilters {
            proportion: Some(0.0),
            ..Default::default()
        };
        assert!(matches!(zero.validate(), Err(SyncError::Filter(_))));

        let bad_offset = SyncFilters {
            offset: 1.0,
            ..Default::default()
        };
        assert!(matches!(bad_offset.validate(), Err(SyncError::Filter(_))));
    }

    #[test]
    fn test_proportion_slice_is_deterministic() {
        let remote = remote_with_artists(&["A", "B", "C", "D"]);
        let filters = SyncFilters {
            proportion: Some(0.5),
            offset: 0.5,
            ..Default::default()
        };
        let selected = selected_artists(&remote, &filters).unwrap();
        assert_eq!(
            selected.into_iter().collect::<Vec<_>>(),
            vec!["C".to_string(), "D".to_string()]
        );
    }

    #[test]
    fn test_artist_globs() {
        let remote = remote_with_artists(&["Artist_A", "Artist_B", "Other"]);
        let filters = SyncFilters {
            artists: Some(vec!["Artist_*".to_string()]),
            ..Default::default()
        };
        let files = select_remote_files(&remote, None, &filters, None).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.artist.starts_with("Artist_")));
    }

    #[test]
    fn test_component_filter() {
        let remote = remote_with_artists(&["A"]);
        let wanted = vec!["vocals".to_string()];
        let files =
            select_remote_files(&remote, Some(&wanted), &SyncFilters::default(), None).unwrap();
        assert!(files.is_empty());
    }
}
