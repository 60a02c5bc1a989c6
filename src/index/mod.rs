//! The persistent catalog of tracks and component files.
//!
//! Everything is keyed by symbolic path, so the index is portable across
//! machines as long as `locations.json` maps the names. On disk the index is
//! a small header (magic + format version) followed by a bincode body;
//! loading is a single read plus deserialize.

pub mod builder;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

use crate::fsio;
use crate::schema::SchemaError;

pub const INDEX_FORMAT_VERSION: u32 = 1;
const INDEX_MAGIC: &[u8; 4] = b"BBIX";

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index encoding error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("not a blackbird index file")]
    BadMagic,
    #[error("unsupported index format version {0}")]
    UnsupportedVersion(u32),
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("location error: {0}")]
    Location(#[from] crate::locations::LocationError),
    #[error("non UTF-8 path under {0}")]
    NonUtf8Path(PathBuf),
}

/// Stable 64-bit digest of a symbolic path.
///
/// The same algorithm runs on both ends of a sync, so operation state files
/// and `file_info_by_hash` survive across processes and machines. Pinned to
/// XXH3 over the UTF-8 bytes.
pub fn path_hash(symbolic_path: &str) -> u64 {
    xxh3_64(symbolic_path.as_bytes())
}

/// Per-location aggregates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocationStats {
    pub files: u64,
    pub size: u64,
    pub tracks: u64,
    pub albums: u64,
    pub artists: u64,
}

/// One logical track: a bag of component files under
/// `Location/Artist/Album[/CD]/BaseName`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Track {
    pub artist: String,
    /// Symbolic album path, without any CD or track segment.
    pub album_path: String,
    pub cd_number: Option<u32>,
    pub base_name: String,
    /// Component name → symbolic file paths. A `multiple: false` component
    /// holds exactly one entry.
    pub files: BTreeMap<String, Vec<String>>,
    /// Symbolic file path → size in bytes.
    pub file_sizes: BTreeMap<String, u64>,
}

impl Track {
    pub fn new(artist: &str, album_path: &str, cd_number: Option<u32>, base_name: &str) -> Self {
        Track {
            artist: artist.to_string(),
            album_path: album_path.to_string(),
            cd_number,
            base_name: base_name.to_string(),
            files: BTreeMap::new(),
            file_sizes: BTreeMap::new(),
        }
    }

    /// The symbolic track path this track is keyed by.
    pub fn track_path(&self) -> String {
        match self.cd_number {
            Some(cd) => format!("{}/CD{}/{}", self.album_path, cd, self.base_name),
            None => format!("{}/{}", self.album_path, self.base_name),
        }
    }

    pub fn has_component(&self, component: &str) -> bool {
        self.files
            .get(component)
            .map(|paths| !paths.is_empty())
            .unwrap_or(false)
    }

    pub fn total_size(&self) -> u64 {
        self.file_sizes.values().sum()
    }

    /// The album directory name, without artist or location.
    pub fn album_name(&self) -> &str {
        self.album_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.album_path)
    }
}

/// In-memory catalog of the whole dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetIndex {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    /// Symbolic track path → track.
    pub tracks: BTreeMap<String, Track>,
    /// Symbolic album path → symbolic track paths.
    pub track_by_album: BTreeMap<String, BTreeSet<String>>,
    /// Artist name → symbolic album paths.
    pub album_by_artist: BTreeMap<String, BTreeSet<String>>,
    pub total_size: u64,
    pub total_files: u64,
    pub stats_by_location: BTreeMap<String, LocationStats>,
    /// `path_hash(symbolic_file_path)` → (symbolic_file_path, size).
    pub file_info_by_hash: HashMap<u64, (String, u64)>,
}

impl Default for DatasetIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasetIndex {
    pub fn new() -> Self {
        DatasetIndex {
            version: INDEX_FORMAT_VERSION,
            last_updated: Utc::now(),
            tracks: BTreeMap::new(),
            track_by_album: BTreeMap::new(),
            album_by_artist: BTreeMap::new(),
            total_size: 0,
            total_files: 0,
            stats_by_location: BTreeMap::new(),
            file_info_by_hash: HashMap::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, IndexError> {
        let body = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(8 + body.len());
        out.extend_from_slice(INDEX_MAGIC);
        out.extend_from_slice(&INDEX_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        if bytes.len() < 8 || &bytes[..4] != INDEX_MAGIC {
            return Err(IndexError::BadMagic);
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != INDEX_FORMAT_VERSION {
            return Err(IndexError::UnsupportedVersion(version));
        }
        Ok(bincode::deserialize(&bytes[8..])?)
    }

    pub fn load(path: &Path) -> Result<Self, IndexError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        fsio::write_atomic(path, &self.to_bytes()?)?;
        Ok(())
    }

    /// Artist names matching `query`. Exact matches win, then substring
    /// matches; with `fuzzy` an edit-distance ranking kicks in only when
    /// neither produced anything.
    pub fn search_by_artist(
        &self,
        query: &str,
        case_sensitive: bool,
        fuzzy: bool,
    ) -> Vec<String> {
        let fold = |s: &str| {
            if case_sensitive {
                s.to_string()
            } else {
                s.to_lowercase()
            }
        };
        let needle = fold(query);

        let mut exact = Vec::new();
        let mut substring = Vec::new();
        for artist in self.album_by_artist.keys() {
            let folded = fold(artist);
            if folded == needle {
                exact.push(artist.clone());
            } else if folded.contains(&needle) {
                substring.push(artist.clone());
            }
        }
        if !exact.is_empty() || !substring.is_empty() {
            exact.extend(substring);
            return exact;
        }
        if !fuzzy {
            return Vec::new();
        }

        let mut ranked: Vec<(f64, String)> = self
            .album_by_artist
            .keys()
            .map(|artist| {
                (
                    strsim::jaro_winkler(&needle, &fold(artist)),
                    artist.clone(),
                )
            })
            .filter(|(score, _)| *score >= 0.75)
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        ranked.into_iter().take(5).map(|(_, artist)| artist).collect()
    }

    /// Symbolic album paths whose album name matches `query`, optionally
    /// restricted to one artist.
    pub fn search_by_album(&self, query: &str, artist: Option<&str>) -> Vec<String> {
        let needle = query.to_lowercase();
        let mut out = Vec::new();
        for (name, albums) in &self.album_by_artist {
            if let Some(filter) = artist {
                if name != filter {
                    continue;
                }
            }
            for album in albums {
                let album_name = album.rsplit('/').next().unwrap_or(album);
                if album_name.to_lowercase().contains(&needle) {
                    out.push(album.clone());
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Tracks whose base name matches `query`, with optional artist and
    /// album-name constraints.
    pub fn search_by_track(
        &self,
        query: &str,
        artist: Option<&str>,
        album: Option<&str>,
    ) -> Vec<&Track> {
        let needle = query.to_lowercase();
        self.tracks
            .values()
            .filter(|track| track.base_name.to_lowercase().contains(&needle))
            .filter(|track| artist.map(|a| track.artist == a).unwrap_or(true))
            .filter(|track| {
                album
                    .map(|a| track.album_name().to_lowercase().contains(&a.to_lowercase()))
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Tracks whose local view lacks the given component.
    pub fn tracks_missing(&self, component: &str) -> Vec<&Track> {
        self.tracks
            .values()
            .filter(|track| !track.has_component(component))
            .collect()
    }

    /// True when some location's stats reference files under `location`.
    pub fn references_location(&self, location: &str) -> bool {
        self.stats_by_location
            .get(location)
            .map(|stats| stats.files > 0)
            .unwrap_or(false)
    }
}
