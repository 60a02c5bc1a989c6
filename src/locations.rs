//! Named storage locations and symbolic path resolution.
//!
//! A dataset may span several disks. Each physical root is registered under a
//! short name, and everything else in the engine (index, state files, wire
//! paths) refers to files by *symbolic path*: `LocationName/relative/path`.
//! Keeping physical roots out of the persisted index means a relocated disk
//! only requires updating `locations.json`, not a re-index.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::fsio;
use crate::{LOCATIONS_FILE, META_DIR};

/// The location every dataset starts with.
pub const MAIN_LOCATION: &str = "Main";

#[derive(Error, Debug)]
pub enum LocationError {
    #[error("location already exists: {0}")]
    LocationExists(String),
    #[error("not an existing directory: {0}")]
    PathInvalid(PathBuf),
    #[error("unknown location: {0}")]
    UnknownLocation(String),
    #[error("malformed symbolic path: {0:?}")]
    MalformedSymbolic(String),
    #[error("location {0} is still referenced by the index")]
    LocationInUse(String),
    #[error("cannot remove the last remaining location")]
    LastLocation,
    #[error("invalid location name: {0:?}")]
    InvalidName(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("locations file error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted mapping of location name to absolute root directory.
#[derive(Debug, Clone)]
pub struct LocationRegistry {
    primary_root: PathBuf,
    locations: BTreeMap<String, PathBuf>,
}

impl LocationRegistry {
    /// Load the registry persisted under `primary_root`. A missing
    /// `locations.json` synthesizes `{Main: primary_root}`.
    pub fn load(primary_root: &Path) -> Result<Self, LocationError> {
        let file = primary_root.join(META_DIR).join(LOCATIONS_FILE);
        let mut locations = BTreeMap::new();

        if file.exists() {
            let bytes = std::fs::read(&file)?;
            let raw: Map<String, Value> = serde_json::from_slice(&bytes)?;
            for (name, value) in raw {
                let path = value
                    .as_str()
                    .ok_or_else(|| LocationError::InvalidName(name.clone()))?;
                locations.insert(name, PathBuf::from(path));
            }
        }

        if locations.is_empty() {
            locations.insert(MAIN_LOCATION.to_string(), primary_root.to_path_buf());
        }

        Ok(LocationRegistry {
            primary_root: primary_root.to_path_buf(),
            locations,
        })
    }

    /// Persist the registry to `locations.json` under the primary root.
    pub fn save(&self) -> Result<(), LocationError> {
        let mut raw = Map::new();
        for (name, path) in &self.locations {
            raw.insert(
                name.clone(),
                Value::String(path.to_string_lossy().into_owned()),
            );
        }
        let bytes = serde_json::to_vec_pretty(&Value::Object(raw))?;
        let file = self.primary_root.join(META_DIR).join(LOCATIONS_FILE);
        fsio::write_atomic(&file, &bytes)?;
        Ok(())
    }

    pub fn primary_root(&self) -> &Path {
        &self.primary_root
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.locations.get(name).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.locations
            .iter()
            .map(|(name, path)| (name.as_str(), path.as_path()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.locations.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Register a new location. The path must already exist as a directory.
    pub fn add(&mut self, name: &str, path: &Path) -> Result<(), LocationError> {
        if name.is_empty() || name.contains('/') {
            return Err(LocationError::InvalidName(name.to_string()));
        }
        if self.locations.contains_key(name) {
            return Err(LocationError::LocationExists(name.to_string()));
        }
        if !path.is_dir() {
            return Err(LocationError::PathInvalid(path.to_path_buf()));
        }
        self.locations.insert(name.to_string(), path.to_path_buf());
        Ok(())
    }

    /// Remove a location. The last remaining location cannot be removed;
    /// index-reference checks happen one level up, where the index lives.
    pub fn remove(&mut self, name: &str) -> Result<(), LocationError> {
        if !self.locations.contains_key(name) {
            return Err(LocationError::UnknownLocation(name.to_string()));
        }
        if self.locations.len() == 1 {
            return Err(LocationError::LastLocation);
        }
        self.locations.remove(name);
        Ok(())
    }

    /// Resolve a symbolic path to an absolute filesystem path.
    pub fn resolve(&self, symbolic: &str) -> Result<PathBuf, LocationError> {
        let (name, rel) = split_symbolic(symbolic)?;
        let root = self
            .locations
            .get(name)
            .ok_or_else(|| LocationError::UnknownLocation(name.to_string()))?;
        Ok(root.join(rel))
    }

    /// Build a symbolic path from a location name and a relative path.
    pub fn symbolize(&self, name: &str, relative: &str) -> Result<String, LocationError> {
        if !self.locations.contains_key(name) {
            return Err(LocationError::UnknownLocation(name.to_string()));
        }
        let relative = relative.trim_matches('/');
        if relative.is_empty() {
            return Err(LocationError::MalformedSymbolic(format!("{}/", name)));
        }
        Ok(format!("{}/{}", name, relative))
    }
}

/// Split a symbolic path into `(location_name, relative_part)`.
///
/// A symbolic path with an empty relative part (`"Main/"` or just `"Main"`)
/// is malformed: the location alone does not address a file.
pub fn split_symbolic(symbolic: &str) -> Result<(&str, &str), LocationError> {
    let (name, rel) = symbolic
        .split_once('/')
        .ok_or_else(|| LocationError::MalformedSymbolic(symbolic.to_string()))?;
    if name.is_empty() || rel.is_empty() {
        return Err(LocationError::MalformedSymbolic(symbolic.to_string()));
    }
    Ok((name, rel))
}

/// The relative part of a symbolic path — what goes on the wire, where a
/// remote is a single logical location with no prefix.
pub fn relative_part(symbolic: &str) -> Result<&str, LocationError> {
    Ok(split_symbolic(symbolic)?.1)
}

/// Re-home a symbolic path onto a different location.
pub fn swap_location(symbolic: &str, target: &str) -> Result<String, LocationError> {
    let (_, rel) = split_symbolic(symbolic)?;
    Ok(format!("{}/{}", target, rel))
}
