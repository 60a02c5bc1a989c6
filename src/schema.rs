//! Dataset schema: the declarative set of component file kinds.
//!
//! A component is a glob over the file *name* only (`*_vocals_noreverb.mp3`,
//! `*.mir.json`). Matching is case-sensitive and extensions are exact, so
//! `*.mp3` does not match `X.MP3`. A `multiple` component may repeat per base
//! track and requires a trailing digit run before the extension
//! (`Song_section3.mp3`).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::fsio;

pub const SCHEMA_VERSION: &str = "1.0";

/// Extensions discovery will consider, grouped by how component names are
/// derived from them.
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "ogg", "opus"];
const TEXT_EXTENSIONS: &[&str] = &["txt", "json"];

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("component already exists: {0}")]
    NameExists(String),
    #[error("pattern {new:?} is ambiguous with component {existing:?}: both match {witness:?}")]
    PatternAmbiguous {
        new: String,
        existing: String,
        witness: String,
    },
    #[error("component {name:?} maps to {local:?} locally but {remote:?} remotely")]
    SchemaConflict {
        name: String,
        local: String,
        remote: String,
    },
    #[error("unknown component: {0}")]
    UnknownComponent(String),
    #[error("invalid component pattern: {0:?}")]
    BadPattern(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema file error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One component kind within a track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentDef {
    pub pattern: String,
    pub multiple: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The declarative schema: component name → definition.
///
/// Sibling top-level objects in `schema.json` (`structure`, `sync`) are
/// informational; they are preserved across load/save but never interpreted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetSchema {
    pub version: String,
    pub components: BTreeMap<String, ComponentDef>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for DatasetSchema {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasetSchema {
    pub fn new() -> Self {
        DatasetSchema {
            version: SCHEMA_VERSION.to_string(),
            components: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let bytes = std::fs::read(path)?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SchemaError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SchemaError> {
        fsio::write_atomic(path, &self.to_vec()?)?;
        Ok(())
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, SchemaError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Add a component, refusing names already taken and patterns that could
    /// match a filename some existing pattern also matches.
    pub fn add_component(
        &mut self,
        name: &str,
        pattern: &str,
        multiple: bool,
        description: Option<String>,
    ) -> Result<(), SchemaError> {
        if self.components.contains_key(name) {
            return Err(SchemaError::NameExists(name.to_string()));
        }
        let candidate = ComponentDef {
            pattern: pattern.to_string(),
            multiple,
            description,
        };
        let matcher = ComponentMatcher::compile(&candidate)?;
        for (existing_name, existing_def) in &self.components {
            let existing = ComponentMatcher::compile(existing_def)?;
            if let Some(witness) = matcher.overlap_witness(&existing) {
                return Err(SchemaError::PatternAmbiguous {
                    new: pattern.to_string(),
                    existing: existing_name.clone(),
                    witness,
                });
            }
        }
        self.components.insert(name.to_string(), candidate);
        Ok(())
    }

    /// Match a filename against every component. Under pattern uniqueness at
    /// most one pair comes back; the `Vec` keeps the check honest.
    pub fn matches(&self, filename: &str) -> Result<Vec<(String, String)>, SchemaError> {
        Ok(self.matcher()?.matches(filename))
    }

    /// Compile all component patterns once, for hot paths like indexing.
    pub fn matcher(&self) -> Result<SchemaMatcher, SchemaError> {
        let mut compiled = Vec::with_capacity(self.components.len());
        for (name, def) in &self.components {
            compiled.push((name.clone(), ComponentMatcher::compile(def)?));
        }
        Ok(SchemaMatcher { compiled })
    }

    /// Copy remote component definitions the caller asked for into this
    /// schema. Existing local definitions are never overwritten; a name that
    /// maps to a different pattern on the two sides is a conflict.
    ///
    /// Returns the effective component list for the operation: the requested
    /// names, or every remote component when `requested` is `None`.
    pub fn merge_remote(
        &mut self,
        remote: &DatasetSchema,
        requested: Option<&[String]>,
    ) -> Result<Vec<String>, SchemaError> {
        let names: Vec<String> = match requested {
            Some(names) => names.to_vec(),
            None => remote.components.keys().cloned().collect(),
        };

        for name in &names {
            let remote_def = match remote.components.get(name) {
                Some(def) => def,
                None => {
                    // Locally-defined components may still be requested
                    if self.components.contains_key(name) {
                        continue;
                    }
                    return Err(SchemaError::UnknownComponent(name.clone()));
                }
            };
            match self.components.get(name) {
                Some(local_def) if local_def.pattern != remote_def.pattern => {
                    return Err(SchemaError::SchemaConflict {
                        name: name.clone(),
                        local: local_def.pattern.clone(),
                        remote: remote_def.pattern.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    self.components.insert(name.clone(), remote_def.clone());
                }
            }
        }
        Ok(names)
    }

    /// Derive a schema from the files already on disk under `root`.
    ///
    /// Walks `sample_artists` artist directories (all of them when `None`),
    /// strips extensions, scans each stem backward for the longest spaceless
    /// `_suffix` tail, and groups files by the resulting pattern. A suffix
    /// ending in digits becomes a `multiple` component with the digit run
    /// wildcarded.
    pub fn discover(root: &Path, sample_artists: Option<usize>) -> Result<Self, SchemaError> {
        let mut artist_dirs: Vec<_> = std::fs::read_dir(root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| !n.starts_with('.'))
                    .unwrap_or(false)
            })
            .collect();
        artist_dirs.sort();
        if let Some(limit) = sample_artists {
            artist_dirs.truncate(limit);
        }

        let mut groups: BTreeMap<(String, bool), u64> = BTreeMap::new();
        for dir in &artist_dirs {
            for entry in WalkDir::new(dir).sort_by_file_name() {
                let entry = entry.map_err(std::io::Error::from)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let filename = match entry.file_name().to_str() {
                    Some(name) => name,
                    None => continue,
                };
                if let Some((pattern, multiple)) = derive_pattern(filename) {
                    *groups.entry((pattern, multiple)).or_default() += 1;
                }
            }
        }

        let mut schema = DatasetSchema::new();
        for ((pattern, multiple), count) in groups {
            let mut name = canonical_component_name(&pattern, multiple);
            if schema.components.contains_key(&name) {
                // Same stem under two extensions; fall back to a fully
                // qualified name so both survive
                name = pattern
                    .trim_start_matches(['*', '_', '.'])
                    .replace(['*', '.'], "_")
                    .trim_end_matches('_')
                    .to_string();
            }
            debug!(%pattern, multiple, count, %name, "discovered component");
            schema.add_component(&name, &pattern, multiple, None)?;
        }
        Ok(schema)
    }
}

/// A compiled schema, ready for repeated filename matching.
pub struct SchemaMatcher {
    compiled: Vec<(String, ComponentMatcher)>,
}

impl SchemaMatcher {
    /// All `(component_name, base_name)` pairs matching `filename`.
    pub fn matches(&self, filename: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (name, matcher) in &self.compiled {
            if let Some(base) = matcher.base_name(filename) {
                out.push((name.clone(), base));
            }
        }
        out
    }
}

/// A single compiled component pattern.
///
/// The glob is translated to an anchored regex where the first `*` captures
/// the base name and any later `*` matches the digit run of a `multiple`
/// component.
struct ComponentMatcher {
    pattern: String,
    regex: Regex,
}

impl ComponentMatcher {
    fn compile(def: &ComponentDef) -> Result<Self, SchemaError> {
        let pattern = def.pattern.as_str();
        if pattern.is_empty() || !pattern.contains('*') {
            return Err(SchemaError::BadPattern(pattern.to_string()));
        }
        let mut source = String::from("^");
        let mut seen_star = false;
        for ch in pattern.chars() {
            if ch == '*' {
                if !seen_star {
                    source.push_str("(.+)");
                    seen_star = true;
                } else if def.multiple {
                    source.push_str("([0-9]+)");
                } else {
                    source.push_str("(.*)");
                }
            } else {
                source.push_str(&regex::escape(&ch.to_string()));
            }
        }
        source.push('$');
        let regex =
            Regex::new(&source).map_err(|_| SchemaError::BadPattern(pattern.to_string()))?;
        Ok(ComponentMatcher {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// The base name if `filename` belongs to this component.
    fn base_name(&self, filename: &str) -> Option<String> {
        self.regex
            .captures(filename)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Concrete filenames this pattern matches, used to probe other patterns
    /// for overlap. Wildcards are instantiated with probe stems covering
    /// plain, underscored, and digit-bearing names.
    fn witnesses(&self) -> Vec<String> {
        const STEMS: &[&str] = &["witness", "witness_take", "witness 9"];
        STEMS
            .iter()
            .map(|stem| {
                let mut out = String::new();
                let mut first = true;
                for ch in self.pattern.chars() {
                    if ch == '*' {
                        if first {
                            out.push_str(stem);
                            first = false;
                        } else {
                            out.push('7');
                        }
                    } else {
                        out.push(ch);
                    }
                }
                out
            })
            .collect()
    }

    /// A filename both patterns match, if one exists among the witnesses.
    fn overlap_witness(&self, other: &ComponentMatcher) -> Option<String> {
        for witness in self.witnesses() {
            if other.regex.is_match(&witness) {
                return Some(witness);
            }
        }
        for witness in other.witnesses() {
            if self.regex.is_match(&witness) {
                return Some(witness);
            }
        }
        None
    }
}

/// Split a filename into `(stem, extension)`, preserving compound tails like
/// `mir.json`.
fn split_extension(filename: &str) -> Option<(&str, String)> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    if ext == "json" {
        if let Some((inner_stem, inner)) = stem.rsplit_once('.') {
            if !inner_stem.is_empty()
                && !inner.is_empty()
                && inner.len() <= 8
                && inner.chars().all(|c| c.is_ascii_alphanumeric())
            {
                return Some((inner_stem, format!("{}.json", inner)));
            }
        }
    }
    Some((stem, ext.to_string()))
}

/// Derive a `(pattern, multiple)` pair from a concrete filename, or `None`
/// when the file carries no recognizable component shape.
fn derive_pattern(filename: &str) -> Option<(String, bool)> {
    let (stem, ext) = split_extension(filename)?;
    let simple_ext = ext.rsplit('.').next().unwrap_or(&ext);
    if !AUDIO_EXTENSIONS.contains(&simple_ext) && !TEXT_EXTENSIONS.contains(&simple_ext) {
        return None;
    }

    // Longest spaceless `_suffix` tail: the earliest underscore whose tail is
    // clean wins
    let mut tail_start = None;
    for (i, ch) in stem.char_indices() {
        if ch == '_' && i > 0 {
            let tail = &stem[i + 1..];
            if !tail.is_empty() && !tail.contains(' ') {
                tail_start = Some(i);
                break;
            }
        }
    }

    match tail_start {
        Some(i) => {
            let suffix = &stem[i + 1..];
            let word = suffix.trim_end_matches(|c: char| c.is_ascii_digit());
            if word.len() < suffix.len() {
                Some((format!("*_{}*.{}", word, ext), true))
            } else {
                Some((format!("*_{}.{}", suffix, ext), false))
            }
        }
        // Only compound extensions are distinctive enough to form a
        // component on their own (`*.mir.json`); a bare `*.mp3` would
        // swallow every suffixed sibling
        None if ext.contains('.') => Some((format!("*.{}", ext), false)),
        None => None,
    }
}

/// Canonical component name for a discovered pattern: the suffix with the
/// leading `*_` stripped, audio extensions normalized to an `_audio` suffix,
/// and `multiple` stems kept literally.
fn canonical_component_name(pattern: &str, multiple: bool) -> String {
    let tail = pattern.trim_start_matches('*');
    let tail = tail.trim_start_matches(['_', '.']);
    let tail = tail.replace('*', "");
    let (stem, ext) = tail
        .split_once('.')
        .map(|(s, e)| (s.to_string(), e.to_string()))
        .unwrap_or((tail.clone(), String::new()));
    let simple_ext = ext.rsplit('.').next().unwrap_or(&ext).to_string();

    if multiple {
        stem
    } else if AUDIO_EXTENSIONS.contains(&simple_ext.as_str()) {
        format!("{}_audio", stem)
    } else {
        stem
    }
}
