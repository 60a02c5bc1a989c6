//! Builds a fresh index by walking every registered location.
//!
//! Layout under each location root is `Artist/Album[/CDn]/file`; anything
//! nested deeper or shallower is skipped. Dot-entries (including the
//! `.blackbird` metadata directory) are pruned from the walk.

use regex::Regex;
use std::collections::BTreeSet;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use super::{path_hash, DatasetIndex, IndexError, LocationStats, Track};
use crate::locations::LocationRegistry;
use crate::schema::DatasetSchema;

pub struct IndexBuilder<'a> {
    registry: &'a LocationRegistry,
    schema: &'a DatasetSchema,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

impl<'a> IndexBuilder<'a> {
    pub fn new(registry: &'a LocationRegistry, schema: &'a DatasetSchema) -> Self {
        IndexBuilder { registry, schema }
    }

    pub fn build(&self) -> Result<DatasetIndex, IndexError> {
        let matcher = self.schema.matcher()?;
        let cd_dir = Regex::new(r"^CD(\d+)$").expect("static regex");
        let mut index = DatasetIndex::new();

        for (location, root) in self.registry.iter() {
            let walker = WalkDir::new(root)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));

            for entry in walker {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(root)
                    .expect("walker yields children of root");
                let segments: Vec<&str> = match rel.to_str() {
                    Some(rel) => rel.split(std::path::MAIN_SEPARATOR).collect(),
                    None => {
                        warn!(path = ?entry.path(), "skipping non UTF-8 path");
                        continue;
                    }
                };

                let (artist, album, cd_number, filename) = match segments.as_slice() {
                    [artist, album, filename] => (*artist, *album, None, *filename),
                    [artist, album, cd, filename] => {
                        match cd_dir.captures(cd).and_then(|c| c[1].parse::<u32>().ok()) {
                            Some(n) => (*artist, *album, Some(n), *filename),
                            None => {
                                debug!(path = ?rel, "skipping file outside Artist/Album[/CD] layout");
                                continue;
                            }
                        }
                    }
                    _ => {
                        debug!(path = ?rel, "skipping file outside Artist/Album[/CD] layout");
                        continue;
                    }
                };

                let mut matched = matcher.matches(filename);
                let (component, base_name) = match matched.len() {
                    0 => continue,
                    1 => matched.remove(0),
                    _ => {
                        warn!(
                            filename,
                            "filename matches several components; schema patterns overlap"
                        );
                        matched.remove(0)
                    }
                };

                let size = entry.metadata()?.len();
                let symbolic_file = format!("{}/{}", location, segments.join("/"));
                let album_path = format!("{}/{}/{}", location, artist, album);
                let track_path = match cd_number {
                    Some(cd) => format!("{}/CD{}/{}", album_path, cd, base_name),
                    None => format!("{}/{}", album_path, base_name),
                };

                let track = index
                    .tracks
                    .entry(track_path.clone())
                    .or_insert_with(|| Track::new(artist, &album_path, cd_number, &base_name));
                track
                    .files
                    .entry(component)
                    .or_default()
                    .push(symbolic_file.clone());
                track.file_sizes.insert(symbolic_file, size);

                index
                    .track_by_album
                    .entry(album_path.clone())
                    .or_default()
                    .insert(track_path);
                index
                    .album_by_artist
                    .entry(artist.to_string())
                    .or_default()
                    .insert(album_path);
            }
        }

        self.aggregate(&mut index);
        Ok(index)
    }

    /// Per-location aggregates, totals, and the hash lookup. The hash table
    /// comes last so it always reflects the final track set.
    fn aggregate(&self, index: &mut DatasetIndex) {
        for (location, _) in self.registry.iter() {
            index
                .stats_by_location
                .insert(location.to_string(), LocationStats::default());
        }

        let mut artists_by_location: std::collections::BTreeMap<String, BTreeSet<&str>> =
            Default::default();
        let mut albums_by_location: std::collections::BTreeMap<String, BTreeSet<&str>> =
            Default::default();

        for track in index.tracks.values() {
            let location = track
                .album_path
                .split('/')
                .next()
                .unwrap_or_default()
                .to_string();
            let stats = index.stats_by_location.entry(location.clone()).or_default();
            stats.tracks += 1;
            stats.files += track.file_sizes.len() as u64;
            stats.size += track.total_size();
            artists_by_location
                .entry(location.clone())
                .or_default()
                .insert(&track.artist);
            albums_by_location
                .entry(location)
                .or_default()
                .insert(&track.album_path);
        }
        for (location, artists) in artists_by_location {
            if let Some(stats) = index.stats_by_location.get_mut(&location) {
                stats.artists = artists.len() as u64;
            }
        }
        for (location, albums) in albums_by_location {
            if let Some(stats) = index.stats_by_location.get_mut(&location) {
                stats.albums = albums.len() as u64;
            }
        }

        index.total_files = index.stats_by_location.values().map(|s| s.files).sum();
        index.total_size = index.stats_by_location.values().map(|s| s.size).sum();

        index.file_info_by_hash.clear();
        for track in index.tracks.values() {
            for (path, size) in &track.file_sizes {
                index
                    .file_info_by_hash
                    .insert(path_hash(path), (path.clone(), *size));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::META_DIR;
    use std::path::Path;

    fn write(root: &Path, rel: &str, bytes: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    fn test_schema() -> DatasetSchema {
        let mut schema = DatasetSchema::new();
        schema
            .add_component("instrumental", "*_instrumental.mp3", false, None)
            .unwrap();
        schema.add_component("mir", "*.mir.json", false, None).unwrap();
        schema
            .add_component("section", "*_section*.mp3", true, None)
            .unwrap();
        schema
    }

    #[test]
    fn test_build_walks_layout_and_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(META_DIR)).unwrap();
        write(dir.path(), "Artist_A/Album/One_instrumental.mp3", b"abcd");
        write(dir.path(), "Artist_A/Album/One.mir.json", b"{}");
        write(dir.path(), "Artist_B/Live/CD1/Two_instrumental.mp3", b"abcd");
        write(dir.path(), "Artist_B/Live/CD2/Three_instrumental.mp3", b"abcd");
        // Multiple component: two sections of the same base track
        write(dir.path(), "Artist_A/Album/One_section1.mp3", b"abcd");
        write(dir.path(), "Artist_A/Album/One_section2.mp3", b"abcd");
        // Outside the layout: skipped
        write(dir.path(), "loose_instrumental.mp3", b"abcd");
        write(dir.path(), "Artist_A/Album/Extra/Deep_instrumental.mp3", b"abcd");
        // Unmatched filename: skipped
        write(dir.path(), "Artist_A/Album/notes.txt", b"abcd");

        let registry = LocationRegistry::load(dir.path()).unwrap();
        let schema = test_schema();
        let index = IndexBuilder::new(&registry, &schema).build().unwrap();

        assert_eq!(index.tracks.len(), 3);
        assert_eq!(index.total_files, 6);
        assert_eq!(index.total_size, 4 * 5 + 2);

        let one = &index.tracks["Main/Artist_A/Album/One"];
        assert_eq!(one.files["section"].len(), 2);
        assert_eq!(one.file_sizes.len(), 4);
        assert_eq!(one.cd_number, None);

        let two = &index.tracks["Main/Artist_B/Live/CD1/Two"];
        assert_eq!(two.cd_number, Some(1));
        assert_eq!(two.album_path, "Main/Artist_B/Live");

        // One album for Artist_B despite two CDs
        assert_eq!(index.album_by_artist["Artist_B"].len(), 1);
        assert_eq!(index.track_by_album["Main/Artist_B/Live"].len(), 2);

        let stats = &index.stats_by_location["Main"];
        assert_eq!(stats.tracks, 3);
        assert_eq!(stats.files, 6);
        assert_eq!(stats.artists, 2);
        assert_eq!(stats.albums, 2);

        // Hash lookup covers every file
        for track in index.tracks.values() {
            for (path, size) in &track.file_sizes {
                assert_eq!(
                    index.file_info_by_hash[&path_hash(path)],
                    (path.clone(), *size)
                );
            }
        }
    }

    #[test]
    fn test_empty_location_yields_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(META_DIR)).unwrap();
        let registry = LocationRegistry::load(dir.path()).unwrap();
        let schema = test_schema();
        let index = IndexBuilder::new(&registry, &schema).build().unwrap();
        assert_eq!(index.total_files, 0);
        assert!(index.tracks.is_empty());
        assert_eq!(index.stats_by_location["Main"], LocationStats::default());
    }
}
