#![allow(dead_code)]
// Shared fixtures for the integration tests

use blackbird::Dataset;
use std::path::Path;

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_line_number(true)
        .with_target(false) // Tests: hide target names for cleaner output
        .with_file(true) // Tests: show file names for debugging
        .try_init();
}

const AUDIO_BYTES: &[u8] = b"abcd";
const JSON_BYTES: &[u8] = b"{}";

/// The canonical dataset: 3 artists, 12 tracks, 40 files.
///
/// - `Artist_A`: two albums, five tracks (`Five` has no caption)
/// - `Artist_B`: one multi-CD album, CD1 two tracks, CD2 one track, none
///   with captions
/// - `Artist_C`: one album, four tracks; `Gamma` and `Delta` are missing
///   vocals and caption
pub fn build_canonical_files(root: &Path) {
    let tracks: &[(&str, &str, bool, bool)] = &[
        ("Artist_A/Album_One", "One", true, true),
        ("Artist_A/Album_One", "Two", true, true),
        ("Artist_A/Album_One", "Three", true, true),
        ("Artist_A/Album_Two", "Four", true, true),
        ("Artist_A/Album_Two", "Five", true, false),
        ("Artist_B/Album_Live/CD1", "Six", true, false),
        ("Artist_B/Album_Live/CD1", "Seven", true, false),
        ("Artist_B/Album_Live/CD2", "Eight", true, false),
        ("Artist_C/Album_Sea", "Alpha", true, true),
        ("Artist_C/Album_Sea", "Beta", true, true),
        ("Artist_C/Album_Sea", "Gamma", false, false),
        ("Artist_C/Album_Sea", "Delta", false, false),
    ];

    for (dir, base, vocals, caption) in tracks {
        let dir = root.join(dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{}_instrumental.mp3", base)), AUDIO_BYTES).unwrap();
        std::fs::write(dir.join(format!("{}.mir.json", base)), JSON_BYTES).unwrap();
        if *vocals {
            std::fs::write(
                dir.join(format!("{}_vocals_noreverb.mp3", base)),
                AUDIO_BYTES,
            )
            .unwrap();
        }
        if *caption {
            std::fs::write(dir.join(format!("{}_caption.txt", base)), AUDIO_BYTES).unwrap();
        }
    }
}

/// The four canonical components.
pub fn add_canonical_components(dataset: &mut Dataset) {
    dataset
        .add_component("instrumental", "*_instrumental.mp3", false, None)
        .unwrap();
    dataset
        .add_component("vocals", "*_vocals_noreverb.mp3", false, None)
        .unwrap();
    dataset.add_component("mir", "*.mir.json", false, None).unwrap();
    dataset
        .add_component("caption", "*_caption.txt", false, None)
        .unwrap();
}

/// Files, schema, and a fresh index under `root`.
pub fn open_canonical(root: &Path) -> Dataset {
    build_canonical_files(root);
    let mut dataset = Dataset::open(root).unwrap();
    add_canonical_components(&mut dataset);
    dataset.reindex().unwrap();
    dataset
}

/// Paths of operation state files under the dataset's `.blackbird`.
pub fn state_files(root: &Path) -> Vec<std::path::PathBuf> {
    let meta = root.join(".blackbird");
    let mut out = Vec::new();
    if let Ok(entries) = std::fs::read_dir(meta) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("operation_") && name.ends_with(".json") {
                out.push(entry.path());
            }
        }
    }
    out
}
