// Test support utilities for both unit and integration tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use crate::dataset::{Dataset, DatasetError};
use crate::locations::relative_part;
use crate::transport::{RemoteEntry, RemoteStore, TransportError};

/// In-memory remote for testing.
///
/// Serves a dataset snapshot from memory instead of a WebDAV server and can
/// inject per-path download faults. Uploads land back in the same map so
/// tests can assert on them.
#[derive(Default)]
pub struct MockRemote {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    schema: Mutex<Vec<u8>>,
    index: Mutex<Vec<u8>>,
    /// Wire path → remaining failures; `u32::MAX` fails forever.
    faults: Mutex<HashMap<String, u32>>,
    downloads: Mutex<Vec<String>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot an existing dataset: schema, index, and every indexed file.
    /// Wire paths drop the location prefix, the way a real remote lays a
    /// dataset out.
    pub fn mirror(dataset: &Dataset) -> Result<Self, DatasetError> {
        let remote = Self::new();
        remote.set_schema_bytes(dataset.schema().to_vec()?);
        remote.set_index_bytes(dataset.index().to_bytes()?);
        for track in dataset.index().tracks.values() {
            for symbolic in track.file_sizes.keys() {
                let absolute = dataset.registry().resolve(symbolic)?;
                let wire = relative_part(symbolic)?;
                remote.insert_file(wire, &std::fs::read(absolute)?);
            }
        }
        Ok(remote)
    }

    pub fn insert_file(&self, wire_path: &str, bytes: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(wire_path.to_string(), bytes.to_vec());
    }

    pub fn set_schema_bytes(&self, bytes: Vec<u8>) {
        *self.schema.lock().unwrap() = bytes;
    }

    pub fn set_index_bytes(&self, bytes: Vec<u8>) {
        *self.index.lock().unwrap() = bytes;
    }

    /// Fail the next `n` downloads of `wire_path` with an HTTP 500.
    pub fn fail_times(&self, wire_path: &str, n: u32) {
        self.faults
            .lock()
            .unwrap()
            .insert(wire_path.to_string(), n);
    }

    /// Fail every download of `wire_path` until faults are cleared.
    pub fn fail_always(&self, wire_path: &str) {
        self.fail_times(wire_path, u32::MAX);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap().clear();
    }

    /// Bytes currently stored under `wire_path`, uploads included.
    pub fn file(&self, wire_path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(wire_path).cloned()
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    /// Download attempts so far, failures included.
    pub fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }

    fn check_fault(&self, wire_path: &str) -> Result<(), TransportError> {
        let mut faults = self.faults.lock().unwrap();
        if let Some(remaining) = faults.get_mut(wire_path) {
            if *remaining == 0 {
                faults.remove(wire_path);
                return Ok(());
            }
            if *remaining != u32::MAX {
                *remaining -= 1;
            }
            return Err(TransportError::Status {
                status: 500,
                path: wire_path.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn fetch_schema(&self) -> Result<Vec<u8>, TransportError> {
        let bytes = self.schema.lock().unwrap().clone();
        if bytes.is_empty() {
            return Err(TransportError::NotFound(".blackbird/schema.json".to_string()));
        }
        Ok(bytes)
    }

    async fn fetch_index(&self) -> Result<Vec<u8>, TransportError> {
        let bytes = self.index.lock().unwrap().clone();
        if bytes.is_empty() {
            return Err(TransportError::NotFound(".blackbird/index.bin".to_string()));
        }
        Ok(bytes)
    }

    async fn list(&self, remote_dir: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let prefix = format!("{}/", remote_dir.trim_matches('/'));
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.starts_with(&prefix))
            .map(|(path, bytes)| RemoteEntry {
                path: path.clone(),
                size: bytes.len() as u64,
                is_dir: false,
            })
            .collect())
    }

    async fn download(&self, remote_rel: &str, local_abs: &Path) -> Result<u64, TransportError> {
        self.downloads.lock().unwrap().push(remote_rel.to_string());
        self.check_fault(remote_rel)?;
        let bytes = self
            .files
            .lock()
            .unwrap()
            .get(remote_rel)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(remote_rel.to_string()))?;
        std::fs::write(local_abs, &bytes)?;
        Ok(bytes.len() as u64)
    }

    async fn upload(&self, local_abs: &Path, remote_rel: &str) -> Result<(), TransportError> {
        let bytes = std::fs::read(local_abs)?;
        self.insert_file(remote_rel, &bytes);
        Ok(())
    }

    async fn check(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
